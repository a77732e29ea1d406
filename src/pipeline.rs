//! Wires DevLink3 frames into StateCore and StateCore's domain events out
//! to the Broker and PersistBuffer (spec §2 dataflow:
//! `DevLink3Connection -> Delta3Parser -> StateCore -> {Broker,
//! PersistBuffer}`).

use crossbeam_channel::Receiver;

use crate::broker::{AgentStateMessage, Broker, BrokerMessage, CallEventMessage, GroupStatsMessage};
use crate::delta3;
use crate::domain::{Call, CallEvent, CallEventType, CallState};
use crate::framer::Frame;
use crate::persist::PersistBuffer;
use crate::protocol::{self, PACKET_EVENT};
use crate::state_core::{StateCore, StateCoreEvent};

/// Runs until `frame_rx` disconnects (the owning DevLink3Connection has
/// shut down for good, e.g. at process exit). `buffer` is used here only
/// for agent-state-history writes; call upserts and CallEvent writes are
/// owned by CorrelationEngine, which subscribes to the same `calls`
/// channel this loop publishes to (spec §4.10).
pub fn run_event_loop(frame_rx: Receiver<Frame>, broker: &Broker, buffer: &PersistBuffer, now: impl Fn() -> i64) {
    let mut core = StateCore::new();
    let mut last_sweep = std::time::Instant::now();

    loop {
        let frame = match frame_rx.recv_timeout(std::time::Duration::from_millis(500)) {
            Ok(frame) => frame,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if last_sweep.elapsed() >= std::time::Duration::from_secs(5) {
                    core.sweep_removals(now());
                    last_sweep = std::time::Instant::now();
                }
                continue;
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        };

        if frame.packet_type != PACKET_EVENT {
            continue;
        }
        let payload = match protocol::parse_event_payload(&frame.body) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "malformed event payload");
                continue;
            }
        };
        let Some(xml) = protocol::call_delta3_xml(&payload) else {
            continue;
        };
        let Some(record) = delta3::parse(&xml) else {
            continue;
        };

        let events = core.apply(&record, now());
        for event in events {
            dispatch(event, broker, buffer);
        }
    }
}

fn dispatch(event: StateCoreEvent, broker: &Broker, buffer: &PersistBuffer) {
    match event {
        StateCoreEvent::CallCreated(call) => publish_call_event(&call, CallEventType::Initiated, broker, buffer),
        StateCoreEvent::CallUpdated(call) => {
            let event_type = call_event_type_for_state(&call);
            publish_call_event(&call, event_type, broker, buffer);
        }
        StateCoreEvent::CallEnded(call) => {
            let event_type = if call.abandoned {
                CallEventType::Abandoned
            } else {
                CallEventType::Completed
            };
            publish_call_event(&call, event_type, broker, buffer);
        }
        StateCoreEvent::AgentStateChanged { agent, previous_state } => {
            let segment = crate::domain::AgentStateHistory {
                agent_id: agent.id,
                state: agent.current_state,
                previous_state,
                start_time: agent.state_start_time,
                end_time: None,
                call_id: agent.active_call_id.clone(),
                reason: None,
            };
            if let Err(e) = buffer.record_agent_state(segment, &agent) {
                tracing::warn!(error = %e, agent_id = agent.id, "failed to persist agent state transition");
            }
            broker.publish(BrokerMessage::Agents(AgentStateMessage {
                agent_id: agent.id,
                extension: agent.extension.clone(),
                state: agent.current_state,
                previous_state,
                active_call_id: agent.active_call_id.clone(),
                timestamp: agent.state_start_time,
            }));
        }
        StateCoreEvent::GroupStatsUpdated(group) => {
            broker.publish(BrokerMessage::Groups(GroupStatsMessage { group }));
        }
    }
}

/// Translates a call's current snapshot state into the nearest
/// CallEventType. Delta3 Detail records carry a generic numeric call
/// state, not a discrete lifecycle-event id, so this is the pipeline's
/// best mapping back onto the CallEvent log (SPEC_FULL.md §11).
fn call_event_type_for_state(call: &Call) -> CallEventType {
    match call.state {
        Some(CallState::Queued) => CallEventType::Queued,
        Some(CallState::Ringing) => CallEventType::Ringing,
        Some(CallState::Connected) => CallEventType::Answered,
        Some(CallState::Hold) => CallEventType::Held,
        Some(CallState::Parked) => CallEventType::Parked,
        Some(CallState::Completed) | Some(CallState::Idle) | None => {
            if call.abandoned {
                CallEventType::Abandoned
            } else {
                CallEventType::Completed
            }
        }
    }
}

fn publish_call_event(call: &Call, event_type: CallEventType, broker: &Broker, _buffer: &PersistBuffer) {
    let event = CallEvent {
        call_id: call.external_call_id.clone(),
        event_type,
        timestamp: call.end_time.or(call.answer_time).or(call.start_time).unwrap_or(0),
        duration: call.duration,
        party: None,
        agent_id: call.agent_id,
        agent_extension: call.agent_extension.clone(),
        queue_name: call.queue_name.clone(),
        details: Default::default(),
    };

    broker.publish(BrokerMessage::Calls(CallEventMessage {
        call: call.clone(),
        event,
    }));
}
