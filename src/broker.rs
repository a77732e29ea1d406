//! Broker (spec §4.6): fan-out to named pub/sub channels. Publishes never
//! block the state core; a full channel drops the message and counts it
//! rather than stalling the producer (spec §9 REDESIGN FLAGS).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::domain::{Call, CallEvent, HuntGroup, SmdrRecord};

const CHANNEL_CAPACITY: usize = 1024;
const PUBLISH_BLOCK: Duration = Duration::from_millis(20);

pub const CHANNEL_CALLS: &str = "calls";
pub const CHANNEL_AGENTS: &str = "agents";
pub const CHANNEL_GROUPS: &str = "groups";
pub const CHANNEL_SMDR: &str = "smdr";
pub const CHANNEL_TRANSCRIPTIONS: &str = "transcriptions";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEventMessage {
    pub call: Call,
    pub event: CallEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateMessage {
    pub agent_id: u64,
    pub extension: String,
    pub state: crate::domain::AgentState,
    pub previous_state: Option<crate::domain::AgentState>,
    pub active_call_id: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupStatsMessage {
    pub group: HuntGroup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum BrokerMessage {
    Calls(CallEventMessage),
    Agents(AgentStateMessage),
    Groups(GroupStatsMessage),
    Smdr(SmdrRecord),
    Transcriptions(serde_json::Value),
}

impl BrokerMessage {
    fn channel_name(&self) -> &'static str {
        match self {
            BrokerMessage::Calls(_) => CHANNEL_CALLS,
            BrokerMessage::Agents(_) => CHANNEL_AGENTS,
            BrokerMessage::Groups(_) => CHANNEL_GROUPS,
            BrokerMessage::Smdr(_) => CHANNEL_SMDR,
            BrokerMessage::Transcriptions(_) => CHANNEL_TRANSCRIPTIONS,
        }
    }
}

#[derive(Debug, Default)]
pub struct BrokerStats {
    pub published: AtomicU64,
    pub dropped: AtomicU64,
}

/// Thread-safe fan-out bus. Subscribers are external (HTTP/SSE bridges,
/// downstream consumers); delivery is at-most-once, never durable — the
/// persistence layer is the authoritative history (spec §4.6).
pub struct Broker {
    subscribers: Mutex<HashMap<&'static str, Vec<Sender<BrokerMessage>>>>,
    stats: Arc<BrokerStats>,
}

impl Broker {
    pub fn new() -> Self {
        let mut subscribers = HashMap::new();
        for channel in [
            CHANNEL_CALLS,
            CHANNEL_AGENTS,
            CHANNEL_GROUPS,
            CHANNEL_SMDR,
            CHANNEL_TRANSCRIPTIONS,
        ] {
            subscribers.insert(channel, Vec::new());
        }
        Self {
            subscribers: Mutex::new(subscribers),
            stats: Arc::new(BrokerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<BrokerStats> {
        Arc::clone(&self.stats)
    }

    /// Subscribe to a named channel. Unknown channel names get their own
    /// lazily-created slot so forward-compatible consumers aren't blocked.
    pub fn subscribe(&self, channel: &str) -> Receiver<BrokerMessage> {
        let (tx, rx) = crossbeam_channel::bounded(CHANNEL_CAPACITY);
        let mut subs = self.subscribers.lock().unwrap();
        subs.entry(leak_channel_name(channel)).or_default().push(tx);
        rx
    }

    /// Publish never blocks the caller for more than `PUBLISH_BLOCK`; a
    /// chronically full subscriber is dropped from, not stalled by, this
    /// send (spec §4.6, §9).
    pub fn publish(&self, message: BrokerMessage) {
        let channel = message.channel_name();
        let mut subs = self.subscribers.lock().unwrap();
        let Some(senders) = subs.get_mut(channel) else {
            return;
        };

        senders.retain(|tx| match tx.send_timeout(message.clone(), PUBLISH_BLOCK) {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(crossbeam_channel::SendTimeoutError::Timeout(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(channel, "broker channel full, dropping message");
                true
            }
            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

/// The channel table is keyed by `&'static str`; the five well-known names
/// are interned here, and anything else falls back to a leaked copy so an
/// unexpected channel name doesn't panic. In practice only the five names
/// in this module are ever used.
fn leak_channel_name(channel: &str) -> &'static str {
    match channel {
        CHANNEL_CALLS => CHANNEL_CALLS,
        CHANNEL_AGENTS => CHANNEL_AGENTS,
        CHANNEL_GROUPS => CHANNEL_GROUPS,
        CHANNEL_SMDR => CHANNEL_SMDR,
        CHANNEL_TRANSCRIPTIONS => CHANNEL_TRANSCRIPTIONS,
        other => Box::leak(other.to_string().into_boxed_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_smdr() -> SmdrRecord {
        SmdrRecord {
            fields: vec![],
            call_start: 0,
            connected_seconds: 0,
            ring_seconds: 0,
            hold_seconds: 0,
            park_seconds: 0,
            direction: None,
            both_internal: false,
            party1_device: String::new(),
            party2_device: String::new(),
            account_code: None,
            call_id: None,
            call_charge: None,
            currency: None,
            external_targeting_cause: None,
            continuation: false,
            matched_call_id: None,
            reconciled: false,
            reconciled_at: None,
        }
    }

    #[test]
    fn publish_reaches_subscriber_on_correct_channel() {
        let broker = Broker::new();
        let rx = broker.subscribe(CHANNEL_SMDR);
        let other_rx = broker.subscribe(CHANNEL_CALLS);

        broker.publish(BrokerMessage::Smdr(sample_smdr()));

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_ok());
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn dead_subscriber_is_pruned_after_publish() {
        let broker = Broker::new();
        {
            let _rx = broker.subscribe(CHANNEL_SMDR);
            assert_eq!(broker.subscriber_count(CHANNEL_SMDR), 1);
        }
        broker.publish(BrokerMessage::Smdr(sample_smdr()));
        assert_eq!(broker.subscriber_count(CHANNEL_SMDR), 0);
    }

    #[test]
    fn multiple_subscribers_each_get_a_copy() {
        let broker = Broker::new();
        let rx1 = broker.subscribe(CHANNEL_CALLS);
        let rx2 = broker.subscribe(CHANNEL_CALLS);

        broker.publish(BrokerMessage::Calls(CallEventMessage {
            call: Call::new("c1"),
            event: CallEvent {
                call_id: "c1".into(),
                event_type: crate::domain::CallEventType::Initiated,
                timestamp: 1,
                duration: None,
                party: None,
                agent_id: None,
                agent_extension: None,
                queue_name: None,
                details: Default::default(),
            },
        }));

        assert!(rx1.recv_timeout(Duration::from_millis(100)).is_ok());
        assert!(rx2.recv_timeout(Duration::from_millis(100)).is_ok());
    }
}
