//! StateCore (spec §4.5): owns the in-memory `call_id -> Call`,
//! `agent_id -> Agent`, and `group_id -> HuntGroup` maps and turns Delta3
//! records into domain events.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::delta3::{self, AttemptReject, CallLost, Detail, EquipmentKind, LinkLost, Party, Record};
use crate::domain::{
    Agent, AgentState, Call, CallEvent, CallEventType, Direction, HuntGroup,
    TERMINAL_CALL_GRACE_SECONDS,
};

#[derive(Debug, Clone)]
pub enum StateCoreEvent {
    CallCreated(Call),
    CallUpdated(Call),
    CallEnded(Call),
    AgentStateChanged {
        agent: Agent,
        previous_state: Option<AgentState>,
    },
    GroupStatsUpdated(HuntGroup),
}

struct PendingRemoval {
    call_id: String,
    remove_at: i64,
}

pub struct StateCore {
    calls: HashMap<String, Call>,
    agents: HashMap<u64, Agent>,
    extension_to_agent_id: HashMap<String, u64>,
    groups: HashMap<String, HuntGroup>,
    pending_removals: Vec<PendingRemoval>,
    next_group_id: u64,
}

impl StateCore {
    pub fn new() -> Self {
        Self {
            calls: HashMap::new(),
            agents: HashMap::new(),
            extension_to_agent_id: HashMap::new(),
            groups: HashMap::new(),
            pending_removals: Vec::new(),
            next_group_id: 1,
        }
    }

    pub fn call(&self, call_id: &str) -> Option<&Call> {
        self.calls.get(call_id)
    }

    pub fn agent(&self, agent_id: u64) -> Option<&Agent> {
        self.agents.get(&agent_id)
    }

    /// Apply one Delta3 record, returning the domain events it produces in
    /// tie-break order: call update, then agent state, then group stats
    /// (spec §4.5).
    pub fn apply(&mut self, record: &Record, now: i64) -> Vec<StateCoreEvent> {
        match record {
            Record::Detail(detail) => self.apply_detail(detail, now),
            Record::CallLost(lost) => self.apply_call_lost(lost, now),
            Record::LinkLost(lost) => {
                self.apply_link_lost(lost);
                Vec::new()
            }
            Record::AttemptReject(reject) => {
                self.apply_attempt_reject(reject);
                Vec::new()
            }
        }
    }

    fn apply_detail(&mut self, detail: &Detail, now: i64) -> Vec<StateCoreEvent> {
        let mut events = Vec::new();
        let is_new = !self.calls.contains_key(&detail.call_id);

        let direction = resolve_direction(&detail.party_a, &detail.party_b);
        let internal_party = internal_party(&detail.party_a, &detail.party_b);
        let trunk_party = trunk_party(&detail.party_a, &detail.party_b);
        let state = delta3::map_call_state(detail.state_code);

        let mut incoming = Call::new(detail.call_id.clone());
        incoming.direction = Some(direction);
        incoming.state = Some(state);
        if detail.stamp != 0 {
            incoming.start_time = Some(detail.stamp);
        }
        if detail.conn_stamp != 0 {
            incoming.answer_time = Some(detail.conn_stamp);
            incoming.answered = true;
        }
        if !detail.account_code.is_empty() {
            incoming.account_code = Some(detail.account_code.clone());
        }
        if let Some(party) = &internal_party {
            if !party.number.is_empty() {
                incoming.agent_extension = Some(party.number.clone());
            }
            if !party.name.is_empty() {
                incoming.agent_name = Some(party.name.clone());
            }
        }
        if let Some(party) = &trunk_party {
            if !party.id.is_empty() {
                incoming.trunk_id = Some(party.id.clone());
            }
            if !party.name.is_empty() {
                incoming.trunk_name = Some(party.name.clone());
            }
        }
        if let Some(target) = detail
            .targets
            .iter()
            .find(|t| delta3::classify_equipment(t.eq_type) == EquipmentKind::HuntGroup)
        {
            let queue_name = if !target.name.is_empty() {
                target.name.clone()
            } else {
                target.number.clone()
            };
            if !queue_name.is_empty() {
                incoming.queue_name = Some(queue_name);
                if state == crate::domain::CallState::Queued && detail.stamp != 0 {
                    incoming.queue_entry_time = Some(detail.stamp);
                }
            }
        }

        let call = self
            .calls
            .entry(detail.call_id.clone())
            .or_insert_with(|| Call::new(detail.call_id.clone()));
        call.merge_from(&incoming);

        let terminal = state.is_terminal();
        if terminal {
            let end = if detail.end_stamp != 0 {
                detail.end_stamp
            } else {
                detail.stamp
            };
            call.end_time = Some(end);
        }

        let snapshot = call.clone();
        events.push(if is_new {
            StateCoreEvent::CallCreated(snapshot.clone())
        } else {
            StateCoreEvent::CallUpdated(snapshot.clone())
        });

        if terminal {
            events.push(StateCoreEvent::CallEnded(snapshot.clone()));
            self.pending_removals.push(PendingRemoval {
                call_id: detail.call_id.clone(),
                remove_at: now + TERMINAL_CALL_GRACE_SECONDS,
            });
        }

        if let Some(extension) = snapshot.agent_extension.clone() {
            if let Some(event) = self.update_agent_state(
                &extension,
                snapshot.agent_name.clone(),
                if terminal { AgentState::Idle } else { agent_state_for_call(state) },
                if terminal { None } else { Some(snapshot.external_call_id.clone()) },
                now,
            ) {
                events.push(event);
            }
        }

        if let Some(queue) = snapshot.queue_name.clone() {
            events.push(StateCoreEvent::GroupStatsUpdated(
                self.recompute_group_stats(&queue, now),
            ));
        }

        events
    }

    fn apply_call_lost(&mut self, lost: &CallLost, now: i64) -> Vec<StateCoreEvent> {
        let mut events = Vec::new();
        let Some(call) = self.calls.get_mut(&lost.call_id) else {
            tracing::debug!(call_id = %lost.call_id, "CallLost for unknown call");
            return events;
        };

        call.state = Some(crate::domain::CallState::Completed);
        call.end_time = Some(if lost.stamp != 0 { lost.stamp } else { now });
        let snapshot = call.clone();

        events.push(StateCoreEvent::CallEnded(snapshot.clone()));
        self.pending_removals.push(PendingRemoval {
            call_id: lost.call_id.clone(),
            remove_at: now + TERMINAL_CALL_GRACE_SECONDS,
        });

        if let Some(extension) = snapshot.agent_extension.clone() {
            if let Some(event) =
                self.update_agent_state(&extension, None, AgentState::Idle, None, now)
            {
                events.push(event);
            }
        }

        events
    }

    fn apply_link_lost(&mut self, lost: &LinkLost) {
        tracing::info!(reason = %lost.reason, stamp = lost.stamp, "DevLink3 LinkLost");
    }

    fn apply_attempt_reject(&mut self, reject: &AttemptReject) {
        tracing::info!(
            call_id = %reject.call_id,
            target = %reject.target,
            cause = reject.cause,
            "DevLink3 AttemptReject"
        );
    }

    /// Evict calls whose grace period has elapsed. Call periodically.
    pub fn sweep_removals(&mut self, now: i64) {
        let (due, pending): (Vec<_>, Vec<_>) =
            self.pending_removals.drain(..).partition(|p| p.remove_at <= now);
        self.pending_removals = pending;
        for p in due {
            self.calls.remove(&p.call_id);
        }
    }

    fn update_agent_state(
        &mut self,
        extension: &str,
        display_name: Option<String>,
        new_state: AgentState,
        active_call_id: Option<String>,
        now: i64,
    ) -> Option<StateCoreEvent> {
        let agent_id = *self
            .extension_to_agent_id
            .entry(extension.to_string())
            .or_insert_with(|| synthetic_agent_id(extension));

        let agent = self.agents.entry(agent_id).or_insert_with(|| {
            Agent::placeholder(agent_id, extension, now)
        });
        if let Some(name) = display_name {
            if !name.is_empty() {
                agent.display_name = name;
            }
        }

        let unchanged =
            agent.current_state == new_state && agent.active_call_id == active_call_id;
        if unchanged {
            return None;
        }

        let previous_state = Some(agent.current_state);
        agent.current_state = new_state;
        agent.state_start_time = now;
        agent.active_call_id = active_call_id;

        Some(StateCoreEvent::AgentStateChanged {
            agent: agent.clone(),
            previous_state,
        })
    }

    fn recompute_group_stats(&mut self, queue_name: &str, now: i64) -> HuntGroup {
        let next_id = self.next_group_id;
        let group = self.groups.entry(queue_name.to_string()).or_insert_with(|| {
            let id = next_id;
            HuntGroup {
                id,
                name: queue_name.to_string(),
                number: String::new(),
                calls_waiting: 0,
                longest_wait_seconds: 0,
                agents_available: 0,
                agents_busy: 0,
            }
        });
        if group.id == next_id {
            self.next_group_id += 1;
        }
        let group_id = group.id;

        let mut calls_waiting = 0u32;
        let mut longest_wait = 0i64;
        for call in self.calls.values() {
            if call.queue_name.as_deref() != Some(queue_name) {
                continue;
            }
            if call.state != Some(crate::domain::CallState::Queued) {
                continue;
            }
            calls_waiting += 1;
            if let Some(entry) = call.queue_entry_time {
                longest_wait = longest_wait.max((now - entry).max(0));
            }
        }

        let mut agents_available = 0u32;
        let mut agents_busy = 0u32;
        for agent in self.agents.values() {
            if !agent.group_ids.contains(&group_id) {
                continue;
            }
            match agent.current_state {
                AgentState::Idle => agents_available += 1,
                AgentState::Talking | AgentState::Ringing | AgentState::Hold | AgentState::Acw => {
                    agents_busy += 1
                }
                _ => {}
            }
        }

        let group = self.groups.get_mut(queue_name).unwrap();
        group.calls_waiting = calls_waiting;
        group.longest_wait_seconds = longest_wait as u32;
        group.agents_available = agents_available;
        group.agents_busy = agents_busy;
        group.clone()
    }
}

impl Default for StateCore {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_direction(party_a: &Party, party_b: &Party) -> Direction {
    let a_kind = delta3::classify_equipment(party_a.eq_type);
    let b_kind = delta3::classify_equipment(party_b.eq_type);

    match (a_kind, b_kind) {
        (EquipmentKind::Phone, EquipmentKind::Phone) => Direction::Internal,
        (EquipmentKind::Trunk, _) | (_, EquipmentKind::Trunk) => {
            match party_a.direction_hint.as_str() {
                "O" | "o" => Direction::Outbound,
                _ => Direction::Inbound,
            }
        }
        _ => Direction::Internal,
    }
}

fn internal_party<'a>(party_a: &'a Party, party_b: &'a Party) -> Option<&'a Party> {
    if delta3::classify_equipment(party_a.eq_type) == EquipmentKind::Phone {
        Some(party_a)
    } else if delta3::classify_equipment(party_b.eq_type) == EquipmentKind::Phone {
        Some(party_b)
    } else {
        None
    }
}

fn trunk_party<'a>(party_a: &'a Party, party_b: &'a Party) -> Option<&'a Party> {
    if delta3::classify_equipment(party_a.eq_type) == EquipmentKind::Trunk {
        Some(party_a)
    } else if delta3::classify_equipment(party_b.eq_type) == EquipmentKind::Trunk {
        Some(party_b)
    } else {
        None
    }
}

fn agent_state_for_call(state: crate::domain::CallState) -> AgentState {
    use crate::domain::CallState::*;
    match state {
        Connected => AgentState::Talking,
        Ringing | Queued => AgentState::Ringing,
        Hold => AgentState::Hold,
        Completed | Idle => AgentState::Idle,
        Parked => AgentState::Hold,
    }
}

/// Derives a stable numeric agent id from an extension when no external
/// agent directory is available to this event-only core (spec §4.8's
/// AgentResolver owns the authoritative id once persistence is consulted;
/// this id is used consistently within a process lifetime).
fn synthetic_agent_id(extension: &str) -> u64 {
    if let Ok(n) = extension.parse::<u64>() {
        return n;
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    extension.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta3::Party;

    fn party(eq_type: u32, number: &str, name: &str, id: &str, dir: &str) -> Party {
        Party {
            eq_type,
            number: number.to_string(),
            name: name.to_string(),
            id: id.to_string(),
            direction_hint: dir.to_string(),
        }
    }

    #[test]
    fn scenario_s2_call_lifecycle() {
        let mut core = StateCore::new();
        let detail = Detail {
            call_id: "12345".into(),
            state_code: 2,
            stamp: 1_707_573_600,
            conn_stamp: 1_707_573_610,
            end_stamp: 0,
            account_code: String::new(),
            party_a: party(10, "2001", "Alice", "2001", "I"),
            party_b: party(5, "5550100", "", "T1", ""),
            targets: vec![],
        };

        let events = core.apply(&Record::Detail(detail), 1_707_573_610);
        assert_eq!(events.len(), 2); // CallCreated + AgentStateChanged
        assert!(matches!(events[0], StateCoreEvent::CallCreated(_)));

        let lost = CallLost {
            call_id: "12345".into(),
            cause: 16,
            stamp: 1_707_573_700,
        };
        let events = core.apply(&Record::CallLost(lost), 1_707_573_700);
        assert!(events.iter().any(|e| matches!(e, StateCoreEvent::CallEnded(_))));

        let call = core.call("12345").unwrap();
        assert_eq!(call.direction, Some(Direction::Inbound));
        assert!(call.answered);
        assert_eq!(call.answer_time, Some(1_707_573_610));
        assert_eq!(call.end_time, Some(1_707_573_700));
    }

    #[test]
    fn hunt_group_target_is_excluded_from_internal_and_trunk_party() {
        let target = party(15, "300", "Sales", "300", "");
        assert_eq!(delta3::classify_equipment(target.eq_type), EquipmentKind::HuntGroup);
    }

    #[test]
    fn internal_call_between_two_phones() {
        let detail = Detail {
            call_id: "1".into(),
            state_code: 2,
            stamp: 100,
            conn_stamp: 101,
            end_stamp: 0,
            account_code: String::new(),
            party_a: party(10, "2001", "Alice", "2001", ""),
            party_b: party(9, "2002", "Bob", "2002", ""),
            targets: vec![],
        };
        assert_eq!(
            resolve_direction(&detail.party_a, &detail.party_b),
            Direction::Internal
        );
    }

    #[test]
    fn no_agent_event_when_state_and_call_id_unchanged() {
        let mut core = StateCore::new();
        let detail = Detail {
            call_id: "1".into(),
            state_code: 2,
            stamp: 100,
            conn_stamp: 101,
            end_stamp: 0,
            account_code: String::new(),
            party_a: party(10, "2001", "Alice", "2001", "I"),
            party_b: party(5, "555", "", "T1", ""),
            targets: vec![],
        };
        let _ = core.apply(&Record::Detail(detail.clone()), 100);
        let events = core.apply(&Record::Detail(detail), 100);
        assert!(!events
            .iter()
            .any(|e| matches!(e, StateCoreEvent::AgentStateChanged { .. })));
    }

    #[test]
    fn queued_call_with_hunt_group_target_emits_group_stats() {
        let mut core = StateCore::new();
        let detail = Detail {
            call_id: "1".into(),
            state_code: 10, // queued
            stamp: 1_000,
            conn_stamp: 0,
            end_stamp: 0,
            account_code: String::new(),
            party_a: party(10, "2001", "Alice", "2001", "I"),
            party_b: party(5, "555", "", "T1", ""),
            targets: vec![party(15, "300", "Sales", "300", "")],
        };

        let events = core.apply(&Record::Detail(detail), 1_000);
        let group = events.iter().find_map(|e| match e {
            StateCoreEvent::GroupStatsUpdated(g) => Some(g.clone()),
            _ => None,
        });
        let group = group.expect("expected a GroupStatsUpdated event");
        assert_eq!(group.name, "Sales");
        assert_eq!(group.calls_waiting, 1);

        let call = core.call("1").unwrap();
        assert_eq!(call.queue_name.as_deref(), Some("Sales"));
        assert_eq!(call.queue_entry_time, Some(1_000));
    }

    #[test]
    fn terminal_call_is_swept_after_grace_period() {
        let mut core = StateCore::new();
        let lost = CallLost {
            call_id: "1".into(),
            cause: 0,
            stamp: 100,
        };
        core.calls.insert("1".to_string(), Call::new("1"));
        core.apply(&Record::CallLost(lost), 100);
        assert!(core.call("1").is_some());
        core.sweep_removals(100 + TERMINAL_CALL_GRACE_SECONDS);
        assert!(core.call("1").is_none());
    }
}
