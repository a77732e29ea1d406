//! Core data model (spec §3). Entities are plain structs keyed by id;
//! cross-entity references are ids, never object graphs (spec §9).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Ringing,
    Connected,
    Queued,
    Hold,
    Parked,
    Completed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Completed | CallState::Idle)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Call {
    pub external_call_id: String,
    pub db_id: Option<u64>,
    pub direction: Option<Direction>,
    pub state: Option<CallState>,

    pub caller_number: Option<String>,
    pub caller_name: Option<String>,
    pub called_number: Option<String>,
    pub called_name: Option<String>,

    pub queue_name: Option<String>,
    pub queue_entry_time: Option<i64>,

    pub agent_extension: Option<String>,
    pub agent_name: Option<String>,
    pub agent_id: Option<u64>,

    pub trunk_id: Option<String>,
    pub trunk_name: Option<String>,

    pub start_time: Option<i64>,
    pub answer_time: Option<i64>,
    pub end_time: Option<i64>,

    pub duration: Option<i64>,
    pub talk_duration: Option<i64>,
    pub hold_count: u32,
    pub hold_duration: Option<i64>,
    pub transfer_count: u32,

    pub answered: bool,
    pub abandoned: bool,
    pub recorded: bool,

    pub account_code: Option<String>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Call {
    pub fn new(external_call_id: impl Into<String>) -> Self {
        Self {
            external_call_id: external_call_id.into(),
            ..Default::default()
        }
    }

    /// Merge in non-empty fields from a newer observation, preserving the
    /// earliest timestamps already recorded (spec §4.5 rule 5).
    pub fn merge_from(&mut self, other: &Call) {
        macro_rules! take_some {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field.clone();
                }
            };
        }
        take_some!(direction);
        take_some!(state);
        take_some!(caller_number);
        take_some!(caller_name);
        take_some!(called_number);
        take_some!(called_name);
        take_some!(queue_name);
        take_some!(agent_extension);
        take_some!(agent_name);
        take_some!(agent_id);
        take_some!(trunk_id);
        take_some!(trunk_name);
        take_some!(account_code);

        if self.start_time.is_none() {
            self.start_time = other.start_time;
        }
        if other.answer_time.is_some() && self.answer_time.is_none() {
            self.answer_time = other.answer_time;
        }
        if other.end_time.is_some() {
            self.end_time = other.end_time;
        }
        if other.queue_entry_time.is_some() && self.queue_entry_time.is_none() {
            self.queue_entry_time = other.queue_entry_time;
        }
        if other.answered {
            self.answered = true;
        }
        if other.abandoned {
            self.abandoned = true;
        }
        for tag in &other.tags {
            if !self.tags.contains(tag) {
                self.tags.push(tag.clone());
            }
        }
        for (k, v) in &other.metadata {
            self.metadata.insert(k.clone(), v.clone());
        }
    }

    /// Validate the data-model invariants from spec §3.
    pub fn check_invariants(&self) -> Result<(), String> {
        if let (Some(answer), Some(start)) = (self.answer_time, self.start_time) {
            if answer < start {
                return Err("answer_time < start_time".into());
            }
        }
        if let (Some(answer), Some(end)) = (self.answer_time, self.end_time) {
            if answer > end {
                return Err("answer_time > end_time".into());
            }
        }
        if let (Some(talk), Some(dur)) = (self.talk_duration, self.duration) {
            if talk > dur {
                return Err("talk_duration > duration".into());
            }
        }
        if self.answered && self.answer_time.is_none() {
            return Err("answered but answer_time is null".into());
        }
        if self.abandoned && self.answered {
            return Err("abandoned call cannot be answered".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEventType {
    Initiated,
    Queued,
    Dequeued,
    Ringing,
    Answered,
    Held,
    Retrieved,
    Transferred,
    Conferenced,
    Parked,
    Unparked,
    Voicemail,
    Completed,
    Abandoned,
    Dtmf,
    RecordingStarted,
    RecordingStopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEvent {
    pub call_id: String,
    pub event_type: CallEventType,
    pub timestamp: i64,
    pub duration: Option<i64>,
    pub party: Option<String>,
    pub agent_id: Option<u64>,
    pub agent_extension: Option<String>,
    pub queue_name: Option<String>,
    pub details: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Talking,
    Ringing,
    Hold,
    Acw,
    Dnd,
    Away,
    LoggedOut,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: u64,
    pub extension: String,
    pub display_name: String,
    pub current_state: AgentState,
    pub state_start_time: i64,
    pub active_call_id: Option<String>,
    pub group_ids: Vec<u64>,
    pub skill_ids: Vec<u64>,
    pub login_timestamp: i64,
    pub active: bool,
}

impl Agent {
    pub fn placeholder(id: u64, extension: &str, now: i64) -> Self {
        Self {
            id,
            extension: extension.to_string(),
            display_name: format!("Extension {extension}"),
            current_state: AgentState::Unknown,
            state_start_time: now,
            active_call_id: None,
            group_ids: Vec::new(),
            skill_ids: Vec::new(),
            login_timestamp: now,
            active: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateHistory {
    pub agent_id: u64,
    pub state: AgentState,
    pub previous_state: Option<AgentState>,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub call_id: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuntGroup {
    pub id: u64,
    pub name: String,
    pub number: String,
    pub calls_waiting: u32,
    pub longest_wait_seconds: u32,
    pub agents_available: u32,
    pub agents_busy: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmdrRecord {
    pub fields: Vec<String>,
    pub call_start: i64,
    pub connected_seconds: i64,
    pub ring_seconds: i64,
    pub hold_seconds: i64,
    pub park_seconds: i64,
    pub direction: Option<Direction>,
    pub both_internal: bool,
    pub party1_device: String,
    pub party2_device: String,
    pub account_code: Option<String>,
    pub call_id: Option<String>,
    pub call_charge: Option<String>,
    pub currency: Option<String>,
    pub external_targeting_cause: Option<String>,
    pub continuation: bool,
    pub matched_call_id: Option<String>,
    pub reconciled: bool,
    pub reconciled_at: Option<i64>,
}

/// In-memory record of a live call awaiting a matching SMDR record.
/// Owned exclusively by the CorrelationEngine (spec §3).
#[derive(Debug, Clone)]
pub struct PendingMatch {
    pub external_call_id: String,
    pub db_call_id: Option<u64>,
    pub extension: Option<String>,
    pub start_time: i64,
    pub received_at: i64,
}

pub const PENDING_MATCH_TTL_SECONDS: i64 = 600;
pub const TERMINAL_CALL_GRACE_SECONDS: i64 = 5;
pub const SMDR_WINDOW_SECONDS: i64 = 5;
