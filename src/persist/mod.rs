//! File-based persistence (spec §4.9, §7 "Persisted state"). Each logical
//! table is an append-only JSON-line log framed with a length prefix and a
//! CRC32, in the shape of the teacher's turn log: load-time replay rebuilds
//! the in-memory index and truncates a corrupt/partial tail rather than
//! failing to start.
//!
//! Unlike the teacher's fixed-width binary records, rows here are
//! JSON-encoded: `Call` and friends carry enough optional fields that a
//! schema-free record is the pragmatic fit, while the framing (length +
//! CRC32, corrupt-tail truncation) keeps the same corruption-detection
//! properties.

mod buffer;
mod log;

pub use buffer::PersistBuffer;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::domain::{Agent, AgentStateHistory, Call, CallEvent, SmdrRecord};
use crate::error::Result;
use log::RecordLog;

struct StoreInner {
    calls: HashMap<String, (u64, Call)>,
    agents: HashMap<u64, Agent>,
    agents_by_extension: HashMap<String, u64>,
    open_agent_segments: HashMap<u64, AgentStateHistory>,
    next_call_db_id: u64,
    next_agent_id: u64,
    next_smdr_id: u64,
}

/// The authoritative, durable store backing PersistBuffer and
/// AgentResolver. One log file per logical table, replayed in full on
/// open.
pub struct Store {
    calls_log: Mutex<RecordLog>,
    agents_log: Mutex<RecordLog>,
    call_events_log: Mutex<RecordLog>,
    agent_state_log: Mutex<RecordLog>,
    smdr_log: Mutex<RecordLog>,
    inner: Mutex<StoreInner>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct CallRow {
    db_id: u64,
    call: Call,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SmdrRow {
    id: u64,
    record: SmdrRecord,
}

impl Store {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let calls_log = RecordLog::open(&dir.join("calls.log"))?;
        let agents_log = RecordLog::open(&dir.join("agents.log"))?;
        let call_events_log = RecordLog::open(&dir.join("call_events.log"))?;
        let agent_state_log = RecordLog::open(&dir.join("agent_state_history.log"))?;
        let smdr_log = RecordLog::open(&dir.join("smdr_records.log"))?;

        let mut inner = StoreInner {
            calls: HashMap::new(),
            agents: HashMap::new(),
            agents_by_extension: HashMap::new(),
            open_agent_segments: HashMap::new(),
            next_call_db_id: 1,
            next_agent_id: 1,
            next_smdr_id: 1,
        };

        for bytes in calls_log.replay()? {
            if let Ok(row) = serde_json::from_slice::<CallRow>(&bytes) {
                inner.next_call_db_id = inner.next_call_db_id.max(row.db_id + 1);
                inner.calls.insert(row.call.external_call_id.clone(), (row.db_id, row.call));
            }
        }
        for bytes in agents_log.replay()? {
            if let Ok(agent) = serde_json::from_slice::<Agent>(&bytes) {
                inner.next_agent_id = inner.next_agent_id.max(agent.id + 1);
                inner.agents_by_extension.insert(agent.extension.clone(), agent.id);
                inner.agents.insert(agent.id, agent);
            }
        }
        for bytes in agent_state_log.replay()? {
            if let Ok(row) = serde_json::from_slice::<AgentStateHistory>(&bytes) {
                if row.end_time.is_none() {
                    inner.open_agent_segments.insert(row.agent_id, row);
                }
            }
        }
        for bytes in smdr_log.replay()? {
            if let Ok(row) = serde_json::from_slice::<SmdrRow>(&bytes) {
                inner.next_smdr_id = inner.next_smdr_id.max(row.id + 1);
            }
        }

        Ok(Self {
            calls_log: Mutex::new(calls_log),
            agents_log: Mutex::new(agents_log),
            call_events_log: Mutex::new(call_events_log),
            agent_state_log: Mutex::new(agent_state_log),
            smdr_log: Mutex::new(smdr_log),
            inner: Mutex::new(inner),
        })
    }

    /// Insert-or-update keyed on `external_call_id`. Only non-null fields
    /// on `partial` are applied; an existing field is never cleared
    /// implicitly (spec §4.9).
    pub fn upsert_call(&self, partial: &Call) -> Result<(u64, bool)> {
        let mut inner = self.inner.lock().unwrap();
        let is_new = !inner.calls.contains_key(&partial.external_call_id);
        let db_id = if is_new {
            let id = inner.next_call_db_id;
            inner.next_call_db_id += 1;
            id
        } else {
            inner.calls[&partial.external_call_id].0
        };

        let entry = inner
            .calls
            .entry(partial.external_call_id.clone())
            .or_insert_with(|| (db_id, Call::new(partial.external_call_id.clone())));
        entry.1.merge_from(partial);
        entry.1.db_id = Some(db_id);
        let snapshot = entry.1.clone();
        drop(inner);

        let row = CallRow { db_id, call: snapshot };
        let bytes = serde_json::to_vec(&row).map_err(|e| crate::error::BridgeError::Store(e.to_string()))?;
        self.calls_log.lock().unwrap().append(&bytes)?;
        Ok((db_id, is_new))
    }

    pub fn get_call(&self, external_call_id: &str) -> Option<Call> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .get(external_call_id)
            .map(|(_, call)| call.clone())
    }

    /// Candidates for CorrelationEngine strategy B: calls whose
    /// `start_time` falls in `[lo, hi]` and whose `agent_extension`
    /// matches (spec §4.10).
    pub fn find_calls_in_window(&self, lo: i64, hi: i64, extension: &str) -> Vec<Call> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .values()
            .filter(|(_, call)| {
                call.start_time.is_some_and(|t| t >= lo && t <= hi)
                    && call.agent_extension.as_deref() == Some(extension)
            })
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn append_call_event(&self, event: &CallEvent) -> Result<()> {
        let bytes = serde_json::to_vec(event).map_err(|e| crate::error::BridgeError::Store(e.to_string()))?;
        self.call_events_log.lock().unwrap().append(&bytes)
    }

    pub fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.agents_by_extension.insert(agent.extension.clone(), agent.id);
        inner.agents.insert(agent.id, agent.clone());
        drop(inner);

        let bytes = serde_json::to_vec(agent).map_err(|e| crate::error::BridgeError::Store(e.to_string()))?;
        self.agents_log.lock().unwrap().append(&bytes)
    }

    pub fn find_agent_by_extension(&self, extension: &str) -> Result<Option<Agent>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .agents_by_extension
            .get(extension)
            .and_then(|id| inner.agents.get(id))
            .cloned())
    }

    pub fn load_active_agents(&self) -> Result<Vec<Agent>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.agents.values().filter(|a| a.active).cloned().collect())
    }

    pub fn next_agent_id(&self) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_agent_id;
        inner.next_agent_id += 1;
        Ok(id)
    }

    /// Write the now-closed previous segment (if any) with its end_time
    /// set, then open the new segment. The history write happens before
    /// `Agent.current_state` is updated by the caller, per spec §4.9's
    /// "history write must happen first and be the source of truth".
    pub fn append_agent_state_history(&self, segment: AgentStateHistory) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let previous = inner.open_agent_segments.remove(&segment.agent_id);
        if segment.end_time.is_none() {
            inner.open_agent_segments.insert(segment.agent_id, segment.clone());
        }
        drop(inner);

        if let Some(mut previous) = previous {
            previous.end_time = Some(segment.start_time);
            let bytes = serde_json::to_vec(&previous)
                .map_err(|e| crate::error::BridgeError::Store(e.to_string()))?;
            self.agent_state_log.lock().unwrap().append(&bytes)?;
        }

        let bytes = serde_json::to_vec(&segment)
            .map_err(|e| crate::error::BridgeError::Store(e.to_string()))?;
        self.agent_state_log.lock().unwrap().append(&bytes)
    }

    pub fn append_smdr(&self, record: &SmdrRecord) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_smdr_id;
        inner.next_smdr_id += 1;
        drop(inner);

        let row = SmdrRow { id, record: record.clone() };
        let bytes = serde_json::to_vec(&row).map_err(|e| crate::error::BridgeError::Store(e.to_string()))?;
        self.smdr_log.lock().unwrap().append(&bytes)?;
        Ok(id)
    }
}
