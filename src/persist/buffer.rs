//! PersistBuffer (spec §4.9): the only writer of CallEvent rows. Batches
//! them to cut fsync pressure on the append log, while call upserts and
//! agent-state transitions go straight through (they're already coalesced
//! in memory by StateCore before they reach here).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::domain::{Agent, AgentStateHistory, Call, CallEvent};
use crate::error::Result;
use crate::persist::Store;

const FLUSH_SIZE: usize = 50;
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

struct PendingEvents {
    events: Vec<CallEvent>,
    oldest: Option<Instant>,
}

/// Buffers `CallEvent` writes; flushes on size or age. Call and agent
/// writes bypass the buffer entirely since the store already treats them
/// as idempotent upserts (spec §4.9).
pub struct PersistBuffer<'s> {
    store: &'s Store,
    pending: Mutex<PendingEvents>,
    flush_cv: Condvar,
    flushing: AtomicBool,
}

impl<'s> PersistBuffer<'s> {
    pub fn new(store: &'s Store) -> Self {
        Self {
            store,
            pending: Mutex::new(PendingEvents {
                events: Vec::new(),
                oldest: None,
            }),
            flush_cv: Condvar::new(),
            flushing: AtomicBool::new(false),
        }
    }

    pub fn upsert_call(&self, call: &Call) -> Result<(u64, bool)> {
        self.store.upsert_call(call)
    }

    pub fn record_agent_state(&self, segment: AgentStateHistory, agent: &Agent) -> Result<()> {
        self.store.append_agent_state_history(segment)?;
        self.store.upsert_agent(agent)
    }

    /// Queue a CallEvent for the batched log write. Flushes inline once
    /// the batch is full or has been open for `FLUSH_INTERVAL`.
    pub fn record_call_event(&self, event: CallEvent) -> Result<()> {
        let should_flush = {
            let mut pending = self.pending.lock().unwrap();
            if pending.oldest.is_none() {
                pending.oldest = Some(Instant::now());
            }
            pending.events.push(event);
            pending.events.len() >= FLUSH_SIZE
                || pending.oldest.is_some_and(|t| t.elapsed() >= FLUSH_INTERVAL)
        };
        if should_flush {
            self.flush()?;
        }
        Ok(())
    }

    /// Serializes concurrent flush attempts onto a single writer; a
    /// flush already in flight is waited on rather than duplicated.
    pub fn flush(&self) -> Result<()> {
        let mut pending = self.pending.lock().unwrap();
        while self.flushing.swap(true, Ordering::AcqRel) {
            pending = self.flush_cv.wait(pending).unwrap();
            if pending.events.is_empty() {
                return Ok(());
            }
        }

        let batch = std::mem::take(&mut pending.events);
        pending.oldest = None;
        drop(pending);

        let result = self.write_batch(&batch);
        if let Err(ref e) = result {
            tracing::warn!(error = %e, count = batch.len(), "call event flush failed, retrying on next pass");
            let mut pending = self.pending.lock().unwrap();
            let mut retry = batch;
            retry.extend(std::mem::take(&mut pending.events));
            pending.events = retry;
            if pending.oldest.is_none() {
                pending.oldest = Some(Instant::now());
            }
        }

        self.flushing.store(false, Ordering::Release);
        self.flush_cv.notify_all();
        result
    }

    fn write_batch(&self, batch: &[CallEvent]) -> Result<()> {
        for event in batch {
            self.store.append_call_event(event)?;
        }
        Ok(())
    }

    /// Drain whatever is buffered. Called once at shutdown (spec §4.11).
    pub fn flush_pending(&self) -> Result<()> {
        loop {
            let empty = self.pending.lock().unwrap().events.is_empty();
            if empty {
                return Ok(());
            }
            self.flush()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CallEventType;
    use tempfile::tempdir;

    fn sample_event(call_id: &str) -> CallEvent {
        CallEvent {
            call_id: call_id.into(),
            event_type: CallEventType::Initiated,
            timestamp: 1,
            duration: None,
            party: None,
            agent_id: None,
            agent_extension: None,
            queue_name: None,
            details: Default::default(),
        }
    }

    #[test]
    fn flush_triggers_at_batch_size() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let buffer = PersistBuffer::new(&store);

        for i in 0..FLUSH_SIZE {
            buffer.record_call_event(sample_event(&format!("c{i}"))).unwrap();
        }
        assert!(buffer.pending.lock().unwrap().events.is_empty());
    }

    #[test]
    fn flush_pending_drains_partial_batch() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let buffer = PersistBuffer::new(&store);

        buffer.record_call_event(sample_event("c1")).unwrap();
        assert!(!buffer.pending.lock().unwrap().events.is_empty());
        buffer.flush_pending().unwrap();
        assert!(buffer.pending.lock().unwrap().events.is_empty());
    }
}
