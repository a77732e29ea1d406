//! CorrelationEngine (spec §4.10): reconciles the DevLink3-derived live
//! call stream with the delayed SMDR stream. Consumes both from the
//! broker's `calls` and `smdr` channels — the spec's `smdr_correlated`
//! channel has no separate definition anywhere else in the document, so
//! it's read here as the `smdr` channel from §4.6.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{Receiver, Select};

use crate::broker::{BrokerMessage, CallEventMessage};
use crate::domain::{Call, CallState, PendingMatch, SmdrRecord, PENDING_MATCH_TTL_SECONDS, SMDR_WINDOW_SECONDS};
use crate::error::Result;
use crate::persist::{PersistBuffer, Store};
use crate::resolver::AgentResolver;
use crate::smdr;

#[derive(Debug, Default)]
pub struct CorrelationStats {
    pub devlink_events_received: AtomicU64,
    pub smdr_records_received: AtomicU64,
    pub matched_count: AtomicU64,
    pub unmatched_count: AtomicU64,
    pub errors: AtomicU64,
    total_match_latency_ms: AtomicU64,
}

impl CorrelationStats {
    pub fn avg_match_latency_ms(&self) -> f64 {
        let matched = self.matched_count.load(Ordering::Relaxed);
        if matched == 0 {
            return 0.0;
        }
        self.total_match_latency_ms.load(Ordering::Relaxed) as f64 / matched as f64
    }
}

pub struct CorrelationEngine<'s> {
    store: &'s Store,
    buffer: &'s PersistBuffer<'s>,
    resolver: &'s AgentResolver<'s>,
    pending: Mutex<HashMap<String, PendingMatch>>,
    stats: CorrelationStats,
}

impl<'s> CorrelationEngine<'s> {
    pub fn new(store: &'s Store, buffer: &'s PersistBuffer<'s>, resolver: &'s AgentResolver<'s>) -> Self {
        Self {
            store,
            buffer,
            resolver,
            pending: Mutex::new(HashMap::new()),
            stats: CorrelationStats::default(),
        }
    }

    pub fn stats(&self) -> &CorrelationStats {
        &self.stats
    }

    /// Main loop: selects over both channels, sweeps stale PendingMatch
    /// entries once a minute, logs stats once a minute (spec §4.10).
    pub fn run(&self, calls_rx: Receiver<BrokerMessage>, smdr_rx: Receiver<BrokerMessage>, stop: &Receiver<()>) {
        let mut last_sweep = std::time::Instant::now();
        let mut last_log = std::time::Instant::now();

        loop {
            let mut select = Select::new();
            let calls_idx = select.recv(&calls_rx);
            let smdr_idx = select.recv(&smdr_rx);
            let stop_idx = select.recv(stop);

            let oper = match select.select_timeout(Duration::from_secs(1)) {
                Ok(oper) => oper,
                Err(_) => {
                    self.maybe_sweep_and_log(&mut last_sweep, &mut last_log);
                    continue;
                }
            };

            match oper.index() {
                i if i == stop_idx => {
                    let _ = oper.recv(stop);
                    return;
                }
                i if i == calls_idx => {
                    if let Ok(BrokerMessage::Calls(msg)) = oper.recv(&calls_rx) {
                        if let Err(e) = self.on_call_event(&msg, now()) {
                            self.stats.errors.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(error = %e, "failed to process call event");
                        }
                    }
                }
                i if i == smdr_idx => {
                    if let Ok(BrokerMessage::Smdr(record)) = oper.recv(&smdr_rx) {
                        if let Err(e) = self.on_smdr_record(record, now()) {
                            self.stats.errors.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(error = %e, "failed to process smdr record");
                        }
                    }
                }
                _ => unreachable!(),
            }
            self.maybe_sweep_and_log(&mut last_sweep, &mut last_log);
        }
    }

    fn maybe_sweep_and_log(&self, last_sweep: &mut std::time::Instant, last_log: &mut std::time::Instant) {
        if last_sweep.elapsed() >= Duration::from_secs(60) {
            self.sweep_stale(now());
            *last_sweep = std::time::Instant::now();
        }
        if last_log.elapsed() >= Duration::from_secs(60) {
            self.log_stats();
            *last_log = std::time::Instant::now();
        }
    }

    pub fn on_call_event(&self, msg: &CallEventMessage, now: i64) -> Result<()> {
        self.stats.devlink_events_received.fetch_add(1, Ordering::Relaxed);

        let mut call = msg.call.clone();
        if let Some(ext) = call.agent_extension.clone() {
            let handle = self.resolver.resolve(&ext, now);
            if !handle.transient {
                call.agent_id = Some(handle.agent_id);
            }
        }

        let (db_id, _is_new) = self.buffer.upsert_call(&call)?;
        self.buffer.record_call_event(msg.event.clone())?;

        self.pending.lock().unwrap().insert(
            call.external_call_id.clone(),
            PendingMatch {
                external_call_id: call.external_call_id.clone(),
                db_call_id: Some(db_id),
                extension: call.agent_extension.clone(),
                start_time: call.start_time.unwrap_or(now),
                received_at: now,
            },
        );
        Ok(())
    }

    pub fn on_smdr_record(&self, mut record: SmdrRecord, now: i64) -> Result<()> {
        self.stats.smdr_records_received.fetch_add(1, Ordering::Relaxed);

        let matched = self
            .match_strategy_a(&record)
            .or_else(|| self.match_strategy_b(&record));

        match matched {
            Some((external_call_id, received_at)) => {
                self.pending.lock().unwrap().remove(&external_call_id);
                let mut call = self
                    .store
                    .get_call(&external_call_id)
                    .unwrap_or_else(|| Call::new(external_call_id.clone()));
                enrich_from_smdr(&mut call, &record);
                self.buffer.upsert_call(&call)?;

                record.reconciled = true;
                record.reconciled_at = Some(now);
                record.matched_call_id = Some(external_call_id);

                self.stats.matched_count.fetch_add(1, Ordering::Relaxed);
                let latency_ms = ((now - received_at).max(0) * 1000) as u64;
                self.stats
                    .total_match_latency_ms
                    .fetch_add(latency_ms, Ordering::Relaxed);
            }
            None => {
                // Strategy C: no candidate, stand up a call row from the
                // SMDR fields alone.
                let external_call_id = record
                    .call_id
                    .clone()
                    .unwrap_or_else(|| format!("smdr-{}-{}", record.call_start, record.party1_device));
                let mut call = Call::new(external_call_id.clone());
                call.state = Some(CallState::Completed);
                call.start_time = Some(record.call_start);
                call.direction = record.direction;
                call.metadata
                    .insert("source".into(), serde_json::Value::String("smdr-only".into()));
                enrich_from_smdr(&mut call, &record);
                self.buffer.upsert_call(&call)?;

                record.reconciled = true;
                record.reconciled_at = Some(now);
                record.matched_call_id = Some(external_call_id);
                self.stats.unmatched_count.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.store.append_smdr(&record)?;
        Ok(())
    }

    /// Strategy A: the SMDR's own `call_id` names a pending external
    /// call id directly.
    fn match_strategy_a(&self, record: &SmdrRecord) -> Option<(String, i64)> {
        let call_id = record.call_id.as_ref()?;
        let pending = self.pending.lock().unwrap();
        let entry = pending.get(call_id)?;
        Some((entry.external_call_id.clone(), entry.received_at))
    }

    /// Strategy B: no direct id match — fall back to a time-window and
    /// extension match against persisted calls.
    fn match_strategy_b(&self, record: &SmdrRecord) -> Option<(String, i64)> {
        let extension = smdr::extract_extension(&record.party1_device)?;
        let lo = record.call_start - SMDR_WINDOW_SECONDS;
        let hi = record.call_start + SMDR_WINDOW_SECONDS;
        let candidates = self.store.find_calls_in_window(lo, hi, &extension);
        if candidates.len() != 1 {
            return None;
        }
        let call = &candidates[0];
        let received_at = self
            .pending
            .lock()
            .unwrap()
            .get(&call.external_call_id)
            .map(|p| p.received_at)
            .unwrap_or(record.call_start);
        Some((call.external_call_id.clone(), received_at))
    }

    /// Evict PendingMatch entries older than the TTL (spec §4.10).
    pub fn sweep_stale(&self, now: i64) {
        let mut pending = self.pending.lock().unwrap();
        pending.retain(|_, p| now - p.received_at < PENDING_MATCH_TTL_SECONDS);
    }

    pub fn log_stats(&self) {
        tracing::info!(
            devlink_events_received = self.stats.devlink_events_received.load(Ordering::Relaxed),
            smdr_records_received = self.stats.smdr_records_received.load(Ordering::Relaxed),
            matched_count = self.stats.matched_count.load(Ordering::Relaxed),
            unmatched_count = self.stats.unmatched_count.load(Ordering::Relaxed),
            avg_match_latency_ms = self.stats.avg_match_latency_ms(),
            errors = self.stats.errors.load(Ordering::Relaxed),
            "correlation engine stats"
        );
    }
}

/// Enrichment rules from spec §4.10: overwrite duration/talk/hold from
/// the SMDR record's own accounting, which is authoritative once the
/// call has actually ended.
fn enrich_from_smdr(call: &mut Call, record: &SmdrRecord) {
    call.duration = Some(record.connected_seconds + record.ring_seconds + record.hold_seconds + record.park_seconds);
    call.talk_duration = Some(record.connected_seconds);
    call.hold_duration = Some(record.hold_seconds);
    if record.account_code.is_some() {
        call.account_code = record.account_code.clone();
    }
    if !record.party2_device.is_empty() {
        call.trunk_name = Some(record.party2_device.clone());
    }
    call.answered = record.connected_seconds > 0;

    call.metadata
        .insert("call_charge".into(), serde_json::json!(record.call_charge));
    call.metadata
        .insert("currency".into(), serde_json::json!(record.currency));
    call.metadata.insert(
        "external_targeting_cause".into(),
        serde_json::json!(record.external_targeting_cause),
    );
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CallEvent, CallEventType, Direction};
    use tempfile::tempdir;

    fn sample_call_event(id: &str, ext: &str, start_time: i64) -> CallEventMessage {
        let mut call = Call::new(id);
        call.agent_extension = Some(ext.to_string());
        call.start_time = Some(start_time);
        CallEventMessage {
            call,
            event: CallEvent {
                call_id: id.into(),
                event_type: CallEventType::Initiated,
                timestamp: start_time,
                duration: None,
                party: None,
                agent_id: None,
                agent_extension: Some(ext.to_string()),
                queue_name: None,
                details: Default::default(),
            },
        }
    }

    fn sample_smdr(call_id: Option<&str>, party1: &str, call_start: i64) -> SmdrRecord {
        SmdrRecord {
            fields: vec![],
            call_start,
            connected_seconds: 30,
            ring_seconds: 2,
            hold_seconds: 0,
            park_seconds: 0,
            direction: Some(Direction::Inbound),
            both_internal: false,
            party1_device: party1.into(),
            party2_device: "T001".into(),
            account_code: None,
            call_id: call_id.map(str::to_string),
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
    fn strategy_a_matches_by_call_id() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let buffer = PersistBuffer::new(&store);
        let resolver = AgentResolver::new(&store).unwrap();
        let engine = CorrelationEngine::new(&store, &buffer, &resolver);

        engine.on_call_event(&sample_call_event("c1", "2001", 1_000), 1_000).unwrap();
        engine.on_smdr_record(sample_smdr(Some("c1"), "E2001", 1_000), 1_005).unwrap();

        assert_eq!(engine.stats.matched_count.load(Ordering::Relaxed), 1);
        let call = store.get_call("c1").unwrap();
        assert!(call.answered);
        assert_eq!(call.duration, Some(32));
    }

    #[test]
    fn strategy_c_creates_standalone_call_when_unmatched() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let buffer = PersistBuffer::new(&store);
        let resolver = AgentResolver::new(&store).unwrap();
        let engine = CorrelationEngine::new(&store, &buffer, &resolver);

        engine.on_smdr_record(sample_smdr(None, "E9999", 2_000), 2_005).unwrap();
        assert_eq!(engine.stats.unmatched_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn sweep_stale_evicts_old_pending_matches() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let buffer = PersistBuffer::new(&store);
        let resolver = AgentResolver::new(&store).unwrap();
        let engine = CorrelationEngine::new(&store, &buffer, &resolver);

        engine.on_call_event(&sample_call_event("c1", "2001", 1_000), 1_000).unwrap();
        assert_eq!(engine.pending.lock().unwrap().len(), 1);
        engine.sweep_stale(1_000 + PENDING_MATCH_TTL_SECONDS + 1);
        assert!(engine.pending.lock().unwrap().is_empty());
    }
}
