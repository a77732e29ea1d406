//! SmdrParser and SMDR TCP listener (spec §4.7, §6). IP Office delivers
//! SMDR as a plain TCP stream of newline-terminated 35-field CSV lines;
//! there is no framing byte and no auth, just text.
//!
//! Only the seven fields spec §4.7 pins by position are read with
//! confidence: timestamp (1), connected duration (2), ring seconds (3),
//! direction (5), both-internal flag (9), and the two device ids (12,
//! 14). The remaining derived fields (account code, call id, charge,
//! currency, external targeting cause) aren't given an index by the
//! reference documentation available here, so their positions below are
//! a best-effort placement following the common IP Office SMDR layout;
//! `SmdrRecord::fields` always keeps the raw row so a misplacement
//! doesn't lose data.

use std::io::BufRead;
use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;

use crate::domain::{Direction, SmdrRecord};
use crate::error::{BridgeError, Result};

pub const FIELD_COUNT: usize = 35;

const F_TIMESTAMP: usize = 0;
const F_CONNECTED_DURATION: usize = 1;
const F_RING_SECONDS: usize = 2;
const F_DIRECTION: usize = 4;
const F_BOTH_INTERNAL: usize = 8;
const F_ACCOUNT_CODE: usize = 9;
const F_CALL_ID: usize = 10;
const F_PARTY1_DEVICE: usize = 11;
const F_PARTY2_DEVICE: usize = 13;
const F_HOLD_SECONDS: usize = 15;
const F_PARK_SECONDS: usize = 16;
const F_CALL_CHARGE: usize = 21;
const F_CURRENCY: usize = 22;
const F_EXTERNAL_TARGETING_CAUSE: usize = 28;

/// Split a raw SMDR line into its positional fields, honoring quoted
/// commas the same way the Delta3 CSV form does.
pub fn split_fields(line: &str) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());
    let record = reader
        .records()
        .next()
        .ok_or_else(|| BridgeError::Parse("empty SMDR line".into()))?
        .map_err(|e| BridgeError::Parse(format!("smdr csv error: {e}")))?;
    Ok(record.iter().map(str::to_string).collect())
}

fn field<'a>(fields: &'a [String], idx: usize) -> &'a str {
    fields.get(idx).map(String::as_str).unwrap_or("")
}

fn field_opt(fields: &[String], idx: usize) -> Option<String> {
    match field(fields, idx) {
        "" => None,
        s => Some(s.to_string()),
    }
}

fn parse_hms_to_seconds(s: &str) -> i64 {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return 0;
    }
    let h: i64 = parts[0].parse().unwrap_or(0);
    let m: i64 = parts[1].parse().unwrap_or(0);
    let sec: i64 = parts[2].parse().unwrap_or(0);
    h * 3600 + m * 60 + sec
}

fn parse_int_seconds(s: &str) -> i64 {
    s.parse().unwrap_or(0)
}

fn parse_timestamp(s: &str) -> i64 {
    chrono::NaiveDateTime::parse_from_str(s, "%Y/%m/%d %H:%M:%S")
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

/// Extract the digits after a leading `E` (extension-prefixed device id),
/// per spec §4.10 strategy B.
pub fn extract_extension(device: &str) -> Option<String> {
    let device = device.trim();
    let rest = device.strip_prefix('E')?;
    if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
        Some(rest.to_string())
    } else {
        None
    }
}

/// Parse one SMDR line into a typed record. Missing or malformed numeric
/// fields default to zero rather than failing the whole record — a bad
/// field shouldn't drop an otherwise-usable call record.
pub fn parse_line(line: &str) -> Result<SmdrRecord> {
    let fields = split_fields(line)?;
    if fields.len() < FIELD_COUNT {
        tracing::warn!(
            count = fields.len(),
            expected = FIELD_COUNT,
            "smdr line has fewer fields than expected, parsing what's present"
        );
    }

    let direction = match field(&fields, F_DIRECTION) {
        "I" => Some(Direction::Inbound),
        "O" => Some(Direction::Outbound),
        _ => None,
    };

    Ok(SmdrRecord {
        call_start: parse_timestamp(field(&fields, F_TIMESTAMP)),
        connected_seconds: parse_hms_to_seconds(field(&fields, F_CONNECTED_DURATION)),
        ring_seconds: parse_int_seconds(field(&fields, F_RING_SECONDS)),
        hold_seconds: parse_int_seconds(field(&fields, F_HOLD_SECONDS)),
        park_seconds: parse_int_seconds(field(&fields, F_PARK_SECONDS)),
        direction,
        both_internal: field(&fields, F_BOTH_INTERNAL) == "1",
        party1_device: field(&fields, F_PARTY1_DEVICE).to_string(),
        party2_device: field(&fields, F_PARTY2_DEVICE).to_string(),
        account_code: field_opt(&fields, F_ACCOUNT_CODE),
        call_id: field_opt(&fields, F_CALL_ID),
        call_charge: field_opt(&fields, F_CALL_CHARGE),
        currency: field_opt(&fields, F_CURRENCY),
        external_targeting_cause: field_opt(&fields, F_EXTERNAL_TARGETING_CAUSE),
        continuation: false,
        matched_call_id: None,
        reconciled: false,
        reconciled_at: None,
        fields,
    })
}

/// Blocking accept loop, in the shape of the teacher's client-handling
/// loop in `main.rs`: non-blocking listener polled against a shutdown
/// flag, one thread per connected SMDR feed (IP Office normally opens
/// exactly one).
pub fn run_listener(
    bind_addr: &str,
    shutdown: Arc<AtomicBool>,
    record_tx: Sender<SmdrRecord>,
) -> Result<()> {
    let listener = TcpListener::bind(bind_addr)?;
    listener.set_nonblocking(true)?;
    tracing::info!(bind_addr, "smdr listener started");

    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                let tx = record_tx.clone();
                let shutdown = Arc::clone(&shutdown);
                let peer = peer.to_string();
                thread::spawn(move || handle_connection(stream, peer, shutdown, tx));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(std::time::Duration::from_millis(100));
            }
            Err(e) => {
                tracing::warn!(error = %e, "smdr accept error");
                thread::sleep(std::time::Duration::from_millis(500));
            }
        }
    }
    Ok(())
}

fn handle_connection(
    stream: TcpStream,
    peer: String,
    shutdown: Arc<AtomicBool>,
    record_tx: Sender<SmdrRecord>,
) {
    tracing::info!(peer, "smdr client connected");
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(peer, error = %e, "smdr read error");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Ok(record) => {
                if record_tx.send(record).is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!(peer, error = %e, "failed to parse smdr line"),
        }
    }
    tracing::info!(peer, "smdr client disconnected");
}
