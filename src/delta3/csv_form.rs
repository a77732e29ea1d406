//! CSV-form Delta3 parsing: inner elements carry comma-separated positional
//! values (quoted commas respected); targets nest under `Target_list` (spec
//! §4.3).
//!
//! Field indices below are the positional orderings this implementation
//! assumes; they are a best-effort mapping documented per spec §4.3's
//! "implementation must document every field index" requirement, and are
//! flagged as unverified in the Open Questions section of this crate's
//! expanded requirements (no fixture captures were available to confirm
//! them against the reference documentation).

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use super::types::{AttemptReject, CallLost, Detail, LinkLost, Party};
use crate::error::{BridgeError, Result};

/// `Call`: CallID, State, Stamp, ConnStamp, EndStamp, AccountCode.
const CALL_FIELDS: usize = 6;
/// `PartyA`/`PartyB`/`Target`: EqType, Number, Name, Id, Dir.
const PARTY_FIELDS: usize = 5;
/// `CallLost`: CallID, Cause, Stamp.
const CALL_LOST_FIELDS: usize = 3;
/// `LinkLost`: Stamp, Reason.
const LINK_LOST_FIELDS: usize = 2;
/// `AttemptReject`: CallID, Target, Cause, Stamp.
const ATTEMPT_REJECT_FIELDS: usize = 4;

fn split_csv_line(line: &str) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(line.as_bytes());
    match reader.records().next() {
        Some(Ok(record)) => Ok(record.iter().map(|s| s.to_string()).collect()),
        Some(Err(e)) => Err(BridgeError::Parse(format!("csv error: {e}"))),
        None => Ok(Vec::new()),
    }
}

fn field(values: &[String], idx: usize) -> String {
    values.get(idx).cloned().unwrap_or_default()
}

fn field_u32(values: &[String], idx: usize) -> u32 {
    values.get(idx).and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

fn field_i64(values: &[String], idx: usize) -> i64 {
    values.get(idx).and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

/// Logs (never fails) when a CSV-form row has fewer fields than the
/// positional layout this parser assumes — a signal that the field-index
/// mapping above may be wrong for this PBX's Delta3 build.
fn warn_if_short(tag: &str, fields: &[String], expected: usize) {
    if fields.len() < expected {
        tracing::warn!(tag, got = fields.len(), expected, "CSV-form record shorter than expected field count");
    }
}

fn party_from_fields(values: &[String]) -> Party {
    Party {
        eq_type: field_u32(values, 0),
        number: field(values, 1),
        name: field(values, 2),
        id: field(values, 3),
        direction_hint: field(values, 4),
    }
}

/// Collect the text content of each element, keyed by tag name, in document
/// order (elements with no text yield an empty string).
fn collect_element_texts(xml: &str) -> Result<Vec<(String, String)>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut out: Vec<(String, String)> = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                out.push((name.clone(), String::new()));
                stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                out.push((name, String::new()));
            }
            Ok(Event::Text(t)) => {
                if let Some(top) = stack.last() {
                    let text = t.unescape().unwrap_or_default().into_owned();
                    if let Some(entry) = out.iter_mut().rev().find(|(tag, _)| tag == top) {
                        entry.1 = text;
                    }
                }
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(_) => {}
            Err(e) => return Err(BridgeError::Parse(format!("xml error: {e}"))),
        }
        buf.clear();
    }
    Ok(out)
}

pub fn parse_detail(xml: &str) -> Result<Detail> {
    let elements = collect_element_texts(xml)?;
    let mut detail = Detail::default();

    for (tag, text) in &elements {
        match tag.as_str() {
            "Call" => {
                let fields = split_csv_line(text)?;
                if fields.is_empty() {
                    continue;
                }
                warn_if_short("Call", &fields, CALL_FIELDS);
                detail.call_id = field(&fields, 0);
                detail.state_code = field_u32(&fields, 1);
                detail.stamp = field_i64(&fields, 2);
                detail.conn_stamp = field_i64(&fields, 3);
                detail.end_stamp = field_i64(&fields, 4);
                detail.account_code = field(&fields, 5);
            }
            "PartyA" => {
                let fields = split_csv_line(text)?;
                warn_if_short("PartyA", &fields, PARTY_FIELDS);
                detail.party_a = party_from_fields(&fields);
            }
            "PartyB" => {
                let fields = split_csv_line(text)?;
                warn_if_short("PartyB", &fields, PARTY_FIELDS);
                detail.party_b = party_from_fields(&fields);
            }
            "Target" => {
                let fields = split_csv_line(text)?;
                warn_if_short("Target", &fields, PARTY_FIELDS);
                detail.targets.push(party_from_fields(&fields));
            }
            _ => {}
        }
    }

    if detail.call_id.is_empty() {
        return Err(BridgeError::Parse(
            "Detail (CSV form) record missing CallID".into(),
        ));
    }
    Ok(detail)
}

pub fn parse_call_lost(xml: &str) -> Result<CallLost> {
    let elements = collect_element_texts(xml)?;
    let (_, text) = elements
        .into_iter()
        .find(|(tag, _)| tag == "CallLost")
        .ok_or_else(|| BridgeError::Parse("CallLost element missing".into()))?;
    let fields = split_csv_line(&text)?;
    warn_if_short("CallLost", &fields, CALL_LOST_FIELDS);
    Ok(CallLost {
        call_id: field(&fields, 0),
        cause: field_u32(&fields, 1),
        stamp: field_i64(&fields, 2),
    })
}

pub fn parse_link_lost(xml: &str) -> Result<LinkLost> {
    let elements = collect_element_texts(xml)?;
    let (_, text) = elements
        .into_iter()
        .find(|(tag, _)| tag == "LinkLost")
        .ok_or_else(|| BridgeError::Parse("LinkLost element missing".into()))?;
    let fields = split_csv_line(&text)?;
    warn_if_short("LinkLost", &fields, LINK_LOST_FIELDS);
    Ok(LinkLost {
        stamp: field_i64(&fields, 0),
        reason: field(&fields, 1),
    })
}

pub fn parse_attempt_reject(xml: &str) -> Result<AttemptReject> {
    let elements = collect_element_texts(xml)?;
    let (_, text) = elements
        .into_iter()
        .find(|(tag, _)| tag == "AttemptReject")
        .ok_or_else(|| BridgeError::Parse("AttemptReject element missing".into()))?;
    let fields = split_csv_line(&text)?;
    warn_if_short("AttemptReject", &fields, ATTEMPT_REJECT_FIELDS);
    Ok(AttemptReject {
        call_id: field(&fields, 0),
        target: field(&fields, 1),
        cause: field_u32(&fields, 2),
        stamp: field_i64(&fields, 3),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_detail_csv_form() {
        let xml = "<Detail>\
            <Call>12345,2,1707573600,1707573610,0,ACC1</Call>\
            <PartyA>10,2001,Alice,2001,I</PartyA>\
            <PartyB>5,5550100,,T1,</PartyB>\
            <Target_list><Target>10,2002,Bob,2002,</Target><Target>10,2003,Carl,2003,</Target></Target_list>\
            </Detail>";
        let detail = parse_detail(xml).unwrap();
        assert_eq!(detail.call_id, "12345");
        assert_eq!(detail.state_code, 2);
        assert_eq!(detail.party_a.number, "2001");
        assert_eq!(detail.targets.len(), 2);
        assert_eq!(detail.targets[1].name, "Carl");
    }

    #[test]
    fn respects_quoted_commas_in_csv_fields() {
        let xml = r#"<Detail><Call>12345,2,1707573600,1707573610,0,"ACC,EXTRA"</Call></Detail>"#;
        let detail = parse_detail(xml).unwrap();
        assert_eq!(detail.account_code, "ACC,EXTRA");
    }

    #[test]
    fn short_call_row_still_parses_present_fields() {
        let xml = "<Detail><Call>12345,2</Call></Detail>";
        let detail = parse_detail(xml).unwrap();
        assert_eq!(detail.call_id, "12345");
        assert_eq!(detail.state_code, 2);
        assert_eq!(detail.stamp, 0);
    }

    #[test]
    fn parses_call_lost_csv_form() {
        let xml = "<CallLost>12345,16,1707573700</CallLost>";
        let lost = parse_call_lost(xml).unwrap();
        assert_eq!(lost.call_id, "12345");
        assert_eq!(lost.cause, 16);
    }
}
