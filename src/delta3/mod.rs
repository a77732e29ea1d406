//! Delta3Parser (spec §4.3): parses the XML payload carried in a CallDelta3
//! tuple into one of four record kinds, each available in two wire forms.
//!
//! Dynamic typing over the two wire variants collapses into a single tagged
//! sum (spec §9 REDESIGN FLAGS): `Record` has one shape per record kind,
//! independent of whether the source was attribute form or CSV form.

mod attribute_form;
mod csv_form;
mod types;

pub use types::{AttemptReject, CallLost, Detail, LinkLost, Party, Record};

use regex::Regex;
use std::sync::OnceLock;

use crate::error::snippet;

fn attribute_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\w+\s*=\s*".*?""#).unwrap())
}

/// Numeric call-state code to application `CallState` (spec §4.3).
/// Unmapped codes default to `idle`.
pub fn map_call_state(code: u32) -> crate::domain::CallState {
    use crate::domain::CallState::*;
    match code {
        0 => Idle,
        1 => Ringing,
        2 => Connected,
        3 => Completed,
        4 => Hold,
        5 => Hold,
        6 => Connected,
        7 => Ringing,
        8 => Ringing,
        9 => Ringing,
        10 => Queued,
        11 => Parked,
        12 => Hold,
        13 => Ringing,
        _ => Idle,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquipmentKind {
    Trunk,
    Phone,
    HuntGroup,
    Other,
}

/// Equipment-type code to a coarse classification used to resolve call
/// direction, trunk/agent identity, and hunt-group targets (spec §4.3).
pub fn classify_equipment(eq_type: u32) -> EquipmentKind {
    match eq_type {
        2 | 3 | 4 | 5 | 6 | 7 => EquipmentKind::Trunk,
        8 | 9 | 10 | 12 | 13 | 28 => EquipmentKind::Phone,
        15 => EquipmentKind::HuntGroup,
        _ => EquipmentKind::Other,
    }
}

/// Parse one top-level Delta3 XML document into a `Record`. Never panics on
/// malformed input: returns `None` and logs a 100-char snippet instead
/// (spec §4.3, §7).
pub fn parse(xml: &str) -> Option<Record> {
    match parse_inner(xml) {
        Ok(Some(record)) => Some(record),
        Ok(None) => {
            tracing::warn!(snippet = %snippet(xml.as_bytes()), "unrecognized Delta3 top-level tag");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, snippet = %snippet(xml.as_bytes()), "failed to parse Delta3 record");
            None
        }
    }
}

fn parse_inner(xml: &str) -> crate::error::Result<Option<Record>> {
    let trimmed = xml.trim();
    let top_tag = top_level_tag(trimmed).ok_or_else(|| {
        crate::error::BridgeError::Parse("no top-level XML element found".into())
    })?;

    match top_tag.as_str() {
        "Detail" => {
            if is_attribute_form(trimmed, "Call") {
                attribute_form::parse_detail(trimmed).map(|d| Some(Record::Detail(d)))
            } else {
                csv_form::parse_detail(trimmed).map(|d| Some(Record::Detail(d)))
            }
        }
        "CallLost" => {
            if is_attribute_form(trimmed, "CallLost") {
                attribute_form::parse_call_lost(trimmed).map(|r| Some(Record::CallLost(r)))
            } else {
                csv_form::parse_call_lost(trimmed).map(|r| Some(Record::CallLost(r)))
            }
        }
        "LinkLost" => {
            if is_attribute_form(trimmed, "LinkLost") {
                attribute_form::parse_link_lost(trimmed).map(|r| Some(Record::LinkLost(r)))
            } else {
                csv_form::parse_link_lost(trimmed).map(|r| Some(Record::LinkLost(r)))
            }
        }
        "AttemptReject" => {
            if is_attribute_form(trimmed, "AttemptReject") {
                attribute_form::parse_attempt_reject(trimmed)
                    .map(|r| Some(Record::AttemptReject(r)))
            } else {
                csv_form::parse_attempt_reject(trimmed).map(|r| Some(Record::AttemptReject(r)))
            }
        }
        _ => Ok(None),
    }
}

fn top_level_tag(xml: &str) -> Option<String> {
    let start = xml.find('<')? + 1;
    let rest = &xml[start..];
    let end = rest.find(|c: char| c.is_whitespace() || c == '>' || c == '/')?;
    Some(rest[..end].to_string())
}

/// Inspect the inner element named `inner_tag` (or the outer tag itself for
/// the three informational record kinds) for an attribute pattern. Its
/// presence means attribute form; its absence means CSV form (spec §4.3).
fn is_attribute_form(xml: &str, inner_tag: &str) -> bool {
    let search_region = match find_element_open_tag(xml, inner_tag) {
        Some(region) => region,
        None => xml,
    };
    attribute_pattern().is_match(search_region)
}

fn find_element_open_tag<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let needle = format!("<{tag}");
    let start = xml.find(&needle)?;
    let rest = &xml[start..];
    let end = rest.find('>')? + 1;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_call_states() {
        assert_eq!(map_call_state(0), crate::domain::CallState::Idle);
        assert_eq!(map_call_state(2), crate::domain::CallState::Connected);
        assert_eq!(map_call_state(10), crate::domain::CallState::Queued);
        assert_eq!(map_call_state(11), crate::domain::CallState::Parked);
    }

    #[test]
    fn unknown_call_state_defaults_to_idle() {
        assert_eq!(map_call_state(999), crate::domain::CallState::Idle);
    }

    #[test]
    fn classifies_trunk_and_phone_equipment() {
        assert_eq!(classify_equipment(5), EquipmentKind::Trunk);
        assert_eq!(classify_equipment(10), EquipmentKind::Phone);
        assert_eq!(classify_equipment(2), EquipmentKind::Trunk);
        assert_eq!(classify_equipment(28), EquipmentKind::Phone);
        assert_eq!(classify_equipment(999), EquipmentKind::Other);
    }

    #[test]
    fn discriminates_attribute_form() {
        let xml = r#"<Detail><Call CallID="1" State="2"/></Detail>"#;
        assert!(is_attribute_form(xml, "Call"));
    }

    #[test]
    fn discriminates_csv_form() {
        let xml = "<Detail><Call>1,2,1707573600</Call></Detail>";
        assert!(!is_attribute_form(xml, "Call"));
    }

    #[test]
    fn unrecognized_top_level_tag_returns_none() {
        assert!(parse("<Bogus/>").is_none());
    }

    #[test]
    fn malformed_input_returns_none_without_panicking() {
        assert!(parse("not xml at all <<<").is_none());
        assert!(parse("").is_none());
    }
}
