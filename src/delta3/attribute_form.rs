//! Attribute-form Delta3 parsing: every field rides as an XML attribute on
//! inner elements `Call`, `PartyA`, `PartyB`, `Target` (spec §4.3).

use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use super::types::{AttemptReject, CallLost, Detail, LinkLost, Party};
use crate::error::{BridgeError, Result};

type Attrs = HashMap<String, String>;

/// Walk the document collecting every element's tag name and attribute map,
/// in document order. Good enough for this flat, non-nested-by-name shape.
fn collect_elements(xml: &str) -> Result<Vec<(String, Attrs)>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut out = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let mut attrs = Attrs::new();
                for a in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
                    let value = a.unescape_value().unwrap_or_default().into_owned();
                    attrs.insert(key, value);
                }
                out.push((name, attrs));
            }
            Ok(_) => {}
            Err(e) => return Err(BridgeError::Parse(format!("xml error: {e}"))),
        }
        buf.clear();
    }
    Ok(out)
}

fn attr_str(attrs: &Attrs, key: &str) -> String {
    attrs.get(key).cloned().unwrap_or_default()
}

fn attr_u32(attrs: &Attrs, key: &str) -> u32 {
    attrs.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn attr_i64(attrs: &Attrs, key: &str) -> i64 {
    attrs.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn party_from_attrs(attrs: &Attrs) -> Party {
    Party {
        eq_type: attr_u32(attrs, "EqType"),
        number: attr_str(attrs, "Number"),
        name: attr_str(attrs, "Name"),
        id: attr_str(attrs, "Id"),
        direction_hint: attr_str(attrs, "Dir"),
    }
}

pub fn parse_detail(xml: &str) -> Result<Detail> {
    let elements = collect_elements(xml)?;
    let mut detail = Detail::default();

    for (tag, attrs) in &elements {
        match tag.as_str() {
            "Call" => {
                detail.call_id = attr_str(attrs, "CallID");
                detail.state_code = attr_u32(attrs, "State");
                detail.stamp = attr_i64(attrs, "Stamp");
                detail.conn_stamp = attr_i64(attrs, "ConnStamp");
                detail.end_stamp = attr_i64(attrs, "EndStamp");
                detail.account_code = attr_str(attrs, "AccountCode");
            }
            "PartyA" => detail.party_a = party_from_attrs(attrs),
            "PartyB" => detail.party_b = party_from_attrs(attrs),
            "Target" => detail.targets.push(party_from_attrs(attrs)),
            _ => {}
        }
    }

    if detail.call_id.is_empty() {
        return Err(BridgeError::Parse("Detail record missing CallID".into()));
    }
    Ok(detail)
}

pub fn parse_call_lost(xml: &str) -> Result<CallLost> {
    let elements = collect_elements(xml)?;
    let (_, attrs) = elements
        .into_iter()
        .find(|(tag, _)| tag == "CallLost")
        .ok_or_else(|| BridgeError::Parse("CallLost element missing".into()))?;
    Ok(CallLost {
        call_id: attr_str(&attrs, "CallID"),
        cause: attr_u32(&attrs, "Cause"),
        stamp: attr_i64(&attrs, "Stamp"),
    })
}

pub fn parse_link_lost(xml: &str) -> Result<LinkLost> {
    let elements = collect_elements(xml)?;
    let (_, attrs) = elements
        .into_iter()
        .find(|(tag, _)| tag == "LinkLost")
        .ok_or_else(|| BridgeError::Parse("LinkLost element missing".into()))?;
    Ok(LinkLost {
        stamp: attr_i64(&attrs, "Stamp"),
        reason: attr_str(&attrs, "Reason"),
    })
}

pub fn parse_attempt_reject(xml: &str) -> Result<AttemptReject> {
    let elements = collect_elements(xml)?;
    let (_, attrs) = elements
        .into_iter()
        .find(|(tag, _)| tag == "AttemptReject")
        .ok_or_else(|| BridgeError::Parse("AttemptReject element missing".into()))?;
    Ok(AttemptReject {
        call_id: attr_str(&attrs, "CallID"),
        target: attr_str(&attrs, "Target"),
        cause: attr_u32(&attrs, "Cause"),
        stamp: attr_i64(&attrs, "Stamp"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_detail_with_parties_and_targets() {
        let xml = r#"<Detail>
            <Call CallID="12345" State="2" Stamp="1707573600" ConnStamp="1707573610" EndStamp="0"/>
            <PartyA EqType="10" Number="2001" Name="Alice" Id="2001" Dir="I"/>
            <PartyB EqType="5" Number="5550100" Name="" Id="T1"/>
            <Target EqType="10" Number="2002" Name="Bob" Id="2002"/>
            <Target EqType="10" Number="2003" Name="Carl" Id="2003"/>
        </Detail>"#;
        let detail = parse_detail(xml).unwrap();
        assert_eq!(detail.call_id, "12345");
        assert_eq!(detail.state_code, 2);
        assert_eq!(detail.party_a.number, "2001");
        assert_eq!(detail.party_b.eq_type, 5);
        assert_eq!(detail.targets.len(), 2);
        assert_eq!(detail.targets[0].name, "Bob");
        assert_eq!(detail.targets[1].name, "Carl");
    }

    #[test]
    fn missing_call_id_is_an_error() {
        let xml = r#"<Detail><Call State="2"/></Detail>"#;
        assert!(parse_detail(xml).is_err());
    }

    #[test]
    fn parses_call_lost() {
        let xml = r#"<CallLost CallID="12345" Cause="16" Stamp="1707573700"/>"#;
        let lost = parse_call_lost(xml).unwrap();
        assert_eq!(lost.call_id, "12345");
        assert_eq!(lost.cause, 16);
        assert_eq!(lost.stamp, 1707573700);
    }
}
