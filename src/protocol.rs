//! DevLink3 packet type constants and the outer event-payload tuple layout
//! (spec §6).

use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{BridgeError, Result};

pub const PACKET_TEST: u32 = 0x002A_0001;
pub const PACKET_TEST_ACK: u32 = 0x802A_0001;
pub const PACKET_AUTH: u32 = 0x0030_0001;
pub const PACKET_AUTH_RESPONSE: u32 = 0x8030_0001;
pub const PACKET_EVENT_REQUEST: u32 = 0x0030_0011;
pub const PACKET_EVENT_REQUEST_RESPONSE: u32 = 0x8030_0011;
pub const PACKET_EVENT: u32 = 0x1030_0011;

/// CallDelta3 tuple code inside an Event payload; the only tuple this
/// core path decodes (spec §6). Other tuple codes are accepted and
/// skipped.
pub const TUPLE_CALL_DELTA3: u32 = 0x0076_0001;

/// A single `[tuple_code:4][data_len:2][data]` tuple from an Event payload.
#[derive(Debug, Clone)]
pub struct EventTuple {
    pub tuple_code: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct EventPayload {
    pub request_id: u32,
    pub pbx_ip: [u8; 4],
    pub counter: u32,
    pub tuples: Vec<EventTuple>,
}

/// Parse the body of a `Event` frame: `[request_id:4][pbx_ip:4][counter:4]
/// [tuples...]`.
pub fn parse_event_payload(body: &[u8]) -> Result<EventPayload> {
    let mut cur = Cursor::new(body);
    let request_id = cur
        .read_u32::<BigEndian>()
        .map_err(|_| BridgeError::Protocol("event payload too short for header".into()))?;
    let mut pbx_ip = [0u8; 4];
    std::io::Read::read_exact(&mut cur, &mut pbx_ip)
        .map_err(|_| BridgeError::Protocol("event payload too short for pbx_ip".into()))?;
    let counter = cur
        .read_u32::<BigEndian>()
        .map_err(|_| BridgeError::Protocol("event payload too short for counter".into()))?;

    let mut tuples = Vec::new();
    loop {
        let tuple_code = match cur.read_u32::<BigEndian>() {
            Ok(v) => v,
            Err(_) => break, // no more tuples
        };
        let data_len = cur
            .read_u16::<BigEndian>()
            .map_err(|_| BridgeError::Protocol("truncated tuple length".into()))?
            as usize;
        let pos = cur.position() as usize;
        let data_slice = body
            .get(pos..pos + data_len)
            .ok_or_else(|| BridgeError::Protocol("truncated tuple data".into()))?;
        tuples.push(EventTuple {
            tuple_code,
            data: data_slice.to_vec(),
        });
        cur.set_position((pos + data_len) as u64);
    }

    Ok(EventPayload {
        request_id,
        pbx_ip,
        counter,
        tuples,
    })
}

/// Extract the NUL-terminated UTF-8 XML carried in a CallDelta3 tuple, if
/// present.
pub fn call_delta3_xml(payload: &EventPayload) -> Option<String> {
    payload
        .tuples
        .iter()
        .find(|t| t.tuple_code == TUPLE_CALL_DELTA3)
        .map(|t| {
            let bytes = match t.data.iter().position(|&b| b == 0) {
                Some(nul_at) => &t.data[..nul_at],
                None => &t.data[..],
            };
            String::from_utf8_lossy(bytes).into_owned()
        })
}

/// Outbound request ids are serialized as 8 ASCII hex digits interpreted
/// as 4 bytes (spec §4.4). We keep request ids as plain u32 internally and
/// only render this form when the wire requires it (none of our outbound
/// packets currently do, but the helper matches the documented behavior so
/// callers crossing into raw socket text don't have to reimplement it).
pub fn request_id_hex(request_id: u32) -> String {
    format!("{request_id:08X}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_payload_with_one_tuple() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes()); // request_id
        body.extend_from_slice(&[10, 0, 0, 1]); // pbx_ip
        body.extend_from_slice(&7u32.to_be_bytes()); // counter
        body.extend_from_slice(&TUPLE_CALL_DELTA3.to_be_bytes());
        let xml = b"<Detail/>\0";
        body.extend_from_slice(&(xml.len() as u16).to_be_bytes());
        body.extend_from_slice(xml);

        let parsed = parse_event_payload(&body).unwrap();
        assert_eq!(parsed.request_id, 1);
        assert_eq!(parsed.counter, 7);
        assert_eq!(parsed.tuples.len(), 1);
        assert_eq!(call_delta3_xml(&parsed).unwrap(), "<Detail/>");
    }

    #[test]
    fn request_id_hex_formats_as_eight_digits() {
        assert_eq!(request_id_hex(1), "00000001");
        assert_eq!(request_id_hex(0xDEAD_BEEF), "DEADBEEF");
    }
}
