//! AuthHandshake (spec §4.2): username submission, SHA1 challenge-response,
//! and the follow-on event-registration request. Modeled as a small
//! explicit state/action function rather than a callback chain (spec §9).

use byteorder::{BigEndian, WriteBytesExt};
use sha1::{Digest, Sha1};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use crate::error::{BridgeError, Result};
use crate::framer::{read_frame, write_frame};
use crate::protocol::{
    PACKET_AUTH, PACKET_AUTH_RESPONSE, PACKET_EVENT_REQUEST, PACKET_EVENT_REQUEST_RESPONSE,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const EVENT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

const AUTH_SUBTYPE_SUBMIT_USER: u32 = 0x0000_0001;
const AUTH_SUBTYPE_RESPOND: u32 = 0x0000_0050;

const RESPONSE_CODE_CHALLENGE: u32 = 0x0000_0002;
const RESPONSE_CODE_FAIL: u32 = 0x8000_0041;
const RESPONSE_CODE_SUCCESS: u32 = 0x0000_0000;

const EVENT_REG_SUCCESS: u32 = 0x0000_0000;
const EVENT_REG_PARTIAL_SUCCESS: u32 = 0x0000_0009;

/// Compute `SHA1(challenge || password_padded)` where `password_padded` is
/// the trimmed password truncated to 16 bytes and zero-padded to exactly
/// 16 bytes (spec §4.2, §8 boundary behaviors).
pub fn challenge_response(challenge: &[u8], password: &str) -> [u8; 20] {
    let trimmed = password.trim();
    let mut padded = [0u8; 16];
    let bytes = trimmed.as_bytes();
    let take = bytes.len().min(16);
    padded[..take].copy_from_slice(&bytes[..take]);

    let mut hasher = Sha1::new();
    hasher.update(challenge);
    hasher.update(padded);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Success,
    Failed(String),
}

/// Run the three-phase handshake over a blocking stream that already
/// frames DevLink3 packets (spec §4.2). The whole exchange is bounded by a
/// single 15s timeout across both round trips.
pub fn perform_handshake<S>(stream: &mut S, username: &str, password: &str) -> Result<AuthOutcome>
where
    S: Read + Write,
{
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;

    // Phase 1: submit username.
    let mut phase1_body = Vec::new();
    phase1_body
        .write_u32::<BigEndian>(AUTH_SUBTYPE_SUBMIT_USER)
        .unwrap();
    phase1_body.extend_from_slice(username.as_bytes());
    phase1_body.push(0); // NUL terminator
    write_frame(stream, PACKET_AUTH, 1, &phase1_body)?;

    if Instant::now() > deadline {
        return Ok(AuthOutcome::Failed("handshake timed out".into()));
    }

    // Phase 2: await challenge.
    let frame = read_frame(stream)?;
    if frame.packet_type != PACKET_AUTH_RESPONSE {
        return Err(BridgeError::Protocol(format!(
            "expected AuthResponse, got {:#010x}",
            frame.packet_type
        )));
    }
    let (_req_id, response_code, challenge) = parse_auth_response(&frame.body)?;

    if response_code == RESPONSE_CODE_FAIL {
        return Ok(AuthOutcome::Failed("server rejected username".into()));
    }
    if response_code != RESPONSE_CODE_CHALLENGE {
        return Err(BridgeError::Protocol(format!(
            "unexpected response code in phase 2: {response_code:#010x}"
        )));
    }

    if Instant::now() > deadline {
        return Ok(AuthOutcome::Failed("handshake timed out".into()));
    }

    // Phase 3: respond with SHA1(challenge || password_padded).
    let hash = challenge_response(&challenge, password);
    let mut phase3_body = Vec::new();
    phase3_body
        .write_u32::<BigEndian>(AUTH_SUBTYPE_RESPOND)
        .unwrap();
    phase3_body.write_u32::<BigEndian>(hash.len() as u32).unwrap();
    phase3_body.extend_from_slice(&hash);
    write_frame(stream, PACKET_AUTH, 2, &phase3_body)?;

    if Instant::now() > deadline {
        return Ok(AuthOutcome::Failed("handshake timed out".into()));
    }

    let frame = read_frame(stream)?;
    if frame.packet_type != PACKET_AUTH_RESPONSE {
        return Err(BridgeError::Protocol(format!(
            "expected AuthResponse, got {:#010x}",
            frame.packet_type
        )));
    }
    let (_req_id, response_code, _challenge) = parse_auth_response(&frame.body)?;

    match response_code {
        RESPONSE_CODE_SUCCESS => Ok(AuthOutcome::Success),
        RESPONSE_CODE_FAIL => Ok(AuthOutcome::Failed("server rejected credentials".into())),
        other => Err(BridgeError::Protocol(format!(
            "unexpected response code in phase 3: {other:#010x}"
        ))),
    }
}

fn parse_auth_response(body: &[u8]) -> Result<(u32, u32, Vec<u8>)> {
    use byteorder::ReadBytesExt;
    let mut cur = std::io::Cursor::new(body);
    let request_id = cur
        .read_u32::<BigEndian>()
        .map_err(|_| BridgeError::Protocol("AuthResponse too short".into()))?;
    let response_code = cur
        .read_u32::<BigEndian>()
        .map_err(|_| BridgeError::Protocol("AuthResponse too short".into()))?;
    let challenge_len = cur
        .read_u32::<BigEndian>()
        .map_err(|_| BridgeError::Protocol("AuthResponse too short".into()))? as usize;
    let pos = cur.position() as usize;
    let challenge = body
        .get(pos..pos + challenge_len)
        .ok_or_else(|| BridgeError::Protocol("AuthResponse challenge truncated".into()))?
        .to_vec();
    Ok((request_id, response_code, challenge))
}

/// Register for the given space-separated event flags, following a
/// successful handshake (spec §4.2). Accepts both full and partial success.
pub fn register_events<S>(stream: &mut S, flags: &str) -> Result<bool>
where
    S: Read + Write,
{
    let deadline = Instant::now() + EVENT_REGISTRATION_TIMEOUT;

    let mut body = Vec::new();
    body.write_u16::<BigEndian>(flags.len() as u16).unwrap();
    body.extend_from_slice(flags.as_bytes());
    body.push(0);
    write_frame(stream, PACKET_EVENT_REQUEST, 1, &body)?;

    if Instant::now() > deadline {
        return Ok(false);
    }

    let frame = read_frame(stream)?;
    if frame.packet_type != PACKET_EVENT_REQUEST_RESPONSE {
        return Err(BridgeError::Protocol(format!(
            "expected EventRequestResponse, got {:#010x}",
            frame.packet_type
        )));
    }

    use byteorder::ReadBytesExt;
    let mut cur = std::io::Cursor::new(&frame.body);
    let code = cur
        .read_u32::<BigEndian>()
        .map_err(|_| BridgeError::Protocol("EventRequestResponse too short".into()))?;

    Ok(code == EVENT_REG_SUCCESS || code == EVENT_REG_PARTIAL_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// An in-memory duplex stream: writes go to `written`, reads come from
    /// a pre-seeded `to_read` buffer. Good enough for exercising the
    /// handshake state machine without a real socket.
    struct MockStream {
        to_read: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.to_read.read(buf)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn encode_auth_response(request_id: u32, response_code: u32, challenge: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u32::<BigEndian>(request_id).unwrap();
        body.write_u32::<BigEndian>(response_code).unwrap();
        body.write_u32::<BigEndian>(challenge.len() as u32).unwrap();
        body.extend_from_slice(challenge);
        crate::framer::encode(PACKET_AUTH_RESPONSE, request_id, &body).unwrap()
    }

    #[test]
    fn challenge_response_matches_zero_challenge_empty_password() {
        let challenge = [0u8; 16];
        let hash = challenge_response(&challenge, "");
        let mut hasher = Sha1::new();
        hasher.update(challenge);
        hasher.update([0u8; 16]);
        let expected = hasher.finalize();
        assert_eq!(&hash[..], &expected[..]);
    }

    #[test]
    fn challenge_response_truncates_long_password() {
        let challenge = [1u8; 16];
        let long = "a".repeat(32);
        let truncated = challenge_response(&challenge, &long[..16]);
        let full = challenge_response(&challenge, &long);
        assert_eq!(truncated, full);
    }

    #[test]
    fn challenge_response_trims_whitespace() {
        let challenge = [2u8; 16];
        let a = challenge_response(&challenge, "secret");
        let b = challenge_response(&challenge, "  secret  ");
        assert_eq!(a, b);
    }

    #[test]
    fn challenge_response_is_deterministic() {
        let challenge: Vec<u8> = (0..16u8).collect();
        let a = challenge_response(&challenge, "test");
        let b = challenge_response(&challenge, "test");
        assert_eq!(a, b);
    }

    #[test]
    fn handshake_happy_path_succeeds() {
        let challenge = [0u8; 16];
        let mut to_read = Vec::new();
        to_read.extend_from_slice(&encode_auth_response(1, RESPONSE_CODE_CHALLENGE, &challenge));
        to_read.extend_from_slice(&encode_auth_response(2, RESPONSE_CODE_SUCCESS, &[]));

        let mut stream = MockStream {
            to_read: Cursor::new(to_read),
            written: Vec::new(),
        };

        let outcome = perform_handshake(&mut stream, "admin", "test").unwrap();
        assert_eq!(outcome, AuthOutcome::Success);
    }

    #[test]
    fn handshake_fails_on_server_rejection() {
        let mut to_read = Vec::new();
        to_read.extend_from_slice(&encode_auth_response(1, RESPONSE_CODE_FAIL, &[]));

        let mut stream = MockStream {
            to_read: Cursor::new(to_read),
            written: Vec::new(),
        };

        let outcome = perform_handshake(&mut stream, "admin", "test").unwrap();
        assert!(matches!(outcome, AuthOutcome::Failed(_)));
    }

    #[test]
    fn event_registration_accepts_partial_success() {
        let mut body = Vec::new();
        body.write_u32::<BigEndian>(EVENT_REG_PARTIAL_SUCCESS).unwrap();
        let frame_bytes = crate::framer::encode(PACKET_EVENT_REQUEST_RESPONSE, 1, &body).unwrap();

        let mut stream = MockStream {
            to_read: Cursor::new(frame_bytes),
            written: Vec::new(),
        };

        assert!(register_events(&mut stream, "-CallDelta3 -CMExtn").unwrap());
    }
}
