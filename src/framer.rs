//! DevLink3 frame codec (spec §4.1).
//!
//! Wire format: `[0x49 magic][length: 2 or 3 bytes BE][type: u32 BE]
//! [request_id: u32 BE][payload]`.
//!
//! The decoder is a stream accumulator: callers push arbitrary chunks and
//! drain zero or more complete frames per chunk. It never allocates a fresh
//! concatenated buffer per chunk — only when a header needs bytes that
//! straddle more than one pushed chunk.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::{BridgeError, Result};

pub const MAGIC: u8 = 0x49;
const MAX_SHORT_LEN: usize = 0x7FFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub packet_type: u32,
    pub request_id: u32,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    FrameTooLarge,
    BadMagic,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::FrameTooLarge => write!(f, "frame body exceeds 0x7FFF bytes"),
            FrameError::BadMagic => write!(f, "bad magic byte"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Encode a single frame. Rejects bodies that would require the reserved
/// oversize-length encoding (spec §4.1: "encoder rejects frames > 0x7FFF").
pub fn encode(packet_type: u32, request_id: u32, body: &[u8]) -> std::result::Result<Vec<u8>, FrameError> {
    let total_len = 4 + 4 + body.len(); // type + request_id + payload
    if total_len > MAX_SHORT_LEN {
        return Err(FrameError::FrameTooLarge);
    }

    let mut out = Vec::with_capacity(1 + 2 + total_len);
    out.push(MAGIC);
    out.write_u16::<BigEndian>(total_len as u16).unwrap();
    out.write_u32::<BigEndian>(packet_type).unwrap();
    out.write_u32::<BigEndian>(request_id).unwrap();
    out.extend_from_slice(body);
    Ok(out)
}

/// Streaming decoder. Tolerant of desynchronization: on a bad magic byte it
/// scans forward for the next `0x49` rather than treating the connection as
/// fatally broken (spec §4.1/§7: framing errors resync, never kill the
/// connection).
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed a chunk of bytes read off the socket. Returns every complete
    /// frame that can now be extracted, plus a count of bytes skipped while
    /// resynchronizing (for a caller that wants to log/count it).
    pub fn push(&mut self, chunk: &[u8]) -> (Vec<Frame>, usize) {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        let mut skipped = 0usize;

        loop {
            if self.buf.is_empty() {
                break;
            }

            if self.buf[0] != MAGIC {
                // Scan forward to the next magic byte.
                let resync_at = self.buf.iter().skip(1).position(|&b| b == MAGIC);
                match resync_at {
                    Some(offset) => {
                        let drop_count = offset + 1;
                        self.buf.drain(0..drop_count);
                        skipped += drop_count;
                        continue;
                    }
                    None => {
                        // No magic anywhere in the remaining buffer; keep
                        // the last byte in case it's a split magic byte on
                        // the next chunk, drop the rest.
                        skipped += self.buf.len().saturating_sub(1);
                        if self.buf.len() > 1 {
                            let last = *self.buf.last().unwrap();
                            self.buf.clear();
                            if last == MAGIC {
                                self.buf.push(last);
                            }
                        }
                        break;
                    }
                }
            }

            // We have a magic byte at position 0. Determine header size.
            if self.buf.len() < 2 {
                break; // need more bytes to read length prefix
            }

            let first_len_byte = self.buf[1];
            let (header_len, total_len) = if first_len_byte & 0x80 == 0 {
                if self.buf.len() < 3 {
                    break;
                }
                let mut cur = Cursor::new(&self.buf[1..3]);
                let len = cur.read_u16::<BigEndian>().unwrap() as usize;
                (3usize, len)
            } else {
                if self.buf.len() < 4 {
                    break;
                }
                let b1 = self.buf[1];
                let b2 = self.buf[2];
                let b3 = self.buf[3];
                let len = ((b1 as usize & 0x7F) << 15) | ((b2 as usize & 0x7F) << 8) | b3 as usize;
                (4usize, len)
            };

            if total_len < 8 {
                // Malformed: body can't be shorter than type+request_id.
                // Treat as bad magic and resync past this byte.
                self.buf.drain(0..1);
                skipped += 1;
                continue;
            }

            let frame_end = header_len + total_len;
            if self.buf.len() < frame_end {
                break; // incomplete frame, wait for more data
            }

            let mut cur = Cursor::new(&self.buf[header_len..header_len + 8]);
            let packet_type = cur.read_u32::<BigEndian>().unwrap();
            let request_id = cur.read_u32::<BigEndian>().unwrap();
            let body = self.buf[header_len + 8..frame_end].to_vec();

            frames.push(Frame {
                packet_type,
                request_id,
                body,
            });

            self.buf.drain(0..frame_end);
        }

        (frames, skipped)
    }
}

/// Read a single framed request/response pair off a blocking stream,
/// matching the `read_frame`/`write_frame` pattern used for the binary
/// protocol connections elsewhere in this codebase.
pub fn read_frame<R: std::io::Read>(r: &mut R) -> Result<Frame> {
    let mut magic = [0u8; 1];
    r.read_exact(&mut magic)?;
    if magic[0] != MAGIC {
        return Err(BridgeError::Protocol(FrameError::BadMagic.to_string()));
    }

    let mut len_byte = [0u8; 1];
    r.read_exact(&mut len_byte)?;
    let total_len = if len_byte[0] & 0x80 == 0 {
        let mut rest = [0u8; 1];
        r.read_exact(&mut rest)?;
        u16::from_be_bytes([len_byte[0], rest[0]]) as usize
    } else {
        let mut rest = [0u8; 2];
        r.read_exact(&mut rest)?;
        ((len_byte[0] as usize & 0x7F) << 15) | ((rest[0] as usize & 0x7F) << 8) | rest[1] as usize
    };

    if total_len < 8 {
        return Err(BridgeError::Protocol("frame shorter than header".into()));
    }

    let packet_type = r.read_u32::<BigEndian>()?;
    let request_id = r.read_u32::<BigEndian>()?;
    let mut body = vec![0u8; total_len - 8];
    r.read_exact(&mut body)?;

    Ok(Frame {
        packet_type,
        request_id,
        body,
    })
}

pub fn write_frame<W: std::io::Write>(
    w: &mut W,
    packet_type: u32,
    request_id: u32,
    body: &[u8],
) -> Result<()> {
    let bytes = encode(packet_type, request_id, body)
        .map_err(|e| BridgeError::Protocol(e.to_string()))?;
    w.write_all(&bytes)?;
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_round_trips() {
        let body = vec![1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let bytes = encode(0x00300001, 0x1, &body).unwrap();
        let mut decoder = FrameDecoder::new();
        let (frames, skipped) = decoder.push(&bytes);
        assert_eq!(skipped, 0);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].packet_type, 0x00300001);
        assert_eq!(frames[0].request_id, 1);
        assert_eq!(frames[0].body, body);
    }

    #[test]
    fn decoder_handles_chunked_input() {
        let body = vec![0xAAu8; 100];
        let bytes = encode(0x10300011, 42, &body).unwrap();
        let mut decoder = FrameDecoder::new();

        let (frames, _) = decoder.push(&bytes[0..5]);
        assert!(frames.is_empty());

        let (frames, _) = decoder.push(&bytes[5..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].body, body);
    }

    #[test]
    fn decoder_yields_multiple_frames_from_one_chunk() {
        let f1 = encode(1, 1, b"a").unwrap();
        let f2 = encode(2, 2, b"bb").unwrap();
        let mut combined = f1;
        combined.extend_from_slice(&f2);

        let mut decoder = FrameDecoder::new();
        let (frames, _) = decoder.push(&combined);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].packet_type, 1);
        assert_eq!(frames[1].packet_type, 2);
    }

    #[test]
    fn decoder_resyncs_past_garbage_bytes() {
        let mut combined = vec![0xFF, 0xFE, 0xFD];
        combined.extend_from_slice(&encode(7, 7, b"ok").unwrap());

        let mut decoder = FrameDecoder::new();
        let (frames, skipped) = decoder.push(&combined);
        assert_eq!(skipped, 3);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].packet_type, 7);
    }

    #[test]
    fn encode_rejects_oversize_body() {
        let body = vec![0u8; MAX_SHORT_LEN + 1];
        assert_eq!(encode(1, 1, &body), Err(FrameError::FrameTooLarge));
    }

    #[test]
    fn round_trip_any_body_under_32kib() {
        for len in [0usize, 1, 100, 4096, 32 * 1024 - 9] {
            let body = vec![0x5Au8; len];
            let bytes = encode(99, 100, &body).unwrap();
            let mut decoder = FrameDecoder::new();
            let (frames, _) = decoder.push(&bytes);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].body, body);
        }
    }
}
