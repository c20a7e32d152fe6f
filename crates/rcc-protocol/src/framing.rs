//! Binary-framed message codec.
//!
//! Every frame on every stream is a single-line JSON header terminated by
//! `\n`. When the header describes a payload (its type carries a
//! `payload_len` field), exactly that many raw bytes follow the newline.
//! Streams are single-writer/single-reader by construction, so no frame
//! interleaving can occur.

use std::io::{BufRead, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Chunk size for file transfer payloads.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Maximum size of a single header line (10 MiB). A session with tens of
/// thousands of dependencies still fits comfortably.
const MAX_HEADER_LINE: usize = 10 * 1024 * 1024;

/// Errors from reading or writing frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the stream")]
    Eof,

    #[error("header line exceeds {MAX_HEADER_LINE} bytes")]
    HeaderTooLarge,

    #[error("malformed header: {0}")]
    BadHeader(#[from] serde_json::Error),

    #[error("truncated payload: expected {expected} bytes, got {got}")]
    TruncatedPayload { expected: u64, got: u64 },
}

/// Write one message header line.
pub fn write_message<W: Write, T: Serialize>(w: &mut W, msg: &T) -> Result<(), FrameError> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    w.write_all(&line)?;
    w.flush()?;
    Ok(())
}

/// Read one message header line. Returns [`FrameError::Eof`] on a cleanly
/// closed stream.
pub fn read_message<R: BufRead, T: DeserializeOwned>(r: &mut R) -> Result<T, FrameError> {
    let mut line = Vec::new();
    let n = r
        .by_ref()
        .take(MAX_HEADER_LINE as u64 + 1)
        .read_until(b'\n', &mut line)?;
    if n == 0 {
        return Err(FrameError::Eof);
    }
    if line.len() > MAX_HEADER_LINE {
        return Err(FrameError::HeaderTooLarge);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    Ok(serde_json::from_slice(&line)?)
}

/// Read exactly `len` payload bytes following a header.
pub fn read_payload<R: Read>(r: &mut R, len: u64) -> Result<Vec<u8>, FrameError> {
    let mut buf = vec![0u8; len as usize];
    read_payload_into(r, &mut buf)?;
    Ok(buf)
}

/// Read a payload into a caller-provided buffer (for the reusable chunk
/// buffers held by the long-lived streams).
pub fn read_payload_into<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(FrameError::TruncatedPayload {
                expected: buf.len() as u64,
                got: filled as u64,
            });
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::BufReader;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Chunk {
        id: u32,
        payload_len: u64,
    }

    #[test]
    fn header_and_payload_round_trip() {
        let mut wire = Vec::new();
        let payload = b"the payload\nwith a newline inside";
        write_message(
            &mut wire,
            &Chunk { id: 7, payload_len: payload.len() as u64 },
        )
        .unwrap();
        wire.extend_from_slice(payload);

        let mut r = BufReader::new(wire.as_slice());
        let header: Chunk = read_message(&mut r).unwrap();
        assert_eq!(header, Chunk { id: 7, payload_len: payload.len() as u64 });
        let got = read_payload(&mut r, header.payload_len).unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn consecutive_frames_on_one_stream() {
        let mut wire = Vec::new();
        for id in 0..3u32 {
            write_message(&mut wire, &Chunk { id, payload_len: 4 }).unwrap();
            wire.extend_from_slice(&[id as u8; 4]);
        }
        let mut r = BufReader::new(wire.as_slice());
        for id in 0..3u32 {
            let h: Chunk = read_message(&mut r).unwrap();
            assert_eq!(h.id, id);
            assert_eq!(read_payload(&mut r, 4).unwrap(), vec![id as u8; 4]);
        }
        assert!(matches!(read_message::<_, Chunk>(&mut r), Err(FrameError::Eof)));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut wire = Vec::new();
        write_message(&mut wire, &Chunk { id: 1, payload_len: 100 }).unwrap();
        wire.extend_from_slice(b"short");
        let mut r = BufReader::new(wire.as_slice());
        let _: Chunk = read_message(&mut r).unwrap();
        assert!(matches!(
            read_payload(&mut r, 100),
            Err(FrameError::TruncatedPayload { expected: 100, got: 5 })
        ));
    }

    #[test]
    fn garbage_header_is_an_error() {
        let mut r = BufReader::new(&b"not json at all\n"[..]);
        assert!(matches!(read_message::<_, Chunk>(&mut r), Err(FrameError::BadHeader(_))));
    }
}
