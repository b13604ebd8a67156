//! Length-prefixed framing.
//!
//! A frame is a `u32` little-endian payload length followed by exactly that
//! many bytes of bincode-serialized [`Envelope`]. A single `read` is not
//! guaranteed to return a whole frame, so reads loop until satisfied.

use crate::connection::CloseReason;
use crate::error::Error;
use crate::proto::{Envelope, MAX_FRAME_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{ErrorKind, Read, Write};

/// Serialize an envelope into a ready-to-send frame.
pub fn encode(envelope: &Envelope) -> Result<Bytes, Error> {
    let payload = bincode::serialize(envelope)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(payload.len(), MAX_FRAME_LEN));
    }

    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32_le(payload.len() as u32);
    frame.put_slice(&payload);
    Ok(frame.freeze())
}

/// Deserialize a frame payload (the bytes after the length prefix).
pub fn decode(payload: &[u8]) -> Result<Envelope, Error> {
    Ok(bincode::deserialize(payload)?)
}

/// Write one frame, fully, under the caller's write lock.
pub fn write_frame<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<(), Error> {
    let frame = encode(envelope)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame, blocking.
///
/// Distinguishes three non-success outcomes:
/// * clean EOF at a frame boundary: `ConnectionClosed(Normal)`,
/// * EOF or a hard error mid-frame: `ShortRead` / the IO error,
/// * a receive timeout before any byte of the header arrived:
///   `RecvTimeout`, recoverable, so the caller can check its end flag and
///   retry. A timeout mid-frame keeps reading: the peer already committed
///   to this frame.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Envelope, Error> {
    let mut header = [0u8; 4];
    read_exact_or_eof(reader, &mut header, true)?;

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len, MAX_FRAME_LEN));
    }

    let mut payload = vec![0u8; len];
    read_exact_or_eof(reader, &mut payload, false)?;
    decode(&payload)
}

/// Fill `buf` completely.
///
/// * `at_boundary`: a clean EOF before the first byte means the peer hung
///   up between frames (`ConnectionClosed(Normal)`); anywhere else it is a
///   `ShortRead`. A timeout at the boundary is surfaced as `RecvTimeout`.
fn read_exact_or_eof<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    at_boundary: bool,
) -> Result<(), Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                if at_boundary && filled == 0 {
                    return Err(Error::ConnectionClosed(CloseReason::Normal));
                }
                return Err(Error::ShortRead {
                    got: filled,
                    want: buf.len(),
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                if at_boundary && filled == 0 {
                    return Err(Error::RecvTimeout);
                }
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Announce, Body, DebugCommand, Reply, ReplyData, Version};
    use std::io::Cursor;

    fn roundtrip(envelope: Envelope) {
        let frame = encode(&envelope).unwrap();
        let mut cursor = Cursor::new(frame.to_vec());
        let got = read_frame(&mut cursor).unwrap();
        assert_eq!(got, envelope);
    }

    #[test]
    fn frame_roundtrip_all_kinds() {
        roundtrip(Envelope::new(
            1,
            Body::Announce(Announce {
                id: crate::proto::PROTO_ID,
                client_name: "test".into(),
                version: Version::current(),
            }),
        ));
        roundtrip(Envelope::new(2, Body::ProcessInfo));
        roundtrip(Envelope::new(3, Body::GlFunctions));
        roundtrip(Envelope::new(4, Body::FunctionCall { thread_id: 7 }));
        roundtrip(Envelope::new(
            5,
            Body::Execution(crate::proto::Execution {
                thread_id: 7,
                mode: 1,
                policy: 3,
                target: Some("glFinish".into()),
            }),
        ));
        roundtrip(Envelope::new(
            6,
            Body::DebugCommand {
                thread_id: 7,
                command: DebugCommand::CallOriginalAndProceed,
            },
        ));
        roundtrip(Envelope::reply_to(
            6,
            Reply::ok("welcome", ReplyData::None),
        ));
    }

    #[test]
    fn oversize_length_rejected_without_payload_read() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_le_bytes());
        // no payload present at all: length check must fire first
        let mut cursor = Cursor::new(frame);
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge(_, _)));
    }

    #[test]
    fn eof_at_boundary_is_normal_close() {
        let mut cursor = Cursor::new(Vec::new());
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(
            err,
            Error::ConnectionClosed(CloseReason::Normal)
        ));
    }

    #[test]
    fn eof_mid_frame_is_short_read() {
        let envelope = Envelope::new(9, Body::ProcessInfo);
        let frame = encode(&envelope).unwrap();
        let truncated = frame[..frame.len() - 1].to_vec();
        let mut cursor = Cursor::new(truncated);
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(err, Error::ShortRead { .. }));
    }
}
