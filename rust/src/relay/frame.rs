//! Binary framing for streamed command output.
//!
//! ```text
//! +-----+----------------+-------------------+
//! | tag | length (u32 BE)| payload (length)  |
//! +-----+----------------+-------------------+
//! ```
//!
//! A stream is one `Header`, any number of `Stdout`/`Stderr` chunks, and one
//! `Trailer`. Output bytes travel inside length-delimited payloads, so no
//! byte sequence produced by a child can be read back as a control record.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::relay::process::ExitReport;

pub const CONTENT_TYPE: &str = "application/vnd.cmdstream.frames";
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;
const TAG_HEADER: u8 = 0x01;
const TAG_STDOUT: u8 = 0x02;
const TAG_STDERR: u8 = 0x03;
const TAG_TRAILER: u8 = 0x04;

/// Audit record sent ahead of any output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    pub request_id: String,
    pub endpoint: String,
    pub argv: Vec<String>,
    pub command_line: String,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Header(StreamHeader),
    Stdout(Bytes),
    Stderr(Bytes),
    Trailer(ExitReport),
}

impl Frame {
    fn tag(&self) -> u8 {
        match self {
            Self::Header(_) => TAG_HEADER,
            Self::Stdout(_) => TAG_STDOUT,
            Self::Stderr(_) => TAG_STDERR,
            Self::Trailer(_) => TAG_TRAILER,
        }
    }

    /// Encodes a single frame into its own buffer.
    pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::new();
        FrameCodec::default().encode(self.clone(), &mut buf)?;
        Ok(buf.freeze())
    }
}

#[derive(Debug)]
pub enum FrameError {
    UnknownTag(u8),
    TooLarge(usize),
    Json(serde_json::Error),
    Io(std::io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTag(tag) => write!(f, "Unknown frame tag 0x{tag:02x}"),
            Self::TooLarge(len) => write!(
                f,
                "Frame payload of {len} bytes exceeds limit of {MAX_FRAME_PAYLOAD}"
            ),
            Self::Json(err) => write!(f, "Invalid frame JSON: {err}"),
            Self::Io(err) => write!(f, "Frame I/O error: {err}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for FrameError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let tag = frame.tag();
        let payload = match frame {
            Frame::Header(header) => Bytes::from(serde_json::to_vec(&header)?),
            Frame::Stdout(bytes) | Frame::Stderr(bytes) => bytes,
            Frame::Trailer(report) => Bytes::from(serde_json::to_vec(&report)?),
        };
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameError::TooLarge(payload.len()));
        }
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(tag);
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let tag = src[0];
        if !matches!(tag, TAG_HEADER | TAG_STDOUT | TAG_STDERR | TAG_TRAILER) {
            return Err(FrameError::UnknownTag(tag));
        }
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > MAX_FRAME_PAYLOAD {
            return Err(FrameError::TooLarge(len));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        let frame = match tag {
            TAG_HEADER => Frame::Header(serde_json::from_slice(&payload)?),
            TAG_STDOUT => Frame::Stdout(payload),
            TAG_STDERR => Frame::Stderr(payload),
            _ => Frame::Trailer(serde_json::from_slice(&payload)?),
        };
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::process::ExitOutcome;

    fn encode_all(frames: Vec<Frame>) -> BytesMut {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        for frame in frames {
            codec.encode(frame, &mut buf).expect("encode frame");
        }
        buf
    }

    #[test]
    fn output_that_looks_like_control_markers_stays_output() {
        let nasty = Bytes::from_static(b"*exitcode^0*\x04\x00\x00\x00\x02{}");
        let mut buf = encode_all(vec![Frame::Stdout(nasty.clone())]);
        let decoded = FrameCodec.decode(&mut buf).expect("decode").expect("frame");
        assert_eq!(decoded, Frame::Stdout(nasty));
        assert!(buf.is_empty());
    }

    #[test]
    fn decoder_waits_for_complete_payload() {
        let full = encode_all(vec![Frame::Stderr(Bytes::from_static(b"warning\n"))]);
        let mut partial = BytesMut::from(&full[..7]);
        assert!(FrameCodec.decode(&mut partial).expect("decode").is_none());
        partial.extend_from_slice(&full[7..]);
        let frame = FrameCodec.decode(&mut partial).expect("decode").expect("frame");
        assert_eq!(frame, Frame::Stderr(Bytes::from_static(b"warning\n")));
    }

    #[test]
    fn header_and_trailer_carry_json() {
        let header = StreamHeader {
            request_id: "req-1".to_string(),
            endpoint: "bamcheck".to_string(),
            argv: vec!["/bin/echo".to_string(), "a b".to_string()],
            command_line: "/bin/echo 'a b'".to_string(),
            pid: Some(42),
        };
        let report = ExitReport {
            outcome: ExitOutcome::Exited { code: 3 },
            duration_ms: 10,
            stdout_bytes: 1,
            stderr_bytes: 0,
        };
        let mut buf = encode_all(vec![
            Frame::Header(header.clone()),
            Frame::Trailer(report.clone()),
        ]);
        assert_eq!(
            FrameCodec.decode(&mut buf).expect("decode"),
            Some(Frame::Header(header))
        );
        assert_eq!(
            FrameCodec.decode(&mut buf).expect("decode"),
            Some(Frame::Trailer(report))
        );
        assert_eq!(FrameCodec.decode(&mut buf).expect("decode"), None);
    }

    #[test]
    fn decoder_rejects_unknown_tags_and_oversize_lengths() {
        let mut unknown = BytesMut::from(&[0x09u8, 0, 0, 0, 0][..]);
        assert!(matches!(
            FrameCodec.decode(&mut unknown),
            Err(FrameError::UnknownTag(0x09))
        ));

        let mut oversize = BytesMut::new();
        oversize.put_u8(TAG_STDOUT);
        oversize.put_u32(u32::MAX);
        assert!(matches!(
            FrameCodec.decode(&mut oversize),
            Err(FrameError::TooLarge(_))
        ));
    }
}
