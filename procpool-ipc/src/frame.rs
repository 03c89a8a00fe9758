// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self-delimited command frames on a byte stream.
//!
//! Each frame is a length-prefixed chunk whose body is the bincode encoding
//! of a small envelope: kind byte, correlator, command name, opaque payload.
//! The length prefix comes from [`LengthDelimitedCodec`], so any prefix of
//! the stream decodes to zero or more complete frames plus a remainder.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Opaque tag pairing a request with its response.
pub type Correlator = u64;

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;
const KIND_ERROR: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
    Error,
}

impl FrameKind {
    fn wire_value(self) -> u8 {
        match self {
            FrameKind::Request => KIND_REQUEST,
            FrameKind::Response => KIND_RESPONSE,
            FrameKind::Error => KIND_ERROR,
        }
    }
}

/// One message in the parent<->child stream.
///
/// `command` is only meaningful on requests; responses and errors are routed
/// purely by correlator.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub correlator: Correlator,
    pub command: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(correlator: Correlator, command: impl Into<String>, payload: Bytes) -> Self {
        Frame {
            kind: FrameKind::Request,
            correlator,
            command: command.into(),
            payload,
        }
    }

    pub fn response(correlator: Correlator, payload: Bytes) -> Self {
        Frame {
            kind: FrameKind::Response,
            correlator,
            command: String::new(),
            payload,
        }
    }

    pub fn error(correlator: Correlator, payload: Bytes) -> Self {
        Frame {
            kind: FrameKind::Error,
            correlator,
            command: String::new(),
            payload,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireFrame {
    kind: u8,
    correlator: Correlator,
    command: String,
    payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The stream ended in the middle of a frame.
    #[error("stream ended mid-frame")]
    ShortRead,
    /// The length prefix was sane but the envelope does not decode.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The envelope decoded but carries a kind this peer does not know.
    ///
    /// The offending frame has been consumed and the decoder is still
    /// usable; whether this is fatal is the endpoint's decision.
    #[error("frame carries unknown kind {0:#04x}")]
    UnknownField(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Encoder/decoder for [`Frame`]s.
///
/// All writes of a single endpoint funnel through one instance owned by its
/// writer task, which is what makes frame writes atomic with respect to each
/// other.
#[derive(Debug, Default)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    fn map_length_error(e: io::Error) -> FrameError {
        // LengthDelimitedCodec reports an oversized or invalid length
        // prefix as InvalidData; everything else is a real I/O problem.
        if e.kind() == io::ErrorKind::InvalidData {
            FrameError::Malformed(e.to_string())
        } else {
            FrameError::Io(e)
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let Some(body) = self.inner.decode(src).map_err(Self::map_length_error)? else {
            return Ok(None);
        };
        let wire: WireFrame =
            bincode::deserialize(&body).map_err(|e| FrameError::Malformed(e.to_string()))?;
        let kind = match wire.kind {
            KIND_REQUEST => FrameKind::Request,
            KIND_RESPONSE => FrameKind::Response,
            KIND_ERROR => FrameKind::Error,
            other => return Err(FrameError::UnknownField(other)),
        };
        Ok(Some(Frame {
            kind,
            correlator: wire.correlator,
            command: wire.command,
            payload: wire.payload.into(),
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ShortRead),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let wire = WireFrame {
            kind: frame.kind.wire_value(),
            correlator: frame.correlator,
            command: frame.command,
            payload: frame.payload.into(),
        };
        let body = bincode::serialize(&wire).map_err(|e| FrameError::Malformed(e.to_string()))?;
        self.inner
            .encode(Bytes::from(body), dst)
            .map_err(Self::map_length_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip(frame: Frame) -> Frame {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn request_roundtrip() {
        let frame = Frame::request(7, "echo", Bytes::from_static(b"payload"));
        assert_eq!(frame.clone(), roundtrip(frame));
    }

    #[test]
    fn error_roundtrip_has_no_command() {
        let frame = Frame::error(42, Bytes::from_static(b"oops"));
        let decoded = roundtrip(frame);
        assert_eq!(decoded.kind, FrameKind::Error);
        assert_eq!(decoded.command, "");
    }

    #[test]
    fn partial_frame_yields_nothing_until_complete() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::response(1, Bytes::from_static(b"data")), &mut buf)
            .unwrap();
        let full = buf.split().freeze();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[full.len() - 1..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn eof_mid_frame_is_a_short_read() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::response(1, Bytes::from_static(b"data")), &mut buf)
            .unwrap();
        buf.truncate(buf.len() - 2);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(FrameError::ShortRead)
        ));
    }

    #[test]
    fn garbage_body_is_malformed() {
        let mut inner = LengthDelimitedCodec::new();
        let mut buf = BytesMut::new();
        inner.encode(Bytes::from(vec![0xffu8; 16]), &mut buf).unwrap();
        let mut codec = FrameCodec::default();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_kind_is_preserved_and_nonfatal() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::request(1, "x", Bytes::new()), &mut buf)
            .unwrap();
        // The kind byte sits right behind the 4-byte length prefix.
        buf[4] = 0x7f;
        codec
            .encode(Frame::request(2, "y", Bytes::new()), &mut buf)
            .unwrap();

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::UnknownField(0x7f))
        ));
        // The decoder consumed the bad frame and keeps going.
        let next = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(next.correlator, 2);
    }
}
