// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for supervisor/worker stream framing.
//!
//! Each frame on the pipe has the following format:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: message code
//! - N bytes: message body

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (1 MiB). Chunks larger than this must be split by the
/// producer; the codec refuses them outright.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes code)
pub const HEADER_SIZE: usize = 6;

/// Message codes for the wire protocol.
///
/// The numeric values are part of the protocol and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Code {
    /// Worker liveness beacon
    Heartbeat = 1,
    /// Graceful shutdown (supervisor to worker) or suicide notice (worker to supervisor)
    Terminate = 2,
    /// Session dispatch, supervisor to worker
    Invoke = 3,
    /// Session result chunk, worker to supervisor
    Push = 4,
    /// Session failure, worker to supervisor
    Error = 5,
    /// Session end-of-stream, either direction
    Release = 6,
}

impl TryFrom<u16> for Code {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, FrameError> {
        match value {
            1 => Ok(Code::Heartbeat),
            2 => Ok(Code::Terminate),
            3 => Ok(Code::Invoke),
            4 => Ok(Code::Push),
            5 => Ok(Code::Error),
            6 => Ok(Code::Release),
            _ => Err(FrameError::InvalidCode(value)),
        }
    }
}

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message code: {0}")]
    InvalidCode(u16),

    #[error("truncated message body for {0:?}")]
    Truncated(Code),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed message with code and body
#[derive(Debug, Clone)]
pub struct Frame {
    pub code: Code,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame with the given code and body
    pub fn new(code: Code, payload: Bytes) -> Result<Self, FrameError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self { code, payload })
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.code as u16);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a frame from bytes
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        let code = Code::try_from(bytes.get_u16())?;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }

        if bytes.len() < length {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            )));
        }

        let payload = bytes.split_to(length);
        Ok(Self { code, payload })
    }
}

/// Write a frame to an async writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    Ok(())
}

/// Read a frame from an async reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    // Read header
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let code = Code::try_from(u16::from_be_bytes([header[4], header[5]]))?;

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    // Read payload
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        code,
        payload: Bytes::from(payload),
    })
}

/// Framed codec for encoding/decoding frames on a stream
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next frame from the stream
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.stream).await
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    /// Write a frame to the stream
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.stream, frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for &code in &[
            Code::Heartbeat,
            Code::Terminate,
            Code::Invoke,
            Code::Push,
            Code::Error,
            Code::Release,
        ] {
            let value = code as u16;
            let decoded = Code::try_from(value).unwrap();
            assert_eq!(code, decoded);
        }
    }

    #[test]
    fn test_code_values_are_stable() {
        assert_eq!(Code::Heartbeat as u16, 1);
        assert_eq!(Code::Terminate as u16, 2);
        assert_eq!(Code::Invoke as u16, 3);
        assert_eq!(Code::Push as u16, 4);
        assert_eq!(Code::Error as u16, 5);
        assert_eq!(Code::Release as u16, 6);
    }

    #[test]
    fn test_invalid_code_rejected() {
        let err = Code::try_from(0).unwrap_err();
        assert!(matches!(err, FrameError::InvalidCode(0)));
        let err = Code::try_from(7).unwrap_err();
        assert!(matches!(err, FrameError::InvalidCode(7)));
    }

    #[test]
    fn test_frame_encode_decode() {
        let frame = Frame::new(Code::Push, Bytes::from_static(b"payload")).unwrap();
        let encoded = frame.encode();
        let decoded = Frame::decode_from_bytes(encoded).unwrap();

        assert_eq!(frame.code, decoded.code);
        assert_eq!(frame.payload, decoded.payload);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let payload = Bytes::from(vec![0u8; MAX_FRAME_SIZE + 1]);
        let err = Frame::new(Code::Push, payload).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge(_)));
    }

    #[test]
    fn test_decode_incomplete_header() {
        let err = Frame::decode_from_bytes(Bytes::from_static(b"\x00\x00")).unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let frame = Frame::new(Code::Invoke, Bytes::from_static(b"hello")).unwrap();
        write_frame(&mut a, &frame).await.unwrap();

        let decoded = read_frame(&mut b).await.unwrap();
        assert_eq!(decoded.code, Code::Invoke);
        assert_eq!(&decoded.payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_read_after_close_is_connection_closed() {
        let (a, mut b) = tokio::io::duplex(4096);
        drop(a);

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }
}
