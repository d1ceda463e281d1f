// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed RPC messages exchanged between the supervisor and a worker.
//!
//! Every message is a `(code, session-id?, body?)` tuple carried in one
//! frame. Session-scoped messages (`invoke`, `push`, `error`, `release`)
//! lead with the 64-bit session id; the rest of the frame is the body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::frame::{Code, Frame, FrameError, read_frame, write_frame};

/// Termination codes carried by [`Message::Terminate`].
pub mod terminate {
    /// Clean shutdown, nothing went wrong.
    pub const NORMAL: u32 = 0;
    /// The worker is dying because of an unrecoverable condition.
    pub const ABNORMAL: u32 = 1;
}

/// A decoded RPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Worker liveness beacon. No body.
    Heartbeat,
    /// Supervisor to worker: shut down gracefully.
    /// Worker to supervisor: suicide notice with a diagnostic.
    Terminate { code: u32, reason: String },
    /// Dispatch a session to the worker. The payload is opaque to this layer.
    Invoke { session_id: u64, payload: Bytes },
    /// A result chunk for a session.
    Push { session_id: u64, chunk: Bytes },
    /// Session failure with a stable error code and a human-readable reason.
    Error {
        session_id: u64,
        code: u32,
        reason: String,
    },
    /// Normal end-of-stream for a session.
    Release { session_id: u64 },
}

impl Message {
    /// Wire code of this message.
    pub fn code(&self) -> Code {
        match self {
            Message::Heartbeat => Code::Heartbeat,
            Message::Terminate { .. } => Code::Terminate,
            Message::Invoke { .. } => Code::Invoke,
            Message::Push { .. } => Code::Push,
            Message::Error { .. } => Code::Error,
            Message::Release { .. } => Code::Release,
        }
    }

    /// Session id for session-scoped messages, `None` otherwise.
    pub fn session_id(&self) -> Option<u64> {
        match self {
            Message::Invoke { session_id, .. }
            | Message::Push { session_id, .. }
            | Message::Error { session_id, .. }
            | Message::Release { session_id } => Some(*session_id),
            _ => None,
        }
    }

    /// Encode this message into a single frame.
    pub fn into_frame(self) -> Result<Frame, FrameError> {
        let code = self.code();
        let payload = match self {
            Message::Heartbeat => Bytes::new(),
            Message::Terminate { code, reason } => {
                let mut buf = BytesMut::with_capacity(8 + reason.len());
                buf.put_u32(code);
                buf.put_u32(reason.len() as u32);
                buf.put_slice(reason.as_bytes());
                buf.freeze()
            }
            Message::Invoke {
                session_id,
                payload,
            } => {
                let mut buf = BytesMut::with_capacity(8 + payload.len());
                buf.put_u64(session_id);
                buf.put(payload);
                buf.freeze()
            }
            Message::Push { session_id, chunk } => {
                let mut buf = BytesMut::with_capacity(8 + chunk.len());
                buf.put_u64(session_id);
                buf.put(chunk);
                buf.freeze()
            }
            Message::Error {
                session_id,
                code,
                reason,
            } => {
                let mut buf = BytesMut::with_capacity(12 + reason.len());
                buf.put_u64(session_id);
                buf.put_u32(code);
                buf.put_slice(reason.as_bytes());
                buf.freeze()
            }
            Message::Release { session_id } => {
                let mut buf = BytesMut::with_capacity(8);
                buf.put_u64(session_id);
                buf.freeze()
            }
        };
        Frame::new(code, payload)
    }

    /// Decode a message from a frame.
    pub fn from_frame(frame: Frame) -> Result<Self, FrameError> {
        let code = frame.code;
        let mut body = frame.payload;

        match code {
            Code::Heartbeat => Ok(Message::Heartbeat),
            Code::Terminate => {
                if body.remaining() < 8 {
                    return Err(FrameError::Truncated(code));
                }
                let term_code = body.get_u32();
                let len = body.get_u32() as usize;
                if body.remaining() < len {
                    return Err(FrameError::Truncated(code));
                }
                let reason = String::from_utf8_lossy(&body.split_to(len)).into_owned();
                Ok(Message::Terminate {
                    code: term_code,
                    reason,
                })
            }
            Code::Invoke => {
                if body.remaining() < 8 {
                    return Err(FrameError::Truncated(code));
                }
                let session_id = body.get_u64();
                Ok(Message::Invoke {
                    session_id,
                    payload: body,
                })
            }
            Code::Push => {
                if body.remaining() < 8 {
                    return Err(FrameError::Truncated(code));
                }
                let session_id = body.get_u64();
                Ok(Message::Push {
                    session_id,
                    chunk: body,
                })
            }
            Code::Error => {
                if body.remaining() < 12 {
                    return Err(FrameError::Truncated(code));
                }
                let session_id = body.get_u64();
                let error_code = body.get_u32();
                let reason = String::from_utf8_lossy(&body).into_owned();
                Ok(Message::Error {
                    session_id,
                    code: error_code,
                    reason,
                })
            }
            Code::Release => {
                if body.remaining() < 8 {
                    return Err(FrameError::Truncated(code));
                }
                let session_id = body.get_u64();
                Ok(Message::Release { session_id })
            }
        }
    }
}

/// Write a message to an async writer as one frame.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: Message,
) -> Result<(), FrameError> {
    let frame = message.into_frame()?;
    write_frame(writer, &frame).await
}

/// Read the next message from an async reader.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, FrameError> {
    let frame = read_frame(reader).await?;
    Message::from_frame(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) -> Message {
        let frame = message.into_frame().unwrap();
        let bytes = frame.encode();
        let decoded = Frame::decode_from_bytes(bytes).unwrap();
        Message::from_frame(decoded).unwrap()
    }

    #[test]
    fn test_heartbeat_round_trip() {
        assert_eq!(round_trip(Message::Heartbeat), Message::Heartbeat);
    }

    #[test]
    fn test_terminate_round_trip() {
        let message = Message::Terminate {
            code: terminate::ABNORMAL,
            reason: "plugin raised".to_string(),
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_invoke_round_trip() {
        let message = Message::Invoke {
            session_id: 42,
            payload: Bytes::from_static(b"{\"command\":\"once\"}"),
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_push_round_trip() {
        let message = Message::Push {
            session_id: u64::MAX,
            chunk: Bytes::from_static(b"chunk"),
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_error_round_trip() {
        let message = Message::Error {
            session_id: 7,
            code: 4,
            reason: "worker gone".to_string(),
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_release_round_trip() {
        let message = Message::Release { session_id: 9 };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_empty_push_body_is_truncated() {
        let frame = Frame::new(Code::Push, Bytes::new()).unwrap();
        let err = Message::from_frame(frame).unwrap_err();
        assert!(matches!(err, FrameError::Truncated(Code::Push)));
    }

    #[test]
    fn test_short_error_body_is_truncated() {
        // 8-byte session id but no error code
        let frame = Frame::new(Code::Error, Bytes::from(vec![0u8; 8])).unwrap();
        let err = Message::from_frame(frame).unwrap_err();
        assert!(matches!(err, FrameError::Truncated(Code::Error)));
    }

    #[test]
    fn test_session_id_accessor() {
        assert_eq!(Message::Heartbeat.session_id(), None);
        assert_eq!(Message::Release { session_id: 3 }.session_id(), Some(3));
    }

    #[tokio::test]
    async fn test_message_stream_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        write_message(
            &mut a,
            Message::Invoke {
                session_id: 1,
                payload: Bytes::from_static(b"x"),
            },
        )
        .await
        .unwrap();
        write_message(&mut a, Message::Heartbeat).await.unwrap();

        let first = read_message(&mut b).await.unwrap();
        let second = read_message(&mut b).await.unwrap();
        assert_eq!(first.session_id(), Some(1));
        assert_eq!(second, Message::Heartbeat);
    }
}
