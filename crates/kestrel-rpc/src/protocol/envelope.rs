//! Envelopes the RPC layer defines itself, independent of the payload codec.

use bytes::{Buf, Bytes, BytesMut};

use super::frame::{peek_varint, put_varint, Frame, TypeTag};
use crate::error::{Result, RpcError};

/// Failure reported by a server-side handler.
///
/// Only the class name and message cross the wire.
///
/// ```text
/// [class-len:varint][class:utf8][message:utf8]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteExceptionEnvelope {
    pub class_name: String,
    pub message: String,
}

impl RemoteExceptionEnvelope {
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + self.class_name.len() + self.message.len());
        put_varint(&mut buf, self.class_name.len() as u32);
        buf.extend_from_slice(self.class_name.as_bytes());
        buf.extend_from_slice(self.message.as_bytes());
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (class_len, prefix) = peek_varint(payload)?
            .ok_or_else(|| RpcError::protocol("remote exception truncated"))?;
        let mut rest = payload;
        rest.advance(prefix);
        let class_len = class_len as usize;
        if rest.len() < class_len {
            return Err(RpcError::protocol("remote exception class name truncated"));
        }
        let class_name = std::str::from_utf8(&rest[..class_len])
            .map_err(|_| RpcError::protocol("remote exception class name is not UTF-8"))?;
        let message = std::str::from_utf8(&rest[class_len..])
            .map_err(|_| RpcError::protocol("remote exception message is not UTF-8"))?;
        Ok(Self::new(class_name, message))
    }

    pub fn into_frame(self, correlation_id: u32) -> Frame {
        Frame::new(correlation_id, TypeTag::REMOTE_EXCEPTION, self.encode())
    }
}

impl From<RemoteExceptionEnvelope> for RpcError {
    fn from(envelope: RemoteExceptionEnvelope) -> Self {
        RpcError::RemoteException {
            class_name: envelope.class_name,
            message: envelope.message,
        }
    }
}

/// Connection-level signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// The server is shutting down: route nothing new here, finish what is in flight.
    Close,
}

impl ControlMessage {
    fn as_u8(self) -> u8 {
        match self {
            ControlMessage::Close => 1,
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        match payload {
            [1] => Ok(ControlMessage::Close),
            other => Err(RpcError::protocol(format!(
                "unknown control message {:?}",
                other
            ))),
        }
    }

    pub fn into_frame(self) -> Frame {
        Frame::new(0, TypeTag::CONTROL, vec![self.as_u8()])
    }
}
