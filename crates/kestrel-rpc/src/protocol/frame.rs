//! Wire framing.
//!
//! ```text
//! [length:varint][correlation-id:varint][type-tag:varint][payload:length-(id+tag) bytes]
//! ```
//!
//! Varints are unsigned LEB128 and at most 5 bytes long. `length` counts
//! everything after itself, so a reader can buffer exactly one frame before
//! decoding it. Payload bytes are opaque here.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::{Result, RpcError};

/// Longest legal encoding of a `u32` varint.
pub const MAX_VARINT_LEN: usize = 5;

/// Identifies the registered message type carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(pub u32);

impl TypeTag {
    /// Server-side handler failure, see [`RemoteExceptionEnvelope`](super::RemoteExceptionEnvelope).
    pub const REMOTE_EXCEPTION: TypeTag = TypeTag(0);
    /// Connection-level control message.
    pub const CONTROL: TypeTag = TypeTag(1);

    const FIRST_MESSAGE: u32 = 2;

    /// Tag of the request type of the `index`-th registered pair.
    pub fn request(index: u32) -> TypeTag {
        TypeTag(Self::FIRST_MESSAGE + 2 * index)
    }

    /// Tag of the response type of the `index`-th registered pair.
    pub fn response(index: u32) -> TypeTag {
        TypeTag(Self::FIRST_MESSAGE + 2 * index + 1)
    }

    pub fn is_request(self) -> bool {
        self.0 >= Self::FIRST_MESSAGE && self.0 % 2 == 0
    }

    pub fn is_response(self) -> bool {
        self.0 > Self::FIRST_MESSAGE && self.0 % 2 == 1
    }

    /// Registration index of the pair this tag belongs to.
    pub fn pair_index(self) -> Option<u32> {
        (self.0 >= Self::FIRST_MESSAGE).then(|| (self.0 - Self::FIRST_MESSAGE) / 2)
    }

    /// Response tag matching this request tag.
    pub fn response_tag(self) -> Option<TypeTag> {
        self.is_request().then(|| TypeTag(self.0 + 1))
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One wire unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub correlation_id: u32,
    pub type_tag: TypeTag,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(correlation_id: u32, type_tag: TypeTag, payload: impl Into<Bytes>) -> Self {
        Self {
            correlation_id,
            type_tag,
            payload: payload.into(),
        }
    }

    /// Encoded length of everything after the length prefix.
    pub(crate) fn body_len(&self) -> usize {
        varint_len(self.correlation_id) + varint_len(self.type_tag.0) + self.payload.len()
    }
}

/// Number of bytes `value` occupies as a varint.
pub fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0xFFF_FFFF => 4,
        _ => 5,
    }
}

/// Append `value` as a varint.
pub fn put_varint(buf: &mut impl BufMut, mut value: u32) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Read a varint from the front of `buf` without consuming it.
///
/// Returns the value and its encoded length, or `None` when `buf` ends
/// before the varint does.
pub fn peek_varint(buf: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut value: u32 = 0;
    for (i, byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        let bits = u32::from(byte & 0x7F);
        if i == MAX_VARINT_LEN - 1 && bits > 0x0F {
            return Err(RpcError::protocol("varint overflows u32"));
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        return Err(RpcError::protocol("varint longer than 5 bytes"));
    }
    Ok(None)
}

/// Frame encoder/decoder for `FramedRead` / `FramedWrite`.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(crate::config::RpcConfig::MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let Some((length, prefix_len)) = peek_varint(src)? else {
            return Ok(None);
        };
        let length = length as usize;
        if length > self.max_frame_size {
            return Err(RpcError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total = prefix_len + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(prefix_len);
        let mut body = src.split_to(length);

        let (correlation_id, id_len) = peek_varint(&body)?
            .ok_or_else(|| RpcError::protocol("frame truncated inside correlation id"))?;
        body.advance(id_len);
        let (tag, tag_len) = peek_varint(&body)?
            .ok_or_else(|| RpcError::protocol("frame truncated inside type tag"))?;
        body.advance(tag_len);

        trace!(correlation_id, tag, len = body.len(), "decoded frame");

        Ok(Some(Frame {
            correlation_id,
            type_tag: TypeTag(tag),
            payload: body.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = RpcError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let length = frame.body_len();
        if length > self.max_frame_size || length > u32::MAX as usize {
            return Err(RpcError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        dst.reserve(varint_len(length as u32) + length);
        put_varint(dst, length as u32);
        put_varint(dst, frame.correlation_id);
        put_varint(dst, frame.type_tag.0);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::default().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_varint_boundaries() {
        for value in [0, 0x7F, 0x80, 0x3FFF, 0x4000, 0x1F_FFFF, 0x20_0000, u32::MAX] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            assert_eq!(buf.len(), varint_len(value), "length of {value:#x}");
            assert_eq!(peek_varint(&buf).unwrap(), Some((value, buf.len())));
        }
    }

    #[test]
    fn test_varint_incomplete_and_overflow() {
        assert_eq!(peek_varint(&[0x80, 0x80]).unwrap(), None);
        assert!(peek_varint(&[0xFF, 0xFF, 0xFF, 0xFF, 0x1F]).is_err());
        assert!(peek_varint(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
    }

    #[test]
    fn test_frame_layout() {
        let buf = encode(Frame::new(300, TypeTag(2), &b"hi"[..]));
        // length = 2 (id) + 1 (tag) + 2 (payload)
        assert_eq!(&buf[..], &[5, 0xAC, 0x02, 2, b'h', b'i']);
    }

    #[test]
    fn test_decode_waits_for_whole_frame() {
        let frame = Frame::new(7, TypeTag(4), &b"payload"[..]);
        let full = encode(frame.clone());
        let mut codec = FrameCodec::default();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);

        partial.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(frame));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut buf = encode(Frame::new(1, TypeTag(2), &b"a"[..]));
        buf.extend_from_slice(&encode(Frame::new(2, TypeTag(3), Bytes::new())));
        let mut codec = FrameCodec::default();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.correlation_id, 1);
        assert_eq!(second.correlation_id, 2);
        assert!(second.payload.is_empty());
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversized_frame_rejected_both_ways() {
        let mut codec = FrameCodec::new(8);
        let mut buf = BytesMut::new();
        let result = codec.encode(Frame::new(1, TypeTag(2), vec![0u8; 16]), &mut buf);
        assert!(matches!(result, Err(RpcError::FrameTooLarge { .. })));

        let mut incoming = encode(Frame::new(1, TypeTag(2), vec![0u8; 16]));
        let result = codec.decode(&mut incoming);
        assert!(matches!(result, Err(RpcError::FrameTooLarge { size: 18, max: 8 })));
    }

    #[test]
    fn test_truncated_header_inside_frame_is_protocol_error() {
        // length 1, but the single body byte is an unfinished varint
        let mut buf = BytesMut::from(&[1u8, 0x80][..]);
        let err = FrameCodec::default().decode(&mut buf).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_type_tag_layout() {
        assert_eq!(TypeTag::request(0), TypeTag(2));
        assert_eq!(TypeTag::response(0), TypeTag(3));
        assert_eq!(TypeTag::request(3).response_tag(), Some(TypeTag::response(3)));
        assert_eq!(TypeTag::response(3).pair_index(), Some(3));
        assert!(!TypeTag::CONTROL.is_request());
        assert!(!TypeTag::CONTROL.is_response());
        assert!(!TypeTag::REMOTE_EXCEPTION.is_request());
        assert_eq!(TypeTag::REMOTE_EXCEPTION.pair_index(), None);
    }
}
