//! Length-prefixed framing for async streams
//!
//! Stream transports have no message boundaries, so each encoded event is
//! written as a 4-byte big-endian length followed by the envelope bytes.

use crate::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest envelope accepted by default (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the big-endian length prefix
const PREFIX_LEN: usize = 4;

/// Splits a byte stream into envelopes and prefixes outgoing ones
///
/// Reading keeps partial frames buffered across calls, so one codec must be
/// used per stream direction.
pub struct FrameCodec {
    pending: BytesMut,
    limit: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec with the default size limit
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Codec rejecting envelopes larger than `limit` bytes
    pub fn with_max_frame_size(limit: usize) -> Self {
        Self {
            pending: BytesMut::with_capacity(8 * 1024),
            limit,
        }
    }

    fn check_len(&self, len: usize) -> Result<(), ProtocolError> {
        if len > self.limit {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.limit,
            });
        }
        Ok(())
    }

    /// Prefix an encoded envelope with its length
    pub fn encode_frame(&self, envelope: &[u8]) -> Result<Bytes, ProtocolError> {
        self.check_len(envelope.len())?;

        let mut frame = BytesMut::with_capacity(PREFIX_LEN + envelope.len());
        frame.put_u32(envelope.len() as u32);
        frame.put_slice(envelope);
        Ok(frame.freeze())
    }

    /// Write one framed envelope and flush
    pub async fn write_frame<W>(&self, writer: &mut W, envelope: &[u8]) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode_frame(envelope)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the next envelope; `None` when the stream ends between frames
    ///
    /// A stream that ends inside a frame is [`ProtocolError::InvalidFrame`].
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Bytes>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(frame) = self.try_decode_frame()? {
                return Ok(Some(frame));
            }
            if reader.read_buf(&mut self.pending).await? == 0 {
                return if self.pending.is_empty() {
                    Ok(None)
                } else {
                    Err(ProtocolError::InvalidFrame)
                };
            }
        }
    }

    /// Split one complete envelope off the buffered bytes, if there is one
    pub fn try_decode_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        let Some(prefix) = self.pending.get(..PREFIX_LEN) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        self.check_len(len)?;

        let needed = PREFIX_LEN + len;
        if self.pending.len() < needed {
            self.pending.reserve(needed - self.pending.len());
            return Ok(None);
        }

        self.pending.advance(PREFIX_LEN);
        Ok(Some(self.pending.split_to(len).freeze()))
    }

    /// Bytes buffered but not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Event, EventCodec, Value};
    use proptest::prelude::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_event_survives_framing() {
        let codec = FrameCodec::new();
        let event = Event::new("hello", vec![Value::from("World")]);
        let payload = EventCodec::encode(&event).unwrap();

        let mut buffer = Vec::new();
        codec.write_frame(&mut buffer, &payload).await.unwrap();
        assert_eq!(buffer.len(), payload.len() + 4);

        let mut reader = FrameCodec::new();
        let mut cursor = Cursor::new(buffer);
        let frame = reader.read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(EventCodec::decode(&frame).unwrap(), event);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let codec = FrameCodec::new();
        let encoded = codec.encode_frame(b"partial payload").unwrap();

        let mut reader = FrameCodec::new();
        let mid = encoded.len() / 2;
        reader.pending.extend_from_slice(&encoded[..mid]);
        assert!(reader.try_decode_frame().unwrap().is_none());

        reader.pending.extend_from_slice(&encoded[mid..]);
        let frame = reader.try_decode_frame().unwrap().unwrap();
        assert_eq!(&frame[..], b"partial payload");
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let codec = FrameCodec::new();
        let mut combined = BytesMut::new();
        combined.extend_from_slice(&codec.encode_frame(b"first").unwrap());
        combined.extend_from_slice(&codec.encode_frame(b"second").unwrap());

        let mut reader = FrameCodec::new();
        let mut cursor = Cursor::new(combined.freeze());

        assert_eq!(&reader.read_frame(&mut cursor).await.unwrap().unwrap()[..], b"first");
        assert_eq!(&reader.read_frame(&mut cursor).await.unwrap().unwrap()[..], b"second");
        assert!(reader.read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[test]
    fn test_encode_over_limit() {
        let codec = FrameCodec::with_max_frame_size(100);
        let result = codec.encode_frame(&[0u8; 200]);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { size: 200, max: 100 })));
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let mut data = BytesMut::new();
        data.put_u32(1000);
        data.put_slice(&[0u8; 8]);

        let mut reader = FrameCodec::with_max_frame_size(100);
        let mut cursor = Cursor::new(data.freeze());
        let result = reader.read_frame(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_stream_ends_inside_frame() {
        let codec = FrameCodec::new();
        let encoded = codec.encode_frame(b"truncated").unwrap();

        let mut reader = FrameCodec::new();
        let mut cursor = Cursor::new(encoded[..encoded.len() - 2].to_vec());
        let result = reader.read_frame(&mut cursor).await;
        assert!(matches!(result, Err(ProtocolError::InvalidFrame)));
    }

    #[tokio::test]
    async fn test_stream_ends_between_frames() {
        let mut reader = FrameCodec::new();
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(reader.read_frame(&mut cursor).await.unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_frames_preserve_boundaries(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..512), 1..8)
        ) {
            tokio_test::block_on(async {
                let codec = FrameCodec::new();
                let mut buffer = Vec::new();
                for payload in &payloads {
                    codec.write_frame(&mut buffer, payload).await?;
                }

                let mut reader = FrameCodec::new();
                let mut cursor = Cursor::new(buffer);
                for payload in &payloads {
                    let frame = reader.read_frame(&mut cursor).await?.unwrap();
                    prop_assert_eq!(&frame[..], &payload[..]);
                }
                prop_assert!(reader.read_frame(&mut cursor).await?.is_none());

                Ok(())
            })?;
        }
    }
}
