//! Length-prefixed frame codec.
//!
//! ## Wire Format
//!
//! ```text
//! [length: u32 big-endian][payload: length bytes]
//!
//! Example:
//! 00 00 00 05 68 65 6c 6c 6f   -> "hello"
//! ```
//!
//! The length covers the payload only. TCP gives us a byte stream, so one
//! `read` may return half a frame or several frames at once; `FrameReader`
//! buffers until a whole frame is available and never yields a partial one.

use crate::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Initial read buffer capacity.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Stateless encoder/validator for one maximum frame size.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Encode `payload` as a single frame.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes, FrameError> {
        let mut dst = BytesMut::with_capacity(HEADER_LEN + payload.len());
        self.encode_into(payload, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Append the frame for `payload` to `dst`.
    pub fn encode_into(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        self.encode_parts(&[payload], dst)
    }

    /// Append one frame whose payload is the concatenation of `parts`.
    ///
    /// Lets callers build a response around a borrowed request without
    /// copying the request into an intermediate buffer first.
    pub fn encode_parts(&self, parts: &[&[u8]], dst: &mut BytesMut) -> Result<(), FrameError> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        if len > self.max_frame_size || len > u32::MAX as usize {
            return Err(FrameError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        dst.reserve(HEADER_LEN + len);
        dst.put_u32(len as u32);
        for part in parts {
            dst.extend_from_slice(part);
        }
        Ok(())
    }

    /// Try to split one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. The advertised length
    /// is checked as soon as the header is complete, before any payload is
    /// buffered.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_size {
            return Err(FrameError::ProtocolViolation {
                len,
                max: self.max_frame_size,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

/// Buffered frame reader over any async byte stream.
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
    codec: FrameCodec,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, codec: FrameCodec) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            codec,
        }
    }

    /// Read the next complete frame.
    ///
    /// - `Ok(Some(payload))`: one whole frame
    /// - `Ok(None)`: peer closed cleanly on a frame boundary
    /// - `Err(ConnectionClosed)`: stream ended inside a header or payload
    pub async fn decode_next(&mut self) -> Result<Option<Bytes>, FrameError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            let n = self.inner.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::ConnectionClosed);
            }
        }
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
