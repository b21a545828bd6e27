//! Echo application protocol.
//!
//! ```text
//! Request:  [len]<payload>
//! Response: [len + 17]Server received: <payload>
//! ```
//!
//! When the server is at its session limit a fresh connection receives a
//! single `REJECTION` frame and is then closed.

use crate::codec::{FrameCodec, HEADER_LEN};
use crate::error::FrameError;
use bytes::{BufMut, Bytes, BytesMut};

/// Prefix prepended to every echoed payload.
pub const RESPONSE_PREFIX: &[u8] = b"Server received: ";

/// Payload of the frame sent to connections refused by admission control.
pub const REJECTION: &[u8] = b"Server busy: session limit reached";

/// Largest response payload produced for a request of `max_request` bytes.
pub fn max_response_size(max_request: usize) -> usize {
    max_request + RESPONSE_PREFIX.len()
}

/// Append the framed response for `request` to `dst`.
pub fn respond(codec: &FrameCodec, request: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
    codec.encode_parts(&[RESPONSE_PREFIX, request], dst)
}

/// The complete rejection frame, header included.
pub fn rejection_frame() -> Bytes {
    let mut dst = BytesMut::with_capacity(HEADER_LEN + REJECTION.len());
    dst.put_u32(REJECTION.len() as u32);
    dst.extend_from_slice(REJECTION);
    dst.freeze()
}
