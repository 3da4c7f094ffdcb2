//! Frame codec and wire constants.
//!
//! Every message travels as one frame: a `u16` big-endian length prefix
//! followed by a body of 1..=32768 bytes. The codec never splits or merges
//! logical messages; `decode` emits exactly one complete frame per call.
//!
//! Envelope layout inside a frame:
//!
//! ```text
//! REQUEST  : 0x01 | u64 BE id | payload
//! RESPONSE : 0x02 | u64 BE id | 0x03 | payload        (success)
//!          | 0x02 | u64 BE id | 0x04 | fault          (failure)
//! CONNECT  : 0x10 | u32 BE len | len bytes of utf-8 identifier
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;

/// Largest legal frame body.
pub const MAX_FRAME_SIZE: usize = 32 * 1024;

pub(crate) const KIND_REQUEST: u8 = 0x01;
pub(crate) const KIND_RESPONSE: u8 = 0x02;
pub(crate) const KIND_CONNECT: u8 = 0x10;

pub(crate) const STATUS_SUCCESS: u8 = 0x03;
pub(crate) const STATUS_FAILURE: u8 = 0x04;

const LENGTH_PREFIX: usize = 2;

/// Frame a body with its length prefix.
///
/// Rejects empty and oversize bodies; a body that does not fit the frame
/// bound must never reach the wire.
pub fn encode(body: &[u8]) -> Result<Bytes, Error> {
    if body.is_empty() {
        return Err(Error::Protocol("empty frame body".into()));
    }
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame body of {} bytes exceeds the {} byte bound",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }
    let mut framed = BytesMut::with_capacity(LENGTH_PREFIX + body.len());
    framed.put_u16(body.len() as u16);
    framed.put_slice(body);
    Ok(framed.freeze())
}

/// Pull one complete frame body out of the accumulation buffer.
///
/// Returns `Ok(None)` when more input is needed. An advertised length of
/// zero or above the frame bound is a protocol error, fatal for the
/// channel feeding this buffer.
pub fn decode(src: &mut BytesMut) -> Result<Option<Bytes>, Error> {
    if src.len() < LENGTH_PREFIX {
        return Ok(None);
    }
    let len = u16::from_be_bytes([src[0], src[1]]) as usize;
    if len == 0 {
        return Err(Error::Protocol("zero-length frame".into()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "advertised frame length {len} exceeds the {MAX_FRAME_SIZE} byte bound"
        )));
    }
    if src.len() < LENGTH_PREFIX + len {
        return Ok(None);
    }
    src.advance(LENGTH_PREFIX);
    Ok(Some(src.split_to(len).freeze()))
}
