//! Response frame parsing.

use bytes::Bytes;

use crate::error::ParseError;
use crate::header::{Opcode, ResponseHeader, Status, HEADER_SIZE};

/// One parsed response frame.
///
/// Owns its key and value so the receive buffer can advance immediately;
/// a client holds responses across reads while re-associating them with
/// in-flight requests by opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: Opcode,
    pub status: Status,
    pub opaque: u32,
    pub cas: u64,
    /// Flags extra on GET-class responses; zero elsewhere.
    pub flags: u32,
    /// Key echo (STAT entries; empty elsewhere).
    pub key: Bytes,
    /// Value body after extras and key.
    pub value: Bytes,
}

impl Response {
    /// Parse one frame from the front of `data`.
    ///
    /// Returns `Ok(None)` when `data` holds only part of a frame, and
    /// `Ok(Some((response, consumed)))` once a whole frame is available.
    /// A [`ParseError`] means the stream is corrupt.
    pub fn parse(data: &[u8]) -> Result<Option<(Response, usize)>, ParseError> {
        if data.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = ResponseHeader::parse(data)?;

        let total_len = HEADER_SIZE + header.total_body_length as usize;
        if data.len() < total_len {
            return Ok(None);
        }

        let extras_len = header.extras_length as usize;
        let key_len = header.key_length as usize;
        if extras_len + key_len > header.total_body_length as usize {
            return Err(ParseError::Protocol("header lengths exceed body length"));
        }

        let body = &data[HEADER_SIZE..total_len];

        // GET-class successes lead the body with a 4-byte flags extra.
        let flags = if extras_len >= 4 && header.status.is_success() {
            u32::from_be_bytes([body[0], body[1], body[2], body[3]])
        } else {
            0
        };

        let key = Bytes::copy_from_slice(&body[extras_len..extras_len + key_len]);
        let value = Bytes::copy_from_slice(&body[extras_len + key_len..]);

        Ok(Some((
            Response {
                opcode: header.opcode,
                status: header.status,
                opaque: header.opaque,
                cas: header.cas,
                flags,
                key,
                value,
            },
            total_len,
        )))
    }

    /// True when the server reported success.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// True for a KEY_ENOENT miss.
    pub fn is_miss(&self) -> bool {
        self.status == Status::KeyNotFound
    }

    /// Counter responses carry the new value as a big-endian u64 body.
    pub fn counter_value(&self) -> Option<u64> {
        if self.value.len() != 8 {
            return None;
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.value);
        Some(u64::from_be_bytes(raw))
    }

    /// A STAT stream ends with an entry whose key and value are both empty.
    pub fn is_stat_end(&self) -> bool {
        self.opcode == Opcode::Stat && self.key.is_empty() && self.value.is_empty()
    }
}
