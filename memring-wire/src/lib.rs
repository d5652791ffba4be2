//! Memcache binary protocol framing for the memring client.
//!
//! This crate implements the client half of the memcached binary protocol
//! (memcached >= 1.4): encoding request frames and parsing response frames.
//! Both directions use a fixed 24-byte header followed by extras, key, and
//! value.
//!
//! - Request magic: 0x80
//! - Response magic: 0x81
//!
//! Requests are written into a [`bytes::BytesMut`] so multiple frames can be
//! batched into one write (pipelined quiet gets terminated by a NOOP).
//! Responses parse incrementally: [`Response::parse`] returns `Ok(None)`
//! while the buffer holds only part of a frame.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use memring_wire::{request, Response, HEADER_SIZE};
//!
//! let mut buf = BytesMut::new();
//! request::get(&mut buf, b"mykey", 1);
//! assert_eq!(buf[0], 0x80);
//! assert_eq!(buf.len(), HEADER_SIZE + 5);
//!
//! // Nothing received yet: an empty buffer is an incomplete frame.
//! assert_eq!(Response::parse(&[]).unwrap(), None);
//! ```

mod error;
mod header;
pub mod request;
mod response;

pub use error::ParseError;
pub use header::{
    Opcode, RequestHeader, ResponseHeader, Status, HEADER_SIZE, REQUEST_MAGIC, RESPONSE_MAGIC,
};
pub use response::Response;
