//! Request frame encoders.
//!
//! Every encoder appends one complete frame to the supplied `BytesMut`, so a
//! caller can batch frames (quiet gets, quiet stores) and flush them with a
//! single write. Opaque correlators are the caller's business; the connection
//! assigns them.

use bytes::{BufMut, BytesMut};

use crate::header::{Opcode, RequestHeader};

/// Counter expiry meaning "fail with KEY_ENOENT instead of seeding a value".
pub const COUNTER_NO_SEED: u32 = 0xFFFF_FFFF;

fn put_header(buf: &mut BytesMut, header: RequestHeader) {
    buf.reserve(crate::HEADER_SIZE + header.total_body_length as usize);
    buf.put_slice(&header.to_bytes());
}

/// GET / GETQ: key only.
fn get_op(buf: &mut BytesMut, opcode: Opcode, key: &[u8], opaque: u32) {
    let mut header = RequestHeader::new(opcode);
    header.key_length = key.len() as u16;
    header.total_body_length = key.len() as u32;
    header.opaque = opaque;
    put_header(buf, header);
    buf.put_slice(key);
}

pub fn get(buf: &mut BytesMut, key: &[u8], opaque: u32) {
    get_op(buf, Opcode::Get, key, opaque);
}

pub fn getq(buf: &mut BytesMut, key: &[u8], opaque: u32) {
    get_op(buf, Opcode::GetQ, key, opaque);
}

/// SET / ADD / REPLACE and their quiet variants: extras carry
/// `flags: u32 | expiry: u32`.
///
/// The opcode is the caller's choice; a non-zero `cas` turns SET into a
/// compare-and-swap (the server answers KEY_EEXISTS on token mismatch).
pub fn store(
    buf: &mut BytesMut,
    opcode: Opcode,
    key: &[u8],
    value: &[u8],
    flags: u32,
    expiry: u32,
    cas: u64,
    opaque: u32,
) {
    let mut header = RequestHeader::new(opcode);
    header.key_length = key.len() as u16;
    header.extras_length = 8;
    header.total_body_length = (8 + key.len() + value.len()) as u32;
    header.cas = cas;
    header.opaque = opaque;
    put_header(buf, header);
    buf.put_u32(flags);
    buf.put_u32(expiry);
    buf.put_slice(key);
    buf.put_slice(value);
}

/// DELETE / DELETEQ: key only, optional CAS guard.
pub fn delete(buf: &mut BytesMut, opcode: Opcode, key: &[u8], cas: u64, opaque: u32) {
    let mut header = RequestHeader::new(opcode);
    header.key_length = key.len() as u16;
    header.total_body_length = key.len() as u32;
    header.cas = cas;
    header.opaque = opaque;
    put_header(buf, header);
    buf.put_slice(key);
}

/// INCREMENT / DECREMENT: extras carry
/// `delta: u64 | initial: u64 | expiry: u32`.
///
/// `initial = None` encodes expiry [`COUNTER_NO_SEED`], which makes the
/// server fail on an absent key instead of creating it.
pub fn counter(
    buf: &mut BytesMut,
    opcode: Opcode,
    key: &[u8],
    delta: u64,
    initial: Option<u64>,
    expiry: u32,
    opaque: u32,
) {
    let (initial, expiry) = match initial {
        Some(seed) => (seed, expiry),
        None => (0, COUNTER_NO_SEED),
    };

    let mut header = RequestHeader::new(opcode);
    header.key_length = key.len() as u16;
    header.extras_length = 20;
    header.total_body_length = (20 + key.len()) as u32;
    header.opaque = opaque;
    put_header(buf, header);
    buf.put_u64(delta);
    buf.put_u64(initial);
    buf.put_u32(expiry);
    buf.put_slice(key);
}

/// APPEND / PREPEND: key + value, no extras.
pub fn concat(buf: &mut BytesMut, opcode: Opcode, key: &[u8], value: &[u8], opaque: u32) {
    let mut header = RequestHeader::new(opcode);
    header.key_length = key.len() as u16;
    header.total_body_length = (key.len() + value.len()) as u32;
    header.opaque = opaque;
    put_header(buf, header);
    buf.put_slice(key);
    buf.put_slice(value);
}

/// TOUCH: update expiry without fetching.
pub fn touch(buf: &mut BytesMut, key: &[u8], expiry: u32, opaque: u32) {
    expiry_op(buf, Opcode::Touch, key, expiry, opaque);
}

/// GAT: fetch and update expiry in one round trip.
pub fn gat(buf: &mut BytesMut, key: &[u8], expiry: u32, opaque: u32) {
    expiry_op(buf, Opcode::Gat, key, expiry, opaque);
}

fn expiry_op(buf: &mut BytesMut, opcode: Opcode, key: &[u8], expiry: u32, opaque: u32) {
    let mut header = RequestHeader::new(opcode);
    header.key_length = key.len() as u16;
    header.extras_length = 4;
    header.total_body_length = (4 + key.len()) as u32;
    header.opaque = opaque;
    put_header(buf, header);
    buf.put_u32(expiry);
    buf.put_slice(key);
}

/// FLUSH: `delay = 0` flushes immediately (no extras); otherwise the 4-byte
/// extra schedules the flush `delay` seconds out.
pub fn flush(buf: &mut BytesMut, delay: u32, opaque: u32) {
    let mut header = RequestHeader::new(Opcode::Flush);
    header.opaque = opaque;
    if delay == 0 {
        put_header(buf, header);
    } else {
        header.extras_length = 4;
        header.total_body_length = 4;
        put_header(buf, header);
        buf.put_u32(delay);
    }
}

/// NOOP: pipeline terminator.
pub fn noop(buf: &mut BytesMut, opaque: u32) {
    let mut header = RequestHeader::new(Opcode::Noop);
    header.opaque = opaque;
    put_header(buf, header);
}

/// VERSION.
pub fn version(buf: &mut BytesMut, opaque: u32) {
    let mut header = RequestHeader::new(Opcode::Version);
    header.opaque = opaque;
    put_header(buf, header);
}

/// STAT, optionally scoped to a stats group (`items`, `slabs`, ...).
pub fn stat(buf: &mut BytesMut, group: Option<&[u8]>, opaque: u32) {
    let key = group.unwrap_or(&[]);
    let mut header = RequestHeader::new(Opcode::Stat);
    header.key_length = key.len() as u16;
    header.total_body_length = key.len() as u32;
    header.opaque = opaque;
    put_header(buf, header);
    buf.put_slice(key);
}

/// SASL PLAIN authentication: mechanism name as key,
/// `\0username\0password` as value.
pub fn sasl_auth(buf: &mut BytesMut, username: &str, password: &str, opaque: u32) {
    let mech = b"PLAIN";
    let value_len = 2 + username.len() + password.len();

    let mut header = RequestHeader::new(Opcode::SaslAuth);
    header.key_length = mech.len() as u16;
    header.total_body_length = (mech.len() + value_len) as u32;
    header.opaque = opaque;
    put_header(buf, header);
    buf.put_slice(mech);
    buf.put_u8(0);
    buf.put_slice(username.as_bytes());
    buf.put_u8(0);
    buf.put_slice(password.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Response, Status, HEADER_SIZE};

    fn body(buf: &[u8]) -> &[u8] {
        &buf[HEADER_SIZE..]
    }

    #[test]
    fn get_frame() {
        let mut buf = BytesMut::new();
        get(&mut buf, b"mykey", 42);

        assert_eq!(buf.len(), HEADER_SIZE + 5);
        assert_eq!(buf[0], crate::REQUEST_MAGIC);
        assert_eq!(buf[1], Opcode::Get as u8);
        assert_eq!(&buf[2..4], &[0, 5]);
        assert_eq!(&buf[12..16], &42u32.to_be_bytes());
        assert_eq!(body(&buf), b"mykey");
    }

    #[test]
    fn store_frame_layout() {
        let mut buf = BytesMut::new();
        store(&mut buf, Opcode::Set, b"key", b"value", 7, 3600, 9, 99);

        assert_eq!(buf[1], Opcode::Set as u8);
        assert_eq!(buf[4], 8); // extras
        assert_eq!(&buf[8..12], &(8u32 + 3 + 5).to_be_bytes());
        assert_eq!(&buf[16..24], &9u64.to_be_bytes());
        assert_eq!(&body(&buf)[..4], &7u32.to_be_bytes());
        assert_eq!(&body(&buf)[4..8], &3600u32.to_be_bytes());
        assert_eq!(&body(&buf)[8..11], b"key");
        assert_eq!(&body(&buf)[11..], b"value");
    }

    #[test]
    fn counter_with_seed() {
        let mut buf = BytesMut::new();
        counter(&mut buf, Opcode::Increment, b"ctr", 3, Some(10), 60, 1);

        assert_eq!(buf[4], 20);
        assert_eq!(&body(&buf)[..8], &3u64.to_be_bytes());
        assert_eq!(&body(&buf)[8..16], &10u64.to_be_bytes());
        assert_eq!(&body(&buf)[16..20], &60u32.to_be_bytes());
        assert_eq!(&body(&buf)[20..], b"ctr");
    }

    #[test]
    fn counter_without_seed_fails_on_absent() {
        let mut buf = BytesMut::new();
        counter(&mut buf, Opcode::Decrement, b"ctr", 1, None, 60, 1);

        assert_eq!(&body(&buf)[8..16], &0u64.to_be_bytes());
        assert_eq!(&body(&buf)[16..20], &COUNTER_NO_SEED.to_be_bytes());
    }

    #[test]
    fn flush_immediate_has_no_extras() {
        let mut buf = BytesMut::new();
        flush(&mut buf, 0, 1);
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(buf[4], 0);
    }

    #[test]
    fn flush_delayed_carries_extra() {
        let mut buf = BytesMut::new();
        flush(&mut buf, 30, 1);
        assert_eq!(buf.len(), HEADER_SIZE + 4);
        assert_eq!(body(&buf), &30u32.to_be_bytes());
    }

    #[test]
    fn quiet_get_batch_terminated_by_noop() {
        let mut buf = BytesMut::new();
        getq(&mut buf, b"a", 1);
        getq(&mut buf, b"b", 2);
        noop(&mut buf, 3);

        assert_eq!(buf.len(), (HEADER_SIZE + 1) * 2 + HEADER_SIZE);
        assert_eq!(buf[1], Opcode::GetQ as u8);
        let noop_frame = &buf[(HEADER_SIZE + 1) * 2..];
        assert_eq!(noop_frame[1], Opcode::Noop as u8);
        assert_eq!(&noop_frame[12..16], &3u32.to_be_bytes());
    }

    #[test]
    fn sasl_plain_payload() {
        let mut buf = BytesMut::new();
        sasl_auth(&mut buf, "user", "secret", 5);

        assert_eq!(buf[1], Opcode::SaslAuth as u8);
        assert_eq!(&buf[2..4], &[0, 5]); // "PLAIN"
        assert_eq!(&body(&buf)[..5], b"PLAIN");
        assert_eq!(&body(&buf)[5..], b"\0user\0secret");
    }

    #[test]
    fn touch_and_gat_extras() {
        let mut buf = BytesMut::new();
        touch(&mut buf, b"k", 120, 1);
        assert_eq!(buf[1], Opcode::Touch as u8);
        assert_eq!(body(&buf), [&120u32.to_be_bytes()[..], b"k"].concat());

        let mut buf = BytesMut::new();
        gat(&mut buf, b"k", 120, 1);
        assert_eq!(buf[1], Opcode::Gat as u8);
    }

    // A request frame is not a response frame, but a server echoing a
    // well-formed error proves the parser and encoders agree on layout.
    #[test]
    fn parse_rejects_request_frames() {
        let mut buf = BytesMut::new();
        get(&mut buf, b"k", 1);
        assert!(matches!(
            Response::parse(&buf),
            Err(crate::ParseError::InvalidMagic(crate::REQUEST_MAGIC))
        ));
    }

    #[test]
    fn stat_with_group() {
        let mut buf = BytesMut::new();
        stat(&mut buf, Some(b"items"), 2);
        assert_eq!(body(&buf), b"items");

        let mut buf = BytesMut::new();
        stat(&mut buf, None, 2);
        assert_eq!(buf.len(), HEADER_SIZE);
    }

    #[test]
    fn status_display_for_errors() {
        assert_eq!(Status::NotStored.as_str(), "item not stored");
        assert_eq!(Status::NonNumericValue.as_str(), "incr/decr on non-numeric value");
    }
}
