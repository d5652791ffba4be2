//! Value serialization and compression.
//!
//! Stored values carry a flags bitfield: bit 0 marks a serialized payload,
//! bit 1 a compressed one. Raw bytes are stored verbatim with both bits
//! clear. Non-raw values serialize first, then compress when enabled and the
//! serialized size meets the configured threshold.

use std::borrow::Cow;
use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Flag bit: payload was produced by the serializer.
pub const FLAG_SERIALIZED: u32 = 0x1;

/// Flag bit: payload is compressed.
pub const FLAG_COMPRESSED: u32 = 0x2;

/// Encodes arbitrary values to bytes and back.
///
/// Not object-safe on purpose: the client is generic over its serializer so
/// typed operations monomorphize.
pub trait Serializer: Send + Sync {
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    fn from_bytes<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T>;

    /// Whether `data` is this serializer's encoding of nil. Drives the
    /// `cache_nils` distinction in `fetch`.
    fn is_nil(&self, data: &[u8]) -> bool {
        let _ = data;
        false
    }
}

/// Default serializer: serde_json.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| Error::InvalidArgument(format!("value failed to serialize: {e}")))
    }

    fn from_bytes<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        serde_json::from_slice(data).map_err(|e| Error::Unmarshal(e.to_string()))
    }

    fn is_nil(&self, data: &[u8]) -> bool {
        data == b"null"
    }
}

/// Deflates and inflates value bytes.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>>;
}

/// Default compressor: zlib.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZlibCompressor;

impl Compressor for ZlibCompressor {
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        ZlibDecoder::new(data).read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Per-operation view over the configured codec pieces.
pub(crate) struct ValueCodec<'a, S> {
    pub serializer: &'a S,
    pub compressor: &'a dyn Compressor,
    pub compress: bool,
    pub compression_min_size: usize,
    pub value_max_bytes: usize,
}

impl<S: Serializer> ValueCodec<'_, S> {
    /// Serialize, optionally compress, and tag `value`.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<(Vec<u8>, u32)> {
        let serialized = self.serializer.to_bytes(value)?;
        let mut flags = FLAG_SERIALIZED;

        let payload = if self.compress && serialized.len() >= self.compression_min_size {
            flags |= FLAG_COMPRESSED;
            self.compressor
                .compress(&serialized)
                .map_err(|e| Error::InvalidArgument(format!("compression failed: {e}")))?
        } else {
            serialized
        };

        self.check_size(payload.len())?;
        Ok((payload, flags))
    }

    /// Store bytes verbatim; both flag bits stay clear.
    pub fn encode_raw(&self, data: &[u8]) -> Result<(Vec<u8>, u32)> {
        self.check_size(data.len())?;
        Ok((data.to_vec(), 0))
    }

    /// Inverse of [`encode`](Self::encode).
    pub fn decode<T: DeserializeOwned>(&self, data: &[u8], flags: u32) -> Result<T> {
        let plain = self.decompressed(data, flags)?;
        self.serializer.from_bytes(&plain)
    }

    /// Decompress without deserializing, for payload inspection.
    pub fn decompressed<'d>(&self, data: &'d [u8], flags: u32) -> Result<Cow<'d, [u8]>> {
        if flags & FLAG_COMPRESSED != 0 {
            let plain = self
                .compressor
                .decompress(data)
                .map_err(|e| Error::Unmarshal(format!("decompression failed: {e}")))?;
            Ok(Cow::Owned(plain))
        } else {
            Ok(Cow::Borrowed(data))
        }
    }

    fn check_size(&self, len: usize) -> Result<()> {
        if len > self.value_max_bytes {
            return Err(Error::ValueTooLarge(len));
        }
        Ok(())
    }
}
