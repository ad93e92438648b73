//! Persisted record format.
//!
//! Every value written to the KV store starts with a two byte header: the
//! format version and a flags byte. The payload is JSON, gzip-compressed when it
//! is large. Readers ignore fields they do not know, so records can grow new
//! fields without a version bump.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{EngineError, EngineResult};

pub const FORMAT_VERSION: u8 = 1;
const FLAG_GZIP: u8 = 0b0000_0001;
const KNOWN_FLAGS: u8 = FLAG_GZIP;

/// Payloads above this size are compressed
pub const COMPRESSION_THRESHOLD: usize = 4 * 1024;

/// Upper bound on an inflated payload; anything larger is treated as corrupt
pub const MAX_DECODED_BYTES: u64 = 256 * 1024 * 1024;

pub fn encode<T: Serialize>(record: &T) -> EngineResult<Vec<u8>> {
    let payload = serde_json::to_vec(record)
        .map_err(|e| EngineError::invalid("record", format!("not serializable: {}", e)))?;

    if payload.len() <= COMPRESSION_THRESHOLD {
        let mut out = Vec::with_capacity(payload.len() + 2);
        out.push(FORMAT_VERSION);
        out.push(0);
        out.extend_from_slice(&payload);
        return Ok(out);
    }

    let compressed = compress(&payload)
        .map_err(|e| EngineError::invalid("record", format!("compression failed: {}", e)))?;
    let mut out = Vec::with_capacity(compressed.len() + 2);
    out.push(FORMAT_VERSION);
    out.push(FLAG_GZIP);
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Decode a record. `entity` and `id` only feed the error on failure.
pub fn decode<T: DeserializeOwned>(entity: &'static str, id: &str, bytes: &[u8]) -> EngineResult<T> {
    let (version, flags, body) = match bytes {
        [version, flags, body @ ..] => (*version, *flags, body),
        _ => return Err(EngineError::corruption(entity, id, "record shorter than header")),
    };
    if version != FORMAT_VERSION {
        return Err(EngineError::corruption(
            entity,
            id,
            format!("unknown record format version {}", version),
        ));
    }
    if flags & !KNOWN_FLAGS != 0 {
        return Err(EngineError::corruption(
            entity,
            id,
            format!("unknown record flags {:#04x}", flags),
        ));
    }

    let payload = if flags & FLAG_GZIP != 0 {
        decompress(body, MAX_DECODED_BYTES)
            .map_err(|e| EngineError::corruption(entity, id, format!("bad gzip payload: {}", e)))?
    } else {
        body.to_vec()
    };

    serde_json::from_slice(&payload)
        .map_err(|e| EngineError::corruption(entity, id, format!("bad payload: {}", e)))
}

/// Compress data using gzip
fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Decompress data from gzip, refusing payloads that inflate past `limit` bytes
fn decompress(data: &[u8], limit: u64) -> std::io::Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::{Error, ErrorKind, Read};

    let mut decoder = GzDecoder::new(data).take(limit + 1);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    if decompressed.len() as u64 > limit {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("inflates past {} bytes", limit),
        ));
    }
    Ok(decompressed)
}
