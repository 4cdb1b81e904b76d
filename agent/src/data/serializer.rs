//! Payload serializers applied before a report is wrapped and spooled.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{SpoolError, SpoolResult};

pub const ENCODING_NONE: &str = "";
pub const ENCODING_GZIP: &str = "gzip";

pub trait Serializer: Send + Sync {
    fn to_bytes(&self, data: &[u8]) -> SpoolResult<Vec<u8>>;

    /// Value for the envelope's `content_encoding`.
    fn encoding(&self) -> &'static str;
}

/// Identity: payload bytes are stored as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn to_bytes(&self, data: &[u8]) -> SpoolResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn encoding(&self) -> &'static str {
        ENCODING_NONE
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GzipSerializer {
    level: Compression,
}

impl Default for GzipSerializer {
    fn default() -> Self {
        Self { level: Compression::default() }
    }
}

impl Serializer for GzipSerializer {
    fn to_bytes(&self, data: &[u8]) -> SpoolResult<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), self.level);
        encoder
            .write_all(data)
            .map_err(|e| SpoolError::Encode { reason: e.to_string() })?;
        encoder.finish().map_err(|e| SpoolError::Encode { reason: e.to_string() })
    }

    fn encoding(&self) -> &'static str {
        ENCODING_GZIP
    }
}

/// Serializer for a configured encoding name (`""`, `"none"`, `"gzip"`).
pub fn make_serializer(encoding: &str) -> SpoolResult<Box<dyn Serializer>> {
    match encoding {
        "" | "none" => Ok(Box::new(JsonSerializer)),
        "gzip" => Ok(Box::new(GzipSerializer::default())),
        other => Err(SpoolError::UnknownEncoding { encoding: other.to_string() }),
    }
}

/// Reverse the envelope's declared `content_encoding`.
pub fn decode(encoding: &str, data: &[u8]) -> SpoolResult<Vec<u8>> {
    match encoding {
        "" | "none" => Ok(data.to_vec()),
        "gzip" => {
            let mut out = Vec::new();
            GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| SpoolError::Decode { reason: e.to_string() })?;
            Ok(out)
        }
        other => Err(SpoolError::UnknownEncoding { encoding: other.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_round_trip() {
        let payload = br#"{"class":[{"id":"abc","query_time":1.5}]}"#.repeat(20);
        let sz = make_serializer("gzip").unwrap();
        let coded = sz.to_bytes(&payload).unwrap();
        assert_eq!(sz.encoding(), "gzip");
        assert!(coded.len() < payload.len());
        assert_eq!(decode(sz.encoding(), &coded).unwrap(), payload);
    }

    #[test]
    fn test_identity() {
        let sz = make_serializer("none").unwrap();
        assert_eq!(sz.encoding(), "");
        assert_eq!(sz.to_bytes(b"abc").unwrap(), b"abc");
    }

    #[test]
    fn test_unknown_encoding() {
        assert!(make_serializer("zstd").is_err());
        assert!(decode("br", b"x").is_err());
    }
}
