//! Self-describing codec envelope for binary blob columns
//!
//! Every blob stored in a `*_blob` column is framed as
//! `[magic(2) | codec_id(1) | version(1) | payload]`. Readers never consult
//! configuration: the codec is detected from the header and dispatched to
//! the matching decompressor. Writers use the configured codec for new rows;
//! rows written under earlier codecs stay decodable forever, so codec
//! variants may be added but never removed.

use std::io::Cursor;

/// Two-byte magic marking a vivarium codec frame.
const CODEC_MAGIC: [u8; 2] = [0xC0, 0xDE];

/// Current header version.
const CODEC_VERSION: u8 = 1;

/// Frame header length in bytes.
const HEADER_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("blob too short for codec header ({0} bytes)")]
    Truncated(usize),

    #[error("bad codec magic {0:02x}{1:02x}")]
    BadMagic(u8, u8),

    #[error("unsupported codec id {0}")]
    UnknownCodec(u8),

    #[error("unsupported codec header version {0}")]
    UnknownVersion(u8),

    #[error("compression failed: {0}")]
    Compress(std::io::Error),

    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),
}

/// Compression codec for blob columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobCodec {
    /// Stored as-is.
    None,
    #[default]
    Zstd,
}

impl BlobCodec {
    const fn id(self) -> u8 {
        match self {
            BlobCodec::None => 0,
            BlobCodec::Zstd => 1,
        }
    }

    fn from_id(id: u8) -> Result<Self, CodecError> {
        match id {
            0 => Ok(BlobCodec::None),
            1 => Ok(BlobCodec::Zstd),
            other => Err(CodecError::UnknownCodec(other)),
        }
    }
}

impl std::fmt::Display for BlobCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobCodec::None => write!(f, "none"),
            BlobCodec::Zstd => write!(f, "zstd"),
        }
    }
}

/// Frame `payload` with the given codec.
pub fn encode_blob(codec: BlobCodec, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let body = match codec {
        BlobCodec::None => payload.to_vec(),
        BlobCodec::Zstd => {
            zstd::stream::encode_all(Cursor::new(payload), 0).map_err(CodecError::Compress)?
        }
    };

    let mut framed = Vec::with_capacity(HEADER_LEN + body.len());
    framed.extend_from_slice(&CODEC_MAGIC);
    framed.push(codec.id());
    framed.push(CODEC_VERSION);
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Detect the codec from the header and decode the payload.
pub fn decode_blob(framed: &[u8]) -> Result<Vec<u8>, CodecError> {
    if framed.len() < HEADER_LEN {
        return Err(CodecError::Truncated(framed.len()));
    }
    if framed[..2] != CODEC_MAGIC {
        return Err(CodecError::BadMagic(framed[0], framed[1]));
    }
    let codec = BlobCodec::from_id(framed[2])?;
    if framed[3] != CODEC_VERSION {
        return Err(CodecError::UnknownVersion(framed[3]));
    }

    let body = &framed[HEADER_LEN..];
    match codec {
        BlobCodec::None => Ok(body.to_vec()),
        BlobCodec::Zstd => zstd::stream::decode_all(Cursor::new(body)).map_err(CodecError::Decompress),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_none() {
        let payload = b"tick state".to_vec();
        let framed = encode_blob(BlobCodec::None, &payload).unwrap();
        assert_eq!(decode_blob(&framed).unwrap(), payload);
    }

    #[test]
    fn test_roundtrip_zstd() {
        let payload = vec![7u8; 10_000];
        let framed = encode_blob(BlobCodec::Zstd, &payload).unwrap();
        assert!(framed.len() < payload.len());
        assert_eq!(decode_blob(&framed).unwrap(), payload);
    }

    #[test]
    fn test_reader_ignores_configuration() {
        // a blob written under `none` decodes even when the writer has since
        // switched to zstd
        let payload = b"old row".to_vec();
        let framed = encode_blob(BlobCodec::None, &payload).unwrap();
        assert_eq!(decode_blob(&framed).unwrap(), payload);
    }

    #[test]
    fn test_truncated_rejected() {
        assert!(matches!(decode_blob(&[0xC0]), Err(CodecError::Truncated(1))));
    }

    #[test]
    fn test_bad_magic_rejected() {
        assert!(matches!(
            decode_blob(&[0x00, 0x00, 0, 1, 9]),
            Err(CodecError::BadMagic(0, 0))
        ));
    }

    #[test]
    fn test_unknown_codec_rejected() {
        assert!(matches!(
            decode_blob(&[0xC0, 0xDE, 99, 1]),
            Err(CodecError::UnknownCodec(99))
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        assert!(matches!(
            decode_blob(&[0xC0, 0xDE, 0, 9]),
            Err(CodecError::UnknownVersion(9))
        ));
    }

    #[test]
    fn test_empty_payload() {
        let framed = encode_blob(BlobCodec::Zstd, &[]).unwrap();
        assert_eq!(decode_blob(&framed).unwrap(), Vec::<u8>::new());
    }
}
