//! Content metadata for fetched images

use pixtag_common::ImageMetadata;
use sha2::{Digest, Sha256};

const FALLBACK_MIME: &str = "application/octet-stream";

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// MIME type from the response header, else sniffed from the bytes.
///
/// Header parameters (`; charset=...`) are dropped. A generic
/// `application/octet-stream` header is treated as absent.
pub fn detect_mime(content_type: Option<&str>, bytes: &[u8]) -> String {
    let declared = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .filter(|ct| !ct.is_empty() && ct != FALLBACK_MIME);

    declared
        .or_else(|| infer::get(bytes).map(|kind| kind.mime_type().to_string()))
        .unwrap_or_else(|| FALLBACK_MIME.to_string())
}

pub fn describe(bytes: &[u8], content_type: Option<&str>) -> ImageMetadata {
    ImageMetadata {
        mime_type: detect_mime(content_type, bytes),
        byte_size: bytes.len() as i64,
        content_hash: sha256_hex(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_header_wins_and_parameters_are_stripped() {
        assert_eq!(detect_mime(Some("image/JPEG; charset=binary"), PNG_HEADER), "image/jpeg");
    }

    #[test]
    fn test_sniffs_when_header_missing_or_generic() {
        assert_eq!(detect_mime(None, PNG_HEADER), "image/png");
        assert_eq!(detect_mime(Some("application/octet-stream"), PNG_HEADER), "image/png");
        assert_eq!(detect_mime(Some("  "), PNG_HEADER), "image/png");
    }

    #[test]
    fn test_unknown_content_falls_back() {
        assert_eq!(detect_mime(None, b"not an image"), FALLBACK_MIME);
    }

    #[test]
    fn test_describe() {
        let meta = describe(b"abc", Some("image/webp"));
        assert_eq!(meta.byte_size, 3);
        assert_eq!(meta.mime_type, "image/webp");
        assert_eq!(meta.content_hash.len(), 64);
    }
}
