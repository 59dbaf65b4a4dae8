//! Hash utilities

use base64::{engine::general_purpose::STANDARD, Engine};
use digest::Digest;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// SHA-256 of the empty string, used for empty payloads and chunk signatures
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

pub fn md5_hash(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn sha256_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub fn hmac_sha256_hex(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

pub fn md5_base64(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    STANDARD.encode(hasher.finalize())
}

/// Decode a `Content-MD5` header into a hex digest.
///
/// Returns `None` unless the header is base64 of exactly 16 bytes.
pub fn content_md5_to_hex(header: &str) -> Option<String> {
    let raw = STANDARD.decode(header.trim()).ok()?;
    if raw.len() != 16 {
        return None;
    }
    Some(hex::encode(raw))
}

/// Compare two byte strings without short-circuiting on the first difference
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Calculate multipart upload ETag
/// Format: hex(MD5(concat(raw part MD5 digests)))-part_count
///
/// Returns `None` when an input is not a 32-character hex MD5 (quotes are ignored).
pub fn multipart_etag<S: AsRef<str>>(part_etags: &[S]) -> Option<String> {
    let mut hasher = Md5::new();

    for etag in part_etags {
        let clean = etag.as_ref().trim_matches('"');
        let bytes = hex::decode(clean).ok()?;
        if bytes.len() != 16 {
            return None;
        }
        hasher.update(&bytes);
    }

    Some(format!("{}-{}", hex::encode(hasher.finalize()), part_etags.len()))
}

/// Incremental MD5 for data that arrives in chunks
#[derive(Default)]
pub struct Md5Hasher(Md5);

impl Md5Hasher {
    pub fn new() -> Self {
        Self(Md5::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.0.finalize())
    }
}

/// Incremental SHA-256 for data that arrives in chunks
#[derive(Default)]
pub struct Sha256Hasher(Sha256);

impl Sha256Hasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.0.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(md5_hash(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(sha256_hash(b""), EMPTY_SHA256);
        assert_eq!(md5_base64(b"hello"), "XUFAKrxLKna5cZ2REBfFkg==");
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut md5 = Md5Hasher::new();
        let mut sha = Sha256Hasher::new();
        for chunk in [&b"hello "[..], &b"world"[..]] {
            md5.update(chunk);
            sha.update(chunk);
        }
        assert_eq!(md5.finalize_hex(), md5_hash(b"hello world"));
        assert_eq!(sha.finalize_hex(), sha256_hash(b"hello world"));
    }

    #[test]
    fn test_content_md5() {
        assert_eq!(
            content_md5_to_hex("XUFAKrxLKna5cZ2REBfFkg==").as_deref(),
            Some(md5_hash(b"hello").as_str())
        );
        assert!(content_md5_to_hex("not base64!").is_none());
        assert!(content_md5_to_hex("aGVsbG8=").is_none());
    }

    #[test]
    fn test_multipart_etag() {
        let p1 = md5_hash(b"part one");
        let p2 = md5_hash(b"part two");

        let mut raw = hex::decode(&p1).unwrap();
        raw.extend(hex::decode(&p2).unwrap());
        let expected = format!("{}-2", md5_hash(&raw));

        assert_eq!(multipart_etag(&[p1.clone(), p2.clone()]), Some(expected.clone()));
        assert_eq!(
            multipart_etag(&[format!("\"{}\"", p1), p2]),
            Some(expected)
        );
        assert_eq!(multipart_etag(&["zz"]), None);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
