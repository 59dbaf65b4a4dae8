//! Canonical request construction
//!
//! ```text
//! HTTPRequestMethod\n
//! CanonicalURI\n
//! CanonicalQueryString\n
//! CanonicalHeaders\n
//! SignedHeaders\n
//! HashedPayload
//! ```

use coffer_core::{Error, Result};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::BTreeMap;

/// Everything except the RFC 3986 unreserved characters is encoded
pub const URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub fn uri_encode(input: &str) -> String {
    utf8_percent_encode(input, URI_ENCODE_SET).to_string()
}

pub fn build_canonical_request(
    method: &str,
    path: &str,
    query: &str,
    headers: &BTreeMap<String, String>,
    signed_headers: &[String],
    payload_hash: &str,
    skip_query_param: Option<&str>,
) -> Result<String> {
    Ok(format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        build_canonical_uri(path),
        build_canonical_query_string(query, skip_query_param),
        build_canonical_headers(headers, signed_headers)?,
        signed_headers.join(";"),
        payload_hash
    ))
}

/// Each segment is decoded then re-encoded so already-encoded paths do not get double-encoded
pub fn build_canonical_uri(path: &str) -> String {
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }

    path.split('/')
        .map(|segment| uri_encode(&percent_decode_str(segment).decode_utf8_lossy()))
        .collect::<Vec<_>>()
        .join("/")
}

/// Sorts the raw `key=value` pairs as sent; clients sign exactly what they put on the wire
pub fn build_canonical_query_string(query: &str, skip_param: Option<&str>) -> String {
    let mut params: Vec<(&str, &str)> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| p.split_once('=').unwrap_or((p, "")))
        .filter(|(k, _)| Some(*k) != skip_param)
        .collect();

    params.sort_unstable();

    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Headers are expected with lowercase names; each line ends with a newline
pub fn build_canonical_headers(
    headers: &BTreeMap<String, String>,
    signed_headers: &[String],
) -> Result<String> {
    let mut result = String::new();

    for name in signed_headers {
        let value = headers.get(name.as_str()).ok_or_else(|| {
            Error::AuthorizationHeaderMalformed(format!("signed header '{}' is missing", name))
        })?;
        result.push_str(name);
        result.push(':');
        result.push_str(&normalize_header_value(value));
        result.push('\n');
    }

    Ok(result)
}

fn normalize_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
