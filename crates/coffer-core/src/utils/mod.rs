//! Utility functions

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Generate a unique request ID
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string().replace('-', "").to_uppercase()
}

/// Generate a multipart upload ID
pub fn generate_upload_id() -> String {
    // Two v4 UUIDs give 244 random bits
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// Generate an ETag header value from a bare hash
pub fn generate_etag(hash: &str) -> String {
    format!("\"{}\"", hash)
}

/// Parse ETag (remove quotes)
pub fn parse_etag(etag: &str) -> String {
    etag.trim().trim_matches('"').to_string()
}

/// XML escape string
pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Format datetime for S3 responses
pub fn format_s3_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Format datetime for HTTP headers
pub fn format_http_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_etag_quoting() {
        assert_eq!(generate_etag("abc"), "\"abc\"");
        assert_eq!(parse_etag("\"abc\""), "abc");
        assert_eq!(parse_etag(" abc "), "abc");
    }

    #[test]
    fn test_upload_ids_are_unique() {
        let a = generate_upload_id();
        let b = generate_upload_id();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_datetime_formats() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(format_s3_datetime(&dt), "2024-03-09T07:05:01.000Z");
        assert_eq!(format_http_datetime(&dt), "Sat, 09 Mar 2024 07:05:01 GMT");
    }
}
