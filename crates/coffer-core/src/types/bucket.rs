//! Bucket types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub name: String,
    pub region: String,
    pub created_at: DateTime<Utc>,
}

impl Bucket {
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            created_at: Utc::now(),
        }
    }

    /// Checks S3 DNS-compatible bucket naming rules
    pub fn validate_name(name: &str) -> Result<(), crate::Error> {
        if name.len() < crate::MIN_BUCKET_NAME_LENGTH {
            return Err(crate::Error::InvalidBucketName(
                "Bucket name too short (min 3 characters)".into(),
            ));
        }
        if name.len() > crate::MAX_BUCKET_NAME_LENGTH {
            return Err(crate::Error::InvalidBucketName(
                "Bucket name too long (max 63 characters)".into(),
            ));
        }

        let bytes = name.as_bytes();
        let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();

        if !is_alnum(bytes[0]) {
            return Err(crate::Error::InvalidBucketName(
                "Must start with lowercase letter or number".into(),
            ));
        }
        if !is_alnum(bytes[bytes.len() - 1]) {
            return Err(crate::Error::InvalidBucketName(
                "Must end with lowercase letter or number".into(),
            ));
        }

        if let Some(c) = name.chars().find(|c| {
            !c.is_ascii_lowercase() && !c.is_ascii_digit() && *c != '-' && *c != '.'
        }) {
            return Err(crate::Error::InvalidBucketName(format!(
                "Invalid character: {}",
                c
            )));
        }

        if name.contains("..") || name.contains(".-") || name.contains("-.") {
            return Err(crate::Error::InvalidBucketName(
                "Periods must not be adjacent to periods or hyphens".into(),
            ));
        }

        if name.split('.').count() == 4 && name.split('.').all(|p| p.parse::<u8>().is_ok()) {
            return Err(crate::Error::InvalidBucketName(
                "Must not be formatted as an IP address".into(),
            ));
        }

        Ok(())
    }
}
