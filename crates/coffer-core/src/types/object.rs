//! Object types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StorageRef;

/// Metadata entry for a stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    /// Bare ETag without quotes, either an MD5 hex digest or a composite `<hex>-<parts>`
    pub etag: String,
    pub content_type: String,
    pub last_modified: DateTime<Utc>,
    pub location: StorageRef,
}

impl ObjectMeta {
    pub fn validate_key(key: &str) -> Result<(), crate::Error> {
        if key.is_empty() {
            return Err(crate::Error::InvalidArgument("Object key must not be empty".into()));
        }
        if key.len() > crate::MAX_KEY_LENGTH {
            return Err(crate::Error::KeyTooLong);
        }
        Ok(())
    }
}

/// Parameters for listing a bucket
#[derive(Debug, Clone, Default)]
pub struct ListObjectsParams {
    pub prefix: String,
    pub delimiter: Option<String>,
    /// Exclusive lower bound: a key, or a common prefix returned by a previous page
    pub marker: Option<String>,
    pub max_keys: usize,
}

/// One page of a bucket listing
#[derive(Debug, Clone, Default)]
pub struct ObjectListing {
    pub objects: Vec<ObjectMeta>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    /// Last key or common prefix in this page, set when truncated
    pub next_marker: Option<String>,
}

/// Folds an ascending stream of object entries into a listing page.
///
/// Both metadata backends feed keys in lexicographic order and stop as soon
/// as [`ListingBuilder::push`] returns false.
pub struct ListingBuilder<'a> {
    params: &'a ListObjectsParams,
    listing: ObjectListing,
    entries: usize,
    last_entry: Option<String>,
}

impl<'a> ListingBuilder<'a> {
    pub fn new(params: &'a ListObjectsParams) -> Self {
        Self {
            params,
            listing: ObjectListing::default(),
            entries: 0,
            last_entry: None,
        }
    }

    /// Offer the next key; returns false once the page is full
    pub fn push(&mut self, meta: ObjectMeta) -> bool {
        let prefix = self.params.prefix.as_str();
        if !meta.key.starts_with(prefix) {
            return true;
        }
        let marker = self.params.marker.as_deref();
        if marker.is_some_and(|m| meta.key.as_str() <= m) {
            return true;
        }

        let common_prefix = self.params.delimiter.as_deref().and_then(|delim| {
            if delim.is_empty() {
                return None;
            }
            let rest = &meta.key[prefix.len()..];
            rest.find(delim)
                .map(|idx| format!("{}{}", prefix, &rest[..idx + delim.len()]))
        });

        match common_prefix {
            Some(cp) => {
                // Already emitted here or on an earlier page
                if self.last_entry.as_deref() == Some(cp.as_str())
                    || marker.is_some_and(|m| cp.as_str() <= m)
                {
                    return true;
                }
                if !self.make_room() {
                    return false;
                }
                self.last_entry = Some(cp.clone());
                self.listing.common_prefixes.push(cp);
            }
            None => {
                if !self.make_room() {
                    return false;
                }
                self.last_entry = Some(meta.key.clone());
                self.listing.objects.push(meta);
            }
        }
        true
    }

    /// An empty page is never truncated: no marker could advance past it
    fn make_room(&mut self) -> bool {
        if self.params.max_keys == 0 {
            return false;
        }
        if self.entries >= self.params.max_keys {
            self.listing.is_truncated = true;
            return false;
        }
        self.entries += 1;
        true
    }

    pub fn finish(mut self) -> ObjectListing {
        if self.listing.is_truncated {
            self.listing.next_marker = self.last_entry;
        }
        self.listing
    }
}

/// Single byte range from a `Range` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn parse(header: &str) -> Result<Self, crate::Error> {
        let range_str = header
            .trim()
            .strip_prefix("bytes=")
            .ok_or_else(|| crate::Error::InvalidRange("Invalid range format".into()))?;

        if range_str.contains(',') {
            return Err(crate::Error::InvalidRange(
                "Multiple ranges are not supported".into(),
            ));
        }

        let (start, end) = range_str
            .split_once('-')
            .ok_or_else(|| crate::Error::InvalidRange("Invalid range format".into()))?;

        let parse = |s: &str, what: &str| -> Result<Option<u64>, crate::Error> {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            s.parse::<u64>()
                .map(Some)
                .map_err(|_| crate::Error::InvalidRange(format!("Invalid range {}", what)))
        };

        let range = ByteRange {
            start: parse(start, "start")?,
            end: parse(end, "end")?,
        };
        if range.start.is_none() && range.end.is_none() {
            return Err(crate::Error::InvalidRange("Invalid range".into()));
        }
        Ok(range)
    }

    /// Resolve against an object size into an inclusive `(start, end)` pair
    pub fn resolve(&self, size: u64) -> Result<(u64, u64), crate::Error> {
        let unsatisfiable = || crate::Error::InvalidRange("Range not satisfiable".into());
        match (self.start, self.end) {
            (Some(start), Some(end)) => {
                if start > end || start >= size {
                    return Err(unsatisfiable());
                }
                Ok((start, end.min(size - 1)))
            }
            (Some(start), None) => {
                if start >= size {
                    return Err(unsatisfiable());
                }
                Ok((start, size - 1))
            }
            (None, Some(suffix)) => {
                if suffix == 0 || size == 0 {
                    return Err(unsatisfiable());
                }
                Ok((size.saturating_sub(suffix), size - 1))
            }
            (None, None) => Err(crate::Error::InvalidRange("Invalid range".into())),
        }
    }
}
