//! Multipart upload session types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::StorageRef;

/// Lifecycle state of an upload session.
///
/// `Initiated` is the only state that accepts parts. Complete and abort move a
/// session out of it with a compare-and-swap, so exactly one of them can win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Initiated,
    Completing,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initiated" => Some(Self::Initiated),
            "completing" => Some(Self::Completing),
            "completed" => Some(Self::Completed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// Completed and aborted sessions are on their way out
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// One uploaded part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    pub part_number: u32,
    pub size: u64,
    /// MD5 hex digest of the part bytes, without quotes
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub location: StorageRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub content_type: String,
    /// Access key that initiated the upload, `None` for anonymous uploads
    pub initiator: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
    pub parts: BTreeMap<u32, PartRecord>,
}

impl UploadSession {
    pub fn new(
        upload_id: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        content_type: impl Into<String>,
        initiator: Option<String>,
    ) -> Self {
        Self {
            upload_id: upload_id.into(),
            bucket: bucket.into(),
            key: key.into(),
            content_type: content_type.into(),
            initiator,
            created_at: Utc::now(),
            state: SessionState::Initiated,
            parts: BTreeMap::new(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            upload_id: self.upload_id.clone(),
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            initiator: self.initiator.clone(),
            created_at: self.created_at,
            state: self.state,
        }
    }
}

/// Session without its parts, as returned by listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub initiator: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
}

#[derive(Debug, Clone, Default)]
pub struct ListSessionsParams {
    /// Restrict to one bucket; `None` enumerates every bucket
    pub bucket: Option<String>,
    pub prefix: String,
    pub key_marker: Option<String>,
    pub upload_id_marker: Option<String>,
    pub max_uploads: usize,
    /// Only sessions created strictly before this instant
    pub initiated_before: Option<DateTime<Utc>>,
}

impl ListSessionsParams {
    /// Whether a session sorts after the (key, upload id) markers and passes the filters
    pub fn admits(&self, s: &SessionSummary) -> bool {
        if let Some(bucket) = &self.bucket {
            if &s.bucket != bucket {
                return false;
            }
        }
        if !s.key.starts_with(&self.prefix) {
            return false;
        }
        if let Some(before) = self.initiated_before {
            if s.created_at >= before {
                return false;
            }
        }
        match (&self.key_marker, &self.upload_id_marker) {
            (Some(km), Some(um)) => {
                s.key.as_str() > km.as_str()
                    || (s.key == *km && s.upload_id.as_str() > um.as_str())
            }
            (Some(km), None) => s.key.as_str() > km.as_str(),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionListing {
    pub sessions: Vec<SessionSummary>,
    pub is_truncated: bool,
    pub next_key_marker: Option<String>,
    pub next_upload_id_marker: Option<String>,
}

impl SessionListing {
    /// Build a page from candidates sorted by (bucket, key, upload id)
    pub fn from_sorted(
        candidates: impl IntoIterator<Item = SessionSummary>,
        params: &ListSessionsParams,
    ) -> Self {
        let mut listing = SessionListing::default();
        if params.max_uploads == 0 {
            return listing;
        }
        for s in candidates.into_iter().filter(|s| params.admits(s)) {
            if listing.sessions.len() >= params.max_uploads {
                listing.is_truncated = true;
                break;
            }
            listing.sessions.push(s);
        }
        if listing.is_truncated {
            if let Some(last) = listing.sessions.last() {
                listing.next_key_marker = Some(last.key.clone());
                listing.next_upload_id_marker = Some(last.upload_id.clone());
            }
        }
        listing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(key: &str, id: &str) -> SessionSummary {
        UploadSession::new(id, "bucket", key, "application/octet-stream", None).summary()
    }

    #[test]
    fn test_state_round_trip_names() {
        for state in [
            SessionState::Initiated,
            SessionState::Completing,
            SessionState::Completed,
            SessionState::Aborted,
        ] {
            assert_eq!(SessionState::parse(state.as_str()), Some(state));
        }
        assert!(SessionState::Aborted.is_terminal());
        assert!(!SessionState::Completing.is_terminal());
    }

    #[test]
    fn test_session_listing_markers() {
        let all = vec![
            summary("a", "1"),
            summary("a", "2"),
            summary("b", "1"),
            summary("c", "1"),
        ];
        let mut params = ListSessionsParams {
            max_uploads: 2,
            ..Default::default()
        };

        let page = SessionListing::from_sorted(all.clone(), &params);
        assert_eq!(page.sessions.len(), 2);
        assert!(page.is_truncated);
        assert_eq!(page.next_key_marker.as_deref(), Some("a"));
        assert_eq!(page.next_upload_id_marker.as_deref(), Some("2"));

        params.key_marker = page.next_key_marker;
        params.upload_id_marker = page.next_upload_id_marker;
        let page = SessionListing::from_sorted(all, &params);
        let keys: Vec<_> = page.sessions.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert!(!page.is_truncated);

        params.max_uploads = 0;
        let page = SessionListing::from_sorted(vec![summary("d", "1")], &params);
        assert!(page.sessions.is_empty());
        assert!(!page.is_truncated);
        assert!(page.next_key_marker.is_none());
    }
}
