//! Multipart upload engine
//!
//! Session lifecycle:
//!
//! ```text
//! Initiated --complete--> Completing --> Completed (session deleted)
//!     |                       |
//!     |                       +--failure--> Initiated
//!     +--abort--> Aborted (session and parts deleted)
//! ```
//!
//! Parts for different part numbers are stored independently. Complete and
//! abort claim the session with a compare-and-swap out of `Initiated`, so when
//! they race exactly one wins and the other sees `NoSuchUpload`. Once a
//! session has left `Initiated` the metadata store refuses new part records,
//! which means a part still in flight at that moment is released instead of
//! being silently dropped from the assembled object.
//!
//! The ETag of the assembled object follows the S3 convention:
//! `hex(md5(md5(part_1) || ... || md5(part_n)))-n`, computed over the raw
//! 16-byte digests of the parts in the order the client listed them.

use chrono::{DateTime, Duration, Utc};
use coffer_core::types::{
    ListSessionsParams, ObjectMeta, PartRecord, SessionListing, SessionState, UploadSession,
};
use coffer_core::utils::{generate_upload_id, parse_etag};
use coffer_core::{Error, Result, MAX_LIST_ENTRIES, MAX_PARTS};
use coffer_crypto::multipart_etag;
use coffer_metadata::MetadataStore;
use coffer_storage::{ByteStream, StorageBackend};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{expected_md5, release_object, release_part};
use crate::metrics;

/// One page of a ListParts response
#[derive(Debug, Clone, Default)]
pub struct PartListing {
    pub parts: Vec<PartRecord>,
    pub part_number_marker: u32,
    pub next_part_number_marker: Option<u32>,
    pub max_parts: usize,
    pub is_truncated: bool,
}

#[derive(Clone)]
pub struct MultipartEngine {
    storage: Arc<dyn StorageBackend>,
    metadata: Arc<dyn MetadataStore>,
    min_part_size: u64,
}

impl MultipartEngine {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        metadata: Arc<dyn MetadataStore>,
        min_part_size: u64,
    ) -> Self {
        Self {
            storage,
            metadata,
            min_part_size,
        }
    }

    /// Look up a session addressed through `bucket`/`key` on behalf of `principal`
    async fn session_for(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        principal: Option<&str>,
    ) -> Result<UploadSession> {
        let session = self
            .metadata
            .get_upload_session(upload_id)
            .await?
            .filter(|s| s.bucket == bucket && s.key == key && !s.state.is_terminal())
            .ok_or(Error::NoSuchUpload)?;

        // Anonymous sessions can be driven by anyone who knows the id
        if let Some(initiator) = session.initiator.as_deref() {
            if principal != Some(initiator) {
                return Err(Error::AccessDenied);
            }
        }
        Ok(session)
    }

    pub async fn initiate(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        initiator: Option<String>,
    ) -> Result<UploadSession> {
        ObjectMeta::validate_key(key)?;

        let session = UploadSession::new(generate_upload_id(), bucket, key, content_type, initiator);
        self.metadata.create_upload_session(&session).await?;

        metrics::multipart_upload_opened();
        info!(
            "Initiated multipart upload {} for {}/{}",
            session.upload_id, bucket, key
        );
        Ok(session)
    }

    /// Store one part, replacing any earlier upload of the same part number
    #[allow(clippy::too_many_arguments)]
    pub async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: ByteStream,
        content_md5: Option<&str>,
        principal: Option<&str>,
    ) -> Result<PartRecord> {
        if !(1..=MAX_PARTS).contains(&part_number) {
            return Err(Error::InvalidArgument(format!(
                "Part number must be an integer between 1 and {}",
                MAX_PARTS
            )));
        }
        let expected = expected_md5(content_md5)?;

        let session = self.session_for(bucket, key, upload_id, principal).await?;
        if session.state != SessionState::Initiated {
            return Err(Error::NoSuchUpload);
        }

        let blob = self.storage.write_part(upload_id, part_number, data).await?;
        if expected.is_some_and(|md5| md5 != blob.md5) {
            release_part(self.storage.as_ref(), &blob.location).await;
            return Err(Error::BadDigest);
        }

        let record = PartRecord {
            part_number,
            size: blob.size,
            etag: blob.md5,
            last_modified: Utc::now(),
            location: blob.location,
        };

        match self.metadata.put_part_meta(upload_id, &record).await {
            Ok(previous) => {
                if let Some(previous) = previous {
                    release_part(self.storage.as_ref(), &previous.location).await;
                }
            }
            Err(e) => {
                // Session completed or aborted while the part was streaming
                release_part(self.storage.as_ref(), &record.location).await;
                return Err(e);
            }
        }

        metrics::record_bytes_written(record.size);
        metrics::record_part_uploaded();
        debug!(
            "Stored part {} of upload {} ({} bytes)",
            part_number, upload_id, record.size
        );
        Ok(record)
    }

    /// Assemble the listed parts, in the listed order, into the target object
    pub async fn complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        requested: &[(u32, String)],
        principal: Option<&str>,
    ) -> Result<ObjectMeta> {
        check_requested_parts(requested)?;

        let session = self.session_for(bucket, key, upload_id, principal).await?;
        if !self
            .metadata
            .compare_and_set_state(
                &session.upload_id,
                SessionState::Initiated,
                SessionState::Completing,
            )
            .await?
        {
            return Err(Error::NoSuchUpload);
        }

        // Parts may have landed between the lookup and the claim; none can land after it
        let assembled = match self.metadata.get_upload_session(upload_id).await {
            Ok(Some(claimed)) => self.assemble(&claimed, requested).await.map(|m| (claimed, m)),
            Ok(None) => Err(Error::NoSuchUpload),
            Err(e) => Err(e),
        };

        let (claimed, (meta, previous)) = match assembled {
            Ok(done) => done,
            Err(e) => {
                self.restore_initiated(upload_id).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .metadata
            .compare_and_set_state(upload_id, SessionState::Completing, SessionState::Completed)
            .await
        {
            warn!("Upload {} completed but not marked: {}", upload_id, e);
        }
        if let Err(e) = self.metadata.delete_session(upload_id).await {
            warn!("Failed to delete completed upload {}: {}", upload_id, e);
        }
        for part in claimed.parts.values() {
            release_part(self.storage.as_ref(), &part.location).await;
        }
        if let Some(previous) = previous {
            release_object(self.storage.as_ref(), &previous.location).await;
        }

        metrics::multipart_upload_closed();
        info!(
            "Completed multipart upload {} for {}/{} ({} parts, {} bytes)",
            upload_id,
            bucket,
            key,
            requested.len(),
            meta.size
        );
        Ok(meta)
    }

    /// Validate the requested parts against the session and publish the object.
    ///
    /// Returns the new entry and the one it replaced. Nothing is published on error.
    async fn assemble(
        &self,
        session: &UploadSession,
        requested: &[(u32, String)],
    ) -> Result<(ObjectMeta, Option<ObjectMeta>)> {
        let mut etags = Vec::with_capacity(requested.len());
        let mut locations = Vec::with_capacity(requested.len());

        for (idx, (part_number, etag)) in requested.iter().enumerate() {
            let part = session.parts.get(part_number).ok_or_else(|| {
                Error::InvalidPart(format!("part {} was not uploaded", part_number))
            })?;
            if parse_etag(etag) != part.etag {
                return Err(Error::InvalidPart(format!(
                    "ETag mismatch for part {}",
                    part_number
                )));
            }
            let is_last = idx + 1 == requested.len();
            if !is_last && part.size < self.min_part_size {
                return Err(Error::EntityTooSmall(format!(
                    "part {} is {} bytes, minimum is {}",
                    part_number, part.size, self.min_part_size
                )));
            }
            etags.push(part.etag.as_str());
            locations.push(part.location.clone());
        }

        let etag = multipart_etag(&etags)
            .ok_or_else(|| Error::InternalError("stored part ETag is not an MD5".into()))?;

        let blob = self
            .storage
            .concatenate_parts(&session.bucket, &session.key, &locations)
            .await?;

        let meta = ObjectMeta {
            bucket: session.bucket.clone(),
            key: session.key.clone(),
            size: blob.size,
            etag,
            content_type: session.content_type.clone(),
            last_modified: Utc::now(),
            location: blob.location,
        };

        match self.metadata.put_object_meta(&meta).await {
            Ok(previous) => {
                metrics::record_bytes_written(meta.size);
                Ok((meta, previous))
            }
            Err(e) => {
                release_object(self.storage.as_ref(), &meta.location).await;
                Err(e)
            }
        }
    }

    async fn restore_initiated(&self, upload_id: &str) {
        match self
            .metadata
            .compare_and_set_state(upload_id, SessionState::Completing, SessionState::Initiated)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!("Upload {} left Completing during a failed completion", upload_id),
            Err(e) => error!("Failed to reopen upload {}: {}", upload_id, e),
        }
    }

    pub async fn abort(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        principal: Option<&str>,
    ) -> Result<()> {
        let session = self.session_for(bucket, key, upload_id, principal).await?;
        if !self.discard(&session.upload_id).await? {
            return Err(Error::NoSuchUpload);
        }
        info!("Aborted multipart upload {} for {}/{}", upload_id, bucket, key);
        Ok(())
    }

    /// Claim an `Initiated` session for abort and release everything it holds
    async fn discard(&self, upload_id: &str) -> Result<bool> {
        if !self
            .metadata
            .compare_and_set_state(upload_id, SessionState::Initiated, SessionState::Aborted)
            .await?
        {
            return Ok(false);
        }

        if let Some(removed) = self.metadata.delete_session(upload_id).await? {
            for part in removed.parts.values() {
                release_part(self.storage.as_ref(), &part.location).await;
            }
        }
        metrics::multipart_upload_closed();
        Ok(true)
    }

    pub async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number_marker: u32,
        max_parts: usize,
        principal: Option<&str>,
    ) -> Result<(UploadSession, PartListing)> {
        let session = self.session_for(bucket, key, upload_id, principal).await?;
        let max_parts = max_parts.min(MAX_LIST_ENTRIES);

        let mut listing = PartListing {
            part_number_marker,
            max_parts,
            ..Default::default()
        };
        // An empty page is never truncated
        if max_parts > 0 {
            for part in session.parts.range(part_number_marker.saturating_add(1)..).map(|(_, p)| p) {
                if listing.parts.len() >= max_parts {
                    listing.is_truncated = true;
                    break;
                }
                listing.parts.push(part.clone());
            }
        }
        if listing.is_truncated {
            listing.next_part_number_marker = listing.parts.last().map(|p| p.part_number);
        }
        Ok((session, listing))
    }

    pub async fn list_uploads(
        &self,
        bucket: &str,
        params: ListSessionsParams,
    ) -> Result<SessionListing> {
        if !self.metadata.bucket_exists(bucket).await? {
            return Err(Error::NoSuchBucket);
        }
        let params = ListSessionsParams {
            bucket: Some(bucket.to_string()),
            max_uploads: params.max_uploads.min(MAX_LIST_ENTRIES),
            ..params
        };
        self.metadata.list_sessions(&params).await
    }

    /// Number of sessions still accepting parts, across all buckets
    pub async fn count_open(&self) -> Result<usize> {
        let mut open = 0;
        for bucket in self.metadata.list_buckets().await? {
            let mut params = ListSessionsParams {
                bucket: Some(bucket.name.clone()),
                max_uploads: MAX_LIST_ENTRIES,
                ..Default::default()
            };
            loop {
                let page = self.metadata.list_sessions(&params).await?;
                open += page
                    .sessions
                    .iter()
                    .filter(|s| s.state == SessionState::Initiated)
                    .count();
                if !page.is_truncated {
                    break;
                }
                params.key_marker = page.next_key_marker;
                params.upload_id_marker = page.next_upload_id_marker;
            }
        }
        Ok(open)
    }

    /// Abort every `Initiated` session created before `now - max_age`
    pub async fn reap_stale(&self, max_age: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - max_age;
        let mut reaped = 0;

        for bucket in self.metadata.list_buckets().await? {
            let mut params = ListSessionsParams {
                bucket: Some(bucket.name.clone()),
                max_uploads: MAX_LIST_ENTRIES,
                initiated_before: Some(cutoff),
                ..Default::default()
            };
            loop {
                let page = self.metadata.list_sessions(&params).await?;
                for summary in &page.sessions {
                    if summary.state == SessionState::Initiated
                        && self.discard(&summary.upload_id).await?
                    {
                        info!(
                            "Reaped stale upload {} for {}/{}",
                            summary.upload_id, summary.bucket, summary.key
                        );
                        metrics::record_upload_reaped();
                        reaped += 1;
                    }
                }
                if !page.is_truncated {
                    break;
                }
                params.key_marker = page.next_key_marker;
                params.upload_id_marker = page.next_upload_id_marker;
            }
        }
        Ok(reaped)
    }
}

fn check_requested_parts(requested: &[(u32, String)]) -> Result<()> {
    if requested.is_empty() {
        return Err(Error::MalformedXML(
            "You must specify at least one part".into(),
        ));
    }
    let mut seen = HashSet::with_capacity(requested.len());
    for (part_number, _) in requested {
        if !(1..=MAX_PARTS).contains(part_number) {
            return Err(Error::InvalidPart(format!(
                "part number {} is out of range",
                part_number
            )));
        }
        if !seen.insert(*part_number) {
            return Err(Error::InvalidPart(format!(
                "part {} is listed more than once",
                part_number
            )));
        }
    }
    Ok(())
}
