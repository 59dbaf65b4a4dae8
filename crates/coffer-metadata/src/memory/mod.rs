//! In-memory metadata store
//!
//! Buckets live in a sharded map; each bucket guards its own object index, so
//! writers to different buckets never contend. Sessions live in a second
//! sharded map keyed by upload id. Locks are always taken bucket first, then
//! session shard, and never held across an await point.

use async_trait::async_trait;
use coffer_core::types::{
    Bucket, ListObjectsParams, ListSessionsParams, ListingBuilder, ObjectListing, ObjectMeta,
    PartRecord, SessionListing, SessionState, UploadSession,
};
use coffer_core::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;

use crate::traits::MetadataStore;

struct BucketEntry {
    bucket: Bucket,
    state: RwLock<BucketState>,
}

#[derive(Default)]
struct BucketState {
    objects: BTreeMap<String, ObjectMeta>,
    live_sessions: usize,
    /// Set under the lock right before the entry leaves the map
    deleted: bool,
}

#[derive(Default)]
pub struct MemoryMetadataStore {
    buckets: DashMap<String, Arc<BucketEntry>>,
    sessions: DashMap<String, UploadSession>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket_entry(&self, name: &str) -> Result<Arc<BucketEntry>> {
        self.buckets
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or(Error::NoSuchBucket)
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create_bucket(&self, bucket: &Bucket) -> Result<()> {
        match self.buckets.entry(bucket.name.clone()) {
            Entry::Occupied(_) => Err(Error::BucketAlreadyExists),
            Entry::Vacant(v) => {
                v.insert(Arc::new(BucketEntry {
                    bucket: bucket.clone(),
                    state: RwLock::new(BucketState::default()),
                }));
                debug!("Created bucket: {}", bucket.name);
                Ok(())
            }
        }
    }

    async fn get_bucket(&self, name: &str) -> Result<Option<Bucket>> {
        Ok(self.buckets.get(name).map(|e| e.bucket.clone()))
    }

    async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        let mut buckets: Vec<Bucket> = self.buckets.iter().map(|e| e.bucket.clone()).collect();
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    async fn delete_bucket(&self, name: &str) -> Result<()> {
        let entry = self.bucket_entry(name)?;
        {
            let mut state = entry.state.write();
            if state.deleted {
                return Err(Error::NoSuchBucket);
            }
            if !state.objects.is_empty() || state.live_sessions > 0 {
                return Err(Error::BucketNotEmpty);
            }
            state.deleted = true;
        }
        self.buckets
            .remove_if(name, |_, current| Arc::ptr_eq(current, &entry));
        debug!("Deleted bucket: {}", name);
        Ok(())
    }

    async fn put_object_meta(&self, meta: &ObjectMeta) -> Result<Option<ObjectMeta>> {
        let entry = self.bucket_entry(&meta.bucket)?;
        let mut state = entry.state.write();
        if state.deleted {
            return Err(Error::NoSuchBucket);
        }
        Ok(state.objects.insert(meta.key.clone(), meta.clone()))
    }

    async fn get_object_meta(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let entry = self.bucket_entry(bucket)?;
        let state = entry.state.read();
        Ok(state.objects.get(key).cloned())
    }

    async fn delete_object_meta(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let entry = self.bucket_entry(bucket)?;
        let mut state = entry.state.write();
        Ok(state.objects.remove(key))
    }

    async fn list_objects(&self, bucket: &str, params: &ListObjectsParams) -> Result<ObjectListing> {
        let entry = self.bucket_entry(bucket)?;
        let state = entry.state.read();

        let prefix = params.prefix.as_str();
        let start = match params.marker.as_deref() {
            Some(marker) if marker >= prefix => Bound::Excluded(marker),
            _ => Bound::Included(prefix),
        };

        let mut builder = ListingBuilder::new(params);
        for (key, meta) in state
            .objects
            .range::<str, _>((start, Bound::Unbounded))
        {
            if !key.starts_with(prefix) {
                break;
            }
            if !builder.push(meta.clone()) {
                break;
            }
        }
        Ok(builder.finish())
    }

    async fn create_upload_session(&self, session: &UploadSession) -> Result<()> {
        let entry = self.bucket_entry(&session.bucket)?;
        let mut state = entry.state.write();
        if state.deleted {
            return Err(Error::NoSuchBucket);
        }
        state.live_sessions += 1;
        self.sessions
            .insert(session.upload_id.clone(), session.clone());
        debug!(
            "Created upload session {} for {}/{}",
            session.upload_id, session.bucket, session.key
        );
        Ok(())
    }

    async fn get_upload_session(&self, upload_id: &str) -> Result<Option<UploadSession>> {
        Ok(self.sessions.get(upload_id).map(|s| s.value().clone()))
    }

    async fn put_part_meta(&self, upload_id: &str, part: &PartRecord) -> Result<Option<PartRecord>> {
        let mut session = self.sessions.get_mut(upload_id).ok_or(Error::NoSuchUpload)?;
        if session.state != SessionState::Initiated {
            return Err(Error::NoSuchUpload);
        }
        Ok(session.parts.insert(part.part_number, part.clone()))
    }

    async fn compare_and_set_state(
        &self,
        upload_id: &str,
        expected: SessionState,
        new: SessionState,
    ) -> Result<bool> {
        match self.sessions.get_mut(upload_id) {
            Some(mut session) if session.state == expected => {
                session.state = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_sessions(&self, params: &ListSessionsParams) -> Result<SessionListing> {
        let mut candidates: Vec<_> = self
            .sessions
            .iter()
            .filter(|s| !s.state.is_terminal())
            .map(|s| s.summary())
            .collect();
        candidates.sort_by(|a, b| {
            (&a.bucket, &a.key, &a.upload_id).cmp(&(&b.bucket, &b.key, &b.upload_id))
        });
        Ok(SessionListing::from_sorted(candidates, params))
    }

    async fn delete_session(&self, upload_id: &str) -> Result<Option<UploadSession>> {
        let Some((_, session)) = self.sessions.remove(upload_id) else {
            return Ok(None);
        };
        if let Ok(entry) = self.bucket_entry(&session.bucket) {
            let mut state = entry.state.write();
            state.live_sessions = state.live_sessions.saturating_sub(1);
        }
        debug!("Deleted upload session {}", upload_id);
        Ok(Some(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use coffer_core::types::StorageRef;

    fn meta(bucket: &str, key: &str) -> ObjectMeta {
        ObjectMeta {
            bucket: bucket.into(),
            key: key.into(),
            size: 3,
            etag: "acbd18db4cc2f85cedef654fccc4a4d8".into(),
            content_type: "text/plain".into(),
            last_modified: Utc::now(),
            location: StorageRef::new(format!("objects/{}/{}", bucket, key)),
        }
    }

    fn part(n: u32, etag: &str) -> PartRecord {
        PartRecord {
            part_number: n,
            size: 1,
            etag: etag.into(),
            last_modified: Utc::now(),
            location: StorageRef::new(format!("parts/{}", etag)),
        }
    }

    async fn store_with_bucket() -> MemoryMetadataStore {
        let store = MemoryMetadataStore::new();
        store
            .create_bucket(&Bucket::new("bucket", "us-east-1"))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_bucket_lifecycle() {
        let store = store_with_bucket().await;
        assert!(matches!(
            store.create_bucket(&Bucket::new("bucket", "us-east-1")).await,
            Err(Error::BucketAlreadyExists)
        ));
        assert!(store.bucket_exists("bucket").await.unwrap());

        store.put_object_meta(&meta("bucket", "k")).await.unwrap();
        assert!(matches!(
            store.delete_bucket("bucket").await,
            Err(Error::BucketNotEmpty)
        ));

        store.delete_object_meta("bucket", "k").await.unwrap();
        store.delete_bucket("bucket").await.unwrap();
        assert!(matches!(
            store.delete_bucket("bucket").await,
            Err(Error::NoSuchBucket)
        ));
        assert!(matches!(
            store.put_object_meta(&meta("bucket", "k")).await,
            Err(Error::NoSuchBucket)
        ));
    }

    #[tokio::test]
    async fn test_put_returns_replaced_entry() {
        let store = store_with_bucket().await;
        assert!(store.put_object_meta(&meta("bucket", "k")).await.unwrap().is_none());

        let mut second = meta("bucket", "k");
        second.size = 10;
        let prev = store.put_object_meta(&second).await.unwrap().unwrap();
        assert_eq!(prev.size, 3);
        assert_eq!(
            store.get_object_meta("bucket", "k").await.unwrap().unwrap().size,
            10
        );
    }

    #[tokio::test]
    async fn test_list_objects_with_delimiter() {
        let store = store_with_bucket().await;
        for key in ["a/b", "a/c", "a/d/e", "b"] {
            store.put_object_meta(&meta("bucket", key)).await.unwrap();
        }

        let listing = store
            .list_objects(
                "bucket",
                &ListObjectsParams {
                    prefix: "a/".into(),
                    delimiter: Some("/".into()),
                    marker: None,
                    max_keys: 1000,
                },
            )
            .await
            .unwrap();

        let keys: Vec<_> = listing.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["a/b", "a/c"]);
        assert_eq!(listing.common_prefixes, vec!["a/d/"]);
    }

    #[tokio::test]
    async fn test_sessions_block_bucket_delete() {
        let store = store_with_bucket().await;
        let session = UploadSession::new("u1", "bucket", "k", "text/plain", None);
        store.create_upload_session(&session).await.unwrap();

        assert!(matches!(
            store.delete_bucket("bucket").await,
            Err(Error::BucketNotEmpty)
        ));
        store.delete_session("u1").await.unwrap();
        store.delete_bucket("bucket").await.unwrap();
    }

    #[tokio::test]
    async fn test_parts_only_accepted_while_initiated() {
        let store = store_with_bucket().await;
        let session = UploadSession::new("u1", "bucket", "k", "text/plain", None);
        store.create_upload_session(&session).await.unwrap();

        assert!(store.put_part_meta("u1", &part(2, "a")).await.unwrap().is_none());
        let prev = store.put_part_meta("u1", &part(2, "b")).await.unwrap();
        assert_eq!(prev.unwrap().etag, "a");

        assert!(store
            .compare_and_set_state("u1", SessionState::Initiated, SessionState::Completing)
            .await
            .unwrap());
        assert!(matches!(
            store.put_part_meta("u1", &part(3, "c")).await,
            Err(Error::NoSuchUpload)
        ));

        let stored = store.get_upload_session("u1").await.unwrap().unwrap();
        assert_eq!(stored.parts.len(), 1);
        assert_eq!(stored.parts[&2].etag, "b");
    }

    #[tokio::test]
    async fn test_compare_and_set_has_one_winner() {
        let store = Arc::new(store_with_bucket().await);
        let session = UploadSession::new("u1", "bucket", "k", "text/plain", None);
        store.create_upload_session(&session).await.unwrap();

        let tasks: Vec<_> = [SessionState::Completing, SessionState::Aborted]
            .into_iter()
            .map(|target| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .compare_and_set_state("u1", SessionState::Initiated, target)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let wins: usize = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
        assert!(!store
            .compare_and_set_state("missing", SessionState::Initiated, SessionState::Aborted)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_list_sessions_skips_terminal() {
        let store = store_with_bucket().await;
        for id in ["u1", "u2", "u3"] {
            let session = UploadSession::new(id, "bucket", format!("key-{}", id), "text/plain", None);
            store.create_upload_session(&session).await.unwrap();
        }
        store
            .compare_and_set_state("u2", SessionState::Initiated, SessionState::Aborted)
            .await
            .unwrap();

        let listing = store
            .list_sessions(&ListSessionsParams {
                bucket: Some("bucket".into()),
                max_uploads: 1000,
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<_> = listing.sessions.iter().map(|s| s.upload_id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u3"]);
    }
}
