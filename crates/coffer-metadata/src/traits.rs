//! Metadata repository trait
//!
//! Every mutating call is atomic with respect to the bucket, key or upload id
//! it touches. Listings are read-committed: they may miss a concurrent write
//! but never show a half-applied one.

use async_trait::async_trait;
use coffer_core::types::{
    Bucket, ListObjectsParams, ListSessionsParams, ObjectListing, ObjectMeta, PartRecord,
    SessionListing, SessionState, UploadSession,
};
use coffer_core::Result;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    // ============= Bucket Operations =============

    /// Fails with `BucketAlreadyExists` when the name is taken
    async fn create_bucket(&self, bucket: &Bucket) -> Result<()>;
    async fn get_bucket(&self, name: &str) -> Result<Option<Bucket>>;
    async fn list_buckets(&self) -> Result<Vec<Bucket>>;

    /// `NoSuchBucket` when absent, `BucketNotEmpty` while objects or upload sessions remain
    async fn delete_bucket(&self, name: &str) -> Result<()>;

    async fn bucket_exists(&self, name: &str) -> Result<bool> {
        Ok(self.get_bucket(name).await?.is_some())
    }

    // ============= Object Operations =============

    /// Insert or replace the entry, returning the one it replaced
    async fn put_object_meta(&self, meta: &ObjectMeta) -> Result<Option<ObjectMeta>>;
    async fn get_object_meta(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>>;
    async fn delete_object_meta(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>>;
    async fn list_objects(&self, bucket: &str, params: &ListObjectsParams) -> Result<ObjectListing>;

    // ============= Multipart Operations =============

    /// Fails with `NoSuchBucket` when the target bucket is gone
    async fn create_upload_session(&self, session: &UploadSession) -> Result<()>;
    async fn get_upload_session(&self, upload_id: &str) -> Result<Option<UploadSession>>;

    /// Record a part, returning the record it replaced.
    ///
    /// Only an `Initiated` session accepts parts; anything else is `NoSuchUpload`.
    async fn put_part_meta(&self, upload_id: &str, part: &PartRecord) -> Result<Option<PartRecord>>;

    /// Move a session from `expected` to `new`; false when it was not in `expected`
    async fn compare_and_set_state(
        &self,
        upload_id: &str,
        expected: SessionState,
        new: SessionState,
    ) -> Result<bool>;

    /// Live sessions (`Initiated` or `Completing`) ordered by bucket, key and upload id
    async fn list_sessions(&self, params: &ListSessionsParams) -> Result<SessionListing>;

    /// Remove a session with its part records, returning what was removed
    async fn delete_session(&self, upload_id: &str) -> Result<Option<UploadSession>>;
}
