use chrono::Utc;
use coffer_core::types::{ByteRange, ListObjectsParams, ObjectListing, ObjectMeta};
use coffer_core::{Error, Result};
use coffer_metadata::MetadataStore;
use coffer_storage::{ByteStream, StorageBackend};
use futures::TryStreamExt;
use std::sync::Arc;
use tracing::{debug, info};

use super::{expected_md5, release_object};
use crate::metrics;

/// Attempts to read an object whose blob was swapped out under us
const READ_ATTEMPTS: usize = 3;

/// An open object read
pub struct ObjectRead {
    pub meta: ObjectMeta,
    /// Inclusive byte range being served, `None` for the whole object
    pub range: Option<(u64, u64)>,
    pub body: ByteStream,
}

impl ObjectRead {
    pub fn content_length(&self) -> u64 {
        match self.range {
            Some((start, end)) => end - start + 1,
            None => self.meta.size,
        }
    }
}

#[derive(Clone)]
pub struct ObjectService {
    storage: Arc<dyn StorageBackend>,
    metadata: Arc<dyn MetadataStore>,
}

impl ObjectService {
    pub fn new(storage: Arc<dyn StorageBackend>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { storage, metadata }
    }

    async fn require_bucket(&self, bucket: &str) -> Result<()> {
        if self.metadata.bucket_exists(bucket).await? {
            Ok(())
        } else {
            Err(Error::NoSuchBucket)
        }
    }

    /// Store an object, replacing any previous version of the key.
    ///
    /// The new entry only becomes visible after the data is durable; the data
    /// of the replaced entry is released afterwards.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        data: ByteStream,
        size_hint: Option<u64>,
        content_md5: Option<&str>,
    ) -> Result<ObjectMeta> {
        ObjectMeta::validate_key(key)?;
        let expected = expected_md5(content_md5)?;
        self.require_bucket(bucket).await?;

        let blob = self.storage.write_object(bucket, key, data, size_hint).await?;
        if expected.is_some_and(|md5| md5 != blob.md5) {
            release_object(self.storage.as_ref(), &blob.location).await;
            return Err(Error::BadDigest);
        }

        let meta = ObjectMeta {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: blob.size,
            etag: blob.md5,
            content_type: content_type.to_string(),
            last_modified: Utc::now(),
            location: blob.location,
        };

        match self.metadata.put_object_meta(&meta).await {
            Ok(previous) => {
                if let Some(previous) = previous {
                    release_object(self.storage.as_ref(), &previous.location).await;
                }
            }
            Err(e) => {
                release_object(self.storage.as_ref(), &meta.location).await;
                return Err(e);
            }
        }

        metrics::record_bytes_written(meta.size);
        info!("Stored {}/{} ({} bytes)", bucket, key, meta.size);
        Ok(meta)
    }

    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta> {
        match self.metadata.get_object_meta(bucket, key).await? {
            Some(meta) => Ok(meta),
            None => {
                self.require_bucket(bucket).await?;
                Err(Error::NoSuchKey)
            }
        }
    }

    /// Open an object for reading, optionally restricted to a byte range
    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectRead> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let meta = self.head_object(bucket, key).await?;
            let resolved = range.map(|r| r.resolve(meta.size)).transpose()?;

            match self.storage.read_object(&meta.location, resolved).await {
                Ok(body) => {
                    let body: ByteStream = Box::pin(body.inspect_ok(|chunk| {
                        metrics::record_bytes_read(chunk.len() as u64);
                    }));
                    return Ok(ObjectRead {
                        meta,
                        range: resolved,
                        body,
                    });
                }
                // Replaced between the metadata lookup and the open
                Err(Error::NoSuchKey) if attempt < READ_ATTEMPTS => {
                    debug!("Data for {}/{} moved, retrying read", bucket, key);
                }
                Err(Error::NoSuchKey) => {
                    return Err(Error::StorageError(format!(
                        "data for {}/{} is missing",
                        bucket, key
                    )))
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Delete an object; deleting a missing key succeeds
    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.require_bucket(bucket).await?;
        if let Some(previous) = self.metadata.delete_object_meta(bucket, key).await? {
            release_object(self.storage.as_ref(), &previous.location).await;
            info!("Deleted {}/{}", bucket, key);
        }
        Ok(())
    }

    pub async fn list_objects(
        &self,
        bucket: &str,
        params: &ListObjectsParams,
    ) -> Result<ObjectListing> {
        self.require_bucket(bucket).await?;
        self.metadata.list_objects(bucket, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::data;
    use crate::services::BucketService;
    use coffer_crypto::{md5_base64, md5_hash};
    use coffer_metadata::MemoryMetadataStore;
    use coffer_storage::{collect_stream, MemoryStorage};

    async fn setup() -> (ObjectService, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        BucketService::new(storage.clone(), metadata.clone(), "us-east-1")
            .create_bucket("bucket")
            .await
            .unwrap();
        (ObjectService::new(storage.clone(), metadata), storage)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (svc, _) = setup().await;
        let meta = svc
            .put_object("bucket", "a/b.txt", "text/plain", data(b"hello world"), Some(11), None)
            .await
            .unwrap();
        assert_eq!(meta.etag, md5_hash(b"hello world"));
        assert_eq!(meta.size, 11);

        let read = svc.get_object("bucket", "a/b.txt", None).await.unwrap();
        assert_eq!(read.content_length(), 11);
        assert_eq!(&collect_stream(read.body).await.unwrap()[..], b"hello world");
    }

    #[tokio::test]
    async fn test_range_read() {
        let (svc, _) = setup().await;
        svc.put_object("bucket", "k", "text/plain", data(b"0123456789"), None, None)
            .await
            .unwrap();

        let range = ByteRange::parse("bytes=2-5").unwrap();
        let read = svc.get_object("bucket", "k", Some(range)).await.unwrap();
        assert_eq!(read.range, Some((2, 5)));
        assert_eq!(read.content_length(), 4);
        assert_eq!(&collect_stream(read.body).await.unwrap()[..], b"2345");

        let range = ByteRange::parse("bytes=20-").unwrap();
        assert!(matches!(
            svc.get_object("bucket", "k", Some(range)).await,
            Err(Error::InvalidRange(_))
        ));
    }

    #[tokio::test]
    async fn test_overwrite_releases_old_data() {
        let (svc, storage) = setup().await;
        svc.put_object("bucket", "k", "text/plain", data(b"one"), None, None)
            .await
            .unwrap();
        svc.put_object("bucket", "k", "text/plain", data(b"two"), None, None)
            .await
            .unwrap();
        assert_eq!(storage.len(), 1);

        let read = svc.get_object("bucket", "k", None).await.unwrap();
        assert_eq!(&collect_stream(read.body).await.unwrap()[..], b"two");

        svc.delete_object("bucket", "k").await.unwrap();
        assert!(storage.is_empty());
        assert!(matches!(
            svc.head_object("bucket", "k").await,
            Err(Error::NoSuchKey)
        ));
        // Deleting again is not an error
        svc.delete_object("bucket", "k").await.unwrap();
    }

    #[tokio::test]
    async fn test_content_md5_checks() {
        let (svc, storage) = setup().await;
        let good = md5_base64(b"payload");
        svc.put_object("bucket", "k", "text/plain", data(b"payload"), None, Some(&good))
            .await
            .unwrap();

        let wrong = md5_base64(b"other");
        assert!(matches!(
            svc.put_object("bucket", "k2", "text/plain", data(b"payload"), None, Some(&wrong))
                .await,
            Err(Error::BadDigest)
        ));
        assert!(matches!(
            svc.put_object("bucket", "k3", "text/plain", data(b"payload"), None, Some("nope"))
                .await,
            Err(Error::InvalidDigest)
        ));
        // Only the first object's data remains
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_bucket_and_key() {
        let (svc, storage) = setup().await;
        assert!(matches!(
            svc.put_object("nobucket", "k", "text/plain", data(b"x"), None, None)
                .await,
            Err(Error::NoSuchBucket)
        ));
        assert!(storage.is_empty());
        assert!(matches!(
            svc.get_object("nobucket", "k", None).await,
            Err(Error::NoSuchBucket)
        ));
        assert!(matches!(
            svc.get_object("bucket", "missing", None).await,
            Err(Error::NoSuchKey)
        ));
        assert!(matches!(
            svc.put_object("bucket", "", "text/plain", data(b"x"), None, None)
                .await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_nothing() {
        let (svc, storage) = setup().await;
        let items: Vec<Result<bytes::Bytes>> = vec![
            Ok(bytes::Bytes::from_static(b"partial")),
            Err(Error::IncompleteBody),
        ];
        let body: ByteStream = Box::pin(futures::stream::iter(items));
        assert!(matches!(
            svc.put_object("bucket", "k", "text/plain", body, None, None).await,
            Err(Error::IncompleteBody)
        ));
        assert!(storage.is_empty());
        assert!(matches!(
            svc.head_object("bucket", "k").await,
            Err(Error::NoSuchKey)
        ));
    }

    #[tokio::test]
    async fn test_list_with_delimiter() {
        let (svc, _) = setup().await;
        for key in ["a/b", "a/c", "a/d/e"] {
            svc.put_object("bucket", key, "text/plain", data(b"x"), None, None)
                .await
                .unwrap();
        }
        let params = ListObjectsParams {
            prefix: "a/".into(),
            delimiter: Some("/".into()),
            marker: None,
            max_keys: 1000,
        };
        let listing = svc.list_objects("bucket", &params).await.unwrap();
        let keys: Vec<_> = listing.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["a/b", "a/c"]);
        assert_eq!(listing.common_prefixes, vec!["a/d/"]);
    }
}
