use coffer_core::types::Bucket;
use coffer_core::{Error, Result};
use coffer_metadata::MetadataStore;
use coffer_storage::StorageBackend;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct BucketService {
    storage: Arc<dyn StorageBackend>,
    metadata: Arc<dyn MetadataStore>,
    region: String,
}

impl BucketService {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        metadata: Arc<dyn MetadataStore>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            metadata,
            region: region.into(),
        }
    }

    pub async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        self.metadata.list_buckets().await
    }

    pub async fn create_bucket(&self, name: &str) -> Result<Bucket> {
        Bucket::validate_name(name)?;

        let bucket = Bucket::new(name, self.region.clone());
        self.metadata.create_bucket(&bucket).await?;

        if let Err(e) = self.storage.create_bucket(name).await {
            // Undo the metadata entry so the name is not left half-created
            if let Err(undo) = self.metadata.delete_bucket(name).await {
                warn!("Failed to roll back bucket {}: {}", name, undo);
            }
            return Err(e);
        }

        info!("Created bucket {}", name);
        Ok(bucket)
    }

    pub async fn head_bucket(&self, name: &str) -> Result<Bucket> {
        self.metadata
            .get_bucket(name)
            .await?
            .ok_or(Error::NoSuchBucket)
    }

    /// Region the bucket was created in
    pub async fn location(&self, name: &str) -> Result<String> {
        Ok(self.head_bucket(name).await?.region)
    }

    pub async fn delete_bucket(&self, name: &str) -> Result<()> {
        self.metadata.delete_bucket(name).await?;

        if let Err(e) = self.storage.delete_bucket(name).await {
            warn!("Bucket {} deleted but its storage was not released: {}", name, e);
        }
        info!("Deleted bucket {}", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_core::types::{ObjectMeta, StorageRef};
    use crate::services::testing::data;
    use crate::services::ObjectService;
    use coffer_metadata::MemoryMetadataStore;
    use coffer_storage::{collect_stream, LocalStorage, MemoryStorage};

    fn service() -> (BucketService, Arc<MemoryMetadataStore>) {
        let metadata = Arc::new(MemoryMetadataStore::new());
        let service = BucketService::new(
            Arc::new(MemoryStorage::new()),
            metadata.clone(),
            "us-east-1",
        );
        (service, metadata)
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let (svc, _) = service();
        svc.create_bucket("alpha").await.unwrap();
        svc.create_bucket("beta").await.unwrap();

        let names: Vec<_> = svc
            .list_buckets()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(svc.location("alpha").await.unwrap(), "us-east-1");

        assert!(matches!(
            svc.create_bucket("alpha").await,
            Err(Error::BucketAlreadyExists)
        ));
        assert!(matches!(
            svc.create_bucket("Bad_Name").await,
            Err(Error::InvalidBucketName(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_non_empty_then_empty() {
        let (svc, metadata) = service();
        svc.create_bucket("gamma").await.unwrap();
        metadata
            .put_object_meta(&ObjectMeta {
                bucket: "gamma".into(),
                key: "k".into(),
                size: 1,
                etag: "e".into(),
                content_type: "text/plain".into(),
                last_modified: chrono::Utc::now(),
                location: StorageRef::new("loc"),
            })
            .await
            .unwrap();

        assert!(matches!(
            svc.delete_bucket("gamma").await,
            Err(Error::BucketNotEmpty)
        ));

        metadata.delete_object_meta("gamma", "k").await.unwrap();
        svc.delete_bucket("gamma").await.unwrap();
        assert!(matches!(
            svc.delete_bucket("gamma").await,
            Err(Error::NoSuchBucket)
        ));
        assert!(matches!(svc.head_bucket("gamma").await, Err(Error::NoSuchBucket)));
    }

    #[tokio::test]
    async fn test_recreated_bucket_survives_late_storage_release() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::new(dir.path()));
        storage.init().await.unwrap();
        let metadata = Arc::new(MemoryMetadataStore::new());
        let buckets = BucketService::new(storage.clone(), metadata.clone(), "us-east-1");
        let objects = ObjectService::new(storage.clone(), metadata.clone());
        buckets.create_bucket("bucket").await.unwrap();

        // DeleteBucket commits its metadata, then a new incarnation is
        // created and written before the storage release runs
        metadata.delete_bucket("bucket").await.unwrap();
        buckets.create_bucket("bucket").await.unwrap();
        objects
            .put_object("bucket", "k", "text/plain", data(b"hello"), Some(5), None)
            .await
            .unwrap();
        storage.delete_bucket("bucket").await.unwrap();

        assert_eq!(objects.head_object("bucket", "k").await.unwrap().size, 5);
        let read = objects.get_object("bucket", "k", None).await.unwrap();
        assert_eq!(&collect_stream(read.body).await.unwrap()[..], b"hello");
    }
}
