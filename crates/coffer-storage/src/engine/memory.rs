//! In-memory storage engine, for tests and throwaway servers

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use coffer_core::types::StorageRef;
use coffer_core::{Error, Result};
use coffer_crypto::md5_hash;
use dashmap::DashMap;
use futures::{stream, TryStreamExt};
use uuid::Uuid;

use super::{ByteStream, StorageBackend, StoredBlob};

#[derive(Default)]
pub struct MemoryStorage {
    blobs: DashMap<String, Bytes>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently held
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    async fn persist(
        &self,
        prefix: String,
        mut data: ByteStream,
        size_hint: Option<u64>,
    ) -> Result<StoredBlob> {
        let capacity = size_hint.unwrap_or(0).min(64 * 1024 * 1024) as usize;
        let mut buf = BytesMut::with_capacity(capacity);
        while let Some(chunk) = data.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(self.store(prefix, buf.freeze()))
    }

    fn store(&self, prefix: String, data: Bytes) -> StoredBlob {
        let location = format!("{}/{}", prefix, Uuid::new_v4().simple());
        let blob = StoredBlob {
            location: StorageRef::new(location.clone()),
            size: data.len() as u64,
            md5: md5_hash(&data),
        };
        self.blobs.insert(location, data);
        blob
    }

    fn get(&self, location: &StorageRef) -> Result<Bytes> {
        self.blobs
            .get(location.as_str())
            .map(|b| b.value().clone())
            .ok_or(Error::NoSuchKey)
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn write_object(
        &self,
        bucket: &str,
        _key: &str,
        data: ByteStream,
        size_hint: Option<u64>,
    ) -> Result<StoredBlob> {
        self.persist(format!("objects/{}", bucket), data, size_hint)
            .await
    }

    async fn read_object(
        &self,
        location: &StorageRef,
        range: Option<(u64, u64)>,
    ) -> Result<ByteStream> {
        let mut data = self.get(location)?;
        if let Some((start, end)) = range {
            let len = data.len() as u64;
            let end = end.min(len.saturating_sub(1));
            if start > end {
                return Err(Error::InvalidRange("Range not satisfiable".into()));
            }
            data = data.slice(start as usize..=end as usize);
        }
        Ok(Box::pin(stream::once(async move { Ok::<_, Error>(data) })))
    }

    async fn delete_object(&self, location: &StorageRef) -> Result<()> {
        self.blobs.remove(location.as_str());
        Ok(())
    }

    async fn write_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: ByteStream,
    ) -> Result<StoredBlob> {
        self.persist(format!("parts/{}/{}", upload_id, part_number), data, None)
            .await
    }

    async fn delete_part(&self, location: &StorageRef) -> Result<()> {
        self.blobs.remove(location.as_str());
        Ok(())
    }

    async fn concatenate_parts(
        &self,
        bucket: &str,
        _key: &str,
        parts: &[StorageRef],
    ) -> Result<StoredBlob> {
        let mut buf = BytesMut::new();
        for part in parts {
            buf.extend_from_slice(&self.get(part)?);
        }
        Ok(self.store(format!("objects/{}", bucket), buf.freeze()))
    }

    async fn create_bucket(&self, _bucket: &str) -> Result<()> {
        Ok(())
    }

    /// Blobs are released one by one as objects go away, and a recreated
    /// bucket of the same name shares the prefix, so nothing is swept here.
    async fn delete_bucket(&self, _bucket: &str) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
