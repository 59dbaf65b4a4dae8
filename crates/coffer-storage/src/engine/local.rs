//! Local filesystem storage engine
//!
//! Layout under `data_dir`:
//!
//! ```text
//! tmp/<uuid>                          in-flight writes
//! objects/<bucket>/<xx>/<uuid>        object blobs
//! parts/<upload-id>/<n>-<uuid>        multipart parts
//! ```

use async_trait::async_trait;
use coffer_core::types::StorageRef;
use coffer_core::{Error, Result};
use coffer_crypto::Md5Hasher;
use futures::{stream, StreamExt, TryStreamExt};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ByteStream, StorageBackend, StoredBlob};

const RENAME_ATTEMPTS: u32 = 3;

pub struct LocalStorage {
    data_dir: PathBuf,
}

/// Removes a temporary file unless it was persisted, also when the write is cancelled
struct TempFile {
    path: PathBuf,
    persisted: bool,
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.persisted {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Failed to remove temp file {:?}: {}", self.path, e);
                }
            }
        }
    }
}

impl LocalStorage {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    pub async fn init(&self) -> Result<()> {
        for dir in ["tmp", "objects", "parts"] {
            fs::create_dir_all(self.data_dir.join(dir)).await?;
        }
        info!("Storage initialized at {:?}", self.data_dir);
        Ok(())
    }

    fn object_location(bucket: &str) -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("objects/{}/{}/{}", bucket, &id[..2], id)
    }

    fn part_location(upload_id: &str, part_number: u32) -> String {
        format!("parts/{}/{}-{}", upload_id, part_number, Uuid::new_v4().simple())
    }

    /// Map a location back to a path, refusing anything that escapes `data_dir`
    fn resolve(&self, location: &StorageRef) -> Result<PathBuf> {
        let rel = Path::new(location.as_str());
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::StorageError(format!(
                "invalid storage location {}",
                location
            )));
        }
        Ok(self.data_dir.join(rel))
    }

    /// Spool a stream into a temp file, then rename it to `location`
    async fn persist(&self, location: String, mut data: ByteStream) -> Result<StoredBlob> {
        let mut temp = TempFile {
            path: self
                .data_dir
                .join("tmp")
                .join(Uuid::new_v4().simple().to_string()),
            persisted: false,
        };

        let mut file = fs::File::create(&temp.path).await?;
        let mut hasher = Md5Hasher::new();
        let mut size = 0u64;

        while let Some(chunk) = data.try_next().await? {
            hasher.update(&chunk);
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        drop(file);

        let storage_ref = StorageRef::new(location);
        let path = self.resolve(&storage_ref)?;
        self.rename_into(&temp.path, &path).await?;
        temp.persisted = true;

        debug!("Stored {} ({} bytes)", storage_ref, size);
        Ok(StoredBlob {
            location: storage_ref,
            size,
            md5: hasher.finalize_hex(),
        })
    }

    /// Rename with parent creation. A concurrent bucket delete may prune the
    /// parent between the two steps, so the pair is retried.
    async fn rename_into(&self, from: &Path, to: &Path) -> Result<()> {
        let mut attempts = 0;
        loop {
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent).await?;
            }
            match fs::rename(from, to).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound && attempts < RENAME_ATTEMPTS => {
                    attempts += 1;
                    debug!("Parent of {:?} vanished, retrying", to);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove `dir` if empty. Returns false when it still holds entries.
    async fn prune_dir(dir: &Path) -> Result<bool> {
        match fs::remove_dir(dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => {
                let mut entries = fs::read_dir(dir).await?;
                if entries.next_entry().await?.is_some() {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn remove(&self, location: &StorageRef) -> Result<()> {
        let path = self.resolve(location)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted {}", location);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn open(&self, location: &StorageRef) -> Result<fs::File> {
        let path = self.resolve(location)?;
        fs::File::open(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::NoSuchKey,
            _ => e.into(),
        })
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn write_object(
        &self,
        bucket: &str,
        key: &str,
        data: ByteStream,
        _size_hint: Option<u64>,
    ) -> Result<StoredBlob> {
        debug!("Writing object {}/{}", bucket, key);
        self.persist(Self::object_location(bucket), data).await
    }

    async fn read_object(
        &self,
        location: &StorageRef,
        range: Option<(u64, u64)>,
    ) -> Result<ByteStream> {
        let mut file = self.open(location).await?;

        let stream = match range {
            Some((start, end)) => {
                file.seek(SeekFrom::Start(start)).await?;
                ReaderStream::new(file.take(end - start + 1)).boxed()
            }
            None => ReaderStream::new(file).boxed(),
        };

        Ok(Box::pin(stream.map_err(Error::from)))
    }

    async fn delete_object(&self, location: &StorageRef) -> Result<()> {
        self.remove(location).await
    }

    async fn write_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: ByteStream,
    ) -> Result<StoredBlob> {
        self.persist(Self::part_location(upload_id, part_number), data)
            .await
    }

    async fn delete_part(&self, location: &StorageRef) -> Result<()> {
        self.remove(location).await?;

        // The upload directory goes away with its last part
        if let Some(dir) = self.resolve(location)?.parent() {
            let _ = fs::remove_dir(dir).await;
        }
        Ok(())
    }

    async fn concatenate_parts(
        &self,
        bucket: &str,
        key: &str,
        parts: &[StorageRef],
    ) -> Result<StoredBlob> {
        // Open every part up front so a missing one fails before anything is written
        let mut files = Vec::with_capacity(parts.len());
        for part in parts {
            files.push(self.open(part).await?);
        }

        let data = stream::iter(files)
            .flat_map(ReaderStream::new)
            .map_err(Error::from);

        debug!("Concatenating {} parts into {}/{}", parts.len(), bucket, key);
        self.persist(Self::object_location(bucket), Box::pin(data))
            .await
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        fs::create_dir_all(self.data_dir.join("objects").join(bucket)).await?;
        info!("Created bucket directory {}", bucket);
        Ok(())
    }

    /// Prune the bucket's empty directories.
    ///
    /// Blobs are never removed here: a bucket recreated under the same name
    /// may already own files in the same tree.
    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        let path = self.data_dir.join("objects").join(bucket);
        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                Self::prune_dir(&entry.path()).await?;
            }
        }

        if Self::prune_dir(&path).await? {
            info!("Deleted bucket directory {}", bucket);
        } else {
            debug!("Bucket directory {} still in use, kept", bucket);
        }
        Ok(())
    }

    /// Health check - verify storage is accessible
    async fn health_check(&self) -> Result<()> {
        let test_file = self.data_dir.join("tmp").join(".health_check");
        match fs::write(&test_file, "ok").await {
            Ok(_) => {
                let _ = fs::remove_file(&test_file).await;
                Ok(())
            }
            Err(e) => Err(Error::StorageError(format!("Storage not writable: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::collect_stream;
    use crate::engine::testing::{failing_stream, stream_of};

    async fn storage() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.init().await.unwrap();
        (dir, storage)
    }

    fn tmp_entries(dir: &Path) -> usize {
        std::fs::read_dir(dir.join("tmp")).unwrap().count()
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let (dir, storage) = storage().await;
        storage.create_bucket("bucket").await.unwrap();

        let blob = storage
            .write_object("bucket", "a/b.txt", stream_of(&[b"hello ", b"world"]), Some(11))
            .await
            .unwrap();
        assert_eq!(blob.size, 11);
        assert_eq!(blob.md5, coffer_crypto::md5_hash(b"hello world"));
        assert!(blob.location.as_str().starts_with("objects/bucket/"));

        let data = collect_stream(storage.read_object(&blob.location, None).await.unwrap())
            .await
            .unwrap();
        assert_eq!(&data[..], b"hello world");

        let range = collect_stream(
            storage
                .read_object(&blob.location, Some((6, 10)))
                .await
                .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(&range[..], b"world");

        storage.delete_object(&blob.location).await.unwrap();
        storage.delete_object(&blob.location).await.unwrap();
        assert!(matches!(
            storage.read_object(&blob.location, None).await,
            Err(Error::NoSuchKey)
        ));
        assert_eq!(tmp_entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_every_write_gets_new_location() {
        let (_dir, storage) = storage().await;
        let first = storage
            .write_object("b", "k", stream_of(&[b"one"]), None)
            .await
            .unwrap();
        let second = storage
            .write_object("b", "k", stream_of(&[b"two"]), None)
            .await
            .unwrap();
        assert_ne!(first.location, second.location);

        // A reader opened before the replacement still sees the old bytes
        let old = storage.read_object(&first.location, None).await.unwrap();
        storage.delete_object(&first.location).await.unwrap();
        assert_eq!(&collect_stream(old).await.unwrap()[..], b"one");
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_nothing() {
        let (dir, storage) = storage().await;
        let result = storage
            .write_object("b", "k", failing_stream(b"partial"), None)
            .await;
        assert!(matches!(result, Err(Error::IncompleteBody)));
        assert_eq!(tmp_entries(dir.path()), 0);
        assert!(!dir.path().join("objects/b").exists());
    }

    #[tokio::test]
    async fn test_parts_concatenate_in_given_order() {
        let (dir, storage) = storage().await;
        let p1 = storage.write_part("up1", 1, stream_of(&[b"AAA"])).await.unwrap();
        let p2 = storage.write_part("up1", 2, stream_of(&[b"BB"])).await.unwrap();

        let blob = storage
            .concatenate_parts("b", "k", &[p2.location.clone(), p1.location.clone()])
            .await
            .unwrap();
        assert_eq!(blob.size, 5);
        let data = collect_stream(storage.read_object(&blob.location, None).await.unwrap())
            .await
            .unwrap();
        assert_eq!(&data[..], b"BBAAA");

        storage.delete_part(&p1.location).await.unwrap();
        storage.delete_part(&p2.location).await.unwrap();
        assert!(!dir.path().join("parts/up1").exists());

        assert!(matches!(
            storage.concatenate_parts("b", "k", &[p1.location]).await,
            Err(Error::NoSuchKey)
        ));
    }

    #[tokio::test]
    async fn test_delete_bucket_keeps_live_blobs() {
        let (dir, storage) = storage().await;
        storage.create_bucket("bucket").await.unwrap();
        let blob = storage
            .write_object("bucket", "k", stream_of(&[b"hello"]), None)
            .await
            .unwrap();

        // A delete of an earlier incarnation finishing after the bucket was recreated
        storage.delete_bucket("bucket").await.unwrap();

        let data = collect_stream(storage.read_object(&blob.location, None).await.unwrap())
            .await
            .unwrap();
        assert_eq!(&data[..], b"hello");
        assert!(dir.path().join("objects/bucket").exists());

        storage.delete_object(&blob.location).await.unwrap();
        storage.delete_bucket("bucket").await.unwrap();
        assert!(!dir.path().join("objects/bucket").exists());

        // Writes after the prune recreate the tree
        storage
            .write_object("bucket", "k", stream_of(&[b"again"]), None)
            .await
            .unwrap();
        storage.delete_bucket("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_escaping_locations() {
        let (_dir, storage) = storage().await;
        let evil = StorageRef::new("../../etc/passwd");
        assert!(matches!(
            storage.read_object(&evil, None).await,
            Err(Error::StorageError(_))
        ));
    }

    #[tokio::test]
    async fn test_health_check() {
        let (_dir, storage) = storage().await;
        assert!(storage.health_check().await.is_ok());

        let missing = LocalStorage::new("/nonexistent/coffer-data");
        assert!(missing.health_check().await.is_err());
    }
}
