//! SQLite metadata store
//!
//! Multi-statement writes open their transaction with a write statement, so
//! SQLite hands out the write lock up front and concurrent writers queue on
//! the busy timeout instead of failing a read-to-write upgrade.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coffer_core::types::{
    Bucket, ListObjectsParams, ListSessionsParams, ListingBuilder, ObjectListing, ObjectMeta,
    PartRecord, SessionListing, SessionState, StorageRef, UploadSession,
};
use coffer_core::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::traits::MetadataStore;

/// Rows fetched per round trip while building a listing
const LIST_BATCH: i64 = 1000;

const OBJECT_COLUMNS: &str = "bucket, key, size, etag, content_type, last_modified, location";
const SESSION_COLUMNS: &str = "upload_id, bucket, key, content_type, initiator, state, created_at";
const PART_COLUMNS: &str = "part_number, size, etag, last_modified, location";

type ObjectRow = (String, String, i64, String, String, String, String);
type SessionRow = (String, String, String, String, Option<String>, String, String);
type PartRow = (i64, i64, String, String, String);

fn db_error(e: sqlx::Error) -> Error {
    Error::DatabaseError(e.to_string())
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::DatabaseError(format!("invalid timestamp '{}': {}", value, e)))
}

fn object_from_row(r: ObjectRow) -> Result<ObjectMeta> {
    Ok(ObjectMeta {
        bucket: r.0,
        key: r.1,
        size: r.2 as u64,
        etag: r.3,
        content_type: r.4,
        last_modified: parse_time(&r.5)?,
        location: StorageRef::new(r.6),
    })
}

fn part_from_row(r: PartRow) -> Result<PartRecord> {
    Ok(PartRecord {
        part_number: r.0 as u32,
        size: r.1 as u64,
        etag: r.2,
        last_modified: parse_time(&r.3)?,
        location: StorageRef::new(r.4),
    })
}

fn session_from_row(r: SessionRow, parts: Vec<PartRow>) -> Result<UploadSession> {
    let state = SessionState::parse(&r.5)
        .ok_or_else(|| Error::DatabaseError(format!("unknown session state '{}'", r.5)))?;

    let mut part_map = BTreeMap::new();
    for row in parts {
        let part = part_from_row(row)?;
        part_map.insert(part.part_number, part);
    }

    Ok(UploadSession {
        upload_id: r.0,
        bucket: r.1,
        key: r.2,
        content_type: r.3,
        initiator: r.4,
        state,
        created_at: parse_time(&r.6)?,
        parts: part_map,
    })
}

pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(db_error)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        // Every connection to an in-memory database sees its own empty database
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(db_error)?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:", 1).await
    }

    async fn init(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS buckets (
                name TEXT PRIMARY KEY,
                region TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS objects (
                bucket TEXT NOT NULL,
                key TEXT NOT NULL,
                size INTEGER NOT NULL,
                etag TEXT NOT NULL,
                content_type TEXT NOT NULL,
                last_modified TEXT NOT NULL,
                location TEXT NOT NULL,
                PRIMARY KEY (bucket, key)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS upload_sessions (
                upload_id TEXT PRIMARY KEY,
                bucket TEXT NOT NULL,
                key TEXT NOT NULL,
                content_type TEXT NOT NULL,
                initiator TEXT,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_upload_sessions_bucket ON upload_sessions(bucket, key)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS upload_parts (
                upload_id TEXT NOT NULL,
                part_number INTEGER NOT NULL,
                size INTEGER NOT NULL,
                etag TEXT NOT NULL,
                last_modified TEXT NOT NULL,
                location TEXT NOT NULL,
                PRIMARY KEY (upload_id, part_number)
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
        }

        info!("Metadata store initialized");
        Ok(())
    }

    async fn fetch_parts(&self, upload_id: &str) -> Result<Vec<PartRow>> {
        sqlx::query_as(&format!(
            "SELECT {} FROM upload_parts WHERE upload_id = ? ORDER BY part_number",
            PART_COLUMNS
        ))
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn create_bucket(&self, bucket: &Bucket) -> Result<()> {
        sqlx::query("INSERT INTO buckets (name, region, created_at) VALUES (?, ?, ?)")
            .bind(&bucket.name)
            .bind(&bucket.region)
            .bind(bucket.created_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if e.as_database_error()
                    .is_some_and(|d| d.is_unique_violation())
                {
                    Error::BucketAlreadyExists
                } else {
                    db_error(e)
                }
            })?;

        debug!("Created bucket: {}", bucket.name);
        Ok(())
    }

    async fn get_bucket(&self, name: &str) -> Result<Option<Bucket>> {
        let row: Option<(String, String, String)> =
            sqlx::query_as("SELECT name, region, created_at FROM buckets WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

        row.map(|r| -> Result<Bucket> {
            Ok(Bucket {
                name: r.0,
                region: r.1,
                created_at: parse_time(&r.2)?,
            })
        })
        .transpose()
    }

    async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        let rows: Vec<(String, String, String)> =
            sqlx::query_as("SELECT name, region, created_at FROM buckets ORDER BY name")
                .fetch_all(&self.pool)
                .await
                .map_err(db_error)?;

        rows.into_iter()
            .map(|r| -> Result<Bucket> {
                Ok(Bucket {
                    name: r.0,
                    region: r.1,
                    created_at: parse_time(&r.2)?,
                })
            })
            .collect()
    }

    async fn delete_bucket(&self, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let deleted = sqlx::query("DELETE FROM buckets WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?
            .rows_affected();
        if deleted == 0 {
            return Err(Error::NoSuchBucket);
        }

        let (objects,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM objects WHERE bucket = ?")
            .bind(name)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error)?;
        let (sessions,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM upload_sessions WHERE bucket = ?")
                .bind(name)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_error)?;

        // Dropping the transaction rolls the delete back
        if objects > 0 || sessions > 0 {
            return Err(Error::BucketNotEmpty);
        }

        tx.commit().await.map_err(db_error)?;
        debug!("Deleted bucket: {}", name);
        Ok(())
    }

    async fn put_object_meta(&self, meta: &ObjectMeta) -> Result<Option<ObjectMeta>> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let previous: Option<ObjectRow> = sqlx::query_as(&format!(
            "DELETE FROM objects WHERE bucket = ? AND key = ? RETURNING {}",
            OBJECT_COLUMNS
        ))
        .bind(&meta.bucket)
        .bind(&meta.key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO objects ({}) SELECT ?, ?, ?, ?, ?, ?, ? \
             WHERE EXISTS (SELECT 1 FROM buckets WHERE name = ?)",
            OBJECT_COLUMNS
        ))
        .bind(&meta.bucket)
        .bind(&meta.key)
        .bind(meta.size as i64)
        .bind(&meta.etag)
        .bind(&meta.content_type)
        .bind(meta.last_modified.to_rfc3339())
        .bind(meta.location.as_str())
        .bind(&meta.bucket)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?
        .rows_affected();

        if inserted == 0 {
            return Err(Error::NoSuchBucket);
        }

        tx.commit().await.map_err(db_error)?;
        debug!("Put object: {}/{}", meta.bucket, meta.key);
        previous.map(object_from_row).transpose()
    }

    async fn get_object_meta(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let row: Option<ObjectRow> = sqlx::query_as(&format!(
            "SELECT {} FROM objects WHERE bucket = ? AND key = ?",
            OBJECT_COLUMNS
        ))
        .bind(bucket)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(object_from_row).transpose()
    }

    async fn delete_object_meta(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let row: Option<ObjectRow> = sqlx::query_as(&format!(
            "DELETE FROM objects WHERE bucket = ? AND key = ? RETURNING {}",
            OBJECT_COLUMNS
        ))
        .bind(bucket)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        debug!("Deleted object: {}/{}", bucket, key);
        row.map(object_from_row).transpose()
    }

    async fn list_objects(&self, bucket: &str, params: &ListObjectsParams) -> Result<ObjectListing> {
        if !self.bucket_exists(bucket).await? {
            return Err(Error::NoSuchBucket);
        }

        let prefix = params.prefix.as_str();
        let query = format!(
            "SELECT {} FROM objects \
             WHERE bucket = ? AND key > ? AND key >= ? AND substr(key, 1, length(?)) = ? \
             ORDER BY key LIMIT ?",
            OBJECT_COLUMNS
        );

        let mut builder = ListingBuilder::new(params);
        let mut cursor = params.marker.clone().unwrap_or_default();

        'batches: loop {
            let rows: Vec<ObjectRow> = sqlx::query_as(&query)
                .bind(bucket)
                .bind(&cursor)
                .bind(prefix)
                .bind(prefix)
                .bind(prefix)
                .bind(LIST_BATCH)
                .fetch_all(&self.pool)
                .await
                .map_err(db_error)?;

            let exhausted = (rows.len() as i64) < LIST_BATCH;
            for row in rows {
                cursor = row.1.clone();
                if !builder.push(object_from_row(row)?) {
                    break 'batches;
                }
            }
            if exhausted {
                break;
            }
        }

        Ok(builder.finish())
    }

    async fn create_upload_session(&self, session: &UploadSession) -> Result<()> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO upload_sessions ({}) SELECT ?, ?, ?, ?, ?, ?, ? \
             WHERE EXISTS (SELECT 1 FROM buckets WHERE name = ?)",
            SESSION_COLUMNS
        ))
        .bind(&session.upload_id)
        .bind(&session.bucket)
        .bind(&session.key)
        .bind(&session.content_type)
        .bind(session.initiator.as_deref())
        .bind(session.state.as_str())
        .bind(session.created_at.to_rfc3339())
        .bind(&session.bucket)
        .execute(&self.pool)
        .await
        .map_err(db_error)?
        .rows_affected();

        if inserted == 0 {
            return Err(Error::NoSuchBucket);
        }

        debug!(
            "Created upload session {} for {}/{}",
            session.upload_id, session.bucket, session.key
        );
        Ok(())
    }

    async fn get_upload_session(&self, upload_id: &str) -> Result<Option<UploadSession>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM upload_sessions WHERE upload_id = ?",
            SESSION_COLUMNS
        ))
        .bind(upload_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(row) => {
                let parts = self.fetch_parts(upload_id).await?;
                session_from_row(row, parts).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn put_part_meta(&self, upload_id: &str, part: &PartRecord) -> Result<Option<PartRecord>> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Touching the session row both locks it and checks its state
        let live = sqlx::query(
            "UPDATE upload_sessions SET state = state WHERE upload_id = ? AND state = ?",
        )
        .bind(upload_id)
        .bind(SessionState::Initiated.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?
        .rows_affected();
        if live == 0 {
            return Err(Error::NoSuchUpload);
        }

        let previous: Option<PartRow> = sqlx::query_as(&format!(
            "DELETE FROM upload_parts WHERE upload_id = ? AND part_number = ? RETURNING {}",
            PART_COLUMNS
        ))
        .bind(upload_id)
        .bind(part.part_number as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        sqlx::query(&format!(
            "INSERT INTO upload_parts (upload_id, {}) VALUES (?, ?, ?, ?, ?, ?)",
            PART_COLUMNS
        ))
        .bind(upload_id)
        .bind(part.part_number as i64)
        .bind(part.size as i64)
        .bind(&part.etag)
        .bind(part.last_modified.to_rfc3339())
        .bind(part.location.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        debug!("Put upload part: {} part {}", upload_id, part.part_number);
        previous.map(part_from_row).transpose()
    }

    async fn compare_and_set_state(
        &self,
        upload_id: &str,
        expected: SessionState,
        new: SessionState,
    ) -> Result<bool> {
        let updated =
            sqlx::query("UPDATE upload_sessions SET state = ? WHERE upload_id = ? AND state = ?")
                .bind(new.as_str())
                .bind(upload_id)
                .bind(expected.as_str())
                .execute(&self.pool)
                .await
                .map_err(db_error)?
                .rows_affected();

        Ok(updated == 1)
    }

    async fn list_sessions(&self, params: &ListSessionsParams) -> Result<SessionListing> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM upload_sessions \
             WHERE state IN (?, ?) AND (? IS NULL OR bucket = ?) \
             AND substr(key, 1, length(?)) = ? AND key >= ? \
             ORDER BY bucket, key, upload_id",
            SESSION_COLUMNS
        ))
        .bind(SessionState::Initiated.as_str())
        .bind(SessionState::Completing.as_str())
        .bind(params.bucket.as_deref())
        .bind(params.bucket.as_deref())
        .bind(&params.prefix)
        .bind(&params.prefix)
        .bind(params.key_marker.as_deref().unwrap_or(""))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let summaries = rows
            .into_iter()
            .map(|row| session_from_row(row, Vec::new()).map(|s| s.summary()))
            .collect::<Result<Vec<_>>>()?;

        Ok(SessionListing::from_sorted(summaries, params))
    }

    async fn delete_session(&self, upload_id: &str) -> Result<Option<UploadSession>> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "DELETE FROM upload_sessions WHERE upload_id = ? RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(upload_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let parts: Vec<PartRow> = sqlx::query_as(&format!(
            "DELETE FROM upload_parts WHERE upload_id = ? RETURNING {}",
            PART_COLUMNS
        ))
        .bind(upload_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        debug!("Deleted upload session {}", upload_id);
        session_from_row(row, parts).map(Some)
    }
}
