//! File metadata database operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::binary::BinaryId;
use crate::checksum::Checksum;
use crate::error::{Result, StoreError};

/// Metadata of one complete binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub id: BinaryId,
    pub size: u64,
    /// Unset until computed, possibly in the background
    pub checksum: Option<Checksum>,
    pub content_type: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct FileMetaRow {
    id: String,
    size: i64,
    checksum_algorithm: Option<String>,
    checksum: Option<String>,
    content_type: String,
    created: String,
}

impl TryFrom<FileMetaRow> for FileMeta {
    type Error = StoreError;

    fn try_from(row: FileMetaRow) -> Result<Self> {
        let corrupt = |what: &str| StoreError::Storage(format!("Corrupt {} for {}", what, row.id));

        let checksum = match (&row.checksum_algorithm, &row.checksum) {
            (Some(algorithm), Some(digest)) => Some(Checksum {
                algorithm: algorithm.parse().map_err(|_| corrupt("checksum algorithm"))?,
                digest: digest.clone(),
            }),
            _ => None,
        };

        let size = u64::try_from(row.size).map_err(|_| corrupt("size"))?;
        let created = DateTime::parse_from_rfc3339(&row.created)
            .map_err(|_| corrupt("timestamp"))?
            .with_timezone(&Utc);

        Ok(FileMeta {
            id: BinaryId::new(row.id)?,
            size,
            checksum,
            content_type: row.content_type,
            created,
        })
    }
}

/// File metadata repository
#[derive(Clone)]
pub struct AttributeStore {
    pool: SqlitePool,
}

impl AttributeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get metadata for a binary
    pub async fn find_meta(&self, id: &BinaryId) -> Result<Option<FileMeta>> {
        let row = sqlx::query_as::<_, FileMetaRow>(
            r#"
            SELECT id, size, checksum_algorithm, checksum, content_type, created
            FROM file_meta
            WHERE id = ?
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(FileMeta::try_from).transpose()
    }

    /// Insert a new record. Metadata is written exactly once per binary,
    /// so an existing row is [`StoreError::DuplicateMetadata`].
    pub async fn save_meta(&self, meta: &FileMeta) -> Result<()> {
        let size = i64::try_from(meta.size)
            .map_err(|_| StoreError::Storage(format!("Size {} out of range", meta.size)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO file_meta (id, size, checksum_algorithm, checksum, content_type, created)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(meta.id.as_str())
        .bind(size)
        .bind(meta.checksum.as_ref().map(|c| c.algorithm.as_str()))
        .bind(meta.checksum.as_ref().map(|c| c.digest.as_str()))
        .bind(&meta.content_type)
        .bind(meta.created.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateMetadata(meta.id.clone()));
        }

        Ok(())
    }

    /// Set the checksum of an existing record, leaving every other field alone.
    ///
    /// Returns `false` without error when no record exists, which happens
    /// when the binary was deleted while its checksum was being computed.
    pub async fn update_checksum(&self, id: &BinaryId, checksum: &Checksum) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE file_meta
            SET checksum_algorithm = ?, checksum = ?
            WHERE id = ?
            "#,
        )
        .bind(checksum.algorithm.as_str())
        .bind(&checksum.digest)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a record, returning whether one existed
    pub async fn delete_meta(&self, id: &BinaryId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM file_meta WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// All ids with metadata, oldest first
    pub async fn list_ids(&self) -> Result<Vec<BinaryId>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM file_meta ORDER BY created ASC, id ASC")
                .fetch_all(&self.pool)
                .await?;

        ids.into_iter().map(BinaryId::new).collect()
    }

    /// Records still waiting for a checksum, oldest first
    pub async fn list_missing_checksum(&self, limit: u32) -> Result<Vec<FileMeta>> {
        let rows = sqlx::query_as::<_, FileMetaRow>(
            r#"
            SELECT id, size, checksum_algorithm, checksum, content_type, created
            FROM file_meta
            WHERE checksum IS NULL
            ORDER BY created ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FileMeta::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumAlgorithm;
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn store() -> (TempDir, AttributeStore) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("meta.db").display());
        let pool = crate::db::create_pool(&url).await.unwrap();
        (dir, AttributeStore::new(pool))
    }

    fn meta(id: &str, checksum: Option<Checksum>) -> FileMeta {
        FileMeta {
            id: BinaryId::new(id).unwrap(),
            size: 10,
            checksum,
            content_type: "text/plain".to_string(),
            created: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_save_and_find() {
        let (_dir, store) = store().await;
        let saved = meta("file-1", Some(ChecksumAlgorithm::Sha256.digest(b"abcdefghij")));

        store.save_meta(&saved).await.unwrap();

        let found = store.find_meta(&saved.id).await.unwrap();
        assert_eq!(found, Some(saved));
    }

    #[tokio::test]
    async fn test_find_unknown() {
        let (_dir, store) = store().await;
        let id = BinaryId::new("nope").unwrap();

        assert_eq!(store.find_meta(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_twice_is_duplicate() {
        let (_dir, store) = store().await;
        let first = meta("file-1", None);

        store.save_meta(&first).await.unwrap();

        let mut second = first.clone();
        second.size = 99;
        let err = store.save_meta(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateMetadata(_)));

        // Original row untouched
        let found = store.find_meta(&first.id).await.unwrap().unwrap();
        assert_eq!(found.size, 10);
    }

    #[tokio::test]
    async fn test_update_checksum_only_touches_checksum() {
        let (_dir, store) = store().await;
        let saved = meta("file-1", None);
        store.save_meta(&saved).await.unwrap();

        let checksum = ChecksumAlgorithm::Sha512.digest(b"abcdefghij");
        assert!(store.update_checksum(&saved.id, &checksum).await.unwrap());

        let found = store.find_meta(&saved.id).await.unwrap().unwrap();
        assert_eq!(found.checksum, Some(checksum));
        assert_eq!(found.size, saved.size);
        assert_eq!(found.content_type, saved.content_type);
        assert_eq!(found.created, saved.created);
    }

    #[tokio::test]
    async fn test_update_checksum_without_row() {
        let (_dir, store) = store().await;
        let id = BinaryId::new("gone").unwrap();
        let checksum = ChecksumAlgorithm::Sha256.digest(b"x");

        assert!(!store.update_checksum(&id, &checksum).await.unwrap());
        assert_eq!(store.find_meta(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_and_listings() {
        let (_dir, store) = store().await;
        store.save_meta(&meta("a", None)).await.unwrap();
        store
            .save_meta(&meta("b", Some(ChecksumAlgorithm::Sha256.digest(b"b"))))
            .await
            .unwrap();

        let ids = store.list_ids().await.unwrap();
        assert_eq!(ids.len(), 2);

        let missing = store.list_missing_checksum(10).await.unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].id.as_str(), "a");

        let a = BinaryId::new("a").unwrap();
        assert!(store.delete_meta(&a).await.unwrap());
        assert!(!store.delete_meta(&a).await.unwrap());
        assert_eq!(store.list_ids().await.unwrap().len(), 1);
    }
}
