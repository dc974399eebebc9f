//! Sqlite part storage
//!
//! Parts live as BLOBs in `binary_part`; manifests in `binary_manifest`.
//! Range reads use `substr()` so only the requested slice is transferred.

use std::ops::Range;

use bytes::Bytes;
use sqlx::SqlitePool;

use super::store::PartStorage;
use super::types::{BinaryId, Manifest, PartInfo};
use crate::error::{Result, StoreError};

/// Database-backed part storage
pub struct DatabasePartStorage {
    pool: SqlitePool,
}

impl DatabasePartStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn to_db(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| StoreError::Storage(format!("{} exceeds sqlite integer range", value)))
}

fn from_db(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| StoreError::Storage(format!("negative size {} in database", value)))
}

#[async_trait::async_trait]
impl PartStorage for DatabasePartStorage {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn put_part(&self, id: &BinaryId, offset: u64, data: Bytes) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO binary_part (binary_id, part_offset, part_len, data)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(to_db(offset)?)
        .bind(to_db(data.len() as u64)?)
        .bind(data.as_ref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_parts(&self, id: &BinaryId) -> Result<Vec<PartInfo>> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT part_offset, part_len FROM binary_part
            WHERE binary_id = ?
            ORDER BY part_offset ASC
            "#,
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(offset, len)| Ok(PartInfo::new(from_db(offset)?, from_db(len)?)))
            .collect()
    }

    async fn read_part(&self, id: &BinaryId, part: &PartInfo, range: Range<u64>) -> Result<Bytes> {
        if range.is_empty() {
            return Ok(Bytes::new());
        }

        // substr() is 1-based
        let data = sqlx::query_scalar::<_, Vec<u8>>(
            r#"
            SELECT substr(data, ?, ?) FROM binary_part
            WHERE binary_id = ? AND part_offset = ?
            "#,
        )
        .bind(to_db(range.start + 1)?)
        .bind(to_db(range.end - range.start)?)
        .bind(id.as_str())
        .bind(to_db(part.offset)?)
        .fetch_optional(&self.pool)
        .await?;

        data.map(Bytes::from).ok_or_else(|| {
            StoreError::Storage(format!("Part {} of {} vanished", part.offset, id))
        })
    }

    async fn put_manifest(&self, id: &BinaryId, manifest: &Manifest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO binary_manifest (binary_id, total_size)
            VALUES (?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(to_db(manifest.total_size)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_manifest(&self, id: &BinaryId) -> Result<Option<Manifest>> {
        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT total_size FROM binary_manifest WHERE binary_id = ?
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let total_size = total.map(from_db).transpose()?;
        Ok(total_size.map(|total_size| Manifest { total_size }))
    }

    async fn delete_all(&self, id: &BinaryId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM binary_manifest WHERE binary_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM binary_part WHERE binary_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
