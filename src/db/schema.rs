//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL)
        .execute(pool)
        .await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- File metadata, one row per complete binary
CREATE TABLE IF NOT EXISTS file_meta (
    id TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    checksum_algorithm TEXT,
    checksum TEXT,
    content_type TEXT NOT NULL,
    created TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_file_meta_checksum ON file_meta(checksum);
CREATE INDEX IF NOT EXISTS idx_file_meta_created ON file_meta(created);

-- Declared total size per binary (database backend)
CREATE TABLE IF NOT EXISTS binary_manifest (
    binary_id TEXT PRIMARY KEY,
    total_size INTEGER NOT NULL
);

-- Stored byte runs per binary (database backend)
CREATE TABLE IF NOT EXISTS binary_part (
    binary_id TEXT NOT NULL,
    part_offset INTEGER NOT NULL,
    part_len INTEGER NOT NULL,
    data BLOB NOT NULL,

    PRIMARY KEY (binary_id, part_offset)
);
"#;
