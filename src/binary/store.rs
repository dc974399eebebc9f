//! Binary Store
//!
//! Durable byte storage for whole uploads and resumable chunked uploads.
//! Supports database, local filesystem and S3 storage backends.
//!
//! Every backend stores a binary as a set of non-overlapping parts plus a
//! manifest holding the declared total size. A binary is complete once the
//! manifest exists and its parts cover `[0, total)`.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use sqlx::SqlitePool;

use super::database::DatabasePartStorage;
use super::local::LocalPartStorage;
use super::ranges;
use super::s3::S3PartStorage;
use super::types::{
    Binary, BinaryId, ByteRange, ChunkDef, Hint, InsertChunkResult, Manifest, PartInfo,
};
use crate::config::{StorageBackend, StorageConfig};
use crate::error::Result;
use crate::storage::S3Client;

/// Largest declared total size; sizes must fit a signed 64-bit integer
pub const MAX_TOTAL_SIZE: u64 = i64::MAX as u64;

// ============================================================================
// Part Storage Trait
// ============================================================================

/// Trait for part storage backends
#[async_trait::async_trait]
pub trait PartStorage: Send + Sync {
    /// Human-readable backend name for logs
    fn name(&self) -> &'static str;

    /// Store the bytes of a part starting at `offset`
    async fn put_part(&self, id: &BinaryId, offset: u64, data: Bytes) -> Result<()>;

    /// All parts of a binary, sorted by offset
    async fn list_parts(&self, id: &BinaryId) -> Result<Vec<PartInfo>>;

    /// Read `range` (relative to the part start) of a stored part
    async fn read_part(
        &self,
        id: &BinaryId,
        part: &PartInfo,
        range: std::ops::Range<u64>,
    ) -> Result<Bytes>;

    /// Store the manifest of a binary
    async fn put_manifest(&self, id: &BinaryId, manifest: &Manifest) -> Result<()>;

    /// Get the manifest of a binary
    async fn get_manifest(&self, id: &BinaryId) -> Result<Option<Manifest>>;

    /// Remove manifest and parts; succeeds when nothing is stored
    async fn delete_all(&self, id: &BinaryId) -> Result<()>;
}

// ============================================================================
// Binary Store (Main Implementation)
// ============================================================================

/// Main binary store with pluggable backends
#[derive(Clone)]
pub struct BinaryStore {
    inner: Arc<BinaryStoreInner>,
}

struct BinaryStoreInner {
    /// Storage backend
    backend: Arc<dyn PartStorage>,

    /// Largest part written to the backend
    chunk_size: usize,
}

impl BinaryStore {
    /// Create over any backend
    pub fn new(backend: Arc<dyn PartStorage>, chunk_size: usize) -> Self {
        Self {
            inner: Arc::new(BinaryStoreInner {
                backend,
                chunk_size: chunk_size.max(1),
            }),
        }
    }

    /// Create with sqlite storage
    pub fn with_database_storage(pool: SqlitePool, chunk_size: usize) -> Self {
        Self::new(Arc::new(DatabasePartStorage::new(pool)), chunk_size)
    }

    /// Create with local filesystem storage
    pub fn with_local_storage(base_path: PathBuf, chunk_size: usize) -> Self {
        Self::new(Arc::new(LocalPartStorage::new(base_path)), chunk_size)
    }

    /// Create with S3 storage
    pub fn with_s3_storage(s3_client: S3Client, prefix: String, chunk_size: usize) -> Self {
        Self::new(Arc::new(S3PartStorage::new(s3_client, prefix)), chunk_size)
    }

    /// Create with the configured backend; the pool backs the database backend
    pub async fn from_config(config: &StorageConfig, pool: &SqlitePool) -> Result<Self> {
        let chunk_size = config.chunk_size;

        let store = match &config.backend {
            StorageBackend::Database => Self::with_database_storage(pool.clone(), chunk_size),
            StorageBackend::FileSystem { directory } => {
                Self::with_local_storage(directory.clone(), chunk_size)
            }
            StorageBackend::S3(s3) => {
                let client = S3Client::new(s3).await?;
                Self::with_s3_storage(client, s3.prefix.clone(), chunk_size)
            }
        };

        Ok(store)
    }

    /// Backend write granularity
    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store a complete stream under a fresh id
    pub async fn insert<S>(&self, data: S) -> Result<BinaryId>
    where
        S: Stream<Item = Result<Bytes>> + Send,
    {
        let id = BinaryId::random();
        self.insert_as(&id, data).await?;
        Ok(id)
    }

    /// Store a complete stream under `id`.
    ///
    /// The manifest is written last, so the binary only becomes visible once
    /// every byte is stored. On failure the written parts are removed.
    pub async fn insert_as<S>(&self, id: &BinaryId, data: S) -> Result<u64>
    where
        S: Stream<Item = Result<Bytes>> + Send,
    {
        match self.write_stream(id, data).await {
            Ok(total) => {
                self.inner
                    .backend
                    .put_manifest(id, &Manifest { total_size: total })
                    .await?;

                tracing::debug!(
                    id = %id,
                    size = total,
                    backend = self.backend_name(),
                    "Stored binary"
                );
                Ok(total)
            }
            Err(e) => {
                if let Err(cleanup) = self.inner.backend.delete_all(id).await {
                    tracing::warn!(
                        id = %id,
                        error = %cleanup,
                        "Failed to remove parts of aborted insert"
                    );
                }
                Err(e)
            }
        }
    }

    async fn write_stream<S>(&self, id: &BinaryId, data: S) -> Result<u64>
    where
        S: Stream<Item = Result<Bytes>> + Send,
    {
        let chunk_size = self.inner.chunk_size;
        let mut data = std::pin::pin!(data);
        let mut buffer = BytesMut::with_capacity(chunk_size);
        let mut offset = 0u64;

        while let Some(bytes) = data.next().await {
            buffer.extend_from_slice(&bytes?);

            while buffer.len() >= chunk_size {
                let part = buffer.split_to(chunk_size).freeze();
                let len = part.len() as u64;
                self.inner.backend.put_part(id, offset, part).await?;
                offset += len;
            }
        }

        if !buffer.is_empty() {
            let len = buffer.len() as u64;
            self.inner.backend.put_part(id, offset, buffer.freeze()).await?;
            offset += len;
        }

        Ok(offset)
    }

    /// Write one fragment of a resumable upload.
    ///
    /// Re-sending bytes that are already stored is accepted. Only gaps are
    /// written; bytes overlapping stored data must be identical.
    pub async fn insert_chunk(
        &self,
        id: &BinaryId,
        chunk: &ChunkDef,
        hint: &Hint,
        data: Bytes,
    ) -> Result<InsertChunkResult> {
        let backend = &self.inner.backend;

        let Some(range) = chunk.range() else {
            return Ok(InsertChunkResult::Failure(format!(
                "fragment at {} with length {} overflows",
                chunk.offset, chunk.length
            )));
        };

        if chunk.length != data.len() as u64 {
            return Ok(InsertChunkResult::Failure(format!(
                "declared length {} does not match {} received bytes",
                chunk.length,
                data.len()
            )));
        }

        if range.end > chunk.total_size {
            return Ok(InsertChunkResult::Failure(format!(
                "fragment {}..{} exceeds declared total of {} bytes",
                range.start, range.end, chunk.total_size
            )));
        }

        if chunk.total_size > MAX_TOTAL_SIZE {
            return Ok(InsertChunkResult::Failure(format!(
                "declared total of {} bytes exceeds the maximum of {}",
                chunk.total_size, MAX_TOTAL_SIZE
            )));
        }

        let manifest = backend.get_manifest(id).await?;
        if let Some(manifest) = manifest {
            if manifest.total_size != chunk.total_size {
                return Ok(InsertChunkResult::Failure(format!(
                    "declared total of {} bytes conflicts with previously declared {}",
                    chunk.total_size, manifest.total_size
                )));
            }
        }

        let parts = backend.list_parts(id).await?;

        // Overlapping bytes must match what is stored
        for (part, overlap) in ranges::overlaps(&range, &parts) {
            let relative = (overlap.start - part.offset)..(overlap.end - part.offset);
            let stored = backend.read_part(id, &part, relative).await?;
            let incoming =
                data.slice((overlap.start - range.start) as usize..(overlap.end - range.start) as usize);

            if stored != incoming {
                tracing::warn!(
                    id = %id,
                    start = overlap.start,
                    end = overlap.end,
                    "Chunk conflicts with stored data"
                );
                return Ok(InsertChunkResult::Failure(format!(
                    "bytes {}..{} differ from previously written data",
                    overlap.start, overlap.end
                )));
            }
        }

        if manifest.is_none() {
            backend
                .put_manifest(
                    id,
                    &Manifest {
                        total_size: chunk.total_size,
                    },
                )
                .await?;
        }

        let gaps = ranges::gaps(&range, &parts);
        let mut written = Vec::new();
        for gap in &gaps {
            for piece in ranges::split(gap, self.inner.chunk_size as u64) {
                let bytes = data
                    .slice((piece.start - range.start) as usize..(piece.end - range.start) as usize);
                backend.put_part(id, piece.start, bytes).await?;
                written.push(PartInfo::new(piece.start, piece.end - piece.start));
            }
        }

        let mut all_parts = parts;
        all_parts.extend(written);
        all_parts.sort_by_key(|part| part.offset);

        let stored = ranges::covered_len(chunk.total_size, &all_parts);
        let complete = stored == chunk.total_size;

        tracing::debug!(
            id = %id,
            offset = chunk.offset,
            length = chunk.length,
            total = chunk.total_size,
            stored = stored,
            new_bytes = gaps.iter().map(|g| g.end - g.start).sum::<u64>(),
            filename = hint.filename.as_deref().unwrap_or(""),
            "Chunk written"
        );

        if complete {
            Ok(InsertChunkResult::Complete)
        } else {
            Ok(InsertChunkResult::Incomplete)
        }
    }

    /// Remove all bytes of a binary; deleting an unknown id is fine
    pub async fn delete(&self, id: &BinaryId) -> Result<()> {
        self.inner.backend.delete_all(id).await?;
        tracing::debug!(id = %id, "Deleted binary");
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Declared size and stored parts of a complete binary
    async fn complete_layout(&self, id: &BinaryId) -> Result<Option<(u64, Vec<PartInfo>)>> {
        let Some(manifest) = self.inner.backend.get_manifest(id).await? else {
            return Ok(None);
        };

        let parts = self.inner.backend.list_parts(id).await?;
        if !ranges::is_covered(manifest.total_size, &parts) {
            return Ok(None);
        }

        Ok(Some((manifest.total_size, parts)))
    }

    /// Whether every byte of the binary is stored
    pub async fn is_complete(&self, id: &BinaryId) -> Result<bool> {
        Ok(self.complete_layout(id).await?.is_some())
    }

    /// Stream a byte range of a complete binary.
    ///
    /// Only the parts intersecting the range are read. Unknown and
    /// incomplete binaries yield `None`.
    pub async fn find_binary(&self, id: &BinaryId, range: ByteRange) -> Result<Option<Binary>> {
        let Some((total_size, parts)) = self.complete_layout(id).await? else {
            return Ok(None);
        };

        let resolved = range.resolve(total_size)?;
        let plan = ranges::read_plan(&resolved, &parts);

        let backend = Arc::clone(&self.inner.backend);
        let stream_id = id.clone();
        let stream = stream::iter(plan)
            .then(move |(part, range)| {
                let backend = Arc::clone(&backend);
                let id = stream_id.clone();
                async move { backend.read_part(&id, &part, range).await }
            })
            .boxed();

        Ok(Some(Binary {
            id: id.clone(),
            total_size,
            range: resolved,
            stream,
        }))
    }
}

// ============================================================================
// Tests
// ============================================================================
