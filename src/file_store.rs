//! File Store
//!
//! Ties byte storage, attribute computation and metadata together into the
//! operations upload and download handlers call.
//!
//! Per binary id a chunked upload moves through
//! `NotStarted -> Incomplete -> Complete -> Deleted`. Metadata is written
//! only after every byte is stored, and removed before the bytes are.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::binary::{Binary, BinaryId, BinaryStore, ByteRange, ChunkDef, Hint, InsertChunkResult};
use crate::checksum::ChecksumEngine;
use crate::config::Config;
use crate::db::{self, AttributeStore, FileMeta};
use crate::error::{Result, StoreError};

// ============================================================================
// File Store
// ============================================================================

/// Outcome of copying binaries into another backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CopyStats {
    pub copied: usize,
    /// Already complete in the target
    pub skipped: usize,
    pub failed: usize,
}

/// Facade over binary storage, the checksum engine and file metadata
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<FileStoreInner>,
}

struct FileStoreInner {
    binaries: BinaryStore,
    attributes: AttributeStore,
    checksum: ChecksumEngine,
}

impl FileStore {
    pub fn new(binaries: BinaryStore, attributes: AttributeStore, checksum: ChecksumEngine) -> Self {
        Self {
            inner: Arc::new(FileStoreInner {
                binaries,
                attributes,
                checksum,
            }),
        }
    }

    /// Build a store from configuration.
    ///
    /// The returned handle belongs to the background checksum worker; it
    /// finishes after every clone of the store is dropped and queued jobs ran.
    pub async fn open(config: &Config) -> Result<(Self, Option<JoinHandle<()>>)> {
        let pool = db::create_pool(&config.database.url).await?;
        let binaries = BinaryStore::from_config(&config.storage, &pool).await?;

        let attributes = AttributeStore::new(pool);
        let (checksum, worker) =
            ChecksumEngine::start(binaries.clone(), attributes.clone(), &config.checksum);

        tracing::info!(
            backend = binaries.backend_name(),
            chunk_size = binaries.chunk_size(),
            algorithm = %checksum.algorithm(),
            deferred_checksum = checksum.is_deferred(),
            "File store ready"
        );

        Ok((Self::new(binaries, attributes, checksum), worker))
    }

    pub fn binaries(&self) -> &BinaryStore {
        &self.inner.binaries
    }

    pub fn attributes(&self) -> &AttributeStore {
        &self.inner.attributes
    }

    pub fn checksum_engine(&self) -> &ChecksumEngine {
        &self.inner.checksum
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store a complete stream and record its metadata
    pub async fn insert<S>(&self, data: S, hint: &Hint, created: DateTime<Utc>) -> Result<FileMeta>
    where
        S: Stream<Item = Result<Bytes>> + Send,
    {
        let id = self.inner.binaries.insert(data).await?;

        match self.complete(&id, hint, created).await {
            Ok(meta) => Ok(meta),
            Err(e) => {
                // Nobody else knows this id, so its bytes would be orphaned
                if let Err(cleanup) = self.inner.binaries.delete(&id).await {
                    tracing::warn!(id = %id, error = %cleanup, "Failed to remove unrecorded binary");
                }
                Err(e)
            }
        }
    }

    /// Store one fragment of a resumable upload.
    ///
    /// Returns the metadata once the binary is complete, `None` while gaps
    /// remain. A fragment that conflicts with stored data is
    /// [`StoreError::ChunkConflict`] and leaves the upload as it was.
    /// Re-sending a fragment of a complete binary returns the existing
    /// metadata without recomputing it. A binary deleted while its last
    /// fragment was being completed is [`StoreError::NotFound`].
    pub async fn add_chunk(
        &self,
        id: &BinaryId,
        hint: &Hint,
        chunk: &ChunkDef,
        data: Bytes,
    ) -> Result<Option<FileMeta>> {
        match self.inner.binaries.insert_chunk(id, chunk, hint, data).await? {
            InsertChunkResult::Incomplete => Ok(None),
            InsertChunkResult::Failure(reason) => Err(StoreError::ChunkConflict {
                id: id.clone(),
                reason,
            }),
            InsertChunkResult::Complete => {
                if let Some(existing) = self.inner.attributes.find_meta(id).await? {
                    tracing::debug!(id = %id, "Binary already complete");
                    return Ok(Some(existing));
                }

                let outcome = self.complete(id, hint, Utc::now()).await;
                self.settle_completion(id, outcome).await.map(Some)
            }
        }
    }

    /// A concurrent retry of the last fragment may have saved the record
    /// first; its metadata wins. If that record is gone again, the binary
    /// was deleted in between.
    async fn settle_completion(&self, id: &BinaryId, outcome: Result<FileMeta>) -> Result<FileMeta> {
        match outcome {
            Err(StoreError::DuplicateMetadata(_)) => self
                .inner
                .attributes
                .find_meta(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.to_string())),
            other => other,
        }
    }

    /// Compute and save metadata of a freshly completed binary
    async fn complete(&self, id: &BinaryId, hint: &Hint, created: DateTime<Utc>) -> Result<FileMeta> {
        let checksum = &self.inner.checksum;

        let mut meta = checksum
            .compute_sync(id, hint, checksum.sync_exclusions())
            .await?;
        meta.created = created;

        self.inner.attributes.save_meta(&meta).await?;

        // After save_meta, so the worker always finds a row to update
        checksum.submit(id, hint);

        tracing::info!(
            id = %id,
            size = meta.size,
            content_type = %meta.content_type,
            filename = hint.filename.as_deref().unwrap_or(""),
            "File stored"
        );

        Ok(meta)
    }

    /// Remove metadata, then bytes. Deleting an unknown id succeeds.
    pub async fn delete(&self, id: &BinaryId) -> Result<()> {
        let had_meta = self.inner.attributes.delete_meta(id).await?;
        self.inner.binaries.delete(id).await?;

        tracing::info!(id = %id, had_meta, "File deleted");
        Ok(())
    }

    /// Store the checksum carried by `meta`; size and content type are left alone.
    ///
    /// Returns `false` when there is no checksum or no record to update.
    pub async fn update_checksum(&self, meta: &FileMeta) -> Result<bool> {
        let Some(checksum) = &meta.checksum else {
            return Ok(false);
        };

        self.inner.attributes.update_checksum(&meta.id, checksum).await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn find_meta(&self, id: &BinaryId) -> Result<Option<FileMeta>> {
        self.inner.attributes.find_meta(id).await
    }

    /// Stream a byte range; `None` for unknown or incomplete binaries
    pub async fn find_binary(&self, id: &BinaryId, range: ByteRange) -> Result<Option<Binary>> {
        self.inner.binaries.find_binary(id, range).await
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Copy every recorded binary into `target` under the same id.
    ///
    /// Binaries already complete in the target are skipped. Failures are
    /// counted and logged per file; only listing the ids can fail the call.
    pub async fn copy_files(&self, target: &BinaryStore) -> Result<CopyStats> {
        let ids = self.inner.attributes.list_ids().await?;
        let mut stats = CopyStats::default();

        for id in &ids {
            match self.copy_one(id, target).await {
                Ok(true) => stats.copied += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    stats.failed += 1;
                    tracing::warn!(id = %id, error = %e, "Failed to copy binary");
                }
            }
        }

        tracing::info!(
            from = self.inner.binaries.backend_name(),
            to = target.backend_name(),
            copied = stats.copied,
            skipped = stats.skipped,
            failed = stats.failed,
            "Copied files"
        );

        Ok(stats)
    }

    async fn copy_one(&self, id: &BinaryId, target: &BinaryStore) -> Result<bool> {
        if target.is_complete(id).await? {
            return Ok(false);
        }

        let binary = self
            .inner
            .binaries
            .find_binary(id, ByteRange::ALL)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let size = target.insert_as(id, binary.stream).await?;
        tracing::debug!(id = %id, size, "Copied binary");
        Ok(true)
    }

    /// Queue the oldest records without a checksum again, returning how
    /// many were submitted
    pub async fn resubmit_missing_checksums(&self, limit: u32) -> Result<usize> {
        let checksum = &self.inner.checksum;
        if !checksum.is_deferred() {
            tracing::info!("Background checksums are disabled, nothing to resubmit");
            return Ok(0);
        }

        let pending = self.inner.attributes.list_missing_checksum(limit).await?;
        for meta in &pending {
            let hint = Hint::none().with_content_type(meta.content_type.clone());
            checksum.submit(&meta.id, &hint);
        }

        tracing::info!(count = pending.len(), "Resubmitted missing checksums");
        Ok(pending.len())
    }
}
