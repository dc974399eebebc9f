//! Checksum engine
//!
//! ```text
//! FileStore (binary complete)
//!        |
//!        +--> compute_sync: size, content type (one read)
//!        |
//!        +--> submit --> bounded queue --> worker (Semaphore)
//!                                            |
//!                                            v
//!                              AttributeStore::update_checksum
//! ```
//!
//! The background pass reads the binary a second time, but only for the
//! attributes the synchronous pass skipped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::attributes::{detect_content_type, AttributeName, SNIFF_LEN};
use super::{Checksum, ChecksumAlgorithm};
use crate::binary::{Binary, BinaryId, BinaryStore, ByteRange, Hint};
use crate::config::ChecksumConfig;
use crate::db::{AttributeStore, FileMeta};
use crate::error::{Result, StoreError};

/// A binary waiting for its deferred attributes
#[derive(Debug, Clone)]
struct ChecksumJob {
    id: BinaryId,
    hint: Hint,
}

/// Snapshot of background checksum activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChecksumStats {
    /// Jobs accepted into the queue
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
    /// Jobs whose binary or metadata disappeared before they ran
    pub skipped: u64,
    /// Submissions rejected because the queue was full or closed
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ChecksumStats {
        ChecksumStats {
            queued: self.queued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Computes file attributes inline and in the background
#[derive(Clone)]
pub struct ChecksumEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    binaries: BinaryStore,
    algorithm: ChecksumAlgorithm,
    /// Attributes left out of the synchronous pass
    sync_excluded: Vec<AttributeName>,
    /// Present only when checksums are deferred to the background
    queue: Option<mpsc::Sender<ChecksumJob>>,
    counters: Arc<Counters>,
}

impl ChecksumEngine {
    /// Create the engine and, when checksums are deferred, spawn its worker.
    ///
    /// The worker exits once every engine clone is dropped and the queue
    /// has drained, so awaiting the handle waits for queued jobs.
    pub fn start(
        binaries: BinaryStore,
        attributes: AttributeStore,
        config: &ChecksumConfig,
    ) -> (Self, Option<JoinHandle<()>>) {
        let counters = Arc::new(Counters::default());
        let deferred = config.enable && !config.sync_checksum;

        let sync_excluded = if config.enable && config.sync_checksum {
            Vec::new()
        } else {
            vec![AttributeName::Checksum]
        };

        let (queue, handle) = if deferred {
            let (tx, rx) = mpsc::channel(config.capacity.max(1));
            let parallel = config.effective_parallel();
            let worker = ChecksumWorker {
                binaries: binaries.clone(),
                attributes,
                algorithm: config.algorithm,
                counters: Arc::clone(&counters),
                semaphore: Arc::new(Semaphore::new(parallel)),
                parallel,
            };
            (Some(tx), Some(tokio::spawn(worker.run(rx))))
        } else {
            (None, None)
        };

        let engine = Self {
            inner: Arc::new(EngineInner {
                binaries,
                algorithm: config.algorithm,
                sync_excluded,
                queue,
                counters,
            }),
        };

        (engine, handle)
    }

    /// Attributes the synchronous path should skip
    pub fn sync_exclusions(&self) -> &[AttributeName] {
        &self.inner.sync_excluded
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.inner.algorithm
    }

    /// Whether checksums are computed by the background worker
    pub fn is_deferred(&self) -> bool {
        self.inner.queue.is_some()
    }

    /// Derive metadata for a complete binary in a single read.
    ///
    /// Nothing is persisted. `created` is set to now; callers that know
    /// the upload time overwrite it.
    pub async fn compute_sync(
        &self,
        id: &BinaryId,
        hint: &Hint,
        excluded: &[AttributeName],
    ) -> Result<FileMeta> {
        let binary = self
            .inner
            .binaries
            .find_binary(id, ByteRange::ALL)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let algorithm =
            (!excluded.contains(&AttributeName::Checksum)).then_some(self.inner.algorithm);
        let scan = scan(binary, algorithm).await?;

        let content_type = if excluded.contains(&AttributeName::ContentType) {
            hint.content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string())
        } else {
            detect_content_type(&scan.head, hint)
        };

        Ok(FileMeta {
            id: id.clone(),
            size: scan.size,
            checksum: scan.checksum,
            content_type,
            created: Utc::now(),
        })
    }

    /// Queue a binary for its deferred checksum.
    ///
    /// Never blocks and never fails: a full or closed queue is logged and
    /// counted, leaving the checksum unset.
    pub fn submit(&self, id: &BinaryId, hint: &Hint) {
        let Some(queue) = &self.inner.queue else {
            debug!(id = %id, "Checksum not deferred, nothing to submit");
            return;
        };

        let job = ChecksumJob {
            id: id.clone(),
            hint: hint.clone(),
        };

        match queue.try_send(job) {
            Ok(()) => {
                self.inner.counters.queued.fetch_add(1, Ordering::Relaxed);
                debug!(id = %id, "Queued checksum computation");
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(id = %job.id, "Checksum queue full, dropping job");
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(id = %job.id, "Checksum worker stopped, dropping job");
            }
        }
    }

    /// Current counters
    pub fn stats(&self) -> ChecksumStats {
        self.inner.counters.snapshot()
    }
}

struct Scan {
    size: u64,
    head: Vec<u8>,
    checksum: Option<Checksum>,
}

/// Single pass over a binary: size, leading bytes and optionally a digest
async fn scan(binary: Binary, algorithm: Option<ChecksumAlgorithm>) -> Result<Scan> {
    let expected = binary.len();
    let mut digester = algorithm.map(|a| a.digester());
    let mut head = Vec::with_capacity(SNIFF_LEN.min(expected as usize));
    let mut size = 0u64;

    let mut stream = binary.stream;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;

        if head.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - head.len()).min(chunk.len());
            head.extend_from_slice(&chunk[..take]);
        }
        if let Some(digester) = digester.as_mut() {
            digester.update(&chunk);
        }
        size += chunk.len() as u64;
    }

    if size != expected {
        return Err(StoreError::Checksum(format!(
            "Read {} bytes, expected {}",
            size, expected
        )));
    }

    Ok(Scan {
        size,
        head,
        checksum: digester.map(|d| d.finish()),
    })
}

/// Background worker draining the checksum queue
struct ChecksumWorker {
    binaries: BinaryStore,
    attributes: AttributeStore,
    algorithm: ChecksumAlgorithm,
    counters: Arc<Counters>,
    semaphore: Arc<Semaphore>,
    parallel: usize,
}

impl ChecksumWorker {
    async fn run(self, mut rx: mpsc::Receiver<ChecksumJob>) {
        info!(
            algorithm = %self.algorithm,
            parallel = self.parallel,
            "Checksum worker started"
        );

        let worker = Arc::new(self);
        while let Some(job) = rx.recv().await {
            let Ok(permit) = Arc::clone(&worker.semaphore).acquire_owned().await else {
                break;
            };

            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                worker.handle(job).await;
                drop(permit);
            });
        }

        // Wait for in-flight jobs
        let parallel = u32::try_from(worker.parallel).unwrap_or(u32::MAX);
        let _ = worker.semaphore.acquire_many(parallel).await;

        let stats = worker.counters.snapshot();
        info!(
            queued = stats.queued,
            completed = stats.completed,
            failed = stats.failed,
            skipped = stats.skipped,
            dropped = stats.dropped,
            "Checksum worker stopped"
        );
    }

    async fn handle(&self, job: ChecksumJob) {
        match self.compute(&job.id).await {
            Ok(true) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    id = %job.id,
                    filename = job.hint.filename.as_deref().unwrap_or(""),
                    error = %e,
                    "Background checksum failed"
                );
            }
        }
    }

    /// Returns false when there was nothing left to update
    async fn compute(&self, id: &BinaryId) -> Result<bool> {
        let Some(binary) = self.binaries.find_binary(id, ByteRange::ALL).await? else {
            debug!(id = %id, "Binary gone before checksum ran");
            return Ok(false);
        };

        let scan = scan(binary, Some(self.algorithm)).await?;
        let Some(checksum) = scan.checksum else {
            return Ok(false);
        };

        let updated = self.attributes.update_checksum(id, &checksum).await?;
        if updated {
            debug!(id = %id, checksum = %checksum, "Checksum stored");
        } else {
            debug!(id = %id, "Metadata gone before checksum was stored");
        }

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::ChunkDef;
    use bytes::Bytes;
    use futures::stream;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        binaries: BinaryStore,
        attributes: AttributeStore,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("store.db").display());
        let pool = crate::db::create_pool(&url).await.unwrap();

        Fixture {
            binaries: BinaryStore::with_local_storage(dir.path().join("files"), 4),
            attributes: AttributeStore::new(pool),
            _dir: dir,
        }
    }

    fn config(sync_checksum: bool) -> ChecksumConfig {
        ChecksumConfig {
            enable: true,
            algorithm: ChecksumAlgorithm::Sha256,
            sync_checksum,
            capacity: 16,
            parallel: 2,
        }
    }

    async fn put(binaries: &BinaryStore, data: &'static [u8]) -> BinaryId {
        let chunks: Vec<Result<Bytes>> = data.chunks(3).map(|c| Ok(Bytes::from_static(c))).collect();
        binaries.insert(stream::iter(chunks)).await.unwrap()
    }

    #[tokio::test]
    async fn test_compute_sync_all_attributes() {
        let fx = fixture().await;
        let (engine, handle) = ChecksumEngine::start(
            fx.binaries.clone(),
            fx.attributes.clone(),
            &config(true),
        );
        assert!(handle.is_none());
        assert!(engine.sync_exclusions().is_empty());

        let id = put(&fx.binaries, b"abcdefghij").await;
        let meta = engine.compute_sync(&id, &Hint::none(), &[]).await.unwrap();

        assert_eq!(meta.size, 10);
        assert_eq!(meta.content_type, "text/plain");
        assert_eq!(
            meta.checksum,
            Some(ChecksumAlgorithm::Sha256.digest(b"abcdefghij"))
        );
    }

    #[tokio::test]
    async fn test_compute_sync_excluding_checksum() {
        let fx = fixture().await;
        let (engine, _handle) =
            ChecksumEngine::start(fx.binaries.clone(), fx.attributes.clone(), &config(false));

        let id = put(&fx.binaries, b"%PDF-1.4 data").await;
        let meta = engine
            .compute_sync(&id, &Hint::filename("a.txt"), engine.sync_exclusions())
            .await
            .unwrap();

        assert_eq!(meta.size, 13);
        assert_eq!(meta.checksum, None);
        assert_eq!(meta.content_type, "application/pdf");
    }

    #[tokio::test]
    async fn test_compute_sync_is_deterministic() {
        let fx = fixture().await;
        let (engine, _) = ChecksumEngine::start(fx.binaries.clone(), fx.attributes, &config(true));

        let id = put(&fx.binaries, b"same bytes every time").await;
        let first = engine.compute_sync(&id, &Hint::none(), &[]).await.unwrap();
        let second = engine.compute_sync(&id, &Hint::none(), &[]).await.unwrap();

        assert_eq!(first.checksum, second.checksum);
        assert_eq!(first.size, second.size);
        assert_eq!(first.content_type, second.content_type);
    }

    #[tokio::test]
    async fn test_compute_sync_unknown_or_incomplete() {
        let fx = fixture().await;
        let (engine, _) = ChecksumEngine::start(fx.binaries.clone(), fx.attributes, &config(true));

        let unknown = BinaryId::new("missing").unwrap();
        let err = engine.compute_sync(&unknown, &Hint::none(), &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let partial = BinaryId::new("partial").unwrap();
        fx.binaries
            .insert_chunk(
                &partial,
                &ChunkDef::new(0, 2, 10),
                &Hint::none(),
                Bytes::from_static(b"ab"),
            )
            .await
            .unwrap();
        let err = engine.compute_sync(&partial, &Hint::none(), &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_background_worker_updates_checksum() {
        let fx = fixture().await;
        let (engine, handle) =
            ChecksumEngine::start(fx.binaries.clone(), fx.attributes.clone(), &config(false));
        assert!(engine.is_deferred());

        let id = put(&fx.binaries, b"abcdefghij").await;
        let meta = engine
            .compute_sync(&id, &Hint::none(), engine.sync_exclusions())
            .await
            .unwrap();
        fx.attributes.save_meta(&meta).await.unwrap();

        engine.submit(&id, &Hint::none());
        // Submitting twice only recomputes the same value
        engine.submit(&id, &Hint::none());

        assert_eq!(engine.stats().queued, 2);

        // Dropping the last engine closes the queue; the worker drains it and exits
        drop(engine);
        handle.unwrap().await.unwrap();

        let stored = fx.attributes.find_meta(&id).await.unwrap().unwrap();
        assert_eq!(
            stored.checksum,
            Some(ChecksumAlgorithm::Sha256.digest(b"abcdefghij"))
        );
        assert_eq!(stored.size, 10);
    }

    #[tokio::test]
    async fn test_background_job_for_deleted_binary() {
        let fx = fixture().await;
        let (engine, handle) =
            ChecksumEngine::start(fx.binaries.clone(), fx.attributes.clone(), &config(false));

        let id = BinaryId::new("deleted").unwrap();
        engine.submit(&id, &Hint::none());

        let counters = Arc::clone(&engine.inner.counters);
        drop(engine);
        handle.unwrap().await.unwrap();

        let stats = counters.snapshot();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_submit_drops_when_full() {
        let fx = fixture().await;
        let mut cfg = config(false);
        cfg.capacity = 1;
        cfg.parallel = 1;
        let (engine, _handle) = ChecksumEngine::start(fx.binaries.clone(), fx.attributes, &cfg);

        // Without yielding, the worker cannot drain the queue
        for n in 0..5 {
            engine.submit(&BinaryId::new(format!("id-{}", n)).unwrap(), &Hint::none());
        }

        let stats = engine.stats();
        assert_eq!(stats.queued + stats.dropped, 5);
        assert!(stats.dropped >= 1);
    }

    #[tokio::test]
    async fn test_disabled_checksum_is_never_computed() {
        let fx = fixture().await;
        let mut cfg = config(true);
        cfg.enable = false;
        let (engine, handle) = ChecksumEngine::start(fx.binaries.clone(), fx.attributes, &cfg);

        assert!(handle.is_none());
        assert_eq!(engine.sync_exclusions(), &[AttributeName::Checksum]);

        engine.submit(&BinaryId::new("x").unwrap(), &Hint::none());
        assert_eq!(engine.stats(), ChecksumStats::default());
    }

    #[tokio::test]
    async fn test_start_caps_parallelism() {
        let fx = fixture().await;
        let mut cfg = config(false);
        cfg.parallel = usize::MAX;

        let (engine, handle) = ChecksumEngine::start(fx.binaries.clone(), fx.attributes, &cfg);
        assert!(engine.is_deferred());

        drop(engine);
        handle.unwrap().await.unwrap();
    }
}
