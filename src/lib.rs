//! Fileshare Store Library
//!
//! Chunked binary storage for a file-sharing service: whole-stream and
//! resumable chunked uploads, byte-range reads, and file metadata with
//! checksums computed inline or in the background.
//!
//! # Modules
//!
//! - `binary`: Byte storage over sqlite, local disk or S3
//! - `checksum`: Attribute computation and the background checksum queue
//! - `db`: Connection pool, schema and the metadata store
//! - `file_store`: The facade the rest of the application calls

pub mod binary;
pub mod checksum;
pub mod config;
pub mod db;
pub mod error;
pub mod file_store;
pub mod storage;

pub use binary::{Binary, BinaryId, BinaryStore, ByteRange, ChunkDef, Hint, InsertChunkResult};
pub use checksum::{Checksum, ChecksumAlgorithm, ChecksumEngine, ChecksumStats};
pub use config::{Config, ConfigError};
pub use db::{AttributeStore, FileMeta};
pub use error::{Result, StoreError};
pub use file_store::{CopyStats, FileStore};
