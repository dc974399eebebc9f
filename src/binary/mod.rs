//! Chunked Binary Store
//!
//! Byte storage for uploaded files:
//! - Whole-stream inserts committed as one unit
//! - Resumable uploads from out-of-order, retryable fragments
//! - Byte-range reads that only touch the parts they need
//!
//! Backends: sqlite, local filesystem and S3-compatible object stores.

mod database;
mod local;
pub mod ranges;
mod s3;
pub mod store;
pub mod types;

pub use database::DatabasePartStorage;
pub use local::LocalPartStorage;
pub use s3::S3PartStorage;
pub use store::{BinaryStore, PartStorage};
pub use types::*;
