//! Binary store types

use std::fmt;
use std::ops::Range;

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StoreError};

// ============================================================================
// Constants
// ============================================================================

/// Default backend write granularity: 512KB
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Longest accepted binary id
pub const MAX_ID_LEN: usize = 128;

// ============================================================================
// Identifiers and Hints
// ============================================================================

/// Opaque key of a stored binary.
///
/// Ids end up in object keys and directory names, so only ASCII
/// alphanumerics, `-`, `_` and `.` are accepted, and `.`/`..` are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BinaryId(String);

impl BinaryId {
    /// Validate and wrap an id
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid_chars = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

        if id.is_empty() || id.len() > MAX_ID_LEN || !valid_chars || id == "." || id == ".." {
            return Err(StoreError::InvalidId(id));
        }

        Ok(Self(id))
    }

    /// Fresh random id
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BinaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BinaryId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<BinaryId> for String {
    fn from(id: BinaryId) -> Self {
        id.0
    }
}

/// Advisory metadata supplied with a write
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

impl Hint {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn filename(name: impl Into<String>) -> Self {
        Self {
            filename: Some(name.into()),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

// ============================================================================
// Ranges and Chunks
// ============================================================================

/// Half-open read range; `end = None` reads to the end of the object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// The whole object
    pub const ALL: ByteRange = ByteRange {
        start: 0,
        end: None,
    };

    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn starting_at(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Resolve against an object of `size` bytes.
    ///
    /// An open or oversized end is clamped to `size`. A start past the end
    /// of the object, or a start after the end, is rejected.
    pub fn resolve(&self, size: u64) -> Result<Range<u64>> {
        let end = self.end.map_or(size, |end| end.min(size));
        let start_past_end = self.end.is_some_and(|end| self.start > end);

        if self.start > size || start_past_end {
            return Err(StoreError::InvalidRange {
                start: self.start,
                end: self.end,
                size,
            });
        }

        Ok(self.start..end)
    }
}

impl Default for ByteRange {
    fn default() -> Self {
        Self::ALL
    }
}

/// One fragment of a resumable upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDef {
    /// Position of the fragment in the final object
    pub offset: u64,
    /// Fragment length in bytes
    pub length: u64,
    /// Declared size of the final object
    pub total_size: u64,
}

impl ChunkDef {
    pub fn new(offset: u64, length: u64, total_size: u64) -> Self {
        Self {
            offset,
            length,
            total_size,
        }
    }

    /// A single fragment carrying the whole object
    pub fn whole(size: u64) -> Self {
        Self::new(0, size, size)
    }

    /// Byte range covered by this fragment, `None` on overflow
    pub fn range(&self) -> Option<Range<u64>> {
        self.offset
            .checked_add(self.length)
            .map(|end| self.offset..end)
    }
}

/// Outcome of writing one fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertChunkResult {
    /// Every byte in `[0, total)` is present
    Complete,
    /// Gaps remain
    Incomplete,
    /// The fragment was rejected; stored data is unchanged
    Failure(String),
}

impl InsertChunkResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

// ============================================================================
// Backend Records
// ============================================================================

/// A stored, contiguous run of bytes of one binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    pub offset: u64,
    pub len: u64,
}

impl PartInfo {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    pub fn range(&self) -> Range<u64> {
        self.offset..self.end()
    }
}

/// Per-binary record of the declared final size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub total_size: u64,
}

// ============================================================================
// Read Results
// ============================================================================

/// Stream of binary content
pub type BinaryStream = BoxStream<'static, Result<Bytes>>;

/// A readable slice of a complete binary
pub struct Binary {
    pub id: BinaryId,
    /// Size of the whole object
    pub total_size: u64,
    /// Resolved byte range the stream yields
    pub range: Range<u64>,
    pub stream: BinaryStream,
}

impl Binary {
    /// Number of bytes the stream yields
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collect the stream into memory
    pub async fn into_bytes(self) -> Result<Vec<u8>> {
        use futures::TryStreamExt;

        let capacity = usize::try_from(self.len()).unwrap_or(0);
        self.stream
            .try_fold(Vec::with_capacity(capacity), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
    }
}

impl fmt::Debug for Binary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binary")
            .field("id", &self.id)
            .field("total_size", &self.total_size)
            .field("range", &self.range)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_id_validation() {
        assert!(BinaryId::new("3f2a-file_01.bin").is_ok());
        assert!(BinaryId::new("").is_err());
        assert!(BinaryId::new("..").is_err());
        assert!(BinaryId::new("a/b").is_err());
        assert!(BinaryId::new("x".repeat(MAX_ID_LEN + 1)).is_err());
        assert_eq!(BinaryId::random().as_str().len(), 32);
    }

    #[test]
    fn test_range_resolve() {
        assert_eq!(ByteRange::ALL.resolve(10).unwrap(), 0..10);
        assert_eq!(ByteRange::new(2, 5).resolve(10).unwrap(), 2..5);
        assert_eq!(ByteRange::new(4, 100).resolve(10).unwrap(), 4..10);
        assert_eq!(ByteRange::starting_at(10).resolve(10).unwrap(), 10..10);
        assert!(ByteRange::starting_at(11).resolve(10).is_err());
        assert!(ByteRange::new(6, 5).resolve(10).is_err());
    }

    #[test]
    fn test_chunk_def_range_overflow() {
        assert_eq!(ChunkDef::new(4, 4, 8).range(), Some(4..8));
        assert_eq!(ChunkDef::new(u64::MAX, 2, 8).range(), None);
    }
}
