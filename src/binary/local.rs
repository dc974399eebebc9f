//! Local filesystem part storage
//!
//! Layout under the base path:
//!
//! ```text
//! <id>/manifest.json
//! <id>/parts/00000000000000000000.part
//! <id>/parts/00000000000000524288.part
//! ```

use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::store::PartStorage;
use super::types::{BinaryId, Manifest, PartInfo};
use crate::error::{Result, StoreError};

const MANIFEST_FILE: &str = "manifest.json";
const PART_SUFFIX: &str = ".part";

/// Local filesystem part storage
pub struct LocalPartStorage {
    base_path: PathBuf,
}

impl LocalPartStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn binary_dir(&self, id: &BinaryId) -> PathBuf {
        self.base_path.join(id.as_str())
    }

    fn parts_dir(&self, id: &BinaryId) -> PathBuf {
        self.binary_dir(id).join("parts")
    }

    fn part_path(&self, id: &BinaryId, offset: u64) -> PathBuf {
        self.parts_dir(id)
            .join(format!("{:020}{}", offset, PART_SUFFIX))
    }

    fn manifest_path(&self, id: &BinaryId) -> PathBuf {
        self.binary_dir(id).join(MANIFEST_FILE)
    }
}

/// Write via a temp file and rename, so readers never see a partial file
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, data).await?;

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }

    Ok(())
}

fn parse_part_offset(file_name: &str) -> Option<u64> {
    file_name.strip_suffix(PART_SUFFIX)?.parse().ok()
}

#[async_trait::async_trait]
impl PartStorage for LocalPartStorage {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn put_part(&self, id: &BinaryId, offset: u64, data: Bytes) -> Result<()> {
        write_atomic(&self.part_path(id, offset), &data).await
    }

    async fn list_parts(&self, id: &BinaryId) -> Result<Vec<PartInfo>> {
        let dir = self.parts_dir(id);

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut parts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(offset) = name.to_str().and_then(parse_part_offset) else {
                // Leftover temp files of interrupted writes
                continue;
            };
            let len = entry.metadata().await?.len();
            parts.push(PartInfo::new(offset, len));
        }

        parts.sort_by_key(|part| part.offset);
        Ok(parts)
    }

    async fn read_part(&self, id: &BinaryId, part: &PartInfo, range: Range<u64>) -> Result<Bytes> {
        let path = self.part_path(id, part.offset);

        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            StoreError::Storage(format!("Failed to open part {}: {}", path.display(), e))
        })?;

        let len = usize::try_from(range.end - range.start)
            .map_err(|_| StoreError::Storage("part range too large".to_string()))?;
        let mut buffer = vec![0u8; len];

        file.seek(SeekFrom::Start(range.start)).await?;
        file.read_exact(&mut buffer).await?;

        Ok(Bytes::from(buffer))
    }

    async fn put_manifest(&self, id: &BinaryId, manifest: &Manifest) -> Result<()> {
        let json = serde_json::to_vec(manifest)
            .map_err(|e| StoreError::Storage(format!("Failed to encode manifest: {}", e)))?;
        write_atomic(&self.manifest_path(id), &json).await
    }

    async fn get_manifest(&self, id: &BinaryId) -> Result<Option<Manifest>> {
        let data = match tokio::fs::read(self.manifest_path(id)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let manifest = serde_json::from_slice(&data)
            .map_err(|e| StoreError::Storage(format!("Corrupt manifest for {}: {}", id, e)))?;
        Ok(Some(manifest))
    }

    async fn delete_all(&self, id: &BinaryId) -> Result<()> {
        match tokio::fs::remove_dir_all(self.binary_dir(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_part_file_names() {
        let storage = LocalPartStorage::new(PathBuf::from("/data"));
        let id = BinaryId::new("abc").unwrap();

        assert_eq!(
            storage.part_path(&id, 524288),
            PathBuf::from("/data/abc/parts/00000000000000524288.part")
        );
        assert_eq!(parse_part_offset("00000000000000524288.part"), Some(524288));
        assert_eq!(parse_part_offset("00000000000000524288.tmp-1f"), None);
    }

    #[tokio::test]
    async fn test_parts_round_trip_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalPartStorage::new(temp_dir.path().to_path_buf());
        let id = BinaryId::new("disk").unwrap();

        storage.put_part(&id, 5, Bytes::from_static(b"world")).await.unwrap();
        storage.put_part(&id, 0, Bytes::from_static(b"hello")).await.unwrap();
        storage
            .put_manifest(&id, &Manifest { total_size: 10 })
            .await
            .unwrap();

        let parts = storage.list_parts(&id).await.unwrap();
        assert_eq!(parts, vec![PartInfo::new(0, 5), PartInfo::new(5, 5)]);

        let slice = storage.read_part(&id, &parts[1], 1..4).await.unwrap();
        assert_eq!(&slice[..], b"orl");

        assert_eq!(
            storage.get_manifest(&id).await.unwrap(),
            Some(Manifest { total_size: 10 })
        );

        storage.delete_all(&id).await.unwrap();
        assert!(storage.list_parts(&id).await.unwrap().is_empty());
        assert!(storage.get_manifest(&id).await.unwrap().is_none());
    }
}
