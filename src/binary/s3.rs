//! S3-based part storage

use std::ops::Range;

use bytes::Bytes;

use super::store::PartStorage;
use super::types::{BinaryId, Manifest, PartInfo};
use crate::error::{Result, StoreError};
use crate::storage::S3Client;

/// Object key layout under a prefix
#[derive(Debug, Clone)]
struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn binary_prefix(&self, id: &BinaryId) -> String {
        if self.prefix.is_empty() {
            format!("{}/", id)
        } else {
            format!("{}/{}/", self.prefix, id)
        }
    }

    fn parts_prefix(&self, id: &BinaryId) -> String {
        format!("{}parts/", self.binary_prefix(id))
    }

    fn part_key(&self, id: &BinaryId, offset: u64) -> String {
        format!("{}{:020}", self.parts_prefix(id), offset)
    }

    fn manifest_key(&self, id: &BinaryId) -> String {
        format!("{}manifest.json", self.binary_prefix(id))
    }
}

/// S3-based part storage
pub struct S3PartStorage {
    client: S3Client,
    keys: KeyLayout,
}

impl S3PartStorage {
    pub fn new(client: S3Client, prefix: String) -> Self {
        Self {
            client,
            keys: KeyLayout::new(&prefix),
        }
    }
}

#[async_trait::async_trait]
impl PartStorage for S3PartStorage {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn put_part(&self, id: &BinaryId, offset: u64, data: Bytes) -> Result<()> {
        self.client
            .put_object(&self.keys.part_key(id, offset), data, "application/octet-stream")
            .await
    }

    async fn list_parts(&self, id: &BinaryId) -> Result<Vec<PartInfo>> {
        let prefix = self.keys.parts_prefix(id);
        let objects = self.client.list_all_objects(&prefix).await?;

        let mut parts: Vec<PartInfo> = objects
            .iter()
            .filter_map(|obj| {
                let offset = obj.key.strip_prefix(&prefix)?.parse().ok()?;
                Some(PartInfo::new(offset, obj.size))
            })
            .collect();

        parts.sort_by_key(|part| part.offset);
        Ok(parts)
    }

    async fn read_part(&self, id: &BinaryId, part: &PartInfo, range: Range<u64>) -> Result<Bytes> {
        let key = self.keys.part_key(id, part.offset);

        self.client
            .get_object_range(&key, range)
            .await?
            .ok_or_else(|| StoreError::Storage(format!("Part object {} vanished", key)))
    }

    async fn put_manifest(&self, id: &BinaryId, manifest: &Manifest) -> Result<()> {
        let json = serde_json::to_vec(manifest)
            .map_err(|e| StoreError::Storage(format!("Failed to encode manifest: {}", e)))?;

        self.client
            .put_object(&self.keys.manifest_key(id), Bytes::from(json), "application/json")
            .await
    }

    async fn get_manifest(&self, id: &BinaryId) -> Result<Option<Manifest>> {
        let Some(data) = self.client.get_object(&self.keys.manifest_key(id)).await? else {
            return Ok(None);
        };

        let manifest = serde_json::from_slice(&data)
            .map_err(|e| StoreError::Storage(format!("Corrupt manifest for {}: {}", id, e)))?;
        Ok(Some(manifest))
    }

    async fn delete_all(&self, id: &BinaryId) -> Result<()> {
        // Manifest first, so a half-finished delete reads as incomplete
        self.client.delete_object(&self.keys.manifest_key(id)).await?;
        let removed = self
            .client
            .delete_objects_with_prefix(&self.keys.binary_prefix(id))
            .await?;

        tracing::debug!(id = %id, objects = removed, "Removed S3 objects");
        Ok(())
    }
}
