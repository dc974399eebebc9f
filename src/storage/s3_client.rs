//! S3-compatible storage client
//!
//! Wraps the AWS SDK for S3-compatible storage access.

use std::ops::Range;

use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    Client,
};
use bytes::Bytes;

use crate::config::S3Config;
use crate::error::{Result, StoreError};

/// Keys requested per listing call
const LIST_PAGE_SIZE: i32 = 1000;

/// Key and size of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
}

struct ObjectPage {
    objects: Vec<ObjectSummary>,
    next: Option<String>,
}

/// S3-compatible storage client
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    /// Create a new S3 client from configuration
    pub async fn new(config: &S3Config) -> Result<Self> {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "fileshare-store",
        );

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO and other S3-compatible services
            .build();

        let client = Client::from_conf(s3_config);

        // Test connection by checking if bucket exists
        let bucket = config.bucket.clone();
        match client.head_bucket().bucket(&bucket).send().await {
            Ok(_) => {
                tracing::info!(bucket = %bucket, "Connected to S3 bucket");
            }
            Err(e) => {
                tracing::warn!(
                    bucket = %bucket,
                    error = %DisplayErrorContext(&e),
                    "Could not verify bucket. Will attempt operations anyway."
                );
            }
        }

        Ok(Self { client, bucket })
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Upload an object
    pub async fn put_object(&self, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                StoreError::Storage(format!(
                    "Failed to put object {}: {}",
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(())
    }

    /// Get an object's data, `None` if the key does not exist
    pub async fn get_object(&self, key: &str) -> Result<Option<Bytes>> {
        self.fetch(key, None).await
    }

    /// Get a byte range of an object, `None` if the key does not exist
    pub async fn get_object_range(&self, key: &str, range: Range<u64>) -> Result<Option<Bytes>> {
        match range_header(&range) {
            Some(header) => self.fetch(key, Some(header)).await,
            None => Ok(Some(Bytes::new())),
        }
    }

    async fn fetch(&self, key: &str, range: Option<String>) -> Result<Option<Bytes>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_range(range)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Ok(None);
            }
            Err(e) => {
                return Err(StoreError::Storage(format!(
                    "Failed to get object {}: {}",
                    key,
                    DisplayErrorContext(&e)
                )));
            }
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to read object body: {}", e)))?
            .into_bytes();

        Ok(Some(data))
    }

    /// Delete an object; deleting a missing key succeeds
    pub async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                StoreError::Storage(format!(
                    "Failed to delete object {}: {}",
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(())
    }

    /// Delete every object under a prefix, returning how many were removed
    pub async fn delete_objects_with_prefix(&self, prefix: &str) -> Result<usize> {
        let objects = self.list_all_objects(prefix).await?;

        for object in &objects {
            self.delete_object(&object.key).await?;
        }

        Ok(objects.len())
    }

    /// One page of objects under a prefix
    async fn list_page(&self, prefix: &str, token: Option<String>) -> Result<ObjectPage> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(LIST_PAGE_SIZE)
            .set_continuation_token(token)
            .send()
            .await
            .map_err(|e| {
                StoreError::Storage(format!(
                    "Failed to list objects under {}: {}",
                    prefix,
                    DisplayErrorContext(&e)
                ))
            })?;

        let objects = response
            .contents()
            .iter()
            .filter_map(|obj| {
                Some(ObjectSummary {
                    key: obj.key()?.to_string(),
                    size: u64::try_from(obj.size().unwrap_or(0)).ok()?,
                })
            })
            .collect();

        let next = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(|s| s.to_string())
        } else {
            None
        };

        Ok(ObjectPage { objects, next })
    }

    /// List all objects under a prefix, following continuation tokens
    pub async fn list_all_objects(&self, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let mut all_objects = Vec::new();
        let mut token = None;

        loop {
            let page = self.list_page(prefix, token).await?;
            all_objects.extend(page.objects);

            match page.next {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        Ok(all_objects)
    }
}

/// HTTP `Range` header for a half-open byte range; `None` when empty
fn range_header(range: &Range<u64>) -> Option<String> {
    // HTTP ranges are inclusive
    (!range.is_empty()).then(|| format!("bytes={}-{}", range.start, range.end - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_header_is_inclusive() {
        assert_eq!(range_header(&(0..10)), Some("bytes=0-9".to_string()));
        assert_eq!(range_header(&(1024..1025)), Some("bytes=1024-1024".to_string()));
        assert_eq!(range_header(&(5..5)), None);
    }
}
