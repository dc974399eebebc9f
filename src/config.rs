//! Configuration management for the file store

use std::env;
use std::path::PathBuf;

use crate::binary::DEFAULT_CHUNK_SIZE;
use crate::checksum::ChecksumAlgorithm;

/// Upper bound for concurrent background checksum computations
pub const MAX_CHECKSUM_PARALLEL: usize = 1024;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub checksum: ChecksumConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Maximum size of a single stored part
    pub chunk_size: usize,
}

/// Where binary bytes live
#[derive(Debug, Clone)]
pub enum StorageBackend {
    /// Alongside the metadata, in the sqlite database
    Database,
    FileSystem { directory: PathBuf },
    S3(S3Config),
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: Option<String>,
    /// Key prefix every binary is stored under
    pub prefix: String,
}

#[derive(Debug, Clone)]
pub struct ChecksumConfig {
    pub enable: bool,
    pub algorithm: ChecksumAlgorithm,
    /// Compute checksums inline on insert instead of in the background
    pub sync_checksum: bool,
    /// Background queue capacity
    pub capacity: usize,
    /// Concurrent background computations, 0 means one per CPU
    pub parallel: usize,
}

impl ChecksumConfig {
    /// Worker count with the CPU default applied, capped at
    /// [`MAX_CHECKSUM_PARALLEL`]
    pub fn effective_parallel(&self) -> usize {
        let parallel = if self.parallel > 0 {
            self.parallel
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        };

        parallel.min(MAX_CHECKSUM_PARALLEL)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: DatabaseConfig {
                url: "sqlite:./fileshare.db".to_string(),
            },
            storage: StorageConfig {
                backend: StorageBackend::Database,
                chunk_size: DEFAULT_CHUNK_SIZE,
            },
            checksum: ChecksumConfig {
                enable: true,
                algorithm: ChecksumAlgorithm::Sha256,
                sync_checksum: false,
                capacity: 5000,
                parallel: 0,
            },
        }
    }
}

impl Config {
    /// Read configuration from process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend = match var("FILESTORE_BACKEND").as_deref().map(str::trim) {
            None | Some("database") => StorageBackend::Database,
            Some("filesystem") => StorageBackend::FileSystem {
                directory: var("FILESTORE_DIRECTORY")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data/files")),
            },
            Some("s3") => StorageBackend::S3(S3Config {
                endpoint: var("S3_ENDPOINT").ok_or(ConfigError::Missing("S3_ENDPOINT"))?,
                bucket: var("S3_BUCKET").ok_or(ConfigError::Missing("S3_BUCKET"))?,
                access_key: var("S3_ACCESS_KEY").ok_or(ConfigError::Missing("S3_ACCESS_KEY"))?,
                secret_key: var("S3_SECRET_KEY").ok_or(ConfigError::Missing("S3_SECRET_KEY"))?,
                region: Some(var("S3_REGION").unwrap_or_else(|| "us-east-1".to_string())),
                prefix: var("S3_PREFIX").unwrap_or_else(|| "files".to_string()),
            }),
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "FILESTORE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let chunk_size = match var("FILESTORE_CHUNK_SIZE") {
            Some(value) => parse_byte_size(&value)
                .filter(|size| *size > 0)
                .ok_or(ConfigError::Invalid {
                    key: "FILESTORE_CHUNK_SIZE",
                    value,
                })?,
            None => defaults.storage.chunk_size,
        };

        let algorithm = match var("CHECKSUM_ALGORITHM") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                key: "CHECKSUM_ALGORITHM",
                value,
            })?,
            None => defaults.checksum.algorithm,
        };

        let capacity = parse_var(&var, "CHECKSUM_CAPACITY", defaults.checksum.capacity)?;
        if capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "CHECKSUM_CAPACITY",
                value: "0".to_string(),
            });
        }

        let parallel = parse_var(&var, "CHECKSUM_PARALLEL", defaults.checksum.parallel)?;
        if parallel > MAX_CHECKSUM_PARALLEL {
            return Err(ConfigError::Invalid {
                key: "CHECKSUM_PARALLEL",
                value: parallel.to_string(),
            });
        }

        Ok(Config {
            database: DatabaseConfig {
                url: var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            storage: StorageConfig {
                backend,
                chunk_size,
            },
            checksum: ChecksumConfig {
                enable: parse_var(&var, "CHECKSUM_ENABLE", defaults.checksum.enable)?,
                algorithm,
                sync_checksum: parse_var(&var, "CHECKSUM_SYNC", defaults.checksum.sync_checksum)?,
                capacity,
                parallel,
            },
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match var(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

/// Parse a byte size such as `4096`, `512K` or `2M`
pub fn parse_byte_size(value: &str) -> Option<usize> {
    let value = value.trim();
    let (digits, multiplier) = match value.char_indices().last()? {
        (i, 'k' | 'K') => (&value[..i], 1024),
        (i, 'm' | 'M') => (&value[..i], 1024 * 1024),
        _ => (value, 1),
    };

    digits.trim().parse::<usize>().ok()?.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("4096"), Some(4096));
        assert_eq!(parse_byte_size("512K"), Some(512 * 1024));
        assert_eq!(parse_byte_size("2m"), Some(2 * 1024 * 1024));
        assert_eq!(parse_byte_size(""), None);
        assert_eq!(parse_byte_size("K"), None);
        assert_eq!(parse_byte_size("12Q"), None);
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert!(matches!(config.storage.backend, StorageBackend::Database));
        assert_eq!(config.storage.chunk_size, 512 * 1024);
        assert_eq!(config.database.url, "sqlite:./fileshare.db");
        assert!(config.checksum.enable);
        assert!(!config.checksum.sync_checksum);
        assert_eq!(config.checksum.capacity, 5000);
        assert_eq!(config.checksum.algorithm, ChecksumAlgorithm::Sha256);
        assert!(config.checksum.effective_parallel() >= 1);
    }

    #[test]
    fn test_filesystem_backend() {
        let config = Config::from_lookup(lookup(&[
            ("FILESTORE_BACKEND", "filesystem"),
            ("FILESTORE_DIRECTORY", "/tmp/files"),
            ("FILESTORE_CHUNK_SIZE", "64K"),
            ("CHECKSUM_ALGORITHM", "sha512"),
            ("CHECKSUM_PARALLEL", "3"),
        ]))
        .unwrap();

        match config.storage.backend {
            StorageBackend::FileSystem { directory } => {
                assert_eq!(directory, PathBuf::from("/tmp/files"))
            }
            other => panic!("unexpected backend {:?}", other),
        }
        assert_eq!(config.storage.chunk_size, 64 * 1024);
        assert_eq!(config.checksum.algorithm, ChecksumAlgorithm::Sha512);
        assert_eq!(config.checksum.effective_parallel(), 3);
    }

    #[test]
    fn test_s3_backend_requires_credentials() {
        let err = Config::from_lookup(lookup(&[
            ("FILESTORE_BACKEND", "s3"),
            ("S3_ENDPOINT", "http://localhost:9000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("S3_BUCKET")));

        let config = Config::from_lookup(lookup(&[
            ("FILESTORE_BACKEND", "s3"),
            ("S3_ENDPOINT", "http://localhost:9000"),
            ("S3_BUCKET", "files"),
            ("S3_ACCESS_KEY", "admin"),
            ("S3_SECRET_KEY", "secret"),
        ]))
        .unwrap();
        match config.storage.backend {
            StorageBackend::S3(s3) => {
                assert_eq!(s3.region.as_deref(), Some("us-east-1"));
                assert_eq!(s3.prefix, "files");
            }
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::from_lookup(lookup(&[("FILESTORE_CHUNK_SIZE", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("CHECKSUM_CAPACITY", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("CHECKSUM_ENABLE", "maybe")])).is_err());
        assert!(Config::from_lookup(lookup(&[("CHECKSUM_ALGORITHM", "md5")])).is_err());
        assert!(Config::from_lookup(lookup(&[("FILESTORE_BACKEND", "tape")])).is_err());

        let huge = usize::MAX.to_string();
        let err = Config::from_lookup(lookup(&[("CHECKSUM_PARALLEL", huge.as_str())])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "CHECKSUM_PARALLEL", .. }));
        assert!(Config::from_lookup(lookup(&[("CHECKSUM_PARALLEL", "1025")])).is_err());
        assert!(Config::from_lookup(lookup(&[("CHECKSUM_PARALLEL", "1024")])).is_ok());
    }

    #[test]
    fn test_effective_parallel_is_capped() {
        let mut checksum = Config::default().checksum;
        checksum.parallel = usize::MAX;
        assert_eq!(checksum.effective_parallel(), MAX_CHECKSUM_PARALLEL);
    }
}
