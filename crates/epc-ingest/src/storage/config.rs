use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::parsed;

/// Default S3 region.
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Default bucket for landed objects and checkpoints.
pub const DEFAULT_S3_BUCKET: &str = "epc-ingest";

/// Default root directory for the local backend.
pub const DEFAULT_LOCAL_ROOT: &str = "./data/epc";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    Local,
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "s3" | "minio" => Ok(StorageBackend::S3),
            "local" | "fs" | "file" => Ok(StorageBackend::Local),
            other => Err(anyhow::anyhow!("Invalid storage backend: {}", other)),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub local_root: PathBuf,
    /// Prepended to every key on the S3 backend
    pub key_prefix: Option<String>,
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    /// Static credentials; the AWS default chain is used when unset
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("backend", &self.backend)
            .field("local_root", &self.local_root)
            .field("key_prefix", &self.key_prefix)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key", &self.access_key.as_ref().map(|_| "***"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "***"))
            .field("path_style", &self.path_style)
            .finish()
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::S3,
            local_root: PathBuf::from(DEFAULT_LOCAL_ROOT),
            key_prefix: None,
            endpoint: None,
            region: DEFAULT_S3_REGION.to_string(),
            bucket: DEFAULT_S3_BUCKET.to_string(),
            access_key: None,
            secret_key: None,
            path_style: false,
        }
    }
}

impl StorageConfig {
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let backend = match lookup("STORAGE_BACKEND") {
            Some(value) => value.parse()?,
            None => StorageBackend::default(),
        };

        Ok(Self {
            backend,
            local_root: lookup("STORAGE_LOCAL_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_ROOT)),
            key_prefix: lookup("STORAGE_KEY_PREFIX")
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
            endpoint: lookup("S3_ENDPOINT").filter(|s| !s.is_empty()),
            region: lookup("S3_REGION").unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
            bucket: lookup("S3_BUCKET").unwrap_or_else(|| DEFAULT_S3_BUCKET.to_string()),
            access_key: lookup("S3_ACCESS_KEY").or_else(|| lookup("AWS_ACCESS_KEY_ID")),
            secret_key: lookup("S3_SECRET_KEY").or_else(|| lookup("AWS_SECRET_ACCESS_KEY")),
            path_style: parsed(lookup, "S3_PATH_STYLE")?.unwrap_or(false),
        })
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            bucket: bucket.into(),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
            ..Self::default()
        }
    }

    pub fn for_local(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: StorageBackend::Local,
            local_root: root.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match self.backend {
            StorageBackend::S3 => {
                if self.bucket.is_empty() {
                    anyhow::bail!("S3_BUCKET cannot be empty");
                }
                if self.access_key.is_some() != self.secret_key.is_some() {
                    anyhow::bail!("S3_ACCESS_KEY and S3_SECRET_KEY must be set together");
                }
            },
            StorageBackend::Local => {
                if self.local_root.as_os_str().is_empty() {
                    anyhow::bail!("STORAGE_LOCAL_ROOT cannot be empty");
                }
            },
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_for_minio() {
        let config = StorageConfig::for_minio("http://localhost:9000", "test-bucket");
        assert_eq!(config.endpoint, Some("http://localhost:9000".to_string()));
        assert_eq!(config.bucket, "test-bucket");
        assert!(config.path_style);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_half_credentials_rejected() {
        let config = StorageConfig {
            access_key: Some("key".to_string()),
            ..StorageConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_hides_credentials() {
        let config = StorageConfig::for_minio("http://localhost:9000", "b");
        assert!(!format!("{:?}", config).contains("minioadmin"));
    }
}
