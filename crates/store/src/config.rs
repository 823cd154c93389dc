//! Backend selection.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{FsStore, MemoryStore, ObjectStore, StoreError};

/// Which backing store the gateway talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local store; contents vanish on exit.
    Memory {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        buckets: Vec<String>,
    },
    /// Directory tree on the local filesystem.
    Filesystem {
        root: PathBuf,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        buckets: Vec<String>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory {
            buckets: Vec::new(),
        }
    }
}

impl StoreConfig {
    /// Builds the configured store, creating any listed buckets.
    pub fn build(&self) -> Result<Arc<dyn ObjectStore>, StoreError> {
        match self {
            StoreConfig::Memory { buckets } => {
                let store = MemoryStore::new();
                for bucket in buckets {
                    store.create_bucket(bucket.clone());
                }
                Ok(Arc::new(store))
            }
            StoreConfig::Filesystem { root, buckets } => {
                std::fs::create_dir_all(root)?;
                for bucket in buckets {
                    objgate_transfer::validate_bucket_name(bucket)
                        .map_err(|e| StoreError::InvalidRequest(e.to_string()))?;
                    std::fs::create_dir_all(root.join(bucket))?;
                }
                Ok(Arc::new(FsStore::new(root.clone())))
            }
        }
    }
}
