//! Engine tuning knobs.

use std::time::Duration;

use objgate_transfer::DEFAULT_PART_SIZE;
use serde::{Deserialize, Serialize};

use crate::UploadError;

/// Default number of concurrent part uploads per transfer.
pub const DEFAULT_WORKERS: usize = 5;

/// Default number of finished uploads kept for status queries.
pub const DEFAULT_FINISHED_RETENTION: usize = 1024;

/// Upload engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Size of every part except the last, in bytes.
    pub part_size: u64,
    /// Upper bound on concurrent part uploads per transfer.
    pub workers: usize,
    /// Wall-clock limit for a single transfer, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
    /// How many finished uploads stay queryable through `status`.
    pub finished_retention: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            workers: DEFAULT_WORKERS,
            deadline_secs: None,
            finished_retention: DEFAULT_FINISHED_RETENTION,
        }
    }
}

impl EngineConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.part_size == 0 {
            return Err(UploadError::InvalidConfiguration(
                "part size must be greater than zero".into(),
            ));
        }
        if self.workers == 0 {
            return Err(UploadError::InvalidConfiguration(
                "worker count must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_gateway_behaviour() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.part_size, 5 * 1024 * 1024);
        assert_eq!(cfg.workers, 5);
        assert!(cfg.deadline().is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_part_size_and_workers() {
        let cfg = EngineConfig {
            part_size: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(UploadError::InvalidConfiguration(_))));

        let cfg = EngineConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(UploadError::InvalidConfiguration(_))));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"workers": 2, "deadlineSecs": 30}"#).unwrap();
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.part_size, DEFAULT_PART_SIZE);
        assert_eq!(cfg.deadline(), Some(Duration::from_secs(30)));
    }
}
