use serde::{Deserialize, Serialize};

/// Lifecycle state of an upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadState {
    /// Registered, multipart transaction not opened yet.
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
    /// Preempted by shutdown or deadline; the checkpoint was kept for resume.
    #[serde(rename = "interrupted")]
    Interrupted,
}

impl UploadState {
    /// Returns `true` once the transfer can no longer make progress.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadState::Completed
                | UploadState::Failed
                | UploadState::Cancelled
                | UploadState::Interrupted
        )
    }
}

/// Point-in-time view of an upload task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub upload_id: String,
    pub bucket: String,
    pub object: String,
    pub state: UploadState,
    pub is_paused: bool,
    pub is_canceled: bool,
    /// Highest part number acknowledged so far.
    pub current_part: u32,
    pub completed_count: usize,
    /// Number of parts in the plan (0 for single-request uploads).
    pub total_parts: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Final ETag once the object has been committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl UploadStatus {
    /// Returns upload progress as a percentage (0-100) of acknowledged parts.
    pub fn percentage(&self) -> f64 {
        if self.total_parts == 0 {
            return if self.state == UploadState::Completed {
                100.0
            } else {
                0.0
            };
        }
        self.completed_count as f64 / self.total_parts as f64 * 100.0
    }
}

/// Response to a successful `StartUpload` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadResponse {
    pub upload_id: String,
    pub message: String,
}

/// Error details returned by control operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code, e.g. `not_found`.
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_status() -> UploadStatus {
        UploadStatus {
            upload_id: "5d41402a-1700000000".into(),
            bucket: "media".into(),
            object: "video.mp4".into(),
            state: UploadState::InProgress,
            is_paused: false,
            is_canceled: false,
            current_part: 3,
            completed_count: 2,
            total_parts: 4,
            last_error: None,
            etag: None,
        }
    }

    #[test]
    fn status_uses_camel_case_fields() {
        let json = serde_json::to_string(&sample_status()).unwrap();
        assert!(json.contains("\"isPaused\":false"));
        assert!(json.contains("\"currentPart\":3"));
        assert!(json.contains("\"completedCount\":2"));
        assert!(json.contains("\"state\":\"in_progress\""));
        assert!(!json.contains("lastError"));
        assert!(!json.contains("etag"));
    }

    #[test]
    fn status_parses_without_optional_fields() {
        let json = r#"{
            "uploadId": "u1", "bucket": "b", "object": "o", "state": "failed",
            "isPaused": false, "isCanceled": false, "currentPart": 0,
            "completedCount": 0, "totalParts": 2
        }"#;
        let status: UploadStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.state, UploadState::Failed);
        assert!(status.last_error.is_none());
    }

    #[test]
    fn percentage_counts_parts() {
        let status = sample_status();
        assert_eq!(status.percentage(), 50.0);
    }

    #[test]
    fn percentage_single_request_upload() {
        let mut status = sample_status();
        status.total_parts = 0;
        assert_eq!(status.percentage(), 0.0);
        status.state = UploadState::Completed;
        assert_eq!(status.percentage(), 100.0);
    }

    #[test]
    fn terminal_states() {
        assert!(!UploadState::Pending.is_terminal());
        assert!(!UploadState::Paused.is_terminal());
        assert!(UploadState::Completed.is_terminal());
        assert!(UploadState::Interrupted.is_terminal());
    }
}
