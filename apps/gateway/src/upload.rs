//! `upload` command: pushes one local file through the engine.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use objgate_protocol::{StartUploadResponse, UploadState, UploadStatus};
use objgate_transfer::FileSource;
use objgate_upload::{FileCheckpointStore, UploadEngine};
use tracing::{info, warn};

use crate::config::GatewayConfig;

/// Builds the engine from `config` and uploads `file` to `bucket/object`.
///
/// The accepted upload and its final status are printed to stdout as JSON.
/// Ctrl-C interrupts the upload and keeps its checkpoint, so running the
/// same command again resumes it.
pub async fn run(
    config: &GatewayConfig,
    bucket: &str,
    object: &str,
    file: &Path,
) -> anyhow::Result<UploadStatus> {
    let store = config.store.build()?;
    let checkpoints = Arc::new(FileCheckpointStore::new(&config.checkpoint_dir));
    let engine = UploadEngine::new(store, checkpoints, config.engine.clone())?;

    let source = Arc::new(FileSource::open(file).await?);
    let id = engine.start_upload(bucket, object, source)?;
    info!(upload_id = %id, file = %file.display(), bucket, object, "upload accepted");
    let accepted = StartUploadResponse {
        upload_id: id.clone(),
        message: format!("uploading {} to {bucket}/{object}", file.display()),
    };
    println!("{}", serde_json::to_string(&accepted)?);

    let status = drive(&engine, &id).await?;
    println!("{}", serde_json::to_string(&status)?);
    match status.state {
        UploadState::Completed => {
            info!(
                upload_id = %id,
                etag = status.etag.as_deref().unwrap_or_default(),
                "upload finished"
            );
            Ok(status)
        }
        UploadState::Interrupted => {
            warn!(upload_id = %id, "upload interrupted, run the command again to resume");
            Ok(status)
        }
        state => anyhow::bail!(
            "upload {id} ended as {state:?}: {}",
            status.last_error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

/// Waits for `id`, logging progress every second and shutting the engine
/// down on Ctrl-C.
async fn drive(engine: &UploadEngine, id: &str) -> anyhow::Result<UploadStatus> {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let finished = engine.wait(id);
    tokio::pin!(finished);
    let mut interrupted = false;

    loop {
        tokio::select! {
            status = &mut finished => return Ok(status?),
            _ = ticker.tick() => {
                if let Ok(status) = engine.status(id) {
                    info!(
                        upload_id = %id,
                        state = ?status.state,
                        parts = status.completed_count,
                        total = status.total_parts,
                        percent = format_args!("{:.1}", status.percentage()),
                        "progress"
                    );
                }
            }
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal?;
                interrupted = true;
                warn!(upload_id = %id, "interrupt received, stopping upload");
                engine.shutdown().await;
            }
        }
    }
}
