//! Resumable multipart upload engine.
//!
//! [`UploadEngine`] accepts payloads, splits them into parts and uploads
//! those concurrently into a multipart transaction on an
//! [`ObjectStore`](objgate_store::ObjectStore). Progress is checkpointed
//! after every acknowledged part so an interrupted upload of the same
//! payload resumes where it stopped. Each upload can be paused, resumed,
//! cancelled and inspected by id while it runs.

pub mod checkpoint;
mod committer;
pub mod config;
mod coordinator;
pub mod engine;
pub mod error;
pub mod registry;

#[cfg(test)]
mod testing;

pub use checkpoint::{
    Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, checkpoint_key,
};
pub use config::EngineConfig;
pub use engine::UploadEngine;
pub use error::UploadError;
pub use registry::{TaskRegistry, UploadTask};
