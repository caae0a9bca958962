//! Self-update engine.
//!
//! Rebuilds the running executable from a differential patch, swaps it in,
//! checks the result, and hands control to the new binary through a detached
//! relaunch helper. Every step before the swap works on side files only; any
//! failure restores the original image from a backup.

pub mod config;
pub mod download;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod orchestrator;
pub mod package;
pub mod patch;
pub mod progress;
pub mod relaunch;
pub mod util;
pub mod verify;

pub use config::UpdaterConfig;
pub use error::{Result, UpdateError};
pub use manifest::{ChunkKind, DiffChunk, DiffManifest};
pub use orchestrator::{UpdateOrchestrator, UpdateReport, UpdateRequest, UpdateState};
pub use progress::{Progress, ProgressCallback};
pub use verify::{verify, Verifier};
