//! Model artifact transfer
//!
//! Artifacts are fetched in chunks into `temp/<id>.part`, checkpointed through a
//! resume marker, verified against the descriptor's checksum and only then renamed
//! into `models/`.

mod locks;
mod manager;
mod source;
mod state;
mod store;
mod verify;

pub use locks::{ArtifactLocks, ExclusiveArtifactGuard, SharedArtifactGuard};
pub use manager::{DownloadConfig, DownloadManager};
pub use source::{
    is_transient_status, ArtifactBody, ArtifactSource, HttpSource, Injected, MemorySource,
    OpenedArtifact,
};
pub use state::{DownloadProgress, DownloadState, DownloadStatus};
pub use store::{LocalModel, ModelStore, ResumeMarker};
pub use verify::{digest_file, verify_artifact, ArtifactDigest};
