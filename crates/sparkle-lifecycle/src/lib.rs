pub mod drift;
pub mod registry;
pub mod retraining;

use thiserror::Error;

pub use drift::{DriftAnalysis, DriftDetector, DriftSeverity};
pub use registry::{VersionCompare, VersionRegistry};
pub use retraining::{RetrainingOrchestrator, RetrainingStartReport};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("store error: {0}")]
    Store(#[from] sparkle_store::StoreError),

    #[error("unknown variant: {0}")]
    UnknownVariant(String),

    #[error("version not found: {variant} v{version}")]
    VersionNotFound { variant: String, version: i64 },

    #[error("no previous version to roll back to for '{0}'")]
    NothingToRollBack(String),

    #[error("retraining session not found: {0}")]
    SessionNotFound(String),

    #[error("retraining blocked: {0}")]
    RetrainingBlocked(String),

    #[error("evaluation failed: {0}")]
    EvaluationFailed(String),
}
