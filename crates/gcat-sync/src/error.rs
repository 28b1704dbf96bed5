use gcat_adapters::AdapterError;
use gcat_core::CatalogId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("upstream catalog unavailable: {0}")]
    UpstreamUnavailable(#[source] AdapterError),
    #[error("detail fetch failed for app {id}: {reason}")]
    DetailFetchFailed { id: CatalogId, reason: String },
    #[error("validation sample produced no usable ids")]
    ValidationSampleEmpty,
    #[error("staging write failed for {path}: {reason}")]
    StagingWriteFailed { path: String, reason: String },
    #[error("merge conflict for app {id}: {reason}")]
    MergeConflict { id: CatalogId, reason: String },
    #[error("warehouse error: {0}")]
    Warehouse(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn warehouse(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Warehouse(Box::new(err))
    }

    pub fn conflict(id: CatalogId, reason: impl Into<String>) -> Self {
        Self::MergeConflict {
            id,
            reason: reason.into(),
        }
    }

    /// Errors that end the run and are left to the caller's retry policy.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::DetailFetchFailed { .. } | Self::ValidationSampleEmpty
        )
    }
}
