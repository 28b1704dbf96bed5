//! Staging and versioned-history stores used by the merge step.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use gcat_core::{CatalogId, CleanedRecord, ScdChange, StagingBatch, VersionedEntry};

use crate::error::PipelineError;

mod memory;
mod postgres;

pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;

/// Staged cleaned records, keyed by the blob they were loaded from.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Load one cleaned blob. Loading the same `path` again replaces its rows.
    async fn load_blob(
        &self,
        load_date: NaiveDate,
        seq: u32,
        path: &str,
        records: &[CleanedRecord],
    ) -> Result<usize, PipelineError>;

    /// Everything staged for `load_date`; later sequences win on duplicate ids.
    async fn staged_batch(&self, load_date: NaiveDate) -> Result<StagingBatch, PipelineError>;

    /// Drop rows staged for dates before `load_date`, returning how many went.
    /// The cleaned blobs in object storage stay as the audit trail.
    async fn prune_before(&self, load_date: NaiveDate) -> Result<usize, PipelineError>;
}

#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Ids with at least one version.
    async fn seen_ids(&self) -> Result<HashSet<CatalogId>, PipelineError>;

    async fn active_entries(
        &self,
        ids: &[CatalogId],
    ) -> Result<HashMap<CatalogId, VersionedEntry>, PipelineError>;

    /// Apply a merge plan atomically. A plan that no longer fits the stored
    /// state fails with `MergeConflict` and leaves the store untouched.
    async fn apply(&self, changes: &[ScdChange]) -> Result<(), PipelineError>;

    /// All versions of one id ordered by `valid_from`.
    async fn history(&self, id: CatalogId) -> Result<Vec<VersionedEntry>, PipelineError>;

    /// All versions ordered by id then `valid_from`.
    async fn all_entries(&self) -> Result<Vec<VersionedEntry>, PipelineError>;
}
