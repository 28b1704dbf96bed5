//! SCD Type 2 reconciliation of a staging batch against the versioned store.

use std::collections::HashMap;

use chrono::NaiveDate;
use gcat_core::{CatalogId, ScdChange, StagingBatch, VersionedEntry};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::warehouse::VersionedStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub inserted: usize,
    pub superseded: usize,
    pub unchanged: usize,
}

/// Decide what the merge does without touching any store.
///
/// `active` maps ids to their current active version. Records whose active
/// version starts after `load_date` are refused: history is only appended.
pub fn plan_merge(
    batch: &StagingBatch,
    active: &HashMap<CatalogId, VersionedEntry>,
    load_date: NaiveDate,
) -> Result<(Vec<ScdChange>, MergeSummary), PipelineError> {
    if let Some(id) = batch.duplicate_ids().first() {
        return Err(PipelineError::conflict(*id, "duplicate id in staging batch"));
    }

    let mut changes = Vec::new();
    let mut summary = MergeSummary::default();
    for record in &batch.records {
        let Some(current) = active.get(&record.id) else {
            changes.push(ScdChange::Insert(VersionedEntry::open(record, load_date)));
            summary.inserted += 1;
            continue;
        };
        if current.attributes.matches(&record.attributes) {
            summary.unchanged += 1;
            continue;
        }
        if current.valid_from > load_date {
            return Err(PipelineError::conflict(
                record.id,
                format!(
                    "active version starts {} after load date {load_date}",
                    current.valid_from
                ),
            ));
        }
        debug!(
            app_id = %record.id,
            fields = ?current.attributes.changed_fields(&record.attributes),
            "attributes changed"
        );
        changes.push(ScdChange::Supersede {
            id: record.id,
            closed_valid_from: current.valid_from,
            valid_to: load_date,
            replacement: VersionedEntry::open(record, load_date),
        });
        summary.superseded += 1;
    }
    Ok((changes, summary))
}

pub async fn merge(
    batch: &StagingBatch,
    store: &dyn VersionedStore,
    load_date: NaiveDate,
) -> Result<MergeSummary, PipelineError> {
    let active = store.active_entries(&batch.ids()).await?;
    let (changes, summary) = plan_merge(batch, &active, load_date)?;
    if !changes.is_empty() {
        store.apply(&changes).await?;
    }
    info!(
        %load_date,
        inserted = summary.inserted,
        superseded = summary.superseded,
        unchanged = summary.unchanged,
        "merge applied"
    );
    Ok(summary)
}
