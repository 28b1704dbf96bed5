use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDate;
use gcat_core::{CatalogId, CleanedRecord, ScdChange, StagingBatch, VersionedEntry};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use super::{StagingStore, VersionedStore};
use crate::error::PipelineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StagedRows {
    load_date: NaiveDate,
    seq: u32,
    records: Vec<CleanedRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WarehouseState {
    #[serde(default)]
    staging: BTreeMap<String, StagedRows>,
    #[serde(default)]
    versions: Vec<VersionedEntry>,
}

impl WarehouseState {
    fn active_index(&self, id: CatalogId) -> Option<usize> {
        self.versions.iter().position(|v| v.id == id && v.is_active)
    }

    fn apply(&mut self, changes: &[ScdChange]) -> Result<(), PipelineError> {
        let mut touched = HashSet::new();
        for change in changes {
            let id = change.id();
            if !touched.insert(id) {
                return Err(PipelineError::conflict(id, "id appears twice in merge plan"));
            }
            match change {
                ScdChange::Insert(entry) => {
                    if self.active_index(id).is_some() {
                        return Err(PipelineError::conflict(id, "insert over an active version"));
                    }
                    self.versions.push(entry.clone());
                }
                ScdChange::Supersede {
                    closed_valid_from,
                    valid_to,
                    replacement,
                    ..
                } => {
                    let index = self
                        .active_index(id)
                        .filter(|&i| self.versions[i].valid_from == *closed_valid_from)
                        .ok_or_else(|| PipelineError::conflict(id, "superseded version is no longer active"))?;
                    self.versions[index].close(*valid_to);
                    self.versions.push(replacement.clone());
                }
            }
        }
        self.versions.sort_by_key(|v| (v.id, v.valid_from, v.is_active));
        Ok(())
    }
}

/// In-process warehouse. With a snapshot path, merges and staging pruning
/// are persisted as JSON so local runs keep their history. Loaded blobs ride
/// along with the next persisted write.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<WarehouseState>,
    persist_to: Option<PathBuf>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let state = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(PipelineError::warehouse)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => WarehouseState::default(),
            Err(err) => return Err(PipelineError::warehouse(err)),
        };
        Ok(Self {
            state: Mutex::new(state),
            persist_to: Some(path),
        })
    }

    async fn persist(&self, state: &WarehouseState) -> Result<(), PipelineError> {
        let Some(path) = &self.persist_to else {
            return Ok(());
        };
        write_snapshot(path, state).await?;
        debug!(path = %path.display(), versions = state.versions.len(), "warehouse snapshot saved");
        Ok(())
    }
}

async fn write_snapshot(path: &Path, state: &WarehouseState) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(PipelineError::warehouse)?;
    }
    let bytes = serde_json::to_vec(state).map_err(PipelineError::warehouse)?;
    let temp = path.with_extension("json.tmp");
    fs::write(&temp, bytes).await.map_err(PipelineError::warehouse)?;
    fs::rename(&temp, path).await.map_err(PipelineError::warehouse)
}

#[async_trait]
impl StagingStore for MemoryWarehouse {
    async fn load_blob(
        &self,
        load_date: NaiveDate,
        seq: u32,
        path: &str,
        records: &[CleanedRecord],
    ) -> Result<usize, PipelineError> {
        let mut state = self.state.lock().await;
        state.staging.insert(
            path.to_string(),
            StagedRows {
                load_date,
                seq,
                records: records.to_vec(),
            },
        );
        Ok(records.len())
    }

    async fn staged_batch(&self, load_date: NaiveDate) -> Result<StagingBatch, PipelineError> {
        let state = self.state.lock().await;
        let sequences = state
            .staging
            .values()
            .filter(|rows| rows.load_date == load_date)
            .map(|rows| (rows.seq, rows.records.clone()))
            .collect();
        Ok(StagingBatch::from_sequences(sequences))
    }

    async fn prune_before(&self, load_date: NaiveDate) -> Result<usize, PipelineError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let mut removed = 0;
        next.staging.retain(|_, rows| {
            let keep = rows.load_date >= load_date;
            if !keep {
                removed += rows.records.len();
            }
            keep
        });
        if removed == 0 {
            return Ok(0);
        }
        self.persist(&next).await?;
        *state = next;
        Ok(removed)
    }
}

#[async_trait]
impl VersionedStore for MemoryWarehouse {
    async fn seen_ids(&self) -> Result<HashSet<CatalogId>, PipelineError> {
        let state = self.state.lock().await;
        Ok(state.versions.iter().map(|v| v.id).collect())
    }

    async fn active_entries(
        &self,
        ids: &[CatalogId],
    ) -> Result<HashMap<CatalogId, VersionedEntry>, PipelineError> {
        let wanted: HashSet<CatalogId> = ids.iter().copied().collect();
        let state = self.state.lock().await;
        Ok(state
            .versions
            .iter()
            .filter(|v| v.is_active && wanted.contains(&v.id))
            .map(|v| (v.id, v.clone()))
            .collect())
    }

    async fn apply(&self, changes: &[ScdChange]) -> Result<(), PipelineError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.apply(changes)?;
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    async fn history(&self, id: CatalogId) -> Result<Vec<VersionedEntry>, PipelineError> {
        let state = self.state.lock().await;
        Ok(state.versions.iter().filter(|v| v.id == id).cloned().collect())
    }

    async fn all_entries(&self) -> Result<Vec<VersionedEntry>, PipelineError> {
        Ok(self.state.lock().await.versions.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcat_core::CatalogAttributes;
    use tempfile::tempdir;

    fn id(raw: u64) -> CatalogId {
        CatalogId::new(raw).unwrap()
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, d).unwrap()
    }

    fn record(raw: u64, price: f64) -> CleanedRecord {
        CleanedRecord {
            id: id(raw),
            attributes: CatalogAttributes {
                price,
                ..Default::default()
            },
            load_date: date(1),
        }
    }

    #[tokio::test]
    async fn reloading_a_blob_replaces_its_rows() {
        let wh = MemoryWarehouse::new();
        wh.load_blob(date(1), 1, "processed/a_1.json", &[record(1, 1.0), record(2, 1.0)])
            .await
            .unwrap();
        wh.load_blob(date(1), 1, "processed/a_1.json", &[record(1, 1.0)])
            .await
            .unwrap();
        wh.load_blob(date(1), 2, "processed/a_2.json", &[record(1, 4.0)])
            .await
            .unwrap();
        wh.load_blob(date(2), 1, "processed/b_1.json", &[record(9, 1.0)])
            .await
            .unwrap();

        let batch = wh.staged_batch(date(1)).await.unwrap();
        assert_eq!(batch.ids(), vec![id(1)]);
        assert_eq!(batch.records[0].attributes.price, 4.0);
    }

    #[tokio::test]
    async fn stale_plans_are_rejected_without_partial_application() {
        let wh = MemoryWarehouse::new();
        let first = VersionedEntry::open(&record(1, 1.0), date(1));
        wh.apply(&[ScdChange::Insert(first.clone())]).await.unwrap();

        let stale = [
            ScdChange::Insert(VersionedEntry::open(&record(2, 1.0), date(2))),
            ScdChange::Insert(VersionedEntry::open(&record(1, 2.0), date(2))),
        ];
        assert!(matches!(
            wh.apply(&stale).await,
            Err(PipelineError::MergeConflict { id, .. }) if id.get() == 1
        ));

        let wrong_target = [ScdChange::Supersede {
            id: id(1),
            closed_valid_from: date(5),
            valid_to: date(6),
            replacement: VersionedEntry::open(&record(1, 3.0), date(6)),
        }];
        assert!(wh.apply(&wrong_target).await.is_err());
        assert_eq!(wh.all_entries().await.unwrap(), vec![first]);
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested/warehouse.json");
        {
            let wh = MemoryWarehouse::open(&path).await.unwrap();
            wh.load_blob(date(3), 1, "processed/x_1.json", &[record(7, 1.0)])
                .await
                .unwrap();
            assert!(!path.exists());
            wh.apply(&[ScdChange::Insert(VersionedEntry::open(&record(7, 1.0), date(3)))])
                .await
                .unwrap();
        }
        let reopened = MemoryWarehouse::open(&path).await.unwrap();
        assert_eq!(reopened.seen_ids().await.unwrap(), HashSet::from([id(7)]));
        assert_eq!(reopened.staged_batch(date(3)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pruning_drops_only_earlier_load_dates() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("warehouse.json");
        let wh = MemoryWarehouse::open(&path).await.unwrap();
        wh.load_blob(date(1), 1, "processed/a_1.json", &[record(1, 1.0), record(2, 1.0)])
            .await
            .unwrap();
        wh.load_blob(date(2), 1, "processed/b_1.json", &[record(1, 2.0)])
            .await
            .unwrap();
        wh.load_blob(date(3), 1, "processed/c_1.json", &[record(3, 1.0)])
            .await
            .unwrap();

        assert_eq!(wh.prune_before(date(3)).await.unwrap(), 3);
        assert_eq!(wh.prune_before(date(3)).await.unwrap(), 0);
        assert!(wh.staged_batch(date(1)).await.unwrap().is_empty());
        assert!(wh.staged_batch(date(2)).await.unwrap().is_empty());
        assert_eq!(wh.staged_batch(date(3)).await.unwrap().ids(), vec![id(3)]);

        let reopened = MemoryWarehouse::open(&path).await.unwrap();
        assert!(reopened.staged_batch(date(1)).await.unwrap().is_empty());
        assert_eq!(reopened.staged_batch(date(3)).await.unwrap().len(), 1);
    }
}
