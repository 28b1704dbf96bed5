//! Buffers transformed records and flushes them as append-only NDJSON blobs.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use gcat_adapters::Transformed;
use gcat_core::{CatalogId, CleanedRecord, RawRecord};
use gcat_storage::{decode_ndjson, encode_ndjson, ObjectStore, StagingLayout, StoredObject};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushedBatch {
    pub seq: u32,
    pub raw_path: String,
    pub cleaned_path: String,
    pub raw_sha256: String,
    pub cleaned_sha256: String,
    pub records: usize,
}

pub struct BatchWriter {
    store: Arc<dyn ObjectStore>,
    layout: StagingLayout,
    load_date: NaiveDate,
    seq_offset: u32,
    raw: Vec<RawRecord>,
    cleaned: Vec<CleanedRecord>,
    buffered_ids: HashSet<CatalogId>,
    flushed: Vec<FlushedBatch>,
}

impl BatchWriter {
    /// Sequence numbers continue after blobs already staged for `load_date`,
    /// so a rerun never overwrites an earlier flush.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        layout: StagingLayout,
        load_date: NaiveDate,
    ) -> Result<Self, PipelineError> {
        let existing = store
            .list(&layout.cleaned_prefix(load_date))
            .await
            .map_err(PipelineError::warehouse)?;
        let seq_offset = existing
            .iter()
            .filter_map(|path| layout.cleaned_seq(load_date, path))
            .max()
            .unwrap_or(0);
        if seq_offset > 0 {
            debug!(%load_date, seq_offset, "continuing after existing staged batches");
        }
        Ok(Self {
            store,
            layout,
            load_date,
            seq_offset,
            raw: Vec::new(),
            cleaned: Vec::new(),
            buffered_ids: HashSet::new(),
            flushed: Vec::new(),
        })
    }

    /// Buffer one record. Returns `false` when the id is already buffered.
    pub fn push(&mut self, record: Transformed) -> bool {
        if !self.buffered_ids.insert(record.cleaned.id) {
            return false;
        }
        self.raw.push(record.raw);
        self.cleaned.push(record.cleaned);
        true
    }

    pub fn buffered(&self) -> usize {
        self.cleaned.len()
    }

    /// Write the buffer as raw then cleaned blob for batch `seq`.
    /// Nothing is written for an empty buffer.
    pub async fn flush(&mut self, seq: u32) -> Result<Option<FlushedBatch>, PipelineError> {
        if self.cleaned.is_empty() {
            return Ok(None);
        }
        let seq = self.seq_offset + seq;
        let raw_path = self.layout.raw_batch_path(self.load_date, seq);
        let cleaned_path = self.layout.cleaned_batch_path(self.load_date, seq);

        let raw = self.write(&raw_path, &self.raw).await?;
        let cleaned = self.write(&cleaned_path, &self.cleaned).await?;

        let batch = FlushedBatch {
            seq,
            raw_path,
            cleaned_path,
            raw_sha256: raw.content_hash,
            cleaned_sha256: cleaned.content_hash,
            records: self.cleaned.len(),
        };
        info!(batch_seq = seq, records = batch.records, path = %batch.cleaned_path, "batch flushed");
        self.raw.clear();
        self.cleaned.clear();
        self.buffered_ids.clear();
        self.flushed.push(batch.clone());
        Ok(Some(batch))
    }

    async fn write<T: Serialize>(&self, path: &str, rows: &[T]) -> Result<StoredObject, PipelineError> {
        let failed = |reason: String| PipelineError::StagingWriteFailed {
            path: path.to_string(),
            reason,
        };
        let bytes = encode_ndjson(rows).map_err(|err| failed(err.to_string()))?;
        let stored = self
            .store
            .put(path, bytes)
            .await
            .map_err(|err| failed(err.to_string()))?;
        if stored.unchanged {
            debug!(path, "blob already staged with identical content");
        }
        Ok(stored)
    }

    pub fn into_flushed(self) -> Vec<FlushedBatch> {
        self.flushed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedBlob {
    pub seq: u32,
    pub path: String,
    pub records: Vec<CleanedRecord>,
}

/// Every cleaned blob staged for `load_date`, ordered by sequence number.
pub async fn read_staged_blobs(
    store: &dyn ObjectStore,
    layout: &StagingLayout,
    load_date: NaiveDate,
) -> Result<Vec<StagedBlob>, PipelineError> {
    let mut blobs = Vec::new();
    for path in store
        .list(&layout.cleaned_prefix(load_date))
        .await
        .map_err(PipelineError::warehouse)?
    {
        let Some(seq) = layout.cleaned_seq(load_date, &path) else {
            continue;
        };
        let bytes = store.get(&path).await.map_err(PipelineError::warehouse)?;
        let records = decode_ndjson(&bytes).map_err(PipelineError::warehouse)?;
        blobs.push(StagedBlob { seq, path, records });
    }
    blobs.sort_by_key(|b| b.seq);
    Ok(blobs)
}
