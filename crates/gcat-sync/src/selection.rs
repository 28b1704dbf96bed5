//! Yield estimation and incremental work-set selection.

use std::collections::HashSet;

use futures::stream::{self, StreamExt};
use gcat_adapters::{is_usable_payload, CatalogApi};
use gcat_core::CatalogId;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info};

use crate::error::PipelineError;

/// Share of the first `sample_size` ids whose detail call returns a usable
/// payload. Failed calls count as unusable. An empty sample yields 0.
pub async fn estimate_yield(
    api: &dyn CatalogApi,
    ids: &[CatalogId],
    sample_size: usize,
    concurrency: usize,
) -> f64 {
    let sample = &ids[..sample_size.min(ids.len())];
    if sample.is_empty() {
        return 0.0;
    }

    let usable = stream::iter(sample.iter().copied())
        .map(|id| async move {
            match api.fetch_detail(id).await {
                Ok(Some(payload)) => is_usable_payload(&payload),
                Ok(None) => false,
                Err(err) => {
                    debug!(app_id = %id, error = %err, "sample probe failed");
                    false
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .filter(|ok| futures::future::ready(*ok))
        .count()
        .await;

    let fraction = usable as f64 / sample.len() as f64;
    info!(sampled = sample.len(), usable, fraction, "estimated detail yield");
    fraction
}

/// Prefix of `ids` sized by the estimated yield and the safety margin.
pub fn scale_candidates(
    ids: &[CatalogId],
    fraction: f64,
    safety_margin: f64,
) -> Result<Vec<CatalogId>, PipelineError> {
    if ids.is_empty() || fraction.is_nan() || fraction <= 0.0 {
        return Err(PipelineError::ValidationSampleEmpty);
    }
    let wanted = (ids.len() as f64 * fraction * safety_margin).floor();
    let keep = if wanted >= ids.len() as f64 {
        ids.len()
    } else {
        wanted as usize
    };
    if keep == 0 {
        return Err(PipelineError::ValidationSampleEmpty);
    }
    Ok(ids[..keep].to_vec())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkSet {
    /// New ids first (candidate order), then rechecks.
    pub ids: Vec<CatalogId>,
    pub new_ids: usize,
    pub rechecks: usize,
}

impl WorkSet {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

fn truncate(ids: &mut Vec<CatalogId>, max_apps: Option<usize>) {
    if let Some(max) = max_apps {
        ids.truncate(max);
    }
}

pub fn select_work_set<R: Rng + ?Sized>(
    candidates: &[CatalogId],
    seen: &HashSet<CatalogId>,
    is_initial_load: bool,
    max_apps: Option<usize>,
    resample_fraction: f64,
    rng: &mut R,
) -> WorkSet {
    let mut unique = HashSet::with_capacity(candidates.len());
    let candidates: Vec<CatalogId> = candidates
        .iter()
        .copied()
        .filter(|id| unique.insert(*id))
        .collect();

    if is_initial_load {
        let mut ids = candidates;
        truncate(&mut ids, max_apps);
        let new_ids = ids.len();
        return WorkSet {
            ids,
            new_ids,
            rechecks: 0,
        };
    }

    let (overlap, fresh): (Vec<CatalogId>, Vec<CatalogId>) =
        candidates.into_iter().partition(|id| seen.contains(id));

    let quota = (seen.len() as f64 * resample_fraction).ceil() as usize;
    let recheck_count = overlap.len().min(quota);
    let rechecks: Vec<CatalogId> = overlap
        .choose_multiple(rng, recheck_count)
        .copied()
        .collect();

    let mut ids = fresh;
    ids.extend(rechecks);
    let total_fresh = ids.len() - recheck_count;
    truncate(&mut ids, max_apps);
    let new_ids = total_fresh.min(ids.len());

    info!(
        new_ids,
        rechecks = ids.len() - new_ids,
        overlap = overlap.len(),
        "work set selected"
    );
    WorkSet {
        rechecks: ids.len() - new_ids,
        new_ids,
        ids,
    }
}
