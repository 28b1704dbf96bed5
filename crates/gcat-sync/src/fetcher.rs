//! Batched detail fetching: sequential with a fixed delay inside a batch,
//! bounded number of batches in flight, results fanned in over mpsc.

use std::sync::Arc;
use std::time::Duration;

use gcat_adapters::CatalogApi;
use gcat_core::CatalogId;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::IngestTuning;
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPlan {
    pub batch_size: usize,
    pub max_in_flight: usize,
    pub call_delay: Duration,
}

impl FetchPlan {
    pub fn from_tuning(tuning: &IngestTuning) -> Self {
        Self {
            batch_size: tuning.batch_size,
            max_in_flight: tuning.max_in_flight_batches,
            call_delay: tuning.call_delay(),
        }
    }
}

impl Default for FetchPlan {
    fn default() -> Self {
        Self::from_tuning(&IngestTuning::default())
    }
}

#[derive(Debug)]
pub struct FetchedBatch {
    /// 1-based position of the batch in the work set.
    pub seq: u32,
    /// Every id of the batch in listed order; `None` when nothing usable came back.
    pub items: Vec<(CatalogId, Option<JsonValue>)>,
    pub failures: Vec<PipelineError>,
}

impl FetchedBatch {
    pub fn fetched(&self) -> usize {
        self.items.iter().filter(|(_, payload)| payload.is_some()).count()
    }
}

pub struct RateLimitedFetcher {
    api: Arc<dyn CatalogApi>,
    plan: FetchPlan,
}

impl RateLimitedFetcher {
    pub fn new(api: Arc<dyn CatalogApi>, plan: FetchPlan) -> Self {
        Self { api, plan }
    }

    /// Completed batches arrive in completion order. Dropping the receiver
    /// stops dispatch of batches that have not started and ends running
    /// batches at their next call.
    pub fn fetch_batches(&self, ids: Vec<CatalogId>) -> mpsc::Receiver<FetchedBatch> {
        let in_flight = self.plan.max_in_flight.max(1);
        let (tx, rx) = mpsc::channel(in_flight);
        let chunks: Vec<Vec<CatalogId>> = ids
            .chunks(self.plan.batch_size.max(1))
            .map(<[CatalogId]>::to_vec)
            .collect();
        let api = Arc::clone(&self.api);
        let delay = self.plan.call_delay;
        let limit = Arc::new(Semaphore::new(in_flight));

        tokio::spawn(async move {
            let mut tasks = JoinSet::new();
            for (index, chunk) in chunks.into_iter().enumerate() {
                let permit = tokio::select! {
                    permit = Arc::clone(&limit).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = tx.closed() => break,
                };
                let seq = index as u32 + 1;
                let api = Arc::clone(&api);
                let tx = tx.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    let span = info_span!("fetch_batch", batch_seq = seq, size = chunk.len());
                    if let Some(batch) = fetch_batch(api.as_ref(), seq, chunk, delay, &tx)
                        .instrument(span)
                        .await
                    {
                        if tx.send(batch).await.is_err() {
                            debug!(batch_seq = seq, "receiver dropped, batch discarded");
                        }
                    }
                });
            }
            drop(tx);
            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    warn!(error = %err, "fetch batch task failed");
                }
            }
        });

        rx
    }

    /// Every id with its payload, in work-set order.
    pub async fn fetch_details(&self, ids: Vec<CatalogId>) -> Vec<(CatalogId, Option<JsonValue>)> {
        let mut rx = self.fetch_batches(ids);
        let mut batches = Vec::new();
        while let Some(batch) = rx.recv().await {
            batches.push(batch);
        }
        batches.sort_by_key(|b| b.seq);
        batches.into_iter().flat_map(|b| b.items).collect()
    }
}

async fn fetch_batch(
    api: &dyn CatalogApi,
    seq: u32,
    ids: Vec<CatalogId>,
    delay: Duration,
    tx: &mpsc::Sender<FetchedBatch>,
) -> Option<FetchedBatch> {
    let mut items = Vec::with_capacity(ids.len());
    let mut failures = Vec::new();
    for (i, id) in ids.into_iter().enumerate() {
        if i > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if tx.is_closed() {
            return None;
        }
        match api.fetch_detail(id).await {
            Ok(payload) => items.push((id, payload)),
            Err(err) => {
                warn!(app_id = %id, error = %err, "detail fetch failed, skipping");
                failures.push(PipelineError::DetailFetchFailed {
                    id,
                    reason: err.to_string(),
                });
                items.push((id, None));
            }
        }
    }
    debug!(batch_seq = seq, failed = failures.len(), "batch fetched");
    Some(FetchedBatch {
        seq,
        items,
        failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use async_trait::async_trait;
    use gcat_adapters::AdapterError;
    use gcat_storage::FetchError;
    use serde_json::json;

    fn ids(range: std::ops::RangeInclusive<u64>) -> Vec<CatalogId> {
        range.map(|r| CatalogId::new(r).unwrap()).collect()
    }

    #[derive(Default)]
    struct CountingApi {
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CatalogApi for CountingApi {
        async fn list_ids(&self) -> Result<Vec<CatalogId>, AdapterError> {
            Ok(Vec::new())
        }

        async fn fetch_detail(&self, id: CatalogId) -> Result<Option<JsonValue>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if id.get() % 5 == 0 {
                return Err(AdapterError::Detail {
                    id,
                    source: FetchError::HttpStatus {
                        status: 404,
                        url: format!("detail/{id}"),
                    },
                });
            }
            Ok(Some(json!({"appid": id.get()})))
        }
    }

    fn plan(batch_size: usize, max_in_flight: usize, delay_ms: u64) -> FetchPlan {
        FetchPlan {
            batch_size,
            max_in_flight,
            call_delay: Duration::from_millis(delay_ms),
        }
    }

    #[tokio::test]
    async fn batches_are_numbered_by_work_set_position_and_cover_every_id() {
        let api = Arc::new(CountingApi::default());
        let fetcher = RateLimitedFetcher::new(api.clone(), plan(3, 2, 0));
        let mut rx = fetcher.fetch_batches(ids(1..=10));

        let mut batches = Vec::new();
        while let Some(batch) = rx.recv().await {
            batches.push(batch);
        }
        batches.sort_by_key(|b| b.seq);

        assert_eq!(batches.iter().map(|b| b.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(batches[0].items.iter().map(|(id, _)| id.get()).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(batches[3].items.len(), 1);
        assert_eq!(api.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn in_flight_batches_are_bounded_by_the_semaphore() {
        let api = Arc::new(CountingApi::default());
        let fetcher = RateLimitedFetcher::new(api.clone(), plan(2, 2, 1));
        let all = fetcher.fetch_details(ids(1..=12)).await;

        assert_eq!(all.len(), 12);
        assert!(api.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn failed_ids_surface_as_none_and_do_not_abort_the_batch() {
        let api = Arc::new(CountingApi::default());
        let fetcher = RateLimitedFetcher::new(api, plan(10, 1, 0));
        let mut rx = fetcher.fetch_batches(ids(1..=6));
        let batch = rx.recv().await.expect("one batch");

        assert_eq!(batch.items.len(), 6);
        assert_eq!(batch.items[4], (CatalogId::new(5).unwrap(), None));
        assert_eq!(batch.fetched(), 5);
        assert!(matches!(
            batch.failures.as_slice(),
            [PipelineError::DetailFetchFailed { id, .. }] if id.get() == 5
        ));
    }

    #[tokio::test]
    async fn calls_within_a_batch_are_spaced_by_the_delay() {
        let api = Arc::new(CountingApi::default());
        let fetcher = RateLimitedFetcher::new(api, plan(4, 1, 20));
        let started = Instant::now();
        let all = fetcher.fetch_details(ids(1..=4)).await;
        assert_eq!(all.len(), 4);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn dropping_the_receiver_stops_further_work() {
        let api = Arc::new(CountingApi::default());
        let fetcher = RateLimitedFetcher::new(api.clone(), plan(1, 1, 10));
        let mut rx = fetcher.fetch_batches(ids(1..=50));
        let first = rx.recv().await.expect("first batch");
        assert_eq!(first.seq, 1);
        drop(rx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(api.calls.load(Ordering::SeqCst) < 50);
    }
}
