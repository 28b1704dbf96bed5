//! Ingestion pipeline orchestration: list, validate, select, fetch, stage, merge.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use gcat_adapters::{list_all_ids, transform, CatalogApi, SteamSpyApi};
use gcat_storage::{FsObjectStore, HttpFetcher, ObjectStore, StagingLayout};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod batch;
pub mod config;
pub mod error;
pub mod export;
pub mod fetcher;
pub mod merge;
pub mod selection;
pub mod warehouse;

pub use batch::{read_staged_blobs, BatchWriter, FlushedBatch, StagedBlob};
pub use config::{IngestTuning, PipelineConfig};
pub use error::PipelineError;
pub use export::{export_versions_parquet, ExportManifest};
pub use fetcher::{FetchPlan, FetchedBatch, RateLimitedFetcher};
pub use merge::{merge, plan_merge, MergeSummary};
pub use selection::{estimate_yield, scale_candidates, select_work_set, WorkSet};
pub use warehouse::{MemoryWarehouse, PgWarehouse, StagingStore, VersionedStore};

pub const CRATE_NAME: &str = "gcat-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Fetch deadline passed; whatever was flushed was still merged.
    Partial,
    /// Validation sample found nothing usable; nothing fetched or merged.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParams {
    pub run_date: NaiveDate,
    pub is_initial_load: bool,
    pub max_apps: Option<usize>,
}

impl RunParams {
    pub fn daily(run_date: NaiveDate) -> Self {
        Self {
            run_date,
            is_initial_load: false,
            max_apps: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub is_initial_load: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub listed_ids: usize,
    pub candidate_ids: usize,
    pub work_set: usize,
    pub rechecks: usize,
    pub fetched: usize,
    pub failed: usize,
    pub staged_batches: usize,
    pub staged_records: usize,
    pub merge: MergeSummary,
    /// Blobs flushed by this run with their content hashes.
    pub staged_blobs: Vec<FlushedBatch>,
}

impl RunSummary {
    fn started(run_id: Uuid, params: &RunParams) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            run_date: params.run_date,
            is_initial_load: params.is_initial_load,
            started_at: now,
            finished_at: now,
            outcome: RunOutcome::Completed,
            listed_ids: 0,
            candidate_ids: 0,
            work_set: 0,
            rechecks: 0,
            fetched: 0,
            failed: 0,
            staged_batches: 0,
            staged_records: 0,
            merge: MergeSummary::default(),
            staged_blobs: Vec::new(),
        }
    }
}

pub struct IngestPipeline {
    tuning: IngestTuning,
    layout: StagingLayout,
    api: Arc<dyn CatalogApi>,
    objects: Arc<dyn ObjectStore>,
    staging: Arc<dyn StagingStore>,
    versions: Arc<dyn VersionedStore>,
    merge_lock: Mutex<()>,
}

impl IngestPipeline {
    pub fn new(
        tuning: IngestTuning,
        layout: StagingLayout,
        api: Arc<dyn CatalogApi>,
        objects: Arc<dyn ObjectStore>,
        staging: Arc<dyn StagingStore>,
        versions: Arc<dyn VersionedStore>,
    ) -> Self {
        Self {
            tuning,
            layout,
            api,
            objects,
            staging,
            versions,
            merge_lock: Mutex::new(()),
        }
    }

    /// SteamSpy over HTTP, filesystem staging, and Postgres when
    /// `DATABASE_URL` is set or the JSON snapshot warehouse otherwise.
    pub async fn from_config(config: &PipelineConfig) -> anyhow::Result<Self> {
        config.tuning.validate().context("validating tuning")?;
        let http = HttpFetcher::new(config.http_config()).context("building http client")?;
        let api: Arc<dyn CatalogApi> = Arc::new(SteamSpyApi::new(http, config.endpoints()));
        let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.staging_dir()));

        let (staging, versions) = match &config.database_url {
            Some(url) => {
                let pg = Arc::new(
                    PgWarehouse::connect(url)
                        .await
                        .context("connecting to warehouse database")?,
                );
                let staging: Arc<dyn StagingStore> = pg.clone();
                let versions: Arc<dyn VersionedStore> = pg;
                (staging, versions)
            }
            None => {
                let path = config.warehouse_snapshot_path();
                let memory = Arc::new(
                    MemoryWarehouse::open(&path)
                        .await
                        .with_context(|| format!("opening {}", path.display()))?,
                );
                let staging: Arc<dyn StagingStore> = memory.clone();
                let versions: Arc<dyn VersionedStore> = memory;
                (staging, versions)
            }
        };

        Ok(Self::new(
            config.tuning.clone(),
            config.layout(),
            api,
            objects,
            staging,
            versions,
        ))
    }

    pub fn versions(&self) -> Arc<dyn VersionedStore> {
        Arc::clone(&self.versions)
    }

    pub async fn run(&self, params: RunParams) -> Result<RunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "ingest_run",
            %run_id,
            run_date = %params.run_date,
            initial = params.is_initial_load
        );
        self.run_inner(run_id, params).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, params: RunParams) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::started(run_id, &params);
        let run_date = params.run_date;

        let listed = list_all_ids(self.api.as_ref())
            .await
            .map_err(PipelineError::UpstreamUnavailable)?;
        summary.listed_ids = listed.len();

        let fraction = estimate_yield(
            self.api.as_ref(),
            &listed,
            self.tuning.sample_size,
            self.tuning.validation_concurrency,
        )
        .await;
        let candidates = match scale_candidates(&listed, fraction, self.tuning.safety_margin) {
            Ok(candidates) => candidates,
            Err(PipelineError::ValidationSampleEmpty) => {
                warn!(listed = listed.len(), fraction, "no usable ids in validation sample, skipping run");
                summary.outcome = RunOutcome::Skipped;
                return self.finish(summary).await;
            }
            Err(err) => return Err(err),
        };
        summary.candidate_ids = candidates.len();

        let seen = if params.is_initial_load {
            HashSet::new()
        } else {
            self.versions.seen_ids().await?
        };
        let mut rng = match self.tuning.selection_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let work = select_work_set(
            &candidates,
            &seen,
            params.is_initial_load,
            params.max_apps,
            self.tuning.resample_fraction,
            &mut rng,
        );
        summary.work_set = work.len();
        summary.rechecks = work.rechecks;

        let mut writer =
            BatchWriter::open(Arc::clone(&self.objects), self.layout.clone(), run_date).await?;
        let fetcher = RateLimitedFetcher::new(Arc::clone(&self.api), FetchPlan::from_tuning(&self.tuning));
        let mut batches = fetcher.fetch_batches(work.ids);
        let deadline = self
            .tuning
            .fetch_deadline()
            .map(|limit| tokio::time::Instant::now() + limit);

        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, batches.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!("fetch deadline passed, merging what was flushed");
                        summary.outcome = RunOutcome::Partial;
                        break;
                    }
                },
                None => batches.recv().await,
            };
            let Some(batch) = next else {
                break;
            };
            summary.failed += batch.failures.len();
            for (id, payload) in batch.items {
                let Some(payload) = payload else {
                    continue;
                };
                if writer.push(transform(id, &payload, run_date)) {
                    summary.fetched += 1;
                }
            }
            writer.flush(batch.seq).await?;
        }
        drop(batches);

        let blobs = read_staged_blobs(self.objects.as_ref(), &self.layout, run_date).await?;
        for blob in &blobs {
            self.staging
                .load_blob(run_date, blob.seq, &blob.path, &blob.records)
                .await?;
        }
        let staged = self.staging.staged_batch(run_date).await?;
        summary.staged_records = staged.len();
        summary.staged_blobs = writer.into_flushed();
        summary.staged_batches = summary.staged_blobs.len();

        {
            let _merging = self.merge_lock.lock().await;
            summary.merge = merge(&staged, self.versions.as_ref(), run_date).await?;
        }
        let pruned = self.staging.prune_before(run_date).await?;
        if pruned > 0 {
            info!(pruned, "dropped staging rows of earlier load dates");
        }

        self.finish(summary).await
    }

    async fn finish(&self, mut summary: RunSummary) -> Result<RunSummary, PipelineError> {
        summary.finished_at = Utc::now();
        let path = self.layout.run_summary_path(summary.run_date, summary.run_id);
        let bytes = serde_json::to_vec_pretty(&summary).map_err(|err| PipelineError::StagingWriteFailed {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        self.objects
            .put(&path, bytes)
            .await
            .map_err(|err| PipelineError::StagingWriteFailed {
                path: path.clone(),
                reason: err.to_string(),
            })?;
        info!(
            outcome = ?summary.outcome,
            work_set = summary.work_set,
            fetched = summary.fetched,
            failed = summary.failed,
            inserted = summary.merge.inserted,
            superseded = summary.merge.superseded,
            summary_path = %path,
            "ingest run finished"
        );
        Ok(summary)
    }
}

/// Daily trigger for the pipeline, built only when the scheduler is enabled.
pub async fn maybe_build_scheduler(
    pipeline: Arc<IngestPipeline>,
    config: &PipelineConfig,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &config.sync_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            let params = RunParams::daily(Utc::now().date_naive());
            match pipeline.run(params).await {
                Ok(summary) => info!(run_id = %summary.run_id, outcome = ?summary.outcome, "scheduled run finished"),
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_once_from_env(params: RunParams) -> anyhow::Result<RunSummary> {
    let config = PipelineConfig::from_env()?;
    let pipeline = IngestPipeline::from_config(&config).await?;
    pipeline.run(params).await.context("ingest run failed")
}
