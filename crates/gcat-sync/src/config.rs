use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use gcat_adapters::SteamSpyEndpoints;
use gcat_storage::{BackoffPolicy, HttpClientConfig, StagingLayout};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Knobs for sampling, batching and retry. Every field has a default so a
/// tuning file only needs the values it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestTuning {
    pub sample_size: usize,
    pub validation_concurrency: usize,
    pub safety_margin: f64,
    pub resample_fraction: f64,
    pub batch_size: usize,
    pub max_in_flight_batches: usize,
    pub call_delay_ms: u64,
    pub max_retries: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub listing_timeout_secs: u64,
    pub detail_timeout_secs: u64,
    pub fetch_deadline_secs: Option<u64>,
    pub selection_seed: Option<u64>,
}

impl Default for IngestTuning {
    fn default() -> Self {
        Self {
            sample_size: 100,
            validation_concurrency: 3,
            safety_margin: 1.5,
            resample_fraction: 0.01,
            batch_size: 200,
            max_in_flight_batches: 3,
            call_delay_ms: 2_000,
            max_retries: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 120_000,
            listing_timeout_secs: 20,
            detail_timeout_secs: 10,
            fetch_deadline_secs: None,
            selection_seed: None,
        }
    }
}

impl IngestTuning {
    pub fn from_yaml_str(text: &str) -> Result<Self, PipelineError> {
        let tuning: Self =
            serde_yaml::from_str(text).map_err(|err| PipelineError::Config(err.to_string()))?;
        tuning.validate()?;
        Ok(tuning)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |msg: &str| Err(PipelineError::Config(msg.to_string()));
        if self.batch_size == 0 {
            return fail("batch_size must be at least 1");
        }
        if self.max_in_flight_batches == 0 || self.validation_concurrency == 0 {
            return fail("concurrency limits must be at least 1");
        }
        if !(self.safety_margin.is_finite() && self.safety_margin >= 1.0) {
            return fail("safety_margin must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.resample_fraction) {
            return fail("resample_fraction must be within [0, 1]");
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return fail("backoff_base_ms must not exceed backoff_max_ms");
        }
        Ok(())
    }

    pub fn call_delay(&self) -> Duration {
        Duration::from_millis(self.call_delay_ms)
    }

    pub fn fetch_deadline(&self) -> Option<Duration> {
        self.fetch_deadline_secs.map(Duration::from_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

/// Process-wide configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub database_url: Option<String>,
    pub listing_url: String,
    pub detail_url: String,
    pub user_agent: String,
    pub dataset: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub tuning: IngestTuning,
}

impl PipelineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = SteamSpyEndpoints::default();
        let tuning = match lookup("GCAT_TUNING") {
            Some(path) => IngestTuning::load(Path::new(&path))?,
            None => IngestTuning::default(),
        };
        Ok(Self {
            data_dir: lookup("GCAT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            listing_url: lookup("GCAT_LISTING_URL").unwrap_or(defaults.listing_url),
            detail_url: lookup("GCAT_DETAIL_URL").unwrap_or(defaults.detail_url),
            user_agent: lookup("GCAT_USER_AGENT").unwrap_or_else(|| "gcat-bot/0.1".to_string()),
            dataset: lookup("GCAT_DATASET").unwrap_or_else(|| "steam_games".to_string()),
            scheduler_enabled: lookup("GCAT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: lookup("GCAT_SYNC_CRON").unwrap_or_else(|| "0 0 3 * * *".to_string()),
            tuning,
        })
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    pub fn warehouse_snapshot_path(&self) -> PathBuf {
        self.data_dir.join("warehouse.json")
    }

    pub fn layout(&self) -> StagingLayout {
        StagingLayout::new(self.dataset.clone())
    }

    pub fn endpoints(&self) -> SteamSpyEndpoints {
        SteamSpyEndpoints {
            listing_url: self.listing_url.clone(),
            detail_url: self.detail_url.clone(),
            listing_timeout: Duration::from_secs(self.tuning.listing_timeout_secs),
            detail_timeout: Duration::from_secs(self.tuning.detail_timeout_secs),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(
                self.tuning
                    .listing_timeout_secs
                    .max(self.tuning.detail_timeout_secs),
            ),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self
                .tuning
                .max_in_flight_batches
                .max(self.tuning.validation_concurrency),
            backoff: self.tuning.backoff(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_the_documented_heuristics() {
        let tuning = IngestTuning::default();
        assert_eq!(tuning.safety_margin, 1.5);
        assert_eq!(tuning.resample_fraction, 0.01);
        assert_eq!(tuning.batch_size, 200);
        assert_eq!(tuning.max_in_flight_batches, 3);
        assert_eq!(tuning.call_delay(), Duration::from_secs(2));
        assert!(tuning.validate().is_ok());
    }

    #[test]
    fn yaml_overrides_only_named_fields() {
        let tuning = IngestTuning::from_yaml_str("resample_fraction: 0.05\nbatch_size: 50\n")
            .expect("valid tuning");
        assert_eq!(tuning.resample_fraction, 0.05);
        assert_eq!(tuning.batch_size, 50);
        assert_eq!(tuning.safety_margin, 1.5);
    }

    #[test]
    fn nonsensical_tuning_is_rejected() {
        assert!(IngestTuning::from_yaml_str("batch_size: 0").is_err());
        assert!(IngestTuning::from_yaml_str("safety_margin: 0.5").is_err());
        assert!(IngestTuning::from_yaml_str("resample_fraction: 2.0").is_err());
        assert!(IngestTuning::from_yaml_str("sample_size: [1]").is_err());
    }

    #[test]
    fn config_reads_lookup_with_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("GCAT_DATA_DIR", "/tmp/gcat"),
            ("GCAT_SCHEDULER_ENABLED", "true"),
            ("DATABASE_URL", ""),
        ]);
        let config =
            PipelineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).expect("config");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/gcat"));
        assert!(config.scheduler_enabled);
        assert!(config.database_url.is_none());
        assert_eq!(config.dataset, "steam_games");
        assert_eq!(config.staging_dir(), PathBuf::from("/tmp/gcat/staging"));
        assert_eq!(config.endpoints().detail_timeout, Duration::from_secs(10));
    }
}
