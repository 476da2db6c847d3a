//! Run orchestration: fetch sources, the merge/dedup engine, dataset
//! persistence, the downstream trigger, and run configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use stormtrack_advisory::{
    bulletin_text, extract_observed, parse_bulletin, parse_issuance, ExtractError, StormKey,
};
use stormtrack_core::{ActiveStorm, FeedDocument, ForecastTrackRow, ObservedTrackRow};
use stormtrack_storage::{
    record_line, BackoffPolicy, HttpClient, HttpClientConfig, SnapshotStore, Table, TableStore,
    TriggerClient,
};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "stormtrack-sync";

pub const OBSERVED_DATASET: &str = "observed_tracks";
pub const FORECAST_DATASET: &str = "forecasted_tracks";

/// Snapshot name of the feed document in the replay store.
pub const FEED_SNAPSHOT: &str = "feed.json";

pub const DEFAULT_FEED_URL: &str = "https://www.nhc.noaa.gov/CurrentStorms.json";

fn bulletin_snapshot_name(storm_id: &str) -> String {
    format!("bulletin_{storm_id}.txt")
}

/// Runtime configuration, assembled once at startup and passed down; the
/// pipeline itself never reads the environment.
#[derive(Debug, Clone)]
pub struct StormConfig {
    pub feed_url: String,
    pub data_dir: PathBuf,
    pub saved_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub trigger: Option<TriggerConfig>,
}

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub url: String,
    pub token: String,
}

/// Config-file form of [`StormConfig`]; every field optional so a file
/// can override only what it needs to.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StormConfigFile {
    pub feed_url: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub saved_dir: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub trigger_url: Option<String>,
    pub trigger_token: Option<String>,
}

impl StormConfig {
    /// Builds the config from an optional YAML file, with environment
    /// variables taking precedence over the file and defaults below both.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let file = match config_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_yaml::from_str(&text)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => StormConfigFile::default(),
        };
        Ok(Self::from_sources(file, |key| std::env::var(key).ok()))
    }

    /// The env lookup is injected so precedence is testable without
    /// touching the process environment.
    pub fn from_sources(
        file: StormConfigFile,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let feed_url = lookup("STORMTRACK_FEED_URL")
            .or(file.feed_url)
            .unwrap_or_else(|| DEFAULT_FEED_URL.to_string());
        let data_dir = lookup("STORMTRACK_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(|| PathBuf::from("data"));
        let saved_dir = lookup("STORMTRACK_SAVED_DIR")
            .map(PathBuf::from)
            .or(file.saved_dir)
            .unwrap_or_else(|| PathBuf::from("saved_data"));
        let user_agent = lookup("STORMTRACK_USER_AGENT")
            .or(file.user_agent)
            .unwrap_or_else(|| concat!("stormtrack/", env!("CARGO_PKG_VERSION")).to_string());
        let http_timeout_secs = lookup("STORMTRACK_HTTP_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .or(file.http_timeout_secs)
            .unwrap_or(20);
        let trigger_url = lookup("STORMTRACK_TRIGGER_URL").or(file.trigger_url);
        let trigger_token = lookup("STORMTRACK_TRIGGER_TOKEN").or(file.trigger_token);
        let trigger = match (trigger_url, trigger_token) {
            (Some(url), Some(token)) => Some(TriggerConfig { url, token }),
            _ => None,
        };
        Self {
            feed_url,
            data_dir,
            saved_dir,
            user_agent,
            http_timeout_secs,
            trigger,
        }
    }
}

/// How a run obtains its raw documents: live over HTTP (optionally
/// mirroring into the snapshot store) or replayed from an earlier run's
/// snapshots.
#[async_trait]
pub trait FetchSource: Send + Sync {
    async fn fetch(&self, name: &str, url: &str) -> Result<Vec<u8>>;
}

pub struct LiveSource {
    http: HttpClient,
    mirror: Option<SnapshotStore>,
}

impl LiveSource {
    pub fn new(http: HttpClient, mirror: Option<SnapshotStore>) -> Self {
        Self { http, mirror }
    }
}

#[async_trait]
impl FetchSource for LiveSource {
    async fn fetch(&self, name: &str, url: &str) -> Result<Vec<u8>> {
        let body = self
            .http
            .get_bytes(url)
            .await
            .with_context(|| format!("fetching {url}"))?;
        if let Some(store) = &self.mirror {
            store
                .save(name, &body)
                .await
                .with_context(|| format!("mirroring {name}"))?;
        }
        Ok(body)
    }
}

pub struct ReplaySource {
    snapshots: SnapshotStore,
}

impl ReplaySource {
    pub fn new(snapshots: SnapshotStore) -> Self {
        Self { snapshots }
    }
}

#[async_trait]
impl FetchSource for ReplaySource {
    async fn fetch(&self, name: &str, _url: &str) -> Result<Vec<u8>> {
        self.snapshots.load(name).await
    }
}

/// Result of combining a historical table with one run's fresh records.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedTable {
    pub records: Vec<String>,
    pub appended: usize,
    pub duplicates: usize,
}

/// Union of historical and fresh records with exact-duplicate
/// suppression: existing records keep their order, fresh records append
/// in first-seen order, and a fresh record equal to any earlier line is
/// dropped. Suppression is full-line equality only — a near-duplicate one
/// field apart is a new observation and is kept.
pub fn merge_records<'a>(existing: &'a [String], fresh: &'a [String]) -> MergedTable {
    let mut seen: HashSet<&'a str> = existing.iter().map(String::as_str).collect();
    let mut records: Vec<String> = existing.to_vec();
    let mut appended = 0;
    let mut duplicates = 0;
    for record in fresh {
        if !seen.insert(record.as_str()) {
            duplicates += 1;
            continue;
        }
        records.push(record.clone());
        appended += 1;
    }
    MergedTable {
        records,
        appended,
        duplicates,
    }
}

/// Per-dataset persistence outcome carried in the run summary.
#[derive(Debug)]
pub enum DatasetOutcome {
    Persisted {
        dataset: &'static str,
        appended: usize,
        duplicates: usize,
        total: usize,
        backup: PathBuf,
    },
    Failed {
        dataset: &'static str,
        error: anyhow::Error,
    },
}

impl DatasetOutcome {
    pub fn is_persisted(&self) -> bool {
        matches!(self, Self::Persisted { .. })
    }
}

/// What one invocation did, for the final log line and the CLI.
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub active_storms: usize,
    pub observed_rows: usize,
    pub forecast_rows: usize,
    pub skipped_storms: usize,
    pub datasets: Vec<DatasetOutcome>,
    pub triggered: bool,
}

/// One run of the advisory pipeline: fetch feed, extract observed rows,
/// parse each storm's bulletin, merge and persist both datasets, signal
/// the downstream workflow.
pub struct Pipeline {
    config: StormConfig,
    source: Box<dyn FetchSource>,
    tables: TableStore,
    trigger: Option<TriggerClient>,
}

impl Pipeline {
    pub fn new(
        config: StormConfig,
        source: Box<dyn FetchSource>,
        tables: TableStore,
        trigger: Option<TriggerClient>,
    ) -> Self {
        Self {
            config,
            source,
            tables,
            trigger,
        }
    }

    /// Wires the fetch source from the run-mode flags: `save` mirrors
    /// every fetched document into the snapshot store, `use_saved`
    /// replays from it instead of touching the network.
    pub fn from_config(config: StormConfig, save: bool, use_saved: bool) -> Result<Self> {
        let tables = TableStore::new(config.data_dir.clone());
        let snapshots = SnapshotStore::new(config.saved_dir.clone());
        let source: Box<dyn FetchSource> = if use_saved {
            Box::new(ReplaySource::new(snapshots))
        } else {
            let http = HttpClient::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: config.user_agent.clone(),
                backoff: BackoffPolicy::default(),
            })?;
            Box::new(LiveSource::new(http, save.then_some(snapshots)))
        };
        let trigger = match &config.trigger {
            Some(cfg) => Some(TriggerClient::new(
                cfg.url.clone(),
                cfg.token.clone(),
                &config.user_agent,
            )?),
            None => None,
        };
        Ok(Self::new(config, source, tables, trigger))
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, feed = %self.config.feed_url, "starting advisory run");

        let body = self
            .source
            .fetch(FEED_SNAPSHOT, &self.config.feed_url)
            .await
            .context("fetching advisory feed")?;
        let feed: FeedDocument =
            serde_json::from_slice(&body).context("decoding advisory feed")?;

        if feed.active_storms.is_empty() {
            info!(%run_id, "no active storms right now; nothing to persist");
            return Ok(RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                active_storms: 0,
                observed_rows: 0,
                forecast_rows: 0,
                skipped_storms: 0,
                datasets: Vec::new(),
                triggered: false,
            });
        }

        let mut observed: Vec<ObservedTrackRow> = Vec::new();
        let mut forecast: Vec<ForecastTrackRow> = Vec::new();
        let mut skipped: HashSet<String> = HashSet::new();

        for storm in &feed.active_storms {
            match extract_observed(storm) {
                Ok(row) => observed.push(row),
                Err(err) => {
                    warn!(storm = %storm.id, error = %err, "skipping observed row");
                    skipped.insert(storm.id.clone());
                }
            }
        }

        for storm in &feed.active_storms {
            match self.forecast_rows_for(storm).await {
                Ok(rows) => {
                    info!(storm = %storm.id, points = rows.len(), "parsed forecast bulletin");
                    forecast.extend(rows);
                }
                Err(err) => {
                    warn!(storm = %storm.id, error = %err, "skipping forecast bulletin");
                    skipped.insert(storm.id.clone());
                }
            }
        }

        let observed_records: Vec<String> =
            observed.iter().map(|r| record_line(&r.to_record())).collect();
        let forecast_records: Vec<String> =
            forecast.iter().map(|r| record_line(&r.to_record())).collect();

        let datasets = vec![
            self.persist_dataset(
                OBSERVED_DATASET,
                &ObservedTrackRow::HEADER,
                &observed_records,
                started_at,
            )
            .await,
            self.persist_dataset(
                FORECAST_DATASET,
                &ForecastTrackRow::HEADER,
                &forecast_records,
                started_at,
            )
            .await,
        ];

        let mut triggered = false;
        if datasets.iter().any(DatasetOutcome::is_persisted) {
            if let Some(trigger) = &self.trigger {
                match trigger.dispatch("active-storms").await {
                    Ok(()) => triggered = true,
                    Err(err) => warn!(error = %err, "downstream trigger failed"),
                }
            }
        } else {
            warn!("no dataset persisted; skipping downstream trigger");
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            active_storms: feed.active_storms.len(),
            observed_rows: observed.len(),
            forecast_rows: forecast.len(),
            skipped_storms: skipped.len(),
            datasets,
            triggered,
        };
        info!(
            %run_id,
            storms = summary.active_storms,
            observed = summary.observed_rows,
            forecast = summary.forecast_rows,
            skipped = summary.skipped_storms,
            triggered = summary.triggered,
            "run complete"
        );
        Ok(summary)
    }

    async fn forecast_rows_for(&self, storm: &ActiveStorm) -> Result<Vec<ForecastTrackRow>> {
        let advisory = storm
            .forecast_advisory
            .as_ref()
            .ok_or(ExtractError::MissingField("forecastAdvisory"))?;
        let issuance = parse_issuance(&advisory.issuance)?;
        let key = StormKey {
            id: storm.id.clone(),
            name: storm.name.clone(),
            issuance,
        };
        let body = self
            .source
            .fetch(&bulletin_snapshot_name(&storm.id), &advisory.url)
            .await?;
        let text = bulletin_text(&String::from_utf8_lossy(&body));
        Ok(parse_bulletin(&text, &key)?)
    }

    async fn persist_dataset(
        &self,
        dataset: &'static str,
        header: &[&str],
        fresh: &[String],
        run_started: DateTime<Utc>,
    ) -> DatasetOutcome {
        match self.try_persist(dataset, header, fresh, run_started).await {
            Ok(outcome) => outcome,
            Err(error) => {
                error!(dataset, error = %error, "dataset persistence failed");
                DatasetOutcome::Failed { dataset, error }
            }
        }
    }

    async fn try_persist(
        &self,
        dataset: &'static str,
        header: &[&str],
        fresh: &[String],
        run_started: DateTime<Utc>,
    ) -> Result<DatasetOutcome> {
        let previous = self.tables.load_table(dataset).await?;
        let backup = self
            .tables
            .save_backup(dataset, run_started, &previous)
            .await?;

        let expected_header = record_line(header);
        if !previous.header.is_empty() && previous.header != expected_header {
            warn!(dataset, "historical table header differs from current schema");
        }

        let merged = merge_records(&previous.records, fresh);
        let table = Table {
            header: expected_header,
            records: merged.records,
        };
        self.tables.save_table(dataset, &table).await?;
        info!(
            dataset,
            appended = merged.appended,
            duplicates = merged.duplicates,
            total = table.records.len(),
            "dataset persisted"
        );
        Ok(DatasetOutcome::Persisted {
            dataset,
            appended: merged.appended,
            duplicates: merged.duplicates,
            total: table.records.len(),
            backup,
        })
    }
}
