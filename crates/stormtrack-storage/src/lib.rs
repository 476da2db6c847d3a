//! Side-effecting collaborators: HTTP fetch with retry, the raw-fetch
//! snapshot store backing replay runs, and the semicolon-delimited
//! historical table store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "stormtrack-storage";

/// Field separator of the persisted tables.
pub const DELIMITER: &str = ";";

/// Joins record fields into one persisted table line.
pub fn record_line<S: AsRef<str>>(fields: &[S]) -> String {
    fields
        .iter()
        .map(|f| f.as_ref())
        .collect::<Vec<_>>()
        .join(DELIMITER)
}

/// Network or terminal HTTP failure fetching one resource.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: concat!("stormtrack/", env!("CARGO_PKG_VERSION")).to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// GET client used for the feed and the bulletin bodies. Retries
/// transient failures (5xx, 429, transport errors) with exponential
/// backoff; everything else is terminal.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    if retryable_status(status) && attempt < self.backoff.max_retries {
                        debug!(url, status = status.as_u16(), attempt, "retrying fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if retryable_error(&err) && attempt < self.backoff.max_retries {
                        debug!(url, attempt, "retrying fetch after transport error");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop records the last transport error"),
        ))
    }
}

/// Fire-and-forget notifier for the downstream workflow that consumes the
/// historical tables.
#[derive(Debug)]
pub struct TriggerClient {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl TriggerClient {
    pub fn new(url: String, token: String, user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.to_string())
            .build()
            .context("building trigger client")?;
        Ok(Self { client, url, token })
    }

    /// Dispatches the event to the configured workflow endpoint. The
    /// caller decides whether a failure is worth more than a log line.
    pub async fn dispatch(&self, event: &str) -> Result<(), FetchError> {
        let resp = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json")
            .header(reqwest::header::AUTHORIZATION, self.token.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(r#"{"ref":"main"}"#)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }
        debug!(event, status = status.as_u16(), "dispatched downstream trigger");
        Ok(())
    }
}

/// Outcome of persisting one raw fetch body.
#[derive(Debug, Clone)]
pub struct SavedSnapshot {
    pub path: PathBuf,
    pub sha256: String,
    pub unchanged: bool,
}

/// Directory of raw fetch bodies keyed by logical name (`feed.json`,
/// `bulletin_<stormid>.txt`), used by the save/replay run modes.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Stores a fetch body under its logical name. A snapshot whose
    /// content hash already matches is left untouched and reported as
    /// unchanged — the feed updates far less often than the scheduler
    /// fires.
    pub async fn save(&self, name: &str, bytes: &[u8]) -> anyhow::Result<SavedSnapshot> {
        let path = self.path_for(name);
        let sha256 = Self::sha256_hex(bytes);
        if let Ok(existing) = fs::read(&path).await {
            if Self::sha256_hex(&existing) == sha256 {
                debug!(name, "snapshot content unchanged");
                return Ok(SavedSnapshot {
                    path,
                    sha256,
                    unchanged: true,
                });
            }
        }
        write_atomic(&path, bytes).await?;
        Ok(SavedSnapshot {
            path,
            sha256,
            unchanged: false,
        })
    }

    pub async fn load(&self, name: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.path_for(name);
        fs::read(&path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))
    }
}

/// In-memory form of one historical table: the header line plus the raw
/// record lines, kept as text so merge equality is exactly byte equality.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub header: String,
    pub records: Vec<String>,
}

impl Table {
    pub fn parse(text: &str) -> Self {
        let mut lines = text.lines();
        let header = lines.next().unwrap_or_default().to_string();
        let records = lines
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();
        Self { header, records }
    }

    pub fn render(&self) -> String {
        if self.header.is_empty() && self.records.is_empty() {
            return String::new();
        }
        let mut out = String::new();
        out.push_str(&self.header);
        out.push('\n');
        for record in &self.records {
            out.push_str(record);
            out.push('\n');
        }
        out
    }
}

/// Historical-table persistence rooted at the data directory. Tables live
/// at `<dataset>.csv`; pre-merge backups at
/// `previous/YYYYMMDD_HHMMSS/<dataset>.csv`.
#[derive(Debug, Clone)]
pub struct TableStore {
    root: PathBuf,
}

impl TableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_path(&self, dataset: &str) -> PathBuf {
        self.root.join(format!("{dataset}.csv"))
    }

    fn backup_path(&self, dataset: &str, run_started: DateTime<Utc>) -> PathBuf {
        let stamp = run_started.format("%Y%m%d_%H%M%S").to_string();
        self.root
            .join("previous")
            .join(stamp)
            .join(format!("{dataset}.csv"))
    }

    /// Loads a historical table; a dataset with no file yet is empty.
    pub async fn load_table(&self, dataset: &str) -> anyhow::Result<Table> {
        let path = self.table_path(dataset);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Table::default())
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading table {}", path.display()))
            }
        };
        Ok(Table::parse(&text))
    }

    pub async fn save_table(&self, dataset: &str, table: &Table) -> anyhow::Result<PathBuf> {
        let path = self.table_path(dataset);
        write_atomic(&path, table.render().as_bytes())
            .await
            .with_context(|| format!("saving table {dataset}"))?;
        Ok(path)
    }

    /// Writes the pre-merge state of a dataset under the run's timestamp.
    pub async fn save_backup(
        &self,
        dataset: &str,
        run_started: DateTime<Utc>,
        table: &Table,
    ) -> anyhow::Result<PathBuf> {
        let path = self.backup_path(dataset, run_started);
        write_atomic(&path, table.render().as_bytes())
            .await
            .with_context(|| format!("saving backup for {dataset}"))?;
        Ok(path)
    }
}

/// Writes bytes via a temp file in the target directory plus atomic
/// rename, creating parent directories as needed.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("target path {} has no parent", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "renaming temp file {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}
