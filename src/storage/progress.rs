//! Resumable per-task progress.
//!
//! One JSON document per task under `<data_dir>/progress/<task_id>.json`.
//! The in-memory state is guarded by a single async mutex; every mutation
//! happens under it, and persistence writes a snapshot taken under it.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::crawler::origin::OriginKey;

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    InProgress,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn is_resumable(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Persisted record of one task. Unknown fields in the file are ignored so
/// the document can be edited by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressState {
    pub task_id: String,
    #[serde(default)]
    pub start_url: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_status")]
    pub status: TaskStatus,

    #[serde(default)]
    pub total_urls: usize,
    #[serde(default)]
    pub completed_urls: usize,
    #[serde(default)]
    pub failed_urls: usize,
    #[serde(default)]
    pub current_page: u32,

    #[serde(default, alias = "worklist")]
    pub urls_to_scrape: Vec<String>,
    #[serde(default)]
    pub completed_url_list: Vec<String>,
    #[serde(default)]
    pub failed_url_list: Vec<String>,

    #[serde(default)]
    pub scraped_data: Vec<Value>,

    #[serde(default)]
    pub last_url: Option<String>,
    #[serde(default)]
    pub next_url: Option<String>,
    #[serde(default)]
    pub pagination_type: Option<String>,

    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub notes: String,
}

fn default_status() -> TaskStatus {
    TaskStatus::InProgress
}

fn default_max_retries() -> u32 {
    3
}

impl ProgressState {
    pub fn new(task_id: &str, start_url: &str) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.to_string(),
            start_url: start_url.to_string(),
            created_at: now,
            updated_at: now,
            status: TaskStatus::InProgress,
            total_urls: 0,
            completed_urls: 0,
            failed_urls: 0,
            current_page: 0,
            urls_to_scrape: Vec::new(),
            completed_url_list: Vec::new(),
            failed_url_list: Vec::new(),
            scraped_data: Vec::new(),
            last_url: None,
            next_url: None,
            pagination_type: None,
            last_error: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            config: Value::Null,
            notes: String::new(),
        }
    }
}

/// Derive a task id: explicit id, else `<host>_<hash8>` of the start URL,
/// else a timestamp.
pub fn task_identity(task_id: Option<&str>, start_url: Option<&str>) -> String {
    if let Some(id) = task_id.map(str::trim).filter(|id| !id.is_empty()) {
        return id.to_string();
    }

    if let Some(url) = start_url.filter(|u| !u.trim().is_empty()) {
        let digest = Sha256::digest(url.as_bytes());
        let hash = &hex::encode(digest)[..8];
        let host = OriginKey::parse(url)
            .map(|o| o.host().replace(['.', ':'], "_"))
            .unwrap_or_else(|_| "task".to_string());
        return format!("{}_{}", host, hash);
    }

    format!("scrape_{}", Local::now().format("%Y%m%d_%H%M%S"))
}

/// Short view of a task for listings
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSummary {
    pub task_id: String,
    pub status: TaskStatus,
    pub start_url: String,
    pub total_urls: usize,
    pub completed_urls: usize,
    pub failed_urls: usize,
    pub percent: f64,
    pub current_page: u32,
    pub last_url: Option<String>,
    pub next_url: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub file: Option<PathBuf>,
}

impl From<&ProgressState> for ProgressSummary {
    fn from(state: &ProgressState) -> Self {
        let percent = if state.total_urls > 0 {
            (state.completed_urls as f64 / state.total_urls as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };
        Self {
            task_id: state.task_id.clone(),
            status: state.status,
            start_url: state.start_url.clone(),
            total_urls: state.total_urls,
            completed_urls: state.completed_urls,
            failed_urls: state.failed_urls,
            percent,
            current_page: state.current_page,
            last_url: state.last_url.clone(),
            next_url: state.next_url.clone(),
            updated_at: state.updated_at,
            file: None,
        }
    }
}

/// Export formats for scraped data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    JsonLines,
}

#[derive(Debug)]
struct Inner {
    state: ProgressState,
    completed: HashSet<String>,
    failed: HashSet<String>,
    pending_writes: usize,
}

impl Inner {
    fn from_state(mut state: ProgressState) -> Self {
        let completed: HashSet<String> = state.completed_url_list.iter().cloned().collect();

        // Completed wins when an edited file lists a URL in both
        let before = state.failed_url_list.len();
        state.failed_url_list.retain(|url| !completed.contains(url));
        state.failed_urls = state
            .failed_urls
            .saturating_sub(before - state.failed_url_list.len());

        let failed = state.failed_url_list.iter().cloned().collect();
        Self {
            state,
            completed,
            failed,
            pending_writes: 0,
        }
    }
}

/// Owner of one task's [`ProgressState`]
#[derive(Debug)]
pub struct ProgressStore {
    task_id: String,
    path: PathBuf,
    save_interval: usize,
    inner: Mutex<Inner>,
}

pub fn progress_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("progress")
}

impl ProgressStore {
    /// Load the task's record if it exists, otherwise start a fresh one.
    ///
    /// `save_interval` batches writes: the file is rewritten every N
    /// mutations. Lifecycle transitions always write immediately.
    pub async fn open(
        data_dir: &Path,
        task_id: Option<&str>,
        start_url: Option<&str>,
        save_interval: usize,
    ) -> Result<Self> {
        let task_id = task_identity(task_id, start_url);
        let dir = progress_dir(data_dir);
        fs::create_dir_all(&dir)
            .await
            .context(format!("Failed to create progress directory: {}", dir.display()))?;
        let path = dir.join(format!("{}.json", task_id));

        let state = if fs::try_exists(&path).await.unwrap_or(false) {
            match load_state(&path).await {
                Ok(state) => {
                    info!(
                        task_id = %task_id,
                        status = %state.status,
                        "Loaded progress: {}/{} completed",
                        state.completed_urls,
                        state.total_urls
                    );
                    state
                }
                Err(e) => {
                    warn!("Error loading progress {}: {:#}", path.display(), e);
                    ProgressState::new(&task_id, start_url.unwrap_or_default())
                }
            }
        } else {
            info!(task_id = %task_id, "New progress file");
            ProgressState::new(&task_id, start_url.unwrap_or_default())
        };

        Ok(Self {
            task_id,
            path,
            save_interval: save_interval.max(1),
            inner: Mutex::new(Inner::from_state(state)),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> ProgressState {
        self.inner.lock().await.state.clone()
    }

    pub async fn status(&self) -> TaskStatus {
        self.inner.lock().await.state.status
    }

    pub async fn summary(&self) -> ProgressSummary {
        let inner = self.inner.lock().await;
        let mut summary = ProgressSummary::from(&inner.state);
        summary.file = Some(self.path.clone());
        summary
    }

    /// Whether any work has been recorded yet
    pub async fn has_progress(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.state.completed_urls > 0
            || inner.state.current_page > 0
            || !inner.state.scraped_data.is_empty()
    }

    pub async fn is_completed(&self, url: &str) -> bool {
        self.inner.lock().await.completed.contains(url)
    }

    pub async fn is_failed(&self, url: &str) -> bool {
        self.inner.lock().await.failed.contains(url)
    }

    /// Replace the worklist
    pub async fn set_urls(&self, urls: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.state.urls_to_scrape = urls.to_vec();
        inner.state.total_urls = urls.len();
        if inner.state.start_url.is_empty() {
            inner.state.start_url = urls.first().cloned().unwrap_or_default();
        }
        self.maybe_save(&mut inner).await
    }

    /// Append URLs not already in the worklist
    pub async fn add_urls(&self, urls: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut known: HashSet<String> = inner.state.urls_to_scrape.iter().cloned().collect();
        for url in urls {
            if known.insert(url.clone()) {
                inner.state.urls_to_scrape.push(url.clone());
            }
        }
        inner.state.total_urls = inner.state.urls_to_scrape.len();
        self.maybe_save(&mut inner).await
    }

    /// Worklist minus completed and failed URLs, in worklist order
    pub async fn remaining(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .state
            .urls_to_scrape
            .iter()
            .filter(|url| !inner.completed.contains(*url) && !inner.failed.contains(*url))
            .cloned()
            .collect()
    }

    /// Record a success. Completing the same URL twice leaves one entry.
    pub async fn mark_completed(&self, url: &str, data: Option<Value>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.completed.insert(url.to_string()) {
            debug!(url, "Already completed, ignoring duplicate");
            return Ok(());
        }

        // A later success clears an earlier failure
        if inner.failed.remove(url) {
            inner.state.failed_url_list.retain(|u| u != url);
            inner.state.failed_urls = inner.state.failed_urls.saturating_sub(1);
        }

        inner.state.completed_url_list.push(url.to_string());
        inner.state.completed_urls += 1;
        inner.state.last_url = Some(url.to_string());
        inner.state.retry_count = 0;

        if let Some(data) = data {
            let record = match data {
                Value::Object(mut map) => {
                    map.insert("_scraped_at".to_string(), Value::String(Utc::now().to_rfc3339()));
                    map.insert("_url".to_string(), Value::String(url.to_string()));
                    Value::Object(map)
                }
                other => serde_json::json!({
                    "value": other,
                    "_scraped_at": Utc::now().to_rfc3339(),
                    "_url": url,
                }),
            };
            inner.state.scraped_data.push(record);
        }

        self.maybe_save(&mut inner).await
    }

    /// Record a failure. The URL stays in the worklist but is excluded from
    /// [`ProgressStore::remaining`]. A URL already completed stays completed.
    pub async fn mark_failed(&self, url: &str, error: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.completed.contains(url) {
            debug!(url, "Already completed, not marking failed");
        } else if inner.failed.insert(url.to_string()) {
            inner.state.failed_url_list.push(url.to_string());
            inner.state.failed_urls += 1;
        }
        inner.state.last_error = Some(error.to_string());
        inner.state.retry_count += 1;
        self.maybe_save(&mut inner).await
    }

    pub async fn set_current_page(&self, page: u32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.state.current_page = page;
        self.maybe_save(&mut inner).await
    }

    pub async fn set_next_url(&self, url: Option<String>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.state.next_url = url;
        self.maybe_save(&mut inner).await
    }

    pub async fn set_pagination_type(&self, pagination_type: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.state.pagination_type = Some(pagination_type.to_string());
        self.maybe_save(&mut inner).await
    }

    pub async fn set_config(&self, config: Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.state.config = config;
        self.maybe_save(&mut inner).await
    }

    pub async fn add_note(&self, note: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        push_note(&mut inner.state, note);
        self.maybe_save(&mut inner).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.transition(TaskStatus::Paused, "Task paused", None).await?;
        info!(task_id = %self.task_id, "Task paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.transition(TaskStatus::InProgress, "Task resumed", None).await?;
        info!(task_id = %self.task_id, "Task resumed");
        Ok(())
    }

    /// Close the task with a final status
    pub async fn finish(&self, status: TaskStatus) -> Result<()> {
        self.transition(status, &format!("Task {}", status), None).await?;
        info!(task_id = %self.task_id, status = %status, "Task finished");
        Ok(())
    }

    pub async fn fail(&self, error: &str) -> Result<()> {
        self.transition(TaskStatus::Failed, &format!("Task failed: {}", error), Some(error))
            .await?;
        warn!(task_id = %self.task_id, "Task failed: {}", error);
        Ok(())
    }

    async fn transition(&self, status: TaskStatus, note: &str, error: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.state.status = status;
        if let Some(error) = error {
            inner.state.last_error = Some(error.to_string());
        }
        push_note(&mut inner.state, note);
        self.save_locked(&mut inner).await
    }

    /// Start over, keeping the id, start URL and stored config
    pub async fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut fresh = ProgressState::new(&self.task_id, &inner.state.start_url);
        fresh.config = inner.state.config.clone();
        *inner = Inner::from_state(fresh);
        self.save_locked(&mut inner).await?;
        info!(task_id = %self.task_id, "Progress reset");
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        if fs::try_exists(&self.path).await.unwrap_or(false) {
            fs::remove_file(&self.path)
                .await
                .context(format!("Failed to delete progress file: {}", self.path.display()))?;
            info!(task_id = %self.task_id, "Deleted progress");
        }
        Ok(())
    }

    /// Write any batched changes now
    pub async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.pending_writes > 0 {
            self.save_locked(&mut inner).await?;
        }
        Ok(())
    }

    pub async fn scraped_data(&self) -> Vec<Value> {
        self.inner.lock().await.state.scraped_data.clone()
    }

    /// Write the scraped data to `output`, adding the format's extension
    /// when missing. Returns the path written.
    pub async fn export(&self, output: &Path, format: ExportFormat) -> Result<PathBuf> {
        let data = self.scraped_data().await;
        export_records(&data, output, format).await
    }

    async fn maybe_save(&self, inner: &mut Inner) -> Result<()> {
        inner.pending_writes += 1;
        if inner.pending_writes >= self.save_interval {
            self.save_locked(inner).await?;
        }
        Ok(())
    }

    async fn save_locked(&self, inner: &mut Inner) -> Result<()> {
        inner.state.updated_at = Utc::now();
        write_json_atomic(&self.path, &inner.state).await?;
        inner.pending_writes = 0;
        Ok(())
    }
}

fn push_note(state: &mut ProgressState, note: &str) {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    state.notes.push_str(&format!("\n[{}] {}", timestamp, note));
}

async fn load_state(path: &Path) -> Result<ProgressState> {
    let contents = fs::read_to_string(path)
        .await
        .context(format!("Failed to read progress file: {}", path.display()))?;
    serde_json::from_str(&contents)
        .context(format!("Failed to parse progress file: {}", path.display()))
}

/// Serialize `value` next to `path` and rename it into place
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .context(format!("Failed to create directory: {}", parent.display()))?;
    }

    let contents = serde_json::to_string_pretty(value).context("Failed to serialize document")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)
        .await
        .context(format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .context(format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

pub(crate) async fn export_records(data: &[Value], output: &Path, format: ExportFormat) -> Result<PathBuf> {
    let (extension, contents) = match format {
        ExportFormat::Json => (
            "json",
            serde_json::to_string_pretty(data).context("Failed to serialize data")?,
        ),
        ExportFormat::JsonLines => {
            let mut lines = String::new();
            for item in data {
                lines.push_str(&serde_json::to_string(item).context("Failed to serialize data")?);
                lines.push('\n');
            }
            ("jsonl", lines)
        }
    };

    let path = if output.extension().map_or(false, |ext| ext == extension) {
        output.to_path_buf()
    } else {
        PathBuf::from(format!("{}.{}", output.display(), extension))
    };

    fs::write(&path, contents)
        .await
        .context(format!("Failed to write export: {}", path.display()))?;
    info!("Exported {} items to {}", data.len(), path.display());
    Ok(path)
}

/// Every readable progress file, most recently updated first
pub async fn list_progress(data_dir: &Path) -> Result<Vec<ProgressSummary>> {
    let dir = progress_dir(data_dir);
    if !fs::try_exists(&dir).await.unwrap_or(false) {
        return Ok(Vec::new());
    }

    let mut summaries = Vec::new();
    let mut entries = fs::read_dir(&dir)
        .await
        .context(format!("Failed to read {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().map_or(true, |ext| ext != "json") {
            continue;
        }
        match load_state(&path).await {
            Ok(state) => {
                let mut summary = ProgressSummary::from(&state);
                summary.file = Some(path);
                summaries.push(summary);
            }
            Err(e) => debug!("Skipping unreadable progress file: {:#}", e),
        }
    }

    summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(summaries)
}

/// Tasks that can still be picked up
pub async fn resumable(data_dir: &Path) -> Result<Vec<ProgressSummary>> {
    Ok(list_progress(data_dir)
        .await?
        .into_iter()
        .filter(|s| s.status.is_resumable())
        .collect())
}

/// Delete completed tasks not updated for `days_old` days. Returns the
/// removed task ids.
pub async fn cleanup_completed(data_dir: &Path, days_old: i64) -> Result<Vec<String>> {
    let cutoff = Utc::now() - ChronoDuration::days(days_old);
    let mut removed = Vec::new();

    for summary in list_progress(data_dir).await? {
        if summary.status != TaskStatus::Completed || summary.updated_at >= cutoff {
            continue;
        }
        if let Some(file) = &summary.file {
            fs::remove_file(file)
                .await
                .context(format!("Failed to delete {}", file.display()))?;
            info!("Cleaned up: {}", file.display());
            removed.push(summary.task_id.clone());
        }
    }

    Ok(removed)
}
