//! Learned per-site request patterns.
//!
//! A single JSON document per installation maps each origin to the URL
//! shapes that have been fetched successfully there, together with the
//! pacing and pagination that worked. Every mutation rewrites the whole
//! document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::crawler::backoff::LearnedPacing;
use crate::crawler::origin::{shape_matches, url_shape, OriginKey};
use crate::storage::progress::write_json_atomic;

pub const PATTERN_FILE: &str = "site_patterns.json";
pub const LESSONS_FILE: &str = "lessons_learned.md";
pub const LESSONS_MARKER: &str = "<!-- New entries go below this line -->";

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_RETIRED: &str = "retired";

const DOCUMENT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaginationHint {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// What worked for one `(origin, shape)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SitePattern {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub selectors: Value,
    #[serde(default)]
    pub pagination: PaginationHint,
    #[serde(default)]
    pub anti_block: LearnedPacing,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub fail_count: u64,
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_fail: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: String,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    STATUS_ACTIVE.to_string()
}

impl SitePattern {
    fn empty() -> Self {
        Self {
            description: String::new(),
            selectors: Value::Null,
            pagination: PaginationHint::default(),
            anti_block: LearnedPacing::default(),
            success_count: 0,
            fail_count: 0,
            last_success: None,
            last_fail: None,
            created_at: Some(Utc::now()),
            notes: String::new(),
            status: default_status(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == STATUS_ACTIVE
    }
}

/// Fields a successful fetch can contribute. `None` keeps what is stored.
#[derive(Debug, Clone, Default)]
pub struct PatternUpdate {
    pub description: Option<String>,
    pub selectors: Option<Value>,
    pub pagination_type: Option<String>,
    pub anti_block: Option<LearnedPacing>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OriginPatterns {
    #[serde(default)]
    pub url_patterns: BTreeMap<String, SitePattern>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMeta {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub total_patterns: usize,
    #[serde(default)]
    pub total_successes: u64,
    #[serde(default)]
    pub total_failures: u64,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

fn default_version() -> String {
    DOCUMENT_VERSION.to_string()
}

impl Default for PatternMeta {
    fn default() -> Self {
        Self {
            version: default_version(),
            total_patterns: 0,
            total_successes: 0,
            total_failures: 0,
            last_updated: None,
        }
    }
}

/// The on-disk document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternDocument {
    #[serde(rename = "_meta", default)]
    pub meta: PatternMeta,
    #[serde(flatten)]
    pub origins: BTreeMap<String, OriginPatterns>,
}

impl PatternDocument {
    /// Recompute the aggregates from the records themselves.
    ///
    /// O(records) per save; fine while stores stay small.
    fn refresh_meta(&mut self) {
        let patterns = self.origins.values().flat_map(|o| o.url_patterns.values());
        let (mut count, mut successes, mut failures) = (0, 0, 0);
        for pattern in patterns {
            count += 1;
            successes += pattern.success_count;
            failures += pattern.fail_count;
        }
        self.meta.total_patterns = count;
        self.meta.total_successes = successes;
        self.meta.total_failures = failures;
        self.meta.last_updated = Some(Utc::now());
    }

    fn lookup(&self, origin: &OriginKey, shape: &str) -> Option<&SitePattern> {
        let patterns = &self.origins.get(origin.as_str())?.url_patterns;

        if let Some(pattern) = patterns.get(shape).filter(|p| p.is_active()) {
            return Some(pattern);
        }

        patterns
            .iter()
            .find(|(stored, pattern)| pattern.is_active() && shape_matches(shape, stored))
            .map(|(_, pattern)| pattern)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PatternStats {
    pub total_domains: usize,
    pub total_patterns: usize,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Persistent owner of the [`PatternDocument`]
#[derive(Debug)]
pub struct PatternStore {
    path: PathBuf,
    lessons_path: PathBuf,
    document: Mutex<PatternDocument>,
}

impl PatternStore {
    /// Load `<data_dir>/experiences/site_patterns.json`, starting empty when
    /// the file is missing or unreadable
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("experiences");
        let path = dir.join(PATTERN_FILE);
        let lessons_path = dir.join(LESSONS_FILE);

        let document = if fs::try_exists(&path).await.unwrap_or(false) {
            let contents = fs::read_to_string(&path)
                .await
                .context(format!("Failed to read pattern file: {}", path.display()))?;
            match serde_json::from_str::<PatternDocument>(&contents) {
                Ok(document) => {
                    debug!("Loaded {} learned patterns", document.meta.total_patterns);
                    document
                }
                Err(e) => {
                    warn!("Ignoring unreadable pattern file {}: {}", path.display(), e);
                    PatternDocument::default()
                }
            }
        } else {
            PatternDocument::default()
        };

        Ok(Self {
            path,
            lessons_path,
            document: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lessons_path(&self) -> &Path {
        &self.lessons_path
    }

    /// Active pattern for `url`: exact shape first, then the first stored
    /// shape whose wildcards match
    pub async fn find(&self, url: &str) -> Option<SitePattern> {
        let origin = OriginKey::parse(url).ok()?;
        let shape = url_shape(url).ok()?;
        let document = self.document.lock().await;
        document.lookup(&origin, &shape).cloned()
    }

    /// Merge a success into the record for the URL's shape, creating it on
    /// first success
    pub async fn save(&self, url: &str, update: PatternUpdate) -> Result<SitePattern> {
        let origin = OriginKey::parse(url)?;
        let shape = url_shape(url)?;

        let mut document = self.document.lock().await;
        let pattern = document
            .origins
            .entry(origin.to_string())
            .or_default()
            .url_patterns
            .entry(shape.clone())
            .or_insert_with(SitePattern::empty);

        if let Some(description) = update.description {
            pattern.description = description;
        }
        if let Some(selectors) = update.selectors {
            pattern.selectors = selectors;
        }
        if let Some(kind) = update.pagination_type {
            pattern.pagination.kind = Some(kind);
        }
        if let Some(anti_block) = update.anti_block {
            pattern.anti_block = anti_block;
        }
        if let Some(notes) = update.notes {
            pattern.notes = notes;
        }
        pattern.success_count += 1;
        pattern.last_success = Some(Utc::now());
        if pattern.created_at.is_none() {
            pattern.created_at = Some(Utc::now());
        }
        let saved = pattern.clone();

        self.persist(&mut document).await?;
        debug!(origin = %origin, shape = %shape, successes = saved.success_count, "Pattern saved");
        Ok(saved)
    }

    /// Count a failure against an existing record and log a lesson entry.
    /// Shapes that never succeeded get no record.
    pub async fn record_failure(
        &self,
        url: &str,
        error: &str,
        cause: Option<&str>,
        solution: Option<&str>,
    ) -> Result<()> {
        let origin = OriginKey::parse(url)?;
        let shape = url_shape(url)?;

        // The document lock also serializes writers of the lessons log.
        let mut document = self.document.lock().await;
        let existing = document
            .origins
            .get_mut(origin.as_str())
            .and_then(|o| o.url_patterns.get_mut(&shape));
        if let Some(pattern) = existing {
            pattern.fail_count += 1;
            pattern.last_fail = Some(Utc::now());
            self.persist(&mut document).await?;
        }

        self.append_lesson(&origin, &shape, url, error, cause, solution)
            .await
    }

    /// Mark the pattern for `url` as retired so lookups skip it.
    /// Returns false when there is nothing stored for the shape.
    pub async fn retire(&self, url: &str) -> Result<bool> {
        let origin = OriginKey::parse(url)?;
        let shape = url_shape(url)?;

        let mut document = self.document.lock().await;
        let Some(pattern) = document
            .origins
            .get_mut(origin.as_str())
            .and_then(|o| o.url_patterns.get_mut(&shape))
        else {
            return Ok(false);
        };
        pattern.status = STATUS_RETIRED.to_string();

        self.persist(&mut document).await?;
        info!(origin = %origin, shape = %shape, "Pattern retired");
        Ok(true)
    }

    pub async fn stats(&self) -> PatternStats {
        let document = self.document.lock().await;
        PatternStats {
            total_domains: document.origins.len(),
            total_patterns: document.meta.total_patterns,
            total_successes: document.meta.total_successes,
            total_failures: document.meta.total_failures,
            last_updated: document.meta.last_updated,
        }
    }

    /// Copy of the whole document, for display
    pub async fn document(&self) -> PatternDocument {
        self.document.lock().await.clone()
    }

    async fn persist(&self, document: &mut PatternDocument) -> Result<()> {
        document.refresh_meta();
        write_json_atomic(&self.path, document)
            .await
            .context("Failed to save learned patterns")
    }

    async fn append_lesson(
        &self,
        origin: &OriginKey,
        shape: &str,
        url: &str,
        error: &str,
        cause: Option<&str>,
        solution: Option<&str>,
    ) -> Result<()> {
        let entry = format!(
            "\n## [{date}] {host} - {shape}\n\n\
             **Task**: Fetching {url}\n\n\
             **Error**:\n- Type: {error}\n\n\
             **Root Cause**: {cause}\n\n\
             **Resolution**: {solution}\n\n\
             **Tags**: #auto-logged\n\n---\n",
            date = Utc::now().format("%Y-%m-%d"),
            host = origin.host(),
            cause = cause.unwrap_or("To be determined"),
            solution = solution.unwrap_or("To be determined"),
        );

        if let Some(parent) = self.lessons_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context(format!("Failed to create directory: {}", parent.display()))?;
        }

        let existing = match fs::read_to_string(&self.lessons_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e).context(format!(
                    "Failed to read lessons log: {}",
                    self.lessons_path.display()
                ))
            }
        };

        let updated = match existing.split_once(LESSONS_MARKER) {
            Some((head, tail)) => format!("{}{}{}{}", head, LESSONS_MARKER, entry, tail),
            None => format!("{}{}", existing, entry),
        };

        fs::write(&self.lessons_path, updated)
            .await
            .context(format!("Failed to write lessons log: {}", self.lessons_path.display()))
    }
}
