use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::CrawlError;

/// Platform directories for configuration and data
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "crawl-orchestrator", "crawl-orchestrator")
}

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct CrawlerConfig {
    pub orchestrator: OrchestratorConfig,
    pub fetcher: FetcherSettings,
    pub storage: StorageSettings,
}

/// Scheduling, pacing and retry settings for a run
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Fetches in flight across all origins
    pub max_concurrent: usize,

    /// Fetches in flight against one origin
    pub max_per_domain: usize,

    /// Requests per second across all origins
    pub global_rate_limit: f64,

    /// Requests per second against one origin
    pub per_domain_rate_limit: f64,

    /// Jitter range added after the rate limiters, in seconds
    pub min_delay: f64,
    pub max_delay: f64,

    /// Attempts after the first one
    pub max_retries: u32,

    /// Retry delay is `retry_base_delay * 2^attempt`, capped at `retry_max_delay`
    pub retry_base_delay: f64,
    pub retry_max_delay: f64,

    /// Per-fetch timeout in milliseconds
    pub request_timeout: u64,

    pub headless: bool,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,

    /// Track progress on disk so the run can be resumed
    pub enable_progress: bool,
    pub task_id: Option<String>,

    /// Write progress every N updates
    pub progress_save_interval: usize,

    /// Record what worked per site and seed later runs from it
    pub learn_patterns: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_per_domain: 2,
            global_rate_limit: 10.0,
            per_domain_rate_limit: 2.0,
            min_delay: 1.0,
            max_delay: 3.0,
            max_retries: 3,
            retry_base_delay: 5.0,
            retry_max_delay: 60.0,
            request_timeout: 30_000,
            headless: true,
            user_agent: None,
            proxy: None,
            enable_progress: true,
            task_id: None,
            progress_save_interval: 5,
            learn_patterns: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout)
    }

    /// Reject settings that would make the caps or pacing meaningless
    pub fn validate(&self) -> Result<(), CrawlError> {
        let fail = |msg: String| Err(CrawlError::Configuration(msg));

        if self.max_concurrent == 0 {
            return fail("max_concurrent must be at least 1".to_string());
        }
        if self.max_per_domain == 0 {
            return fail("max_per_domain must be at least 1".to_string());
        }
        for (name, rate) in [
            ("global_rate_limit", self.global_rate_limit),
            ("per_domain_rate_limit", self.per_domain_rate_limit),
        ] {
            if !(rate.is_finite() && rate > 0.0) {
                return fail(format!("{} must be positive, got {}", name, rate));
            }
        }
        if self.min_delay < 0.0 || self.max_delay < 0.0 {
            return fail("delays cannot be negative".to_string());
        }
        if self.max_delay < self.min_delay {
            return fail(format!(
                "max_delay ({}) is below min_delay ({})",
                self.max_delay, self.min_delay
            ));
        }
        if self.retry_base_delay < 0.0 || self.retry_max_delay < self.retry_base_delay {
            return fail(format!(
                "retry delays must satisfy 0 <= base ({}) <= max ({})",
                self.retry_base_delay, self.retry_max_delay
            ));
        }
        if self.request_timeout == 0 {
            return fail("request_timeout must be positive".to_string());
        }
        if self.progress_save_interval == 0 {
            return fail("progress_save_interval must be at least 1".to_string());
        }

        Ok(())
    }
}

/// Fetch collaborator settings
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct FetcherSettings {
    /// Rendering service to use instead of plain HTTP
    pub browser_service_url: Option<String>,
    pub extra_headers: HashMap<String, String>,
}

/// Where progress and learned patterns live
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let data_dir = project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./data"));
        Self { data_dir }
    }
}

impl CrawlerConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        project_dirs()
            .map(|dirs| dirs.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./config"))
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join("default.yaml")
    }

    /// Load the default configuration, writing it out first if missing
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_path();

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load a named profile from the `sites` directory
    pub fn load_profile(profile: &str) -> Result<Self> {
        let profile_path = Self::config_dir().join("sites").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    pub fn save_as_default(&self) -> Result<PathBuf> {
        let config_path = Self::default_path();
        self.save_to_file(&config_path)?;
        Ok(config_path)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available profiles
    pub fn list_profiles() -> Result<Vec<String>> {
        let sites_dir = Self::config_dir().join("sites");

        if !sites_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();
        for entry in fs::read_dir(sites_dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                    profiles.push(name.to_string());
                }
            }
        }

        profiles.sort();
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.max_per_domain, 2);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases: Vec<Box<dyn Fn(&mut OrchestratorConfig)>> = vec![
            Box::new(|c| c.max_concurrent = 0),
            Box::new(|c| c.max_per_domain = 0),
            Box::new(|c| c.global_rate_limit = 0.0),
            Box::new(|c| c.per_domain_rate_limit = -1.0),
            Box::new(|c| c.min_delay = -0.5),
            Box::new(|c| c.max_delay = 0.5),
            Box::new(|c| c.retry_max_delay = 1.0),
            Box::new(|c| c.request_timeout = 0),
            Box::new(|c| c.progress_save_interval = 0),
        ];

        for mutate in cases {
            let mut config = OrchestratorConfig::default();
            mutate(&mut config);
            assert!(matches!(config.validate(), Err(CrawlError::Configuration(_))));
        }
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "orchestrator:\n  max_concurrent: 8\nfetcher:\n  browser_service_url: http://localhost:5000\n";
        let config: CrawlerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.orchestrator.max_concurrent, 8);
        assert_eq!(config.orchestrator.max_per_domain, 2);
        assert_eq!(
            config.fetcher.browser_service_url.as_deref(),
            Some("http://localhost:5000")
        );
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("profile.yaml");
        let mut config = CrawlerConfig::default();
        config.orchestrator.task_id = Some("nightly".to_string());
        config.storage.data_dir = dir.path().join("data");

        config.save_to_file(&path).unwrap();
        assert_eq!(CrawlerConfig::load_from_file(&path).unwrap(), config);
    }
}
