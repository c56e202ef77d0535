use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::config::CrawlerConfig;
use crate::cli::RunArgs;
use crate::crawler::{CrawlReport, Orchestrator};
use crate::fetch::{Fetcher, HttpFetcher, RemoteBrowserFetcher};
use crate::storage::patterns::PatternStore;
use crate::storage::progress::{self, ExportFormat, ProgressStore, ProgressSummary};

/// Where the configuration comes from
#[derive(Debug, Default)]
pub struct ConfigSource {
    pub path: Option<PathBuf>,
    pub profile: Option<String>,
}

impl ConfigSource {
    pub fn load(&self) -> Result<CrawlerConfig> {
        if let Some(path) = &self.path {
            return CrawlerConfig::load_from_file(path);
        }
        if let Some(profile) = &self.profile {
            return CrawlerConfig::load_profile(profile)
                .context(format!("Failed to load profile: {}", profile));
        }
        CrawlerConfig::load_default()
    }
}

/// Apply command line overrides on top of the loaded configuration
pub fn apply_overrides(config: &mut CrawlerConfig, args: &RunArgs) {
    let orchestrator = &mut config.orchestrator;

    if let Some(c) = args.concurrency {
        orchestrator.max_concurrent = c;
    }
    if let Some(p) = args.per_domain {
        orchestrator.max_per_domain = p;
    }
    if let Some(r) = args.rate_limit {
        orchestrator.global_rate_limit = r;
    }
    if let Some(r) = args.domain_rate_limit {
        orchestrator.per_domain_rate_limit = r;
    }
    if let Some(d) = args.min_delay {
        orchestrator.min_delay = d;
    }
    if let Some(d) = args.max_delay {
        orchestrator.max_delay = d;
    }
    if let Some(r) = args.retries {
        orchestrator.max_retries = r;
    }
    if let Some(t) = args.timeout {
        orchestrator.request_timeout = t;
    }
    if args.no_progress {
        orchestrator.enable_progress = false;
    }
    if let Some(id) = &args.task_id {
        orchestrator.task_id = Some(id.clone());
    }
    if args.headless {
        orchestrator.headless = true;
    }
    if args.no_headless {
        orchestrator.headless = false;
    }
    if let Some(ua) = &args.user_agent {
        orchestrator.user_agent = Some(ua.clone());
    }
    if let Some(proxy) = &args.proxy {
        orchestrator.proxy = Some(proxy.clone());
    }
    if args.no_learn {
        orchestrator.learn_patterns = false;
    }
    if let Some(url) = &args.browser_service {
        config.fetcher.browser_service_url = Some(url.clone());
    }
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.clone();
    }
}

/// Read the URL list: a file with one URL per line (blank lines and `#`
/// comments skipped), or a comma-separated list
pub fn load_urls(source: &str) -> Result<Vec<String>> {
    let path = Path::new(source);
    let raw: Vec<String> = if path.is_file() {
        let contents = std::fs::read_to_string(path)
            .context(format!("Failed to read URL file: {}", path.display()))?;
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect()
    } else {
        source
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect()
    };
    Ok(raw)
}

/// Fetch a list of URLs
pub async fn run(source: &ConfigSource, args: RunArgs) -> Result<()> {
    let mut config = source.load()?;
    apply_overrides(&mut config, &args);
    config.orchestrator.validate()?;

    let urls = load_urls(&args.urls)?;
    if urls.is_empty() {
        warn!("No URLs to fetch");
        return Ok(());
    }

    let fetcher: Arc<dyn Fetcher> = match &config.fetcher.browser_service_url {
        Some(url) => {
            info!("Fetching through browser service at {}", url);
            Arc::new(RemoteBrowserFetcher::new(url)?)
        }
        None => Arc::new(HttpFetcher::new(config.orchestrator.proxy.as_deref())?),
    };

    let data_dir = config.storage.data_dir.clone();
    let mut orchestrator = Orchestrator::new(config.orchestrator.clone(), fetcher)?
        .with_headers(config.fetcher.extra_headers.clone());

    if config.orchestrator.enable_progress {
        let store = ProgressStore::open(
            &data_dir,
            config.orchestrator.task_id.as_deref(),
            urls.first().map(String::as_str),
            config.orchestrator.progress_save_interval,
        )
        .await?;
        println!("Task ID: {}", store.task_id());
        orchestrator = orchestrator.with_progress(Arc::new(store));
    }
    if config.orchestrator.learn_patterns {
        orchestrator = orchestrator.with_patterns(Arc::new(PatternStore::open(&data_dir).await?));
    }

    let signals = tokio::spawn(cancel_on_signal(orchestrator.shutdown_token()));
    let report = orchestrator.run(urls).await;
    signals.abort();
    let report = report?;

    print_summary(&report);

    if let Some(output) = &args.output {
        let path = report.write_outcomes(output).await?;
        println!("Results saved to {}", path.display());
    }

    if report.interrupted {
        if let Some(task_id) = &report.task_id {
            println!("Interrupted. Run again with --task-id {} to resume", task_id);
        }
    }

    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    wait_for_signal().await;
    warn!("Signal received, shutting down");
    token.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn print_summary(report: &CrawlReport) {
    let summary = &report.summary;
    let stats = &summary.stats;

    println!();
    println!("{}", "=".repeat(50));
    println!("Run Summary");
    println!("{}", "=".repeat(50));
    println!("   Total URLs: {}", stats.total);
    println!("   Completed: {}", stats.completed);
    println!("   Failed: {}", stats.failed);
    println!("   Retried: {}", stats.retried);
    if stats.skipped > 0 {
        println!("   Skipped (done earlier): {}", stats.skipped);
    }
    if stats.aborted > 0 {
        println!("   Aborted: {}", stats.aborted);
    }
    println!("   Duration: {:.1}s", summary.duration_secs);
    println!("   Speed: {:.2} URLs/s", summary.urls_per_second);
    println!("{}", "=".repeat(50));
}

fn print_progress_row(summary: &ProgressSummary) {
    println!(
        "{:<32} {:<12} {:>6}/{:<6} {:>5.1}%  {}",
        summary.task_id,
        summary.status.to_string(),
        summary.completed_urls,
        summary.total_urls,
        summary.percent,
        summary.updated_at.format("%Y-%m-%d %H:%M")
    );
}

/// List saved tasks, optionally only resumable ones
pub async fn list_progress(data_dir: &Path, resumable_only: bool) -> Result<()> {
    let tasks = if resumable_only {
        progress::resumable(data_dir).await?
    } else {
        progress::list_progress(data_dir).await?
    };

    if tasks.is_empty() {
        println!("No saved tasks.");
        return Ok(());
    }

    for task in &tasks {
        print_progress_row(task);
    }
    Ok(())
}

async fn open_existing(data_dir: &Path, task_id: &str) -> Result<ProgressStore> {
    let path = progress::progress_dir(data_dir).join(format!("{}.json", task_id));
    if !path.exists() {
        anyhow::bail!("No progress saved for task '{}'", task_id);
    }
    ProgressStore::open(data_dir, Some(task_id), None, 1).await
}

/// Show one task
pub async fn progress_status(data_dir: &Path, task_id: &str) -> Result<()> {
    let store = open_existing(data_dir, task_id).await?;
    let state = store.snapshot().await;
    let summary = store.summary().await;

    println!("Task ID: {}", state.task_id);
    println!("Status: {}", state.status);
    println!("Start URL: {}", state.start_url);
    println!(
        "Progress: {}/{} ({:.1}%), {} failed",
        state.completed_urls, state.total_urls, summary.percent, state.failed_urls
    );
    println!("Remaining: {}", store.remaining().await.len());
    println!("Created: {}", state.created_at);
    println!("Last Updated: {}", state.updated_at);
    if let Some(error) = &state.last_error {
        println!("Last Error: {}", error);
    }
    Ok(())
}

pub async fn delete_progress(data_dir: &Path, task_id: &str) -> Result<()> {
    let store = open_existing(data_dir, task_id).await?;
    store.delete().await?;
    println!("Deleted progress for {}", task_id);
    Ok(())
}

pub async fn cleanup_progress(data_dir: &Path, days: i64) -> Result<()> {
    let removed = progress::cleanup_completed(data_dir, days).await?;
    println!("Removed {} completed task(s) older than {} days", removed.len(), days);
    Ok(())
}

pub async fn export_progress(data_dir: &Path, task_id: &str, output: &Path, format: ExportFormat) -> Result<()> {
    let store = open_existing(data_dir, task_id).await?;
    let path = store.export(output, format).await?;
    println!("Exported to {}", path.display());
    Ok(())
}

pub async fn pattern_stats(data_dir: &Path) -> Result<()> {
    let store = PatternStore::open(data_dir).await?;
    let stats = store.stats().await;

    println!("Domains: {}", stats.total_domains);
    println!("Patterns: {}", stats.total_patterns);
    println!("Successes: {}", stats.total_successes);
    println!("Failures: {}", stats.total_failures);
    if let Some(updated) = stats.last_updated {
        println!("Last Updated: {}", updated);
    }
    Ok(())
}

pub async fn show_patterns(data_dir: &Path, domain: Option<&str>) -> Result<()> {
    let store = PatternStore::open(data_dir).await?;
    let document = store.document().await;

    for (origin, patterns) in &document.origins {
        if domain.map_or(false, |d| d != origin) {
            continue;
        }
        println!("{}", origin);
        for (shape, pattern) in &patterns.url_patterns {
            println!(
                "  {:<40} {:<8} ok={} fail={} pagination={}",
                shape,
                pattern.status,
                pattern.success_count,
                pattern.fail_count,
                pattern.pagination.kind.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

pub async fn retire_pattern(data_dir: &Path, url: &str) -> Result<()> {
    let store = PatternStore::open(data_dir).await?;
    if store.retire(url).await? {
        println!("Retired pattern for {}", url);
    } else {
        println!("No pattern stored for {}", url);
    }
    Ok(())
}

/// Print the effective configuration
pub fn show_config(source: &ConfigSource) -> Result<()> {
    let config = source.load()?;
    let yaml = serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
    println!("{}", yaml);
    Ok(())
}

pub fn init_config(force: bool) -> Result<()> {
    let path = CrawlerConfig::default_path();
    if path.exists() && !force {
        println!("Configuration already exists at {} (use --force to overwrite)", path.display());
        return Ok(());
    }
    let written = CrawlerConfig::default().save_as_default()?;
    println!("Wrote default configuration to {}", written.display());
    Ok(())
}

pub fn list_profiles() -> Result<()> {
    let profiles = CrawlerConfig::list_profiles()?;
    if profiles.is_empty() {
        println!("No profiles found.");
    }
    for profile in profiles {
        println!("- {}", profile);
    }
    Ok(())
}
