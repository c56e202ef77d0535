use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cli::config::OrchestratorConfig;
use crate::crawler::backoff::{retry_delay_with_jitter, BackoffRegistry};
use crate::crawler::origin::OriginKey;
use crate::crawler::task::{FetchOutcome, Task};
use crate::error::CrawlError;
use crate::fetch::{detect_pagination, FetchRequest, FetchResponse, Fetcher};
use crate::storage::{PatternStore, PatternUpdate, ProgressStore, TaskStatus};
use crate::throttle::{ConcurrencyGate, OriginThrottle};
use crate::utils::metrics::{RunMetrics, RunSummary};

/// Everything a finished (or interrupted) run produced
#[derive(Debug, Clone, Serialize)]
pub struct CrawlReport {
    pub task_id: Option<String>,
    pub interrupted: bool,
    pub summary: RunSummary,
    pub outcomes: Vec<FetchOutcome>,
}

impl CrawlReport {
    /// Write the outcome list as JSON, appending `.json` when missing.
    /// Returns the path written.
    pub async fn write_outcomes(&self, output: &Path) -> Result<PathBuf> {
        let path = if output.extension().map_or(false, |ext| ext == "json") {
            output.to_path_buf()
        } else {
            PathBuf::from(format!("{}.json", output.display()))
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .context(format!("Failed to create directory: {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(&self.outcomes).context("Failed to serialize results")?;
        tokio::fs::write(&path, contents)
            .await
            .context(format!("Failed to write results: {}", path.display()))?;

        Ok(path)
    }
}

/// Drives a bounded pool of workers over a URL list.
///
/// Each attempt goes through the origin throttle, the origin's backoff
/// pause, the concurrency gate and then the fetcher. Every wait races the
/// shutdown token.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    headers: Arc<HashMap<String, String>>,
    fetcher: Arc<dyn Fetcher>,
    throttle: Arc<OriginThrottle>,
    gate: Arc<ConcurrencyGate>,
    backoff: Arc<BackoffRegistry>,
    patterns: Option<Arc<PatternStore>>,
    progress: Option<Arc<ProgressStore>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Validate the configuration and build the shared throttles.
    /// Nothing runs until [`Orchestrator::run`].
    pub fn new(config: OrchestratorConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self, CrawlError> {
        config.validate()?;

        let throttle = OriginThrottle::new(
            config.global_rate_limit,
            config.per_domain_rate_limit,
            config.min_delay,
            config.max_delay,
        )?;
        let gate = ConcurrencyGate::new(config.max_concurrent, config.max_per_domain)?;
        let backoff = BackoffRegistry::new(config.min_delay, config.max_delay);

        Ok(Self {
            config: Arc::new(config),
            headers: Arc::new(HashMap::new()),
            fetcher,
            throttle: Arc::new(throttle),
            gate: Arc::new(gate),
            backoff: Arc::new(backoff),
            patterns: None,
            progress: None,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_progress(mut self, progress: Arc<ProgressStore>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_patterns(mut self, patterns: Arc<PatternStore>) -> Self {
        self.patterns = Some(patterns);
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Arc::new(headers);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn backoff(&self) -> &BackoffRegistry {
        &self.backoff
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Token that stops the run when cancelled; hand it to signal handlers
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop scheduling new work and abort every pending wait
    pub fn request_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            warn!("Shutdown requested, finishing current attempts");
        }
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Process `urls` and return the report. Individual URL failures are in
    /// the report; `Err` is reserved for setup problems.
    pub async fn run(&self, urls: Vec<String>) -> Result<CrawlReport> {
        let urls = dedupe(urls);
        let metrics = RunMetrics::new(urls.len());
        let mut outcomes = Vec::new();

        let pending = match &self.progress {
            Some(progress) => self.prepare_progress(progress, &urls, &metrics, &mut outcomes).await?,
            None => urls.clone(),
        };

        info!(
            urls = pending.len(),
            concurrency = self.config.max_concurrent,
            per_domain = self.config.max_per_domain,
            "Starting run ({}/s global, {}/s per domain)",
            self.config.global_rate_limit,
            self.config.per_domain_rate_limit
        );

        let workers = self.config.max_concurrent.min(pending.len());
        let queue = Arc::new(Mutex::new(VecDeque::from(pending)));
        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            let this = self.clone();
            let queue = queue.clone();
            let metrics = metrics.clone();
            set.spawn(async move { this.worker(worker_id, queue, metrics).await });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(mut finished) => outcomes.append(&mut finished),
                Err(e) => error!("Worker stopped abnormally: {}", e),
            }
        }

        let interrupted = self.is_shutting_down();
        if let Some(progress) = &self.progress {
            self.close_progress(progress, interrupted).await;
        }

        let order: HashMap<&str, usize> = urls.iter().enumerate().map(|(i, u)| (u.as_str(), i)).collect();
        outcomes.sort_by_key(|o| order.get(o.url.as_str()).copied().unwrap_or(usize::MAX));

        let summary = metrics.summary().await;
        info!(
            completed = summary.stats.completed,
            failed = summary.stats.failed,
            aborted = summary.stats.aborted,
            skipped = summary.stats.skipped,
            "Run finished in {:.1}s",
            summary.duration_secs
        );

        Ok(CrawlReport {
            task_id: self.progress.as_ref().map(|p| p.task_id().to_string()),
            interrupted,
            summary,
            outcomes,
        })
    }

    /// Register the URL list with the progress record and return what is
    /// left to fetch. Completed URLs become skipped outcomes.
    async fn prepare_progress(
        &self,
        progress: &ProgressStore,
        urls: &[String],
        metrics: &RunMetrics,
        outcomes: &mut Vec<FetchOutcome>,
    ) -> Result<Vec<String>> {
        let resuming = progress.has_progress().await;
        if resuming {
            progress.add_urls(urls).await?;
        } else {
            progress.set_urls(urls).await?;
        }
        progress.set_config(serde_json::to_value(&*self.config)?).await?;
        if progress.status().await != TaskStatus::InProgress {
            progress.resume().await?;
        }

        let remaining: HashSet<String> = progress.remaining().await.into_iter().collect();
        let mut pending = Vec::new();
        let mut previously_failed = 0;
        for url in urls {
            if remaining.contains(url) {
                pending.push(url.clone());
            } else if progress.is_completed(url).await {
                let outcome = FetchOutcome::already_completed(url);
                metrics.record_outcome(&outcome).await;
                outcomes.push(outcome);
            } else {
                previously_failed += 1;
            }
        }

        if resuming {
            info!(
                task_id = progress.task_id(),
                "Resuming: {} already completed, {} failed earlier and not retried",
                outcomes.len(),
                previously_failed
            );
        }
        Ok(pending)
    }

    async fn close_progress(&self, progress: &ProgressStore, interrupted: bool) {
        let closed = if interrupted {
            progress.pause().await
        } else {
            progress.finish(TaskStatus::Completed).await
        };
        if let Err(e) = closed {
            error!("Failed to save final progress: {:#}", e);
        }
    }

    async fn worker(
        &self,
        worker_id: usize,
        queue: Arc<Mutex<VecDeque<String>>>,
        metrics: RunMetrics,
    ) -> Vec<FetchOutcome> {
        debug!("Worker {} started", worker_id);
        let mut outcomes = Vec::new();

        loop {
            let next = queue.lock().await.pop_front();
            let Some(url) = next else {
                break;
            };

            let outcome = self.process_url(&url, &metrics).await;
            metrics.record_outcome(&outcome).await;
            if outcome.success {
                info!(url = %url, attempts = outcome.retry_count + 1, "✓ fetched");
            } else if !outcome.is_aborted() {
                warn!(url = %url, "✗ {}", outcome.error.as_deref().unwrap_or("failed"));
            }
            outcomes.push(outcome);
        }

        debug!("Worker {} finished", worker_id);
        outcomes
    }

    /// One URL, all of its attempts
    async fn process_url(&self, url: &str, metrics: &RunMetrics) -> FetchOutcome {
        if let Some(progress) = &self.progress {
            if progress.is_completed(url).await {
                return FetchOutcome::already_completed(url);
            }
        }

        let mut task = Task::new(url);

        let origin = match OriginKey::parse(url) {
            Ok(origin) => origin,
            Err(e) => {
                self.record_exhausted(&task, &e).await;
                return FetchOutcome::failed(&task, &e, 0);
            }
        };
        self.seed_backoff(url, &origin).await;

        loop {
            if self.is_shutting_down() {
                return FetchOutcome::failed(&task, &CrawlError::ShutdownAborted, 0);
            }

            let started = Instant::now();
            let attempt = self.attempt(&task, &origin, metrics).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let error = match attempt {
                Ok(response) => return self.record_success(&task, &origin, response, duration_ms).await,
                Err(error) => error,
            };

            if error == CrawlError::ShutdownAborted {
                return FetchOutcome::failed(&task, &error, duration_ms);
            }

            if !error.is_retryable() || task.retry_count >= self.config.max_retries {
                self.record_exhausted(&task, &error).await;
                return FetchOutcome::failed(&task, &error, duration_ms);
            }

            let delay = retry_delay_with_jitter(
                task.retry_count,
                self.config.retry_base_delay,
                self.config.retry_max_delay,
            );
            warn!(
                url = %url,
                attempt = task.retry_count + 1,
                "Attempt failed ({}), retrying in {:.1}s",
                error,
                delay.as_secs_f64()
            );
            metrics.record_retry().await;

            if self.cancellable(tokio::time::sleep(delay)).await.is_err() {
                return FetchOutcome::failed(&task, &CrawlError::ShutdownAborted, duration_ms);
            }
            task = task.next_attempt();
        }
    }

    /// A single attempt. The gate permit lives only for the fetch itself.
    async fn attempt(
        &self,
        task: &Task,
        origin: &OriginKey,
        metrics: &RunMetrics,
    ) -> Result<FetchResponse, CrawlError> {
        let waited = self.cancellable(self.throttle.acquire(&task.url)).await??;
        debug!(url = %task.url, "Throttled {:?}", waited);

        if let Some(pause) = self.backoff.begin_attempt(origin).await {
            self.cancellable(tokio::time::sleep(pause)).await?;
        }

        let permit = self.cancellable(self.gate.acquire(&task.url)).await??;
        let request = self.request_for(&task.url);
        let fetched = self
            .cancellable(tokio::time::timeout(request.timeout, self.fetcher.fetch(&request)))
            .await;
        permit.release();

        let response = match fetched? {
            Err(_) => Err(CrawlError::Transport(format!(
                "timed out after {}ms",
                request.timeout.as_millis()
            ))),
            Ok(Err(e)) => Err(CrawlError::Transport(format!("{:#}", e))),
            Ok(Ok(response)) if response.success => Ok(response),
            Ok(Ok(response)) => Err(CrawlError::from_response(response.status_code, response.error.as_deref())),
        };

        match &response {
            Ok(reply) => metrics.record_attempt(reply.status_code).await,
            Err(e) => {
                metrics.record_attempt(e.status_code()).await;
                self.backoff.report_failure(origin, e.status_code()).await;
            }
        }
        response
    }

    fn request_for(&self, url: &str) -> FetchRequest {
        FetchRequest {
            url: url.to_string(),
            timeout: self.config.request_timeout(),
            headless: self.config.headless,
            user_agent: self.config.user_agent.clone(),
            proxy: self.config.proxy.clone(),
            headers: (*self.headers).clone(),
        }
    }

    /// Race `fut` against shutdown
    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, CrawlError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(CrawlError::ShutdownAborted),
            output = fut => Ok(output),
        }
    }

    /// First time an origin is seen, start its backoff from learned pacing
    async fn seed_backoff(&self, url: &str, origin: &OriginKey) {
        if self.backoff.contains(origin).await {
            return;
        }
        let learned = match (&self.patterns, self.config.learn_patterns) {
            (Some(patterns), true) => patterns.find(url).await.map(|p| p.anti_block),
            _ => None,
        };
        self.backoff.ensure(origin, learned.as_ref()).await;
    }

    async fn record_success(
        &self,
        task: &Task,
        origin: &OriginKey,
        response: FetchResponse,
        duration_ms: u64,
    ) -> FetchOutcome {
        let learned = self.backoff.report_success(origin).await;
        let pagination = detect_pagination(&response.content, &response.links);

        if let (Some(patterns), true) = (&self.patterns, self.config.learn_patterns) {
            let update = PatternUpdate {
                description: Some(format!("Auto-learned from {}", task.url)),
                pagination_type: Some(pagination.to_string()),
                anti_block: Some(learned),
                ..Default::default()
            };
            if let Err(e) = patterns.save(&task.url, update).await {
                warn!(url = %task.url, "Failed to save pattern: {:#}", e);
            }
        }

        let text = if response.markdown.is_empty() {
            response.content
        } else {
            response.markdown
        };

        if let Some(progress) = &self.progress {
            let data = json!({
                "url": task.url,
                "title": response.title,
                "content": text,
                "status_code": response.status_code,
                "pagination": pagination.as_str(),
                "links": response.links.iter().map(|l| l.href.as_str()).collect::<Vec<_>>(),
            });
            if let Err(e) = progress.mark_completed(&task.url, Some(data)).await {
                warn!(url = %task.url, "Failed to record completion: {:#}", e);
            }
        }

        FetchOutcome::succeeded(task, response.status_code, response.title, text, duration_ms)
    }

    async fn record_exhausted(&self, task: &Task, error: &CrawlError) {
        let message = error.to_string();

        if let Some(progress) = &self.progress {
            if let Err(e) = progress.mark_failed(&task.url, &message).await {
                warn!(url = %task.url, "Failed to record failure: {:#}", e);
            }
        }

        if matches!(error, CrawlError::Configuration(_)) {
            return;
        }
        if let (Some(patterns), true) = (&self.patterns, self.config.learn_patterns) {
            let cause = error
                .status_code()
                .map(|status| format!("Origin answered HTTP {} after {} retries", status, task.retry_count));
            if let Err(e) = patterns
                .record_failure(&task.url, &message, cause.as_deref(), None)
                .await
            {
                warn!(url = %task.url, "Failed to record pattern failure: {:#}", e);
            }
        }
    }
}

/// Drop blank lines and repeats, keeping first-seen order
fn dedupe(urls: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty() && seen.insert(u.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::backoff::BlockLevel;
    use crate::error::ErrorKind;
    use crate::fetch::MockFetcher;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Succeeds after `latency`, tracking how many fetches overlap
    #[derive(Default)]
    struct TrackingFetcher {
        latency: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        per_origin: std::sync::Mutex<HashMap<String, (usize, usize)>>,
    }

    impl TrackingFetcher {
        fn new(latency: Duration) -> Self {
            Self {
                latency,
                ..Default::default()
            }
        }

        fn max_for(&self, origin: &str) -> usize {
            self.per_origin.lock().unwrap().get(origin).map(|c| c.1).unwrap_or(0)
        }

        fn origin_delta(&self, url: &str, up: bool) {
            let origin = OriginKey::parse(url).unwrap().to_string();
            let mut map = self.per_origin.lock().unwrap();
            let entry = map.entry(origin).or_default();
            if up {
                entry.0 += 1;
                entry.1 = entry.1.max(entry.0);
            } else {
                entry.0 -= 1;
            }
        }
    }

    #[async_trait]
    impl Fetcher for TrackingFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.origin_delta(&request.url, true);

            tokio::time::sleep(self.latency).await;

            self.origin_delta(&request.url, false);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(FetchResponse {
                success: true,
                url: request.url.clone(),
                title: "ok".to_string(),
                content: "<p>ok</p>".to_string(),
                status_code: Some(200),
                ..Default::default()
            })
        }
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrent: 3,
            max_per_domain: 2,
            global_rate_limit: 1000.0,
            per_domain_rate_limit: 1000.0,
            min_delay: 0.0,
            max_delay: 0.0,
            max_retries: 2,
            retry_base_delay: 5.0,
            retry_max_delay: 60.0,
            ..Default::default()
        }
    }

    fn urls(origin: &str, count: usize) -> Vec<String> {
        (0..count).map(|i| format!("{}/item/{}", origin, i)).collect()
    }

    fn failing_mock(calls: usize, status: Option<u16>) -> MockFetcher {
        let mut mock = MockFetcher::new();
        mock.expect_fetch()
            .times(calls)
            .returning(move |req| Ok(FetchResponse::failure(&req.url, status, "nope")));
        mock
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = OrchestratorConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        let fetcher = Arc::new(TrackingFetcher::new(Duration::ZERO));
        assert!(matches!(
            Orchestrator::new(config, fetcher),
            Err(CrawlError::Configuration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_caps_hold() {
        let fetcher = Arc::new(TrackingFetcher::new(Duration::from_millis(50)));
        let orchestrator = Orchestrator::new(fast_config(), fetcher.clone()).unwrap();

        let mut list = urls("https://a.example", 15);
        list.extend(urls("https://b.example", 15));
        let report = orchestrator.run(list).await.unwrap();

        assert_eq!(report.summary.stats.completed, 30);
        assert!(fetcher.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert!(fetcher.max_for("https://a.example") <= 2);
        assert!(fetcher.max_for("https://b.example") <= 2);
        assert_eq!(orchestrator.gate().in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_origin_serializes() {
        let config = OrchestratorConfig {
            max_concurrent: 3,
            max_per_domain: 1,
            per_domain_rate_limit: 10.0,
            ..fast_config()
        };
        let fetcher = Arc::new(TrackingFetcher::new(Duration::from_millis(100)));
        let orchestrator = Orchestrator::new(config, fetcher.clone()).unwrap();

        let start = Instant::now();
        let report = orchestrator.run(urls("https://example.com", 10)).await.unwrap();

        // Ten 100ms fetches one at a time
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(report.summary.stats.completed, 10);
        assert_eq!(report.summary.stats.failed, 0);
        assert_eq!(fetcher.max_for("https://example.com"), 1);
        assert!(report.outcomes.iter().all(|o| o.success));
        assert_eq!(report.outcomes[0].url, "https://example.com/item/0", "input order");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhaust_then_record() {
        let dir = TempDir::new().unwrap();
        let progress = Arc::new(ProgressStore::open(dir.path(), Some("retry"), None, 1).await.unwrap());
        let orchestrator = Orchestrator::new(fast_config(), Arc::new(failing_mock(3, Some(500))))
            .unwrap()
            .with_progress(progress.clone());

        let start = Instant::now();
        let report = orchestrator
            .run(vec!["https://example.com/broken".to_string()])
            .await
            .unwrap();

        // Two backoff sleeps: 5s and 10s, each with up to 10% jitter
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(15));
        assert!(elapsed <= Duration::from_millis(16_600));

        let outcome = &report.outcomes[0];
        assert!(!outcome.success);
        assert_eq!(outcome.retry_count, 2);
        assert_eq!(outcome.error_kind, Some(ErrorKind::TransportFailure));
        assert_eq!(report.summary.stats.retried, 2);
        assert_eq!(report.summary.stats.failed, 1);

        assert!(progress.is_failed("https://example.com/broken").await);
        assert_eq!(progress.status().await, TaskStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_status_escalates_origin() {
        let config = OrchestratorConfig {
            max_retries: 1,
            ..fast_config()
        };
        let orchestrator = Orchestrator::new(config, Arc::new(failing_mock(2, Some(429)))).unwrap();

        let report = orchestrator
            .run(vec!["https://example.com/limited".to_string()])
            .await
            .unwrap();

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.error_kind, Some(ErrorKind::BlockedFailure));
        assert_eq!(outcome.status_code, Some(429));
        let origin = OriginKey::parse("https://example.com").unwrap();
        assert_eq!(orchestrator.backoff().level(&origin).await, BlockLevel::Severe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transport_failure() {
        let config = OrchestratorConfig {
            max_retries: 0,
            request_timeout: 1_000,
            ..fast_config()
        };
        let fetcher = Arc::new(TrackingFetcher::new(Duration::from_secs(60)));
        let orchestrator = Orchestrator::new(config, fetcher).unwrap();

        let report = orchestrator.run(vec!["https://slow.example/".to_string()]).await.unwrap();
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.error_kind, Some(ErrorKind::TransportFailure));
        assert!(outcome.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_invalid_url_does_not_stop_batch() {
        let fetcher = Arc::new(TrackingFetcher::new(Duration::ZERO));
        let orchestrator = Orchestrator::new(fast_config(), fetcher.clone()).unwrap();

        let report = orchestrator
            .run(vec!["not a url".to_string(), "https://example.com/ok".to_string()])
            .await
            .unwrap();

        assert_eq!(report.summary.stats.completed, 1);
        assert_eq!(report.summary.stats.failed, 1);
        assert_eq!(report.outcomes[0].error_kind, Some(ErrorKind::ConfigurationError));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resume_skips_completed() {
        let dir = TempDir::new().unwrap();
        let progress = Arc::new(ProgressStore::open(dir.path(), Some("resume"), None, 1).await.unwrap());
        let list: Vec<String> = ["A", "B", "C", "D"]
            .iter()
            .map(|p| format!("https://example.com/{}", p))
            .collect();
        progress.set_urls(&list).await.unwrap();
        progress.mark_completed(&list[0], None).await.unwrap();
        progress.mark_completed(&list[1], None).await.unwrap();
        progress.pause().await.unwrap();

        let fetcher = Arc::new(TrackingFetcher::new(Duration::ZERO));
        let orchestrator = Orchestrator::new(fast_config(), fetcher.clone())
            .unwrap()
            .with_progress(progress.clone());
        let report = orchestrator.run(list.clone()).await.unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.summary.stats.skipped, 2);
        assert_eq!(report.summary.stats.completed, 2);
        assert!(report.outcomes[0].skipped);
        assert!(progress.remaining().await.is_empty());
        assert_eq!(progress.status().await, TaskStatus::Completed);
        assert_eq!(progress.snapshot().await.completed_urls, 4);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_fetches_nothing() {
        let dir = TempDir::new().unwrap();
        let progress = Arc::new(ProgressStore::open(dir.path(), Some("stop"), None, 1).await.unwrap());
        let orchestrator = Orchestrator::new(fast_config(), Arc::new(failing_mock(0, None)))
            .unwrap()
            .with_progress(progress.clone());
        orchestrator.request_shutdown();

        let report = orchestrator.run(urls("https://example.com", 4)).await.unwrap();

        assert!(report.interrupted);
        assert_eq!(report.summary.stats.aborted, 4);
        assert_eq!(report.summary.stats.failed, 0);
        assert!(report.outcomes.iter().all(|o| o.is_aborted()));
        assert_eq!(progress.status().await, TaskStatus::Paused);
        assert_eq!(progress.remaining().await.len(), 4, "aborted URLs stay resumable");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_retry_sleep() {
        let orchestrator = Orchestrator::new(fast_config(), Arc::new(failing_mock(1, Some(503)))).unwrap();
        let token = orchestrator.shutdown_token();

        let runner = orchestrator.clone();
        let handle = tokio::spawn(async move { runner.run(vec!["https://example.com/x".to_string()]).await });

        // First attempt fails at once, then the worker sleeps 5s before retrying
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();

        let report = handle.await.unwrap().unwrap();
        assert!(report.interrupted);
        assert!(report.outcomes[0].is_aborted());
        assert_eq!(report.summary.stats.retried, 1);
    }

    #[tokio::test]
    async fn test_learns_and_reuses_patterns() {
        let dir = TempDir::new().unwrap();
        let patterns = Arc::new(PatternStore::open(dir.path()).await.unwrap());
        let fetcher = Arc::new(TrackingFetcher::new(Duration::ZERO));
        let orchestrator = Orchestrator::new(fast_config(), fetcher)
            .unwrap()
            .with_patterns(patterns.clone());

        orchestrator.run(urls("https://example.com", 3)).await.unwrap();

        let pattern = patterns.find("https://example.com/item/99").await.unwrap();
        assert_eq!(pattern.success_count, 3);
        assert_eq!(pattern.pagination.kind.as_deref(), Some("none"));
        assert_eq!(pattern.anti_block.min_delay, Some(0.0));
    }

    #[tokio::test]
    async fn test_write_outcomes_appends_extension() {
        let dir = TempDir::new().unwrap();
        let orchestrator =
            Orchestrator::new(fast_config(), Arc::new(TrackingFetcher::new(Duration::ZERO))).unwrap();
        let report = orchestrator.run(urls("https://example.com", 2)).await.unwrap();

        let path = report.write_outcomes(&dir.path().join("results")).await.unwrap();
        assert!(path.ends_with("results.json"));
        let written: Vec<serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0]["success"], true);
    }

    #[tokio::test]
    async fn test_duplicate_urls_fetched_once() {
        let fetcher = Arc::new(TrackingFetcher::new(Duration::ZERO));
        let orchestrator = Orchestrator::new(fast_config(), fetcher.clone()).unwrap();
        let url = "https://example.com/same".to_string();

        let report = orchestrator.run(vec![url.clone(), url.clone(), " ".to_string()]).await.unwrap();
        assert_eq!(report.summary.stats.total, 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
