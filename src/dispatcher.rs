//! Upload dispatcher: a bounded worker pool that upserts resources into the
//! FHIR server.
//!
//! Each record is sent with `POST {base}/{type}` when it has no id and
//! `PUT {base}/{type}/{id}` when it has one. Failed attempts (transport errors,
//! non-2xx responses, or a failed token exchange) are retried on the
//! [`RetryPolicy`] schedule, with a fresh token per attempt. Once the budget is
//! exhausted the record fails fatally; by default that aborts the whole run.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, StatusCode};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, TokenProvider};
use crate::metrics::RateCollector;
use crate::record::ResourceRecord;
use crate::retry::{random_jitter, RetryPolicy};

/// Default number of records uploaded concurrently.
pub const DEFAULT_MAX_PARALLEL: usize = 64;

/// Default upper bound of the random delay before a record's first attempt (in milliseconds).
const DEFAULT_REQUEST_JITTER_MS: u64 = 50;

/// Error response bodies are cut to this many characters before being kept.
const MAX_ERROR_BODY_CHARS: usize = 2_000;

/// What a fatally failed record does to the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Stop taking records and cancel in-flight uploads
    #[default]
    Abort,

    /// Record the failure and keep going
    Continue,
}

/// Tuning for a dispatcher run.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of records in flight at once
    pub max_parallel: usize,

    /// Upper bound of the random delay before a record's first attempt
    pub request_jitter: Duration,

    /// Behaviour after a record exhausts its retries
    pub failure_mode: FailureMode,

    /// Limit on the duration of the whole run
    pub run_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            request_jitter: Duration::from_millis(DEFAULT_REQUEST_JITTER_MS),
            failure_mode: FailureMode::default(),
            run_timeout: None,
        }
    }
}

/// Why a single upload attempt failed.
#[derive(Debug)]
pub enum UploadError {
    /// Token could not be obtained
    Auth(AuthError),

    /// Request never got a response
    Request(reqwest::Error),

    /// Server answered with a non-success status
    Status { code: StatusCode, body: String },
}

impl UploadError {
    /// HTTP status of the failed response, if there was one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            UploadError::Status { code, .. } => Some(*code),
            UploadError::Auth(AuthError::Rejected { status, .. }) => Some(*status),
            _ => None,
        }
    }
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::Auth(e) => write!(f, "{}", e),
            UploadError::Request(e) => write!(f, "HTTP request failed: {}", e),
            UploadError::Status { code, body } => write!(f, "Server error ({}): {}", code, body),
        }
    }
}

impl std::error::Error for UploadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UploadError::Auth(e) => Some(e),
            UploadError::Request(e) => Some(e),
            UploadError::Status { .. } => None,
        }
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        UploadError::Request(err)
    }
}

impl From<AuthError> for UploadError {
    fn from(err: AuthError) -> Self {
        UploadError::Auth(err)
    }
}

/// A record that exhausted its retry budget.
#[derive(Debug)]
pub struct RecordFailure {
    /// `Type/id` (or `Type`) of the record
    pub reference: String,

    /// Attempts made, first one included
    pub attempts: u32,

    /// Error of the last attempt
    pub error: UploadError,
}

impl std::fmt::Display for RecordFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Unable to upload {} after {} attempts: {}",
            self.reference, self.attempts, self.error
        )
    }
}

/// Final state of one record.
#[derive(Debug)]
pub enum RecordOutcome {
    /// Server accepted the record
    Uploaded { attempts: u32 },

    /// Retries exhausted
    Failed(RecordFailure),

    /// Run was cancelled while the record was in flight
    Cancelled,
}

/// Totals for a dispatcher run.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Records accepted by the server
    pub uploaded: u64,

    /// Retries performed across all records
    pub retries: u64,

    /// Records dropped mid-flight by cancellation
    pub cancelled: u64,

    /// Records that exhausted their retries
    pub failures: Vec<RecordFailure>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.cancelled == 0
    }
}

/// Errors that end a run early.
#[derive(Debug)]
pub enum DispatchError {
    /// A record failed fatally in [`FailureMode::Abort`]
    Aborted {
        failure: RecordFailure,
        summary: RunSummary,
    },

    /// The caller cancelled the run
    Cancelled(RunSummary),

    /// The run did not finish within the configured limit
    DeadlineExceeded(Duration),

    /// A worker task panicked
    Worker(String),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Aborted { failure, .. } => write!(f, "Run aborted. {}", failure),
            DispatchError::Cancelled(summary) => {
                write!(f, "Run cancelled after {} uploads", summary.uploaded)
            }
            DispatchError::DeadlineExceeded(limit) => {
                write!(f, "Run did not finish within {:?}", limit)
            }
            DispatchError::Worker(e) => write!(f, "Upload worker failed: {}", e),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Bounded-concurrency uploader.
///
/// Cloning is cheap: the HTTP client, token provider and rate collector are
/// shared between clones.
///
/// # Example
///
/// ```no_run
/// use fhir_loader::dispatcher::Dispatcher;
/// use fhir_loader::record::ResourceRecord;
/// use fhir_loader::source::record_channel;
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let client = reqwest::Client::new();
///     let dispatcher = Dispatcher::new(client, "https://fhir.example.com/");
///
///     let (tx, rx) = record_channel(16);
///     tx.send(ResourceRecord::parse(r#"{"resourceType":"Patient"}"#).unwrap())
///         .await
///         .unwrap();
///     drop(tx);
///
///     let summary = dispatcher.run(rx, CancellationToken::new()).await.unwrap();
///     println!("Uploaded {} resources", summary.uploaded);
/// }
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    /// Shared HTTP client (connection pool)
    client: Client,

    /// Server base URL without trailing slash
    base_url: Arc<str>,

    /// Token source; requests go out unauthenticated without one
    tokens: Option<Arc<dyn TokenProvider>>,

    retry: RetryPolicy,

    /// Receives one event per uploaded record
    metrics: Option<Arc<RateCollector>>,

    config: DispatcherConfig,
}

impl Dispatcher {
    /// Create a dispatcher for the server at `base_url` with default settings.
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
            tokens: None,
            retry: RetryPolicy::default(),
            metrics: None,
            config: DispatcherConfig::default(),
        }
    }

    /// Build the shared HTTP client used by all workers.
    pub fn build_client(
        request_timeout: Duration,
        max_parallel: usize,
    ) -> Result<Client, reqwest::Error> {
        Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(max_parallel.max(1))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
    }

    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RateCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Method and URL used to upsert `record`.
    pub fn target(&self, record: &ResourceRecord) -> (Method, String) {
        match record.id() {
            Some(id) => (
                Method::PUT,
                format!("{}/{}/{}", self.base_url, record.resource_type(), id),
            ),
            None => (
                Method::POST,
                format!("{}/{}", self.base_url, record.resource_type()),
            ),
        }
    }

    /// Upload every record received on `records`.
    ///
    /// Returns once the queue is closed and drained and every in-flight upload
    /// has finished, or early when the run is aborted, cancelled through
    /// `cancel`, or exceeds the configured run timeout.
    pub async fn run(
        &self,
        records: mpsc::Receiver<ResourceRecord>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, DispatchError> {
        info!(
            base_url = %self.base_url,
            max_parallel = self.config.max_parallel,
            max_retries = self.retry.max_retries(),
            failure_mode = ?self.config.failure_mode,
            "Starting upload run"
        );

        let run_cancel = cancel.child_token();
        let run = self.drive(records, cancel, run_cancel.clone());

        match self.config.run_timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    run_cancel.cancel();
                    error!(timeout_secs = limit.as_secs_f64(), "Run deadline exceeded");
                    Err(DispatchError::DeadlineExceeded(limit))
                }
            },
            None => run.await,
        }
    }

    async fn drive(
        &self,
        mut records: mpsc::Receiver<ResourceRecord>,
        cancel: CancellationToken,
        run_cancel: CancellationToken,
    ) -> Result<RunSummary, DispatchError> {
        let permits = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut workers: JoinSet<RecordOutcome> = JoinSet::new();
        let mut tally = Tally::default();

        loop {
            let permit = tokio::select! {
                biased;
                _ = run_cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let record = tokio::select! {
                biased;
                _ = run_cancel.cancelled() => break,
                record = records.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };

            while let Some(joined) = workers.try_join_next() {
                tally.absorb(joined, self.config.failure_mode, &run_cancel);
            }

            let worker = self.clone();
            let worker_cancel = run_cancel.clone();
            workers.spawn(async move {
                let outcome = worker.upload(&record, &worker_cancel).await;
                if matches!(outcome, RecordOutcome::Failed(_))
                    && worker.config.failure_mode == FailureMode::Abort
                {
                    // Cancel before the permit is released so no further record is taken.
                    worker_cancel.cancel();
                }
                drop(permit);
                outcome
            });
        }

        records.close();

        while let Some(joined) = workers.join_next().await {
            tally.absorb(joined, self.config.failure_mode, &run_cancel);
        }

        tally.finish(&cancel)
    }

    /// Upload one record, retrying per the policy.
    pub async fn upload(
        &self,
        record: &ResourceRecord,
        cancel: &CancellationToken,
    ) -> RecordOutcome {
        let spread = random_jitter(self.config.request_jitter);
        if !spread.is_zero() && !sleep_or_cancel(spread, cancel).await {
            return RecordOutcome::Cancelled;
        }

        let mut attempt: u32 = 1;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return RecordOutcome::Cancelled,
                result = self.send_once(record) => result,
            };

            match result {
                Ok(status) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.collect(Utc::now());
                    }
                    debug!(
                        resource = %record.reference(),
                        status = status.as_u16(),
                        attempts = attempt,
                        "Resource uploaded"
                    );
                    return RecordOutcome::Uploaded { attempts: attempt };
                }
                Err(error) => match self.retry.delay_for(attempt) {
                    Some(delay) => {
                        warn!(
                            resource = %record.reference(),
                            error = %error,
                            attempt = attempt,
                            max_retries = self.retry.max_retries(),
                            delay_ms = delay.as_millis() as u64,
                            "Request failed, will retry"
                        );
                        if !sleep_or_cancel(delay, cancel).await {
                            return RecordOutcome::Cancelled;
                        }
                        attempt += 1;
                    }
                    None => {
                        error!(
                            resource = %record.reference(),
                            status = ?error.status().map(|s| s.as_u16()),
                            error = %error,
                            attempts = attempt,
                            "Request failed permanently"
                        );
                        return RecordOutcome::Failed(RecordFailure {
                            reference: record.reference(),
                            attempts: attempt,
                            error,
                        });
                    }
                },
            }
        }
    }

    /// Send a single request without retry logic.
    async fn send_once(&self, record: &ResourceRecord) -> Result<StatusCode, UploadError> {
        let token = match &self.tokens {
            Some(tokens) => Some(tokens.acquire(&self.base_url).await?),
            None => None,
        };

        let (method, url) = self.target(record);
        let mut request = self
            .client
            .request(method, url)
            .header(CONTENT_TYPE, "application/json")
            .body(record.body().to_owned());

        if let Some(token) = &token {
            request = request.bearer_auth(&token.value);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            // Drain the body so the connection returns to the pool.
            let _ = response.bytes().await;
            Ok(status)
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            Err(UploadError::Status {
                code: status,
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            })
        }
    }
}

/// Running totals while workers report back.
#[derive(Default)]
struct Tally {
    summary: RunSummary,
    fatal: Option<RecordFailure>,
    panic: Option<String>,
}

impl Tally {
    fn absorb(
        &mut self,
        joined: Result<RecordOutcome, JoinError>,
        mode: FailureMode,
        run_cancel: &CancellationToken,
    ) {
        match joined {
            Ok(RecordOutcome::Uploaded { attempts }) => {
                self.summary.uploaded += 1;
                self.summary.retries += u64::from(attempts.saturating_sub(1));
            }
            Ok(RecordOutcome::Failed(failure)) => {
                self.summary.retries += u64::from(failure.attempts.saturating_sub(1));
                if mode == FailureMode::Abort && self.fatal.is_none() {
                    self.fatal = Some(failure);
                } else {
                    self.summary.failures.push(failure);
                }
            }
            Ok(RecordOutcome::Cancelled) => {
                self.summary.cancelled += 1;
            }
            Err(e) => {
                error!(error = %e, "Upload worker panicked");
                self.panic.get_or_insert_with(|| e.to_string());
                run_cancel.cancel();
            }
        }
    }

    fn finish(self, cancel: &CancellationToken) -> Result<RunSummary, DispatchError> {
        let Tally {
            summary,
            fatal,
            panic,
        } = self;

        if let Some(e) = panic {
            return Err(DispatchError::Worker(e));
        }

        if let Some(failure) = fatal {
            return Err(DispatchError::Aborted { failure, summary });
        }

        if cancel.is_cancelled() {
            warn!(uploaded = summary.uploaded, "Run cancelled");
            return Err(DispatchError::Cancelled(summary));
        }

        info!(
            uploaded = summary.uploaded,
            retries = summary.retries,
            failed = summary.failures.len(),
            "Upload run finished"
        );
        Ok(summary)
    }
}

/// Sleep for `duration`; returns `false` if `cancel` fired first.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
