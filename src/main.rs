//! FHIR Loader - bulk upload of FHIR bundles into a FHIR server
//!
//! The loader flattens a folder of bundles into a newline-delimited buffer
//! file (once, unless asked to rebuild it), then streams the buffer through a
//! bounded pool of upload workers.
//!
//! ## Features
//!
//! - Reference resolution of `urn:uuid:` links inside each bundle
//! - OAuth2 client-credentials tokens, cached until near expiry
//! - Escalating retries with jitter for every resource
//! - Live throughput reporting
//! - Graceful cancellation on SIGINT
//!
//! ## Configuration
//!
//! See `fhir-loader --help`. Every value-taking flag can also be set through
//! a `FHIR_LOADER_*` environment variable. `RUST_LOG` controls the log filter
//! (default: info).

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fhir_loader::auth::{CachedTokenProvider, ClientCredentialsProvider, TokenProvider};
use fhir_loader::bundle::create_buffer_file;
use fhir_loader::cli::Cli;
use fhir_loader::config::{Config, ConfigError};
use fhir_loader::dispatcher::{DispatchError, Dispatcher, RunSummary};
use fhir_loader::metrics::RateCollector;
use fhir_loader::source::{read_buffer_file, record_channel, DEFAULT_CHANNEL_CAPACITY};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    let config = match Config::from_cli(Cli::parse()) {
        Ok(config) => {
            info!(
                fhir_server_url = %config.fhir_server_url,
                buffer_file = %config.buffer_file.display(),
                max_parallel = config.max_parallel,
                authenticated = config.auth.is_some(),
                token_cache = config.token_cache,
                failure_mode = ?config.failure_mode,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    match run(config).await {
        Ok(summary) if summary.is_success() => {
            info!(uploaded = summary.uploaded, retries = summary.retries, "All resources uploaded");
        }
        Ok(summary) => {
            for failure in &summary.failures {
                error!(
                    resource = %failure.reference,
                    status = ?failure.error.status().map(|s| s.as_u16()),
                    attempts = failure.attempts,
                    error = %failure.error,
                    "Resource not uploaded"
                );
            }
            error!(
                uploaded = summary.uploaded,
                failed = summary.failures.len(),
                "Load finished with failures"
            );
            std::process::exit(1);
        }
        Err(e) => {
            if let Some(DispatchError::Aborted { failure, .. }) = e.downcast_ref::<DispatchError>() {
                error!(
                    resource = %failure.reference,
                    status = ?failure.error.status().map(|s| s.as_u16()),
                    "Unable to upload to server"
                );
            }
            error!(error = %e, "Load failed");
            std::process::exit(1);
        }
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

async fn run(config: Config) -> Result<RunSummary, BoxError> {
    if config.needs_buffer_rebuild() {
        let input_folder = config.input_folder.clone().ok_or_else(|| ConfigError {
            message: "required to build the buffer file".to_string(),
            field: Some("input-folder".to_string()),
        })?;
        let buffer_file = config.buffer_file.clone();
        tokio::task::spawn_blocking(move || create_buffer_file(&input_folder, &buffer_file))
            .await??;
    } else {
        info!(buffer_file = %config.buffer_file.display(), "Reusing existing buffer file");
    }

    // One client for uploads and token requests
    let client = Dispatcher::build_client(config.request_timeout, config.max_parallel)?;

    let metrics = Arc::new(RateCollector::new(config.metrics_bins, config.metrics_resolution));
    let mut dispatcher = Dispatcher::new(client.clone(), &config.fhir_server_url)
        .with_metrics(metrics.clone())
        .with_config(config.dispatcher_config());

    if let Some(auth) = &config.auth {
        let provider: Arc<dyn TokenProvider> = Arc::new(ClientCredentialsProvider::new(
            client,
            &auth.authority,
            auth.client_id.clone(),
            auth.client_secret.clone(),
        ));
        let provider: Arc<dyn TokenProvider> = if config.token_cache {
            Arc::new(CachedTokenProvider::new(provider))
        } else {
            provider
        };
        dispatcher = dispatcher.with_token_provider(provider);
    }

    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown signal received, cancelling run");
            signal_cancel.cancel();
        }
    });

    // Reader task feeds the worker pool; a malformed line stops the run
    let (tx, rx) = record_channel(DEFAULT_CHANNEL_CAPACITY);
    let reader_cancel = cancel.clone();
    let buffer_file = config.buffer_file.clone();
    let reader = tokio::spawn(async move {
        let result = read_buffer_file(&buffer_file, tx).await;
        if let Err(e) = &result {
            error!(error = %e, "Failed to read buffer file");
            reader_cancel.cancel();
        }
        result
    });

    let progress = tokio::spawn(report_progress(metrics.clone(), config.progress_interval));
    let outcome = dispatcher.run(rx, cancel).await;
    progress.abort();

    // A reader failure is the root cause of any cancellation that followed it
    let queued = reader.await??;
    let summary = outcome?;

    info!(
        queued = queued,
        uploaded = summary.uploaded,
        retries = summary.retries,
        rate = format!("{:.1}/s", metrics.events_per_second()),
        "Load complete"
    );

    Ok(summary)
}

/// Periodically log upload throughput until aborted.
async fn report_progress(metrics: Arc<RateCollector>, every: Duration) {
    let mut ticker = interval(every);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        ticker.tick().await;
        info!(
            rate = format!("{:.1}/s", metrics.events_per_second()),
            in_window = metrics.total_in_window(),
            "Upload progress"
        );
    }
}
