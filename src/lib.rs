//! FHIR Loader Library
//!
//! This library provides the components of a bulk FHIR loader:
//!
//! - **bundle**: Flattens a folder of bundles into a newline-delimited buffer file
//! - **source**: Streams the buffer file into a bounded record queue
//! - **record**: Resource records that keep their exact JSON text
//! - **auth**: Bearer tokens via OAuth2 client credentials, with an expiry-aware cache
//! - **retry**: Escalating retry schedule with jitter
//! - **dispatcher**: Bounded worker pool performing authenticated upserts
//! - **metrics**: Sliding-window events-per-second collector
//! - **config** / **cli**: Command line and validated configuration
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use fhir_loader::dispatcher::Dispatcher;
//! use fhir_loader::metrics::RateCollector;
//! use fhir_loader::source::{read_buffer_file, record_channel, DEFAULT_CHANNEL_CAPACITY};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let metrics = Arc::new(RateCollector::default());
//!     let client = reqwest::Client::new();
//!     let dispatcher = Dispatcher::new(client, "http://localhost:8080/fhir")
//!         .with_metrics(metrics.clone());
//!
//!     let (tx, rx) = record_channel(DEFAULT_CHANNEL_CAPACITY);
//!     tokio::spawn(async move { read_buffer_file(Path::new("resources.json"), tx).await });
//!
//!     let summary = dispatcher.run(rx, CancellationToken::new()).await.ok();
//!     println!("{:?} at {:.1}/s", summary, metrics.events_per_second());
//! }
//! ```

// Module declarations
pub mod auth;
pub mod bundle;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod metrics;
pub mod record;
pub mod retry;
pub mod source;

// Re-export commonly used types at crate root for convenience
pub use auth::{AuthError, AuthToken, CachedTokenProvider, ClientCredentialsProvider, TokenProvider};
pub use bundle::{create_buffer_file, BufferFileStats, BundleError};
pub use cli::Cli;
pub use config::{AuthConfig, Config, ConfigError};
pub use dispatcher::{
    DispatchError, Dispatcher, DispatcherConfig, FailureMode, RecordFailure, RecordOutcome,
    RunSummary, UploadError,
};
pub use metrics::RateCollector;
pub use record::{RecordError, ResourceRecord};
pub use retry::RetryPolicy;
pub use source::{read_buffer_file, record_channel, SourceError};
