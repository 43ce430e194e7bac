//! Configuration module for the loader.
//!
//! [`Config`] is built from the parsed command line ([`Cli`]), which also
//! reads `FHIR_LOADER_*` environment variables. All limits are validated here
//! so the rest of the crate can trust its settings.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::cli::Cli;
use crate::dispatcher::{DispatcherConfig, FailureMode};

/// Upper bound on concurrent uploads
const MAX_PARALLELISM: usize = 1_024;

/// Bounds on the per-request timeout (seconds)
const MIN_REQUEST_TIMEOUT_SECS: u64 = 1;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 600;

/// Credentials for the client-credentials exchange.
#[derive(Clone)]
pub struct AuthConfig {
    /// Authority URL without trailing slash
    pub authority: String,
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("authority", &self.authority)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Validated loader configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// FHIR server base URL without trailing slash
    pub fhir_server_url: String,

    /// Token settings; `None` sends requests without an `Authorization` header
    pub auth: Option<AuthConfig>,

    /// Folder of bundles used to (re)build the buffer file
    pub input_folder: Option<PathBuf>,

    /// Newline-delimited resource file
    pub buffer_file: PathBuf,

    /// Rebuild the buffer file even if it exists
    pub recreate_buffer: bool,

    /// Maximum concurrent uploads
    pub max_parallel: usize,

    /// Timeout of a single HTTP request
    pub request_timeout: Duration,

    /// Limit on the whole run
    pub run_timeout: Option<Duration>,

    pub failure_mode: FailureMode,

    /// Reuse tokens until they near expiry
    pub token_cache: bool,

    /// Throughput window shape
    pub metrics_bins: usize,
    pub metrics_resolution: Duration,

    /// Interval between progress log lines
    pub progress_interval: Duration,
}

/// Error type for configuration failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub field: Option<String>,
}

impl ConfigError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(field) => write!(f, "Configuration error for {}: {}", field, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Validate the command line into a configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - a URL is not an absolute `http`/`https` URL
    /// - `--authority` is given without client id and secret (or the reverse)
    /// - a numeric limit is zero or above its maximum
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let fhir_server_url = parse_http_url("fhir-server-url", &cli.fhir_server_url)?;

        let auth = match (cli.authority, cli.client_id, cli.client_secret) {
            (None, None, None) => None,
            (Some(authority), Some(client_id), Some(client_secret)) => {
                if client_id.is_empty() {
                    return Err(ConfigError::new("client-id", "must not be empty"));
                }
                Some(AuthConfig {
                    authority: parse_http_url("authority", &authority)?,
                    client_id,
                    client_secret,
                })
            }
            (None, _, _) => {
                return Err(ConfigError::new(
                    "authority",
                    "required when client credentials are given",
                ))
            }
            _ => {
                return Err(ConfigError::new(
                    "client-id",
                    "authority requires both client id and client secret",
                ))
            }
        };

        let max_parallel = cli.max_degree_of_parallelism;
        if max_parallel == 0 || max_parallel > MAX_PARALLELISM {
            return Err(ConfigError::new(
                "max-degree-of-parallelism",
                format!("{} is outside 1..={}", max_parallel, MAX_PARALLELISM),
            ));
        }

        let request_timeout_secs = cli.request_timeout_secs;
        if !(MIN_REQUEST_TIMEOUT_SECS..=MAX_REQUEST_TIMEOUT_SECS).contains(&request_timeout_secs) {
            return Err(ConfigError::new(
                "request-timeout-secs",
                format!(
                    "{} is outside {}..={}",
                    request_timeout_secs, MIN_REQUEST_TIMEOUT_SECS, MAX_REQUEST_TIMEOUT_SECS
                ),
            ));
        }

        let run_timeout = match cli.run_timeout_secs {
            Some(0) => return Err(ConfigError::new("run-timeout-secs", "must be greater than 0")),
            other => other.map(Duration::from_secs),
        };

        if cli.metrics_bins == 0 {
            return Err(ConfigError::new("metrics-bins", "must be greater than 0"));
        }
        if cli.metrics_resolution_ms == 0 {
            return Err(ConfigError::new("metrics-resolution-ms", "must be greater than 0"));
        }
        if cli.progress_interval_secs == 0 {
            return Err(ConfigError::new("progress-interval-secs", "must be greater than 0"));
        }

        Ok(Self {
            fhir_server_url,
            auth,
            input_folder: cli.input_folder,
            buffer_file: cli.buffer_file_name,
            recreate_buffer: cli.re_create_buffer_if_exists,
            max_parallel,
            request_timeout: Duration::from_secs(request_timeout_secs),
            run_timeout,
            failure_mode: if cli.continue_on_error {
                FailureMode::Continue
            } else {
                FailureMode::Abort
            },
            token_cache: !cli.no_token_cache,
            metrics_bins: cli.metrics_bins,
            metrics_resolution: Duration::from_millis(cli.metrics_resolution_ms),
            progress_interval: Duration::from_secs(cli.progress_interval_secs),
        })
    }

    /// Whether the buffer file has to be (re)built before uploading.
    pub fn needs_buffer_rebuild(&self) -> bool {
        self.recreate_buffer || !self.buffer_file.exists()
    }

    /// Dispatcher settings derived from this configuration.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_parallel: self.max_parallel,
            failure_mode: self.failure_mode,
            run_timeout: self.run_timeout,
            ..DispatcherConfig::default()
        }
    }
}

/// Parse an absolute http(s) URL and return it without trailing slash.
fn parse_http_url(field: &str, value: &str) -> Result<String, ConfigError> {
    let url = Url::parse(value)
        .map_err(|e| ConfigError::new(field, format!("'{}' is not a valid URL: {}", value, e)))?;

    match url.scheme() {
        "http" | "https" => Ok(value.trim_end_matches('/').to_string()),
        other => Err(ConfigError::new(
            field,
            format!("unsupported scheme '{}', expected http or https", other),
        )),
    }
}
