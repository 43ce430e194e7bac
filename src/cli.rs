use std::path::PathBuf;

use clap::Parser;

/// Command line of the loader. Every value-taking flag can also come from the environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "fhir-loader")]
#[command(about = "Bulk-load FHIR bundles into a FHIR server")]
#[command(version)]
pub struct Cli {
    /// Folder with FHIR bundle files (*.json) used to build the buffer file
    #[arg(long, env = "FHIR_LOADER_INPUT_FOLDER")]
    pub input_folder: Option<PathBuf>,

    /// Base URL of the target FHIR server
    #[arg(long, env = "FHIR_LOADER_SERVER_URL")]
    pub fhir_server_url: String,

    /// OAuth2 authority used for the client-credentials exchange
    #[arg(long, env = "FHIR_LOADER_AUTHORITY")]
    pub authority: Option<String>,

    /// OAuth2 client id
    #[arg(long, env = "FHIR_LOADER_CLIENT_ID")]
    pub client_id: Option<String>,

    /// OAuth2 client secret
    #[arg(long, env = "FHIR_LOADER_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Newline-delimited file holding one resource per line
    #[arg(long, env = "FHIR_LOADER_BUFFER_FILE", default_value = "resources.json")]
    pub buffer_file_name: PathBuf,

    /// Rebuild the buffer file even if it already exists
    #[arg(long)]
    pub re_create_buffer_if_exists: bool,

    /// Maximum number of concurrent uploads
    #[arg(long, env = "FHIR_LOADER_MAX_PARALLELISM", default_value_t = 64)]
    pub max_degree_of_parallelism: usize,

    /// Timeout of a single HTTP request, in seconds
    #[arg(long, env = "FHIR_LOADER_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Give up on the whole run after this many seconds
    #[arg(long, env = "FHIR_LOADER_RUN_TIMEOUT_SECS")]
    pub run_timeout_secs: Option<u64>,

    /// Keep uploading after a resource exhausts its retries, and report all failures at the end
    #[arg(long)]
    pub continue_on_error: bool,

    /// Fetch a new token for every request instead of reusing it until expiry
    #[arg(long)]
    pub no_token_cache: bool,

    /// Number of bins in the throughput window
    #[arg(long, default_value_t = 30)]
    pub metrics_bins: usize,

    /// Width of one throughput bin, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub metrics_resolution_ms: u64,

    /// Seconds between progress log lines
    #[arg(long, default_value_t = 10)]
    pub progress_interval_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli =
            Cli::try_parse_from(["fhir-loader", "--fhir-server-url", "http://localhost:8080"]).unwrap();
        assert_eq!(cli.buffer_file_name, PathBuf::from("resources.json"));
        assert_eq!(cli.max_degree_of_parallelism, 64);
        assert!(!cli.re_create_buffer_if_exists);
        assert!(!cli.continue_on_error);
        assert!(cli.authority.is_none());
    }

    #[test]
    fn test_server_url_is_required() {
        assert!(Cli::try_parse_from(["fhir-loader"]).is_err());
    }
}
