use clap::Args as ClapArgs;
use std::time::Duration;

const DEFAULT_GRAPH_URL: &str = "https://graph.facebook.com";
const DEFAULT_API_VERSION: &str = "v18.0";
const DEFAULT_SHEETS_URL: &str = "https://sheets.googleapis.com";
const GOOGLE_CREDENTIALS_PATH: &str = "credentials.json";
const LOG_LEVEL: &str = "info";

/// Settings shared by every command. Each one can come from a flag, the
/// process environment or a `.env` file, in that order of precedence.
#[derive(ClapArgs, Clone, Debug)]
pub struct Config {
    #[arg(long, env = "FACEBOOK_ACCESS_TOKEN", hide_env_values = true)]
    pub(crate) access_token: Option<String>,

    #[arg(long, default_value = DEFAULT_API_VERSION, env = "FACEBOOK_API_VERSION")]
    pub(crate) api_version: String,

    #[arg(long, default_value = DEFAULT_GRAPH_URL, env = "FACEBOOK_GRAPH_URL")]
    pub(crate) graph_url: String,

    #[arg(long = "google-credentials", default_value = GOOGLE_CREDENTIALS_PATH, env = "GOOGLE_CREDENTIALS_PATH")]
    pub(crate) google_credentials_path: String,

    #[arg(long, default_value = DEFAULT_SHEETS_URL, env = "GOOGLE_SHEETS_URL")]
    pub(crate) sheets_url: String,

    #[arg(long, default_value = LOG_LEVEL, env = "LOG_LEVEL")]
    pub(crate) log_level: String,

    #[arg(long, env = "LOG_FILE")]
    pub(crate) log_file: Option<String>,

    #[arg(long = "lookback-years", default_value_t = 2, env = "DEFAULT_LOOKBACK_YEARS")]
    pub(crate) lookback_years: u32,

    #[arg(long = "lookback-months", default_value_t = 6, env = "DEFAULT_LOOKBACK_MONTHS")]
    pub(crate) lookback_months: u32,

    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = 30, env = "REQUEST_TIMEOUT")]
    pub(crate) request_timeout: u64,

    #[arg(long, default_value_t = 3, env = "MAX_RETRIES")]
    pub(crate) max_retries: u32,

    /// Fixed wait between retries in seconds.
    #[arg(long, default_value_t = 5, env = "RETRY_DELAY")]
    pub(crate) retry_delay: u64,
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }
}

#[cfg(test)]
pub(crate) fn test_config(graph_url: &str) -> Config {
    Config {
        access_token: Some("test_token".to_string()),
        api_version: DEFAULT_API_VERSION.to_string(),
        graph_url: graph_url.to_string(),
        google_credentials_path: GOOGLE_CREDENTIALS_PATH.to_string(),
        sheets_url: DEFAULT_SHEETS_URL.to_string(),
        log_level: LOG_LEVEL.to_string(),
        log_file: None,
        lookback_years: 2,
        lookback_months: 6,
        request_timeout: 30,
        max_retries: 3,
        retry_delay: 5,
    }
}
