use datafusion::{arrow::error::ArrowError, error::DataFusionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("DataFusion: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("Arrow: {0}")]
    Arrow(#[from] ArrowError),

    #[error("'The date supplied {date} is invalid, expected YYYY-MM-DD'")]
    InvalidDate { date: String },

    #[error("The start date: '{start_date}' is greater than the end date: '{end_date}'")]
    StartDateAfterEndDate {
        start_date: String,
        end_date: String,
    },

    #[error("Graph API still failing after {attempts} attempts (last status: {}): {body}", display_status(.status))]
    TransientApi {
        status: Option<u16>,
        body: String,
        attempts: u32,
    },

    #[error("Graph API rejected the request with status {status}: {message}")]
    PermanentApi { status: u16, message: String },

    #[error("Request could not be sent: {0}")]
    Transport(#[from] TransportError),

    #[error("HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse URL: {0}")]
    UrlParsingFailed(#[from] url::ParseError),

    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Google authentication failed: {message}")]
    GoogleAuth { message: String },

    #[error("Chart rendering failed: {message}")]
    Chart { message: String },

    #[error("Export file not found: {path}")]
    ExportFileNotFound { path: String },

    #[error("Malformed export row {row}: {message}")]
    MalformedRow { row: usize, message: String },

    #[error("{message}")]
    NoData { message: String },
}

impl Error {
    /// True for the errors raised by local date validation.
    pub fn is_invalid_range(&self) -> bool {
        matches!(
            self,
            Error::InvalidDate { .. } | Error::StartDateAfterEndDate { .. }
        )
    }
}

fn display_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "none".to_string(),
    }
}

/// Failure below the HTTP layer, before any status code was received.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout(_) | TransportError::Connect(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}
