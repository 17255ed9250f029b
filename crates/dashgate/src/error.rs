use std::time::Duration;

use thiserror::Error;

use crate::classify::{ErrorAnalysis, ErrorCategory};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Manifest fetch failed ({url}): HTTP {status}")]
    ManifestFetch {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("Invalid manifest: {0}")]
    ManifestParse(String),

    #[error("Segment download failed ({url}): {reason}")]
    SegmentDownload { url: String, reason: String },

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid ClearKey credential: {0}")]
    CredentialFormat(String),

    #[error("Failed to start {program}: {source}")]
    ProcessStart {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{}", .0.message)]
    ProcessExit(ErrorAnalysis),

    #[error("Failed to connect process pipes: {0}")]
    PipeWiring(String),

    #[error("{what} timed out after {}s", .after.as_secs())]
    Timeout { what: &'static str, after: Duration },

    #[error("Stream {0} is not configured")]
    StreamNotFound(String),

    #[error("Stream {0} is disabled")]
    StreamDisabled(String),

    #[error("Stream {0} is already running")]
    AlreadyRunning(String),

    #[error("Stream {0} is still stopping")]
    Stopping(String),

    #[error("Failed to stop stream {id}: {reason}")]
    StopFailed { id: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    TomlError(#[from] toml::de::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Maps an in-process failure onto the same analysis shape the classifier
    /// produces for process output, so a single retry policy covers both.
    pub fn analysis(&self) -> ErrorAnalysis {
        match self {
            GatewayError::ProcessExit(analysis) => analysis.clone(),
            GatewayError::ManifestFetch { status, .. } => {
                ErrorAnalysis::from_category(category_for_status(*status), self.to_string())
            }
            GatewayError::SegmentDownload { reason, .. } => {
                // Reasons carry either an HTTP status or the transport error text.
                let analysis = crate::classify::classify(reason, -1);
                ErrorAnalysis::from_category(analysis.category, self.to_string())
            }
            GatewayError::RequestError(e) => {
                let category = if e.is_timeout() {
                    ErrorCategory::Timeout
                } else if e.is_connect() {
                    ErrorCategory::ConnectionRefused
                } else if let Some(status) = e.status() {
                    category_for_status(status)
                } else {
                    crate::classify::classify(&e.to_string(), -1).category
                };
                ErrorAnalysis::from_category(category, self.to_string())
            }
            GatewayError::Timeout { .. } => {
                ErrorAnalysis::from_category(ErrorCategory::Timeout, self.to_string())
            }
            GatewayError::ManifestParse(_) => {
                ErrorAnalysis::from_category(ErrorCategory::InvalidData, self.to_string())
            }
            GatewayError::Decryption(_) => {
                ErrorAnalysis::from_category(ErrorCategory::Decryption, self.to_string())
            }
            GatewayError::CredentialFormat(_) => {
                ErrorAnalysis::from_category(ErrorCategory::Credential, self.to_string())
            }
            GatewayError::ProcessStart { .. } => {
                ErrorAnalysis::from_category(ErrorCategory::ProcessStart, self.to_string())
            }
            GatewayError::IOError(e) => {
                let category = match e.kind() {
                    std::io::ErrorKind::PermissionDenied => ErrorCategory::PermissionDenied,
                    std::io::ErrorKind::BrokenPipe => ErrorCategory::Unknown,
                    _ => crate::classify::classify(&e.to_string(), -1).category,
                };
                ErrorAnalysis::from_category(category, self.to_string())
            }
            _ => crate::classify::classify(&self.to_string(), -1),
        }
    }
}

fn category_for_status(status: reqwest::StatusCode) -> ErrorCategory {
    match status.as_u16() {
        403 => ErrorCategory::Forbidden,
        404 | 410 => ErrorCategory::NotFound,
        code if code >= 500 => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}
