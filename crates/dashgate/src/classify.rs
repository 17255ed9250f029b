//! Failure classification for supervised processes.
//!
//! The classifier scans the lower-cased output of a failed process against an
//! ordered rule table. The first rule with a matching pattern decides the
//! [`ErrorCategory`]; retryability and the base delay are properties of the
//! category alone, so the result only depends on `(output, exit_code)`.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ConnectionReset,
    ConnectionRefused,
    Timeout,
    Forbidden,
    NotFound,
    ServerError,
    Tls,
    InvalidData,
    MissingDecoder,
    Decryption,
    PermissionDenied,
    DiskFull,
    /// The executable is missing or could not be launched.
    ProcessStart,
    /// The configured license key is malformed.
    Credential,
    Unknown,
}

impl ErrorCategory {
    /// Connection, timeout and TLS failures.
    pub fn is_network(self) -> bool {
        matches!(
            self,
            ErrorCategory::ConnectionReset
                | ErrorCategory::ConnectionRefused
                | ErrorCategory::Timeout
                | ErrorCategory::Tls
        )
    }

    /// Configuration or source problems that a restart cannot fix.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            ErrorCategory::Forbidden
                | ErrorCategory::NotFound
                | ErrorCategory::MissingDecoder
                | ErrorCategory::PermissionDenied
                | ErrorCategory::DiskFull
                | ErrorCategory::ProcessStart
                | ErrorCategory::Credential
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCategory::ConnectionReset => {
                "connection reset by the source, the origin or network is unstable"
            }
            ErrorCategory::ConnectionRefused => "connection refused by the source server",
            ErrorCategory::Timeout => "the source did not respond in time",
            ErrorCategory::Forbidden => "access forbidden, authentication may be required",
            ErrorCategory::NotFound => "resource not found, the source URL may have expired",
            ErrorCategory::ServerError => "the source server returned an internal error",
            ErrorCategory::Tls => "TLS/SSL handshake or certificate failure",
            ErrorCategory::InvalidData => "the input data is corrupt or invalid",
            ErrorCategory::MissingDecoder => "no decoder available for the input format",
            ErrorCategory::Decryption => "decryption failed, check the license key",
            ErrorCategory::PermissionDenied => "permission denied on the output location",
            ErrorCategory::DiskFull => "no space left on the output device",
            ErrorCategory::ProcessStart => "the external tool could not be started",
            ErrorCategory::Credential => "the ClearKey license key is malformed",
            ErrorCategory::Unknown => "unknown error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorCategory::ConnectionReset => "connection-reset",
            ErrorCategory::ConnectionRefused => "connection-refused",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Forbidden => "forbidden",
            ErrorCategory::NotFound => "not-found",
            ErrorCategory::ServerError => "server-error",
            ErrorCategory::Tls => "tls",
            ErrorCategory::InvalidData => "invalid-data",
            ErrorCategory::MissingDecoder => "missing-decoder",
            ErrorCategory::Decryption => "decryption",
            ErrorCategory::PermissionDenied => "permission-denied",
            ErrorCategory::DiskFull => "disk-full",
            ErrorCategory::ProcessStart => "process-start",
            ErrorCategory::Credential => "credential",
            ErrorCategory::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorAnalysis {
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
    /// First-restart delay under the default policy. A supervised session
    /// overwrites it with the delay it actually waits.
    pub suggested_delay_secs: u64,
}

impl ErrorAnalysis {
    pub fn from_category(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            retryable: category.is_retryable(),
            suggested_delay_secs: crate::retry::RetryPolicy::default()
                .backoff(category, 1)
                .as_secs(),
        }
    }
}

/// Ordered `(patterns, category)` pairs. Earlier rows win.
const RULES: &[(&[&str], ErrorCategory)] = &[
    (
        &["connection reset", "econnreset"],
        ErrorCategory::ConnectionReset,
    ),
    (
        &["connection refused", "econnrefused"],
        ErrorCategory::ConnectionRefused,
    ),
    (&["timed out", "timeout"], ErrorCategory::Timeout),
    (&["403", "forbidden"], ErrorCategory::Forbidden),
    (&["404", "not found"], ErrorCategory::NotFound),
    (
        &[
            "500",
            "502",
            "503",
            "server error",
            "bad gateway",
            "service unavailable",
        ],
        ErrorCategory::ServerError,
    ),
    (&["ssl", "tls", "certificate"], ErrorCategory::Tls),
    (
        &["invalid data", "corrupt", "moov atom not found"],
        ErrorCategory::InvalidData,
    ),
    (
        &[
            "decoder not found",
            "unknown decoder",
            "no decoder",
            "unsupported codec",
            "unsupported format",
        ],
        ErrorCategory::MissingDecoder,
    ),
    (&["decrypt"], ErrorCategory::Decryption),
    (&["permission denied"], ErrorCategory::PermissionDenied),
    (
        &["no space left", "disk full", "disk quota"],
        ErrorCategory::DiskFull,
    ),
];

pub fn categorize(output: &str) -> ErrorCategory {
    let output = output.to_lowercase();
    RULES
        .iter()
        .find(|(patterns, _)| patterns.iter().any(|p| output.contains(p)))
        .map(|(_, category)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

/// Classifies the captured output and exit code of a failed process.
pub fn classify(output: &str, exit_code: i32) -> ErrorAnalysis {
    let category = categorize(output);
    let message = match category {
        ErrorCategory::Unknown => format!("{} (exit code {exit_code})", category.description()),
        _ => category.description().to_string(),
    };
    ErrorAnalysis::from_category(category, message)
}
