use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    classify::{ErrorAnalysis, ErrorCategory},
    pipeline::{ExhaustedMethods, PipelineMethod},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    /// A failure is being handled; a restart may follow.
    Error,
    /// Terminal, no more restarts.
    Failed,
    /// Terminal, stopped on request.
    Stopped,
}

impl SessionStatus {
    /// Whether the session still owns processes or may spawn new ones.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionStatus::Starting | SessionStatus::Running | SessionStatus::Error
        )
    }
}

/// `None` when the process is not part of the current method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Liveness {
    pub decrypt: Option<bool>,
    pub transcode: Option<bool>,
}

/// Mutable state of one session. Written by its monitor task, read by
/// everyone else through [`SessionSnapshot`].
#[derive(Debug)]
pub(crate) struct Session {
    pub stream_id: String,
    pub output_dir: PathBuf,
    pub status: SessionStatus,
    pub method: Option<PipelineMethod>,
    pub restart_count: u32,
    pub last_error: Option<ErrorAnalysis>,
    pub created_at: DateTime<Utc>,
    pub started: Instant,
    pub liveness: Liveness,
    pub exhausted: ExhaustedMethods,
}

impl Session {
    pub fn new(stream_id: String, output_dir: PathBuf) -> Self {
        Self {
            stream_id,
            output_dir,
            status: SessionStatus::Starting,
            method: None,
            restart_count: 0,
            last_error: None,
            created_at: Utc::now(),
            started: Instant::now(),
            liveness: Liveness::default(),
            exhausted: ExhaustedMethods::new(),
        }
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            stream_id: self.stream_id.clone(),
            status: self.status,
            method: self.method,
            restart_count: self.restart_count,
            uptime: self.started.elapsed(),
            output_dir: self.output_dir.clone(),
            liveness: self.liveness,
            last_error: self.last_error.as_ref().map(|e| e.message.clone()),
            error_category: self.last_error.as_ref().map(|e| e.category),
            retry_delay_secs: self.last_error.as_ref().map(|e| e.suggested_delay_secs),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub stream_id: String,
    pub status: SessionStatus,
    pub method: Option<PipelineMethod>,
    pub restart_count: u32,
    pub uptime: Duration,
    pub output_dir: PathBuf,
    pub liveness: Liveness,
    pub last_error: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub retry_delay_secs: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn playlist_path(&self) -> PathBuf {
        self.output_dir.join(crate::pipeline::PLAYLIST_NAME)
    }
}
