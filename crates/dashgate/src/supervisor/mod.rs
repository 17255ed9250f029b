//! Session supervision.
//!
//! Every started stream gets a [`Session`](session::Session) in the registry
//! and one monitor task that owns the session's processes. The control
//! surface in [`Gateway`] only talks to the registry and to the session's
//! cancellation token, so it never blocks on a process.

mod monitor;
mod process;
mod registry;
pub mod session;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use self::{
    monitor::Monitor,
    registry::{InsertRejected, SessionHandle, SessionRegistry},
    session::Session,
};
pub use self::session::{Liveness, SessionSnapshot, SessionStatus};
use crate::{
    classify::ErrorAnalysis,
    config::{GatewayConfig, StreamConfig},
    decrypt::ClearKeyCredential,
    error::{GatewayError, GatewayResult},
    pipeline::{StrategySelector, ToolAvailability},
    util::{http::HttpClient, remove_dir_if_exists},
};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    /// There was no session to stop.
    AlreadyStopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub active_sessions: usize,
    pub total_sessions: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityReport {
    pub url: String,
    pub reachable: bool,
    pub status: Option<u16>,
    pub error: Option<ErrorAnalysis>,
}

struct GatewayInner {
    config: Arc<GatewayConfig>,
    streams: RwLock<HashMap<String, StreamConfig>>,
    registry: SessionRegistry,
    selector: Arc<StrategySelector>,
    client: HttpClient,
}

/// Control surface of the gateway. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    /// Detects the external tools on `PATH` and builds the gateway.
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        let tools = ToolAvailability::detect(&config);
        Self::with_tools(config, tools)
    }

    pub fn with_tools(config: GatewayConfig, tools: ToolAvailability) -> GatewayResult<Self> {
        config.validate()?;
        let client = HttpClient::new(&config.http)?;
        let streams = config
            .streams
            .iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect();

        Ok(Self {
            inner: Arc::new(GatewayInner {
                config: Arc::new(config),
                streams: RwLock::new(streams),
                registry: SessionRegistry::default(),
                selector: Arc::new(StrategySelector::new(tools)),
                client,
            }),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn tools(&self) -> ToolAvailability {
        self.inner.selector.tools().clone()
    }

    pub fn streams(&self) -> Vec<StreamConfig> {
        let mut streams: Vec<_> = self.inner.streams.read().values().cloned().collect();
        streams.sort_by(|a, b| a.id.cmp(&b.id));
        streams
    }

    /// Adds or replaces a stream definition. A running session keeps the
    /// definition it was started with.
    pub fn upsert_stream(&self, stream: StreamConfig) -> GatewayResult<()> {
        stream.validate_id()?;
        self.inner.streams.write().insert(stream.id.clone(), stream);
        Ok(())
    }

    pub fn remove_stream(&self, stream_id: &str) -> Option<StreamConfig> {
        self.inner.streams.write().remove(stream_id)
    }

    /// Starts supervising `stream_id` and returns its output directory
    /// immediately; the session begins in `Starting`.
    pub async fn start_stream(&self, stream_id: &str) -> GatewayResult<PathBuf> {
        let stream = self
            .inner
            .streams
            .read()
            .get(stream_id)
            .cloned()
            .ok_or_else(|| GatewayError::StreamNotFound(stream_id.to_string()))?;
        if !stream.enabled {
            return Err(GatewayError::StreamDisabled(stream_id.to_string()));
        }

        let credential = match stream.license_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => Some(key.parse::<ClearKeyCredential>()?),
            _ => None,
        };

        let output_dir = self.inner.config.output_dir(stream_id);
        tokio::fs::create_dir_all(&self.inner.config.work_dir).await?;

        let replaced = self
            .inner
            .registry
            .insert_if_inactive(stream_id, || {
                let state = Arc::new(Mutex::new(Session::new(
                    stream_id.to_string(),
                    output_dir.clone(),
                )));
                let cancel = CancellationToken::new();
                let monitor = Monitor {
                    config: self.inner.config.clone(),
                    stream,
                    credential,
                    selector: self.inner.selector.clone(),
                    client: self.inner.client.clone(),
                    state: state.clone(),
                    cancel: cancel.clone(),
                };
                SessionHandle {
                    generation: self.inner.registry.next_generation(),
                    state,
                    cancel,
                    task: tokio::spawn(monitor.run()),
                }
            })
            .map_err(|rejected| match rejected {
                InsertRejected::Active => GatewayError::AlreadyRunning(stream_id.to_string()),
                InsertRejected::Stopping => GatewayError::Stopping(stream_id.to_string()),
            })?;

        if let Some(previous) = replaced {
            tracing::debug!(
                "Replaced finished session {} of {stream_id}",
                previous.generation
            );
        }
        tracing::info!("Started stream {stream_id} into {}", output_dir.display());
        Ok(output_dir)
    }

    /// Stops a session: signal, grace period, kill, then the output
    /// directory is deleted. Unknown sessions report `AlreadyStopped`.
    ///
    /// The stream cannot be started again until this returns.
    pub async fn stop_stream(&self, stream_id: &str) -> GatewayResult<StopOutcome> {
        let Some((mut handle, _stopping)) = self.inner.registry.begin_stop(stream_id) else {
            return Ok(StopOutcome::AlreadyStopped);
        };
        let was_active = handle.state.lock().status.is_active();
        handle.cancel.cancel();

        let supervisor = &self.inner.config.supervisor;
        // Downloader and transcoder may each use the full grace period.
        let join_timeout = supervisor.grace_period() * 2 + CONTROL_TIMEOUT;
        let joined = tokio::time::timeout(join_timeout, &mut handle.task).await;

        let output_dir = handle.state.lock().output_dir.clone();
        if let Err(e) = remove_dir_if_exists(&output_dir).await {
            tracing::warn!("Failed to remove {}: {e}", output_dir.display());
        }

        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(GatewayError::StopFailed {
                    id: stream_id.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                tracing::warn!("Monitor of {stream_id} did not finish in time, aborting");
                handle.task.abort();
            }
        }

        tracing::info!("Stopped stream {stream_id}");
        Ok(if was_active {
            StopOutcome::Stopped
        } else {
            StopOutcome::AlreadyStopped
        })
    }

    /// Starts every enabled stream. Failures are logged and skipped.
    pub async fn start_enabled(&self) -> Vec<String> {
        let mut started = Vec::new();
        for stream in self.streams().into_iter().filter(|s| s.enabled) {
            match self.start_stream(&stream.id).await {
                Ok(_) => started.push(stream.id),
                Err(e) => tracing::error!("Failed to start {}: {e}", stream.display_name()),
            }
        }
        started
    }

    pub async fn stop_all(&self) {
        for id in self.inner.registry.ids() {
            if let Err(e) = self.stop_stream(&id).await {
                tracing::error!("{e}");
            }
        }
    }

    pub fn get_status(&self, stream_id: &str) -> Option<SessionSnapshot> {
        self.inner.registry.get(stream_id)
    }

    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        self.inner.registry.list()
    }

    /// Waits until the session is running and its playlist exists, the way
    /// an HTTP handler would before redirecting a player to it.
    pub async fn wait_until_ready(
        &self,
        stream_id: &str,
        timeout: Duration,
    ) -> GatewayResult<PathBuf> {
        let wait = async {
            loop {
                let snapshot = self
                    .get_status(stream_id)
                    .ok_or_else(|| GatewayError::StreamNotFound(stream_id.to_string()))?;
                match snapshot.status {
                    SessionStatus::Running => {
                        let playlist = snapshot.playlist_path();
                        if tokio::fs::try_exists(&playlist).await.unwrap_or(false) {
                            return Ok(playlist);
                        }
                    }
                    SessionStatus::Failed | SessionStatus::Stopped => {
                        let last_error = self
                            .inner
                            .registry
                            .last_error(stream_id)
                            .unwrap_or_else(|| {
                                ErrorAnalysis::from_category(
                                    crate::classify::ErrorCategory::Unknown,
                                    format!("session {stream_id} ended"),
                                )
                            });
                        return Err(GatewayError::ProcessExit(last_error));
                    }
                    SessionStatus::Starting | SessionStatus::Error => {}
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| GatewayError::Timeout {
                what: "playlist",
                after: timeout,
            })?
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            active_sessions: self.inner.registry.count_active(),
            total_sessions: self.inner.registry.len(),
            timestamp: Utc::now(),
        }
    }

    /// Pre-flight reachability check of a source URL.
    pub async fn check_connectivity(&self, url: &str) -> ConnectivityReport {
        match self.inner.client.probe(url, CONTROL_TIMEOUT).await {
            Ok(status) => ConnectivityReport {
                url: url.to_string(),
                reachable: (200..400).contains(&status),
                status: Some(status),
                error: None,
            },
            Err(e) => ConnectivityReport {
                url: url.to_string(),
                reachable: false,
                status: None,
                error: Some(e.analysis()),
            },
        }
    }

    /// Stops every session created more than `max_age` ago.
    pub async fn sweep_stale(&self, max_age: Duration) -> Vec<String> {
        let stale = self.inner.registry.older_than(max_age);
        for id in &stale {
            tracing::info!("Reclaiming stale session {id}");
            if let Err(e) = self.stop_stream(id).await {
                tracing::error!("{e}");
            }
        }
        stale
    }

    /// Runs [`sweep_stale`](Self::sweep_stale) periodically until `shutdown`
    /// is cancelled.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            let supervisor = &gateway.inner.config.supervisor;
            let mut interval = tokio::time::interval(supervisor.sweep_interval());
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        gateway.sweep_stale(supervisor.session_max_age()).await;
                    }
                }
            }
        })
    }

    pub fn output_dir(&self, stream_id: &str) -> PathBuf {
        self.inner.config.output_dir(stream_id)
    }

    pub fn work_dir(&self) -> &Path {
        &self.inner.config.work_dir
    }
}
