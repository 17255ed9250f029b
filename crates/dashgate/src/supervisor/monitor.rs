use std::{path::PathBuf, sync::Arc};

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    process::{exit_code, ProcessExit, ProcessGroup},
    session::{Liveness, Session, SessionStatus},
};
use crate::{
    classify::classify,
    config::{GatewayConfig, StreamConfig},
    dash::ManifestResolver,
    decrypt::{ClearKeyCredential, SegmentDecryptor},
    error::{GatewayError, GatewayResult},
    pipeline::{PipelineMethod, ProcessPlan, StrategySelector, PLAYLIST_NAME},
    retry::RetryDecision,
    util::{http::HttpClient, remove_dir_if_exists},
};

enum Outcome {
    Cancelled,
    /// The transcoder finished its input and exited cleanly.
    Completed,
    Failed(GatewayError),
}

/// Drives one session: launch, wait for the playlist, watch the processes,
/// classify failures and restart within the retry policy.
pub(crate) struct Monitor {
    pub config: Arc<GatewayConfig>,
    pub stream: StreamConfig,
    pub credential: Option<ClearKeyCredential>,
    pub selector: Arc<StrategySelector>,
    pub client: HttpClient,
    pub state: Arc<Mutex<Session>>,
    pub cancel: CancellationToken,
}

impl Monitor {
    fn output_dir(&self) -> PathBuf {
        self.state.lock().output_dir.clone()
    }

    fn license_key(&self) -> Option<&str> {
        self.stream.license_key.as_deref()
    }

    pub async fn run(self) {
        let id = self.stream.id.clone();
        let policy = self.config.supervisor.retry.clone();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let method = {
                let mut state = self.state.lock();
                let method = self.selector.select(self.license_key(), &state.exhausted);
                state.status = SessionStatus::Starting;
                state.method = Some(method);
                state.liveness = Liveness::default();
                method
            };
            tracing::info!("[{id}] Starting pipeline with method {method}");

            let error = match self.attempt(method).await {
                Outcome::Cancelled => break,
                Outcome::Completed => {
                    tracing::info!("[{id}] Transcoder finished, keeping output until stopped");
                    self.cancel.cancelled().await;
                    break;
                }
                Outcome::Failed(error) => error,
            };

            let analysis = error.analysis();
            let restart_count = {
                let mut state = self.state.lock();
                state.status = SessionStatus::Error;
                state.last_error = Some(analysis.clone());
                state.liveness = Liveness::default();
                let method = state.method.unwrap_or(method);
                if self.config.supervisor.pipe_fallback && method != PipelineMethod::Direct {
                    state.exhausted.insert(method);
                }
                state.restart_count
            };
            tracing::warn!(
                "[{id}] Pipeline failed ({}): {error}",
                analysis.category
            );

            match policy.decide(&analysis, restart_count) {
                RetryDecision::Retry { attempt, delay } => {
                    if let Some(last_error) = self.state.lock().last_error.as_mut() {
                        last_error.suggested_delay_secs = delay.as_secs();
                    }
                    tracing::info!(
                        "[{id}] Restart {attempt} in {:.1}s",
                        delay.as_secs_f64()
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    // Stop may have raced with the end of the delay.
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    self.state.lock().restart_count = attempt;
                }
                RetryDecision::GiveUp => {
                    tracing::error!(
                        "[{id}] Giving up after {restart_count} restart(s): {}",
                        analysis.message
                    );
                    let output_dir = self.output_dir();
                    if let Err(e) = remove_dir_if_exists(&output_dir).await {
                        tracing::warn!("[{id}] Failed to remove {}: {e}", output_dir.display());
                    }
                    self.state.lock().status = SessionStatus::Failed;
                    return;
                }
            }
        }

        let mut state = self.state.lock();
        state.status = SessionStatus::Stopped;
        state.liveness = Liveness::default();
    }

    async fn attempt(&self, method: PipelineMethod) -> Outcome {
        if let Err(e) = self.prepare_output_dir().await {
            return Outcome::Failed(e);
        }

        let launched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Outcome::Cancelled,
            launched = self.launch(method) => launched,
        };
        let mut group = match launched {
            Ok(group) => group,
            Err(e) => return Outcome::Failed(e),
        };

        let outcome = self.supervise(&mut group).await;
        group.terminate(self.config.supervisor.grace_period()).await;
        if matches!(outcome, Outcome::Completed) {
            group.remove_intermediates().await;
        }
        outcome
    }

    /// A fresh directory per attempt, so a playlist left by a previous
    /// generation is never mistaken for a new one.
    async fn prepare_output_dir(&self) -> GatewayResult<()> {
        let output_dir = self.output_dir();
        remove_dir_if_exists(&output_dir).await?;
        tokio::fs::create_dir_all(&output_dir).await?;
        Ok(())
    }

    /// Spawns the processes for `method`. A decryption method whose process
    /// cannot be started is marked exhausted and the next method is tried.
    async fn launch(&self, mut method: PipelineMethod) -> GatewayResult<ProcessGroup> {
        loop {
            match self.spawn_method(method).await {
                Err(e @ GatewayError::ProcessStart { .. }) if method != PipelineMethod::Direct => {
                    let mut state = self.state.lock();
                    state.exhausted.insert(method);
                    let next = self.selector.select(self.license_key(), &state.exhausted);
                    state.method = Some(next);
                    tracing::warn!(
                        "[{}] {method} unavailable ({e}), falling back to {next}",
                        self.stream.id
                    );
                    method = next;
                }
                result => return result,
            }
        }
    }

    async fn spawn_method(&self, method: PipelineMethod) -> GatewayResult<ProcessGroup> {
        let output_dir = self.output_dir();
        let plan = ProcessPlan::build(
            method,
            &self.config,
            &self.stream.url,
            self.credential.as_ref(),
            &output_dir,
        );

        match plan {
            ProcessPlan::Direct { transcoder } => ProcessGroup::spawn_direct(&transcoder),
            ProcessPlan::DecryptPipe {
                downloader,
                transcoder,
            } => {
                ProcessGroup::spawn_pipe(
                    &downloader,
                    &transcoder,
                    self.config.supervisor.grace_period(),
                )
                .await
            }
            ProcessPlan::DecryptThenTranscode {
                manifest_url,
                credential,
                decrypt_dir,
            } => {
                self.state.lock().liveness.decrypt = Some(true);
                let model = ManifestResolver::new(self.client.clone())
                    .resolve(&manifest_url)
                    .await?;
                let tracks = SegmentDecryptor::new(self.client.clone(), credential)
                    .with_concurrency(self.config.http.segment_concurrency)
                    .decrypt_manifest(&model, &decrypt_dir)
                    .await?;
                self.state.lock().liveness.decrypt = Some(false);

                let files = tracks.files();
                let transcoder = ProcessPlan::file_transcoder(&self.config, files.clone(), &output_dir);
                ProcessGroup::spawn_files(&transcoder, files)
            }
        }
    }

    async fn supervise(&self, group: &mut ProcessGroup) -> Outcome {
        let ready = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Outcome::Cancelled,
            ready = self.wait_for_playlist(group) => ready,
        };
        if let Err(e) = ready {
            return Outcome::Failed(e);
        }

        {
            let mut state = self.state.lock();
            state.status = SessionStatus::Running;
            state.liveness = group.liveness();
        }
        tracing::info!("[{}] Running ({})", self.stream.id, group.method());

        let exit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Outcome::Cancelled,
            exit = group.wait_exit() => exit,
        };
        self.state.lock().liveness = group.liveness();

        if exit.status.success() {
            Outcome::Completed
        } else {
            Outcome::Failed(failure_from_exit(group, exit).await)
        }
    }

    /// Waits for the playlist after the settle delay. A process exit before
    /// the playlist appears is a failure, and so is the timeout.
    async fn wait_for_playlist(&self, group: &mut ProcessGroup) -> GatewayResult<()> {
        let supervisor = &self.config.supervisor;
        let playlist = self.output_dir().join(PLAYLIST_NAME);
        let deadline = Instant::now() + supervisor.playlist_timeout();

        tokio::time::sleep(supervisor.settle_delay()).await;
        loop {
            let exists = tokio::fs::try_exists(&playlist).await.unwrap_or(false);
            if let Some(exit) = group.poll_exit() {
                if exit.status.success() && exists {
                    return Ok(());
                }
                return Err(failure_from_exit(group, exit).await);
            }
            if exists {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(GatewayError::Timeout {
                    what: "playlist",
                    after: supervisor.playlist_timeout(),
                });
            }
            tokio::time::sleep(supervisor.poll_interval()).await;
        }
    }
}

async fn failure_from_exit(group: &mut ProcessGroup, exit: ProcessExit) -> GatewayError {
    let code = exit_code(&exit.status);
    let (name, output) = match group.process_mut(exit.role) {
        Some(process) => (process.name(), process.stderr_output().await),
        None => ("process", String::new()),
    };
    tracing::debug!("{name} exited with code {code}");
    let mut analysis = classify(&output, code);
    analysis.message = format!("{name} exited with code {code}: {}", analysis.message);
    GatewayError::ProcessExit(analysis)
}
