use std::{
    collections::VecDeque,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    task::JoinHandle,
};

use crate::{
    error::{GatewayError, GatewayResult},
    pipeline::{CommandSpec, PipelineMethod},
    supervisor::session::Liveness,
    util::remove_file_if_exists,
};

const STDERR_TAIL_LINES: usize = 64;

/// A spawned external process whose stderr is drained into a bounded tail.
pub(crate) struct ManagedProcess {
    name: &'static str,
    child: Child,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_reader: Option<JoinHandle<()>>,
    exit: Option<ExitStatus>,
}

impl ManagedProcess {
    /// Spawns `command`. The command is consumed so that any pipe ends it
    /// still holds are closed in this process once the child is running.
    pub fn spawn(name: &'static str, mut command: Command) -> GatewayResult<Self> {
        let program = command.as_std().get_program().to_string_lossy().into_owned();
        let mut child = command
            .spawn()
            .map_err(|source| GatewayError::ProcessStart { program, source })?;
        drop(command);

        tracing::debug!("Spawned {name} with pid {:?}", child.id());

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_reader = child.stderr.take().map(|stderr| {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "dashgate::process", "[{name}] {line}");
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            })
        });

        Ok(Self {
            name,
            child,
            stderr_tail,
            stderr_reader,
            exit: None,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn take_stdout(&mut self) -> Option<tokio::process::ChildStdout> {
        self.child.stdout.take()
    }

    pub async fn wait(&mut self) -> ExitStatus {
        if let Some(status) = self.exit {
            return status;
        }
        let status = match self.child.wait().await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!("Error waiting for {}: {e}", self.name);
                exit_status_failure()
            }
        };
        self.exit = Some(status);
        status
    }

    /// Non-blocking exit check.
    pub fn poll_exit(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.exit = status,
                Err(e) => {
                    tracing::error!("Error polling {}: {e}", self.name);
                    self.exit = Some(exit_status_failure());
                }
            }
        }
        self.exit
    }

    pub fn is_alive(&mut self) -> bool {
        self.poll_exit().is_none()
    }

    /// The captured stderr tail. Waits briefly for the reader to reach EOF so
    /// the last lines of an exited process are included.
    pub async fn stderr_output(&mut self) -> String {
        if let Some(reader) = self.stderr_reader.take() {
            if tokio::time::timeout(Duration::from_secs(1), reader)
                .await
                .is_err()
            {
                tracing::debug!("stderr of {} still open", self.name);
            }
        }
        let tail = self.stderr_tail.lock();
        tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    /// Graceful termination: SIGTERM, then a forced kill after `grace`.
    pub async fn terminate(&mut self, grace: Duration) {
        if self.poll_exit().is_some() {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: `pid` belongs to a child we have not reaped yet.
            let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if ret != 0 {
                tracing::debug!(
                    "SIGTERM to {} failed: {}",
                    self.name,
                    std::io::Error::last_os_error()
                );
            }
        }
        #[cfg(not(unix))]
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("Stop request to {} failed: {e}", self.name);
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => self.exit = Some(status),
            _ => {
                tracing::warn!("{} did not exit within {grace:?}, killing", self.name);
                if let Err(e) = self.child.kill().await {
                    tracing::error!("Failed to kill {}: {e}", self.name);
                }
                self.exit = self.child.try_wait().ok().flatten();
            }
        }
        if let Some(reader) = self.stderr_reader.take() {
            reader.abort();
        }
    }
}

#[cfg(unix)]
fn exit_status_failure() -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    ExitStatus::from_raw(1 << 8)
}

#[cfg(windows)]
fn exit_status_failure() -> ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    ExitStatus::from_raw(1)
}

/// Exit code for classification. Signals map to `128 + signo` like a shell.
pub(crate) fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Which process of a group exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessRole {
    Downloader,
    Transcoder,
}

#[derive(Debug)]
pub(crate) struct ProcessExit {
    pub role: ProcessRole,
    pub status: ExitStatus,
}

/// The processes of one pipeline attempt, tagged by method.
pub(crate) enum ProcessGroup {
    Direct {
        transcoder: ManagedProcess,
    },
    DecryptThenTranscode {
        transcoder: ManagedProcess,
        decrypted: Vec<PathBuf>,
    },
    DecryptPipe {
        downloader: ManagedProcess,
        transcoder: ManagedProcess,
        /// The downloader finished successfully and the transcoder is
        /// draining the rest of the pipe.
        downloader_done: bool,
    },
}

impl ProcessGroup {
    pub fn spawn_direct(transcoder: &CommandSpec) -> GatewayResult<Self> {
        Ok(ProcessGroup::Direct {
            transcoder: ManagedProcess::spawn("transcoder", transcoder.to_command())?,
        })
    }

    pub fn spawn_files(transcoder: &CommandSpec, decrypted: Vec<PathBuf>) -> GatewayResult<Self> {
        Ok(ProcessGroup::DecryptThenTranscode {
            transcoder: ManagedProcess::spawn("transcoder", transcoder.to_command())?,
            decrypted,
        })
    }

    /// Spawns the downloader with a piped stdout and hands that pipe to the
    /// transcoder as its stdin.
    pub async fn spawn_pipe(
        downloader: &CommandSpec,
        transcoder: &CommandSpec,
        grace: Duration,
    ) -> GatewayResult<Self> {
        let mut downloader_command = downloader.to_command();
        downloader_command.stdout(Stdio::piped());
        let mut downloader = ManagedProcess::spawn("downloader", downloader_command)?;

        let stdin = match downloader.take_stdout() {
            Some(stdout) => stdout.try_into().map_err(|e: std::io::Error| {
                GatewayError::PipeWiring(format!("cannot hand over downloader stdout: {e}"))
            }),
            None => Err(GatewayError::PipeWiring(
                "downloader stdout is not piped".to_string(),
            )),
        };
        let stdin: Stdio = match stdin {
            Ok(stdin) => stdin,
            Err(e) => {
                downloader.terminate(grace).await;
                return Err(e);
            }
        };

        let mut transcoder_command = transcoder.to_command();
        transcoder_command.stdin(stdin);
        // `spawn` consumes the command, closing our copy of the read end so
        // the transcoder sees EOF when the downloader exits.
        let transcoder = match ManagedProcess::spawn("transcoder", transcoder_command) {
            Ok(transcoder) => transcoder,
            Err(e) => {
                downloader.terminate(grace).await;
                return Err(e);
            }
        };

        Ok(ProcessGroup::DecryptPipe {
            downloader,
            transcoder,
            downloader_done: false,
        })
    }

    pub fn method(&self) -> PipelineMethod {
        match self {
            ProcessGroup::Direct { .. } => PipelineMethod::Direct,
            ProcessGroup::DecryptThenTranscode { .. } => PipelineMethod::DecryptThenTranscode,
            ProcessGroup::DecryptPipe { .. } => PipelineMethod::DecryptPipe,
        }
    }

    pub fn process_mut(&mut self, role: ProcessRole) -> Option<&mut ManagedProcess> {
        match (self, role) {
            (ProcessGroup::DecryptPipe { downloader, .. }, ProcessRole::Downloader) => {
                Some(downloader)
            }
            (ProcessGroup::Direct { transcoder }, ProcessRole::Transcoder)
            | (ProcessGroup::DecryptThenTranscode { transcoder, .. }, ProcessRole::Transcoder)
            | (ProcessGroup::DecryptPipe { transcoder, .. }, ProcessRole::Transcoder) => {
                Some(transcoder)
            }
            _ => None,
        }
    }

    pub fn liveness(&mut self) -> Liveness {
        match self {
            ProcessGroup::Direct { transcoder } => Liveness {
                decrypt: None,
                transcode: Some(transcoder.is_alive()),
            },
            ProcessGroup::DecryptThenTranscode { transcoder, .. } => Liveness {
                decrypt: Some(false),
                transcode: Some(transcoder.is_alive()),
            },
            ProcessGroup::DecryptPipe {
                downloader,
                transcoder,
                ..
            } => Liveness {
                decrypt: Some(downloader.is_alive()),
                transcode: Some(transcoder.is_alive()),
            },
        }
    }

    /// Non-blocking: the first process that ended in a way the monitor must
    /// act on. A downloader that exits with 0 is not reported; the
    /// transcoder keeps reading until the pipe drains.
    pub fn poll_exit(&mut self) -> Option<ProcessExit> {
        match self {
            ProcessGroup::Direct { transcoder }
            | ProcessGroup::DecryptThenTranscode { transcoder, .. } => {
                transcoder.poll_exit().map(|status| ProcessExit {
                    role: ProcessRole::Transcoder,
                    status,
                })
            }
            ProcessGroup::DecryptPipe {
                downloader,
                transcoder,
                downloader_done,
            } => {
                if !*downloader_done {
                    if let Some(status) = downloader.poll_exit() {
                        if !status.success() {
                            return Some(ProcessExit {
                                role: ProcessRole::Downloader,
                                status,
                            });
                        }
                        *downloader_done = true;
                    }
                }
                transcoder.poll_exit().map(|status| ProcessExit {
                    role: ProcessRole::Transcoder,
                    status,
                })
            }
        }
    }

    /// Waits for the next exit [`poll_exit`](Self::poll_exit) would report.
    pub async fn wait_exit(&mut self) -> ProcessExit {
        match self {
            ProcessGroup::Direct { transcoder }
            | ProcessGroup::DecryptThenTranscode { transcoder, .. } => ProcessExit {
                role: ProcessRole::Transcoder,
                status: transcoder.wait().await,
            },
            ProcessGroup::DecryptPipe {
                downloader,
                transcoder,
                downloader_done,
            } => loop {
                if *downloader_done {
                    break ProcessExit {
                        role: ProcessRole::Transcoder,
                        status: transcoder.wait().await,
                    };
                }
                tokio::select! {
                    status = downloader.wait() => {
                        if !status.success() {
                            break ProcessExit { role: ProcessRole::Downloader, status };
                        }
                        tracing::debug!("Downloader finished, draining pipe");
                        *downloader_done = true;
                    }
                    status = transcoder.wait() => {
                        break ProcessExit { role: ProcessRole::Transcoder, status };
                    }
                }
            },
        }
    }

    /// Stops every process of the group, downloader first.
    pub async fn terminate(&mut self, grace: Duration) {
        match self {
            ProcessGroup::Direct { transcoder }
            | ProcessGroup::DecryptThenTranscode { transcoder, .. } => {
                transcoder.terminate(grace).await
            }
            ProcessGroup::DecryptPipe {
                downloader,
                transcoder,
                ..
            } => {
                downloader.terminate(grace).await;
                transcoder.terminate(grace).await;
            }
        }
    }

    /// Removes the decrypted intermediate files, if any.
    pub async fn remove_intermediates(&mut self) {
        if let ProcessGroup::DecryptThenTranscode { decrypted, .. } = self {
            for file in decrypted.drain(..) {
                match remove_file_if_exists(&file).await {
                    Ok(()) => tracing::debug!("Removed {}", file.display()),
                    Err(e) => tracing::warn!("Failed to remove {}: {e}", file.display()),
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::ffi::OsString;

    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec![OsString::from("-c"), OsString::from(script)],
        }
    }

    #[tokio::test]
    async fn test_stderr_tail_is_bounded() {
        let mut process = ManagedProcess::spawn(
            "test",
            sh("i=0; while [ $i -lt 100 ]; do echo line$i >&2; i=$((i+1)); done; exit 3")
                .to_command(),
        )
        .unwrap();
        let status = process.wait().await;
        assert_eq!(exit_code(&status), 3);

        let output = process.stderr_output().await;
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines.len(), STDERR_TAIL_LINES);
        assert_eq!(lines.last(), Some(&"line99"));
        assert_eq!(lines.first(), Some(&"line36"));
    }

    #[tokio::test]
    async fn test_missing_program_is_process_start() {
        let spec = CommandSpec {
            program: PathBuf::from("/nonexistent/dashgate-transcoder"),
            args: Vec::new(),
        };
        assert!(matches!(
            ProcessGroup::spawn_direct(&spec),
            Err(GatewayError::ProcessStart { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminate_running_process() {
        let mut group = ProcessGroup::spawn_direct(&sh("sleep 30")).unwrap();
        assert!(group.poll_exit().is_none());
        assert_eq!(group.liveness().transcode, Some(true));

        group.terminate(Duration::from_secs(5)).await;
        let exit = group.poll_exit().unwrap();
        assert_eq!(exit.role, ProcessRole::Transcoder);
        assert!(!exit.status.success());
    }

    #[tokio::test]
    async fn test_pipe_wiring_delivers_eof() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let downloader = sh("printf 'hello pipe'");
        let transcoder = sh(&format!("cat > '{}'", out.display()));

        let mut group = ProcessGroup::spawn_pipe(&downloader, &transcoder, Duration::from_secs(1))
            .await
            .unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(10), group.wait_exit())
            .await
            .expect("transcoder must see EOF");
        assert_eq!(exit.role, ProcessRole::Transcoder);
        assert!(exit.status.success());
        assert_eq!(std::fs::read_to_string(out).unwrap(), "hello pipe");
    }

    #[tokio::test]
    async fn test_pipe_downloader_failure_is_reported() {
        let downloader = sh("echo 'Connection reset by peer' >&2; exit 1");
        let transcoder = sh("cat > /dev/null; sleep 30");

        let mut group = ProcessGroup::spawn_pipe(&downloader, &transcoder, Duration::from_secs(1))
            .await
            .unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(10), group.wait_exit())
            .await
            .unwrap();
        assert_eq!(exit.role, ProcessRole::Downloader);

        let output = group
            .process_mut(ProcessRole::Downloader)
            .unwrap()
            .stderr_output()
            .await;
        assert!(output.contains("Connection reset"));
        group.terminate(Duration::from_secs(1)).await;
    }
}
