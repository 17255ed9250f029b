use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
};

use dashgate::{
    pipeline::ToolAvailability, ErrorCategory, Gateway, GatewayConfig, GatewayError,
    PipelineMethod, SessionSnapshot, SessionStatus, StopOutcome, StreamConfig,
};
use tempfile::TempDir;

/// Writes `#EXTM3U` to its last argument, the playlist, and keeps running.
const FAKE_TRANSCODER: &str = r#"#!/bin/sh
for last; do :; done
echo '#EXTM3U' > "$last"
exec sleep 60
"#;

/// Like [`FAKE_TRANSCODER`], but only a forced kill ends it.
const STUBBORN_TRANSCODER: &str = r#"#!/bin/sh
trap '' TERM
for last; do :; done
echo '#EXTM3U' > "$last"
exec sleep 60
"#;

/// Publishes a playlist, runs for a while, then loses its source.
const DROPPING_TRANSCODER: &str = r#"#!/bin/sh
for last; do :; done
echo '#EXTM3U' > "$last"
sleep 0.5
echo 'Connection reset by peer' >&2
exit 1
"#;

/// Keeps the pipe open without writing to it.
const IDLE_DOWNLOADER: &str = r#"#!/bin/sh
exec sleep 60
"#;

const FAILING_DOWNLOADER: &str = r#"#!/bin/sh
echo 'ERROR: Connection reset by peer' >&2
exit 1
"#;

const REFUSED_TRANSCODER: &str = r#"#!/bin/sh
echo 'tcp://origin: Connection refused' >&2
exit 1
"#;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct Fixture {
    dir: TempDir,
    config: GatewayConfig,
}

impl Fixture {
    fn new(transcoder: &str) -> Self {
        crate::init_test_tracing();
        let dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig {
            work_dir: dir.path().join("hls"),
            ..Default::default()
        };
        config.transcoder.program = write_script(dir.path(), "transcoder", transcoder)
            .to_string_lossy()
            .into_owned();
        config.downloader.program = dir
            .path()
            .join("missing-downloader")
            .to_string_lossy()
            .into_owned();
        config.downloader.args = vec!["{url}".to_string()];

        let supervisor = &mut config.supervisor;
        supervisor.settle_delay_ms = 50;
        supervisor.poll_interval_ms = 20;
        supervisor.playlist_timeout_secs = 5;
        supervisor.grace_period_secs = 1;
        supervisor.retry.base_delay_ms = 50;
        supervisor.retry.max_delay_ms = 200;
        supervisor.retry.server_delay_ms = 50;

        Self { dir, config }
    }

    fn with_downloader(mut self, body: &str) -> Self {
        self.config.downloader.program = write_script(self.dir.path(), "downloader", body)
            .to_string_lossy()
            .into_owned();
        self
    }

    fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.config.streams.push(stream);
        self
    }

    fn gateway(&self) -> Gateway {
        let tools = ToolAvailability {
            transcoder: Some(PathBuf::from(&self.config.transcoder.program)),
            downloader: Some(PathBuf::from(&self.config.downloader.program)),
        };
        Gateway::with_tools(self.config.clone(), tools).unwrap()
    }
}

async fn wait_for(
    gateway: &Gateway,
    id: &str,
    what: &str,
    done: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if let Some(snapshot) = gateway.get_status(id) {
                if done(&snapshot) {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{id} never reached {what}: {:?}", gateway.get_status(id)))
}

async fn wait_for_status(gateway: &Gateway, id: &str, status: SessionStatus) -> SessionSnapshot {
    wait_for(gateway, id, &format!("{status:?}"), |s| s.status == status).await
}

#[tokio::test]
async fn direct_stream_runs_and_stops() -> anyhow::Result<()> {
    let fixture = Fixture::new(FAKE_TRANSCODER)
        .with_stream(StreamConfig::new("plain", "https://origin.invalid/plain.mpd"));
    let gateway = fixture.gateway();

    let output_dir = gateway.start_stream("plain").await?;
    assert_eq!(
        gateway.get_status("plain").map(|s| s.status).unwrap(),
        SessionStatus::Starting
    );

    let playlist = gateway
        .wait_until_ready("plain", Duration::from_secs(10))
        .await?;
    assert_eq!(playlist, output_dir.join("playlist.m3u8"));
    assert_eq!(std::fs::read_to_string(&playlist)?.trim(), "#EXTM3U");

    let snapshot = gateway.get_status("plain").unwrap();
    assert_eq!(snapshot.status, SessionStatus::Running);
    assert_eq!(snapshot.method, Some(PipelineMethod::Direct));
    assert_eq!(snapshot.restart_count, 0);
    assert_eq!(snapshot.liveness.transcode, Some(true));
    assert_eq!(snapshot.liveness.decrypt, None);

    let health = gateway.health();
    assert_eq!(health.active_sessions, 1);
    assert_eq!(health.total_sessions, 1);

    // A second start while running is rejected.
    assert!(matches!(
        gateway.start_stream("plain").await,
        Err(GatewayError::AlreadyRunning(_))
    ));

    assert_eq!(gateway.stop_stream("plain").await?, StopOutcome::Stopped);
    assert!(gateway.get_status("plain").is_none());
    assert!(!output_dir.exists());
    assert_eq!(gateway.health().active_sessions, 0);

    assert_eq!(
        gateway.stop_stream("plain").await?,
        StopOutcome::AlreadyStopped
    );
    Ok(())
}

#[tokio::test]
async fn start_rejects_bad_requests() {
    let fixture = Fixture::new(FAKE_TRANSCODER)
        .with_stream(StreamConfig {
            enabled: false,
            ..StreamConfig::new("off", "https://origin.invalid/off.mpd")
        })
        .with_stream(
            StreamConfig::new("broken", "https://origin.invalid/broken.mpd")
                .with_license_key("not-a-key"),
        );
    let gateway = fixture.gateway();

    assert!(matches!(
        gateway.start_stream("nope").await,
        Err(GatewayError::StreamNotFound(_))
    ));
    assert!(matches!(
        gateway.start_stream("off").await,
        Err(GatewayError::StreamDisabled(_))
    ));
    assert!(matches!(
        gateway.start_stream("broken").await,
        Err(GatewayError::CredentialFormat(_))
    ));
    assert!(gateway.list_sessions().is_empty());
    assert_eq!(
        gateway.stop_stream("nope").await.unwrap(),
        StopOutcome::AlreadyStopped
    );
}

#[tokio::test]
async fn pipe_network_failure_gives_up_after_two_restarts() -> anyhow::Result<()> {
    let fixture = Fixture::new(FAKE_TRANSCODER)
        .with_downloader(FAILING_DOWNLOADER)
        .with_stream(
            StreamConfig::new("flaky", "https://origin.invalid/flaky.mpd")
                .with_license_key(crate::license_key()),
        );
    let gateway = fixture.gateway();

    let output_dir = gateway.start_stream("flaky").await?;
    let snapshot = wait_for_status(&gateway, "flaky", SessionStatus::Failed).await;

    assert_eq!(snapshot.method, Some(PipelineMethod::DecryptPipe));
    assert_eq!(snapshot.restart_count, 2);
    assert_eq!(snapshot.error_category, Some(ErrorCategory::ConnectionReset));
    assert!(snapshot.last_error.unwrap().contains("downloader exited with code 1"));
    assert!(!output_dir.exists());

    // The failed record stays visible and does not count as active.
    assert_eq!(gateway.health().active_sessions, 0);
    assert_eq!(gateway.list_sessions().len(), 1);
    assert!(gateway
        .wait_until_ready("flaky", Duration::from_secs(1))
        .await
        .is_err());

    // A failed session can be started again.
    gateway.start_stream("flaky").await?;
    assert_eq!(gateway.get_status("flaky").unwrap().restart_count, 0);
    gateway.stop_stream("flaky").await?;
    Ok(())
}

#[tokio::test]
async fn stop_during_retry_delay_prevents_respawn() -> anyhow::Result<()> {
    let mut fixture = Fixture::new(REFUSED_TRANSCODER)
        .with_stream(StreamConfig::new("down", "https://origin.invalid/down.mpd"));
    fixture.config.supervisor.retry.base_delay_ms = 60_000;
    fixture.config.supervisor.retry.max_delay_ms = 60_000;
    let gateway = fixture.gateway();

    let output_dir = gateway.start_stream("down").await?;
    let snapshot = wait_for_status(&gateway, "down", SessionStatus::Error).await;
    assert_eq!(
        snapshot.error_category,
        Some(ErrorCategory::ConnectionRefused)
    );
    assert_eq!(snapshot.restart_count, 0);

    // The snapshot reports the delay the monitor actually waits.
    wait_for(&gateway, "down", "a 60s retry delay", |s| {
        s.retry_delay_secs == Some(60)
    })
    .await;

    let stopped = tokio::time::timeout(Duration::from_secs(5), gateway.stop_stream("down"))
        .await
        .expect("stop must not wait for the retry delay")?;
    assert_eq!(stopped, StopOutcome::Stopped);
    assert!(gateway.get_status("down").is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(gateway.get_status("down").is_none());
    assert!(!output_dir.exists());
    Ok(())
}

#[tokio::test]
async fn missing_downloader_falls_back_to_in_process_decryption() -> anyhow::Result<()> {
    let (uri, _server) = crate::setup_protected_stream().await;
    let fixture = Fixture::new(FAKE_TRANSCODER)
        .with_stream(StreamConfig::new("secure", uri).with_license_key(crate::license_key()));
    let gateway = fixture.gateway();

    let output_dir = gateway.start_stream("secure").await?;
    gateway
        .wait_until_ready("secure", Duration::from_secs(10))
        .await?;

    let snapshot = gateway.get_status("secure").unwrap();
    assert_eq!(snapshot.method, Some(PipelineMethod::DecryptThenTranscode));
    assert_eq!(snapshot.restart_count, 0);
    assert_eq!(snapshot.liveness.decrypt, Some(false));
    assert_eq!(snapshot.liveness.transcode, Some(true));

    let decrypted = output_dir.join(".decrypted");
    assert_eq!(
        std::fs::read(decrypted.join("video_decrypted.mp4"))?,
        crate::expected_video()
    );
    assert_eq!(
        std::fs::read(decrypted.join("audio_decrypted.mp4"))?,
        crate::expected_audio()
    );

    gateway.stop_stream("secure").await?;
    assert!(!output_dir.exists());
    Ok(())
}

#[tokio::test]
async fn sweep_reclaims_old_sessions() -> anyhow::Result<()> {
    let fixture = Fixture::new(FAKE_TRANSCODER)
        .with_stream(StreamConfig::new("old", "https://origin.invalid/old.mpd"));
    let gateway = fixture.gateway();

    gateway.start_stream("old").await?;
    gateway
        .wait_until_ready("old", Duration::from_secs(10))
        .await?;

    assert!(gateway.sweep_stale(Duration::from_secs(3600)).await.is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        gateway.sweep_stale(Duration::from_millis(10)).await,
        vec!["old".to_string()]
    );
    assert!(gateway.get_status("old").is_none());
    Ok(())
}

#[tokio::test]
async fn pipe_stream_runs_with_both_processes() -> anyhow::Result<()> {
    let fixture = Fixture::new(FAKE_TRANSCODER)
        .with_downloader(IDLE_DOWNLOADER)
        .with_stream(
            StreamConfig::new("piped", "https://origin.invalid/piped.mpd")
                .with_license_key(crate::license_key()),
        );
    let gateway = fixture.gateway();

    let output_dir = gateway.start_stream("piped").await?;
    gateway
        .wait_until_ready("piped", Duration::from_secs(10))
        .await?;

    let snapshot = gateway.get_status("piped").unwrap();
    assert_eq!(snapshot.status, SessionStatus::Running);
    assert_eq!(snapshot.method, Some(PipelineMethod::DecryptPipe));
    assert_eq!(snapshot.liveness.decrypt, Some(true));
    assert_eq!(snapshot.liveness.transcode, Some(true));
    assert_eq!(snapshot.restart_count, 0);

    assert_eq!(gateway.stop_stream("piped").await?, StopOutcome::Stopped);
    assert!(!output_dir.exists());
    Ok(())
}

#[tokio::test]
async fn restart_count_survives_successful_runs() -> anyhow::Result<()> {
    let fixture = Fixture::new(DROPPING_TRANSCODER)
        .with_stream(StreamConfig::new("drops", "https://origin.invalid/drops.mpd"));
    let gateway = fixture.gateway();

    gateway.start_stream("drops").await?;
    let first = wait_for_status(&gateway, "drops", SessionStatus::Running).await;
    assert_eq!(first.restart_count, 0);

    // The second generation reaches Running without resetting the counter.
    wait_for(&gateway, "drops", "a second run", |s| {
        s.status == SessionStatus::Running && s.restart_count == 1
    })
    .await;

    let failed = wait_for_status(&gateway, "drops", SessionStatus::Failed).await;
    assert_eq!(failed.restart_count, 2);
    assert_eq!(failed.error_category, Some(ErrorCategory::ConnectionReset));
    Ok(())
}

#[tokio::test]
async fn pipe_fallback_moves_on_after_runtime_failure() -> anyhow::Result<()> {
    let (uri, _server) = crate::setup_protected_stream().await;
    let mut fixture = Fixture::new(FAKE_TRANSCODER)
        .with_downloader(FAILING_DOWNLOADER)
        .with_stream(StreamConfig::new("fallback", uri).with_license_key(crate::license_key()));
    fixture.config.supervisor.pipe_fallback = true;
    let gateway = fixture.gateway();

    gateway.start_stream("fallback").await?;
    let snapshot = wait_for(&gateway, "fallback", "running in-process", |s| {
        s.status == SessionStatus::Running
            && s.method == Some(PipelineMethod::DecryptThenTranscode)
    })
    .await;
    assert_eq!(snapshot.restart_count, 1);
    assert_eq!(snapshot.error_category, Some(ErrorCategory::ConnectionReset));

    gateway.stop_stream("fallback").await?;
    Ok(())
}

#[tokio::test]
async fn start_waits_for_previous_stop() -> anyhow::Result<()> {
    let fixture = Fixture::new(STUBBORN_TRANSCODER)
        .with_stream(StreamConfig::new("s", "https://origin.invalid/s.mpd"));
    let gateway = fixture.gateway();

    let output_dir = gateway.start_stream("s").await?;
    gateway.wait_until_ready("s", Duration::from_secs(10)).await?;

    let stopping = tokio::spawn({
        let gateway = gateway.clone();
        async move { gateway.stop_stream("s").await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The old generation still holds the output directory.
    assert!(matches!(
        gateway.start_stream("s").await,
        Err(GatewayError::Stopping(_))
    ));
    assert_eq!(stopping.await??, StopOutcome::Stopped);
    assert!(!output_dir.exists());

    gateway.start_stream("s").await?;
    let playlist = gateway.wait_until_ready("s", Duration::from_secs(10)).await?;
    assert!(playlist.exists());
    assert_eq!(
        gateway.get_status("s").map(|s| s.status),
        Some(SessionStatus::Running)
    );
    gateway.stop_stream("s").await?;
    Ok(())
}

#[tokio::test]
async fn stream_ids_cannot_escape_work_dir() -> anyhow::Result<()> {
    let fixture = Fixture::new(FAKE_TRANSCODER);
    let victim = fixture.dir.path().join("victim");
    std::fs::create_dir_all(&victim)?;
    std::fs::write(victim.join("precious.txt"), "keep")?;
    let gateway = fixture.gateway();

    for id in ["../victim", "/tmp", "a/b", ".."] {
        assert!(matches!(
            gateway.upsert_stream(StreamConfig::new(id, "https://origin.invalid/x.mpd")),
            Err(GatewayError::Config(_))
        ));
    }
    assert!(matches!(
        gateway.start_stream("../victim").await,
        Err(GatewayError::StreamNotFound(_))
    ));

    let mut escaping = fixture.config.clone();
    escaping
        .streams
        .push(StreamConfig::new("../victim", "https://origin.invalid/x.mpd"));
    assert!(matches!(
        Gateway::with_tools(escaping, ToolAvailability::default()),
        Err(GatewayError::Config(_))
    ));

    assert!(victim.join("precious.txt").exists());
    Ok(())
}
