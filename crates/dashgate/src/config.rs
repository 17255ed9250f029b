use std::{
    collections::HashSet,
    path::{Component, Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{GatewayError, GatewayResult},
    retry::RetryPolicy,
};

const KODI_PROP_PREFIX: &str = "#KODIPROP:";

fn default_true() -> bool {
    true
}

/// A configured source. Owned by whoever manages stream definitions, the
/// gateway only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    /// `<key_id_hex>:<key_hex>`
    #[serde(default)]
    pub license_key: Option<String>,
    #[serde(default)]
    pub manifest_type: Option<String>,
    #[serde(default)]
    pub license_type: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl StreamConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            url: url.into(),
            license_key: None,
            manifest_type: None,
            license_type: None,
            enabled: true,
        }
    }

    /// The id names the output directory under the work dir, so it must be a
    /// single plain path component.
    pub fn validate_id(&self) -> GatewayResult<()> {
        let id = self.id.as_str();
        if id.is_empty() {
            return Err(GatewayError::Config("stream id must not be empty".into()));
        }
        let mut components = Path::new(id).components();
        let plain = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(c)), None) if c == id
        );
        if !plain || id.contains(['/', '\\']) {
            return Err(GatewayError::Config(format!(
                "stream id {id:?} must be a single path component"
            )));
        }
        Ok(())
    }

    pub fn with_license_key(mut self, license_key: impl Into<String>) -> Self {
        self.license_key = Some(license_key.into());
        self
    }

    /// Builds a stream from Kodi `inputstream.adaptive` property text:
    ///
    /// ```text
    /// #KODIPROP:inputstream.adaptive.manifest_type=mpd
    /// #KODIPROP:inputstream.adaptive.license_type=clearkey
    /// #KODIPROP:inputstream.adaptive.license_key=<kid>:<key>
    /// https://example.com/stream.mpd
    /// ```
    pub fn from_kodi_props(id: impl Into<String>, text: &str) -> GatewayResult<Self> {
        let mut stream = Self::new(id, String::new());

        for line in text.lines().map(str::trim) {
            if let Some(prop) = line.strip_prefix(KODI_PROP_PREFIX) {
                let Some((key, value)) = prop.split_once('=') else {
                    continue;
                };
                let value = Some(value.trim().to_string()).filter(|v| !v.is_empty());
                match key.trim() {
                    "inputstream.adaptive.manifest_type" => stream.manifest_type = value,
                    "inputstream.adaptive.license_type" => stream.license_type = value,
                    "inputstream.adaptive.license_key" => stream.license_key = value,
                    other => tracing::debug!("Ignoring Kodi property {other}"),
                }
            } else if line.starts_with("http") {
                stream.url = line.to_string();
            }
        }

        if stream.url.is_empty() {
            return Err(GatewayError::Config(format!(
                "no stream URL found for {}",
                stream.id
            )));
        }
        Ok(stream)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Global transcoder parameters, shared by every session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub program: String,
    /// Target HLS segment duration in seconds.
    pub hls_time: u32,
    /// Number of segments kept in the playlist window.
    pub hls_list_size: u32,
    pub hls_flags: String,
    pub video_codec: String,
    pub audio_codec: String,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            hls_time: 6,
            hls_list_size: 10,
            hls_flags: "delete_segments".to_string(),
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
        }
    }
}

/// The external decrypting downloader used by the pipe strategy.
///
/// `args` may contain `{url}`, `{key_id}`, `{key}` and `{license_key}`
/// placeholders. The downloader must write the media to stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            program: "yt-dlp".to_string(),
            args: [
                "--no-warnings",
                "--quiet",
                "--allow-unplayable-formats",
                "-f",
                "best[ext=mp4]/best",
                "-o",
                "-",
                "--external-downloader",
                "ffmpeg",
                "--external-downloader-args",
                "ffmpeg_i:-decryption_key {key}",
                "{url}",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub manifest_timeout_secs: u64,
    pub segment_timeout_secs: u64,
    /// Segments downloaded ahead of the one being written.
    pub segment_concurrency: usize,
    pub user_agent: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            manifest_timeout_secs: 10,
            segment_timeout_secs: 60,
            segment_concurrency: 4,
            user_agent: None,
        }
    }
}

impl HttpConfig {
    pub fn manifest_timeout(&self) -> Duration {
        Duration::from_secs(self.manifest_timeout_secs)
    }

    pub fn segment_timeout(&self) -> Duration {
        Duration::from_secs(self.segment_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub retry: RetryPolicy,
    /// Wait after launching before the first playlist check.
    pub settle_delay_ms: u64,
    pub poll_interval_ms: u64,
    /// A playlist that has not appeared by then counts as a failure.
    pub playlist_timeout_secs: u64,
    /// Time between the termination signal and a forced kill.
    pub grace_period_secs: u64,
    /// Sessions older than this are reclaimed by the sweeper.
    pub session_max_age_secs: u64,
    pub sweep_interval_secs: u64,
    /// Also give up on a decryption method after it fails at runtime, so the
    /// next restart moves on to the next strategy.
    pub pipe_fallback: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            settle_delay_ms: 2_000,
            poll_interval_ms: 1_000,
            playlist_timeout_secs: 30,
            grace_period_secs: 5,
            session_max_age_secs: 3600,
            sweep_interval_secs: 60,
            pipe_fallback: false,
        }
    }
}

impl SupervisorConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn playlist_timeout(&self) -> Duration {
        Duration::from_secs(self.playlist_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Parent of the per-stream output directories.
    pub work_dir: PathBuf,
    pub transcoder: TranscoderConfig,
    pub downloader: DownloaderConfig,
    pub http: HttpConfig,
    pub supervisor: SupervisorConfig,
    pub streams: Vec<StreamConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("dashgate"),
            transcoder: TranscoderConfig::default(),
            downloader: DownloaderConfig::default(),
            http: HttpConfig::default(),
            supervisor: SupervisorConfig::default(),
            streams: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> GatewayResult<Self> {
        let config: Self = toml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.http.segment_concurrency == 0 {
            return Err(GatewayError::Config(
                "http.segment_concurrency must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for stream in &self.streams {
            stream.validate_id()?;
            if !seen.insert(stream.id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate stream id {}",
                    stream.id
                )));
            }
        }
        Ok(())
    }

    pub fn stream(&self, id: &str) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| s.id == id)
    }

    /// Output directory of a stream.
    pub fn output_dir(&self, stream_id: &str) -> PathBuf {
        self.work_dir.join(stream_id)
    }
}
