use std::{collections::HashSet, fmt, path::PathBuf};

use serde::Serialize;

use crate::config::GatewayConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMethod {
    /// The transcoder reads the manifest URL itself.
    Direct,
    /// Segments are decrypted in-process to files, then transcoded.
    DecryptThenTranscode,
    /// An external downloader decrypts to stdout, piped into the transcoder.
    DecryptPipe,
}

impl fmt::Display for PipelineMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineMethod::Direct => "direct",
            PipelineMethod::DecryptThenTranscode => "decrypt-then-transcode",
            PipelineMethod::DecryptPipe => "decrypt-pipe",
        })
    }
}

/// Methods that must not be chosen again for the current run.
pub type ExhaustedMethods = HashSet<PipelineMethod>;

/// Resolved locations of the external tools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolAvailability {
    pub transcoder: Option<PathBuf>,
    pub downloader: Option<PathBuf>,
}

impl ToolAvailability {
    pub fn detect(config: &GatewayConfig) -> Self {
        let locate = |program: &str| match which::which(program) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!("{program} is not available: {e}");
                None
            }
        };

        Self {
            transcoder: locate(&config.transcoder.program),
            downloader: locate(&config.downloader.program),
        }
    }

    pub fn has_downloader(&self) -> bool {
        self.downloader.is_some()
    }
}

/// Chooses how a stream is processed. Pure: the result only depends on the
/// key, the exhausted set and the tools detected at construction.
#[derive(Debug, Clone)]
pub struct StrategySelector {
    tools: ToolAvailability,
}

impl StrategySelector {
    pub fn new(tools: ToolAvailability) -> Self {
        Self { tools }
    }

    pub fn tools(&self) -> &ToolAvailability {
        &self.tools
    }

    pub fn select(&self, license_key: Option<&str>, exhausted: &ExhaustedMethods) -> PipelineMethod {
        if license_key.map_or(true, |key| key.trim().is_empty()) {
            return PipelineMethod::Direct;
        }

        if self.tools.has_downloader() && !exhausted.contains(&PipelineMethod::DecryptPipe) {
            PipelineMethod::DecryptPipe
        } else if !exhausted.contains(&PipelineMethod::DecryptThenTranscode) {
            PipelineMethod::DecryptThenTranscode
        } else {
            PipelineMethod::Direct
        }
    }
}
