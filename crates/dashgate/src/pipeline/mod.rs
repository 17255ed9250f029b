//! Strategy selection and the command lines it turns into.

pub mod command;
pub mod strategy;

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::process::Command;

pub use command::{TranscoderInput, PLAYLIST_NAME, SEGMENT_PATTERN};
pub use strategy::{ExhaustedMethods, PipelineMethod, StrategySelector, ToolAvailability};

use crate::{config::GatewayConfig, decrypt::ClearKeyCredential};

/// A program and its arguments, not yet spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl CommandSpec {
    /// stdout and stdin are closed, stderr is piped for classification.
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// The concrete processes of one pipeline attempt.
#[derive(Debug, Clone)]
pub enum ProcessPlan {
    Direct {
        transcoder: CommandSpec,
    },
    /// The transcoder command is only known once the decrypted files exist.
    DecryptThenTranscode {
        manifest_url: String,
        credential: ClearKeyCredential,
        decrypt_dir: PathBuf,
    },
    DecryptPipe {
        downloader: CommandSpec,
        transcoder: CommandSpec,
    },
}

impl ProcessPlan {
    pub fn build(
        method: PipelineMethod,
        config: &GatewayConfig,
        url: &str,
        credential: Option<&ClearKeyCredential>,
        output_dir: &Path,
    ) -> Self {
        let transcoder_program = PathBuf::from(&config.transcoder.program);

        match (method, credential) {
            (PipelineMethod::DecryptThenTranscode, Some(credential)) => {
                ProcessPlan::DecryptThenTranscode {
                    manifest_url: url.to_string(),
                    credential: credential.clone(),
                    decrypt_dir: output_dir.join(".decrypted"),
                }
            }
            (PipelineMethod::DecryptPipe, Some(credential)) => ProcessPlan::DecryptPipe {
                downloader: CommandSpec {
                    program: PathBuf::from(&config.downloader.program),
                    args: command::downloader_args(&config.downloader, url, credential)
                        .into_iter()
                        .map(OsString::from)
                        .collect(),
                },
                transcoder: CommandSpec {
                    program: transcoder_program,
                    args: command::transcoder_args(
                        &config.transcoder,
                        &TranscoderInput::Stdin,
                        output_dir,
                    ),
                },
            },
            _ => ProcessPlan::Direct {
                transcoder: CommandSpec {
                    program: transcoder_program,
                    args: command::transcoder_args(
                        &config.transcoder,
                        &TranscoderInput::Url {
                            url: url.to_string(),
                            decryption_key: credential.map(ClearKeyCredential::key_hex),
                        },
                        output_dir,
                    ),
                },
            },
        }
    }

    pub fn method(&self) -> PipelineMethod {
        match self {
            ProcessPlan::Direct { .. } => PipelineMethod::Direct,
            ProcessPlan::DecryptThenTranscode { .. } => PipelineMethod::DecryptThenTranscode,
            ProcessPlan::DecryptPipe { .. } => PipelineMethod::DecryptPipe,
        }
    }

    /// The transcoder for already decrypted files.
    pub fn file_transcoder(
        config: &GatewayConfig,
        files: Vec<PathBuf>,
        output_dir: &Path,
    ) -> CommandSpec {
        CommandSpec {
            program: PathBuf::from(&config.transcoder.program),
            args: command::transcoder_args(
                &config.transcoder,
                &TranscoderInput::Files(files),
                output_dir,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_plans() {
        let config = GatewayConfig::default();
        let credential: ClearKeyCredential =
            "0123456789abcdef0123456789abcdef:00112233445566778899aabbccddeeff"
                .parse()
                .unwrap();
        let out = Path::new("/srv/hls/a");

        let plan = ProcessPlan::build(
            PipelineMethod::DecryptPipe,
            &config,
            "https://example.com/a.mpd",
            Some(&credential),
            out,
        );
        let ProcessPlan::DecryptPipe {
            downloader,
            transcoder,
        } = &plan
        else {
            panic!("expected a pipe plan");
        };
        assert_eq!(downloader.program, PathBuf::from("yt-dlp"));
        assert!(downloader
            .args
            .contains(&OsString::from("ffmpeg_i:-decryption_key 00112233445566778899aabbccddeeff")));
        assert!(transcoder.args.contains(&OsString::from("pipe:0")));

        // Direct with a key forwards it to the transcoder.
        let plan = ProcessPlan::build(
            PipelineMethod::Direct,
            &config,
            "https://example.com/a.mpd",
            Some(&credential),
            out,
        );
        let ProcessPlan::Direct { transcoder } = &plan else {
            panic!("expected a direct plan");
        };
        assert!(transcoder.args.contains(&OsString::from("-decryption_key")));

        let plan = ProcessPlan::build(
            PipelineMethod::DecryptThenTranscode,
            &config,
            "https://example.com/a.mpd",
            Some(&credential),
            out,
        );
        assert_eq!(plan.method(), PipelineMethod::DecryptThenTranscode);
    }
}
