//! Command lines of the external transcoder and downloader.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use crate::{
    config::{DownloaderConfig, TranscoderConfig},
    decrypt::ClearKeyCredential,
};

pub const PLAYLIST_NAME: &str = "playlist.m3u8";
pub const SEGMENT_PATTERN: &str = "segment_%03d.ts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscoderInput {
    /// The transcoder fetches the manifest itself. With a key it is passed as
    /// `-decryption_key`, which only works for sources the demuxer can
    /// decrypt on its own.
    Url {
        url: String,
        decryption_key: Option<String>,
    },
    /// Decrypted track files, muxed together.
    Files(Vec<PathBuf>),
    /// Media piped into stdin.
    Stdin,
}

/// Arguments for an ffmpeg-compatible transcoder writing HLS into
/// `output_dir`. The playlist path is always the last argument.
pub fn transcoder_args(
    config: &TranscoderConfig,
    input: &TranscoderInput,
    output_dir: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-hide_banner".into(), "-y".into()];

    match input {
        TranscoderInput::Url {
            url,
            decryption_key,
        } => {
            args.push("-nostdin".into());
            if let Some(key) = decryption_key {
                args.push("-decryption_key".into());
                args.push(key.into());
            }
            args.push("-i".into());
            args.push(url.into());
        }
        TranscoderInput::Files(files) => {
            args.push("-nostdin".into());
            for file in files {
                args.push("-i".into());
                args.push(file.into());
            }
            if files.len() > 1 {
                for index in 0..files.len() {
                    args.push("-map".into());
                    args.push(index.to_string().into());
                }
            }
        }
        TranscoderInput::Stdin => {
            args.push("-i".into());
            args.push("pipe:0".into());
        }
    }

    let hls_time = config.hls_time.to_string();
    let hls_list_size = config.hls_list_size.to_string();
    for arg in [
        "-c:v",
        config.video_codec.as_str(),
        "-c:a",
        config.audio_codec.as_str(),
        "-f",
        "hls",
        "-hls_time",
        hls_time.as_str(),
        "-hls_list_size",
        hls_list_size.as_str(),
    ] {
        args.push(arg.into());
    }
    if !config.hls_flags.is_empty() {
        args.push("-hls_flags".into());
        args.push(config.hls_flags.as_str().into());
    }
    args.push("-hls_segment_filename".into());
    args.push(output_dir.join(SEGMENT_PATTERN).into_os_string());
    args.push(output_dir.join(PLAYLIST_NAME).into_os_string());

    args
}

/// Expands the downloader's argument template.
pub fn downloader_args(
    config: &DownloaderConfig,
    url: &str,
    credential: &ClearKeyCredential,
) -> Vec<String> {
    let key_id = credential.key_id_hex();
    let key = credential.key_hex();
    let license_key = credential.license_key();

    config
        .args
        .iter()
        .map(|arg| {
            arg.replace("{url}", url)
                .replace("{key_id}", &key_id)
                .replace("{license_key}", &license_key)
                .replace("{key}", &key)
        })
        .collect()
}
