use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use super::{decrypt_segment, ClearKeyCredential, IvSource, ZeroIv};
use crate::{
    dash::{ManifestModel, SegmentDescriptor, SegmentKind, TrackKind},
    error::{GatewayError, GatewayResult},
    util::{http::HttpClient, remove_file_if_exists},
};

pub const VIDEO_OUTPUT: &str = "video_decrypted.mp4";
pub const AUDIO_OUTPUT: &str = "audio_decrypted.mp4";

/// Files produced by [`SegmentDecryptor::decrypt_manifest`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecryptedTracks {
    pub video: Option<PathBuf>,
    pub audio: Option<PathBuf>,
}

impl DecryptedTracks {
    pub fn files(&self) -> Vec<PathBuf> {
        self.video.iter().chain(self.audio.iter()).cloned().collect()
    }
}

/// Downloads segments and writes their decrypted concatenation.
///
/// Up to `concurrency` downloads run ahead of the writer, but bytes are always
/// written in the order the segments were given.
#[derive(Clone)]
pub struct SegmentDecryptor {
    client: HttpClient,
    credential: ClearKeyCredential,
    iv_source: Arc<dyn IvSource>,
    concurrency: usize,
}

impl SegmentDecryptor {
    pub fn new(client: HttpClient, credential: ClearKeyCredential) -> Self {
        Self {
            client,
            credential,
            iv_source: Arc::new(ZeroIv),
            concurrency: 4,
        }
    }

    pub fn with_iv_source(mut self, iv_source: impl IvSource + 'static) -> Self {
        self.iv_source = Arc::new(iv_source);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn credential(&self) -> &ClearKeyCredential {
        &self.credential
    }

    fn process(&self, segment: &SegmentDescriptor, data: Bytes) -> GatewayResult<Vec<u8>> {
        match segment.kind {
            SegmentKind::Init => Ok(data.to_vec()),
            SegmentKind::Media => {
                let iv = self.iv_source.iv_for(segment);
                decrypt_segment(&data, &self.credential.key, &iv).map_err(|e| match e {
                    GatewayError::Decryption(reason) => GatewayError::Decryption(format!(
                        "segment {} of {}: {reason}",
                        segment.number, segment.representation_id
                    )),
                    e => e,
                })
            }
        }
    }

    /// Streams the decrypted segments into `writer`. Returns the number of
    /// bytes written. The first failing segment aborts the whole run.
    pub async fn decrypt_to_writer<W>(
        &self,
        segments: &[SegmentDescriptor],
        writer: &mut W,
    ) -> GatewayResult<u64>
    where
        W: AsyncWrite + Unpin,
    {
        check_ordering(segments)?;

        let client = self.client.clone();
        let mut downloads = std::pin::pin!(stream::iter(segments.to_vec())
            .map(move |segment| {
                let client = client.clone();
                async move {
                    let data = client.fetch_segment(segment.url.clone()).await?;
                    Ok::<_, GatewayError>((segment, data))
                }
            })
            .buffered(self.concurrency));

        let mut written = 0u64;
        while let Some((segment, data)) = downloads.try_next().await? {
            let output = self.process(&segment, data)?;
            writer.write_all(&output).await?;
            written += output.len() as u64;
            tracing::debug!(
                "Wrote {:?} segment {} of {} ({} bytes)",
                segment.kind,
                segment.number,
                segment.representation_id,
                output.len()
            );
        }
        writer.flush().await?;

        Ok(written)
    }

    /// Decrypts one track into `output`, truncating any previous content.
    pub async fn decrypt_track(
        &self,
        segments: &[SegmentDescriptor],
        output: impl AsRef<Path>,
    ) -> GatewayResult<PathBuf> {
        let output = output.as_ref().to_path_buf();
        check_ordering(segments)?;

        let file = tokio::fs::File::create(&output).await?;
        let mut writer = BufWriter::new(file);
        match self.decrypt_to_writer(segments, &mut writer).await {
            Ok(bytes) => {
                tracing::info!("Decrypted {} bytes into {}", bytes, output.display());
                Ok(output)
            }
            Err(e) => {
                drop(writer);
                if let Err(remove) = remove_file_if_exists(&output).await {
                    tracing::warn!("Failed to remove partial {}: {remove}", output.display());
                }
                Err(e)
            }
        }
    }

    /// Decrypts the best video and the best audio track of `model` into
    /// `dir`.
    pub async fn decrypt_manifest(
        &self,
        model: &ManifestModel,
        dir: impl AsRef<Path>,
    ) -> GatewayResult<DecryptedTracks> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        self.warn_on_key_mismatch(model);

        let video = model.best_track(TrackKind::Video);
        let audio = model.best_track(TrackKind::Audio);
        if video.is_none() && audio.is_none() {
            return Err(GatewayError::ManifestParse(
                "manifest has no audio or video track".to_string(),
            ));
        }

        let mut tracks = DecryptedTracks::default();
        if let Some(track) = video {
            tracks.video = Some(
                self.decrypt_track(&track.segments, dir.join(VIDEO_OUTPUT))
                    .await?,
            );
        }
        if let Some(track) = audio {
            tracks.audio = Some(
                self.decrypt_track(&track.segments, dir.join(AUDIO_OUTPUT))
                    .await?,
            );
        }
        Ok(tracks)
    }

    fn warn_on_key_mismatch(&self, model: &ManifestModel) {
        if let Some(default_kid) = model.default_kid() {
            let key_id = self.credential.key_id_hex();
            if default_kid != key_id {
                tracing::warn!(
                    "Manifest default_KID {default_kid} does not match key id {key_id}, decrypting anyway"
                );
            }
        }
    }
}

/// Media numbers must increase strictly within each representation.
fn check_ordering(segments: &[SegmentDescriptor]) -> GatewayResult<()> {
    let mut last: HashMap<&str, u64> = HashMap::new();
    for segment in segments.iter().filter(|s| s.kind == SegmentKind::Media) {
        if let Some(previous) = last.insert(&segment.representation_id, segment.number) {
            if segment.number <= previous {
                return Err(GatewayError::Decryption(format!(
                    "segment {} of {} follows segment {previous}",
                    segment.number, segment.representation_id
                )));
            }
        }
    }
    Ok(())
}
