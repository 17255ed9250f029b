use std::time::Duration;

use dash_mpd::{AdaptationSet, BaseURL, ContentProtection, Representation, SegmentTemplate, S, MPD};
use serde::Serialize;
use url::Url;

use super::{template::TemplateVars, url::resolve_url};
use crate::error::{GatewayError, GatewayResult};

/// `schemeIdUri` of the common-encryption `ContentProtection` descriptor.
pub const MP4_PROTECTION_SCHEME: &str = "urn:mpeg:dash:mp4protection:2011";

/// Upper bound on media segments per track. Timelines and `@duration`
/// addressing both derive counts from the document, so a hostile manifest
/// could otherwise ask for billions.
pub const MAX_SEGMENTS_PER_TRACK: u64 = 200_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    /// Substring match on `contentType` then `mimeType`: video first, then
    /// audio. Anything else is treated as video.
    fn classify(content_type: &str, mime_type: &str) -> Self {
        if content_type.contains("video") || mime_type.contains("video") {
            TrackKind::Video
        } else if content_type.contains("audio") || mime_type.contains("audio") {
            TrackKind::Audio
        } else {
            TrackKind::Video
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Init,
    Media,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentDescriptor {
    pub kind: SegmentKind,
    pub url: Url,
    pub representation_id: String,
    /// `$Number$` of a media segment, 0 for the init segment.
    pub number: u64,
    /// Duration in timescale units, 0 for the init segment.
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Track {
    pub kind: TrackKind,
    pub representation_id: String,
    pub bandwidth: Option<u64>,
    pub mime_type: Option<String>,
    pub timescale: u64,
    pub segments: Vec<SegmentDescriptor>,
}

impl Track {
    pub fn media_segments(&self) -> impl Iterator<Item = &SegmentDescriptor> {
        self.segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Media)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncryptionInfo {
    pub scheme: String,
    /// Lowercase hex without dashes.
    pub default_kid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestModel {
    pub url: Url,
    pub tracks: Vec<Track>,
    pub encryption: Option<EncryptionInfo>,
}

impl ManifestModel {
    pub fn parse(text: &str, manifest_url: &Url) -> GatewayResult<Self> {
        let mpd = dash_mpd::parse(text).map_err(|e| GatewayError::ManifestParse(e.to_string()))?;
        Self::from_mpd(&mpd, manifest_url)
    }

    fn from_mpd(mpd: &MPD, manifest_url: &Url) -> GatewayResult<Self> {
        if mpd.periods.is_empty() {
            return Err(GatewayError::ManifestParse(
                "manifest has no Period".to_string(),
            ));
        }

        let mpd_base = with_base_url(&mpd.base_url, manifest_url)?;
        let mut tracks = Vec::new();
        let mut encryption = None;
        for period in &mpd.periods {
            let period_base = with_base_url(&period.BaseURL, &mpd_base)?;
            let period_duration = period.duration.or(mpd.mediaPresentationDuration);

            for adaptation_set in &period.adaptations {
                let set_base = with_base_url(&adaptation_set.BaseURL, &period_base)?;
                let kind = TrackKind::classify(
                    adaptation_set.contentType.as_deref().unwrap_or_default(),
                    adaptation_set.mimeType.as_deref().unwrap_or_default(),
                );
                if encryption.is_none() {
                    encryption = find_encryption(&adaptation_set.ContentProtection);
                }

                for representation in &adaptation_set.representations {
                    if encryption.is_none() {
                        encryption = find_encryption(&representation.ContentProtection);
                    }
                    let base = with_base_url(&representation.BaseURL, &set_base)?;
                    let scope = TemplateScope {
                        representation: representation.SegmentTemplate.as_ref(),
                        adaptation_set: adaptation_set.SegmentTemplate.as_ref(),
                    };
                    let Some(track) = scope.build_track(
                        kind,
                        representation,
                        adaptation_set,
                        &base,
                        period_duration,
                    )?
                    else {
                        tracing::warn!(
                            "Representation {:?} has no SegmentTemplate, skipped",
                            representation.id
                        );
                        continue;
                    };
                    tracks.push(track);
                }
            }
        }

        Ok(Self {
            url: manifest_url.clone(),
            tracks,
            encryption,
        })
    }

    pub fn is_protected(&self) -> bool {
        self.encryption.is_some()
    }

    pub fn default_kid(&self) -> Option<&str> {
        self.encryption.as_ref()?.default_kid.as_deref()
    }

    /// Highest-bandwidth track of the given kind.
    pub fn best_track(&self, kind: TrackKind) -> Option<&Track> {
        self.tracks
            .iter()
            .filter(|t| t.kind == kind)
            .max_by_key(|t| t.bandwidth.unwrap_or(0))
    }
}

fn with_base_url(base_urls: &[BaseURL], current: &Url) -> GatewayResult<Url> {
    match base_urls.first().map(|b| b.base.trim()) {
        Some(base) if !base.is_empty() => resolve_url(current, base),
        _ => Ok(current.clone()),
    }
}

fn find_encryption(protections: &[ContentProtection]) -> Option<EncryptionInfo> {
    protections
        .iter()
        .find(|p| p.schemeIdUri.as_deref().is_some_and(|s| s.trim().eq_ignore_ascii_case(MP4_PROTECTION_SCHEME)))
        .map(|p| EncryptionInfo {
            scheme: p.value.clone().unwrap_or_else(|| "cenc".to_string()),
            default_kid: p.default_KID.as_deref().map(normalize_kid),
        })
}

/// Lowercase hex, dashes and braces removed.
pub fn normalize_kid(kid: &str) -> String {
    kid.trim()
        .chars()
        .filter(|c| !matches!(c, '-' | '{' | '}'))
        .collect::<String>()
        .to_ascii_lowercase()
}

fn too_many_segments(representation_id: &str) -> GatewayError {
    GatewayError::ManifestParse(format!(
        "representation {representation_id:?} has more than {MAX_SEGMENTS_PER_TRACK} segments"
    ))
}

/// Representation-level `SegmentTemplate` with the adaptation-set one as
/// fallback, attribute by attribute.
struct TemplateScope<'a> {
    representation: Option<&'a SegmentTemplate>,
    adaptation_set: Option<&'a SegmentTemplate>,
}

impl<'a> TemplateScope<'a> {
    fn pick<T>(&self, field: impl Fn(&'a SegmentTemplate) -> Option<T>) -> Option<T> {
        self.representation
            .and_then(&field)
            .or_else(|| self.adaptation_set.and_then(&field))
    }

    fn build_track(
        &self,
        kind: TrackKind,
        representation: &Representation,
        adaptation_set: &AdaptationSet,
        base: &Url,
        period_duration: Option<Duration>,
    ) -> GatewayResult<Option<Track>> {
        if self.representation.is_none() && self.adaptation_set.is_none() {
            return Ok(None);
        }

        let representation_id = representation.id.clone().unwrap_or_default();
        let bandwidth = representation.bandwidth;
        let timescale = self.pick(|t| t.timescale).unwrap_or(1).max(1);
        let start_number = self.pick(|t| t.startNumber).unwrap_or(1);
        let vars = TemplateVars::new(&representation_id, bandwidth);

        let mut segments = Vec::new();
        if let Some(init) = self.pick(|t| t.initialization.as_deref()) {
            segments.push(SegmentDescriptor {
                kind: SegmentKind::Init,
                url: resolve_url(base, &vars.expand(init))?,
                representation_id: representation_id.clone(),
                number: 0,
                duration: 0,
            });
        }

        let Some(media) = self.pick(|t| t.media.as_deref()) else {
            return Err(GatewayError::ManifestParse(format!(
                "SegmentTemplate of representation {representation_id:?} has no @media"
            )));
        };

        let timing = match self.pick(|t| t.SegmentTimeline.as_ref()) {
            Some(timeline) => walk_timeline(
                &timeline.segments,
                timescale,
                period_duration,
                &representation_id,
            )?,
            None => {
                let duration = self.pick(|t| t.duration).ok_or_else(|| {
                    GatewayError::ManifestParse(format!(
                        "SegmentTemplate of representation {representation_id:?} has neither SegmentTimeline nor @duration"
                    ))
                })?;
                let total = period_duration.ok_or_else(|| {
                    GatewayError::ManifestParse(
                        "SegmentTemplate@duration requires mediaPresentationDuration".to_string(),
                    )
                })?;
                fixed_duration_timing(duration, timescale, total)
                    .ok_or_else(|| too_many_segments(&representation_id))?
            }
        };

        for (index, (time, duration)) in timing.into_iter().enumerate() {
            let number = start_number.saturating_add(index as u64);
            segments.push(SegmentDescriptor {
                kind: SegmentKind::Media,
                url: resolve_url(base, &vars.with_segment(number, time).expand(media))?,
                representation_id: representation_id.clone(),
                number,
                duration,
            });
        }

        Ok(Some(Track {
            kind,
            representation_id,
            bandwidth,
            mime_type: representation
                .mimeType
                .clone()
                .or_else(|| adaptation_set.mimeType.clone()),
            timescale,
            segments,
        }))
    }
}

/// Expands `<S t d r>` entries into `(time, duration)` pairs, one per segment.
/// Each entry yields `r + 1` segments. A negative `r` repeats until the next
/// entry's `t`, or until the end of the period.
fn walk_timeline(
    entries: &[S],
    timescale: u64,
    period_duration: Option<Duration>,
    representation_id: &str,
) -> GatewayResult<Vec<(u64, u64)>> {
    let mut timing = Vec::new();
    let mut time = 0u64;

    for (i, s) in entries.iter().enumerate() {
        if let Some(t) = s.t {
            time = t;
        }
        let duration = s.d;
        let repeat = s.r.unwrap_or(0);

        let count = if repeat >= 0 {
            (repeat as u64).saturating_add(1)
        } else if duration == 0 {
            1
        } else {
            let end = entries
                .get(i + 1)
                .and_then(|next| next.t)
                .or_else(|| period_duration.map(|d| (d.as_secs_f64() * timescale as f64) as u64));
            match end {
                Some(end) if end > time => (end - time).div_ceil(duration),
                _ => 1,
            }
        };

        if count > MAX_SEGMENTS_PER_TRACK - timing.len() as u64 {
            return Err(too_many_segments(representation_id));
        }
        for _ in 0..count {
            timing.push((time, duration));
            time = time.checked_add(duration).ok_or_else(|| {
                GatewayError::ManifestParse(format!(
                    "SegmentTimeline of representation {representation_id:?} overflows"
                ))
            })?;
        }
    }

    Ok(timing)
}

/// `None` when the count exceeds [`MAX_SEGMENTS_PER_TRACK`].
fn fixed_duration_timing(
    duration: f64,
    timescale: u64,
    total: Duration,
) -> Option<Vec<(u64, u64)>> {
    if !duration.is_finite() || duration <= 0.0 {
        return Some(Vec::new());
    }
    let total = (total.as_secs_f64() * timescale as f64).ceil();
    let count = (total / duration).ceil();
    if count > MAX_SEGMENTS_PER_TRACK as f64 {
        return None;
    }
    Some(
        (0..count as u64)
            .map(|i| ((i as f64 * duration) as u64, duration as u64))
            .collect(),
    )
}
