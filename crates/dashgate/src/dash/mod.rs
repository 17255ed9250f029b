//! # MPEG-DASH manifest resolution
//!
//! Turns an MPD into a flat [`ManifestModel`]: one [`Track`] per
//! `Representation`, each with its init segment followed by every media
//! segment in playback order.
//!
//! Supported addressing is `SegmentTemplate`, either with a
//! `SegmentTimeline` or with a fixed `@duration`. The template is looked up on
//! the `Representation` first and on the `AdaptationSet` second.
//! `$RepresentationID$`, `$Number$`, `$Time$` and `$Bandwidth$` are
//! substituted, including the `%0Nd` width form.
//!
//! Parsing goes through `dash_mpd`, whose deserializer matches element and
//! attribute names without their namespace prefix, so `mpd:`, `cenc:` and
//! unprefixed manifests all resolve the same way.
//!
//! A `ContentProtection` descriptor with scheme
//! `urn:mpeg:dash:mp4protection:2011` marks the manifest as protected. No
//! license negotiation takes place; the key is always supplied by the caller.

pub mod manifest;
pub mod resolver;
mod template;
mod url;

pub use manifest::{
    EncryptionInfo, ManifestModel, SegmentDescriptor, SegmentKind, Track, TrackKind,
};
pub use resolver::ManifestResolver;
