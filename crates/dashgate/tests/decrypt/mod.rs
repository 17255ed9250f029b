use dashgate::{
    config::HttpConfig,
    dash::{ManifestResolver, TrackKind},
    decrypt::SegmentDecryptor,
    util::http::HttpClient,
    ClearKeyCredential, GatewayError,
};
use wiremock::{
    matchers::{method, path},
    Mock, ResponseTemplate,
};

use crate::{expected_audio, expected_video, license_key, setup_protected_stream};

fn client() -> HttpClient {
    HttpClient::new(&HttpConfig::default()).unwrap()
}

fn credential() -> ClearKeyCredential {
    license_key().parse().unwrap()
}

#[tokio::test]
async fn decrypt_manifest_end_to_end() -> anyhow::Result<()> {
    crate::init_test_tracing();
    let (uri, _server) = setup_protected_stream().await;
    let dir = tempfile::tempdir()?;

    let model = ManifestResolver::new(client()).resolve(&uri).await?;
    let decryptor = SegmentDecryptor::new(client(), credential()).with_concurrency(2);
    let tracks = decryptor.decrypt_manifest(&model, dir.path()).await?;

    let video = tracks.video.clone().unwrap();
    let audio = tracks.audio.clone().unwrap();
    assert_eq!(tokio::fs::read(&video).await?, expected_video());
    assert_eq!(tokio::fs::read(&audio).await?, expected_audio());
    assert_eq!(tracks.files(), vec![video.clone(), audio]);

    // A second run overwrites the previous output with identical bytes.
    let first = tokio::fs::read(&video).await?;
    decryptor.decrypt_manifest(&model, dir.path()).await?;
    assert_eq!(tokio::fs::read(&video).await?, first);

    Ok(())
}

#[tokio::test]
async fn decrypt_to_writer_keeps_playback_order() -> anyhow::Result<()> {
    let (uri, _server) = setup_protected_stream().await;
    let model = ManifestResolver::new(client()).resolve(&uri).await?;
    let track = model.best_track(TrackKind::Video).unwrap();

    // Prefetching more segments than exist must not reorder the output.
    let mut output = Vec::new();
    let written = SegmentDecryptor::new(client(), credential())
        .with_concurrency(16)
        .decrypt_to_writer(&track.segments, &mut output)
        .await?;

    assert_eq!(output, expected_video());
    assert_eq!(written, output.len() as u64);
    Ok(())
}

#[tokio::test]
async fn missing_segment_aborts_track() -> anyhow::Result<()> {
    let (uri, server) = setup_protected_stream().await;
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/manifest.mpd"))
        .respond_with(ResponseTemplate::new(200).set_body_string(crate::PROTECTED_MPD))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v-high/init.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"VIDEO-INIT".to_vec()))
        .mount(&server)
        .await;

    let model = ManifestResolver::new(client()).resolve(&uri).await?;
    let track = model.best_track(TrackKind::Video).unwrap();
    let dir = tempfile::tempdir()?;
    let output = dir.path().join("video.mp4");

    let err = SegmentDecryptor::new(client(), credential())
        .decrypt_track(&track.segments, &output)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::SegmentDownload { .. }));
    assert!(err.to_string().contains("seg-1.m4s"));
    // No truncated output is left behind.
    assert!(!output.exists());
    Ok(())
}

#[tokio::test]
async fn wrong_key_is_not_silently_accepted() -> anyhow::Result<()> {
    let (uri, _server) = setup_protected_stream().await;
    let model = ManifestResolver::new(client()).resolve(&uri).await?;
    let track = model.best_track(TrackKind::Video).unwrap();

    let wrong: ClearKeyCredential = format!("{}:{}", crate::KID, "ff".repeat(16)).parse()?;
    let mut output = Vec::new();
    let result = SegmentDecryptor::new(client(), wrong)
        .decrypt_to_writer(&track.segments, &mut output)
        .await;

    // Garbage padding falls back to unpadded output, which never matches.
    match result {
        Ok(_) => assert_ne!(output, expected_video()),
        Err(e) => assert!(matches!(e, GatewayError::Decryption(_))),
    }
    Ok(())
}
