use dashgate::{
    config::HttpConfig,
    dash::{ManifestResolver, SegmentKind, TrackKind},
    util::http::HttpClient,
    ErrorCategory, GatewayError,
};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, Request, ResponseTemplate,
};

use crate::{setup_mock_server, PROTECTED_MPD};

fn resolver() -> ManifestResolver {
    ManifestResolver::new(HttpClient::new(&HttpConfig::default()).unwrap())
}

#[tokio::test]
async fn resolve_protected_manifest() -> anyhow::Result<()> {
    crate::init_test_tracing();
    let (uri, _server) = setup_mock_server(PROTECTED_MPD).await;

    let model = resolver().resolve(&uri).await?;
    assert!(model.is_protected());
    assert_eq!(model.default_kid(), Some(crate::KID));
    assert_eq!(model.tracks.len(), 3);

    let video = model.best_track(TrackKind::Video).unwrap();
    assert_eq!(video.representation_id, "v-high");
    assert_eq!(video.segments[0].kind, SegmentKind::Init);
    assert!(video.segments[0].url.as_str().ends_with("/v-high/init.mp4"));
    let numbers: Vec<_> = video.media_segments().map(|s| s.number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    let audio = model.best_track(TrackKind::Audio).unwrap();
    assert_eq!(audio.media_segments().count(), 2);
    assert!(audio.segments[2].url.as_str().ends_with("/a/seg-2.m4s"));

    Ok(())
}

#[tokio::test]
async fn resolve_sends_dash_accept_header() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/live.mpd"))
        .and(|request: &Request| {
            request
                .headers
                .get("accept")
                .and_then(|value| value.to_str().ok())
                == Some("application/dash+xml,video/vnd.mpeg.dash.mpd")
        })
        .respond_with(ResponseTemplate::new(200).set_body_string(PROTECTED_MPD))
        .expect(1)
        .mount(&server)
        .await;

    resolver()
        .resolve(&format!("{}/live.mpd", server.uri()))
        .await?;
    Ok(())
}

#[tokio::test]
async fn resolve_missing_manifest() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone.mpd"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such stream"))
        .mount(&server)
        .await;

    let err = resolver()
        .resolve(&format!("{}/gone.mpd", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::ManifestFetch { status, .. } if status.as_u16() == 404
    ));
    let analysis = err.analysis();
    assert_eq!(analysis.category, ErrorCategory::NotFound);
    assert!(!analysis.retryable);
}

#[tokio::test]
async fn resolve_rejects_non_mpd() {
    let (uri, _server) = setup_mock_server("#EXTM3U\n#EXT-X-VERSION:3\n").await;
    assert!(matches!(
        resolver().resolve(&uri).await,
        Err(GatewayError::ManifestParse(_))
    ));
}
