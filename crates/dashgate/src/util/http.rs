use std::{ops::Deref, time::Duration};

use bytes::Bytes;
use reqwest::{header, Client, IntoUrl};

use crate::{
    config::HttpConfig,
    error::{GatewayError, GatewayResult},
};

const DASH_ACCEPT: &str = "application/dash+xml,video/vnd.mpeg.dash.mpd";

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    manifest_timeout: Duration,
    segment_timeout: Duration,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> GatewayResult<Self> {
        let mut builder = Client::builder();
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build()?,
            manifest_timeout: config.manifest_timeout(),
            segment_timeout: config.segment_timeout(),
        })
    }

    pub async fn fetch_manifest(&self, url: impl IntoUrl) -> GatewayResult<String> {
        let url = url.into_url()?;
        let response = self
            .client
            .get(url.clone())
            .header(header::ACCEPT, DASH_ACCEPT)
            .timeout(self.manifest_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            if let Ok(body) = response.text().await {
                tracing::warn!("Error body: {body}");
            }
            return Err(GatewayError::ManifestFetch {
                url: url.to_string(),
                status,
            });
        }

        Ok(response.text().await?)
    }

    pub async fn fetch_segment(&self, url: impl IntoUrl) -> GatewayResult<Bytes> {
        let url = url.into_url()?;
        let download_error = |reason: String| GatewayError::SegmentDownload {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url.clone())
            .timeout(self.segment_timeout)
            .send()
            .await
            .map_err(|e| download_error(describe_request_error(&e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(download_error(format!("HTTP {status}")));
        }

        response
            .bytes()
            .await
            .map_err(|e| download_error(describe_request_error(&e)))
    }

    /// Lightweight reachability check used before starting a stream.
    pub async fn probe(&self, url: impl IntoUrl, timeout: Duration) -> GatewayResult<u16> {
        let response = self
            .client
            .get(url)
            .header(header::RANGE, "bytes=0-0")
            .timeout(timeout)
            .send()
            .await?;
        Ok(response.status().as_u16())
    }
}

fn describe_request_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("request timed out: {e}")
    } else if e.is_connect() {
        format!("connection refused: {e}")
    } else {
        e.to_string()
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}
