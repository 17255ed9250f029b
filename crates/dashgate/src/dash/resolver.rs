use url::Url;

use super::manifest::ManifestModel;
use crate::{error::GatewayResult, util::http::HttpClient};

/// Fetches and parses a manifest. Every call goes to the network; models are
/// never cached between pipeline starts.
#[derive(Clone)]
pub struct ManifestResolver {
    client: HttpClient,
}

impl ManifestResolver {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    pub async fn resolve(&self, manifest_url: &str) -> GatewayResult<ManifestModel> {
        let url = Url::parse(manifest_url)?;
        tracing::debug!("Fetching manifest {url}");
        let text = self.client.fetch_manifest(url.clone()).await?;
        let model = ManifestModel::parse(&text, &url)?;
        tracing::info!(
            "Resolved {} track(s) from {url}, protected: {}",
            model.tracks.len(),
            model.is_protected()
        );
        Ok(model)
    }
}
