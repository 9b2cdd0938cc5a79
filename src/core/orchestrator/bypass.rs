// src/core/orchestrator/bypass.rs

//! Origin passthrough for URLs the rules exclude from rendering.

use crate::core::orchestrator::renderer::RenderedPage;
use crate::core::EdgeCacheError;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

pub struct BypassClient {
    http: reqwest::Client,
}

impl BypassClient {
    pub fn new() -> Result<Self, EdgeCacheError> {
        // Redirects pass through to the caller rather than being followed,
        // so a cached 301 stays a 301.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { http })
    }

    /// Proxies a GET to the origin with the allow-listed request headers.
    /// Response headers come back unfiltered; the orchestrator applies the
    /// response allow-list before anything is stored or served.
    pub async fn fetch(
        &self,
        url: &str,
        request_headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<RenderedPage, EdgeCacheError> {
        debug!("Bypassing to origin for {}", url);
        let mut request = self.http.get(url).timeout(timeout);
        for (name, value) in request_headers {
            request = request.header(name, value);
        }
        let response = request.send().await?;

        let status = response.status().as_u16();
        let mut headers: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(text) = value.to_str() {
                headers
                    .entry(name.as_str().to_lowercase())
                    .or_default()
                    .push(text.to_string());
            }
        }
        let body: Bytes = response.bytes().await?;
        Ok(RenderedPage {
            status,
            body,
            headers,
        })
    }
}
