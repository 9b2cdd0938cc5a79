// src/core/orchestrator/renderer.rs

//! Client for the external headless render service.
//!
//! The renderer is an external collaborator: this module only defines the
//! job/page contract and an HTTP implementation. Tests substitute their own
//! [`Renderer`].

use crate::core::EdgeCacheError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// One render request handed to the service.
#[derive(Debug, Clone, Serialize)]
pub struct RenderJob {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_wait_ms: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocked_resource_types: Vec<String>,
    /// Overall deadline for the render, not serialized; applied per request.
    #[serde(skip)]
    pub timeout: Duration,
}

/// The rendered result.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub status: u16,
    pub body: Bytes,
    pub headers: HashMap<String, Vec<String>>,
}

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, job: &RenderJob) -> Result<RenderedPage, EdgeCacheError>;
}

/// Wire shape of the render service's response.
#[derive(Debug, Deserialize)]
struct RenderServiceReply {
    status_code: u16,
    html: String,
    #[serde(default)]
    headers: HashMap<String, Vec<String>>,
}

/// HTTP implementation talking to the configured render service.
pub struct HttpRenderer {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpRenderer {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, EdgeCacheError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn render(&self, job: &RenderJob) -> Result<RenderedPage, EdgeCacheError> {
        let url = format!("{}/render", self.endpoint.trim_end_matches('/'));
        debug!("Rendering {} via {}", job.url, url);
        let response = self
            .http
            .post(&url)
            .timeout(job.timeout)
            .json(job)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(EdgeCacheError::Render(format!(
                "render service responded with status {}",
                response.status()
            )));
        }
        let reply: RenderServiceReply = response.json().await?;
        Ok(RenderedPage {
            status: reply.status_code,
            body: Bytes::from(reply.html),
            headers: reply.headers,
        })
    }
}
