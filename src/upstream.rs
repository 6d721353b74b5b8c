//! Upstream HTTP client — one adapter per [`ApiStyle`] dialect.
//!
//! Grounded in the teacher's `backends/openai.rs` two-client pattern
//! (buffered client with a request timeout vs. streaming client without
//! one, shared `default_headers`), extended with per-dialect path/header
//! construction for Azure and native Anthropic. Ollama has no separate
//! adapter here — it speaks the same OpenAI-compatible Chat Completions
//! dialect and is configured as an ordinary `chat_completions` backend.
//!
//! Both clients are bounded: the buffered client by whichever of the
//! backend's `timeout_ms` and the gateway's overall `total_timeout_secs` is
//! tighter, the streaming client by `total_timeout_secs` alone (a per-chunk
//! backend timeout would cut off a still-healthy long-running stream).

use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde_json::Value;

use crate::config::ApiStyle;
use crate::router::RouteTarget;

pub type ByteStream = std::pin::Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One pair of clients (buffered, streaming) per upstream call — built fresh
/// per-request from the routed target, matching the teacher's per-backend
/// client construction.
pub struct UpstreamClient {
    client: Client,
    stream_client: Client,
}

impl UpstreamClient {
    /// `total_timeout_secs` is the gateway's overall client-to-upstream
    /// deadline (`GatewayConfig::total_timeout_secs`); `target.timeout_ms` is
    /// the backend's own per-request bound.
    pub fn new(target: &RouteTarget, total_timeout_secs: u64) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        match target.style {
            ApiStyle::ChatCompletions | ApiStyle::Responses => {
                if let Some(key) = &target.api_key {
                    headers.insert(
                        reqwest::header::AUTHORIZATION,
                        format!("Bearer {key}").parse().context("invalid API key header value")?,
                    );
                }
            }
            ApiStyle::Azure => {
                if let Some(key) = &target.api_key {
                    headers.insert("api-key", key.parse().context("invalid API key header value")?);
                }
            }
            ApiStyle::AnthropicNative => {
                if let Some(key) = &target.api_key {
                    headers.insert("x-api-key", key.parse().context("invalid API key header value")?);
                }
                headers.insert("anthropic-version", ANTHROPIC_VERSION.parse().unwrap());
            }
        }
        headers.insert(reqwest::header::CONTENT_TYPE, "application/json".parse().unwrap());

        let total_timeout = Duration::from_secs(total_timeout_secs);
        let request_timeout = Duration::from_millis(target.timeout_ms).min(total_timeout);

        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(request_timeout)
            .build()
            .context("building buffered upstream client")?;

        let stream_client = Client::builder()
            .default_headers(headers)
            .timeout(total_timeout)
            .build()
            .context("building streaming upstream client")?;

        Ok(Self { client, stream_client })
    }

    fn url(&self, target: &RouteTarget) -> String {
        match target.style {
            ApiStyle::ChatCompletions => format!("{}/v1/chat/completions", target.base_url),
            ApiStyle::Responses => format!("{}/v1/responses", target.base_url),
            ApiStyle::Azure => {
                let deployment = target.azure_deployment.as_deref().unwrap_or(&target.model);
                let api_version = target.azure_api_version.as_deref().unwrap_or("2024-10-21");
                format!(
                    "{}/openai/deployments/{}/chat/completions?api-version={}",
                    target.base_url, deployment, api_version
                )
            }
            ApiStyle::AnthropicNative => format!("{}/v1/messages", target.base_url),
        }
    }

    /// Non-streaming call. Returns the HTTP status and parsed JSON body —
    /// callers classify the status themselves (breaker outcome, error
    /// taxonomy) rather than this layer collapsing non-2xx into an error.
    pub async fn send(&self, target: &RouteTarget, body: &Value) -> anyhow::Result<(reqwest::StatusCode, Value)> {
        let url = self.url(target);
        let response =
            self.client.post(&url).json(body).send().await.with_context(|| format!("POST {url}"))?;
        let status = response.status();
        let text = response.text().await.context("reading upstream response body")?;
        let json: Value = serde_json::from_str(&text)
            .unwrap_or_else(|_| serde_json::json!({"_raw_body": text}));
        Ok((status, json))
    }

    /// Streaming call. Returns the raw byte stream for the streaming
    /// translator to parse as SSE frames.
    pub async fn send_stream(&self, target: &RouteTarget, body: &Value) -> anyhow::Result<ByteStream> {
        let url = self.url(target);
        let response = self
            .stream_client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url} (streaming)"))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("upstream returned HTTP {status} for streaming request: {text}");
        }

        let stream = response.bytes_stream().map(|r| r.map_err(anyhow::Error::from));
        Ok(Box::pin(stream))
    }

    pub async fn health_check(&self, target: &RouteTarget) -> anyhow::Result<()> {
        let url = match target.style {
            ApiStyle::Azure => format!("{}/openai/models?api-version=2024-10-21", target.base_url),
            ApiStyle::AnthropicNative => format!("{}/v1/models", target.base_url),
            _ => format!("{}/v1/models", target.base_url),
        };
        let response = self.client.get(&url).send().await.with_context(|| format!("GET {url}"))?;
        anyhow::ensure!(response.status().is_success(), "health check returned HTTP {}", response.status());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouteTargetId;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target(style: ApiStyle, base_url: String) -> RouteTarget {
        RouteTarget {
            id: RouteTargetId { backend: "test".into(), model: "gpt-4o".into() },
            style,
            base_url,
            model: "gpt-4o".into(),
            api_key: Some("sk-test".into()),
            azure_deployment: Some("gpt-4o".into()),
            azure_api_version: Some("2024-10-21".into()),
            timeout_ms: 5000,
        }
    }

    #[tokio::test]
    async fn sends_chat_completions_request_and_parses_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let t = target(ApiStyle::ChatCompletions, server.uri());
        let client = UpstreamClient::new(&t, 600).unwrap();
        let (status, body) = client.send(&t, &serde_json::json!({"model": "gpt-4o"})).await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn azure_style_hits_deployment_path_with_api_version() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/deployments/gpt-4o/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let t = target(ApiStyle::Azure, server.uri());
        let client = UpstreamClient::new(&t, 600).unwrap();
        let (status, _) = client.send(&t, &serde_json::json!({})).await.unwrap();
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn non_2xx_status_is_returned_not_errored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({"error": "boom"})))
            .mount(&server)
            .await;

        let t = target(ApiStyle::ChatCompletions, server.uri());
        let client = UpstreamClient::new(&t, 600).unwrap();
        let (status, body) = client.send(&t, &serde_json::json!({})).await.unwrap();
        assert_eq!(status, 500);
        assert_eq!(body["error"], "boom");
    }

    #[tokio::test]
    async fn health_check_succeeds_on_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/v1/models")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let t = target(ApiStyle::ChatCompletions, server.uri());
        let client = UpstreamClient::new(&t, 600).unwrap();
        assert!(client.health_check(&t).await.is_ok());
    }
}
