//! Outbound integrations: URL fetch, web search (grounding), commerce cache
//! sync and image generation.
//!
//! Integrations without configured endpoints stay registered but answer
//! with `ToolOutput::Disabled`, so one missing credential never breaks a
//! turn.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{is_set, AgentConfig};
use crate::http_client::build_http_client_with_timeout;
use crate::state::mutations::StateDelta;
use crate::state::{GroundingRef, JournalKind};

use super::{
    optional_str, required_str, Tool, ToolContext, ToolKind, ToolOutcome, ToolOutput,
};

const FETCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RESPONSE_BYTES: usize = 64 * 1024;
const MAX_MAX_RESPONSE_BYTES: usize = 512 * 1024;
const GENERATION_TIMEOUT_SECS: u64 = 300;

/// Base URL plus optional bearer credential.
#[derive(Debug, Clone)]
struct Endpoint {
    url: String,
    key: Option<String>,
}

impl Endpoint {
    fn from_config(url: &Option<String>, key: &Option<String>) -> Option<Self> {
        if !is_set(url) {
            return None;
        }
        Some(Self {
            url: url.as_deref().unwrap_or_default().trim().trim_end_matches('/').to_string(),
            key: key.clone().filter(|k| !k.trim().is_empty()),
        })
    }

    fn request(&self, client: &reqwest::Client, method: Method, url: &str) -> reqwest::RequestBuilder {
        let req = client.request(method, url);
        match &self.key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

pub fn tools(config: &AgentConfig) -> Result<Vec<Arc<dyn Tool>>> {
    let fetch_client = build_http_client_with_timeout(Some(Duration::from_secs(FETCH_TIMEOUT_SECS)))?;
    let slow_client =
        build_http_client_with_timeout(Some(Duration::from_secs(GENERATION_TIMEOUT_SECS)))?;
    Ok(vec![
        Arc::new(HttpFetchTool {
            client: fetch_client.clone(),
        }),
        Arc::new(WebSearchTool {
            endpoint: Endpoint::from_config(&config.search_api_url, &config.search_api_key),
            client: fetch_client.clone(),
        }),
        Arc::new(SyncCommerceTool {
            endpoint: Endpoint::from_config(&config.commerce_api_url, &config.commerce_api_token),
            client: fetch_client,
        }),
        Arc::new(GenerateImageTool {
            endpoint: Endpoint::from_config(&config.image_api_url, &config.image_api_key),
            client: slow_client,
        }),
    ])
}

async fn ensure_success(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("{} returned error {}: {}", what, status, body);
    }
    Ok(response)
}

pub struct HttpFetchTool {
    client: reqwest::Client,
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn name(&self) -> &str {
        "http_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a public URL (GET or POST) and return a truncated preview of the response."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "Target URL to fetch" },
                "method": {
                    "type": "string",
                    "enum": ["GET", "POST"],
                    "description": "HTTP method (default GET)"
                },
                "headers": {
                    "type": "object",
                    "description": "Optional HTTP headers as key/value strings",
                    "additionalProperties": { "type": "string" }
                },
                "body_json": { "description": "Optional JSON request body" },
                "max_response_bytes": {
                    "type": "integer",
                    "description": "Maximum response bytes captured (default 65536, max 524288)"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let url_input = required_str(&params, "url")?;
        let method = match optional_str(&params, "method")
            .unwrap_or("GET")
            .to_ascii_uppercase()
            .as_str()
        {
            "GET" => Method::GET,
            "POST" => Method::POST,
            other => {
                return Ok(ToolOutcome::error(format!(
                    "Unsupported method '{}'. Use GET or POST.",
                    other
                )))
            }
        };

        let url = match Url::parse(url_input) {
            Ok(url) => url,
            Err(e) => {
                return Ok(ToolOutcome::error(format!(
                    "Invalid URL '{}': {}",
                    url_input, e
                )))
            }
        };
        if !matches!(url.scheme(), "http" | "https") {
            return Ok(ToolOutcome::error(
                "Only http:// and https:// URLs are supported",
            ));
        }
        if let Err(reason) = validate_destination(&url).await {
            return Ok(ToolOutcome::error(reason));
        }

        let max_response_bytes = params
            .get("max_response_bytes")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_RESPONSE_BYTES)
            .clamp(1, MAX_MAX_RESPONSE_BYTES);
        let headers = match parse_headers(params.get("headers")) {
            Ok(headers) => headers,
            Err(e) => return Ok(ToolOutcome::error(e)),
        };

        let mut req = self.client.request(method.clone(), url.clone());
        for (key, value) in &headers {
            req = req.header(key, value);
        }
        if let Some(body) = params.get("body_json") {
            req = req.json(body);
        }

        let mut response = match req.send().await {
            Ok(resp) => resp,
            Err(e) => return Ok(ToolOutcome::error(format!("HTTP request failed: {}", e))),
        };
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response
            .chunk()
            .await
            .context("Failed reading response body")?
        {
            let remaining = max_response_bytes - body.len();
            if chunk.len() > remaining {
                body.extend_from_slice(&chunk[..remaining]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(ToolOutcome::output(ToolOutput::Json(json!({
            "url": url.as_str(),
            "method": method.as_str(),
            "status_code": status.as_u16(),
            "content_type": content_type,
            "body_preview": String::from_utf8_lossy(&body),
            "body_truncated": truncated,
        }))))
    }
}

fn parse_headers(value: Option<&Value>) -> std::result::Result<BTreeMap<String, String>, String> {
    let mut headers = BTreeMap::new();
    let Some(headers_value) = value else {
        return Ok(headers);
    };
    let Some(obj) = headers_value.as_object() else {
        return Err("'headers' must be an object of string values".to_string());
    };
    for (key, value) in obj {
        let Some(val_str) = value.as_str() else {
            return Err(format!("Header '{}' must be a string", key));
        };
        headers.insert(key.clone(), val_str.to_string());
    }
    Ok(headers)
}

async fn validate_destination(url: &Url) -> std::result::Result<(), String> {
    let host = url
        .host_str()
        .ok_or_else(|| "URL is missing a host".to_string())?;
    let host_lower = host.to_ascii_lowercase();
    if host_lower == "localhost"
        || host_lower.ends_with(".localhost")
        || host_lower.ends_with(".local")
    {
        return Err(format!("Blocked local/private host '{}'", host));
    }

    if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        if is_private_or_local_ip(ip) {
            return Err(format!("Blocked private/local IP destination '{}'", host));
        }
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(80);
    match tokio::net::lookup_host((host, port)).await {
        Ok(resolved) => {
            for addr in resolved {
                if is_private_or_local_ip(addr.ip()) {
                    return Err(format!(
                        "Blocked destination '{}' resolved to private/local address {}",
                        host,
                        addr.ip()
                    ));
                }
            }
            Ok(())
        }
        Err(e) => {
            tracing::debug!("Could not pre-resolve '{}': {}", host, e);
            Ok(())
        }
    }
}

fn is_private_or_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.is_multicast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    title: String,
    url: String,
    #[serde(default)]
    snippet: Option<String>,
}

pub struct WebSearchTool {
    endpoint: Option<Endpoint>,
    client: reqwest::Client,
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web and answer with cited sources. The answer is shown to the user directly and ends your turn."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" }
            },
            "required": ["query"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Grounding
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(ToolOutcome::disabled("web search is not configured"));
        };
        let query = required_str(&params, "query")?;

        let response = endpoint
            .request(&self.client, Method::POST, &endpoint.url)
            .json(&json!({ "query": query }))
            .send()
            .await
            .context("Search request failed")?;
        let parsed: SearchResponse = ensure_success(response, "Search service")
            .await?
            .json()
            .await
            .context("Failed to decode search response")?;

        Ok(ToolOutcome::output(grounded_answer(query, parsed)))
    }
}

fn grounded_answer(query: &str, response: SearchResponse) -> ToolOutput {
    let text = match response.answer.filter(|a| !a.trim().is_empty()) {
        Some(answer) => answer,
        None if response.results.is_empty() => format!("I found nothing for \"{}\".", query),
        None => response
            .results
            .iter()
            .map(|hit| match &hit.snippet {
                Some(snippet) => format!("- {}: {}", hit.title, snippet),
                None => format!("- {}", hit.title),
            })
            .collect::<Vec<_>>()
            .join("\n"),
    };
    ToolOutput::Grounded {
        text,
        refs: response
            .results
            .into_iter()
            .map(|hit| GroundingRef {
                title: hit.title,
                uri: hit.url,
            })
            .collect(),
    }
}

const COMMERCE_RESOURCES: [&str; 4] = ["products", "orders", "collections", "pages"];

pub struct SyncCommerceTool {
    endpoint: Option<Endpoint>,
    client: reqwest::Client,
}

impl SyncCommerceTool {
    async fn fetch(&self, endpoint: &Endpoint, resource: &str) -> Result<Vec<Value>> {
        let url = format!("{}/{}", endpoint.url, resource);
        let response = endpoint
            .request(&self.client, Method::GET, &url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", resource))?;
        let body: Value = ensure_success(response, "Commerce API")
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to decode {}", resource))?;
        match body {
            Value::Array(items) => Ok(items),
            Value::Object(mut map) => match map.remove(resource).or_else(|| map.remove("items")) {
                Some(Value::Array(items)) => Ok(items),
                _ => anyhow::bail!("Commerce API response for {} has no item list", resource),
            },
            _ => anyhow::bail!("Commerce API response for {} is not a list", resource),
        }
    }
}

#[async_trait]
impl Tool for SyncCommerceTool {
    fn name(&self) -> &str {
        "sync_commerce"
    }

    fn description(&self) -> &str {
        "Refresh your cached store data (products, orders, collections, pages) from the commerce platform."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "resource": {
                    "type": "string",
                    "enum": ["products", "orders", "collections", "pages", "all"],
                    "description": "Which cache to refresh (default all)"
                }
            }
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(ToolOutcome::disabled("commerce platform is not configured"));
        };
        let selected = match optional_str(&params, "resource").unwrap_or("all") {
            "all" => COMMERCE_RESOURCES.to_vec(),
            one if COMMERCE_RESOURCES.contains(&one) => vec![one],
            other => {
                return Ok(ToolOutcome::error(format!(
                    "Unknown commerce resource '{}'",
                    other
                )))
            }
        };

        let mut delta = StateDelta::default();
        let mut counts = serde_json::Map::new();
        for resource in selected {
            let items = self.fetch(endpoint, resource).await?;
            counts.insert(resource.to_string(), json!(items.len()));
            match resource {
                "products" => delta.products = Some(items),
                "orders" => delta.orders = Some(items),
                "collections" => delta.collections = Some(items),
                _ => delta.pages = Some(items),
            }
        }
        let summary = counts
            .iter()
            .map(|(resource, count)| format!("{} {}", count, resource))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(ToolOutcome::with_delta(
            ToolOutput::Json(Value::Object(counts)),
            delta.with_journal(JournalKind::System, format!("Commerce sync: {}.", summary)),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    data: String,
    #[serde(default = "default_image_mime")]
    mime_type: String,
}

fn default_image_mime() -> String {
    "image/png".to_string()
}

pub struct GenerateImageTool {
    endpoint: Option<Endpoint>,
    client: reqwest::Client,
}

#[async_trait]
impl Tool for GenerateImageTool {
    fn name(&self) -> &str {
        "generate_image"
    }

    fn description(&self) -> &str {
        "Generate an image from a text prompt. Takes a while; the image is shown to the user when ready."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string" }
            },
            "required": ["prompt"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Generative
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(ToolOutcome::disabled("image generation is not configured"));
        };
        let prompt = required_str(&params, "prompt")?;

        let response = endpoint
            .request(&self.client, Method::POST, &endpoint.url)
            .json(&json!({ "prompt": prompt }))
            .send()
            .await
            .context("Image generation request failed")?;
        let response = ensure_success(response, "Image service").await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let image = if content_type.starts_with("image/") {
            let bytes = response.bytes().await.context("Failed to read image bytes")?;
            ImageResponse {
                data: base64::engine::general_purpose::STANDARD.encode(&bytes),
                mime_type: content_type,
            }
        } else {
            response
                .json::<ImageResponse>()
                .await
                .context("Failed to decode image response")?
        };

        Ok(ToolOutcome::output(ToolOutput::Media {
            mime_type: image.mime_type,
            data: image.data,
            caption: Some(prompt.to_string()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AgentState;

    #[test]
    fn private_ip_detection_blocks_local_ranges() {
        assert!(is_private_or_local_ip("127.0.0.1".parse().unwrap()));
        assert!(is_private_or_local_ip("10.0.0.1".parse().unwrap()));
        assert!(is_private_or_local_ip("::1".parse().unwrap()));
        assert!(!is_private_or_local_ip("1.1.1.1".parse().unwrap()));
    }

    #[test]
    fn parse_headers_requires_string_values() {
        assert!(parse_headers(Some(&json!({"x-test": 5}))).is_err());
        assert_eq!(parse_headers(None).unwrap().len(), 0);
    }

    #[test]
    fn grounded_answer_carries_citations() {
        let output = grounded_answer(
            "rust",
            SearchResponse {
                answer: None,
                results: vec![SearchHit {
                    title: "The Rust Book".to_string(),
                    url: "https://doc.rust-lang.org/book/".to_string(),
                    snippet: Some("Learn Rust".to_string()),
                }],
            },
        );
        let ToolOutput::Grounded { text, refs } = output else {
            panic!("expected grounded output");
        };
        assert!(text.contains("Learn Rust"));
        assert_eq!(refs[0].uri, "https://doc.rust-lang.org/book/");
    }

    #[tokio::test]
    async fn unconfigured_integrations_report_disabled() {
        let state = AgentState::seed("Ada");
        let ctx = ToolContext {
            state: &state,
            autonomous: false,
        };
        for tool in tools(&AgentConfig::default()).unwrap() {
            if tool.name() == "http_fetch" {
                continue;
            }
            let outcome = tool
                .execute(json!({"query": "q", "prompt": "p"}), &ctx)
                .await
                .unwrap();
            assert!(
                matches!(outcome.output, ToolOutput::Disabled { .. }),
                "{} should be disabled",
                tool.name()
            );
        }
    }

    #[tokio::test]
    async fn fetch_blocks_loopback_before_sending() {
        let state = AgentState::seed("Ada");
        let ctx = ToolContext {
            state: &state,
            autonomous: false,
        };
        let tool = HttpFetchTool {
            client: reqwest::Client::new(),
        };
        let outcome = tool
            .execute(json!({"url": "http://127.0.0.1:9/secret"}), &ctx)
            .await
            .unwrap();
        assert!(matches!(outcome.output, ToolOutput::Error(_)));
    }
}
