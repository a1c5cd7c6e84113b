//! Key-value service over authenticated HTTPS.
//!
//! Single commands are POSTed as a JSON array (`["GET", "key"]`) to the base
//! URL; batches go to `<base>/pipeline` as an array of arrays. Each reply is
//! `{"result": ...}` or `{"error": "..."}`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::config::AgentConfig;
use crate::http_client::build_http_client_with_timeout;

use super::{KvCommand, KvReply, KvStore};

const REQUEST_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Deserialize)]
struct RestReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

pub struct RestKv {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl RestKv {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
            client: build_http_client_with_timeout(Some(Duration::from_secs(
                REQUEST_TIMEOUT_SECS,
            )))?,
        })
    }

    /// `None` when credentials are missing; persistence is then disabled.
    pub fn from_config(config: &AgentConfig) -> Result<Option<Self>> {
        match (config.kv_rest_url.as_deref(), config.kv_rest_token.as_deref()) {
            (Some(url), Some(token)) if !url.trim().is_empty() && !token.trim().is_empty() => {
                Ok(Some(Self::new(url, token)?))
            }
            _ => Ok(None),
        }
    }

    async fn post(&self, url: &str, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach key-value service at {}", self.base_url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            bail!("Key-value service returned error {}: {}", status, body);
        }
        Ok(response)
    }
}

#[async_trait]
impl KvStore for RestKv {
    async fn pipeline(&self, commands: Vec<KvCommand>) -> Result<Vec<KvReply>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let names = commands.iter().map(KvCommand::name).collect::<Vec<_>>();
        let body = Value::from(
            commands
                .iter()
                .map(|command| Value::from(command.to_args()))
                .collect::<Vec<_>>(),
        );

        let url = format!("{}/pipeline", self.base_url);
        let replies: Vec<RestReply> = self
            .post(&url, &body)
            .await?
            .json()
            .await
            .context("Failed to decode key-value pipeline response")?;

        if replies.len() != names.len() {
            bail!(
                "Pipeline returned {} replies for {} commands",
                replies.len(),
                names.len()
            );
        }
        replies
            .into_iter()
            .zip(names)
            .map(|(reply, name)| decode_reply(reply).with_context(|| format!("{} failed", name)))
            .collect()
    }

    async fn exec(&self, command: KvCommand) -> Result<KvReply> {
        let body = Value::from(command.to_args());
        let reply: RestReply = self
            .post(&self.base_url, &body)
            .await?
            .json()
            .await
            .context("Failed to decode key-value response")?;
        decode_reply(reply).with_context(|| format!("{} failed", command.name()))
    }
}

fn decode_reply(reply: RestReply) -> Result<KvReply> {
    if let Some(error) = reply.error {
        bail!("key-value service error: {}", error);
    }
    Ok(match reply.result {
        None | Some(Value::Null) => KvReply::Nil,
        Some(Value::Number(number)) => KvReply::Integer(number.as_i64().unwrap_or_default()),
        Some(Value::String(text)) => KvReply::Text(text),
        Some(Value::Array(items)) => KvReply::List(
            items
                .into_iter()
                .map(|item| match item {
                    Value::String(text) => text,
                    other => other.to_string(),
                })
                .collect(),
        ),
        Some(other) => KvReply::Text(other.to_string()),
    })
}
