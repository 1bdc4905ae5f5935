//! Model capability registry.
//!
//! Maps a model id to its maximum output token count. Entries come from the
//! `[[models]]` table in the config and, optionally, from the upstream
//! `/models` listing fetched once at startup. The registry is read-only once
//! the server is running.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use reqwest::header;
use serde::{Deserialize, Serialize};

/// Capabilities the gateway cares about for a single model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapability {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    order: Vec<String>,
    by_id: HashMap<String, ModelCapability>,
}

impl ModelRegistry {
    pub fn new(models: impl IntoIterator<Item = ModelCapability>) -> Self {
        let mut registry = Self::default();
        registry.merge(models);
        registry
    }

    /// Add entries that are not registered yet. Existing entries win, so
    /// configured values override anything fetched later.
    pub fn merge(&mut self, models: impl IntoIterator<Item = ModelCapability>) {
        for model in models {
            let key = model.id.to_ascii_lowercase();
            if self.by_id.contains_key(&key) {
                continue;
            }
            self.order.push(key.clone());
            self.by_id.insert(key, model);
        }
    }

    pub fn get(&self, model: &str) -> Option<&ModelCapability> {
        self.by_id.get(&model.to_ascii_lowercase())
    }

    pub fn max_output_tokens(&self, model: &str) -> Option<u32> {
        self.get(model).and_then(|m| m.max_output_tokens)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Render the registry in the OpenAI `/models` list format
    pub fn to_model_list(&self) -> ModelList {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let data = self
            .order
            .iter()
            .filter_map(|key| self.by_id.get(key))
            .map(|m| ModelEntry {
                id: m.id.clone(),
                object: "model".to_string(),
                created,
                owned_by: "responses-bridge".to_string(),
            })
            .collect();

        ModelList {
            object: "list".to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
}

/// Upstream `/models` listing. Accepts both a flat `max_output_tokens` and
/// the nested `capabilities.limits.max_output_tokens` shape.
#[derive(Debug, Deserialize)]
struct UpstreamModelsResponse {
    data: Vec<UpstreamModel>,
}

#[derive(Debug, Deserialize)]
struct UpstreamModel {
    id: String,
    #[serde(default)]
    max_output_tokens: Option<u32>,
    #[serde(default)]
    capabilities: Option<UpstreamCapabilities>,
}

#[derive(Debug, Deserialize)]
struct UpstreamCapabilities {
    #[serde(default)]
    limits: Option<UpstreamLimits>,
}

#[derive(Debug, Deserialize)]
struct UpstreamLimits {
    #[serde(default)]
    max_output_tokens: Option<u32>,
}

impl From<UpstreamModel> for ModelCapability {
    fn from(model: UpstreamModel) -> Self {
        let nested = model
            .capabilities
            .and_then(|c| c.limits)
            .and_then(|l| l.max_output_tokens);
        ModelCapability {
            id: model.id,
            max_output_tokens: model.max_output_tokens.or(nested),
        }
    }
}

fn parse_models_response(body: &str) -> Result<Vec<ModelCapability>> {
    let parsed: UpstreamModelsResponse =
        serde_json::from_str(body).context("Failed to parse models response")?;
    Ok(parsed.data.into_iter().map(ModelCapability::from).collect())
}

/// Fetch the upstream model listing
pub async fn fetch_models(
    client: &reqwest::Client,
    url: &str,
    auth_header: Option<&str>,
) -> Result<Vec<ModelCapability>> {
    let mut builder = client.get(url);
    if let Some(auth) = auth_header {
        builder = builder.header(header::AUTHORIZATION, auth);
    }

    let response = builder
        .send()
        .await
        .with_context(|| format!("Failed to connect to {url}"))?
        .error_for_status()
        .context("Models endpoint returned an error response")?;

    let body = response.text().await.context("Failed to read models response")?;
    parse_models_response(&body)
}
