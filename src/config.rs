use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::ModelCapability;

/// Default port the gateway listens on
pub const DEFAULT_PORT: u16 = 4141;

pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Root configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Socket address the gateway binds to
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub reasoning: ReasoningConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    /// Capability table, consulted before anything fetched from upstream
    #[serde(default)]
    pub models: Vec<ModelCapability>,
}

/// Where requests are sent and how they are authenticated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_chat_completions_url")]
    pub chat_completions_url: String,

    #[serde(default = "default_responses_url")]
    pub responses_url: String,

    /// Optional model listing fetched once at startup
    #[serde(default)]
    pub models_url: Option<String>,

    /// Literal API key. Takes precedence over `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Which models are served through the Responses backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Exact model names
    #[serde(default)]
    pub responses_models: Vec<String>,

    /// Model name prefixes
    #[serde(default = "default_responses_prefixes")]
    pub responses_model_prefixes: Vec<String>,
}

/// How abstract effort levels map onto each model family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Families that take a numeric `thinking_budget` instead of an effort level
    #[serde(default = "default_budget_prefixes")]
    pub budget_model_prefixes: Vec<String>,

    /// Families whose native vocabulary includes `xhigh`
    #[serde(default = "default_xhigh_prefixes")]
    pub xhigh_model_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Minimum number of seconds between two accepted requests
    #[serde(default)]
    pub rate_limit_seconds: Option<u64>,

    /// Wait for the rate limit window instead of failing with 429
    #[serde(default)]
    pub rate_limit_wait: bool,

    /// Ask on the terminal before forwarding each request
    #[serde(default)]
    pub manual_approve: bool,
}

fn default_listen() -> String {
    format!("127.0.0.1:{}", DEFAULT_PORT)
}

fn default_chat_completions_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_responses_url() -> String {
    "https://api.openai.com/v1/responses".to_string()
}

fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_responses_prefixes() -> Vec<String> {
    ["gpt-5", "o3", "o4", "codex"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_budget_prefixes() -> Vec<String> {
    vec!["claude".to_string()]
}

fn default_xhigh_prefixes() -> Vec<String> {
    ["gpt-5.1-codex-max", "gpt-5.2"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            chat_completions_url: default_chat_completions_url(),
            responses_url: default_responses_url(),
            models_url: None,
            api_key: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            responses_models: Vec::new(),
            responses_model_prefixes: default_responses_prefixes(),
        }
    }
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            budget_model_prefixes: default_budget_prefixes(),
            xhigh_model_prefixes: default_xhigh_prefixes(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upstream: UpstreamConfig::default(),
            routing: RoutingConfig::default(),
            reasoning: ReasoningConfig::default(),
            limits: LimitsConfig::default(),
            models: Vec::new(),
        }
    }
}

impl Config {
    /// Returns the default config directory path
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("responses-bridge"))
    }

    /// Returns the full path to the default config file
    pub fn config_file_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Load config from `path` (or the default location), creating a default
    /// file if none exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_file_path().context("Could not determine config directory")?,
        };

        if !config_path.exists() {
            let config = Self::create_default();
            config.save(&config_path)?;
            return Ok(config);
        }

        let contents = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| {
                format!("Failed to create config directory: {}", dir.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Create a default config with a small capability table
    pub fn create_default() -> Self {
        Config {
            models: vec![
                ModelCapability {
                    id: "gpt-5".to_string(),
                    max_output_tokens: Some(128_000),
                },
                ModelCapability {
                    id: "gpt-5.1-codex".to_string(),
                    max_output_tokens: Some(128_000),
                },
                ModelCapability {
                    id: "gpt-4o".to_string(),
                    max_output_tokens: Some(16_384),
                },
                ModelCapability {
                    id: "claude-sonnet-4".to_string(),
                    max_output_tokens: Some(16_000),
                },
            ],
            ..Config::default()
        }
    }

    /// Reject upstream URLs that cannot be parsed
    pub fn validate(&self) -> Result<()> {
        let urls = [
            Some(&self.upstream.chat_completions_url),
            Some(&self.upstream.responses_url),
            self.upstream.models_url.as_ref(),
        ];
        for url in urls.into_iter().flatten() {
            url::Url::parse(url).with_context(|| format!("Invalid upstream URL: {url}"))?;
        }
        Ok(())
    }
}
