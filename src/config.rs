//! Configuration types for chat-relay.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens its port. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults.
//!
//! # Example
//! ```toml
//! [server]
//! port = 3000
//! unavailable_models = ["chatgpt-4"]
//!
//! [allow_list]
//! "chatgpt-3.5"          = ["alice", "bob"]
//! "bing_chatgpt-browser" = ["alice"]
//!
//! [openai]
//! api_key_env = "OPENAI_API_KEY"
//!
//! [browser]
//! access_token_env   = "CHATGPT_ACCESS_TOKEN"
//! reverse_proxy_urls = ["https://proxy-a/api/conversation", "https://proxy-b/api/conversation"]
//!
//! [bing]
//! user_token_env = "BING_USER_TOKEN"
//! ```

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::model::ModelId;

/// Top-level relay configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Allow-list group → user identifiers permitted to use that group.
    ///
    /// Group names come from [`ModelId::allow_group`].
    #[serde(default)]
    pub allow_list: HashMap<String, Vec<String>>,

    /// Official completion API. Requests for `chatgpt-*` fail when absent.
    #[serde(default)]
    pub openai: Option<OpenAiConfig>,

    /// Browser-session reverse proxies. Requests for `chatgpt-browser-*` fail when absent.
    #[serde(default)]
    pub browser: Option<BrowserConfig>,

    /// Search-engine chat. Requests for `bing-*` fail when absent.
    #[serde(default)]
    pub bing: Option<BingConfig>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        // Every allow-list key must be a group some model authorises against
        let groups: HashSet<&str> = ModelId::ALL.iter().map(|m| m.allow_group()).collect();
        for group in self.allow_list.keys() {
            anyhow::ensure!(
                groups.contains(group.as_str()),
                "[allow_list] has unknown group `{}`",
                group
            );
        }

        for model in &self.server.unavailable_models {
            anyhow::ensure!(
                model.parse::<ModelId>().is_ok(),
                "[server] unavailable_models lists unknown model `{}`",
                model
            );
        }

        if let Some(browser) = &self.browser {
            anyhow::ensure!(
                browser.reverse_proxy_urls.len() >= 2,
                "[browser] reverse_proxy_urls needs two entries (proxy A and proxy B), got {}",
                browser.reverse_proxy_urls.len()
            );
        }

        if let Some(openai) = &self.openai {
            anyhow::ensure!(
                openai.max_response_tokens < openai.max_model_tokens,
                "[openai] max_response_tokens ({}) must be below max_model_tokens ({})",
                openai.max_response_tokens,
                openai.max_model_tokens
            );
            anyhow::ensure!(
                openai.max_stored_messages > 0,
                "[openai] max_stored_messages must be at least 1"
            );
        }

        Ok(())
    }

    /// Whether `user` may call `model`.
    pub fn is_allowed(&self, user: &str, model: ModelId) -> bool {
        self.allow_list
            .get(model.allow_group())
            .is_some_and(|users| users.iter().any(|u| u == user))
    }

    /// Whether `model` is switched off and should get the placeholder reply.
    pub fn is_unavailable(&self, model: ModelId) -> bool {
        self.server
            .unavailable_models
            .iter()
            .any(|m| m == model.as_str())
    }
}

/// Listener, static assets and usage-log settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    #[serde(default = "defaults::host")]
    pub host: String,

    /// Port for the HTTP listener (default: 3000).
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Directory holding the built front-end (default: `./build`).
    #[serde(default = "defaults::static_dir")]
    pub static_dir: PathBuf,

    /// Directory for per-user usage logs (default: `./logs`).
    #[serde(default = "defaults::log_dir")]
    pub log_dir: PathBuf,

    /// Model selectors that answer with a fixed "temporarily unavailable"
    /// reply instead of calling their backend.
    #[serde(default)]
    pub unavailable_models: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::host(),
            port: defaults::port(),
            static_dir: defaults::static_dir(),
            log_dir: defaults::log_dir(),
            unavailable_models: Vec::new(),
        }
    }
}

/// Official completion API (`/v1/chat/completions`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenAiConfig {
    /// Base URL without the trailing `/v1` (added by the client).
    #[serde(default = "defaults::openai_base_url")]
    pub base_url: String,

    /// Environment variable name whose value is the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Request timeout in milliseconds (default: 300 000).
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "defaults::one")]
    pub temperature: f32,

    #[serde(default = "defaults::one")]
    pub top_p: f32,

    #[serde(default = "defaults::one")]
    pub presence_penalty: f32,

    /// Context window of the model; prompt history is trimmed to fit.
    #[serde(default = "defaults::max_model_tokens")]
    pub max_model_tokens: usize,

    /// Tokens reserved for the reply.
    #[serde(default = "defaults::max_response_tokens")]
    pub max_response_tokens: usize,

    /// Replaces the built-in system message when set.
    #[serde(default)]
    pub system_message: Option<String>,

    /// Messages kept for rebuilding history, per model; oldest are evicted first.
    #[serde(default = "defaults::max_stored_messages")]
    pub max_stored_messages: usize,
}

impl OpenAiConfig {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        resolve_env(self.api_key_env.as_deref())
    }
}

/// Browser-session reverse proxies.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrowserConfig {
    /// Environment variable holding the browser session access token.
    #[serde(default)]
    pub access_token_env: Option<String>,

    /// Full conversation endpoint URLs; index 0 is proxy A, index 1 is proxy B.
    pub reverse_proxy_urls: Vec<String>,

    /// Model name sent to the proxy.
    #[serde(default = "defaults::browser_model")]
    pub model: String,

    /// Environment variable holding an optional `Cookie` header value.
    #[serde(default)]
    pub cookies_env: Option<String>,

    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
}

impl BrowserConfig {
    pub fn access_token(&self) -> Option<String> {
        resolve_env(self.access_token_env.as_deref())
    }

    pub fn cookies(&self) -> Option<String> {
        resolve_env(self.cookies_env.as_deref())
    }
}

/// Search-engine chat service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BingConfig {
    /// Origin used to create conversations.
    #[serde(default = "defaults::bing_host")]
    pub host: String,

    /// Websocket endpoint of the chat hub.
    #[serde(default = "defaults::bing_chathub_url")]
    pub chathub_url: String,

    /// Environment variable holding the `_U` cookie value.
    #[serde(default)]
    pub user_token_env: Option<String>,

    /// Environment variable holding a full `Cookie` header; wins over `user_token_env`.
    #[serde(default)]
    pub cookies_env: Option<String>,

    #[serde(default)]
    pub tone_style: ToneStyle,

    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
}

impl BingConfig {
    /// The `Cookie` header to send when creating a conversation, if any.
    pub fn cookie_header(&self) -> Option<String> {
        resolve_env(self.cookies_env.as_deref()).or_else(|| {
            resolve_env(self.user_token_env.as_deref()).map(|token| format!("_U={token}"))
        })
    }
}

/// Conversation style requested from the search-engine chat.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToneStyle {
    #[default]
    Creative,
    Balanced,
    Precise,
}

impl std::fmt::Display for ToneStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Creative => "creative",
            Self::Balanced => "balanced",
            Self::Precise => "precise",
        })
    }
}

fn resolve_env(var: Option<&str>) -> Option<String> {
    var.and_then(|v| std::env::var(v).ok())
        .filter(|v| !v.is_empty())
}

mod defaults {
    use std::path::PathBuf;

    pub fn host() -> String { "0.0.0.0".into() }
    pub fn port() -> u16 { 3000 }
    pub fn static_dir() -> PathBuf { PathBuf::from("./build") }
    pub fn log_dir() -> PathBuf { PathBuf::from("./logs") }
    pub fn timeout_ms() -> u64 { 5 * 60 * 1000 }
    pub fn one() -> f32 { 1.0 }
    pub fn max_model_tokens() -> usize { 4096 }
    pub fn max_response_tokens() -> usize { 1000 }
    pub fn max_stored_messages() -> usize { 10_000 }
    pub fn openai_base_url() -> String { "https://api.openai.com".into() }
    pub fn browser_model() -> String { "text-davinci-002-render-sha".into() }
    pub fn bing_host() -> String { "https://www.bing.com".into() }
    pub fn bing_chathub_url() -> String { "wss://sydney.bing.com/sydney/ChatHub".into() }
}
