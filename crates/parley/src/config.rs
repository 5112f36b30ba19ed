use std::time::Duration;

use config::{Config, Environment};
use serde::Deserialize;

use crate::backends::base::{Chunking, DeltaMode};
use crate::backends::configs::{
    OpenAiBackendConfig, RemoteBackendConfig, ResearchBackendConfig, CHAT_MODEL, OPENAI_HOST,
    RESEARCH_MODEL,
};
use crate::errors::{to_env_var, ConfigError};
use crate::framing::Framing;
use crate::prompt::PromptSettings;
use crate::retry::RetrySettings;

pub const DEFAULT_MODEL: &str = "chat-model";

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiSettings {
    #[serde(default = "default_openai_host")]
    pub host: String,
    pub api_key: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_chat_model")]
    pub model: String,
    /// Regrouping applied to streamed chat text
    #[serde(default = "default_chat_chunking")]
    pub chunking: Chunking,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            model: default_chat_model(),
            chunking: default_chat_chunking(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResearchSettings {
    #[serde(default = "default_research_model")]
    pub model: String,
    #[serde(default = "default_true")]
    pub web_search: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ResearchSettings {
    fn default() -> Self {
        Self {
            model: default_research_model(),
            web_search: true,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSettings {
    pub url: String,
    #[serde(default)]
    pub framing: Framing,
    #[serde(default)]
    pub mode: DeltaMode,
    #[serde(default = "default_remote_model_id")]
    pub model_id: String,
    #[serde(default = "default_remote_name")]
    pub name: String,
    #[serde(default = "default_remote_description")]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamSettings {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl StreamSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Process-wide settings, read once at startup
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub openai: OpenAiSettings,
    #[serde(default)]
    pub chat: ChatSettings,
    #[serde(default)]
    pub research: ResearchSettings,
    #[serde(default)]
    pub remote: Option<RemoteSettings>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub prompt: PromptSettings,
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Settings {
    /// Load settings from `PARLEY_*` environment variables
    pub fn new() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .set_default("openai.host", default_openai_host())?
            .set_default("default_model", default_model())?
            .add_source(
                Environment::with_prefix("PARLEY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(|err| {
            tracing::debug!("Configuration error: {:?}", &err);
            missing_field_error(err)
        })
    }

    pub fn openai_backend_config(&self) -> OpenAiBackendConfig {
        OpenAiBackendConfig {
            host: self.openai.host.clone(),
            api_key: self.openai.api_key.clone(),
            model: self.chat.model.clone(),
            chunking: self.chat.chunking,
            connect_timeout: Duration::from_secs(self.openai.connect_timeout_secs),
        }
    }

    pub fn research_backend_config(&self) -> ResearchBackendConfig {
        ResearchBackendConfig {
            host: self.openai.host.clone(),
            api_key: self.openai.api_key.clone(),
            model: self.research.model.clone(),
            web_search: self.research.web_search,
            request_timeout: Duration::from_secs(self.research.request_timeout_secs),
        }
    }

    pub fn remote_backend_config(&self) -> Option<RemoteBackendConfig> {
        self.remote.as_ref().map(|remote| RemoteBackendConfig {
            url: remote.url.clone(),
            framing: remote.framing,
            delta_mode: remote.mode,
            connect_timeout: Duration::from_secs(self.openai.connect_timeout_secs),
        })
    }
}

/// Turn serde's "missing field `x`" into the variable the user must set
fn missing_field_error(err: config::ConfigError) -> ConfigError {
    let message = err.to_string();
    if let Some(rest) = message.strip_prefix("missing field `") {
        let field = rest.split('`').next().unwrap_or(rest);
        let path = match field {
            "api_key" => "openai.api_key",
            "url" => "remote.url",
            other => other,
        };
        return ConfigError::MissingEnvVar {
            env_var: to_env_var(path),
        };
    }
    if let config::ConfigError::NotFound(field) = &err {
        return ConfigError::MissingEnvVar {
            env_var: to_env_var(field),
        };
    }
    ConfigError::Other(err)
}

fn default_openai_host() -> String {
    OPENAI_HOST.to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_chat_model() -> String {
    CHAT_MODEL.to_string()
}

fn default_chat_chunking() -> Chunking {
    Chunking::Word
}

fn default_research_model() -> String {
    RESEARCH_MODEL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_remote_model_id() -> String {
    "chat-model-agent".to_string()
}

fn default_remote_name() -> String {
    "Agent".to_string()
}

fn default_remote_description() -> String {
    "Multi-step agent served by a separate process".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_channel_capacity() -> usize {
    100
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}
