use std::time::Duration;

use crate::backends::base::{Chunking, DeltaMode};
use crate::framing::Framing;

pub const OPENAI_HOST: &str = "https://api.openai.com";
pub const CHAT_MODEL: &str = "gpt-4.1";
pub const RESEARCH_MODEL: &str = "o4-mini-deep-research";

#[derive(Debug, Clone)]
pub struct OpenAiBackendConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub chunking: Chunking,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ResearchBackendConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub web_search: bool,
    /// Research runs are single requests that can take minutes
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RemoteBackendConfig {
    pub url: String,
    pub framing: Framing,
    pub delta_mode: DeltaMode,
    pub connect_timeout: Duration,
}
