use std::sync::Arc;

use parley::backends::factory::BackendRegistry;
use parley::config::{Settings, StreamSettings};
use parley::orchestrator::Orchestrator;
use parley::prompt::PromptBuilder;
use parley::retry::RetryPolicy;

/// Shared application state, read-only after startup
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<BackendRegistry>,
    pub prompts: Arc<PromptBuilder>,
    pub retry: RetryPolicy,
    pub stream: StreamSettings,
}

impl AppState {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            registry: Arc::new(BackendRegistry::from_settings(settings)?),
            prompts: Arc::new(PromptBuilder::from_settings(&settings.prompt)?),
            retry: RetryPolicy::from(&settings.retry),
            stream: settings.stream.clone(),
        })
    }

    /// A fresh orchestrator for one invocation
    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.registry.clone())
            .with_prompts(self.prompts.clone())
            .with_retry(self.retry)
            .with_idle_timeout(self.stream.idle_timeout())
    }
}
