use std::sync::Arc;

use serde::Serialize;
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, EnumIter};

use super::base::{Backend, BackendKind};
use super::openai::ChatCompletionsBackend;
use super::remote::RemoteBackend;
use super::research::ResearchBackend;
use crate::config::Settings;
use crate::errors::RegistryError;

/// Model ids that are always registered
#[derive(EnumIter, AsRefStr, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinModel {
    #[strum(serialize = "chat-model")]
    Chat,
    #[strum(serialize = "chat-model-reasoning")]
    Reasoning,
}

impl BuiltinModel {
    pub fn info(&self) -> ModelInfo {
        match self {
            BuiltinModel::Chat => ModelInfo {
                id: self.as_ref().to_string(),
                name: "GPT-4.1".to_string(),
                description: "Direct streaming completion with tool guidance".to_string(),
                kind: BackendKind::Completion,
            },
            BuiltinModel::Reasoning => ModelInfo {
                id: self.as_ref().to_string(),
                name: "Deep-Research".to_string(),
                description: "Autonomous web research returning one sourced report".to_string(),
                kind: BackendKind::Research,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: BackendKind,
}

#[derive(Clone)]
pub struct RegisteredBackend {
    pub info: ModelInfo,
    pub backend: Arc<dyn Backend>,
}

/// Model id to backend map, built once and shared read-only
pub struct BackendRegistry {
    entries: Vec<RegisteredBackend>,
    default_model: String,
}

impl BackendRegistry {
    pub fn new<S: Into<String>>(default_model: S) -> Self {
        Self {
            entries: Vec::new(),
            default_model: default_model.into(),
        }
    }

    /// Register a backend; a later registration replaces one with the same id
    pub fn register(&mut self, info: ModelInfo, backend: Arc<dyn Backend>) {
        self.entries.retain(|entry| entry.info.id != info.id);
        self.entries.push(RegisteredBackend { info, backend });
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, RegistryError> {
        let mut registry = Self::new(settings.default_model.clone());

        for model in BuiltinModel::iter() {
            let backend: Arc<dyn Backend> = match model {
                BuiltinModel::Chat => Arc::new(
                    ChatCompletionsBackend::new(settings.openai_backend_config())
                        .map_err(|source| build_error(model.as_ref(), source))?,
                ),
                BuiltinModel::Reasoning => Arc::new(
                    ResearchBackend::new(settings.research_backend_config())
                        .map_err(|source| build_error(model.as_ref(), source))?,
                ),
            };
            registry.register(model.info(), backend);
        }

        if let (Some(remote), Some(config)) = (&settings.remote, settings.remote_backend_config()) {
            let backend = RemoteBackend::new(config)
                .map_err(|source| build_error(&remote.model_id, source))?;
            registry.register(
                ModelInfo {
                    id: remote.model_id.clone(),
                    name: remote.name.clone(),
                    description: remote.description.clone(),
                    kind: BackendKind::Remote,
                },
                Arc::new(backend),
            );
        }

        // surface a bad default at startup
        registry.get(&registry.default_model).ok_or_else(|| {
            RegistryError::UnknownModel(registry.default_model.clone())
        })?;

        Ok(registry)
    }

    pub fn get(&self, model: &str) -> Option<&RegisteredBackend> {
        self.entries.iter().find(|entry| entry.info.id == model)
    }

    /// Resolve a model id, falling back to the default for unknown ids
    pub fn select(&self, model: &str) -> Result<&RegisteredBackend, RegistryError> {
        if let Some(entry) = self.get(model) {
            return Ok(entry);
        }
        tracing::warn!(
            requested = model,
            fallback = %self.default_model,
            "Unknown model, using default"
        );
        self.get(&self.default_model)
            .ok_or_else(|| RegistryError::UnknownModel(self.default_model.clone()))
    }

    pub fn models(&self) -> Vec<ModelInfo> {
        self.entries.iter().map(|entry| entry.info.clone()).collect()
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }
}

fn build_error(model: &str, source: anyhow::Error) -> RegistryError {
    RegistryError::Build {
        model: model.to_string(),
        source,
    }
}
