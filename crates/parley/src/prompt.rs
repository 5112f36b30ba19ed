//! System prompt construction.
//!
//! The prompt is a persona line followed by the request-origin block, and for
//! backends that can use tools, guidance for each active capability. It is
//! rendered with tera from the embedded `prompts/system.md` unless a template
//! file is configured.
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tera::{Context, Error as TeraError, Tera};

use crate::models::request::{Capabilities, RequestHints};

pub const DEFAULT_PERSONA: &str =
    "You are a friendly assistant! Keep your responses concise and helpful.";

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptSettings {
    #[serde(default)]
    pub persona: Option<String>,
    #[serde(default)]
    pub template: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct SystemPromptContext<'a> {
    persona: &'a str,
    latitude: String,
    longitude: String,
    city: &'a str,
    country: &'a str,
    guidance: Vec<&'static str>,
}

pub fn render<T: Serialize>(template: &str, context_data: &T) -> Result<String, TeraError> {
    let mut tera = Tera::default();
    tera.add_raw_template("system", template)?;
    let context = Context::from_serialize(context_data)?;
    tera.render("system", &context)
}

fn read_template(path: &Path) -> Result<String, TeraError> {
    fs::read_to_string(path).map_err(|e| {
        TeraError::chain(format!("Failed to read template {}", path.display()), e)
    })
}

/// Builds system prompts from the configured persona and template
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    persona: String,
    template: String,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self {
            persona: DEFAULT_PERSONA.to_string(),
            template: SYSTEM_TEMPLATE.to_string(),
        }
    }
}

impl PromptBuilder {
    pub fn from_settings(settings: &PromptSettings) -> Result<Self, TeraError> {
        let template = match &settings.template {
            Some(path) => read_template(path)?,
            None => SYSTEM_TEMPLATE.to_string(),
        };
        // fail at startup rather than on the first request
        Tera::default().add_raw_template("system", &template)?;

        Ok(Self {
            persona: settings
                .persona
                .clone()
                .unwrap_or_else(|| DEFAULT_PERSONA.to_string()),
            template,
        })
    }

    /// Render the system prompt. `capabilities` is empty for backends that
    /// cannot act on tool guidance.
    pub fn build(
        &self,
        hints: &RequestHints,
        capabilities: &Capabilities,
    ) -> Result<String, TeraError> {
        let context = SystemPromptContext {
            persona: &self.persona,
            latitude: format_coordinate(hints.latitude),
            longitude: format_coordinate(hints.longitude),
            city: hints.city.as_deref().unwrap_or("unknown"),
            country: hints.country.as_deref().unwrap_or("unknown"),
            guidance: capabilities.iter().map(|c| c.guidance()).collect(),
        };
        Ok(render(&self.template, &context)?.trim().to_string())
    }
}

fn format_coordinate(value: Option<f64>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
