use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// Where the request came from; used only to build the system prompt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestHints {
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

/// Tool integrations the interface has switched on for a request
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum Capability {
    GetWeather,
    CreateDocument,
    UpdateDocument,
    RequestSuggestions,
    WebSearch,
}

impl Capability {
    /// Guidance added to the system prompt when the capability is active
    pub fn guidance(&self) -> &'static str {
        match self {
            Capability::GetWeather => {
                "Use getWeather when the user asks about current or forecast weather for a place."
            }
            Capability::CreateDocument => {
                "Use createDocument for substantial content the user is likely to save or reuse, such as essays, code or emails."
            }
            Capability::UpdateDocument => {
                "Use updateDocument only to modify an existing document, and never immediately after creating it."
            }
            Capability::RequestSuggestions => {
                "Use requestSuggestions when the user asks for writing suggestions on an existing document."
            }
            Capability::WebSearch => {
                "Use web search for current facts and cite the sources you relied on."
            }
        }
    }
}

pub type Capabilities = BTreeSet<Capability>;

/// Per-invocation request settings, read-only once built
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(rename = "selectedChatModel")]
    pub model: String,
    #[serde(default, rename = "requestHints")]
    pub hints: RequestHints,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl RequestContext {
    pub fn new<S: Into<String>>(model: S) -> Self {
        RequestContext {
            model: model.into(),
            hints: RequestHints::default(),
            capabilities: Capabilities::new(),
        }
    }

    pub fn with_hints(mut self, hints: RequestHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }
}
