use anyhow::Result;
use async_trait::async_trait;
use indoc::indoc;
use reqwest::Client;
use serde_json::{json, Value};

use super::base::{Backend, BackendKind, BackendRequest, RawRecord, RawStream};
use super::configs::ResearchBackendConfig;
use super::utils::{check_status, strip_code_fence};
use crate::errors::BackendError;
use crate::models::usage::Usage;

pub const RESEARCH_INSTRUCTIONS: &str = indoc! {r#"
    You are a Deep Research agent.

    WORKFLOW
    1) Interpret the user's query (and optional focus area).
    2) Use your built-in browsing & analysis to gather facts, stats, and differing viewpoints from reputable, recent sources.
    3) Build a list named findings with entries: title, url, snippet.
    4) Output a final JSON object EXACTLY ONCE, then STOP. The JSON must match:
       {"success":true,"query":"...","focus_area":"...","answer":"...","key_insights":["..."],"sources":[{"title":"...","url":"...","snippet":"..."}],"status":"final"}

    CONSTRAINTS
    - Prefer authoritative and recent sources when recency matters.
    - Keep the synthesis concise, neutral, and evidence-based.
"#};

/// Autonomous research agent that answers with one structured report
pub struct ResearchBackend {
    client: Client,
    config: ResearchBackendConfig,
}

impl ResearchBackend {
    pub fn new(config: ResearchBackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    /// The agent takes a single input: system prompt, then the latest user turn
    fn payload(&self, request: &BackendRequest) -> Value {
        let input = format!(
            "{}\n\n{}",
            request.system,
            request.conversation.last_user_text()
        );
        let mut payload = json!({
            "model": self.config.model,
            "instructions": RESEARCH_INSTRUCTIONS,
            "input": input,
        });
        if self.config.web_search {
            payload["tools"] = json!([{"type": "web_search_preview"}]);
        }
        payload
    }
}

/// Concatenate every `output_text` part of a responses API result
fn output_text(body: &Value) -> String {
    if let Some(text) = body.get("output_text").and_then(|t| t.as_str()) {
        return text.to_string();
    }

    body.get("output")
        .and_then(|o| o.as_array())
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("type").and_then(|t| t.as_str()) == Some("message"))
                .filter_map(|item| item.get("content").and_then(|c| c.as_array()))
                .flatten()
                .filter(|part| part.get("type").and_then(|t| t.as_str()) == Some("output_text"))
                .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// A report object when the text is JSON, otherwise the text itself
fn parse_report(text: &str) -> Value {
    match serde_json::from_str::<Value>(strip_code_fence(text)) {
        Ok(value @ Value::Object(_)) => value,
        _ => Value::String(text.trim().to_string()),
    }
}

#[async_trait]
impl Backend for ResearchBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Research
    }

    async fn invoke(&self, request: &BackendRequest) -> Result<RawStream, BackendError> {
        let url = format!("{}/v1/responses", self.config.host.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&self.payload(request))
            .send()
            .await?;
        let response = check_status(response).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::MalformedFrame(e.to_string()))?;

        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(BackendError::from_error_value(error));
        }

        let mut records: Vec<Result<RawRecord, BackendError>> =
            vec![Ok(RawRecord::Payload(parse_report(&output_text(&body))))];
        if let Some(usage) = body.get("usage").and_then(Usage::from_value) {
            records.push(Ok(RawRecord::Usage(usage)));
        }

        Ok(Box::pin(futures::stream::iter(records)))
    }
}
