use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

use super::base::{Backend, BackendKind, BackendRequest, Chunking, RawRecord, RawStream};
use super::configs::OpenAiBackendConfig;
use super::utils::{check_status, messages_to_openai_spec};
use crate::errors::BackendError;
use crate::framing::{Framing, LineFramer};
use crate::models::usage::Usage;

const DONE_MARKER: &str = "[DONE]";

/// Direct completion streamed token by token from a chat completions endpoint
pub struct ChatCompletionsBackend {
    client: Client,
    config: OpenAiBackendConfig,
}

impl ChatCompletionsBackend {
    pub fn new(config: OpenAiBackendConfig) -> Result<Self> {
        // no overall timeout: the orchestrator bounds idle reads instead
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    fn payload(&self, request: &BackendRequest) -> Value {
        json!({
            "model": self.config.model,
            "messages": messages_to_openai_spec(&request.system, &request.conversation),
            "stream": true,
            "stream_options": {"include_usage": true},
        })
    }
}

/// Records carried by one chat completions chunk
fn chunk_records(value: &Value) -> Vec<RawRecord> {
    let mut records = Vec::new();
    if let Some(text) = value
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
    {
        records.push(RawRecord::Fragment(text.to_string()));
    }
    if let Some(usage) = value.get("usage").and_then(Usage::from_value) {
        records.push(RawRecord::Usage(usage));
    }
    records
}

#[async_trait]
impl Backend for ChatCompletionsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Completion
    }

    fn chunking(&self) -> Chunking {
        self.config.chunking
    }

    async fn invoke(&self, request: &BackendRequest) -> Result<RawStream, BackendError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&self.payload(request))
            .send()
            .await?;
        let response = check_status(response).await?;
        let mut bytes = response.bytes_stream();

        let stream = async_stream::try_stream! {
            let mut framer = LineFramer::new(Framing::Sse);
            let mut done = false;

            while let Some(chunk) = bytes.next().await {
                let chunk = chunk?;
                for payload in framer.push(&chunk) {
                    if payload.trim() == DONE_MARKER {
                        done = true;
                        break;
                    }
                    let value: Value = match serde_json::from_str(&payload) {
                        Ok(value) => value,
                        Err(err) => {
                            tracing::warn!(error = %err, "Skipping malformed completion chunk");
                            continue;
                        }
                    };
                    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
                        Err::<(), _>(BackendError::from_error_value(error))?;
                    }
                    for record in chunk_records(&value) {
                        yield record;
                    }
                }
                if done {
                    break;
                }
            }

            if !done {
                Err::<(), _>(BackendError::UnexpectedEof)?;
            }
        };

        Ok(Box::pin(stream))
    }
}
