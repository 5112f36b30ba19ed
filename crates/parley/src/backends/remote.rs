use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde_json::{json, Value};

use super::base::{Backend, BackendKind, BackendRequest, DeltaMode, RawRecord, RawStream};
use super::configs::RemoteBackendConfig;
use super::utils::check_status;
use crate::framing::{Framing, LineFramer};
use crate::errors::BackendError;

/// A separate agent service that streams line-framed JSON records
pub struct RemoteBackend {
    client: Client,
    config: RemoteBackendConfig,
}

impl RemoteBackend {
    pub fn new(config: RemoteBackendConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    fn payload(&self, request: &BackendRequest) -> Value {
        json!({
            "messages": request.conversation,
            "selectedChatModel": request.model,
            "requestHints": request.hints,
            "system": request.system,
        })
    }

    fn accept(&self) -> &'static str {
        match self.config.framing {
            Framing::Sse => "text/event-stream",
            Framing::Ndjson => "application/x-ndjson",
        }
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn delta_mode(&self) -> DeltaMode {
        self.config.delta_mode
    }

    async fn invoke(&self, request: &BackendRequest) -> Result<RawStream, BackendError> {
        let response = self
            .client
            .post(&self.config.url)
            .header(ACCEPT, self.accept())
            .json(&self.payload(request))
            .send()
            .await?;
        let response = check_status(response).await?;
        let mut bytes = response.bytes_stream();
        let framing = self.config.framing;

        let stream = async_stream::try_stream! {
            let mut framer = LineFramer::new(framing);
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk?;
                for record in framer.push(&chunk) {
                    yield RawRecord::Line(record);
                }
            }
            if let Some(record) = framer.finish() {
                yield RawRecord::Line(record);
            }
        };

        Ok(Box::pin(stream))
    }
}
