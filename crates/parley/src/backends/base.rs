use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;

use crate::errors::BackendError;
use crate::models::message::Conversation;
use crate::models::request::{Capabilities, RequestHints};
use crate::models::usage::Usage;

/// One unit of raw backend output, before normalization
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    /// A text fragment from a token stream
    Fragment(String),
    /// One framed payload from a line-delimited feed, not yet parsed
    Line(String),
    /// The complete result of a single-shot backend
    Payload(Value),
    /// Usage reported out of band by the transport
    Usage(Usage),
}

pub type RawStream = BoxStream<'static, Result<RawRecord, BackendError>>;

/// How text in line-framed records relates to the answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaMode {
    /// Each record carries only the new text
    #[default]
    Incremental,
    /// Each record carries the full answer so far
    Cumulative,
}

/// How streamed text is regrouped before it reaches the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chunking {
    /// Forward text as the backend produced it
    #[default]
    None,
    /// Hold text back until a whole word and its trailing whitespace arrived
    Word,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Direct completion against a chat model
    Completion,
    /// Autonomous multi-step research agent
    Research,
    /// Separate network service speaking a line-framed protocol
    Remote,
}

impl BackendKind {
    /// Short label used in diagnostics shown to the user
    pub fn label(&self) -> &'static str {
        match self {
            BackendKind::Completion => "chat",
            BackendKind::Research => "research",
            BackendKind::Remote => "agent",
        }
    }
}

/// Everything a backend needs to start one invocation
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub model: String,
    pub system: String,
    pub conversation: Conversation,
    pub hints: RequestHints,
    pub capabilities: Capabilities,
}

/// A response generation strategy behind the uniform event protocol
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Delta mode the normalizer must use for this backend's line records
    fn delta_mode(&self) -> DeltaMode {
        DeltaMode::Incremental
    }

    fn chunking(&self) -> Chunking {
        Chunking::None
    }

    /// Open the transport and return its raw records.
    ///
    /// Dropping the returned stream must release the transport.
    async fn invoke(&self, request: &BackendRequest) -> Result<RawStream, BackendError>;
}

/// A live call to one backend, owning its transport until dropped.
///
/// Opening waits for the first record, so anything that fails before output
/// exists is reported by [`BackendInvocation::open`] and can be retried.
pub struct BackendInvocation {
    stream: RawStream,
    pending: Option<RawRecord>,
    exhausted: bool,
    idle_timeout: Duration,
}

impl BackendInvocation {
    pub async fn open(
        backend: &dyn Backend,
        request: &BackendRequest,
        idle_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let mut stream = backend.invoke(request).await?;
        let pending = match timeout(idle_timeout, stream.next()).await {
            Err(_) => return Err(BackendError::IdleTimeout(idle_timeout)),
            Ok(Some(record)) => Some(record?),
            Ok(None) => None,
        };

        Ok(Self {
            exhausted: pending.is_none(),
            stream,
            pending,
            idle_timeout,
        })
    }

    /// Next raw record, `None` once the transport completed cleanly
    pub async fn next(&mut self) -> Result<Option<RawRecord>, BackendError> {
        if let Some(record) = self.pending.take() {
            return Ok(Some(record));
        }
        if self.exhausted {
            return Ok(None);
        }
        match timeout(self.idle_timeout, self.stream.next()).await {
            Err(_) => Err(BackendError::IdleTimeout(self.idle_timeout)),
            Ok(Some(record)) => record.map(Some),
            Ok(None) => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock::{ScriptedBackend, Step};
    use crate::models::message::Conversation;

    fn request() -> BackendRequest {
        BackendRequest {
            model: "chat-model".to_string(),
            system: String::new(),
            conversation: Conversation::default(),
            hints: RequestHints::default(),
            capabilities: Capabilities::new(),
        }
    }

    #[tokio::test]
    async fn test_error_before_first_record_fails_open() {
        let backend = ScriptedBackend::new(vec![Ok(vec![Step::Fail(
            BackendError::RateLimited("busy".to_string()),
        )])]);
        let result = BackendInvocation::open(&backend, &request(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(BackendError::RateLimited(_))));
        assert_eq!(backend.released(), 1);
    }

    #[tokio::test]
    async fn test_records_then_clean_end() {
        let backend = ScriptedBackend::fragments(&["a", "b"]);
        let mut invocation = BackendInvocation::open(&backend, &request(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(invocation.next().await, Ok(Some(RawRecord::Fragment("a".to_string()))));
        assert_eq!(invocation.next().await, Ok(Some(RawRecord::Fragment("b".to_string()))));
        assert_eq!(invocation.next().await, Ok(None));
        assert_eq!(invocation.next().await, Ok(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_transport_times_out() {
        let backend = ScriptedBackend::new(vec![Ok(vec![
            Step::Record(RawRecord::Fragment("a".to_string())),
            Step::Stall,
        ])]);
        let mut invocation = BackendInvocation::open(&backend, &request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(invocation.next().await.unwrap().is_some());
        assert_eq!(
            invocation.next().await,
            Err(BackendError::IdleTimeout(Duration::from_secs(5)))
        );
        drop(invocation);
        assert_eq!(backend.released(), 1);
    }
}
