//! Drives one invocation from backend selection to the final event.
//!
//! `Idle -> Selecting -> Invoking -> Streaming -> Finalizing -> Done`
//!
//! Every exit path (clean end, start failure, mid-stream failure,
//! cancellation, consumer gone) runs the same finalize step, so the sink
//! always sees `text-end, data-usage?, finish-step, final` exactly once.
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::backends::base::{Backend, BackendInvocation, BackendKind, BackendRequest};
use crate::backends::factory::BackendRegistry;
use crate::config::Settings;
use crate::errors::{BackendError, RegistryError, SinkError};
use crate::models::event::CanonicalEvent;
use crate::models::message::Conversation;
use crate::models::request::{Capabilities, RequestContext};
use crate::models::usage::Usage;
use crate::normalizer::Normalizer;
use crate::prompt::{PromptBuilder, DEFAULT_PERSONA};
use crate::retry::RetryPolicy;
use crate::sink::EventSink;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Receives the reported usage once the invocation is done
pub type FinishCallback = Box<dyn FnOnce(Option<Usage>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrchestratorState {
    Idle,
    Selecting,
    Invoking,
    Streaming,
    Finalizing,
    Done,
}

/// How an invocation ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded,
    /// Nothing was produced; retries, if any, were exhausted
    StartFailed(BackendError),
    /// The transport failed after output had been delivered
    StreamFailed(BackendError),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Model id that actually served the invocation
    pub model: String,
    pub outcome: Outcome,
    pub usage: Option<Usage>,
}

pub struct Orchestrator {
    registry: Arc<BackendRegistry>,
    prompts: Arc<PromptBuilder>,
    retry: RetryPolicy,
    idle_timeout: Duration,
    on_finish: Option<FinishCallback>,
    state: OrchestratorState,
    label: &'static str,
    pending_usage: Option<Usage>,
}

impl Orchestrator {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            prompts: Arc::new(PromptBuilder::default()),
            retry: RetryPolicy::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            on_finish: None,
            state: OrchestratorState::Idle,
            label: BackendKind::Completion.label(),
            pending_usage: None,
        }
    }

    /// An orchestrator using the retry and stream limits from `settings`
    pub fn from_settings(
        registry: Arc<BackendRegistry>,
        prompts: Arc<PromptBuilder>,
        settings: &Settings,
    ) -> Self {
        Self::new(registry)
            .with_prompts(prompts)
            .with_retry(RetryPolicy::from(&settings.retry))
            .with_idle_timeout(settings.stream.idle_timeout())
    }

    pub fn with_prompts(mut self, prompts: Arc<PromptBuilder>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn on_finish<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Option<Usage>) + Send + 'static,
    {
        self.on_finish = Some(Box::new(callback));
        self
    }

    /// Run one invocation to completion, writing its events to `sink`.
    ///
    /// Never fails: errors are reported in-band and in the returned
    /// [`Completion`].
    pub async fn run(
        self,
        conversation: &Conversation,
        ctx: &RequestContext,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Completion {
        let span = tracing::info_span!("invocation", id = %Uuid::new_v4(), model = %ctx.model);
        self.drive(conversation, ctx, sink, cancel)
            .instrument(span)
            .await
    }

    async fn drive(
        mut self,
        conversation: &Conversation,
        ctx: &RequestContext,
        mut sink: EventSink,
        cancel: CancellationToken,
    ) -> Completion {
        let started = Instant::now();
        tracing::info!(messages = conversation.len(), "Invocation started");

        self.enter(OrchestratorState::Selecting);
        let (model, outcome) = match self.select(conversation, ctx) {
            Ok((backend, request)) => {
                let model = request.model.clone();
                let outcome = match self.open(backend.as_ref(), &request, &sink, &cancel).await {
                    Ok(invocation) => {
                        self.pump(invocation, backend.as_ref(), &mut sink, &cancel)
                            .await
                    }
                    Err(outcome) => outcome,
                };
                (model, outcome)
            }
            Err(err) => {
                tracing::error!("Backend selection failed: {}", err);
                (
                    ctx.model.clone(),
                    Outcome::StartFailed(BackendError::Upstream(err.to_string())),
                )
            }
        };

        self.finalize(&outcome, &mut sink).await;

        self.enter(OrchestratorState::Done);
        let usage = sink.usage().cloned();
        drop(sink);
        if let Some(callback) = self.on_finish.take() {
            callback(usage.clone());
        }

        tracing::info!(
            outcome = ?outcome,
            served_by = %model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Invocation finished"
        );
        Completion {
            model,
            outcome,
            usage,
        }
    }

    fn enter(&mut self, next: OrchestratorState) {
        tracing::debug!(from = ?self.state, to = ?next, "Orchestrator transition");
        self.state = next;
    }

    /// Resolve the backend and build the request it will receive
    fn select(
        &mut self,
        conversation: &Conversation,
        ctx: &RequestContext,
    ) -> Result<(Arc<dyn Backend>, BackendRequest), RegistryError> {
        let entry = self.registry.select(&ctx.model)?;
        let backend = entry.backend.clone();
        let kind = backend.kind();
        self.label = kind.label();

        // research agents cannot act on tool guidance
        let capabilities = match kind {
            BackendKind::Research => Capabilities::new(),
            _ => ctx.capabilities.clone(),
        };
        let system = self
            .prompts
            .build(&ctx.hints, &capabilities)
            .unwrap_or_else(|err| {
                tracing::error!("Failed to render system prompt: {}", err);
                DEFAULT_PERSONA.to_string()
            });

        let request = BackendRequest {
            model: entry.info.id.clone(),
            system,
            conversation: conversation.clone(),
            hints: ctx.hints.clone(),
            capabilities,
        };
        Ok((backend, request))
    }

    /// Open the transport behind the retry policy
    async fn open(
        &mut self,
        backend: &dyn Backend,
        request: &BackendRequest,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<BackendInvocation, Outcome> {
        self.enter(OrchestratorState::Invoking);
        let retry = self.retry;
        let idle_timeout = self.idle_timeout;

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Outcome::Cancelled),
            _ = sink.closed() => return Err(Outcome::Cancelled),
            result = retry.run(cancel, move |attempt| {
                tracing::debug!(attempt, "Opening backend transport");
                BackendInvocation::open(backend, request, idle_timeout)
            }) => result,
        };

        match opened {
            Ok(invocation) => Ok(invocation),
            Err(BackendError::Cancelled) => Err(Outcome::Cancelled),
            Err(err) => {
                tracing::error!("Invocation failed to start: {}", err);
                Err(Outcome::StartFailed(err))
            }
        }
    }

    /// Pump raw records through the normalizer into the sink
    async fn pump(
        &mut self,
        mut invocation: BackendInvocation,
        backend: &dyn Backend,
        sink: &mut EventSink,
        cancel: &CancellationToken,
    ) -> Outcome {
        self.enter(OrchestratorState::Streaming);
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            opened = open_text(sink) => opened.is_ok(),
        };
        if !opened {
            return Outcome::Cancelled;
        }

        let mut normalizer =
            Normalizer::new(backend.delta_mode()).with_chunking(backend.chunking());
        let outcome = 'pump: loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Outcome::Cancelled,
                _ = sink.closed() => break Outcome::Cancelled,
                next = invocation.next() => next,
            };

            let record = match next {
                Ok(Some(record)) => record,
                Ok(None) => break Outcome::Succeeded,
                Err(err) => {
                    tracing::error!("Backend stream failed: {}", err);
                    break Outcome::StreamFailed(err);
                }
            };

            for event in normalizer.push(record) {
                let event = match event {
                    CanonicalEvent::UsageReport(usage) => {
                        self.pending_usage = Some(usage);
                        continue;
                    }
                    CanonicalEvent::Error(message) => CanonicalEvent::Error(self.diagnostic(message)),
                    other => other,
                };
                // a stalled consumer must not delay cancellation
                let emitted = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'pump Outcome::Cancelled,
                    emitted = sink.emit(event) => emitted,
                };
                match emitted {
                    Ok(()) => {}
                    Err(SinkError::Closed) => break 'pump Outcome::Cancelled,
                    Err(err) => tracing::error!("Dropped normalized event: {}", err),
                }
            }
        };

        if outcome != Outcome::Cancelled {
            if let Some(event) = normalizer.flush() {
                let _ = sink.emit(event).await;
            }
        }
        if normalizer.dropped() > 0 {
            tracing::warn!(dropped = normalizer.dropped(), "Malformed records were dropped");
        }
        // release the transport before the closing events go out
        drop(invocation);
        outcome
    }

    async fn finalize(&mut self, outcome: &Outcome, sink: &mut EventSink) {
        self.enter(OrchestratorState::Finalizing);
        let _ = open_text(sink).await;

        if let Outcome::StartFailed(err) | Outcome::StreamFailed(err) = outcome {
            let message = self.diagnostic(err.to_string());
            let _ = sink.emit(CanonicalEvent::Error(message)).await;
        }
        let _ = sink.emit(CanonicalEvent::TextEnd).await;
        if let Some(usage) = self.pending_usage.take() {
            let _ = sink.emit(CanonicalEvent::UsageReport(usage)).await;
        }
        let _ = sink.emit(CanonicalEvent::StepEnd).await;
        let _ = sink.emit(CanonicalEvent::Final).await;
    }

    fn diagnostic(&self, message: String) -> String {
        format!("[{} error] {}", self.label, message)
    }
}

/// Emit whichever of `start-step`, `text-start` is still missing
async fn open_text(sink: &mut EventSink) -> Result<(), SinkError> {
    let mut result = Ok(());
    if !sink.is_step_open() {
        result = result.and(sink.emit(CanonicalEvent::StepStart).await);
    }
    if !sink.is_text_open() {
        result = result.and(sink.emit(CanonicalEvent::TextStart).await);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::base::{Chunking, DeltaMode, RawRecord};
    use crate::backends::factory::ModelInfo;
    use crate::backends::mock::{ScriptedBackend, Step};
    use crate::models::message::Message;
    use crate::models::request::Capability;
    use crate::sink::EventStream;
    use futures::StreamExt;
    use std::sync::Mutex;

    fn registry_with(id: &str, backend: Arc<ScriptedBackend>) -> Arc<BackendRegistry> {
        let kind = backend.kind();
        let mut registry = BackendRegistry::new(id);
        registry.register(
            ModelInfo {
                id: id.to_string(),
                name: id.to_string(),
                description: String::new(),
                kind,
            },
            backend,
        );
        Arc::new(registry)
    }

    fn conversation() -> Conversation {
        Conversation::new(vec![Message::user().with_text("Hello")])
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    async fn run(
        orchestrator: Orchestrator,
        ctx: RequestContext,
    ) -> (Completion, Vec<CanonicalEvent>) {
        let (sink, stream) = EventSink::channel(64);
        let completion = orchestrator
            .run(&conversation(), &ctx, sink, CancellationToken::new())
            .await;
        (completion, stream.collect().await)
    }

    /// Check the sequence against `start-step text-start text-delta* text-end
    /// data-usage? finish-step final`, where errors count as deltas
    fn assert_well_formed(events: &[CanonicalEvent]) {
        let names: Vec<&str> = events
            .iter()
            .map(|e| match e {
                CanonicalEvent::Error(_) => "text-delta",
                other => other.name(),
            })
            .collect();
        assert!(names.len() >= 5, "too short: {:?}", names);
        assert_eq!(&names[..2], &["start-step", "text-start"]);

        let mut rest = &names[2..];
        while rest.first() == Some(&"text-delta") {
            rest = &rest[1..];
        }
        if rest.len() == 4 {
            assert_eq!(rest, &["text-end", "data-usage", "finish-step", "final"]);
        } else {
            assert_eq!(rest, &["text-end", "finish-step", "final"]);
        }
        assert_eq!(events.iter().filter(|e| e.is_final()).count(), 1);
    }

    fn text(events: &[CanonicalEvent]) -> String {
        events.iter().filter_map(|e| e.as_delta()).collect()
    }

    #[tokio::test]
    async fn test_token_stream_success() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(vec![
            Step::Record(RawRecord::Fragment("Hel".to_string())),
            Step::Record(RawRecord::Fragment("lo".to_string())),
            Step::Record(RawRecord::Usage(Usage::new(Some(3), Some(2), Some(5)))),
        ])]));
        let orchestrator = Orchestrator::new(registry_with("chat-model", backend.clone()));

        let (completion, events) = run(orchestrator, RequestContext::new("chat-model")).await;

        assert_well_formed(&events);
        assert_eq!(
            events,
            vec![
                CanonicalEvent::StepStart,
                CanonicalEvent::TextStart,
                CanonicalEvent::delta("Hel"),
                CanonicalEvent::delta("lo"),
                CanonicalEvent::TextEnd,
                CanonicalEvent::UsageReport(Usage::new(Some(3), Some(2), Some(5))),
                CanonicalEvent::StepEnd,
                CanonicalEvent::Final,
            ]
        );
        assert_eq!(completion.outcome, Outcome::Succeeded);
        assert_eq!(completion.usage, Some(Usage::new(Some(3), Some(2), Some(5))));
        assert_eq!(completion.model, "chat-model");
        assert_eq!(backend.invocations(), 1);
        assert_eq!(backend.released(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_start_exhausts_retries() {
        let rate_limited = || Err(BackendError::RateLimited("busy".to_string()));
        let backend = Arc::new(ScriptedBackend::new(vec![
            rate_limited(),
            rate_limited(),
            rate_limited(),
            Ok(vec![Step::Record(RawRecord::Fragment("never".to_string()))]),
        ]));
        let orchestrator =
            Orchestrator::new(registry_with("chat-model", backend.clone())).with_retry(fast_retry());

        let (completion, events) = run(orchestrator, RequestContext::new("chat-model")).await;

        assert_well_formed(&events);
        assert_eq!(backend.invocations(), 3);
        assert!(matches!(completion.outcome, Outcome::StartFailed(BackendError::RateLimited(_))));
        assert_eq!(
            events[2],
            CanonicalEvent::Error("[chat error] Rate limited by upstream: busy".to_string())
        );
        assert_eq!(text(&events), "");
        assert_eq!(completion.usage, None);
    }

    #[tokio::test]
    async fn test_failure_after_first_token_is_not_retried() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Ok(vec![
                Step::Record(RawRecord::Fragment("partial".to_string())),
                Step::Fail(BackendError::RateLimited("busy".to_string())),
            ]),
            Ok(vec![Step::Record(RawRecord::Fragment("replayed".to_string()))]),
        ]));
        let orchestrator =
            Orchestrator::new(registry_with("chat-model", backend.clone())).with_retry(fast_retry());

        let (completion, events) = run(orchestrator, RequestContext::new("chat-model")).await;

        assert_well_formed(&events);
        assert_eq!(backend.invocations(), 1);
        assert!(matches!(completion.outcome, Outcome::StreamFailed(_)));
        assert_eq!(events[2], CanonicalEvent::delta("partial"));
        assert!(matches!(&events[3], CanonicalEvent::Error(m) if m.starts_with("[chat error]")));
        assert_eq!(events[4], CanonicalEvent::TextEnd);
    }

    #[tokio::test]
    async fn test_retry_then_success_emits_no_stale_output() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(BackendError::RateLimited("busy".to_string())),
            Ok(vec![Step::Record(RawRecord::Fragment("fresh".to_string()))]),
        ]));
        let orchestrator =
            Orchestrator::new(registry_with("chat-model", backend.clone())).with_retry(fast_retry());

        let (completion, events) = run(orchestrator, RequestContext::new("chat-model")).await;

        assert_well_formed(&events);
        assert_eq!(completion.outcome, Outcome::Succeeded);
        assert_eq!(backend.invocations(), 2);
        assert_eq!(text(&events), "fresh");
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_finalizes_and_releases() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(vec![
            Step::Record(RawRecord::Fragment("Hi".to_string())),
            Step::Stall,
        ])]));
        let orchestrator = Orchestrator::new(registry_with("chat-model", backend.clone()));
        let (sink, mut stream): (EventSink, EventStream) = EventSink::channel(64);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                orchestrator
                    .run(&conversation(), &RequestContext::new("chat-model"), sink, cancel)
                    .await
            }
        });

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            let is_delta = event.as_delta().is_some();
            events.push(event);
            if is_delta {
                cancel.cancel();
            }
        }
        let completion = task.await.unwrap();

        assert_well_formed(&events);
        assert_eq!(completion.outcome, Outcome::Cancelled);
        assert_eq!(text(&events), "Hi");
        assert_eq!(backend.released(), 1);
    }

    #[tokio::test]
    async fn test_consumer_gone_cancels_invocation() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(vec![
            Step::Record(RawRecord::Fragment("Hi".to_string())),
            Step::Stall,
        ])]));
        let orchestrator = Orchestrator::new(registry_with("chat-model", backend.clone()));
        let (sink, stream) = EventSink::channel(64);
        drop(stream);

        let completion = orchestrator
            .run(
                &conversation(),
                &RequestContext::new("chat-model"),
                sink,
                CancellationToken::new(),
            )
            .await;

        assert_eq!(completion.outcome, Outcome::Cancelled);
        assert_eq!(backend.released(), backend.invocations());
    }

    #[tokio::test]
    async fn test_cumulative_snapshots_with_malformed_lines() {
        let line = |s: &str| Step::Record(RawRecord::Line(s.to_string()));
        let backend = Arc::new(
            ScriptedBackend::new(vec![Ok(vec![
                line(r#"{"event":"final","response":"Hi"}"#),
                line("{not json"),
                line(r#"{"event":"final","response":"Hi there"}"#),
                line("garbage"),
                line(r#"{"event":"final","response":"Hi there!"}"#),
            ])])
            .with_kind(BackendKind::Remote)
            .with_delta_mode(DeltaMode::Cumulative),
        );
        let orchestrator = Orchestrator::new(registry_with("chat-model-agent", backend));

        let (completion, events) = run(orchestrator, RequestContext::new("chat-model-agent")).await;

        assert_well_formed(&events);
        assert_eq!(completion.outcome, Outcome::Succeeded);
        let deltas: Vec<&str> = events.iter().filter_map(|e| e.as_delta()).collect();
        assert_eq!(deltas, vec!["Hi", " there", "!"]);
    }

    #[tokio::test]
    async fn test_remote_error_record_is_labelled() {
        let backend = Arc::new(
            ScriptedBackend::new(vec![Ok(vec![Step::Record(RawRecord::Line(
                r#"{"type":"error","errorText":"tool crashed"}"#.to_string(),
            ))])])
            .with_kind(BackendKind::Remote),
        );
        let orchestrator = Orchestrator::new(registry_with("chat-model-agent", backend));

        let (_, events) = run(orchestrator, RequestContext::new("chat-model-agent")).await;

        assert_well_formed(&events);
        assert_eq!(
            events[2],
            CanonicalEvent::Error("[agent error] tool crashed".to_string())
        );
    }

    #[tokio::test]
    async fn test_single_shot_report() {
        let backend = Arc::new(
            ScriptedBackend::new(vec![Ok(vec![Step::Record(RawRecord::Payload(
                serde_json::json!({"answer": "42"}),
            ))])])
            .with_kind(BackendKind::Research),
        );
        let orchestrator = Orchestrator::new(registry_with("chat-model-reasoning", backend));

        let (_, events) = run(orchestrator, RequestContext::new("chat-model-reasoning")).await;

        let deltas: Vec<&str> = events.iter().filter_map(|e| e.as_delta()).collect();
        assert_eq!(deltas, vec!["42"]);
    }

    #[tokio::test]
    async fn test_research_prompt_has_no_tool_guidance() {
        let backend = Arc::new(
            ScriptedBackend::new(vec![Ok(Vec::new())]).with_kind(BackendKind::Research),
        );
        let orchestrator = Orchestrator::new(registry_with("chat-model-reasoning", backend.clone()));
        let ctx = RequestContext::new("chat-model-reasoning").with_capability(Capability::GetWeather);

        let (completion, events) = run(orchestrator, ctx).await;

        assert_well_formed(&events);
        assert_eq!(completion.outcome, Outcome::Succeeded);
        let request = &backend.requests()[0];
        assert!(request.capabilities.is_empty());
        assert!(!request.system.contains("Available tools"));
        assert!(request.system.starts_with(DEFAULT_PERSONA));
    }

    #[tokio::test]
    async fn test_unknown_model_uses_default_and_guidance() {
        let backend = Arc::new(ScriptedBackend::fragments(&["ok"]));
        let orchestrator = Orchestrator::new(registry_with("chat-model", backend.clone()));
        let ctx = RequestContext::new("no-such-model").with_capability(Capability::GetWeather);

        let (completion, _) = run(orchestrator, ctx).await;

        assert_eq!(completion.model, "chat-model");
        let request = &backend.requests()[0];
        assert_eq!(request.model, "chat-model");
        assert!(request.system.contains(Capability::GetWeather.guidance()));
    }

    #[tokio::test]
    async fn test_on_finish_called_once_with_usage() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(vec![
            Step::Record(RawRecord::Usage(Usage::new(Some(1), Some(1), Some(2)))),
            Step::Record(RawRecord::Usage(Usage::new(Some(4), Some(5), Some(9)))),
        ])]));
        let orchestrator = Orchestrator::new(registry_with("chat-model", backend)).on_finish({
            let seen = seen.clone();
            move |usage| seen.lock().unwrap().push(usage)
        });

        let (_, events) = run(orchestrator, RequestContext::new("chat-model")).await;

        assert_well_formed(&events);
        let usage_events = events
            .iter()
            .filter(|e| matches!(e, CanonicalEvent::UsageReport(_)))
            .count();
        assert_eq!(usage_events, 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some(Usage::new(Some(4), Some(5), Some(9)))]
        );
    }

    #[tokio::test]
    async fn test_oversized_remote_usage_still_completes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let line = |s: &str| Step::Record(RawRecord::Line(s.to_string()));
        let backend = Arc::new(
            ScriptedBackend::new(vec![Ok(vec![
                line(r#"{"type":"text-delta","delta":"Hi"}"#),
                line(r#"{"type":"data-usage","data":{"inputTokens":2147483647,"outputTokens":1}}"#),
            ])])
            .with_kind(BackendKind::Remote),
        );
        let orchestrator = Orchestrator::new(registry_with("chat-model-agent", backend)).on_finish({
            let seen = seen.clone();
            move |usage| seen.lock().unwrap().push(usage)
        });

        let (completion, events) = run(orchestrator, RequestContext::new("chat-model-agent")).await;

        assert_well_formed(&events);
        assert_eq!(completion.outcome, Outcome::Succeeded);
        let expected = Usage::new(Some(i32::MAX), Some(1), Some(i32::MAX));
        assert_eq!(completion.usage, Some(expected.clone()));
        assert_eq!(*seen.lock().unwrap(), vec![Some(expected)]);
    }

    #[tokio::test]
    async fn test_cancel_with_stalled_consumer_releases_transport() {
        let fragment = |s: &str| Step::Record(RawRecord::Fragment(s.to_string()));
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(vec![
            fragment("one"),
            fragment("two"),
            fragment("three"),
            Step::Stall,
        ])]));
        let orchestrator = Orchestrator::new(registry_with("chat-model", backend.clone()));
        let (sink, stream) = EventSink::channel(1);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                orchestrator
                    .run(&conversation(), &RequestContext::new("chat-model"), sink, cancel)
                    .await
            }
        });

        // nobody reads, so the orchestrator blocks on a full channel
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.invocations(), 1);
        assert_eq!(backend.released(), 0);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while backend.released() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("transport was not released while the consumer stalled");

        let events: Vec<CanonicalEvent> = stream.collect().await;
        let completion = task.await.unwrap();
        assert_well_formed(&events);
        assert_eq!(completion.outcome, Outcome::Cancelled);
    }

    #[tokio::test]
    async fn test_word_chunking_flushes_tail_before_finalize() {
        let backend = Arc::new(
            ScriptedBackend::fragments(&["Hel", "lo wor", "ld"]).with_chunking(Chunking::Word),
        );
        let orchestrator = Orchestrator::new(registry_with("chat-model", backend));

        let (completion, events) = run(orchestrator, RequestContext::new("chat-model")).await;

        assert_well_formed(&events);
        assert_eq!(completion.outcome, Outcome::Succeeded);
        let deltas: Vec<&str> = events.iter().filter_map(|e| e.as_delta()).collect();
        assert_eq!(deltas, vec!["Hello ", "world"]);
    }

    #[tokio::test]
    async fn test_empty_registry_still_finalizes() {
        let orchestrator = Orchestrator::new(Arc::new(BackendRegistry::new("missing")));

        let (completion, events) = run(orchestrator, RequestContext::new("anything")).await;

        assert_well_formed(&events);
        assert!(matches!(completion.outcome, Outcome::StartFailed(_)));
    }
}
