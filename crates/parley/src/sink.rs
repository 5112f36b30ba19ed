//! Ordered output channel for one invocation.
//!
//! The sink checks every event against the nesting rules before forwarding
//! it: `start-step, text-start, (text-delta | error)*, text-end, data-usage?,
//! finish-step, final`. An out-of-order event is a programming error and is
//! rejected with [`SinkError::Protocol`] without being forwarded.
//!
//! If the sink is dropped before `final` was emitted, the missing closing
//! events are pushed without waiting so the consumer still sees a complete
//! sequence.
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::errors::SinkError;
use crate::models::event::CanonicalEvent;
use crate::models::usage::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Idle,
    StepOpen,
    TextOpen,
    TextClosed,
    UsageReported,
    StepClosed,
    Finished,
}

impl SinkState {
    fn name(&self) -> &'static str {
        match self {
            SinkState::Idle => "idle",
            SinkState::StepOpen => "start-step",
            SinkState::TextOpen => "text-start",
            SinkState::TextClosed => "text-end",
            SinkState::UsageReported => "data-usage",
            SinkState::StepClosed => "finish-step",
            SinkState::Finished => "final",
        }
    }

    fn next(self, event: &CanonicalEvent) -> Option<SinkState> {
        use CanonicalEvent::*;
        match (self, event) {
            (SinkState::Idle, StepStart) => Some(SinkState::StepOpen),
            (SinkState::StepOpen, TextStart) => Some(SinkState::TextOpen),
            (SinkState::TextOpen, TextDelta(_)) | (SinkState::TextOpen, Error(_)) => {
                Some(SinkState::TextOpen)
            }
            (SinkState::TextOpen, TextEnd) => Some(SinkState::TextClosed),
            (SinkState::TextClosed, UsageReport(_)) => Some(SinkState::UsageReported),
            (SinkState::StepOpen, StepEnd)
            | (SinkState::TextClosed, StepEnd)
            | (SinkState::UsageReported, StepEnd) => Some(SinkState::StepClosed),
            (SinkState::StepClosed, Final) => Some(SinkState::Finished),
            _ => None,
        }
    }
}

pub struct EventSink {
    tx: mpsc::Sender<CanonicalEvent>,
    state: SinkState,
    usage: Option<Usage>,
    closed: bool,
}

/// The consumer half of a sink
pub type EventStream = ReceiverStream<CanonicalEvent>;

impl EventSink {
    pub fn new(tx: mpsc::Sender<CanonicalEvent>) -> Self {
        Self {
            tx,
            state: SinkState::Idle,
            usage: None,
            closed: false,
        }
    }

    /// Create a sink together with the stream its events are delivered to
    pub fn channel(capacity: usize) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), ReceiverStream::new(rx))
    }

    /// Validate and forward one event.
    ///
    /// Cancel safe: if the future is dropped while waiting for channel
    /// capacity, the event counts as never emitted.
    pub async fn emit(&mut self, event: CanonicalEvent) -> Result<(), SinkError> {
        let next = self.transition(&event)?;
        let permit = if self.closed {
            None
        } else {
            self.tx.reserve().await.ok()
        };

        if let CanonicalEvent::UsageReport(usage) = &event {
            self.usage = Some(usage.clone());
        }
        self.state = next;

        match permit {
            Some(permit) => {
                permit.send(event);
                Ok(())
            }
            None => {
                self.closed = true;
                Err(SinkError::Closed)
            }
        }
    }

    fn transition(&self, event: &CanonicalEvent) -> Result<SinkState, SinkError> {
        self.state.next(event).ok_or_else(|| {
            tracing::error!(
                event = event.name(),
                state = self.state.name(),
                "Rejected out-of-order canonical event"
            );
            SinkError::Protocol {
                event: event.name().to_string(),
                state: self.state.name().to_string(),
            }
        })
    }

    /// Resolves once the consumer has gone away
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.tx.is_closed()
    }

    pub fn is_step_open(&self) -> bool {
        !matches!(self.state, SinkState::Idle)
    }

    pub fn is_text_open(&self) -> bool {
        self.state == SinkState::TextOpen
    }

    pub fn is_finished(&self) -> bool {
        self.state == SinkState::Finished
    }

    /// Most recent usage reported through this sink
    pub fn usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }

    /// Events still required to reach `final` from the current state
    fn closing_events(&self) -> Vec<CanonicalEvent> {
        use CanonicalEvent::*;
        match self.state {
            SinkState::Idle => vec![StepStart, TextStart, TextEnd, StepEnd, Final],
            SinkState::StepOpen => vec![StepEnd, Final],
            SinkState::TextOpen => vec![TextEnd, StepEnd, Final],
            SinkState::TextClosed | SinkState::UsageReported => vec![StepEnd, Final],
            SinkState::StepClosed => vec![Final],
            SinkState::Finished => Vec::new(),
        }
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        if self.is_finished() || self.is_closed() {
            return;
        }
        tracing::warn!(
            state = self.state.name(),
            "Event sink dropped before final, closing abruptly"
        );
        for event in self.closing_events() {
            if self.tx.try_send(event).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn drain(stream: EventStream) -> Vec<CanonicalEvent> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_well_formed_sequence_is_forwarded() {
        let (mut sink, stream) = EventSink::channel(16);
        let usage = Usage::new(Some(1), Some(2), Some(3));
        let events = vec![
            CanonicalEvent::StepStart,
            CanonicalEvent::TextStart,
            CanonicalEvent::delta("a"),
            CanonicalEvent::Error("oops".to_string()),
            CanonicalEvent::TextEnd,
            CanonicalEvent::UsageReport(usage.clone()),
            CanonicalEvent::StepEnd,
            CanonicalEvent::Final,
        ];
        for event in events.clone() {
            sink.emit(event).await.unwrap();
        }
        assert!(sink.is_finished());
        assert_eq!(sink.usage(), Some(&usage));
        drop(sink);
        assert_eq!(drain(stream).await, events);
    }

    #[tokio::test]
    async fn test_delta_before_text_start_is_rejected() {
        let (mut sink, _stream) = EventSink::channel(16);
        sink.state = SinkState::StepOpen;
        let err = sink.transition(&CanonicalEvent::delta("early")).unwrap_err();
        assert_eq!(
            err,
            SinkError::Protocol {
                event: "text-delta".to_string(),
                state: "start-step".to_string()
            }
        );
    }

    #[test]
    fn test_transition_table_rejects_misordering() {
        use CanonicalEvent::*;
        assert_eq!(SinkState::TextClosed.next(&TextEnd), None);
        assert_eq!(SinkState::UsageReported.next(&UsageReport(Usage::default())), None);
        assert_eq!(SinkState::TextOpen.next(&StepEnd), None);
        assert_eq!(SinkState::TextOpen.next(&Final), None);
        assert_eq!(SinkState::Finished.next(&StepStart), None);
        assert_eq!(SinkState::Idle.next(&TextStart), None);
        assert_eq!(
            SinkState::StepOpen.next(&StepEnd),
            Some(SinkState::StepClosed)
        );
    }

    #[tokio::test]
    async fn test_abandoned_emit_leaves_state_untouched() {
        let (mut sink, mut stream) = EventSink::channel(1);
        sink.emit(CanonicalEvent::StepStart).await.unwrap();

        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            sink.emit(CanonicalEvent::TextStart),
        )
        .await;
        assert!(pending.is_err());
        assert!(!sink.is_text_open());

        assert_eq!(stream.next().await, Some(CanonicalEvent::StepStart));
        sink.emit(CanonicalEvent::TextStart).await.unwrap();
        assert!(sink.is_text_open());
        assert_eq!(stream.next().await, Some(CanonicalEvent::TextStart));
    }

    #[tokio::test]
    async fn test_closed_consumer_is_reported() {
        let (mut sink, stream) = EventSink::channel(4);
        drop(stream);
        assert_eq!(
            sink.emit(CanonicalEvent::StepStart).await,
            Err(SinkError::Closed)
        );
        assert!(sink.is_closed());
        assert!(sink.is_step_open());
    }

    #[tokio::test]
    async fn test_drop_mid_text_completes_sequence() {
        let (mut sink, stream) = EventSink::channel(16);
        sink.emit(CanonicalEvent::StepStart).await.unwrap();
        sink.emit(CanonicalEvent::TextStart).await.unwrap();
        sink.emit(CanonicalEvent::delta("partial")).await.unwrap();
        drop(sink);

        assert_eq!(
            drain(stream).await,
            vec![
                CanonicalEvent::StepStart,
                CanonicalEvent::TextStart,
                CanonicalEvent::delta("partial"),
                CanonicalEvent::TextEnd,
                CanonicalEvent::StepEnd,
                CanonicalEvent::Final,
            ]
        );
    }
}
