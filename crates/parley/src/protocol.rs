//! Wire encoding of canonical events for UI message stream consumers.
use serde::Serialize;

use crate::models::event::CanonicalEvent;
use crate::models::usage::Usage;

/// Header announcing the UI message stream protocol version
pub const STREAM_HEADER: &str = "x-vercel-ai-ui-message-stream";
pub const STREAM_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireEvent {
    StartStep,
    TextStart,
    TextDelta { delta: String },
    TextEnd,
    DataUsage { data: Usage },
    FinishStep,
    Final,
}

impl From<&CanonicalEvent> for WireEvent {
    fn from(event: &CanonicalEvent) -> Self {
        match event {
            CanonicalEvent::StepStart => WireEvent::StartStep,
            CanonicalEvent::TextStart => WireEvent::TextStart,
            CanonicalEvent::TextDelta(delta) => WireEvent::TextDelta {
                delta: delta.clone(),
            },
            CanonicalEvent::TextEnd => WireEvent::TextEnd,
            CanonicalEvent::UsageReport(usage) => WireEvent::DataUsage {
                data: usage.clone(),
            },
            // diagnostics stay in-band so the sequence keeps its shape
            CanonicalEvent::Error(message) => WireEvent::TextDelta {
                delta: format!("\n{}", message),
            },
            CanonicalEvent::StepEnd => WireEvent::FinishStep,
            CanonicalEvent::Final => WireEvent::Final,
        }
    }
}

pub struct ProtocolFormatter;

impl ProtocolFormatter {
    pub fn to_json(event: &CanonicalEvent) -> String {
        serde_json::to_string(&WireEvent::from(event)).unwrap_or_else(|err| {
            tracing::error!("Failed to encode {}: {}", event, err);
            String::from("{}")
        })
    }

    /// One server-sent-event record
    pub fn format_event(event: &CanonicalEvent) -> String {
        format!("data: {}\n\n", Self::to_json(event))
    }
}
