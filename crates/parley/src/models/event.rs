use std::fmt;

use super::usage::Usage;

/// The single event vocabulary surfaced to consumers, independent of backend
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalEvent {
    StepStart,
    TextStart,
    TextDelta(String),
    TextEnd,
    UsageReport(Usage),
    /// An in-band diagnostic; rendered to the user as appended text
    Error(String),
    StepEnd,
    Final,
}

impl CanonicalEvent {
    pub fn delta<S: Into<String>>(text: S) -> Self {
        CanonicalEvent::TextDelta(text.into())
    }

    /// Protocol name of the event
    pub fn name(&self) -> &'static str {
        match self {
            CanonicalEvent::StepStart => "start-step",
            CanonicalEvent::TextStart => "text-start",
            CanonicalEvent::TextDelta(_) => "text-delta",
            CanonicalEvent::TextEnd => "text-end",
            CanonicalEvent::UsageReport(_) => "data-usage",
            CanonicalEvent::Error(_) => "error",
            CanonicalEvent::StepEnd => "finish-step",
            CanonicalEvent::Final => "final",
        }
    }

    pub fn as_delta(&self) -> Option<&str> {
        match self {
            CanonicalEvent::TextDelta(delta) => Some(delta),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, CanonicalEvent::Final)
    }
}

impl fmt::Display for CanonicalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
