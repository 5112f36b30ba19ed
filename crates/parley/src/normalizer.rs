//! Translates raw backend records into canonical events.
//!
//! The normalizer never emits framing (`TextStart`/`TextEnd` and friends); the
//! orchestrator owns those. It only produces `TextDelta`, `Error` and
//! `UsageReport` events, one raw record at a time, in arrival order. With
//! word chunking, text is held back until a whole word is available and the
//! remainder comes out of [`Normalizer::flush`].
use serde_json::Value;

use crate::backends::base::{Chunking, DeltaMode, RawRecord};
use crate::models::event::CanonicalEvent;
use crate::models::usage::Usage;

/// Record discriminators that only frame the remote side's own stream
const FRAMING_RECORDS: &[&str] = &[
    "start",
    "start-step",
    "text-start",
    "text-end",
    "finish-step",
    "end-step",
    "finish",
];

/// End-of-stream marker some SSE producers send as a bare payload
const DONE_MARKER: &str = "[DONE]";

/// Progress records with no user-visible text
const PROGRESS_RECORDS: &[&str] = &["thinking", "resume_ready", "reasoning", "tool"];

#[derive(Debug)]
pub struct Normalizer {
    mode: DeltaMode,
    chunking: Chunking,
    previous: String,
    held: String,
    dropped: usize,
}

impl Normalizer {
    pub fn new(mode: DeltaMode) -> Self {
        Self {
            mode,
            chunking: Chunking::None,
            previous: String::new(),
            held: String::new(),
            dropped: 0,
        }
    }

    pub fn with_chunking(mut self, chunking: Chunking) -> Self {
        self.chunking = chunking;
        self
    }

    /// Number of records dropped because they could not be parsed
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn push(&mut self, record: RawRecord) -> Vec<CanonicalEvent> {
        let events = match record {
            RawRecord::Fragment(text) => delta_event(text).into_iter().collect(),
            RawRecord::Usage(usage) => vec![CanonicalEvent::UsageReport(usage)],
            RawRecord::Payload(value) => delta_event(render_payload(&value)).into_iter().collect(),
            RawRecord::Line(line) => self.push_line(&line),
        };
        match self.chunking {
            Chunking::None => events,
            Chunking::Word => self.regroup(events),
        }
    }

    /// Release text held back for word chunking
    pub fn flush(&mut self) -> Option<CanonicalEvent> {
        delta_event(std::mem::take(&mut self.held))
    }

    /// Split deltas into whole words; anything else flushes the held text first
    fn regroup(&mut self, events: Vec<CanonicalEvent>) -> Vec<CanonicalEvent> {
        let mut regrouped = Vec::new();
        for event in events {
            match event {
                CanonicalEvent::TextDelta(text) => {
                    self.held.push_str(&text);
                    while let Some(end) = word_boundary(&self.held) {
                        let rest = self.held.split_off(end);
                        regrouped.push(CanonicalEvent::TextDelta(std::mem::replace(
                            &mut self.held,
                            rest,
                        )));
                    }
                }
                other => {
                    regrouped.extend(self.flush());
                    regrouped.push(other);
                }
            }
        }
        regrouped
    }

    fn push_line(&mut self, line: &str) -> Vec<CanonicalEvent> {
        if line.trim() == DONE_MARKER {
            tracing::debug!("Ignoring remote end-of-stream marker");
            return Vec::new();
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                self.dropped += 1;
                tracing::warn!(error = %err, "Dropping malformed record: {:.200}", line);
                return Vec::new();
            }
        };

        let discriminator = value
            .get("type")
            .or_else(|| value.get("event"))
            .and_then(|d| d.as_str());

        match discriminator {
            Some("error") => {
                let message = value
                    .get("message")
                    .or_else(|| value.get("errorText"))
                    .or_else(|| value.get("error"))
                    .map(|m| m.as_str().map(String::from).unwrap_or_else(|| m.to_string()))
                    .unwrap_or_else(|| "unknown error".to_string());
                vec![CanonicalEvent::Error(message)]
            }
            Some("data-usage") | Some("usage") => {
                let usage = value
                    .get("data")
                    .or_else(|| value.get("usage"))
                    .and_then(Usage::from_value);
                match usage {
                    Some(usage) => vec![CanonicalEvent::UsageReport(usage)],
                    None => {
                        tracing::debug!("Ignoring usage record without counts");
                        Vec::new()
                    }
                }
            }
            Some(kind) if PROGRESS_RECORDS.contains(&kind) => {
                tracing::debug!(kind, "Ignoring progress record");
                Vec::new()
            }
            Some(kind) if FRAMING_RECORDS.contains(&kind) => {
                tracing::debug!(kind, "Ignoring remote framing record");
                Vec::new()
            }
            _ => match record_text(&value) {
                Some(text) => self.apply_mode(text).into_iter().collect(),
                None => {
                    tracing::debug!(?discriminator, "Ignoring record without text");
                    Vec::new()
                }
            },
        }
    }

    fn apply_mode(&mut self, text: &str) -> Option<CanonicalEvent> {
        match self.mode {
            DeltaMode::Incremental => delta_event(text.to_string()),
            DeltaMode::Cumulative => {
                let delta = cumulative_delta(&self.previous, text);
                if delta.is_empty() {
                    return None;
                }
                let delta = delta.to_string();
                self.previous = text.to_string();
                delta_event(delta)
            }
        }
    }
}

/// Text newly added by `current` relative to `previous`.
///
/// Duplicate, shorter or out-of-order snapshots yield an empty delta.
pub fn cumulative_delta<'a>(previous: &str, current: &'a str) -> &'a str {
    if current.len() <= previous.len() {
        return "";
    }
    if !current.starts_with(previous) {
        tracing::warn!("Snapshot does not extend the previous snapshot");
    }
    current.get(previous.len()..).unwrap_or("")
}

/// Byte offset just past the first word and the whitespace following it
fn word_boundary(text: &str) -> Option<usize> {
    let word = text.find(|c: char| !c.is_whitespace())?;
    let space = word + text[word..].find(char::is_whitespace)?;
    let end = text[space..]
        .find(|c: char| !c.is_whitespace())
        .map_or(text.len(), |offset| space + offset);
    Some(end)
}

fn record_text(value: &Value) -> Option<&str> {
    ["delta", "response", "text", "content"]
        .iter()
        .find_map(|field| value.get(*field).and_then(|v| v.as_str()))
}

/// Render a single-shot result as the text shown to the user.
///
/// Research reports carry an `answer` and optional `sources`; anything else
/// that is not a plain string is shown as compact JSON.
pub fn render_payload(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Object(map) => match map.get("answer").and_then(|a| a.as_str()) {
            Some(answer) => {
                let sources: Vec<String> = map
                    .get("sources")
                    .and_then(|s| s.as_array())
                    .map(|sources| sources.iter().filter_map(render_source).collect())
                    .unwrap_or_default();
                if sources.is_empty() {
                    answer.to_string()
                } else {
                    format!("{}\n\nSources:\n{}", answer, sources.join("\n"))
                }
            }
            None => value.to_string(),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn render_source(source: &Value) -> Option<String> {
    let url = source.get("url").and_then(|u| u.as_str())?;
    let title = source
        .get("title")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .unwrap_or(url);
    Some(format!("- [{}]({})", title, url))
}

fn delta_event(text: String) -> Option<CanonicalEvent> {
    (!text.is_empty()).then_some(CanonicalEvent::TextDelta(text))
}
