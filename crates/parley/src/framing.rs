//! Splits a raw byte feed into record payloads.
//!
//! Two framings are understood:
//! - `Sse`: records separated by a blank line, each carrying one or more
//!   `data:` lines whose values are joined with `\n`
//! - `Ndjson`: one JSON document per line
//!
//! Chunk boundaries from the transport are arbitrary, so the framer buffers
//! bytes until a full delimiter is seen. Payloads are returned verbatim; the
//! normalizer decides whether they parse.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    #[default]
    Sse,
    Ndjson,
}

#[derive(Debug)]
pub struct LineFramer {
    framing: Framing,
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
        }
    }

    /// Feed a chunk and return every payload it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut records = Vec::new();

        while let Some((end, delimiter_len)) = self.next_boundary() {
            let raw: Vec<u8> = self.buffer.drain(..end + delimiter_len).take(end).collect();
            if let Some(payload) = self.decode(&raw) {
                records.push(payload);
            }
        }

        records
    }

    /// Flush whatever is left once the transport is exhausted
    pub fn finish(mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buffer);
        self.decode(&raw)
    }

    fn next_boundary(&self) -> Option<(usize, usize)> {
        match self.framing {
            Framing::Ndjson => self
                .buffer
                .iter()
                .position(|b| *b == b'\n')
                .map(|pos| (pos, 1)),
            Framing::Sse => {
                let lf = find(&self.buffer, b"\n\n").map(|pos| (pos, 2));
                let crlf = find(&self.buffer, b"\r\n\r\n").map(|pos| (pos, 4));
                match (lf, crlf) {
                    (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
                    (a, b) => a.or(b),
                }
            }
        }
    }

    fn decode(&self, raw: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(raw);
        match self.framing {
            Framing::Ndjson => {
                let line = text.trim();
                (!line.is_empty()).then(|| line.to_string())
            }
            Framing::Sse => {
                let data: Vec<&str> = text
                    .lines()
                    .filter_map(|line| line.strip_prefix("data:"))
                    .map(|value| value.strip_prefix(' ').unwrap_or(value))
                    .collect();
                if data.is_empty() {
                    if !text.trim().is_empty() {
                        tracing::debug!("Ignoring SSE record without data: {:?}", text);
                    }
                    return None;
                }
                Some(data.join("\n"))
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
