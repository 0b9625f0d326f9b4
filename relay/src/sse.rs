//! Codec for line-delimited `data: {json}` chat-completion streams.
//!
//! Bytes arrive in arbitrary chunks. [`LineDecoder`] cuts them into complete
//! lines, holding back any trailing partial line (including a split UTF-8
//! sequence) until the rest arrives. [`parse_line`] turns one line into a
//! [`Line`].

use serde::Deserialize;
use tracing::warn;

use crate::error::ParseError;
use crate::types::TextDelta;

/// Prefix of every payload-carrying line.
pub const DATA_PREFIX: &str = "data: ";

/// Payload marking the end of the stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Deltas extracted from one `choices[0].delta`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatDelta {
    pub content: Option<String>,
    pub reasoning: Option<String>,
}

impl ChatDelta {
    /// Splits into channel-tagged deltas, content first. Empty strings are
    /// dropped.
    pub fn into_text_deltas(self) -> impl Iterator<Item = TextDelta> {
        let content = self
            .content
            .filter(|s| !s.is_empty())
            .map(TextDelta::Content);
        let reasoning = self
            .reasoning
            .filter(|s| !s.is_empty())
            .map(TextDelta::Reasoning);
        content.into_iter().chain(reasoning)
    }
}

/// Classification of one complete line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// Blank, comment, or non-`data: ` line.
    Skip,
    /// The end-of-stream sentinel.
    Done,
    /// A parsed chunk.
    Delta(ChatDelta),
}

#[derive(Deserialize)]
struct ChunkWire {
    #[serde(default)]
    choices: Vec<ChoiceWire>,
}

#[derive(Deserialize)]
struct ChoiceWire {
    #[serde(default)]
    delta: DeltaWire,
}

#[derive(Deserialize, Default)]
struct DeltaWire {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

/// Parses one line of the stream.
pub fn parse_line(line: &str) -> Result<Line, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Line::Skip);
    }

    let Some(data) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(Line::Skip);
    };
    let data = data.trim();
    if data == DONE_SENTINEL {
        return Ok(Line::Done);
    }

    let chunk: ChunkWire = serde_json::from_str(data)?;
    let delta = chunk
        .choices
        .into_iter()
        .next()
        .map(|c| ChatDelta {
            content: c.delta.content,
            reasoning: c.delta.reasoning_content,
        })
        .unwrap_or_default();

    Ok(Line::Delta(delta))
}

/// Longest partial line held back by default.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Reassembles newline-terminated lines from a byte stream.
///
/// Only bytes not yet searched are scanned for a newline on each push. A
/// partial line longer than the limit is dropped along with the rest of that
/// line.
#[derive(Debug)]
pub struct LineDecoder {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
    max_line: usize,
    /// Skipping the remainder of an oversized line.
    discarding: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line,
            discarding: false,
        }
    }

    /// Appends `chunk` and returns every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(pos) = self.buf[from..].iter().position(|&b| b == b'\n') {
            let end = from + pos;
            if self.discarding {
                self.discarding = false;
            } else {
                lines.push(String::from_utf8_lossy(&self.buf[start..end]).into_owned());
            }
            start = end + 1;
            from = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();

        if self.buf.len() > self.max_line {
            warn!(len = self.buf.len(), limit = self.max_line, "dropping oversized line");
            self.buf.clear();
            self.scanned = 0;
            self.discarding = true;
        }
        lines
    }

    /// Returns the unterminated remainder, if any, once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let discarding = std::mem::take(&mut self.discarding);
        self.scanned = 0;
        if self.buf.is_empty() || discarding {
            self.buf.clear();
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(rest)
    }

    /// Number of bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
