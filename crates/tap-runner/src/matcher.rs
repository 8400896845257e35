//! Readiness detection over chunked process output
//!
//! Child output arrives in reads of arbitrary size. [`LineMatcher`] glues those
//! reads back into complete lines and tests each one against a
//! [`ReadinessPattern`]; an unterminated tail is carried into the next call and
//! is never matched on its own.

use regex::Regex;

use crate::error::{RunnerError, RunnerResult};

/// The line printed by ASP.NET Core hosts once Kestrel is accepting connections.
pub const LISTENING_PATTERN: &str = r"Now listening on: (http://localhost:\d+)";

/// A compiled pattern with at least one capture group.
///
/// The first group is the externally reachable base URL of the service.
#[derive(Debug, Clone)]
pub struct ReadinessPattern {
    regex: Regex,
}

impl ReadinessPattern {
    pub fn new(pattern: &str) -> RunnerResult<Self> {
        let regex = Regex::new(pattern)?;
        // captures_len counts the implicit whole-match group
        if regex.captures_len() < 2 {
            return Err(RunnerError::InvalidPattern(format!(
                "`{}` has no capture group for the service URL",
                pattern
            )));
        }
        Ok(Self { regex })
    }

    /// Pattern for `Now listening on: http://localhost:<port>`.
    pub fn listening() -> Self {
        Self {
            regex: Regex::new(LISTENING_PATTERN).expect("listening pattern is valid"),
        }
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Test a single complete line.
    pub fn match_line(&self, line: &str) -> Option<ReadinessMatch> {
        let captures = self.regex.captures(line)?;
        let groups = captures
            .iter()
            .skip(1)
            .map(|group| group.map(|m| m.as_str().to_string()))
            .collect();
        Some(ReadinessMatch {
            line: line.to_string(),
            groups,
        })
    }
}

impl Default for ReadinessPattern {
    fn default() -> Self {
        Self::listening()
    }
}

/// A line that matched a [`ReadinessPattern`], with its capture groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessMatch {
    pub line: String,
    pub groups: Vec<Option<String>>,
}

impl ReadinessMatch {
    /// The first capture group: the URL the browser should open.
    pub fn url(&self) -> &str {
        self.groups
            .first()
            .and_then(|group| group.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherState {
    Scanning,
    Matched,
}

/// Longest unterminated tail kept between reads. Older bytes of an
/// overlong line are dropped; the line is still delivered once it ends.
pub const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Reassembles complete lines from reads of arbitrary size.
///
/// Lines are split on raw bytes so a UTF-8 sequence cut by a read boundary is
/// decoded only once it is whole. A trailing `\r` is stripped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    carry: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = self.carry[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + offset;
            lines.push(decode_line(&self.carry[consumed..end]));
            consumed = end + 1;
        }
        self.carry.drain(..consumed);

        if self.carry.len() > MAX_PENDING_BYTES {
            let excess = self.carry.len() - MAX_PENDING_BYTES;
            self.carry.drain(..excess);
        }
        lines
    }

    /// Bytes received since the last line terminator.
    pub fn pending(&self) -> &[u8] {
        &self.carry
    }

    /// The unterminated tail, if any, leaving the buffer empty.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            return None;
        }
        let line = decode_line(&self.carry);
        self.carry.clear();
        Some(line)
    }

    pub fn clear(&mut self) {
        self.carry.clear();
    }
}

/// Line reassembly state for one output stream.
#[derive(Debug)]
pub struct LineMatcher {
    pattern: ReadinessPattern,
    lines: LineBuffer,
    state: MatcherState,
}

impl LineMatcher {
    pub fn new(pattern: ReadinessPattern) -> Self {
        Self {
            pattern,
            lines: LineBuffer::new(),
            state: MatcherState::Scanning,
        }
    }

    pub fn state(&self) -> MatcherState {
        self.state
    }

    /// Bytes received since the last line terminator.
    pub fn pending(&self) -> &[u8] {
        self.lines.pending()
    }

    /// Feed one chunk of output.
    ///
    /// Returns the first matching line. Once a match has been returned the
    /// matcher stops observing and every later call returns `None`.
    pub fn observe(&mut self, chunk: &[u8]) -> Option<ReadinessMatch> {
        if self.state == MatcherState::Matched {
            return None;
        }

        let found = self
            .lines
            .push(chunk)
            .iter()
            .find_map(|line| self.pattern.match_line(line))?;
        self.state = MatcherState::Matched;
        self.lines.clear();
        Some(found)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
