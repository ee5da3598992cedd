//! Source positions and excerpts.

use serde::{Deserialize, Serialize};

/// A 1-based line/column position in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

impl Span {
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, col {}", self.line, self.col)
    }
}

/// The offending source line plus a caret marking the column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Excerpt {
    pub text: String,
    pub caret: String,
}

/// Extract the line at `span` and build a caret line under `span.col`.
///
/// Returns `None` when the line does not exist in `source`.
pub fn excerpt(source: &str, span: Span) -> Option<Excerpt> {
    if span.line == 0 {
        return None;
    }
    let line = source.lines().nth(span.line as usize - 1)?;
    let text = line.trim_end().to_string();
    let width = text.chars().count();
    let col = (span.col.max(1) as usize - 1).min(width);
    let caret = format!("{}^", " ".repeat(col));
    Some(Excerpt { text, caret })
}
