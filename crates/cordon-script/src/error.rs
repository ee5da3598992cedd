//! Error types for lexing and parsing.

use crate::span::Span;

/// A lexical or grammatical error with its source position.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({span})")]
pub struct SyntaxError {
    pub message: String,
    pub span: Span,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

/// Result type for the front end.
pub type ParseResult<T> = std::result::Result<T, SyntaxError>;
