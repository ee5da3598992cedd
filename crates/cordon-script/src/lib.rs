//! cordon-script: front end for the sandbox script language.
//!
//! The language is a small, indentation-structured, Python-flavoured
//! subset. This crate turns source text into a [`ast::Module`]; policy
//! checking and evaluation live in `cordon-core`.
//!
//! # Modules
//!
//! - [`lexer`] : tokenizer with INDENT/DEDENT handling
//! - [`parser`]: recursive-descent parser with a nesting ceiling
//! - [`ast`]   : syntax tree and a read-only [`ast::Visitor`]
//! - [`span`]  : 1-based positions and source excerpts

pub mod ast;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod span;
pub mod token;

pub use ast::Module;
pub use error::{ParseResult, SyntaxError};
pub use parser::{parse, MAX_NESTING};
pub use span::{excerpt, Excerpt, Span};
