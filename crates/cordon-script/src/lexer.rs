//! Indentation-aware tokenizer.
//!
//! Produces `Newline`/`Indent`/`Dedent` tokens for logical lines. Newlines
//! inside brackets and after a trailing backslash are joined.

use crate::error::{ParseResult, SyntaxError};
use crate::span::Span;
use crate::token::{Keyword, Token, TokenKind, OPERATORS};

const TAB_WIDTH: usize = 8;

/// Tokenize `source` into a flat token stream terminated by `Eof`.
pub fn tokenize(source: &str) -> ParseResult<Vec<Token>> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
    indents: Vec<usize>,
    bracket_depth: usize,
    at_line_start: bool,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            indents: vec![0],
            bracket_depth: 0,
            at_line_start: true,
            tokens: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn here(&self) -> Span {
        Span::new(self.line, self.col)
    }

    fn push(&mut self, kind: TokenKind, span: Span) {
        self.tokens.push(Token { kind, span });
    }

    fn last_is_newline(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.kind),
            None | Some(TokenKind::Newline) | Some(TokenKind::Indent) | Some(TokenKind::Dedent)
        )
    }

    fn run(mut self) -> ParseResult<Vec<Token>> {
        loop {
            if self.at_line_start && self.bracket_depth == 0 {
                self.at_line_start = false;
                if self.handle_indentation()? {
                    continue;
                }
            }
            let Some(c) = self.peek() else { break };
            match c {
                ' ' | '\t' | '\x0c' | '\r' => {
                    self.bump();
                }
                '#' => self.skip_comment(),
                '\\' => {
                    let span = self.here();
                    self.bump();
                    if self.peek() == Some('\r') {
                        self.bump();
                    }
                    if self.peek() != Some('\n') {
                        return Err(SyntaxError::new(
                            "unexpected character after line continuation character",
                            span,
                        ));
                    }
                    self.bump();
                }
                '\n' => {
                    let span = self.here();
                    self.bump();
                    if self.bracket_depth == 0 {
                        if !self.last_is_newline() {
                            self.push(TokenKind::Newline, span);
                        }
                        self.at_line_start = true;
                    }
                }
                c if c.is_ascii_digit() => self.lex_number()?,
                '.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => {
                    self.lex_number()?
                }
                c if c == '_' || c.is_alphabetic() => self.lex_word()?,
                '"' | '\'' => self.lex_string(StringPrefix::default())?,
                _ => self.lex_operator()?,
            }
        }

        let span = self.here();
        if !self.last_is_newline() {
            self.push(TokenKind::Newline, span);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(TokenKind::Dedent, span);
        }
        self.push(TokenKind::Eof, span);
        Ok(self.tokens)
    }

    /// Measure leading whitespace and emit indentation tokens.
    ///
    /// Returns `true` when the line was blank or comment-only and consumed.
    fn handle_indentation(&mut self) -> ParseResult<bool> {
        let mut width = 0usize;
        while let Some(c) = self.peek() {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / TAB_WIDTH + 1) * TAB_WIDTH,
                '\x0c' => width = 0,
                _ => break,
            }
            self.bump();
        }
        match self.peek() {
            None => return Ok(false),
            Some('#') => {
                self.skip_comment();
                self.consume_line_end();
                return Ok(true);
            }
            Some('\n') | Some('\r') => {
                self.consume_line_end();
                return Ok(true);
            }
            _ => {}
        }

        let span = self.here();
        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(TokenKind::Indent, span);
        } else if width < current {
            while self.indents.last().copied().unwrap_or(0) > width {
                self.indents.pop();
                self.push(TokenKind::Dedent, span);
            }
            if self.indents.last().copied().unwrap_or(0) != width {
                return Err(SyntaxError::new(
                    "unindent does not match any outer indentation level",
                    span,
                ));
            }
        }
        Ok(false)
    }

    fn consume_line_end(&mut self) {
        if self.peek() == Some('\r') {
            self.bump();
        }
        if self.peek() == Some('\n') {
            self.bump();
        }
        self.at_line_start = true;
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn lex_word(&mut self) -> ParseResult<()> {
        let span = self.here();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '_' || c.is_alphanumeric() {
                self.bump();
            } else {
                break;
            }
        }
        let word: String = self.chars[start..self.pos].iter().collect();

        if matches!(self.peek(), Some('"') | Some('\'')) {
            if let Some(prefix) = StringPrefix::parse(&word) {
                if prefix.format {
                    return Err(SyntaxError::new("f-strings are not supported", span));
                }
                return self.lex_string_at(prefix, span);
            }
        }

        let kind = match Keyword::from_ident(&word) {
            Some(kw) => TokenKind::Keyword(kw),
            None => TokenKind::Name(word),
        };
        self.push(kind, span);
        Ok(())
    }

    fn lex_number(&mut self) -> ParseResult<()> {
        let span = self.here();
        let start = self.pos;

        if self.peek() == Some('0') {
            let radix = match self.peek_at(1) {
                Some('x') | Some('X') => Some(16),
                Some('o') | Some('O') => Some(8),
                Some('b') | Some('B') => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.bump();
                self.bump();
                let digits_start = self.pos;
                while let Some(c) = self.peek() {
                    if c == '_' || c.is_ascii_alphanumeric() {
                        self.bump();
                    } else {
                        break;
                    }
                }
                let digits: String = self.chars[digits_start..self.pos]
                    .iter()
                    .filter(|c| **c != '_')
                    .collect();
                let value = i64::from_str_radix(&digits, radix).map_err(|e| {
                    SyntaxError::new(format!("invalid integer literal: {e}"), span)
                })?;
                self.push(TokenKind::Int(value), span);
                return Ok(());
            }
        }

        let mut is_float = false;
        self.take_digits();
        if self.peek() == Some('.') {
            is_float = true;
            self.bump();
            self.take_digits();
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let sign_offset = usize::from(matches!(self.peek_at(1), Some('+') | Some('-')));
            if self
                .peek_at(1 + sign_offset)
                .is_some_and(|c| c.is_ascii_digit())
            {
                is_float = true;
                self.bump();
                if sign_offset == 1 {
                    self.bump();
                }
                self.take_digits();
            }
        }
        if matches!(self.peek(), Some('j') | Some('J')) {
            return Err(SyntaxError::new("complex literals are not supported", span));
        }
        if self.peek().is_some_and(|c| c == '_' || c.is_alphabetic()) {
            return Err(SyntaxError::new("invalid decimal literal", span));
        }

        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        let kind = if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|e| SyntaxError::new(format!("invalid float literal: {e}"), span))?;
            TokenKind::Float(value)
        } else {
            let value = text
                .parse::<i64>()
                .map_err(|_| SyntaxError::new("integer literal too large", span))?;
            TokenKind::Int(value)
        };
        self.push(kind, span);
        Ok(())
    }

    fn take_digits(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn lex_string(&mut self, prefix: StringPrefix) -> ParseResult<()> {
        let span = self.here();
        self.lex_string_at(prefix, span)
    }

    fn lex_string_at(&mut self, prefix: StringPrefix, span: Span) -> ParseResult<()> {
        let Some(quote) = self.bump() else {
            return Err(SyntaxError::new("expected string literal", span));
        };
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }

        let mut out = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(SyntaxError::new("unterminated string literal", span));
            };
            if c == quote {
                if !triple {
                    self.bump();
                    break;
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.bump();
                    self.bump();
                    self.bump();
                    break;
                }
                out.push(c);
                self.bump();
                continue;
            }
            if c == '\n' && !triple {
                return Err(SyntaxError::new("unterminated string literal", span));
            }
            if c == '\\' {
                self.bump();
                let Some(next) = self.peek() else {
                    return Err(SyntaxError::new("unterminated string literal", span));
                };
                if prefix.raw {
                    out.push('\\');
                    out.push(next);
                    self.bump();
                    continue;
                }
                self.lex_escape(&mut out, span)?;
                continue;
            }
            out.push(c);
            self.bump();
        }

        // Adjacent literals are joined by the parser.
        self.push(TokenKind::Str(out), span);
        Ok(())
    }

    fn lex_escape(&mut self, out: &mut String, span: Span) -> ParseResult<()> {
        let Some(c) = self.bump() else {
            return Err(SyntaxError::new("unterminated string literal", span));
        };
        match c {
            '\n' => {}
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'v' => out.push('\x0b'),
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'x' => out.push(self.hex_escape(2, span)?),
            'u' => out.push(self.hex_escape(4, span)?),
            'U' => out.push(self.hex_escape(8, span)?),
            '0'..='7' => {
                let mut value = c.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match self.peek().and_then(|d| d.to_digit(8)) {
                        Some(d) => {
                            value = value * 8 + d;
                            self.bump();
                        }
                        None => break,
                    }
                }
                let ch = char::from_u32(value)
                    .ok_or_else(|| SyntaxError::new("invalid octal escape", span))?;
                out.push(ch);
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
        Ok(())
    }

    fn hex_escape(&mut self, len: usize, span: Span) -> ParseResult<char> {
        let mut value = 0u32;
        for _ in 0..len {
            let digit = self
                .peek()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| SyntaxError::new("truncated \\x/\\u escape", span))?;
            value = value * 16 + digit;
            self.bump();
        }
        char::from_u32(value).ok_or_else(|| SyntaxError::new("invalid unicode escape", span))
    }

    fn lex_operator(&mut self) -> ParseResult<()> {
        let span = self.here();
        for op in OPERATORS {
            let len = op.chars().count();
            let matches = op
                .chars()
                .enumerate()
                .all(|(i, c)| self.peek_at(i) == Some(c));
            if matches {
                for _ in 0..len {
                    self.bump();
                }
                match *op {
                    "(" | "[" | "{" => self.bracket_depth += 1,
                    ")" | "]" | "}" => {
                        self.bracket_depth = self.bracket_depth.saturating_sub(1)
                    }
                    _ => {}
                }
                self.push(TokenKind::Op(op), span);
                return Ok(());
            }
        }
        let c = self.peek().unwrap_or(' ');
        Err(SyntaxError::new(format!("invalid character '{c}'"), span))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct StringPrefix {
    raw: bool,
    format: bool,
}

impl StringPrefix {
    fn parse(word: &str) -> Option<Self> {
        if word.is_empty() || word.len() > 2 {
            return None;
        }
        let mut prefix = StringPrefix::default();
        for c in word.chars() {
            match c.to_ascii_lowercase() {
                'r' => prefix.raw = true,
                'f' => prefix.format = true,
                'b' | 'u' => {}
                _ => return None,
            }
        }
        Some(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_simple_assignment() {
        assert_eq!(
            kinds("x = 1\n"),
            vec![
                TokenKind::Name("x".into()),
                TokenKind::Op("="),
                TokenKind::Int(1),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_indentation_blocks() {
        let k = kinds("if x:\n    y = 2\nz = 3\n");
        assert!(k.contains(&TokenKind::Indent));
        assert!(k.contains(&TokenKind::Dedent));
        let indent = k.iter().position(|t| *t == TokenKind::Indent).unwrap();
        let dedent = k.iter().position(|t| *t == TokenKind::Dedent).unwrap();
        assert!(indent < dedent);
    }

    #[test]
    fn test_brackets_join_lines() {
        let k = kinds("x = [1,\n     2]\n");
        let newlines = k.iter().filter(|t| **t == TokenKind::Newline).count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn test_numbers_in_all_bases() {
        assert_eq!(kinds("0x1f")[0], TokenKind::Int(31));
        assert_eq!(kinds("0o17")[0], TokenKind::Int(15));
        assert_eq!(kinds("0b101")[0], TokenKind::Int(5));
        assert_eq!(kinds("1_000")[0], TokenKind::Int(1000));
        assert_eq!(kinds("2.5")[0], TokenKind::Float(2.5));
        assert_eq!(kinds("1e3")[0], TokenKind::Float(1000.0));
        assert_eq!(kinds(".5")[0], TokenKind::Float(0.5));
    }

    #[test]
    fn test_string_escapes_and_raw() {
        assert_eq!(kinds(r#""a\nb""#)[0], TokenKind::Str("a\nb".into()));
        assert_eq!(kinds(r#"r"a\nb""#)[0], TokenKind::Str("a\\nb".into()));
        assert_eq!(kinds("'''x\ny'''")[0], TokenKind::Str("x\ny".into()));
        assert_eq!(kinds(r#""\x41\u00e9""#)[0], TokenKind::Str("Aé".into()));
    }

    #[test]
    fn test_fstring_rejected() {
        let err = tokenize("f'{x}'").unwrap_err();
        assert!(err.message.contains("f-strings"));
    }

    #[test]
    fn test_bad_dedent_rejected() {
        let err = tokenize("if x:\n    y = 1\n  z = 2\n").unwrap_err();
        assert!(err.message.contains("unindent"));
        assert_eq!(err.span.line, 3);
    }

    #[test]
    fn test_integer_overflow_is_error() {
        let err = tokenize("99999999999999999999").unwrap_err();
        assert!(err.message.contains("too large"));
    }

    #[test]
    fn test_operators_match_longest() {
        let k = kinds("a **= 2 // 3");
        assert_eq!(k[1], TokenKind::Op("**="));
        assert_eq!(k[3], TokenKind::Op("//"));
    }

    #[test]
    fn test_comments_and_blank_lines_skipped() {
        let k = kinds("# header\n\nx = 1  # trailing\n\n");
        assert_eq!(k.len(), 5);
    }

    #[test]
    fn test_spans_are_one_based() {
        let toks = tokenize("x = 1\n  \ny").unwrap();
        assert_eq!(toks[0].span, Span::new(1, 1));
        let y = toks
            .iter()
            .find(|t| t.kind == TokenKind::Name("y".into()))
            .unwrap();
        assert_eq!(y.span, Span::new(3, 1));
    }
}
