use std::fmt;

use crate::error::SyntaxError;
use crate::source::Source;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Eof,
    Text,
    BlockStart,
    VarStart,
    BlockEnd,
    VarEnd,
    Name,
    Number,
    String,
    Operator,
    Punctuation,
    InterpolationStart,
    InterpolationEnd,
    Spread,
    Arrow,
}

impl TokenKind {
    /// Human readable name used in error messages.
    pub const fn describe(self) -> &'static str {
        match self {
            Self::Eof => "end of template",
            Self::Text => "text",
            Self::BlockStart => "begin of statement block",
            Self::VarStart => "begin of print statement",
            Self::BlockEnd => "end of statement block",
            Self::VarEnd => "end of print statement",
            Self::Name => "name",
            Self::Number => "number",
            Self::String => "string",
            Self::Operator => "operator",
            Self::Punctuation => "punctuation",
            Self::InterpolationStart => "begin of string interpolation",
            Self::InterpolationEnd => "end of string interpolation",
            Self::Spread => "spread operator",
            Self::Arrow => "arrow function",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    kind: TokenKind,
    value: String,
    line: usize,
}

impl Token {
    pub fn new<V: Into<String>>(kind: TokenKind, value: V, line: usize) -> Self {
        Self {
            kind,
            value: value.into(),
            line,
        }
    }

    pub const fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub const fn line(&self) -> usize {
        self.line
    }

    pub fn test(&self, kind: TokenKind) -> bool {
        self.kind == kind
    }

    pub fn test_value(&self, kind: TokenKind, value: &str) -> bool {
        self.kind == kind && self.value == value
    }

    pub fn test_any(&self, kind: TokenKind, values: &[&str]) -> bool {
        self.kind == kind && values.contains(&self.value.as_str())
    }

    /// Shorthand for a name token with the given value, the usual way end
    /// tags such as `endfor` are recognised.
    pub fn is_name(&self, value: &str) -> bool {
        self.test_value(TokenKind::Name, value)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.value)
    }
}

/// Tokens of one source with a cursor.
///
/// The stream always ends with an [`TokenKind::Eof`] token.
#[derive(Debug, Clone)]
pub struct TokenStream {
    tokens: Vec<Token>,
    current: usize,
    source: Source,
}

impl TokenStream {
    pub fn new(mut tokens: Vec<Token>, source: Source) -> Self {
        if !tokens.last().is_some_and(|t| t.test(TokenKind::Eof)) {
            let line = tokens.last().map_or(1, Token::line);
            tokens.push(Token::new(TokenKind::Eof, "", line));
        }
        Self {
            tokens,
            current: 0,
            source,
        }
    }

    pub const fn source(&self) -> &Source {
        &self.source
    }

    pub fn current(&self) -> &Token {
        self.tokens
            .get(self.current)
            .or_else(|| self.tokens.last())
            .expect("token stream always ends with an end-of-template token")
    }

    /// Returns the current token and moves to the next one.
    pub fn next(&mut self) -> Result<Token, SyntaxError> {
        let token = self.current().clone();
        if self.current.saturating_add(1) >= self.tokens.len() {
            return Err(SyntaxError::new("Unexpected end of template.", token.line()));
        }
        self.current = self.current.saturating_add(1);
        Ok(token)
    }

    pub fn next_if(&mut self, kind: TokenKind) -> Option<Token> {
        if self.current().test(kind) {
            self.next().ok()
        } else {
            None
        }
    }

    pub fn next_if_value(&mut self, kind: TokenKind, value: &str) -> Option<Token> {
        if self.current().test_value(kind, value) {
            self.next().ok()
        } else {
            None
        }
    }

    pub fn next_if_any(&mut self, kind: TokenKind, values: &[&str]) -> Option<Token> {
        if self.current().test_any(kind, values) {
            self.next().ok()
        } else {
            None
        }
    }

    pub fn expect(&mut self, kind: TokenKind) -> Result<Token, SyntaxError> {
        self.expect_with(kind, None, None)
    }

    pub fn expect_value(&mut self, kind: TokenKind, value: &str) -> Result<Token, SyntaxError> {
        self.expect_with(kind, Some(value), None)
    }

    /// Asserts the current token and consumes it, failing with an
    /// `Unexpected token` error prefixed by `message` otherwise.
    pub fn expect_with(
        &mut self,
        kind: TokenKind,
        value: Option<&str>,
        message: Option<&str>,
    ) -> Result<Token, SyntaxError> {
        let token = self.current();
        let matches = match value {
            Some(v) => token.test_value(kind, v),
            None => token.test(kind),
        };
        if !matches {
            let found_value = if token.value().is_empty() {
                String::new()
            } else {
                format!(" of value \"{}\"", token.value())
            };
            let expected_value = value.map_or_else(String::new, |v| format!(" with value \"{v}\""));
            return Err(SyntaxError::new(
                format!(
                    "{}Unexpected token \"{}\"{} (\"{}\" expected{}).",
                    message.map_or_else(String::new, |m| format!("{m}. ")),
                    token.kind(),
                    found_value,
                    kind,
                    expected_value,
                ),
                token.line(),
            ));
        }
        self.next()
    }

    /// Looks `offset` tokens away from the current one (negative looks back).
    pub fn look(&self, offset: isize) -> Option<&Token> {
        self.current
            .checked_add_signed(offset)
            .and_then(|i| self.tokens.get(i))
    }

    pub fn test(&self, kind: TokenKind) -> bool {
        self.current().test(kind)
    }

    pub fn test_value(&self, kind: TokenKind, value: &str) -> bool {
        self.current().test_value(kind, value)
    }

    pub fn test_any(&self, kind: TokenKind, values: &[&str]) -> bool {
        self.current().test_any(kind, values)
    }

    pub fn is_eof(&self) -> bool {
        self.current().test(TokenKind::Eof)
    }

    /// Inserts tokens right before the current one.
    pub fn inject(&mut self, tokens: Vec<Token>) {
        let tail = self.tokens.split_off(self.current);
        self.tokens.extend(tokens);
        self.tokens.extend(tail);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }
}
