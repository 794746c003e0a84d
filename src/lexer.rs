use serde::{Deserialize, Serialize};

use crate::error::SyntaxError;
use crate::source::Source;
use crate::token::{Token, TokenKind, TokenStream};

type LexResult<T> = Result<T, SyntaxError>;

/// `\s` as understood by the template syntax.
const WHITESPACE: &[char] = &[' ', '\t', '\n', '\r', '\0', '\x0B', '\x0C'];
/// Whitespace removed by the line-trim modifier: never the newline itself.
const WHITESPACE_LINE: &[char] = &[' ', '\t', '\0', '\x0B'];
const PUNCTUATION: &str = "()[]{}?:.,|";

/// Delimiters recognised by the lexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LexerOptions {
    pub tag_comment: (String, String),
    pub tag_block: (String, String),
    pub tag_variable: (String, String),
    pub whitespace_trim: char,
    pub whitespace_line_trim: char,
    pub interpolation: (String, String),
}

impl Default for LexerOptions {
    fn default() -> Self {
        Self {
            tag_comment: ("{#".to_owned(), "#}".to_owned()),
            tag_block: ("{%".to_owned(), "%}".to_owned()),
            tag_variable: ("{{".to_owned(), "}}".to_owned()),
            whitespace_trim: '-',
            whitespace_line_trim: '~',
            interpolation: ("#{".to_owned(), "}".to_owned()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Block,
    Var,
    String,
    Interpolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delimiter {
    Comment,
    Block,
    Variable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trim {
    All,
    Line,
}

/// Where a delimiter opens, found once up front so text scanning never
/// restarts from the beginning of the template.
#[derive(Debug, Clone, Copy)]
struct TagStart {
    pos: usize,
    len: usize,
    delimiter: Delimiter,
    trim: Option<Trim>,
}

/// Turns template source into tokens.
///
/// Built once per environment from the frozen operator tables.
#[derive(Debug, Clone)]
pub struct Lexer {
    options: LexerOptions,
    /// Longest first, so `not in` wins over `not`.
    operators: Vec<String>,
}

impl Lexer {
    pub fn new<I, S>(options: LexerOptions, operators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut operators: Vec<String> = operators
            .into_iter()
            .map(Into::into)
            .chain(std::iter::once("=".to_owned()))
            .collect();
        operators.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        operators.dedup();
        Self { options, operators }
    }

    pub const fn options(&self) -> &LexerOptions {
        &self.options
    }

    /// Tokenizes a whole source.
    ///
    /// # Errors
    ///
    /// Returns a [`SyntaxError`] naming the unterminated construct and the
    /// line it started on when a delimiter, string, bracket, comment or
    /// verbatim span is never closed, or when an unexpected character shows
    /// up inside an expression.
    pub fn tokenize(&self, source: &Source) -> LexResult<TokenStream> {
        let code = source.code().replace("\r\n", "\n").replace('\r', "\n");
        let mut scanner = Scanner::new(self, &code);
        scanner.run()?;
        tracing::trace!(
            template = source.name(),
            tokens = scanner.tokens.len(),
            "tokenized template"
        );
        Ok(TokenStream::new(scanner.tokens, source.clone()))
    }
}

struct Scanner<'a> {
    options: &'a LexerOptions,
    operators: &'a [String],
    code: &'a str,
    cursor: usize,
    /// Current line number (1-indexed)
    line: usize,
    tokens: Vec<Token>,
    state: State,
    states: Vec<State>,
    brackets: Vec<(String, usize)>,
    positions: Vec<TagStart>,
    position: usize,
    current_var_block_line: usize,
}

impl<'a> Scanner<'a> {
    fn new(lexer: &'a Lexer, code: &'a str) -> Self {
        Self {
            options: &lexer.options,
            operators: &lexer.operators,
            code,
            cursor: 0,
            line: 1,
            tokens: Vec::new(),
            state: State::Data,
            states: Vec::new(),
            brackets: Vec::new(),
            positions: Vec::new(),
            position: 0,
            current_var_block_line: 1,
        }
    }

    fn run(&mut self) -> LexResult<()> {
        self.positions = self.find_tag_starts();

        while self.cursor < self.code.len() {
            match self.state {
                State::Data => self.lex_data()?,
                State::Block => self.lex_block()?,
                State::Var => self.lex_var()?,
                State::String => self.lex_string()?,
                State::Interpolation => self.lex_interpolation()?,
            }
        }

        self.push(TokenKind::Eof, "");

        if let Some((bracket, line)) = self.brackets.pop() {
            return Err(SyntaxError::new(format!("Unclosed \"{bracket}\"."), line));
        }
        if matches!(self.state, State::Block | State::Var) {
            return Err(self.unclosed_tag());
        }

        Ok(())
    }

    #[inline]
    fn rest(&self) -> &'a str {
        self.code.get(self.cursor..).unwrap_or("")
    }

    /// Moves the cursor forward by `len` bytes, counting the newlines it skips.
    #[inline]
    fn move_cursor(&mut self, len: usize) {
        let end = self.cursor.saturating_add(len).min(self.code.len());
        let skipped = self.code.get(self.cursor..end).unwrap_or("");
        self.line = self.line.saturating_add(skipped.matches('\n').count());
        self.cursor = end;
    }

    fn push(&mut self, kind: TokenKind, value: &str) {
        if kind == TokenKind::Text && value.is_empty() {
            return;
        }
        self.tokens.push(Token::new(kind, value, self.line));
    }

    fn push_state(&mut self, state: State) {
        self.states.push(self.state);
        self.state = state;
    }

    fn pop_state(&mut self) -> LexResult<()> {
        self.state = self
            .states
            .pop()
            .ok_or_else(|| SyntaxError::new("Cannot pop state without a previous state.", self.line))?;
        Ok(())
    }

    fn unclosed_tag(&self) -> SyntaxError {
        let what = if self.state == State::Block {
            "block"
        } else {
            "variable"
        };
        SyntaxError::new(format!("Unclosed \"{what}\"."), self.current_var_block_line)
    }

    fn find_tag_starts(&self) -> Vec<TagStart> {
        let openers = [
            (self.options.tag_comment.0.as_str(), Delimiter::Comment),
            (self.options.tag_block.0.as_str(), Delimiter::Block),
            (self.options.tag_variable.0.as_str(), Delimiter::Variable),
        ];
        let mut starts = Vec::new();
        let mut pos = 0;
        while let Some(rest) = self.code.get(pos..) {
            let Some(c) = rest.chars().next() else {
                break;
            };
            let found = openers
                .iter()
                .filter(|(opener, _)| !opener.is_empty() && rest.starts_with(opener))
                .max_by_key(|(opener, _)| opener.len());
            match found {
                Some(&(opener, delimiter)) => {
                    let after = rest.get(opener.len()..).unwrap_or("");
                    let trim = self.trim_modifier(after);
                    let len = opener.len().saturating_add(trim.map_or(0, |_| 1));
                    starts.push(TagStart {
                        pos,
                        len,
                        delimiter,
                        trim,
                    });
                    pos = pos.saturating_add(len);
                }
                None => pos = pos.saturating_add(c.len_utf8()),
            }
        }
        starts
    }

    fn trim_modifier(&self, s: &str) -> Option<Trim> {
        let c = s.chars().next()?;
        if c == self.options.whitespace_trim {
            Some(Trim::All)
        } else if c == self.options.whitespace_line_trim {
            Some(Trim::Line)
        } else {
            None
        }
    }

    /// Matches a closing delimiter at the start of `s`, with or without a
    /// trim modifier, and returns its length plus whatever whitespace it
    /// swallows.
    fn match_close(&self, s: &str, close: &str, eat_newline: bool) -> Option<usize> {
        let swallow = |after: &str, set: &[char]| {
            let ws = after.len().saturating_sub(after.trim_start_matches(set).len());
            s.len().saturating_sub(after.len()).saturating_add(ws)
        };
        if let Some(after) = s
            .strip_prefix(self.options.whitespace_trim)
            .and_then(|r| r.strip_prefix(close))
        {
            return Some(swallow(after, WHITESPACE));
        }
        if let Some(after) = s
            .strip_prefix(self.options.whitespace_line_trim)
            .and_then(|r| r.strip_prefix(close))
        {
            return Some(swallow(after, WHITESPACE_LINE));
        }
        s.strip_prefix(close).map(|after| {
            let newline = usize::from(eat_newline && after.starts_with('\n'));
            s.len().saturating_sub(after.len()).saturating_add(newline)
        })
    }

    fn lex_data(&mut self) -> LexResult<()> {
        while self
            .positions
            .get(self.position)
            .is_some_and(|p| p.pos < self.cursor)
        {
            self.position = self.position.saturating_add(1);
        }

        let Some(start) = self.positions.get(self.position).copied() else {
            let rest = self.rest();
            self.push(TokenKind::Text, rest);
            self.move_cursor(rest.len());
            return Ok(());
        };
        self.position = self.position.saturating_add(1);

        let raw_text = self.code.get(self.cursor..start.pos).unwrap_or("");
        let text = match start.trim {
            Some(Trim::All) => raw_text.trim_end_matches(WHITESPACE),
            Some(Trim::Line) => raw_text.trim_end_matches(WHITESPACE_LINE),
            None => raw_text,
        };
        self.push(TokenKind::Text, text);
        self.move_cursor(raw_text.len().saturating_add(start.len));

        match start.delimiter {
            Delimiter::Comment => self.lex_comment(),
            Delimiter::Block => {
                if let Some((tag, len)) = self.match_verbatim_start() {
                    self.move_cursor(len);
                    self.lex_raw_data(tag)
                } else if let Some((line, len)) = self.match_line_directive() {
                    self.move_cursor(len);
                    self.line = line;
                    Ok(())
                } else {
                    self.push(TokenKind::BlockStart, "");
                    self.push_state(State::Block);
                    self.current_var_block_line = self.line;
                    Ok(())
                }
            }
            Delimiter::Variable => {
                self.push(TokenKind::VarStart, "");
                self.push_state(State::Var);
                self.current_var_block_line = self.line;
                Ok(())
            }
        }
    }

    fn lex_block(&mut self) -> LexResult<()> {
        if self.brackets.is_empty() {
            let rest = self.rest();
            let ws = leading_whitespace(rest);
            let close = self.options.tag_block.1.as_str();
            if let Some(len) = self.match_close(rest.get(ws..).unwrap_or(""), close, true) {
                self.push(TokenKind::BlockEnd, "");
                self.move_cursor(ws.saturating_add(len));
                return self.pop_state();
            }
        }
        self.lex_expression()
    }

    fn lex_var(&mut self) -> LexResult<()> {
        if self.brackets.is_empty() {
            let rest = self.rest();
            let ws = leading_whitespace(rest);
            let close = self.options.tag_variable.1.as_str();
            if let Some(len) = self.match_close(rest.get(ws..).unwrap_or(""), close, false) {
                self.push(TokenKind::VarEnd, "");
                self.move_cursor(ws.saturating_add(len));
                return self.pop_state();
            }
        }
        self.lex_expression()
    }

    fn lex_expression(&mut self) -> LexResult<()> {
        let ws = leading_whitespace(self.rest());
        if ws > 0 {
            self.move_cursor(ws);
            if self.cursor >= self.code.len() {
                return Err(self.unclosed_tag());
            }
        }

        let rest = self.rest();
        let Some(c) = rest.chars().next() else {
            return Err(self.unclosed_tag());
        };

        if rest.starts_with("...") {
            self.push(TokenKind::Spread, "...");
            self.move_cursor(3);
        } else if rest.starts_with("=>") {
            self.push(TokenKind::Arrow, "=>");
            self.move_cursor(2);
        } else if let Some((operator, len)) = self.match_operator(rest) {
            self.push(TokenKind::Operator, &operator);
            self.move_cursor(len);
        } else if let Some(len) = match_name(rest) {
            self.push(TokenKind::Name, rest.get(..len).unwrap_or(""));
            self.move_cursor(len);
        } else if let Some(len) = match_number(rest) {
            self.push(TokenKind::Number, rest.get(..len).unwrap_or(""));
            self.move_cursor(len);
        } else if PUNCTUATION.contains(c) {
            if "([{".contains(c) {
                self.brackets.push((c.to_string(), self.line));
            } else if ")]}".contains(c) {
                let Some((expect, line)) = self.brackets.pop() else {
                    return Err(SyntaxError::new(format!("Unexpected \"{c}\"."), self.line));
                };
                let closes = matches!((expect.as_str(), c), ("(", ')') | ("[", ']') | ("{", '}'));
                if !closes {
                    return Err(SyntaxError::new(format!("Unclosed \"{expect}\"."), line));
                }
            }
            self.push(TokenKind::Punctuation, &c.to_string());
            self.move_cursor(1);
        } else if c == '\'' {
            let Some(len) = quoted_len(rest, '\'', None) else {
                return Err(SyntaxError::new("Unclosed \"'\".", self.line));
            };
            let content = rest.get(1..len.saturating_sub(1)).unwrap_or("");
            self.push(TokenKind::String, &unescape(content));
            self.move_cursor(len);
        } else if c == '"' {
            let interpolation = self.options.interpolation.0.as_str();
            match quoted_len(rest, '"', Some(interpolation)) {
                Some(len) => {
                    let content = rest.get(1..len.saturating_sub(1)).unwrap_or("");
                    self.push(TokenKind::String, &unescape(content));
                    self.move_cursor(len);
                }
                None => {
                    self.brackets.push(("\"".to_owned(), self.line));
                    self.push_state(State::String);
                    self.move_cursor(1);
                }
            }
        } else {
            return Err(SyntaxError::new(
                format!("Unexpected character \"{c}\"."),
                self.line,
            ));
        }
        Ok(())
    }

    /// Longest registered operator at the start of `rest`, normalised so that
    /// multi-word operators use a single space.
    fn match_operator(&self, rest: &str) -> Option<(String, usize)> {
        let previous = self
            .code
            .get(..self.cursor)
            .and_then(|s| s.chars().next_back());
        self.operators.iter().find_map(|operator| {
            let len = match_words(rest, operator)?;
            let first = operator.chars().next()?;
            let last = operator.chars().next_back()?;
            if last.is_ascii_alphabetic() {
                let next = rest.get(len..).and_then(|s| s.chars().next())?;
                if !(WHITESPACE.contains(&next) || "()[{".contains(next)) {
                    return None;
                }
            }
            if first.is_ascii_alphabetic() && previous.is_some_and(|p| p == '.' || p == '|') {
                return None;
            }
            Some((operator.clone(), len))
        })
    }

    fn lex_string(&mut self) -> LexResult<()> {
        let rest = self.rest();
        let interpolation = self.options.interpolation.0.as_str();
        if rest.starts_with(interpolation) {
            self.brackets.push((interpolation.to_owned(), self.line));
            self.push(TokenKind::InterpolationStart, "");
            let after = rest.get(interpolation.len()..).unwrap_or("");
            self.move_cursor(interpolation.len().saturating_add(leading_whitespace(after)));
            self.push_state(State::Interpolation);
            return Ok(());
        }

        let part = dq_string_part(rest, interpolation);
        if part > 0 {
            self.push(TokenKind::String, &unescape(rest.get(..part).unwrap_or("")));
            self.move_cursor(part);
            return Ok(());
        }

        let Some((expect, line)) = self.brackets.pop() else {
            return Err(SyntaxError::new("Unexpected end of string.", self.line));
        };
        if !rest.starts_with('"') || expect != "\"" {
            return Err(SyntaxError::new(format!("Unclosed \"{expect}\"."), line));
        }
        self.pop_state()?;
        self.move_cursor(1);
        Ok(())
    }

    fn lex_interpolation(&mut self) -> LexResult<()> {
        let opener = self.options.interpolation.0.as_str();
        let closer = self.options.interpolation.1.as_str();
        if self.brackets.last().is_some_and(|(b, _)| b == opener) {
            let rest = self.rest();
            let ws = leading_whitespace(rest);
            if rest.get(ws..).is_some_and(|r| r.starts_with(closer)) {
                self.brackets.pop();
                self.push(TokenKind::InterpolationEnd, "");
                self.move_cursor(ws.saturating_add(closer.len()));
                return self.pop_state();
            }
        }
        self.lex_expression()
    }

    fn lex_comment(&mut self) -> LexResult<()> {
        let close = self.options.tag_comment.1.as_str();
        let Some(offset) = self.rest().find(close) else {
            return Err(SyntaxError::new("Unclosed comment.", self.line));
        };
        let mut at = self.cursor.saturating_add(offset);
        if offset > 0 {
            let before = self.code.get(..at).and_then(|s| s.chars().next_back());
            if let Some(c) = before.filter(|&c| {
                c == self.options.whitespace_trim || c == self.options.whitespace_line_trim
            }) {
                at = at.saturating_sub(c.len_utf8());
            }
        }
        let tail = self.code.get(at..).unwrap_or("");
        let len = self.match_close(tail, close, true).unwrap_or(close.len());
        self.move_cursor(at.saturating_sub(self.cursor).saturating_add(len));
        Ok(())
    }

    /// `{% verbatim %}` (or the older `{% raw %}`), returning the tag and the
    /// length up to and including the closing delimiter.
    fn match_verbatim_start(&self) -> Option<(&'static str, usize)> {
        let rest = self.rest();
        let ws = leading_whitespace(rest);
        let after_ws = rest.get(ws..)?;
        let tag = ["verbatim", "raw"]
            .into_iter()
            .find(|tag| after_ws.starts_with(tag))?;
        let after_tag = after_ws.get(tag.len()..)?;
        let ws2 = leading_whitespace(after_tag);
        let close = self.match_close(after_tag.get(ws2..)?, &self.options.tag_block.1, false)?;
        Some((tag, [ws, tag.len(), ws2, close].into_iter().fold(0, usize::saturating_add)))
    }

    /// `{% line 42 %}`, returning the new line number and the directive length.
    fn match_line_directive(&self) -> Option<(usize, usize)> {
        let rest = self.rest();
        let ws = leading_whitespace(rest);
        let after = rest.get(ws..)?.strip_prefix("line")?;
        let ws2 = leading_whitespace(after);
        if ws2 == 0 {
            return None;
        }
        let digits_start = after.get(ws2..)?;
        let digits = count_digits(digits_start);
        if digits == 0 {
            return None;
        }
        let line = digits_start.get(..digits)?.parse().ok()?;
        let after_digits = digits_start.get(digits..)?;
        let ws3 = leading_whitespace(after_digits);
        let close = &self.options.tag_block.1;
        after_digits.get(ws3..)?.starts_with(close.as_str()).then(|| {
            let len = rest
                .len()
                .saturating_sub(after_digits.len())
                .saturating_add(ws3)
                .saturating_add(close.len());
            (line, len)
        })
    }

    fn lex_raw_data(&mut self, tag: &str) -> LexResult<()> {
        let open = self.options.tag_block.0.as_str();
        let close = self.options.tag_block.1.as_str();
        let end_tag = format!("end{tag}");
        let mut search_from = self.cursor;

        loop {
            let Some(offset) = self.code.get(search_from..).and_then(|s| s.find(open)) else {
                return Err(SyntaxError::new(
                    format!("Unexpected end of file: Unclosed \"{tag}\" block."),
                    self.line,
                ));
            };
            let at = search_from.saturating_add(offset);
            let after_open = self.code.get(at.saturating_add(open.len())..).unwrap_or("");
            let trim = self.trim_modifier(after_open);
            let body = after_open.get(trim.map_or(0, |_| 1)..).unwrap_or("");
            let body_ws = leading_whitespace(body);
            let matched = body
                .get(body_ws..)
                .and_then(|b| b.strip_prefix(end_tag.as_str()))
                .and_then(|after_tag| {
                    let ws = leading_whitespace(after_tag);
                    let close_len = self.match_close(after_tag.get(ws..)?, close, false)?;
                    let end = self
                        .code
                        .len()
                        .saturating_sub(after_tag.len())
                        .saturating_add(ws)
                        .saturating_add(close_len);
                    Some(end)
                });

            if let Some(end) = matched {
                let raw_text = self.code.get(self.cursor..at).unwrap_or("");
                let text = match trim {
                    Some(Trim::All) => raw_text.trim_end_matches(WHITESPACE),
                    Some(Trim::Line) => raw_text.trim_end_matches(WHITESPACE_LINE),
                    None => raw_text,
                };
                self.push(TokenKind::Text, text);
                self.move_cursor(end.saturating_sub(self.cursor));
                return Ok(());
            }
            search_from = at.saturating_add(open.len());
        }
    }
}

fn leading_whitespace(s: &str) -> usize {
    s.len().saturating_sub(s.trim_start_matches(WHITESPACE).len())
}

/// Matches an operator made of space separated words, allowing any run of
/// whitespace between the words.
fn match_words(rest: &str, operator: &str) -> Option<usize> {
    let mut consumed = 0;
    for (i, word) in operator.split(' ').enumerate() {
        let remaining = rest.get(consumed..)?;
        if i > 0 {
            let ws = leading_whitespace(remaining);
            if ws == 0 {
                return None;
            }
            consumed = consumed.saturating_add(ws);
        }
        if !rest.get(consumed..)?.starts_with(word) {
            return None;
        }
        consumed = consumed.saturating_add(word.len());
    }
    Some(consumed)
}

const fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c as u32 >= 0x7f
}

const fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c as u32 >= 0x7f
}

fn match_name(rest: &str) -> Option<usize> {
    let first = rest.chars().next()?;
    if !is_name_start(first) {
        return None;
    }
    Some(rest.len().saturating_sub(rest.trim_start_matches(is_name_char).len()))
}

fn count_digits(s: &str) -> usize {
    s.len().saturating_sub(s.trim_start_matches(|c: char| c.is_ascii_digit()).len())
}

/// `[0-9]+(\.[0-9]+)?([Ee][+-][0-9]+)?`
fn match_number(rest: &str) -> Option<usize> {
    let mut len = count_digits(rest);
    if len == 0 {
        return None;
    }
    if let Some(fraction) = rest.get(len..).and_then(|r| r.strip_prefix('.')) {
        let digits = count_digits(fraction);
        if digits > 0 {
            len = len.saturating_add(1).saturating_add(digits);
        }
    }
    if let Some(exponent) = rest.get(len..).and_then(|r| r.strip_prefix(['e', 'E'])) {
        let (sign, digits) = match exponent.strip_prefix(['+', '-']) {
            Some(unsigned) => (1, count_digits(unsigned)),
            None => (0, count_digits(exponent)),
        };
        if digits > 0 {
            len = len.saturating_add(1).saturating_add(sign).saturating_add(digits);
        }
    }
    Some(len)
}

/// Length of a complete quoted string starting at `rest` (quotes included).
///
/// Returns `None` when the string never closes or, for double quoted
/// strings, when it contains an interpolation and must be lexed piecewise.
fn quoted_len(rest: &str, quote: char, interpolation: Option<&str>) -> Option<usize> {
    let mut chars = rest.char_indices().skip(1);
    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            chars.next();
        } else if c == quote {
            return Some(i.saturating_add(1));
        } else if interpolation.is_some_and(|open| rest.get(i..).is_some_and(|s| s.starts_with(open))) {
            return None;
        }
    }
    None
}

/// Length of the literal part of a double quoted string, up to the closing
/// quote or the next interpolation.
fn dq_string_part(rest: &str, interpolation: &str) -> usize {
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            chars.next();
        } else if c == '"' || rest.get(i..).is_some_and(|s| s.starts_with(interpolation)) {
            return i;
        }
    }
    rest.len()
}

/// C-style backslash unescaping of string literals.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('v') => out.push('\x0B'),
            Some('f') => out.push('\x0C'),
            Some('e') => out.push('\x1B'),
            Some('a') => out.push('\x07'),
            Some('b') => out.push('\x08'),
            Some('x') => {
                let mut value = 0u32;
                let mut digits: u32 = 0;
                while digits < 2 {
                    match chars.peek().and_then(|c| c.to_digit(16)) {
                        Some(d) => {
                            value = value.saturating_mul(16).saturating_add(d);
                            digits = digits.saturating_add(1);
                            chars.next();
                        }
                        None => break,
                    }
                }
                if digits == 0 {
                    out.push('x');
                } else {
                    out.extend(char::from_u32(value));
                }
            }
            Some(d @ '0'..='7') => {
                let mut value = d.to_digit(8).unwrap_or(0);
                let mut digits: u32 = 1;
                while digits < 3 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(d) => {
                            value = value.saturating_mul(8).saturating_add(d);
                            digits = digits.saturating_add(1);
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.extend(char::from_u32(value & 0xff));
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
