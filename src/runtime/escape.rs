//! Escaping strategies.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::value::Value;

/// A custom escaping strategy: receives the string and the charset.
pub type EscaperFn = Arc<dyn Fn(&str, &str) -> Result<String> + Send + Sync>;

pub const BUILTIN_STRATEGIES: [&str; 5] = ["html", "js", "url", "css", "html_attr"];

/// Characters `html_attr` writes as named entities.
static HTML_ATTR_ENTITIES: Lazy<HashMap<char, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ('"', "&quot;"),
        ('&', "&amp;"),
        ('<', "&lt;"),
        ('>', "&gt;"),
    ])
});

/// Escapes `value` with `strategy`.
///
/// With `autoescape` set, markup passes through unchanged. Values that are not
/// strings and have no string form are returned as they are for the builtin
/// strategies.
///
/// # Errors
///
/// Unknown strategies, charsets other than UTF-8, and failures raised by
/// custom escapers.
pub fn escape(
    env: &Environment,
    value: &Value,
    strategy: &str,
    charset: Option<&str>,
    autoescape: bool,
) -> Result<Value> {
    if autoescape && value.is_markup() {
        return Ok(value.clone());
    }
    let display = if let Value::Object(o) = value { o.to_display() } else { None };
    let text = if let Value::String(s) | Value::Markup(s) = value {
        s.to_string()
    } else if let Some(text) = display {
        text
    } else if BUILTIN_STRATEGIES.contains(&strategy) {
        return Ok(value.clone());
    } else {
        value.to_string()
    };
    if text.is_empty() {
        return Ok(Value::from(""));
    }
    let charset = charset.unwrap_or(env.options().charset.as_str());
    if !is_utf8(charset) {
        return Err(Error::runtime(format!(
            "Unsupported charset \"{charset}\": templates are always UTF-8."
        )));
    }

    let escaped = match strategy {
        "html" => escape_html(&text),
        "js" => escape_js(&text),
        "css" => escape_css(&text),
        "html_attr" => escape_html_attr(&text),
        "url" => escape_url(&text),
        custom => match env.escaper(custom) {
            Some(escaper) => escaper(&text, charset)?,
            None => {
                let valid: Vec<&str> = BUILTIN_STRATEGIES
                    .iter()
                    .copied()
                    .chain(env.escaper_names())
                    .collect();
                return Err(Error::runtime(format!(
                    "Invalid escaping strategy \"{custom}\" (valid ones: {}).",
                    valid.join(", ")
                )));
            }
        },
    };
    Ok(Value::from(escaped))
}

fn is_utf8(charset: &str) -> bool {
    charset.eq_ignore_ascii_case("utf-8") || charset.eq_ignore_ascii_case("utf8")
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len().saturating_add(text.len() / 8));
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Everything outside `[a-zA-Z0-9,._]` becomes a JavaScript escape.
pub fn escape_js(text: &str) -> String {
    let mut out = String::with_capacity(text.len().saturating_mul(2));
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, ',' | '.' | '_') {
            out.push(c);
            continue;
        }
        match c {
            '\\' => out.push_str("\\\\"),
            '/' => out.push_str("\\/"),
            '\x08' => out.push_str("\\b"),
            '\x0C' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{unit:04X}");
                }
            }
        }
    }
    out
}

/// Everything outside `[a-zA-Z0-9]` becomes `\HEX `.
pub fn escape_css(text: &str) -> String {
    let mut out = String::with_capacity(text.len().saturating_mul(2));
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else {
            let _ = write!(out, "\\{:X} ", u32::from(c));
        }
    }
    out
}

/// Everything outside `[a-zA-Z0-9,.\-_]` becomes an entity; control
/// characters become the replacement character.
pub fn escape_html_attr(text: &str) -> String {
    let mut out = String::with_capacity(text.len().saturating_mul(2));
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, ',' | '.' | '-' | '_') {
            out.push(c);
            continue;
        }
        let code = u32::from(c);
        let undefined = (code <= 0x1f && !matches!(c, '\t' | '\n' | '\r')) || (0x7f..=0x9f).contains(&code);
        if undefined {
            out.push_str("&#xFFFD;");
        } else if let Some(entity) = HTML_ATTR_ENTITIES.get(&c) {
            out.push_str(entity);
        } else if code < 0x100 {
            let _ = write!(out, "&#x{code:02X};");
        } else {
            let _ = write!(out, "&#x{code:04X};");
        }
    }
    out
}

/// Percent-encodes every byte outside the unreserved URL set.
pub fn escape_url(text: &str) -> String {
    urlencoding::encode(text).into_owned()
}
