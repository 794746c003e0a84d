use std::fmt;
use std::sync::Arc;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Where an error happened: the template name and source line, when known.
///
/// Both parts are filled lazily. The innermost frame that knows the location
/// sets it, outer frames leave an existing location alone unless error
/// rewriting is enabled on the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ErrorLocation {
    pub template: Option<String>,
    pub line: Option<usize>,
}

impl ErrorLocation {
    pub const fn at_line(line: usize) -> Self {
        Self {
            template: None,
            line: Some(line),
        }
    }

    fn fill(&mut self, template: &str, line: Option<usize>) {
        if self.template.is_none() {
            self.template = Some(template.to_owned());
        }
        if self.line.is_none() {
            self.line = line;
        }
    }

    fn overwrite(&mut self, template: &str, line: Option<usize>) {
        self.template = Some(template.to_owned());
        if line.is_some() {
            self.line = line;
        }
    }

    /// Appends ` in "name" at line N` to a message, keeping its final `.` or `?`
    /// at the very end.
    fn decorate(&self, f: &mut fmt::Formatter<'_>, message: &str) -> fmt::Result {
        let (body, tail) = if let Some((idx, c @ ('.' | '?'))) = message.char_indices().last() {
            (message.get(..idx).unwrap_or(message), Some(c))
        } else {
            (message, None)
        };
        f.write_str(body)?;
        if let Some(template) = &self.template {
            write!(f, " in \"{template}\"")?;
        }
        if let Some(line) = self.line {
            write!(f, " at line {line}")?;
        }
        if let Some(c) = tail {
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// Lexer and parser failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    message: String,
    suggestions: Vec<String>,
    location: ErrorLocation,
}

impl SyntaxError {
    pub fn new<M: Into<String>>(message: M, line: usize) -> Self {
        Self {
            message: message.into(),
            suggestions: Vec::new(),
            location: ErrorLocation::at_line(line),
        }
    }

    /// Adds "Did you mean ...?" alternatives for `name` picked from `candidates`.
    pub fn with_suggestions<'a, I>(mut self, name: &str, candidates: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.suggestions = suggest(name, candidates);
        if !self.suggestions.is_empty() {
            self.message = format!(
                "{} Did you mean \"{}\"?",
                self.message,
                self.suggestions.join("\", \"")
            );
        }
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    pub const fn location(&self) -> &ErrorLocation {
        &self.location
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.location.decorate(f, &self.message)
    }
}

impl std::error::Error for SyntaxError {}

/// The sandbox category that was violated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SecurityErrorKind {
    NotAllowedTag { tag: String },
    NotAllowedFilter { filter: String },
    NotAllowedFunction { function: String },
    NotAllowedMethod { class: String, method: String },
    NotAllowedProperty { class: String, property: String },
}

impl fmt::Display for SecurityErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAllowedTag { tag } => write!(f, "Tag \"{tag}\" is not allowed."),
            Self::NotAllowedFilter { filter } => write!(f, "Filter \"{filter}\" is not allowed."),
            Self::NotAllowedFunction { function } => {
                write!(f, "Function \"{function}\" is not allowed.")
            }
            Self::NotAllowedMethod { class, method } => write!(
                f,
                "Calling \"{method}\" method on a \"{class}\" object is not allowed."
            ),
            Self::NotAllowedProperty { class, property } => write!(
                f,
                "Calling \"{property}\" property on a \"{class}\" object is not allowed."
            ),
        }
    }
}

/// A sandbox policy violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityError {
    kind: SecurityErrorKind,
    location: ErrorLocation,
}

impl SecurityError {
    pub fn new(kind: SecurityErrorKind) -> Self {
        Self {
            kind,
            location: ErrorLocation::default(),
        }
    }

    pub const fn kind(&self) -> &SecurityErrorKind {
        &self.kind
    }

    pub const fn location(&self) -> &ErrorLocation {
        &self.location
    }

    pub(crate) fn at_line(mut self, line: usize) -> Self {
        self.location.line = Some(line);
        self
    }
}

impl fmt::Display for SecurityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.location.decorate(f, &self.kind.to_string())
    }
}

impl std::error::Error for SecurityError {}

/// Failures raised while rendering.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    message: String,
    location: ErrorLocation,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl RuntimeError {
    pub fn new<M: Into<String>>(message: M) -> Self {
        Self {
            message: message.into(),
            location: ErrorLocation::default(),
            source: None,
        }
    }

    /// Wraps an error raised by a host callable.
    pub fn with_source<M, E>(message: M, source: E) -> Self
    where
        M: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            location: ErrorLocation::default(),
            source: Some(Arc::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn location(&self) -> &ErrorLocation {
        &self.location
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.location.decorate(f, &self.message)
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// A template could not be found or read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderError {
    message: String,
    location: ErrorLocation,
}

impl LoaderError {
    pub fn new<M: Into<String>>(message: M) -> Self {
        Self {
            message: message.into(),
            location: ErrorLocation::default(),
        }
    }

    pub fn not_defined(name: &str) -> Self {
        Self::new(format!("Template \"{name}\" is not defined."))
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn location(&self) -> &ErrorLocation {
        &self.location
    }
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.location.decorate(f, &self.message)
    }
}

impl std::error::Error for LoaderError {}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Loader(#[from] LoaderError),
    /// API misuse, such as registering an extension after the registry froze.
    #[error("{message}")]
    Logic { message: String },
}

impl Error {
    pub fn syntax<M: Into<String>>(message: M, line: usize) -> Self {
        Self::Syntax(SyntaxError::new(message, line))
    }

    pub fn runtime<M: Into<String>>(message: M) -> Self {
        Self::Runtime(RuntimeError::new(message))
    }

    pub fn loader<M: Into<String>>(message: M) -> Self {
        Self::Loader(LoaderError::new(message))
    }

    pub fn logic<M: Into<String>>(message: M) -> Self {
        Self::Logic {
            message: message.into(),
        }
    }

    pub const fn location(&self) -> Option<&ErrorLocation> {
        match self {
            Self::Syntax(e) => Some(&e.location),
            Self::Security(e) => Some(&e.location),
            Self::Runtime(e) => Some(&e.location),
            Self::Loader(e) => Some(&e.location),
            Self::Logic { .. } => None,
        }
    }

    const fn location_mut(&mut self) -> Option<&mut ErrorLocation> {
        match self {
            Self::Syntax(e) => Some(&mut e.location),
            Self::Security(e) => Some(&mut e.location),
            Self::Runtime(e) => Some(&mut e.location),
            Self::Loader(e) => Some(&mut e.location),
            Self::Logic { .. } => None,
        }
    }

    pub fn template_name(&self) -> Option<&str> {
        self.location().and_then(|l| l.template.as_deref())
    }

    pub fn line(&self) -> Option<usize> {
        self.location().and_then(|l| l.line)
    }

    /// Fills in the template name and line when they are not known yet.
    pub(crate) fn locate(mut self, template: &str, line: Option<usize>) -> Self {
        if let Some(location) = self.location_mut() {
            location.fill(template, line);
        }
        self
    }

    /// Re-attributes the error to an enclosing frame.
    pub(crate) fn relocate(mut self, template: &str, line: Option<usize>) -> Self {
        if let Some(location) = self.location_mut() {
            location.overwrite(template, line);
        }
        self
    }
}

/// Picks the names from `candidates` that are close enough to `name` to be
/// offered as alternatives, closest first.
///
/// A candidate qualifies when it contains `name`, or when its optimal string
/// alignment distance is at most a third of the name's length (and never less
/// than one edit, so swapped letters in short names still match).
pub fn suggest<'a, I>(name: &str, candidates: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let threshold = (name.chars().count() / 3).max(1);
    let mut found: Vec<(usize, &str)> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let distance = strsim::osa_distance(name, candidate);
            (distance <= threshold || (!name.is_empty() && candidate.contains(name)))
                .then_some((distance, candidate))
        })
        .collect();
    found.sort_unstable();
    found.dedup();
    found.into_iter().map(|(_, c)| c.to_owned()).collect()
}
