//! Where template source code comes from.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::trace;

use crate::error::{Error, LoaderError, Result};
use crate::source::Source;

/// Finds template source code by name.
pub trait Loader: Send + Sync {
    /// # Errors
    ///
    /// [`Error::Loader`] when the template does not exist or cannot be read.
    fn source(&self, name: &str) -> Result<Source>;

    fn exists(&self, name: &str) -> bool;

    /// Whether the template changed since `time`.
    ///
    /// # Errors
    ///
    /// [`Error::Loader`] when the template does not exist.
    fn is_fresh(&self, name: &str, time: SystemTime) -> Result<bool>;

    /// A key unique to the template's current content or location.
    ///
    /// # Errors
    ///
    /// [`Error::Loader`] when the template does not exist.
    fn cache_key(&self, name: &str) -> Result<String>;
}

/// Templates held in memory.
///
/// # Examples
///
/// ```rust
/// use twiglet::{ArrayLoader, Loader};
///
/// let mut loader = ArrayLoader::new([("index.html", "Hello")]);
/// loader.set_template("other.html", "World");
///
/// assert!(loader.exists("other.html"));
/// assert_eq!(loader.source("index.html").unwrap().code(), "Hello");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ArrayLoader {
    templates: IndexMap<String, String>,
}

impl ArrayLoader {
    pub fn new<I, N, C>(templates: I) -> Self
    where
        I: IntoIterator<Item = (N, C)>,
        N: Into<String>,
        C: Into<String>,
    {
        Self {
            templates: templates
                .into_iter()
                .map(|(name, code)| (name.into(), code.into()))
                .collect(),
        }
    }

    pub fn set_template<N: Into<String>, C: Into<String>>(&mut self, name: N, code: C) {
        self.templates.insert(name.into(), code.into());
    }

    fn code(&self, name: &str) -> Result<&str> {
        self.templates
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| LoaderError::not_defined(name).into())
    }
}

impl Loader for ArrayLoader {
    fn source(&self, name: &str) -> Result<Source> {
        Ok(Source::new(self.code(name)?, name))
    }

    fn exists(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    fn is_fresh(&self, name: &str, _time: SystemTime) -> Result<bool> {
        self.code(name).map(|_| true)
    }

    fn cache_key(&self, name: &str) -> Result<String> {
        Ok(format!("{name}:{}", self.code(name)?))
    }
}

/// Namespace used for names without an `@namespace/` prefix.
pub const MAIN_NAMESPACE: &str = "__main__";

/// Templates read from directories.
///
/// Names may start with `@namespace/` to search the paths registered for
/// that namespace. Names that climb out of the search paths through `..`
/// are rejected.
///
/// # Examples
///
/// ```rust,no_run
/// use twiglet::FilesystemLoader;
///
/// let mut loader = FilesystemLoader::new(["templates"]);
/// loader.add_path("vendor/admin/templates", "admin");
/// // "@admin/layout.html" now resolves under vendor/admin/templates.
/// ```
#[derive(Debug, Default)]
pub struct FilesystemLoader {
    paths: IndexMap<String, Vec<PathBuf>>,
    found: RwLock<HashMap<String, PathBuf>>,
}

impl FilesystemLoader {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut loader = Self::default();
        for path in paths {
            loader.add_path(path, MAIN_NAMESPACE);
        }
        loader
    }

    pub fn add_path<P: Into<PathBuf>>(&mut self, path: P, namespace: &str) {
        self.found.write().clear();
        self.paths.entry(namespace.to_owned()).or_default().push(path.into());
    }

    pub fn prepend_path<P: Into<PathBuf>>(&mut self, path: P, namespace: &str) {
        self.found.write().clear();
        self.paths
            .entry(namespace.to_owned())
            .or_default()
            .insert(0, path.into());
    }

    pub fn paths(&self, namespace: &str) -> &[PathBuf] {
        self.paths.get(namespace).map_or(&[], Vec::as_slice)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.paths.keys().map(String::as_str)
    }

    fn find(&self, name: &str) -> Result<PathBuf> {
        let name = normalize_name(name);
        if let Some(path) = self.found.read().get(&name) {
            return Ok(path.clone());
        }

        validate_name(&name)?;
        let (namespace, short_name) = parse_name(&name)?;
        let paths = self.paths.get(namespace).filter(|p| !p.is_empty()).ok_or_else(|| {
            Error::loader(format!(
                "There are no registered paths for namespace \"{namespace}\"."
            ))
        })?;

        for dir in paths {
            let candidate = dir.join(short_name);
            if candidate.is_file() {
                trace!(name = %name, path = %candidate.display(), "template found");
                self.found.write().insert(name, candidate.clone());
                return Ok(candidate);
            }
        }
        let looked: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        Err(Error::loader(format!(
            "Unable to find template \"{name}\" (looked into: {}).",
            looked.join(", ")
        )))
    }
}

fn normalize_name(name: &str) -> String {
    let mut normalized = name.replace('\\', "/");
    while normalized.contains("//") {
        normalized = normalized.replace("//", "/");
    }
    normalized
}

/// Rejects NUL bytes and names that climb above their search path.
fn validate_name(name: &str) -> Result<()> {
    if name.contains('\0') {
        return Err(Error::loader("A template name cannot contain NUL bytes."));
    }
    let mut level: i64 = 0;
    for part in name.trim_start_matches('/').split('/') {
        match part {
            ".." => level = level.saturating_sub(1),
            "." | "" => {}
            _ => level = level.saturating_add(1),
        }
        if level < 0 {
            return Err(Error::loader(format!(
                "Looks like you try to load a template outside configured directories ({name})."
            )));
        }
    }
    let escapes_root = Path::new(name)
        .components()
        .any(|c| matches!(c, Component::Prefix(_)));
    if escapes_root {
        return Err(Error::loader(format!(
            "Looks like you try to load a template outside configured directories ({name})."
        )));
    }
    Ok(())
}

fn parse_name(name: &str) -> Result<(&str, &str)> {
    let Some(rest) = name.strip_prefix('@') else {
        return Ok((MAIN_NAMESPACE, name.trim_start_matches('/')));
    };
    rest.split_once('/')
        .filter(|(_, short_name)| !short_name.is_empty())
        .ok_or_else(|| {
            Error::loader(format!(
                "Malformed namespaced template name \"{name}\" (expecting \"@namespace/template_name\")."
            ))
        })
}

impl Loader for FilesystemLoader {
    fn source(&self, name: &str) -> Result<Source> {
        let path = self.find(name)?;
        let code = fs::read_to_string(&path).map_err(|e| {
            Error::loader(format!(
                "Unable to read template \"{name}\" from \"{}\": {e}.",
                path.display()
            ))
        })?;
        Ok(Source::new(code, name).with_path(path))
    }

    fn exists(&self, name: &str) -> bool {
        self.find(name).is_ok()
    }

    fn is_fresh(&self, name: &str, time: SystemTime) -> Result<bool> {
        let path = self.find(name)?;
        let modified = fs::metadata(&path).and_then(|m| m.modified()).map_err(|e| {
            Error::loader(format!("Unable to stat \"{}\": {e}.", path.display()))
        })?;
        Ok(modified <= time)
    }

    fn cache_key(&self, name: &str) -> Result<String> {
        Ok(self.find(name)?.display().to_string())
    }
}

/// Asks each loader in turn.
#[derive(Default)]
pub struct ChainLoader {
    loaders: Vec<Box<dyn Loader>>,
}

impl ChainLoader {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_loader<L: Loader + 'static>(mut self, loader: L) -> Self {
        self.add_loader(loader);
        self
    }

    pub fn add_loader<L: Loader + 'static>(&mut self, loader: L) {
        self.loaders.push(Box::new(loader));
    }

    fn first(&self, name: &str) -> Result<&dyn Loader> {
        self.loaders
            .iter()
            .map(AsRef::as_ref)
            .find(|loader| loader.exists(name))
            .ok_or_else(|| self.not_found(name))
    }

    /// Collects every loader's reason, as the final message.
    fn not_found(&self, name: &str) -> Error {
        let reasons: Vec<String> = self
            .loaders
            .iter()
            .filter_map(|loader| {
                if let Err(Error::Loader(e)) = loader.source(name) {
                    Some(e.message().to_owned())
                } else {
                    None
                }
            })
            .collect();
        if reasons.is_empty() {
            return LoaderError::not_defined(name).into();
        }
        Error::loader(format!(
            "Template \"{name}\" is not defined ({}).",
            reasons.join(", ")
        ))
    }
}

impl Loader for ChainLoader {
    fn source(&self, name: &str) -> Result<Source> {
        self.first(name)?.source(name)
    }

    fn exists(&self, name: &str) -> bool {
        self.loaders.iter().any(|loader| loader.exists(name))
    }

    fn is_fresh(&self, name: &str, time: SystemTime) -> Result<bool> {
        self.first(name)?.is_fresh(name, time)
    }

    fn cache_key(&self, name: &str) -> Result<String> {
        self.first(name)?.cache_key(name)
    }
}
