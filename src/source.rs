use std::path::{Path, PathBuf};

/// One compilation unit: template code plus the name it was loaded under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Source {
    code: String,
    name: String,
    path: Option<PathBuf>,
}

impl Source {
    pub fn new<C: Into<String>, N: Into<String>>(code: C, name: N) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            path: None,
        }
    }

    #[must_use]
    pub fn with_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
