//! Storage for compiled programs.
//!
//! A program is cached as its JSON serialization under a key derived from
//! the template name and a fingerprint of everything that affects
//! compilation.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Hex SHA-256 of `parts`, each length-prefixed so that boundaries matter.
pub fn fingerprint<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub trait Cache: Send + Sync {
    fn generate_key(&self, name: &str, fingerprint: &str) -> String;

    /// The cached program, if any.
    fn load(&self, key: &str) -> Option<String>;

    /// # Errors
    ///
    /// When the program could not be stored.
    fn write(&self, key: &str, content: &str) -> Result<()>;

    /// When the entry was written, `None` if there is no entry.
    fn timestamp(&self, key: &str) -> Option<SystemTime>;
}

/// Lets several environments, or a caller that inspects it, share a cache.
impl<C: Cache + ?Sized> Cache for Arc<C> {
    fn generate_key(&self, name: &str, fingerprint: &str) -> String {
        (**self).generate_key(name, fingerprint)
    }

    fn load(&self, key: &str) -> Option<String> {
        (**self).load(key)
    }

    fn write(&self, key: &str, content: &str) -> Result<()> {
        (**self).write(key, content)
    }

    fn timestamp(&self, key: &str) -> Option<SystemTime> {
        (**self).timestamp(key)
    }
}

/// Caches nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCache;

impl Cache for NullCache {
    fn generate_key(&self, _name: &str, _fingerprint: &str) -> String {
        String::new()
    }

    fn load(&self, _key: &str) -> Option<String> {
        None
    }

    fn write(&self, _key: &str, _content: &str) -> Result<()> {
        Ok(())
    }

    fn timestamp(&self, _key: &str) -> Option<SystemTime> {
        None
    }
}

/// Keeps programs for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (String, SystemTime)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Cache for MemoryCache {
    fn generate_key(&self, name: &str, fingerprint: &str) -> String {
        format!("{name}:{fingerprint}")
    }

    fn load(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).map(|(content, _)| content.clone())
    }

    fn write(&self, key: &str, content: &str) -> Result<()> {
        self.entries
            .write()
            .insert(key.to_owned(), (content.to_owned(), SystemTime::now()));
        Ok(())
    }

    fn timestamp(&self, key: &str) -> Option<SystemTime> {
        self.entries.read().get(key).map(|(_, time)| *time)
    }
}

/// Writes programs under a directory, two hex characters of the key per
/// subdirectory.
///
/// Entries are written to a temporary file first and renamed into place,
/// so readers never see a partial program. Concurrent writers of the same
/// key race harmlessly: the last rename wins.
#[derive(Debug, Clone)]
pub struct FilesystemCache {
    directory: PathBuf,
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl FilesystemCache {
    pub fn new<P: Into<PathBuf>>(directory: P) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl Cache for FilesystemCache {
    fn generate_key(&self, name: &str, fingerprint: &str) -> String {
        let hash = self::fingerprint([name, fingerprint]);
        let prefix = hash.get(..2).unwrap_or_default();
        self.directory
            .join(prefix)
            .join(format!("{hash}.json"))
            .display()
            .to_string()
    }

    fn load(&self, key: &str) -> Option<String> {
        fs::read_to_string(key).ok()
    }

    fn write(&self, key: &str, content: &str) -> Result<()> {
        let path = Path::new(key);
        let dir = path.parent().unwrap_or(&self.directory);
        fs::create_dir_all(dir).map_err(|e| {
            Error::runtime(format!(
                "Unable to create the cache directory \"{}\": {e}.",
                dir.display()
            ))
        })?;

        let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp = dir.join(format!(".{}.{counter}.tmp", std::process::id()));
        let written = fs::File::create(&temp)
            .and_then(|mut file| file.write_all(content.as_bytes()))
            .and_then(|()| fs::rename(&temp, path));
        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(Error::runtime(format!(
                "Failed to write cache file \"{key}\": {e}."
            )));
        }
        Ok(())
    }

    fn timestamp(&self, key: &str) -> Option<SystemTime> {
        fs::metadata(key).and_then(|m| m.modified()).ok()
    }
}
