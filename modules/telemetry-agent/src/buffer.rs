//! Durable outage buffer.
//!
//! One pretty-printed `{"messages": [...]}` file per outage episode, named
//! `<started_at>.json` inside the buffer directory. Writes are full rewrites
//! (load, append, save) and assume a single writing process.

use crate::error::BufferError;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use telemetry_types::BufferDocument;

const BUFFER_EXT: &str = "json";

/// Stable identifier for an outage episode: its first-failure timestamp.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct EpisodeKey(pub f64);

impl EpisodeKey {
    /// File stem form. `f64` display is the shortest round-trip decimal,
    /// so the same key always renders to the same name.
    pub fn render(&self) -> String {
        self.0.to_string()
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", self.render(), BUFFER_EXT)
    }

    fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".json")?;
        let value: f64 = stem.parse().ok()?;
        (value.is_finite() && value.to_string() == stem).then_some(Self(value))
    }
}

impl std::fmt::Display for EpisodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

pub struct OutageBuffer {
    dir: PathBuf,
}

impl OutageBuffer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, key: EpisodeKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    pub fn exists(&self, key: EpisodeKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Load the messages buffered for an episode. A key that was never
    /// written loads as an empty list.
    pub fn load(&self, key: EpisodeKey) -> Result<Vec<String>, BufferError> {
        let path = self.path_for(key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BufferError::Io(e)),
        };
        let doc: BufferDocument =
            serde_json::from_str(&raw).map_err(|e| BufferError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(doc.messages)
    }

    /// Like [`load`](Self::load), but a corrupt or unreadable file becomes an
    /// empty list after logging the data loss.
    pub fn load_or_empty(&self, key: EpisodeKey) -> Vec<String> {
        match self.load(key) {
            Ok(messages) => messages,
            Err(e) => {
                log::error!(
                    target: "errors",
                    "[BUFFER] Data has been lost: {}. Starting with empty data.",
                    e
                );
                Vec::new()
            }
        }
    }

    /// Rewrite the episode file with the full message list.
    pub fn save(&self, key: EpisodeKey, messages: &[String]) -> Result<(), BufferError> {
        fs::create_dir_all(&self.dir)?;
        let doc = BufferDocument {
            messages: messages.to_vec(),
        };
        let body = serde_json::to_string_pretty(&doc)?;
        fs::write(self.path_for(key), body)?;
        log::info!(
            "[BUFFER] Network outage file written for episode {} ({} messages)",
            key,
            messages.len()
        );
        Ok(())
    }

    /// Load, append one message, rewrite. Returns the new message count.
    pub fn append(&self, key: EpisodeKey, message: String) -> Result<usize, BufferError> {
        let mut messages = self.load_or_empty(key);
        messages.push(message);
        self.save(key, &messages)?;
        Ok(messages.len())
    }

    /// Remove an episode file. Deleting an absent file is not an error.
    pub fn delete(&self, key: EpisodeKey) -> Result<(), BufferError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BufferError::Io(e)),
        }
    }

    /// Episode files present on disk, oldest first. A `<number>.json` file
    /// that does not hold a buffer document belongs to someone else and is
    /// never returned.
    pub fn leftover_keys(&self) -> Result<Vec<EpisodeKey>, BufferError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BufferError::Io(e)),
        };

        let mut keys: Vec<EpisodeKey> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(EpisodeKey::from_file_name)
            })
            .filter(|key| match self.load(*key) {
                Ok(_) => true,
                Err(e) => {
                    log::warn!(
                        "[BUFFER] Ignoring {}, not an outage file: {}",
                        self.path_for(*key).display(),
                        e
                    );
                    false
                }
            })
            .collect();
        keys.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(keys)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
