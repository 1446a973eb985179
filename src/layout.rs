//! Shared directory tree layout.
//!
//! ```text
//! <root>/<endpoint_id>/
//!     controls/<peer_id>   # signal file written by peer_id
//!     data                 # append-only outbox
//! ```
//!
//! All path construction goes through [`Layout`] so the tracker and the
//! endpoints agree on which segment is the channel id.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use crate::constants::{CONTROLS_DIR_NAME, DATA_FILE_NAME};

/// Path helpers for one shared root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The shared root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<id>`
    pub fn endpoint_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// `<root>/<id>/controls`
    pub fn controls_dir(&self, id: &str) -> PathBuf {
        self.endpoint_dir(id).join(CONTROLS_DIR_NAME)
    }

    /// `<root>/<id>/data`
    pub fn data_file(&self, id: &str) -> PathBuf {
        self.endpoint_dir(id).join(DATA_FILE_NAME)
    }

    /// `<root>/<owner>/controls/<writer>`: the file `writer` uses to
    /// signal `owner`.
    pub fn signal_file(&self, owner: &str, writer: &str) -> PathBuf {
        self.controls_dir(owner).join(writer)
    }

    /// The path segment immediately under the root.
    ///
    /// Returns `None` for paths outside the root or the root itself.
    pub fn channel_id(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        match relative.components().next()? {
            Component::Normal(segment) => Some(segment.to_string_lossy().into_owned()),
            _ => None,
        }
    }

    /// If `path` is `<root>/<id>/data`, returns `id`.
    pub fn data_owner(&self, path: &Path) -> Option<String> {
        let id = self.channel_id(path)?;
        (path == self.data_file(&id)).then_some(id)
    }

    /// If `path` is `<root>/<owner>/controls/<writer>`, returns `writer`.
    pub fn signal_writer(&self, owner: &str, path: &Path) -> Option<String> {
        if path.parent()? != self.controls_dir(owner) {
            return None;
        }
        Some(path.file_name()?.to_string_lossy().into_owned())
    }

    /// Creates the root directory (and parents) if missing.
    pub fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)
    }
}

/// Returns `true` if `id` can be used as a single path segment and as a
/// whitespace-delimited protocol token.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.chars().any(|c| c.is_whitespace() || std::path::is_separator(c))
}

/// Creates `path` as an empty file if it does not exist. Never truncates.
pub fn touch(path: &Path) -> io::Result<()> {
    OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}

/// Appends `bytes` to `path`, creating the file if needed.
pub fn append(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(bytes)?;
    file.flush()
}

/// Removes a file, treating "already gone" as success.
///
/// Other failures are logged and reported as `false`.
pub fn remove_file_quietly(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            log::warn!("Could not remove {}: {e}", path.display());
            false
        }
    }
}

/// Removes a directory tree, treating "already gone" as success.
pub fn remove_dir_quietly(path: &Path) -> bool {
    match fs::remove_dir_all(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            log::warn!("Could not remove {}: {e}", path.display());
            false
        }
    }
}
