//! Run permission.
//!
//! Relays poll a [`RunPermission`] every stopper delay and stop cooperatively
//! once it reports false. The supervisor owns the writable side.
//!
//! Two stores are provided:
//! - [`MarkerFile`]: permission is the presence of a file on disk, so it
//!   survives restarts and can be cleared from outside the process
//! - [`PermissionFlag`]: an in-memory flag for embedding and tests

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

/// Default marker file name, relative to the working directory.
pub const DEFAULT_MARKER_FILE: &str = "stop.no";

const MARKER_CONTENTS: &str = "This file indicates that the process is allowed to run.\n";

/// Poll-based permission to keep running.
pub trait RunPermission: Send + Sync {
    /// Whether the relay may keep running.
    fn is_allowed(&self) -> bool;
}

/// Permission backed by the presence of a marker file.
#[derive(Debug, Clone)]
pub struct MarkerFile {
    path: PathBuf,
}

impl MarkerFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Grant permission by writing the marker.
    pub fn allow(&self) -> io::Result<()> {
        fs::write(&self.path, MARKER_CONTENTS)?;
        debug!(path = %self.path.display(), "Run marker written");
        Ok(())
    }

    /// Revoke permission by removing the marker. A missing marker is fine.
    pub fn disallow(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Run marker removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl RunPermission for MarkerFile {
    fn is_allowed(&self) -> bool {
        self.path.exists()
    }
}

/// In-memory permission shared between clones.
#[derive(Debug, Clone)]
pub struct PermissionFlag {
    allowed: Arc<AtomicBool>,
}

impl PermissionFlag {
    pub fn new(allowed: bool) -> Self {
        Self {
            allowed: Arc::new(AtomicBool::new(allowed)),
        }
    }

    pub fn allow(&self) {
        self.allowed.store(true, Ordering::SeqCst);
    }

    pub fn revoke(&self) {
        self.allowed.store(false, Ordering::SeqCst);
    }
}

impl Default for PermissionFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl RunPermission for PermissionFlag {
    fn is_allowed(&self) -> bool {
        self.allowed.load(Ordering::SeqCst)
    }
}
