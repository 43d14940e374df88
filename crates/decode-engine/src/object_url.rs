//! Temporary object handles.
//!
//! When a source's audio is extracted for playback, the worker writes it to a
//! temporary file and hands the coordinator an [`ObjectHandle`]. Handles are
//! tracked per source and must be revoked when the source is torn down.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

/// A temporary file visible outside the worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    path: PathBuf,
}

impl ObjectHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// A fresh path under the system temp dir for `source_id`.
    pub fn temp_for(source_id: &str, extension: &str) -> Self {
        let safe: String = source_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let name = format!("cutline-{}-{safe}-{nanos}.{extension}", std::process::id());
        Self::new(std::env::temp_dir().join(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn url(&self) -> String {
        format!("file://{}", self.path.display())
    }

    /// Delete the underlying file.
    pub fn revoke(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Revoked object handle"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to revoke object handle"),
        }
    }
}

/// Table of live handles, keyed by source.
#[derive(Debug, Default)]
pub struct ObjectHandleRegistry {
    handles: HashMap<String, Vec<ObjectHandle>>,
}

impl ObjectHandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source_id: &str, handle: ObjectHandle) {
        self.handles
            .entry(source_id.to_string())
            .or_default()
            .push(handle);
    }

    pub fn handles(&self, source_id: &str) -> &[ObjectHandle] {
        self.handles
            .get(source_id)
            .map(|handles| handles.as_slice())
            .unwrap_or(&[])
    }

    /// Revoke every handle for `source_id`. Returns how many were revoked.
    pub fn revoke(&mut self, source_id: &str) -> usize {
        let handles = self.handles.remove(source_id).unwrap_or_default();
        for handle in &handles {
            handle.revoke();
        }
        handles.len()
    }

    pub fn revoke_all(&mut self) -> usize {
        let mut count = 0;
        for (_, handles) in self.handles.drain() {
            for handle in &handles {
                handle.revoke();
            }
            count += handles.len();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.handles.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ObjectHandleRegistry {
    fn drop(&mut self) {
        self.revoke_all();
    }
}
