//! Per-directory cache of remote directory-entry metadata.
//!
//! One bulk listing round trip fills the entries for a directory; queries
//! are then served host-side until a mutating operation invalidates the
//! directory. Entries are addressed by name under their parent, not by any
//! persistent identity, so renaming or deleting a directory drops every
//! cached listing under the old subtree as well.

use std::collections::HashMap;
use std::sync::Arc;

use crate::attrs::{FileType, Metadata};

/// One filesystem object seen during a directory listing.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    name: String,
    meta: Metadata,
}

impl RemoteEntry {
    pub(crate) fn new(name: String, meta: Metadata) -> Self {
        Self { name, meta }
    }

    /// Name relative to the listed directory, unique within it.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// An empty [`FileType`] means the kind could not be determined (the
    /// entry's stat failed during the bulk listing).
    pub fn file_type(&self) -> FileType {
        self.meta.file_type()
    }

    pub fn metadata(&self) -> Metadata {
        self.meta
    }
}

#[derive(Default)]
pub(crate) struct DirCache {
    dirs: HashMap<String, Arc<Vec<RemoteEntry>>>,
}

impl DirCache {
    /// Cached listing for `dir`, if still valid.
    pub fn get(&self, dir: &str) -> Option<Arc<Vec<RemoteEntry>>> {
        self.dirs.get(dir).cloned()
    }

    pub fn insert(&mut self, dir: String, entries: Vec<RemoteEntry>) -> Arc<Vec<RemoteEntry>> {
        let entries = Arc::new(entries);
        let _ = self.dirs.insert(dir, entries.clone());
        entries
    }

    /// Drop the cached listing for one directory. The root is its own
    /// parent, so invalidating `/` terminates without recursing.
    pub fn invalidate(&mut self, dir: &str) {
        let _ = self.dirs.remove(dir);
    }

    /// Drop the listing for `path` and for everything cached beneath it.
    /// Needed when a directory is renamed or removed: names under the old
    /// prefix no longer address anything.
    pub fn invalidate_tree(&mut self, path: &str) {
        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        };
        self.dirs
            .retain(|dir, _| dir != path && !dir.starts_with(&prefix));
    }

    /// Forget everything. Used on reconnect; cached state from one device
    /// must never leak into a session with another.
    pub fn clear(&mut self) {
        self.dirs.clear();
    }
}
