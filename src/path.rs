//! A path value addressing either the host filesystem or a connected
//! board, with one query and mutation surface over both.
//!
//! Values are immutable: deriving (join, parent, resolve) returns a new
//! path, and mutating operations change the backing store, never the value.
//! Remote queries are served from the board's attribute cache where a valid
//! listing generation exists; remote mutations go straight to the bridge
//! and invalidate the affected directories.

use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use glob::Pattern;

use crate::attrs::Metadata;
use crate::board::Board;
use crate::error::{Error, RemoteErrorKind, Result};

/// Which filesystem a path addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FsKind {
    Local,
    Remote,
}

/// A local or remote filesystem location.
///
/// Two paths are the same path iff their normalized text and [`FsKind`]
/// match; the board handle takes no part in comparisons.
#[derive(Clone)]
pub struct VirtualPath {
    repr: String,
    kind: FsKind,
    board: Option<Board>,
}

impl VirtualPath {
    pub fn local(path: impl AsRef<Path>) -> Self {
        Self {
            repr: normalize(&path.as_ref().to_string_lossy()),
            kind: FsKind::Local,
            board: None,
        }
    }

    pub fn remote(board: &Board, path: &str) -> Self {
        Self {
            repr: normalize(path),
            kind: FsKind::Remote,
            board: Some(board.clone()),
        }
    }

    /// Parse user-supplied text: a leading `:` selects the remote
    /// filesystem (requires a board), anything else is local.
    pub fn parse(text: &str, board: Option<&Board>) -> Result<Self> {
        match text.strip_prefix(':') {
            Some(remote) => {
                let board = board.ok_or(Error::NotConnected)?;
                Ok(Self::remote(board, remote))
            }
            None => Ok(Self::local(text)),
        }
    }

    pub fn kind(&self) -> FsKind {
        self.kind
    }

    pub fn is_remote(&self) -> bool {
        self.kind == FsKind::Remote
    }

    pub fn as_str(&self) -> &str {
        &self.repr
    }

    pub fn board(&self) -> Option<&Board> {
        self.board.as_ref()
    }

    /// Final path component. The root's name is `/`.
    pub fn name(&self) -> &str {
        file_name(&self.repr)
    }

    pub fn is_absolute(&self) -> bool {
        self.repr.starts_with('/')
    }

    /// Append a (possibly multi-segment) component, inheriting this path's
    /// filesystem kind. Joining an absolute component replaces the path.
    pub fn join(&self, child: &str) -> Self {
        let repr = if child.starts_with('/') {
            normalize(child)
        } else if self.repr == "/" {
            normalize(&format!("/{child}"))
        } else {
            normalize(&format!("{}/{child}", self.repr))
        };
        Self {
            repr,
            kind: self.kind,
            board: self.board.clone(),
        }
    }

    pub fn parent(&self) -> Self {
        Self {
            repr: parent_of(&self.repr).to_string(),
            kind: self.kind,
            board: self.board.clone(),
        }
    }

    /// Absolute lexically-folded form: `.` and `..` are eliminated against
    /// the device (or host) working directory. Neither filesystem here has
    /// symlink-aware resolution to worry about remotely.
    pub fn resolve(&self) -> Result<Self> {
        let repr = match self.kind {
            FsKind::Remote => self.abs()?,
            FsKind::Local => {
                if self.is_absolute() {
                    fold_dots(&self.repr)
                } else {
                    let cwd = std::env::current_dir().map_err(Error::from)?;
                    fold_dots(&normalize(&format!(
                        "{}/{}",
                        cwd.to_string_lossy(),
                        self.repr
                    )))
                }
            }
        };
        Ok(Self {
            repr,
            kind: self.kind,
            board: self.board.clone(),
        })
    }

    pub fn samefile(&self, other: &Self) -> Result<bool> {
        Ok(self.kind == other.kind && self.resolve()?.repr == other.resolve()?.repr)
    }

    // --- queries ---

    pub fn metadata(&self) -> Result<Metadata> {
        match self.kind {
            FsKind::Local => fs::metadata(self.local_path())
                .map(|m| Metadata::from(&m))
                .map_err(|e| self.io_err(e)),
            FsKind::Remote => {
                let abs = self.abs()?;
                match self.require_board()?.lookup(&abs)? {
                    None => Err(Error::remote(RemoteErrorKind::NotFound, "stat").at(&abs)),
                    // The bulk listing could not stat this entry; ask again
                    // directly before giving up on its kind.
                    Some(entry) if entry.file_type().is_empty() => {
                        match self.require_board()?.fs_stat(&abs) {
                            Ok(meta) => Ok(meta),
                            Err(Error::Remote { .. }) => Ok(entry.metadata()),
                            Err(e) => Err(e),
                        }
                    }
                    Some(entry) => Ok(entry.metadata()),
                }
            }
        }
    }

    pub fn exists(&self) -> Result<bool> {
        match self.kind {
            FsKind::Local => Ok(self.local_path().exists()),
            FsKind::Remote => {
                let abs = self.abs()?;
                Ok(self.require_board()?.lookup(&abs)?.is_some())
            }
        }
    }

    pub fn is_dir(&self) -> Result<bool> {
        match self.metadata() {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn is_file(&self) -> Result<bool> {
        match self.metadata() {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Children of this directory, lexically ordered. Remote entries whose
    /// stat failed during the bulk listing are still returned; their kind
    /// reads as unknown rather than aborting the iteration.
    pub fn iterdir(&self) -> Result<Vec<VirtualPath>> {
        match self.kind {
            FsKind::Local => {
                let mut names = Vec::new();
                for entry in fs::read_dir(self.local_path()).map_err(|e| self.io_err(e))? {
                    let entry = entry.map_err(|e| self.io_err(e))?;
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                names.sort();
                Ok(names.iter().map(|n| self.join(n)).collect())
            }
            FsKind::Remote => {
                let abs = self.abs()?;
                let entries = self.require_board()?.listing(&abs)?;
                Ok(entries.iter().map(|e| self.join(e.name())).collect())
            }
        }
    }

    /// Lazily walk this directory for entries matching a relative glob
    /// pattern (`*`, `?`, `[..]` per component, `**` for any depth). Each
    /// call starts a fresh walk; the iterator shares no state with other
    /// calls. Results come out in lexical depth-first order.
    pub fn glob(&self, pattern: &str) -> Result<GlobIter> {
        let segments = compile_pattern(pattern)?;
        Ok(GlobIter {
            segments: segments.into(),
            stack: vec![(self.clone(), 0)],
        })
    }

    /// [`glob`](Self::glob) at every depth below this directory.
    pub fn rglob(&self, pattern: &str) -> Result<GlobIter> {
        self.glob(&format!("**/{pattern}"))
    }

    // --- mutations ---

    /// Create the file if missing, refresh its mtime if present.
    pub fn touch(&self) -> Result<()> {
        match self.kind {
            FsKind::Local => {
                let file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.local_path())
                    .map_err(|e| self.io_err(e))?;
                file.set_modified(SystemTime::now())
                    .map_err(|e| self.io_err(e))
            }
            FsKind::Remote => self.require_board()?.fs_touch(&self.abs()?),
        }
    }

    /// Create this directory. With `parents`, missing ancestors are created
    /// and an existing final directory is accepted; without it, an existing
    /// path fails with the already-exists class unless `exist_ok`.
    pub fn mkdir(&self, parents: bool, exist_ok: bool) -> Result<()> {
        let exist_ok = exist_ok || parents;
        match self.kind {
            FsKind::Local => {
                let result = if parents {
                    fs::create_dir_all(self.local_path())
                } else {
                    fs::create_dir(self.local_path())
                };
                match result {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists && exist_ok => {
                        if self.is_dir()? {
                            Ok(())
                        } else {
                            Err(self.io_err(e))
                        }
                    }
                    Err(e) => Err(self.io_err(e)),
                }
            }
            FsKind::Remote => {
                let board = self.require_board()?.clone();
                let abs = self.abs()?;
                if parents {
                    for ancestor in ancestors_of(&abs) {
                        let dir = Self {
                            repr: ancestor.to_string(),
                            kind: FsKind::Remote,
                            board: Some(board.clone()),
                        };
                        if !dir.exists()? {
                            board.fs_mkdir(ancestor)?;
                        }
                    }
                }
                match board.fs_mkdir(&abs) {
                    Ok(()) => Ok(()),
                    Err(e)
                        if e.remote_kind() == Some(RemoteErrorKind::AlreadyExists)
                            && exist_ok
                            && self.is_dir()? =>
                    {
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Delete a regular file.
    pub fn unlink(&self) -> Result<()> {
        match self.kind {
            FsKind::Local => fs::remove_file(self.local_path()).map_err(|e| self.io_err(e)),
            FsKind::Remote => self.require_board()?.fs_remove(&self.abs()?),
        }
    }

    /// Delete an empty directory.
    pub fn rmdir(&self) -> Result<()> {
        match self.kind {
            FsKind::Local => fs::remove_dir(self.local_path()).map_err(|e| self.io_err(e)),
            FsKind::Remote => self.require_board()?.fs_rmdir(&self.abs()?),
        }
    }

    /// Rename within one filesystem. Crossing filesystems is not a rename;
    /// use the operation engine's copy/move for that.
    pub fn rename(&self, to: &VirtualPath) -> Result<()> {
        if self.kind != to.kind {
            return Err(Error::Unsupported("rename across filesystems"));
        }
        match self.kind {
            FsKind::Local => {
                fs::rename(self.local_path(), to.local_path()).map_err(|e| self.io_err(e))
            }
            FsKind::Remote => self.require_board()?.fs_rename(&self.abs()?, &to.abs()?),
        }
    }

    pub fn read_bytes(&self) -> Result<Bytes> {
        match self.kind {
            FsKind::Local => fs::read(self.local_path())
                .map(Bytes::from)
                .map_err(|e| self.io_err(e)),
            FsKind::Remote => self.require_board()?.fs_readfile(&self.abs()?),
        }
    }

    pub fn write_bytes(&self, data: &[u8]) -> Result<()> {
        match self.kind {
            FsKind::Local => fs::write(self.local_path(), data).map_err(|e| self.io_err(e)),
            FsKind::Remote => self.require_board()?.fs_writefile(&self.abs()?, data),
        }
    }

    /// Read as UTF-8 text with line endings normalized to `\n`. Bytes in
    /// transit are untouched; the convention applies on decode only.
    pub fn read_text(&self) -> Result<String> {
        let bytes = self.read_bytes()?;
        let text = String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Io(format!("'{}' is not valid utf-8", self.repr)))?;
        Ok(text.replace("\r\n", "\n"))
    }

    /// Write text, applying the host line-ending convention on encode.
    pub fn write_text(&self, text: &str) -> Result<()> {
        if cfg!(windows) && self.kind == FsKind::Local {
            self.write_bytes(text.replace('\n', "\r\n").as_bytes())
        } else {
            self.write_bytes(text.as_bytes())
        }
    }

    /// Read a symbolic link target. The remote filesystem has no links.
    pub fn readlink(&self) -> Result<VirtualPath> {
        match self.kind {
            FsKind::Local => fs::read_link(self.local_path())
                .map(VirtualPath::local)
                .map_err(|e| self.io_err(e)),
            FsKind::Remote => Err(Error::Unsupported("readlink")),
        }
    }

    /// Change permission bits. The remote filesystem has no permission
    /// model.
    #[cfg(unix)]
    pub fn chmod(&self, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        match self.kind {
            FsKind::Local => {
                fs::set_permissions(self.local_path(), fs::Permissions::from_mode(mode))
                    .map_err(|e| self.io_err(e))
            }
            FsKind::Remote => Err(Error::Unsupported("chmod")),
        }
    }

    // --- internals ---

    fn local_path(&self) -> PathBuf {
        PathBuf::from(&self.repr)
    }

    fn require_board(&self) -> Result<&Board> {
        self.board.as_ref().ok_or(Error::NotConnected)
    }

    /// Absolute dot-free form of a remote path, resolved against the
    /// device working directory tracked by the board.
    fn abs(&self) -> Result<String> {
        if self.is_absolute() {
            return Ok(fold_dots(&self.repr));
        }
        let cwd = self.require_board()?.cwd();
        Ok(fold_dots(&normalize(&format!("{cwd}/{}", self.repr))))
    }

    fn io_err(&self, err: io::Error) -> Error {
        Error::from(err).at(&self.repr)
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr)
    }
}

impl fmt::Debug for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualPath")
            .field("repr", &self.repr)
            .field("kind", &self.kind)
            .finish()
    }
}

impl PartialEq for VirtualPath {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.repr == other.repr
    }
}

impl Eq for VirtualPath {}

impl Hash for VirtualPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.repr.hash(state);
    }
}

impl PartialOrd for VirtualPath {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VirtualPath {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.kind, &self.repr).cmp(&(other.kind, &other.repr))
    }
}

/// True if `text` contains filename wildcard characters.
pub fn is_wildcard(text: &str) -> bool {
    text.contains(['*', '?', '['])
}

/// Lazy, restartable matcher produced by [`VirtualPath::glob`].
pub struct GlobIter {
    segments: Arc<[Segment]>,
    /// Work stack of (candidate, next segment index); pushed in reverse
    /// lexical order so iteration pops lexically.
    stack: Vec<(VirtualPath, usize)>,
}

enum Segment {
    Literal(String),
    Match(Pattern),
    /// `**`: this directory and everything below it.
    Any,
}

fn compile_pattern(pattern: &str) -> Result<Vec<Segment>> {
    if pattern.is_empty() {
        return Err(Error::Pattern("empty pattern".into()));
    }
    if pattern.starts_with('/') {
        return Err(Error::Pattern("pattern must be relative".into()));
    }
    pattern
        .split('/')
        .map(|part| match part {
            "" => Err(Error::Pattern(format!("empty component in '{pattern}'"))),
            "**" => Ok(Segment::Any),
            part if is_wildcard(part) => Ok(Segment::Match(Pattern::new(part)?)),
            part => Ok(Segment::Literal(part.to_string())),
        })
        .collect()
}

impl Iterator for GlobIter {
    type Item = Result<VirtualPath>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((path, idx)) = self.stack.pop() {
            let Some(segment) = self.segments.get(idx) else {
                return Some(Ok(path));
            };
            match segment {
                Segment::Literal(name) => {
                    let child = path.join(name);
                    match child.exists() {
                        Ok(true) => self.stack.push((child, idx + 1)),
                        Ok(false) => {}
                        Err(e) => return Some(Err(e)),
                    }
                }
                Segment::Match(pattern) => {
                    match path.is_dir() {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(e) => return Some(Err(e)),
                    }
                    let children = match path.iterdir() {
                        Ok(children) => children,
                        Err(e) => return Some(Err(e)),
                    };
                    for child in children.into_iter().rev() {
                        if pattern.matches(child.name()) {
                            self.stack.push((child, idx + 1));
                        }
                    }
                }
                Segment::Any => {
                    match path.is_dir() {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(e) => return Some(Err(e)),
                    }
                    let children = match path.iterdir() {
                        Ok(children) => children,
                        Err(e) => return Some(Err(e)),
                    };
                    for child in children.into_iter().rev() {
                        match child.is_dir() {
                            Ok(true) => self.stack.push((child, idx)),
                            Ok(false) => {}
                            Err(e) => return Some(Err(e)),
                        }
                    }
                    // Zero-directory match: continue with this directory.
                    self.stack.push((path, idx + 1));
                }
            }
        }
        None
    }
}

// --- pure pathname helpers, shared with the board layer ---

/// Collapse repeated separators and strip any trailing one. Empty input
/// becomes `.`; `/` stays `/`.
pub(crate) fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    let absolute = path.starts_with('/');
    let mut out = String::with_capacity(path.len());
    if absolute {
        out.push('/');
    }
    for part in path.split('/').filter(|p| !p.is_empty()) {
        if !out.ends_with('/') && !out.is_empty() {
            out.push('/');
        }
        out.push_str(part);
    }
    if out.is_empty() {
        ".".to_string()
    } else {
        out
    }
}

/// Lexically eliminate `.` and `..` from a normalized path. `..` at the
/// root stays at the root.
pub(crate) fn fold_dots(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        match part {
            "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    let _ = parts.pop();
                } else if !absolute {
                    parts.push(part);
                }
            }
            part => parts.push(part),
        }
    }
    match (absolute, parts.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", parts.join("/")),
        (false, true) => ".".to_string(),
        (false, false) => parts.join("/"),
    }
}

/// Parent of a normalized path. The root is its own parent.
pub(crate) fn parent_of(path: &str) -> &str {
    if path == "/" {
        return "/";
    }
    match path.rfind('/') {
        None => ".",
        Some(0) => "/",
        Some(idx) => &path[..idx],
    }
}

/// Final component of a normalized path.
pub(crate) fn file_name(path: &str) -> &str {
    if path == "/" {
        return "/";
    }
    match path.rfind('/') {
        None => path,
        Some(idx) => &path[idx + 1..],
    }
}

/// Proper ancestors of an absolute path, outermost first, excluding the
/// root and the path itself: `/a/b/c` yields `/a`, `/a/b`.
fn ancestors_of(path: &str) -> impl Iterator<Item = &str> {
    path.char_indices()
        .skip(1)
        .filter_map(|(idx, c)| (c == '/').then(|| &path[..idx]))
}
