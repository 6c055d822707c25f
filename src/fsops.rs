//! Recursive copy, move, remove and listing over any mix of local and
//! remote paths.
//!
//! Every operation takes an already-expanded, concrete list of paths (see
//! [`path_list`]) and applies the destination rules uniformly: an existing
//! directory destination receives each source under its own name, a
//! missing destination is a literal target for exactly one source, and a
//! missing destination with several sources is an invalid fan-in.
//!
//! Failure policy is fail-fast: the first failing entry aborts the batch
//! with an error naming that path, leaving earlier siblings applied.
//! Cross-filesystem moves are copy-then-remove and therefore not atomic;
//! an interruption between the two phases leaves the data duplicated.

use std::io::Write;

use chrono::{DateTime, Local};

use crate::board::Board;
use crate::error::{Error, RemoteErrorKind, Result};
use crate::path::{is_wildcard, FsKind, VirtualPath};

/// Recursion limit for directory listings.
pub const MAX_DEPTH: usize = 20;

/// A directory (or `None` for the loose-files group) and its entries.
pub type DirListing = (Option<VirtualPath>, Vec<VirtualPath>);

/// A path-like input: text to be resolved (possibly a wildcard pattern) or
/// an already-constructed path.
#[derive(Debug, Clone)]
pub enum PathSpec {
    Text(String),
    Path(VirtualPath),
}

impl From<&str> for PathSpec {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for PathSpec {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<VirtualPath> for PathSpec {
    fn from(path: VirtualPath) -> Self {
        Self::Path(path)
    }
}

impl From<&VirtualPath> for PathSpec {
    fn from(path: &VirtualPath) -> Self {
        Self::Path(path.clone())
    }
}

/// Resolve a mixed batch of inputs into concrete paths, eagerly expanding
/// wildcard patterns so later side effects cannot change the selection.
///
/// Text with a leading `:` is remote; other text follows `default`. A
/// pattern matching nothing resolves to itself as a plain path, so the
/// batch's own existence checks report it.
pub fn path_list<I, S>(specs: I, board: Option<&Board>, default: FsKind) -> Result<Vec<VirtualPath>>
where
    I: IntoIterator<Item = S>,
    S: Into<PathSpec>,
{
    let mut out = Vec::new();
    for spec in specs {
        match spec.into() {
            PathSpec::Path(path) => out.push(path),
            PathSpec::Text(text) => {
                let (text, kind) = match text.strip_prefix(':') {
                    Some(rest) => (rest.to_string(), FsKind::Remote),
                    None => (text, default),
                };
                let plain = make_path(&text, kind, board)?;
                if is_wildcard(&text) {
                    let base = glob_base(&text, kind, board)?;
                    let pattern = text.trim_start_matches('/');
                    let matches = base.glob(pattern)?.collect::<Result<Vec<_>>>()?;
                    if matches.is_empty() {
                        out.push(plain);
                    } else {
                        out.extend(matches);
                    }
                } else {
                    out.push(plain);
                }
            }
        }
    }
    Ok(out)
}

fn make_path(text: &str, kind: FsKind, board: Option<&Board>) -> Result<VirtualPath> {
    match kind {
        FsKind::Local => Ok(VirtualPath::local(text)),
        FsKind::Remote => Ok(VirtualPath::remote(board.ok_or(Error::NotConnected)?, text)),
    }
}

/// Directory a wildcard pattern walks from: the filesystem root for an
/// absolute pattern, the working directory otherwise.
fn glob_base(pattern: &str, kind: FsKind, board: Option<&Board>) -> Result<VirtualPath> {
    if pattern.starts_with('/') {
        return make_path("/", kind, board);
    }
    match kind {
        FsKind::Local => Ok(VirtualPath::local(".")),
        FsKind::Remote => {
            let board = board.ok_or(Error::NotConnected)?;
            Ok(VirtualPath::remote(board, &board.cwd()))
        }
    }
}

/// Recursively copy `sources` to `dest` according to the destination rules
/// above. Files crossing filesystems are streamed in chunks; same-device
/// remote copies run device-side, local pairs use the host's native copy.
pub fn copy(sources: &[VirtualPath], dest: &VirtualPath) -> Result<()> {
    check_batch(sources, Some(dest))?;
    if dest.is_dir()? {
        for src in sources {
            rcopy(src, &dest.join(src.name()))?;
        }
        Ok(())
    } else if let [src] = sources {
        rcopy(src, dest)
    } else {
        Err(Error::InvalidDestination(format!(
            "'{dest}' is not a directory"
        )))
    }
}

/// Move `sources` to `dest`. A same-filesystem move is an atomic rename;
/// crossing filesystems it degrades to copy-then-remove, which can leave
/// the data duplicated if interrupted between the phases.
pub fn move_paths(sources: &[VirtualPath], dest: &VirtualPath) -> Result<()> {
    check_batch(sources, Some(dest))?;
    if dest.is_dir()? {
        for src in sources {
            move_one(src, &dest.join(src.name()))?;
        }
        Ok(())
    } else if let [src] = sources {
        move_one(src, dest)
    } else {
        Err(Error::InvalidDestination(format!(
            "'{dest}' is not a directory"
        )))
    }
}

/// Delete `paths`. Directories require `recursive` and are emptied
/// depth-first before removal. A path already gone is only tolerated when
/// an earlier entry of this same batch removed a subtree covering it.
pub fn remove(paths: &[VirtualPath], recursive: bool) -> Result<()> {
    let mut removed: Vec<VirtualPath> = Vec::new();
    for path in paths {
        if !path.exists()? {
            if removed.iter().any(|root| covers(root, path)) {
                continue;
            }
            return Err(Error::remote(RemoteErrorKind::NotFound, "remove").at(path.as_str()));
        }
        remove_path(path, recursive)?;
        removed.push(path.clone());
    }
    Ok(())
}

/// Listings of `paths` up to [`MAX_DEPTH`] deep when `recursive`, in
/// lexical depth-first order. Non-directories (and missing paths) are
/// grouped first under `None`, matching the shape a listing renderer
/// wants.
pub fn walk_files(paths: &[VirtualPath], recursive: bool) -> Result<Vec<DirListing>> {
    let mut paths = paths.to_vec();
    paths.sort();

    let mut dirs = Vec::new();
    let mut loose = Vec::new();
    for path in paths {
        if path.is_dir()? {
            dirs.push(path);
        } else {
            loose.push(path);
        }
    }

    // One directory and nothing else: list its contents without the header.
    if !recursive && loose.is_empty() && dirs.len() == 1 {
        return Ok(vec![(None, dirs[0].iterdir()?)]);
    }

    let mut out = vec![(None, loose)];
    for dir in &dirs {
        walk_into(&mut out, dir, if recursive { MAX_DEPTH } else { 0 })?;
    }
    Ok(out)
}

/// Render a listing of `paths` to `out`, `ls`-style. Missing paths are
/// reported inline, mirroring how a shell `ls` names absent operands.
pub fn ls(
    paths: &[VirtualPath],
    recursive: bool,
    long_form: bool,
    out: &mut dyn Write,
) -> Result<()> {
    let listing = walk_files(paths, recursive)?;
    if long_form {
        ls_long(&listing, out)
    } else {
        ls_short(&listing, out)
    }
}

fn ls_long(listing: &[DirListing], out: &mut dyn Write) -> Result<()> {
    for (dir, files) in listing {
        if let Some(dir) = dir {
            writeln!(out, "{dir}:")?;
        }
        for file in files {
            if !file.exists()? {
                writeln!(out, "'{file}': No such file or directory")?;
                continue;
            }
            let meta = file.metadata()?;
            let size = if meta.is_dir() { 0 } else { meta.len() };
            let when = DateTime::<Local>::from(meta.modified()).format("%b %e %H:%M %Y");
            writeln!(out, "{size:9} {when} {}", file.name())?;
        }
    }
    Ok(())
}

fn ls_short(listing: &[DirListing], out: &mut dyn Write) -> Result<()> {
    let mut started = false;
    for (dir, files) in listing {
        if started {
            writeln!(out)?;
        }
        if let Some(dir) = dir {
            writeln!(out, "{dir}:")?;
            started = true;
        } else {
            for file in files {
                if !file.exists()? {
                    writeln!(out, "'{file}': No such file or directory")?;
                    started = true;
                }
            }
        }
        let mut names = Vec::new();
        for file in files {
            if dir.is_some() || file.exists()? {
                names.push(file.name().to_string());
            }
        }
        if !names.is_empty() {
            writeln!(out, "{}", names.join("  "))?;
            started = true;
        }
    }
    Ok(())
}

// --- internals ---

/// Reject bad batches up front: missing sources, a source equal to the
/// destination, or a destination nested inside a source directory.
fn check_batch(sources: &[VirtualPath], dest: Option<&VirtualPath>) -> Result<()> {
    for src in sources {
        if !src.exists()? {
            return Err(Error::remote(RemoteErrorKind::NotFound, "source").at(src.as_str()));
        }
    }
    if let Some(dest) = dest {
        for src in sources {
            if src.kind() != dest.kind() {
                continue;
            }
            let src_abs = src.resolve()?;
            let dest_abs = dest.resolve()?;
            if src_abs == dest_abs {
                return Err(Error::InvalidDestination(format!(
                    "source '{src}' is the same as the destination"
                )));
            }
            if src.is_dir()?
                && dest_abs
                    .as_str()
                    .starts_with(&format!("{}/", src_abs.as_str()))
            {
                return Err(Error::InvalidDestination(format!(
                    "'{dest}' is inside source directory '{src}'"
                )));
            }
        }
    }
    Ok(())
}

fn rcopy(src: &VirtualPath, dst: &VirtualPath) -> Result<()> {
    if src.is_dir()? {
        debug!("{src}/ -> {dst}/");
        if !dst.is_dir()? {
            if dst.exists()? {
                return Err(Error::InvalidDestination(format!(
                    "'{dst}' exists and is not a directory"
                )));
            }
            dst.mkdir(false, true)?;
        }
        for child in src.iterdir()? {
            rcopy(&child, &dst.join(child.name()))?;
        }
        Ok(())
    } else {
        debug!("{src} -> {dst}");
        copy_file(src, dst)
    }
}

fn copy_file(src: &VirtualPath, dst: &VirtualPath) -> Result<()> {
    match (src.kind(), dst.kind()) {
        (FsKind::Local, FsKind::Local) => {
            let _ = std::fs::copy(src.as_str(), dst.as_str())
                .map_err(|e| Error::from(e).at(src.as_str()))?;
            Ok(())
        }
        (FsKind::Remote, FsKind::Remote) if same_board(src, dst) => {
            let (board, from, to) = (
                src.board().ok_or(Error::NotConnected)?,
                src.resolve()?,
                dst.resolve()?,
            );
            board.fs_copyfile(from.as_str(), to.as_str())
        }
        // Mixed pair (or two distinct devices): stream the bytes through
        // the host in bounded chunks and verify nothing was lost.
        _ => {
            let data = src.read_bytes()?;
            dst.write_bytes(&data)?;
            let copied = dst.metadata()?.len();
            if copied != data.len() as u64 {
                return Err(Error::Protocol(format!(
                    "length mismatch copying '{src}' to '{dst}': {copied} of {} bytes",
                    data.len()
                )));
            }
            Ok(())
        }
    }
}

fn same_board(a: &VirtualPath, b: &VirtualPath) -> bool {
    match (a.board(), b.board()) {
        (Some(a), Some(b)) => a.same_session(b),
        _ => false,
    }
}

fn move_one(src: &VirtualPath, dst: &VirtualPath) -> Result<()> {
    let same_fs = src.kind() == dst.kind()
        && (src.kind() == FsKind::Local || same_board(src, dst));
    if same_fs {
        debug!("{src} -> {dst} (rename)");
        src.rename(dst)
    } else {
        debug!("{src} -> {dst} (copy+remove)");
        rcopy(src, dst)?;
        remove_path(src, true)
    }
}

fn remove_path(path: &VirtualPath, recursive: bool) -> Result<()> {
    if path.is_dir()? {
        if !recursive {
            return Err(
                Error::remote(RemoteErrorKind::NotEmpty, "is a directory").at(path.as_str())
            );
        }
        for child in path.iterdir()? {
            remove_path(&child, true)?;
        }
        debug!("rmdir {path}");
        path.rmdir()
    } else {
        debug!("rm {path}");
        path.unlink()
    }
}

/// Whether deleting `root` also deleted `path`.
fn covers(root: &VirtualPath, path: &VirtualPath) -> bool {
    root.kind() == path.kind()
        && (root == path
            || path
                .as_str()
                .starts_with(&format!("{}/", root.as_str())))
}

fn walk_into(out: &mut Vec<DirListing>, dir: &VirtualPath, depth: usize) -> Result<()> {
    let files = dir.iterdir()?;
    out.push((Some(dir.clone()), files.clone()));
    if depth > 0 {
        for child in files {
            if child.is_dir()? {
                walk_into(out, &child, depth - 1)?;
            }
        }
    }
    Ok(())
}
