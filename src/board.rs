//! The board connection: one device session owning the execution bridge
//! and the attribute cache.
//!
//! All remote filesystem traffic funnels through here. Queries go to the
//! cache when possible; every mutation invalidates the cache entries for
//! the directories it touched. Requests are strictly ordered, one in
//! flight at a time.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{Datelike, Timelike, Utc};

use crate::attrs::Metadata;
use crate::cache::{DirCache, RemoteEntry};
use crate::error::{Error, RemoteErrorKind, Result};
use crate::literal::{self, Value};
use crate::path::{file_name, parent_of};
use crate::repl::RawRepl;
use crate::transport::Transport;

/// Bytes moved per channel round trip when streaming file contents. Keeps
/// any single snippet (and the device-side buffer it allocates) bounded.
pub(crate) const CHUNK_SIZE: usize = 1024;

/// Seconds between the unix epoch and 2000-01-01, the epoch most
/// MicroPython ports use for their clock.
const Y2K_EPOCH_OFFSET: i64 = 946_684_800;

/// Name bound in the raw-REPL namespace for streamed file handles.
const HANDLE_VAR: &str = "_rpf";

const LIST_DIR_SNIPPET: &str = "\
def _rpls(p):
 q=p if p.endswith('/') else p+'/'
 r=[]
 for e in os.ilistdir(p):
  n=e[0]
  try:
   s=os.stat(q+n)
   r.append((n,s[0],s[6],s[8]))
  except OSError:
   r.append((n,0,0,0))
 print(repr(r))
_rpls(";

/// A connection to a board. Cheap to clone; clones share the session and
/// its cache. Paths created from this board hold one of these.
#[derive(Clone)]
pub struct Board {
    inner: Arc<Mutex<BoardInner>>,
}

struct BoardInner {
    repl: RawRepl,
    cache: DirCache,
    /// Added to every device timestamp so mtimes are host-comparable.
    epoch_offset: i64,
    /// Device working directory, tracked host-side so relative remote
    /// paths resolve without a round trip.
    cwd: String,
}

impl Board {
    /// Connect over `transport`: enter raw mode, probe the device epoch and
    /// record the initial working directory.
    pub fn connect<T: Transport + 'static>(transport: T) -> Result<Self> {
        let mut repl = RawRepl::new(Box::new(transport));
        repl.enter_raw()?;
        let _ = repl.exec("import os, time")?;

        let year = eval_on(&mut repl, "time.gmtime(0)[0]")?.as_int()?;
        let epoch_offset = if year >= 2000 { Y2K_EPOCH_OFFSET } else { 0 };
        let cwd = eval_on(&mut repl, "os.getcwd()")?.as_str()?.to_string();
        debug!("connected: cwd={cwd} epoch_offset={epoch_offset}");

        Ok(Self {
            inner: Arc::new(Mutex::new(BoardInner {
                repl,
                cache: DirCache::default(),
                epoch_offset,
                cwd,
            })),
        })
    }

    /// Whether two handles address the same device session.
    pub fn same_session(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Maximum wait for a response sentinel before the call fails with
    /// [`Error::Unresponsive`].
    pub fn set_timeout(&self, timeout: Duration) {
        self.lock().repl.set_timeout(timeout);
    }

    /// Offset in seconds of the device clock from the host clock, after the
    /// epoch shift. Near zero means device mtimes can be trusted against
    /// host timestamps.
    pub fn clock_offset(&self) -> Result<i64> {
        let mut inner = self.lock();
        let device = eval_on(&mut inner.repl, "int(time.time())")?.as_int()?;
        Ok(device + inner.epoch_offset - Utc::now().timestamp())
    }

    /// Set the device real-time clock from the host clock (UTC). Ports
    /// without an RTC peripheral ignore the request.
    pub fn sync_clock(&self) -> Result<()> {
        let now = Utc::now();
        let _ = self.lock().exec(&format!(
            "import machine\nif hasattr(machine,'RTC'): machine.RTC().datetime(({},{},{},0,{},{},{},0))",
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second()
        ))?;
        debug!("device clock synchronized");
        Ok(())
    }

    /// Soft-reset the device and rebuild the session state on top of the
    /// fresh interpreter. Cached listings and the tracked working directory
    /// are gone with the old namespace.
    pub fn soft_reset(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.repl.soft_reset()?;
        inner.cache.clear();
        let _ = inner.exec("import os, time")?;
        inner.cwd = eval_on(&mut inner.repl, "os.getcwd()")?.as_str()?.to_string();
        Ok(())
    }

    /// Leave raw mode and close the channel. The cache dies with the
    /// session.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.cache.clear();
        inner.repl.close()
    }

    /// Execute a code snippet on the device and return its output.
    pub fn exec(&self, code: &str) -> Result<String> {
        Ok(self.lock().repl.exec(code)?.trim().to_string())
    }

    /// Evaluate an expression on the device and parse the printed result.
    pub fn eval(&self, expr: &str) -> Result<Value> {
        eval_on(&mut self.lock().repl, expr)
    }

    /// Evaluate an expression expected to yield a string.
    pub fn eval_str(&self, expr: &str) -> Result<String> {
        Ok(self.eval(expr)?.as_str()?.to_string())
    }

    /// The device working directory as of the last `chdir`.
    pub fn cwd(&self) -> String {
        self.lock().cwd.clone()
    }

    pub fn chdir(&self, path: &str) -> Result<()> {
        let mut inner = self.lock();
        inner
            .exec(&format!("os.chdir({})", literal::quote_str(path)))
            .map_err(|e| e.at(path))?;
        inner.cwd = path.to_string();
        Ok(())
    }

    /// Fetch metadata with a direct stat round trip, bypassing the cache.
    pub(crate) fn fs_stat(&self, path: &str) -> Result<Metadata> {
        let mut inner = self.lock();
        let stat = inner
            .eval(&format!("os.stat({})", literal::quote_str(path)))
            .map_err(|e| e.at(path))?;
        Metadata::from_stat(&stat, inner.epoch_offset)
    }

    /// The cached listing for `dir`, fetching it with a single bulk round
    /// trip if no generation is cached.
    pub(crate) fn listing(&self, dir: &str) -> Result<Arc<Vec<RemoteEntry>>> {
        let mut inner = self.lock();
        if let Some(entries) = inner.cache.get(dir) {
            trace!("listing {dir}: cached");
            return Ok(entries);
        }
        let entries = inner.fetch_listing(dir)?;
        Ok(inner.cache.insert(dir.to_string(), entries))
    }

    /// Look `path` up in its parent's listing. `Ok(None)` means the path
    /// does not exist (including when the parent itself is missing).
    pub(crate) fn lookup(&self, path: &str) -> Result<Option<RemoteEntry>> {
        if path == "/" {
            let meta = self.fs_stat("/")?;
            return Ok(Some(RemoteEntry::new("/".to_string(), meta)));
        }
        let name = file_name(path);
        match self.listing(parent_of(path)) {
            Ok(entries) => Ok(entries.iter().find(|e| e.name() == name).cloned()),
            // A missing or non-directory parent just means the path is absent.
            Err(Error::Remote { kind, .. })
                if kind == RemoteErrorKind::NotFound || kind == RemoteErrorKind::NotADirectory =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn fs_mkdir(&self, path: &str) -> Result<()> {
        let mut inner = self.lock();
        inner
            .exec(&format!("os.mkdir({})", literal::quote_str(path)))
            .map_err(|e| e.at(path))?;
        inner.cache.invalidate(parent_of(path));
        Ok(())
    }

    pub(crate) fn fs_rmdir(&self, path: &str) -> Result<()> {
        let mut inner = self.lock();
        inner
            .exec(&format!("os.rmdir({})", literal::quote_str(path)))
            .map_err(|e| e.at(path))?;
        inner.cache.invalidate(parent_of(path));
        inner.cache.invalidate_tree(path);
        Ok(())
    }

    pub(crate) fn fs_remove(&self, path: &str) -> Result<()> {
        let mut inner = self.lock();
        inner
            .exec(&format!("os.remove({})", literal::quote_str(path)))
            .map_err(|e| e.at(path))?;
        inner.cache.invalidate(parent_of(path));
        Ok(())
    }

    pub(crate) fn fs_rename(&self, from: &str, to: &str) -> Result<()> {
        let mut inner = self.lock();
        inner
            .exec(&format!(
                "os.rename({},{})",
                literal::quote_str(from),
                literal::quote_str(to)
            ))
            .map_err(|e| e.at(from))?;
        inner.cache.invalidate(parent_of(from));
        inner.cache.invalidate(parent_of(to));
        // Either side may have been a directory; listings keyed under both
        // subtrees are stale now.
        inner.cache.invalidate_tree(from);
        inner.cache.invalidate_tree(to);
        Ok(())
    }

    /// Create the file if missing, update its mtime if not.
    pub(crate) fn fs_touch(&self, path: &str) -> Result<()> {
        let mut inner = self.lock();
        inner
            .exec(&format!("open({},'a').close()", literal::quote_str(path)))
            .map_err(|e| e.at(path))?;
        inner.cache.invalidate(parent_of(path));
        Ok(())
    }

    /// Read a whole file, streamed in [`CHUNK_SIZE`] pieces so no single
    /// request grows with the file.
    pub(crate) fn fs_readfile(&self, path: &str) -> Result<Bytes> {
        let mut inner = self.lock();
        inner
            .exec(&format!(
                "{HANDLE_VAR}=open({},'rb')",
                literal::quote_str(path)
            ))
            .map_err(|e| e.at(path))?;

        let mut buf = BytesMut::new();
        let result: Result<()> = (|| loop {
            let value = inner
                .eval(&format!("{HANDLE_VAR}.read({CHUNK_SIZE})"))
                .map_err(|e| e.at(path))?;
            let chunk = value.as_bytes()?;
            if chunk.is_empty() {
                return Ok(());
            }
            buf.extend_from_slice(chunk);
        })();
        // Close even after a failed chunk; the handle must not leak into
        // the next request.
        let closed = inner.exec(&format!("{HANDLE_VAR}.close()"));
        result?;
        closed?;
        trace!("read {} bytes from {path}", buf.len());
        Ok(buf.freeze())
    }

    /// Write a whole file, streamed in [`CHUNK_SIZE`] pieces, verifying the
    /// total the device acknowledged matches the source length.
    pub(crate) fn fs_writefile(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        inner
            .exec(&format!(
                "{HANDLE_VAR}=open({},'wb')",
                literal::quote_str(path)
            ))
            .map_err(|e| e.at(path))?;
        // The open already created or truncated the file; the cached parent
        // listing is stale from here on whether or not the chunks land.
        inner.cache.invalidate(parent_of(path));

        let mut written: u64 = 0;
        let result: Result<()> = (|| {
            for chunk in data.chunks(CHUNK_SIZE) {
                let n = inner
                    .eval(&format!(
                        "{HANDLE_VAR}.write({})",
                        literal::quote_bytes(chunk)
                    ))
                    .map_err(|e| e.at(path))?
                    .as_int()?;
                written += n.max(0) as u64;
            }
            Ok(())
        })();
        let closed = inner.exec(&format!("{HANDLE_VAR}.close()"));
        result?;
        closed?;

        if written != data.len() as u64 {
            return Err(Error::Protocol(format!(
                "short write to '{path}': {written} of {} bytes",
                data.len()
            )));
        }
        trace!("wrote {written} bytes to {path}");
        Ok(())
    }

    /// Device-side file copy: the bytes never cross the serial channel.
    pub(crate) fn fs_copyfile(&self, from: &str, to: &str) -> Result<()> {
        let mut inner = self.lock();
        let snippet = format!(
            "_rps=open({src},'rb')\n\
             _rpd=open({dst},'wb')\n\
             while True:\n \
             b=_rps.read({CHUNK_SIZE})\n \
             if not b: break\n \
             _rpd.write(b)\n\
             _rpd.close()\n\
             _rps.close()",
            src = literal::quote_str(from),
            dst = literal::quote_str(to),
        );
        let result = inner.exec(&snippet).map_err(|e| e.at(from));
        // The destination may exist even when the snippet failed partway.
        inner.cache.invalidate(parent_of(to));
        let _ = result?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, BoardInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BoardInner {
    fn exec(&mut self, code: &str) -> Result<String> {
        self.repl.exec(code)
    }

    fn eval(&mut self, expr: &str) -> Result<Value> {
        eval_on(&mut self.repl, expr)
    }

    fn fetch_listing(&mut self, dir: &str) -> Result<Vec<RemoteEntry>> {
        let snippet = format!("{LIST_DIR_SNIPPET}{})", literal::quote_str(dir));
        let output = self.exec(&snippet).map_err(|e| e.at(dir))?;
        let value = literal::parse(&output)?;

        let mut entries = Vec::new();
        for item in value.items()? {
            let fields = item.items()?;
            if fields.len() != 4 {
                return Err(Error::Protocol(format!(
                    "directory entry has {} fields, expected 4",
                    fields.len()
                )));
            }
            let name = fields[0].as_str()?;
            if name == "." || name == ".." {
                continue;
            }
            let mode = fields[1].as_int()? as u32;
            let size = fields[2].as_int()?.max(0) as u64;
            let mtime = if mode == 0 {
                0
            } else {
                fields[3]
                    .as_int()?
                    .saturating_add(self.epoch_offset)
                    .clamp(0, i64::from(u32::MAX)) as u32
            };
            entries.push(RemoteEntry::new(
                name.to_string(),
                Metadata::new(mode, size, mtime),
            ));
        }
        entries.sort_by(|a, b| a.name().cmp(b.name()));
        trace!("listed {dir}: {} entries", entries.len());
        Ok(entries)
    }
}

fn eval_on(repl: &mut RawRepl, expr: &str) -> Result<Value> {
    let output = repl.exec(&format!("print(repr({expr}))"))?;
    literal::parse(&output)
}
