//! A simulated board: an in-memory filesystem behind a faithful raw-REPL
//! transport, plus hooks for inspecting the device state and the snippets
//! it executed.

// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use replpath::transport::Transport;
use replpath::{Board, Error, Result};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Connect a fresh board backed by a simulated device, returning the board
/// and a handle for poking at the device from the test.
pub fn fake_board() -> (Board, DeviceHandle) {
    init_logging();
    let state = Arc::new(Mutex::new(DeviceState::new()));
    let board = Board::connect(FakeDevice {
        state: state.clone(),
    })
    .expect("connect to simulated device");
    (board, DeviceHandle { state })
}

pub struct DeviceHandle {
    state: Arc<Mutex<DeviceState>>,
}

impl DeviceHandle {
    /// Number of bulk directory-listing snippets executed so far.
    pub fn listing_fetches(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .execs
            .iter()
            .filter(|code| code.starts_with("def _rpls"))
            .count()
    }

    /// Raw device-side file contents, straight from the simulated tree.
    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        match state.root.walk(path) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.state.lock().unwrap().root.walk(path).is_some()
    }

    /// Make every subsequent data write fail with ENOSPC, as a full
    /// flash filesystem would.
    pub fn set_disk_full(&self, full: bool) {
        self.state.lock().unwrap().disk_full = full;
    }

    /// Device clock reading, in seconds since the device epoch.
    pub fn device_clock(&self) -> i64 {
        self.state.lock().unwrap().clock
    }

    /// Create a file directly on the device, bypassing the board layers.
    /// Used to change device state behind the cache's back.
    pub fn plant_file(&self, path: &str, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let mtime = state.tick();
        state
            .root
            .create_file(path, data.to_vec(), mtime)
            .expect("plant file");
    }
}

pub struct FakeDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl Transport for FakeDevice {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.state.lock().unwrap().feed(data);
        Ok(())
    }

    fn read_until(&mut self, sentinel: &[u8], _timeout: Duration) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        match find(state.out.make_contiguous(), sentinel) {
            Some(end) => Ok(state.out.drain(..end).collect()),
            // The simulated device answers synchronously, so a missing
            // sentinel is a timeout.
            None => Err(Error::Unresponsive),
        }
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + needle.len())
}

/// MicroPython-flavoured device clock: epoch 2000-01-01, here a quarter
/// century in, ticking one second per mutation so mtimes are distinct.
const CLOCK_START: i64 = 800_000_000;

/// Seconds between the unix epoch and the device's 2000-01-01 epoch.
const UNIX_TO_DEVICE_EPOCH: i64 = 946_684_800;

enum Node {
    File { data: Vec<u8>, mtime: i64 },
    Dir { entries: BTreeMap<String, Node>, mtime: i64 },
}

struct DeviceState {
    root: Node,
    cwd: String,
    clock: i64,
    raw: bool,
    pending: Vec<u8>,
    out: VecDeque<u8>,
    handle: Option<OpenHandle>,
    execs: Vec<String>,
    disk_full: bool,
}

struct OpenHandle {
    path: String,
    reading: bool,
    pos: usize,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            root: Node::Dir {
                entries: BTreeMap::new(),
                mtime: CLOCK_START,
            },
            cwd: "/".to_string(),
            clock: CLOCK_START,
            raw: false,
            pending: Vec::new(),
            out: VecDeque::new(),
            handle: None,
            execs: Vec::new(),
            disk_full: false,
        }
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn feed(&mut self, data: &[u8]) {
        for &byte in data {
            match byte {
                0x01 => {
                    self.raw = true;
                    self.pending.clear();
                    self.out
                        .extend(b"raw REPL; CTRL-B to exit\r\n>".iter().copied());
                }
                0x02 => {
                    self.raw = false;
                    self.pending.clear();
                }
                0x03 => self.pending.clear(),
                0x04 if self.raw => {
                    let code = String::from_utf8_lossy(&self.pending).into_owned();
                    self.pending.clear();
                    self.out.extend(b"OK".iter().copied());
                    let (stdout, stderr) = self.execute(code.trim());
                    self.out.extend(stdout);
                    self.out.push_back(0x04);
                    self.out.extend(stderr);
                    self.out.push_back(0x04);
                    self.out.push_back(b'>');
                }
                byte => self.pending.push(byte),
            }
        }
    }

    fn execute(&mut self, code: &str) -> (Vec<u8>, Vec<u8>) {
        self.execs.push(code.to_string());
        match self.dispatch(code) {
            Ok(stdout) => (stdout, Vec::new()),
            Err(errno) => (Vec::new(), os_error(errno)),
        }
    }

    fn dispatch(&mut self, code: &str) -> std::result::Result<Vec<u8>, u32> {
        // A bare execution trigger is a soft reset; the tree survives it,
        // open handles and the working directory do not.
        if code.is_empty() {
            self.handle = None;
            self.cwd = "/".to_string();
            return Ok(Vec::new());
        }
        if code.starts_with("import machine") {
            return self.set_rtc(code).map(|()| Vec::new());
        }
        if code.starts_with("import ") {
            return Ok(Vec::new());
        }
        if let Some(expr) = code
            .strip_prefix("print(repr(")
            .and_then(|rest| rest.strip_suffix("))"))
        {
            return self.eval(expr);
        }
        if code.starts_with("def _rpls(") {
            let arg = code
                .rsplit_once("_rpls(")
                .and_then(|(_, rest)| rest.strip_suffix(')'))
                .and_then(parse_py_str)
                .ok_or(22u32)?;
            return self.list_dir(&arg);
        }
        if let Some(arg) = strip_call(code, "os.mkdir(") {
            let path = parse_py_str(&arg).ok_or(22u32)?;
            return self.mkdir(&path).map(|()| Vec::new());
        }
        if let Some(arg) = strip_call(code, "os.rmdir(") {
            let path = parse_py_str(&arg).ok_or(22u32)?;
            return self.rmdir(&path).map(|()| Vec::new());
        }
        if let Some(arg) = strip_call(code, "os.remove(") {
            let path = parse_py_str(&arg).ok_or(22u32)?;
            return self.remove(&path).map(|()| Vec::new());
        }
        if let Some(args) = strip_call(code, "os.rename(") {
            let (from, rest) = split_py_str(&args).ok_or(22u32)?;
            let to = parse_py_str(rest.trim_start_matches(',')).ok_or(22u32)?;
            return self.rename(&from, &to).map(|()| Vec::new());
        }
        if let Some(arg) = strip_call(code, "os.chdir(") {
            let path = parse_py_str(&arg).ok_or(22u32)?;
            return self.chdir(&path).map(|()| Vec::new());
        }
        if code.starts_with("open(") && code.ends_with(".close()") {
            let args = code
                .strip_prefix("open(")
                .and_then(|r| r.strip_suffix(").close()"))
                .ok_or(22u32)?;
            let (path, _) = split_py_str(args).ok_or(22u32)?;
            return self.touch(&path).map(|()| Vec::new());
        }
        if let Some(args) = strip_call(code, "_rpf=open(") {
            let (path, rest) = split_py_str(&args).ok_or(22u32)?;
            let mode = parse_py_str(rest.trim_start_matches(',')).ok_or(22u32)?;
            return self.open_handle(&path, &mode).map(|()| Vec::new());
        }
        if code == "_rpf.close()" {
            self.handle = None;
            return Ok(Vec::new());
        }
        if code.starts_with("_rps=open(") {
            return self.device_copy(code).map(|()| Vec::new());
        }
        // A snippet the simulator does not understand is a bug in the test
        // or the crate; surface it loudly as a generic device exception.
        Err(0)
    }

    fn eval(&mut self, expr: &str) -> std::result::Result<Vec<u8>, u32> {
        if expr == "time.gmtime(0)[0]" {
            return Ok(b"2000".to_vec());
        }
        if expr == "int(time.time())" {
            return Ok(self.clock.to_string().into_bytes());
        }
        if expr == "os.getcwd()" {
            return Ok(py_str(&self.cwd).into_bytes());
        }
        if let Some(arg) = strip_call(expr, "os.stat(") {
            let path = parse_py_str(&arg).ok_or(22u32)?;
            let node = self.root.walk(&self.resolve(&path)).ok_or(2u32)?;
            return Ok(stat_repr(node).into_bytes());
        }
        if let Some(arg) = strip_call(expr, "_rpf.read(") {
            let count: usize = arg.parse().map_err(|_| 22u32)?;
            return self.read_chunk(count);
        }
        if let Some(arg) = strip_call(expr, "_rpf.write(") {
            let data = parse_py_bytes(&arg).ok_or(22u32)?;
            return self.write_chunk(&data);
        }
        Err(0)
    }

    fn resolve(&self, path: &str) -> String {
        let absolute = if path.starts_with('/') {
            path.to_string()
        } else if self.cwd == "/" {
            format!("/{path}")
        } else {
            format!("{}/{path}", self.cwd)
        };
        let mut parts: Vec<&str> = Vec::new();
        for part in absolute.split('/').filter(|p| !p.is_empty()) {
            match part {
                "." => {}
                ".." => {
                    let _ = parts.pop();
                }
                part => parts.push(part),
            }
        }
        if parts.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", parts.join("/"))
        }
    }

    fn list_dir(&mut self, path: &str) -> std::result::Result<Vec<u8>, u32> {
        let abs = self.resolve(path);
        match self.root.walk(&abs) {
            None => Err(2),
            Some(Node::File { .. }) => Err(20),
            Some(Node::Dir { entries, .. }) => {
                let items: Vec<String> = entries
                    .iter()
                    .map(|(name, node)| {
                        let (mode, size, mtime) = node.stat();
                        format!("({}, {mode}, {size}, {mtime})", py_str(name))
                    })
                    .collect();
                Ok(format!("[{}]", items.join(", ")).into_bytes())
            }
        }
    }

    fn mkdir(&mut self, path: &str) -> std::result::Result<(), u32> {
        let abs = self.resolve(path);
        let mtime = self.tick();
        self.root.create_dir(&abs, mtime)
    }

    fn rmdir(&mut self, path: &str) -> std::result::Result<(), u32> {
        let abs = self.resolve(path);
        match self.root.walk(&abs) {
            None => return Err(2),
            Some(Node::File { .. }) => return Err(20),
            Some(Node::Dir { entries, .. }) if !entries.is_empty() => return Err(39),
            Some(Node::Dir { .. }) => {}
        }
        self.root.remove(&abs)
    }

    fn remove(&mut self, path: &str) -> std::result::Result<(), u32> {
        let abs = self.resolve(path);
        match self.root.walk(&abs) {
            None => Err(2),
            Some(Node::Dir { .. }) => Err(21),
            Some(Node::File { .. }) => self.root.remove(&abs),
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> std::result::Result<(), u32> {
        let from = self.resolve(from);
        let to = self.resolve(to);
        let node = self.root.take(&from).ok_or(2u32)?;
        self.root.attach(&to, node)
    }

    fn chdir(&mut self, path: &str) -> std::result::Result<(), u32> {
        let abs = self.resolve(path);
        match self.root.walk(&abs) {
            Some(Node::Dir { .. }) => {
                self.cwd = abs;
                Ok(())
            }
            Some(Node::File { .. }) => Err(20),
            None => Err(2),
        }
    }

    fn touch(&mut self, path: &str) -> std::result::Result<(), u32> {
        let abs = self.resolve(path);
        let mtime = self.tick();
        match self.root.walk_mut(&abs) {
            Some(Node::File { mtime: m, .. }) => {
                *m = mtime;
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(21),
            None => self.root.create_file(&abs, Vec::new(), mtime),
        }
    }

    fn open_handle(&mut self, path: &str, mode: &str) -> std::result::Result<(), u32> {
        let abs = self.resolve(path);
        match mode {
            "rb" => match self.root.walk(&abs) {
                Some(Node::File { .. }) => {
                    self.handle = Some(OpenHandle {
                        path: abs,
                        reading: true,
                        pos: 0,
                    });
                    Ok(())
                }
                Some(Node::Dir { .. }) => Err(21),
                None => Err(2),
            },
            "wb" => {
                if matches!(self.root.walk(&abs), Some(Node::Dir { .. })) {
                    return Err(21);
                }
                let mtime = self.tick();
                self.root.create_file(&abs, Vec::new(), mtime)?;
                self.handle = Some(OpenHandle {
                    path: abs,
                    reading: false,
                    pos: 0,
                });
                Ok(())
            }
            _ => Err(22),
        }
    }

    fn read_chunk(&mut self, count: usize) -> std::result::Result<Vec<u8>, u32> {
        let handle = self.handle.as_mut().ok_or(9u32)?;
        if !handle.reading {
            return Err(9);
        }
        let Some(Node::File { data, .. }) = self.root.walk(&handle.path) else {
            return Err(2);
        };
        let start = handle.pos.min(data.len());
        let end = (start + count).min(data.len());
        handle.pos = end;
        Ok(py_bytes(&data[start..end]).into_bytes())
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> std::result::Result<Vec<u8>, u32> {
        let path = match &self.handle {
            Some(handle) if !handle.reading => handle.path.clone(),
            _ => return Err(9),
        };
        if self.disk_full {
            return Err(28);
        }
        let mtime = self.tick();
        match self.root.walk_mut(&path) {
            Some(Node::File { data, mtime: m }) => {
                data.extend_from_slice(chunk);
                *m = mtime;
                Ok(chunk.len().to_string().into_bytes())
            }
            _ => Err(2),
        }
    }

    /// The device-side copy snippet: pull both path literals out of its
    /// first two lines and copy in one step.
    fn device_copy(&mut self, code: &str) -> std::result::Result<(), u32> {
        let mut lines = code.lines();
        let src = lines
            .next()
            .and_then(|l| strip_call(l, "_rps=open("))
            .and_then(|args| split_py_str(&args).map(|(p, _)| p))
            .ok_or(22u32)?;
        let dst = lines
            .next()
            .and_then(|l| strip_call(l, "_rpd=open("))
            .and_then(|args| split_py_str(&args).map(|(p, _)| p))
            .ok_or(22u32)?;

        let src = self.resolve(&src);
        let dst = self.resolve(&dst);
        let data = match self.root.walk(&src) {
            Some(Node::File { data, .. }) => data.clone(),
            Some(Node::Dir { .. }) => return Err(21),
            None => return Err(2),
        };
        if matches!(self.root.walk(&dst), Some(Node::Dir { .. })) {
            return Err(21);
        }
        let mtime = self.tick();
        if self.disk_full {
            // The destination open truncate-created before the first chunk
            // could land.
            self.root.create_file(&dst, Vec::new(), mtime)?;
            return Err(28);
        }
        self.root.create_file(&dst, data, mtime)
    }

    /// `machine.RTC().datetime((y,m,d,0,h,mi,s,0))` sets the device clock.
    fn set_rtc(&mut self, code: &str) -> std::result::Result<(), u32> {
        let args = code
            .split_once("datetime((")
            .and_then(|(_, rest)| rest.strip_suffix("))"))
            .ok_or(22u32)?;
        let fields: Vec<i64> = args
            .split(',')
            .map(|s| s.trim().parse().map_err(|_| 22u32))
            .collect::<std::result::Result<_, u32>>()?;
        let [year, month, day, _, hour, minute, second, _] = fields[..] else {
            return Err(22);
        };
        let when = Utc
            .with_ymd_and_hms(
                year as i32,
                month as u32,
                day as u32,
                hour as u32,
                minute as u32,
                second as u32,
            )
            .single()
            .ok_or(22u32)?;
        self.clock = when.timestamp() - UNIX_TO_DEVICE_EPOCH;
        Ok(())
    }
}

impl Node {
    fn stat(&self) -> (u32, usize, i64) {
        match self {
            Node::File { data, mtime } => (0x8000, data.len(), *mtime),
            Node::Dir { mtime, .. } => (0x4000, 0, *mtime),
        }
    }

    fn walk(&self, path: &str) -> Option<&Node> {
        let mut node = self;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            match node {
                Node::Dir { entries, .. } => node = entries.get(part)?,
                Node::File { .. } => return None,
            }
        }
        Some(node)
    }

    fn walk_mut(&mut self, path: &str) -> Option<&mut Node> {
        let mut node = self;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            match node {
                Node::Dir { entries, .. } => node = entries.get_mut(part)?,
                Node::File { .. } => return None,
            }
        }
        Some(node)
    }

    fn parent_and_name<'a>(&mut self, path: &'a str) -> Option<(&mut BTreeMap<String, Node>, &'a str)> {
        let (parent, name) = match path.rfind('/') {
            Some(0) => ("/", &path[1..]),
            Some(idx) => (&path[..idx], &path[idx + 1..]),
            None => return None,
        };
        match self.walk_mut(parent) {
            Some(Node::Dir { entries, .. }) => Some((entries, name)),
            _ => None,
        }
    }

    fn create_file(&mut self, path: &str, data: Vec<u8>, mtime: i64) -> std::result::Result<(), u32> {
        let (entries, name) = self.parent_and_name(path).ok_or(2u32)?;
        if matches!(entries.get(name), Some(Node::Dir { .. })) {
            return Err(21);
        }
        let _ = entries.insert(name.to_string(), Node::File { data, mtime });
        Ok(())
    }

    fn create_dir(&mut self, path: &str, mtime: i64) -> std::result::Result<(), u32> {
        let (entries, name) = self.parent_and_name(path).ok_or(2u32)?;
        if entries.contains_key(name) {
            return Err(17);
        }
        let _ = entries.insert(
            name.to_string(),
            Node::Dir {
                entries: BTreeMap::new(),
                mtime,
            },
        );
        Ok(())
    }

    fn remove(&mut self, path: &str) -> std::result::Result<(), u32> {
        let (entries, name) = self.parent_and_name(path).ok_or(2u32)?;
        entries.remove(name).map(|_| ()).ok_or(2)
    }

    fn take(&mut self, path: &str) -> Option<Node> {
        let (entries, name) = self.parent_and_name(path)?;
        entries.remove(name)
    }

    fn attach(&mut self, path: &str, node: Node) -> std::result::Result<(), u32> {
        let (entries, name) = self.parent_and_name(path).ok_or(2u32)?;
        let _ = entries.insert(name.to_string(), node);
        Ok(())
    }
}

fn strip_call(code: &str, prefix: &str) -> Option<String> {
    code.strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix(')'))
        .map(|args| args.to_string())
}

fn os_error(errno: u32) -> Vec<u8> {
    let symbol = match errno {
        2 => "ENOENT",
        9 => "EBADF",
        13 => "EACCES",
        17 => "EEXIST",
        20 => "ENOTDIR",
        21 => "EISDIR",
        22 => "EINVAL",
        28 => "ENOSPC",
        39 => "ENOTEMPTY",
        _ => return b"Exception: simulated device cannot run this snippet\r\n".to_vec(),
    };
    format!(
        "Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\nOSError: [Errno {errno}] {symbol}\r\n"
    )
    .into_bytes()
}

fn py_str(s: &str) -> String {
    let mut out = String::from("'");
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn py_bytes(data: &[u8]) -> String {
    let mut out = String::from("b'");
    for &b in data {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            b => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out.push('\'');
    out
}

fn stat_repr(node: &Node) -> String {
    let (mode, size, mtime) = node.stat();
    format!("({mode}, 0, 0, 0, 0, 0, {size}, 0, {mtime}, 0)")
}

/// Parse one single-quoted literal occupying the whole input.
fn parse_py_str(input: &str) -> Option<String> {
    let (value, rest) = split_py_str(input)?;
    rest.is_empty().then_some(value)
}

/// Parse a leading single-quoted literal, returning it and the remainder.
fn split_py_str(input: &str) -> Option<(String, &str)> {
    let rest = input.strip_prefix('\'')?;
    let bytes = rest.as_bytes();
    let mut out = String::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => return Some((out, &rest[i + 1..])),
            b'\\' => {
                let (c, used) = unescape(&bytes[i + 1..])?;
                out.push(c as char);
                i += 1 + used;
            }
            _ => {
                // Multi-byte UTF-8 passes through untouched.
                let ch = rest[i..].chars().next()?;
                out.push(ch);
                i += ch.len_utf8();
            }
        }
    }
    None
}

fn parse_py_bytes(input: &str) -> Option<Vec<u8>> {
    let rest = input.strip_prefix("b'")?.strip_suffix('\'')?;
    let bytes = rest.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                let (b, used) = unescape(&bytes[i + 1..])?;
                out.push(b);
                i += 1 + used;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Some(out)
}

/// Decode one escape body, returning the byte and how many input bytes the
/// body consumed.
fn unescape(body: &[u8]) -> Option<(u8, usize)> {
    match body.first()? {
        b'n' => Some((b'\n', 1)),
        b'r' => Some((b'\r', 1)),
        b't' => Some((b'\t', 1)),
        b'0' => Some((0, 1)),
        b'x' => {
            let hex = std::str::from_utf8(body.get(1..3)?).ok()?;
            u8::from_str_radix(hex, 16).ok().map(|b| (b, 3))
        }
        &c => Some((c, 1)),
    }
}
