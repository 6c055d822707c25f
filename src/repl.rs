//! The execution bridge: raw-REPL framing over a [`Transport`].
//!
//! A snippet is written to the channel followed by the execution trigger
//! (`^D`); the device acknowledges with `OK`, then streams program output,
//! a `^D` sentinel, the traceback segment (empty on success), another `^D`
//! and finally its prompt. One request is in flight at a time; the bridge
//! is not reentrant.

use std::time::Duration;

use crate::error::{Error, RemoteErrorKind, Result};
use crate::transport::Transport;

const INTERRUPT: &[u8] = b"\r\x03\x03";
const ENTER_RAW: &[u8] = b"\r\x01";
const EXIT_RAW: &[u8] = b"\r\x02";
const EXEC_TRIGGER: &[u8] = b"\x04";
const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
const ACK: &[u8] = b"OK";
const SEGMENT_END: &[u8] = b"\x04";
const PROMPT: &[u8] = b">";

/// Snippets are fed to the device in small pieces so its input buffer is
/// never overrun.
const WRITE_CHUNK: usize = 256;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct RawRepl {
    transport: Box<dyn Transport>,
    timeout: Duration,
    in_raw: bool,
}

impl RawRepl {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_TIMEOUT,
            in_raw: false,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Interrupt whatever the board is doing and switch it to raw mode.
    pub fn enter_raw(&mut self) -> Result<()> {
        if self.in_raw {
            return Ok(());
        }
        self.transport.write(INTERRUPT)?;
        self.transport.write(ENTER_RAW)?;
        let _ = self.transport.read_until(RAW_BANNER, self.timeout)?;
        self.in_raw = true;
        debug!("entered raw repl");
        Ok(())
    }

    /// Return the board to the friendly prompt.
    pub fn exit_raw(&mut self) -> Result<()> {
        if self.in_raw {
            self.transport.write(EXIT_RAW)?;
            self.in_raw = false;
            debug!("left raw repl");
        }
        Ok(())
    }

    /// Execute `code` on the device and return its captured output.
    ///
    /// A non-empty traceback segment is mapped to the corresponding
    /// [`RemoteErrorKind`]; transport failures propagate untouched and are
    /// never retried here.
    pub fn exec(&mut self, code: &str) -> Result<String> {
        self.enter_raw()?;
        trace!("exec: {code}");

        for chunk in code.as_bytes().chunks(WRITE_CHUNK) {
            self.transport.write(chunk)?;
        }
        self.transport.write(EXEC_TRIGGER)?;
        let _ = self.transport.read_until(ACK, self.timeout)?;

        let output = self.read_segment()?;
        let traceback = self.read_segment()?;
        let _ = self.transport.read_until(PROMPT, self.timeout)?;

        if !traceback.is_empty() {
            let text = String::from_utf8_lossy(&traceback);
            trace!("exec failed: {}", text.trim());
            return Err(map_traceback(&text));
        }

        let output = String::from_utf8(output)
            .map_err(|_| Error::Protocol("device output is not valid utf-8".into()))?;
        trace!("exec ok: {}", output.trim_end());
        Ok(output)
    }

    /// Soft-reset the device: a bare execution trigger at the raw prompt
    /// reboots the interpreter, wiping its namespace. The raw session is
    /// re-established afterwards.
    pub fn soft_reset(&mut self) -> Result<()> {
        self.enter_raw()?;
        self.transport.write(EXEC_TRIGGER)?;
        self.in_raw = false;
        debug!("soft reset");
        self.enter_raw()
    }

    pub fn close(&mut self) -> Result<()> {
        let _ = self.exit_raw();
        self.transport.close()
    }

    fn read_segment(&mut self) -> Result<Vec<u8>> {
        let mut data = self.transport.read_until(SEGMENT_END, self.timeout)?;
        let _ = data.pop(); // the sentinel itself
        Ok(data)
    }
}

/// Derive a structured error from the device's traceback text. The last
/// non-blank line carries `ExceptionName: detail`; `OSError` details are an
/// errno, `[Errno n] SYMBOL` or a bare symbol depending on the port.
fn map_traceback(traceback: &str) -> Error {
    let last = traceback
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default();
    let (name, detail) = match last.split_once(':') {
        Some((name, detail)) => (name.trim(), detail.trim()),
        None => (last.trim(), ""),
    };

    let kind = match name {
        "OSError" | "IOError" => errno_kind(detail),
        _ => RemoteErrorKind::Other,
    };
    Error::remote(kind, traceback.trim())
}

fn errno_kind(detail: &str) -> RemoteErrorKind {
    let digits: String = detail
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    if let Ok(errno) = digits.parse::<u32>() {
        return RemoteErrorKind::from_errno(errno);
    }
    detail
        .split(|c: char| !c.is_ascii_alphabetic())
        .find_map(RemoteErrorKind::from_symbol)
        .unwrap_or(RemoteErrorKind::Other)
}
