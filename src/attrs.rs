//! File metadata as reported by the device `stat` call.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::literal::Value;

/// Types according to mode unix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileType(u32);

bitflags! {
    impl FileType: u32 {
        const DIR = 0x4000;
        const REG = 0x8000;
    }
}

impl FileType {
    /// Extract the type bits from a full `st_mode` word. An empty result
    /// means the kind is unknown (the entry vanished between listing and
    /// stat, or the device reported something exotic).
    pub fn from_mode(mode: u32) -> Self {
        Self::from_bits_truncate(mode & 0xf000)
    }

    pub fn is_dir(&self) -> bool {
        self.contains(Self::DIR)
    }

    pub fn is_file(&self) -> bool {
        self.contains(Self::REG)
    }
}

/// Metadata for one filesystem object, local or remote.
///
/// Remote modification times are device-clock seconds shifted onto the unix
/// epoch at fetch time; they are only as accurate as the board's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    mode: u32,
    size: u64,
    mtime: u32,
}

impl Metadata {
    pub(crate) fn new(mode: u32, size: u64, mtime: u32) -> Self {
        Self { mode, size, mtime }
    }

    /// Build from the device's 10-element `os.stat` tuple, shifting the
    /// timestamp by the probed epoch offset.
    pub(crate) fn from_stat(stat: &Value, epoch_offset: i64) -> Result<Self> {
        let items = stat.items()?;
        if items.len() < 10 {
            return Err(Error::Protocol(format!(
                "stat tuple has {} fields, expected 10",
                items.len()
            )));
        }
        let mtime = items[8].as_int()?.saturating_add(epoch_offset).max(0);
        Ok(Self {
            mode: items[0].as_int()? as u32,
            size: items[6].as_int()?.max(0) as u64,
            mtime: mtime.min(i64::from(u32::MAX)) as u32,
        })
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.file_type().is_dir()
    }

    pub fn is_file(&self) -> bool {
        self.file_type().is_file()
    }

    /// Returns the size of the file
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns the last modification time
    pub fn modified(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(u64::from(self.mtime))
    }

    pub(crate) fn mtime_secs(&self) -> u32 {
        self.mtime
    }
}

impl From<&std::fs::Metadata> for Metadata {
    fn from(meta: &std::fs::Metadata) -> Self {
        let file_type = if meta.is_dir() {
            FileType::DIR
        } else if meta.is_file() {
            FileType::REG
        } else {
            FileType::empty()
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs().min(u64::from(u32::MAX)) as u32);
        Self {
            mode: file_type.bits(),
            size: meta.len(),
            mtime,
        }
    }
}
