//! The boundary with the serial channel.
//!
//! The physical transport is supplied by the embedder: anything that can
//! push bytes at the device and collect bytes until a sentinel appears can
//! drive a board. Test suites plug in simulated devices through the same
//! trait.

use std::time::Duration;

use crate::error::Result;

/// A line-oriented, single-request command channel to the device.
///
/// Implementations report failures as [`Error::ConnectionLost`] for I/O
/// faults and [`Error::Unresponsive`] when `timeout` elapses before the
/// sentinel is seen. Neither is retried by the layers above; the connection
/// must be re-established explicitly.
///
/// [`Error::ConnectionLost`]: crate::Error::ConnectionLost
/// [`Error::Unresponsive`]: crate::Error::Unresponsive
pub trait Transport: Send {
    /// Write raw bytes to the device.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read until `sentinel` has been received, returning everything read
    /// including the sentinel itself.
    fn read_until(&mut self, sentinel: &[u8], timeout: Duration) -> Result<Vec<u8>>;

    /// Reset the channel to a known state, discarding any buffered bytes.
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the channel. Further calls are connection-lost errors.
    fn close(&mut self) -> Result<()>;
}

/// Expand an abbreviated serial device name to the platform form:
/// `u0` becomes `/dev/ttyUSB0`, `a1` becomes `/dev/ttyACM1` and `c3`
/// becomes `COM3`. Full names pass through unchanged.
pub fn device_long_name(device: &str) -> String {
    for (short, long) in [("u", "/dev/ttyUSB"), ("a", "/dev/ttyACM"), ("c", "COM")] {
        if let Some(digits) = device.strip_prefix(short) {
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                return format!("{long}{digits}");
            }
        }
    }
    device.to_string()
}

/// Inverse of [`device_long_name`].
pub fn device_short_name(device: &str) -> String {
    for (long, short) in [("/dev/ttyUSB", "u"), ("/dev/ttyACM", "a"), ("COM", "c")] {
        if let Some(digits) = device.strip_prefix(long) {
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                return format!("{short}{digits}");
            }
        }
    }
    device.to_string()
}
