//! Byte transport between the host and the bootloader.
//!
//! The protocol engine talks to anything implementing [`Port`]: an open
//! duplex stream whose reads give up quickly when the device is silent.
//! Two implementations ship with the crate:
//!
//! - `NativePort` (feature `native`): a serial port through `serialport`
//! - [`crate::sim::SimulatedDevice`]: an in-memory bootloader
//!
//! ```rust,no_run
//! use pageboot::port::{Port, SerialConfig};
//!
//! fn ping<P: Port>(port: &mut P) -> pageboot::Result<usize> {
//!     // Version request: start byte, command, zero-length payload.
//!     port.write_all_bytes(&[0x01, 0x04, 0x00, 0x00])?;
//!     let mut reply = [0u8; 8];
//!     Ok(port.read(&mut reply)?)
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use crate::error::Result;

/// How to open a serial port.
///
/// Framing is always 8 data bits, no parity, one stop bit and no flow
/// control; only the rate and the read timeout vary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Device path or name, e.g. "/dev/ttyUSB0" or "COM3".
    pub port_name: String,
    /// Line rate.
    pub baud_rate: u32,
    /// Longest a single read may block before reporting no data.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl SerialConfig {
    /// Configuration for `port_name` at `baud_rate`.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Replace the read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Read timeout of a freshly opened port.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Default baud rate of the bootloader UART.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Baud rates offered to the operator.
pub const STANDARD_BAUDS: &[u32] = &[
    2400, 4800, 9600, 14400, 19200, 28800, 38400, 57600, 76800, 115_200, 230_400, 250_000,
    500_000, 1_000_000,
];

/// Baud rate used when a stored preference is not a standard rate.
pub const FALLBACK_BAUD: u32 = 19200;

/// Duplex byte stream to a bootloader.
///
/// A read with nothing to deliver returns `Ok(0)` or fails with a kind
/// accepted by [`is_no_data`]; it must not block much longer than
/// [`Port::timeout`].
pub trait Port: Read + Write + Send {
    /// Change how long one read may block.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// How long one read may block.
    fn timeout(&self) -> Duration;

    /// Drop unread input and unsent output.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Name shown in logs.
    fn name(&self) -> &str;

    /// Release the underlying device; later I/O fails with `NotConnected`.
    fn close(&mut self) -> Result<()>;

    /// Write the whole buffer and flush it.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.write_all(buf)?;
        self.flush()?;
        Ok(())
    }
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        (**self).set_timeout(timeout)
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn clear_buffers(&mut self) -> Result<()> {
        (**self).clear_buffers()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Whether a read error only means "no input available yet".
pub fn is_no_data(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

#[cfg(feature = "native")]
pub use native::NativePort;
