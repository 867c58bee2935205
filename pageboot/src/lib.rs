//! # pageboot
//!
//! A library for programming microcontrollers through a page-based serial
//! bootloader.
//!
//! This crate provides:
//!
//! - the bootloader wire protocol (framing, one's-complement echo check,
//!   response timeout)
//! - a hex record codec for firmware images
//! - a flasher that reads, writes and verifies whole images page by page
//! - an in-memory simulated bootloader for tests and dry runs
//!
//! ## Features
//!
//! - `native` (default): serial port support via the `serialport` crate
//! - `serde`: `Serialize` for device info and discovered ports
//!
//! ## Example
//!
//! ```rust
//! use pageboot::{FirmwareImage, Flasher, FlasherConfig, SimulatedDevice, image::hex};
//!
//! fn main() -> pageboot::Result<()> {
//!     let image = hex::decode(":0B0010000C0102030405060708090AA2\n:00000001FF\n")?
//!         .expect("one data record");
//!
//!     let device = SimulatedDevice::with_geometry(2, 512, 256);
//!     let mut flasher = Flasher::new(FlasherConfig::default());
//!     flasher.connect_port(device)?;
//!     flasher.write_flash(&image, true, &mut |event| println!("{event:?}"))?;
//!     flasher.finish();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod flasher;
pub mod host;
pub mod image;
pub mod port;
pub mod progress;
pub mod protocol;
pub mod sim;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    error::{Error, Result},
    flasher::{ConnectionState, DeviceInfo, Flasher, FlasherConfig},
    host::{BridgeKind, DetectedPort, discover_ports},
    image::FirmwareImage,
    port::{Port, SerialConfig},
    progress::{CancelToken, Phase, ProgressEvent, ProgressForwarder},
    protocol::{Command, EngineConfig, ProtocolEngine, is_echo_of},
    sim::{DeviceProfile, SimulatedDevice},
};
