//! Whole-image read, write and verify over the page protocol.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pageboot::{FirmwareImage, Flasher, FlasherConfig, SerialConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("app.hex")?.ok_or("no data records")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let mut flasher = Flasher::new(FlasherConfig::default());
//!         let info = flasher.connect_serial(&SerialConfig::new("/dev/ttyUSB0", 115_200))?;
//!         println!("Connected to {}", info.device_name_lossy());
//!
//!         flasher.write_flash(&image, true, &mut |event| println!("{event:?}"))?;
//!         flasher.finish();
//!     }
//!
//!     Ok(())
//! }
//! ```

use {
    crate::{
        error::{Error, Result},
        image::{ADDRESS_SPACE, FirmwareImage},
        port::Port,
        progress::{CancelToken, Phase, ProgressEvent, ProgressFn},
        protocol::{
            engine::{EngineConfig, ProtocolEngine},
            frame::{Command, address_payload},
        },
    },
    log::{debug, info, warn},
    std::{borrow::Cow, fmt, thread, time::Duration},
};

/// Time the device needs to enter bootloader mode after the port opens.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Identity and flash geometry reported by the bootloader.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceInfo {
    /// Bootloader version, 0 when not reported.
    pub version: u8,
    /// Device name, possibly empty.
    #[cfg_attr(feature = "serde", serde(serialize_with = "lossy_text"))]
    pub device_name: Vec<u8>,
    /// Module name, possibly empty.
    #[cfg_attr(feature = "serde", serde(serialize_with = "lossy_text"))]
    pub module_name: Vec<u8>,
    /// Boot section size in bytes.
    pub boot_size: u16,
    /// Flash size in KB.
    pub flash_kb: u16,
    /// Page size in bytes.
    pub page_size: u16,
}

/// Names are raw bytes on the wire but text in serialized output.
#[cfg(feature = "serde")]
fn lossy_text<S>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

impl DeviceInfo {
    /// Device name as text.
    pub fn device_name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.device_name)
    }

    /// Module name as text.
    pub fn module_name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.module_name)
    }

    /// Flash size in bytes.
    pub fn flash_bytes(&self) -> usize {
        usize::from(self.flash_kb) * 1024
    }

    /// Flash available to applications: everything but the boot section.
    pub fn usable_bytes(&self) -> usize {
        self.flash_bytes()
            .saturating_sub(usize::from(self.boot_size))
    }

    /// Whole pages in flash, 0 for a zero page size.
    pub fn page_count(&self) -> usize {
        match self.page_size {
            0 => 0,
            page => self.flash_bytes() / usize::from(page),
        }
    }

    fn page_bytes(&self) -> Result<usize> {
        match self.page_size {
            0 => Err(Error::InvalidGeometry(
                "device reported a page size of 0".into(),
            )),
            page => Ok(usize::from(page)),
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}), bootloader v{}, flash {} KB, boot {} bytes, page {} bytes",
            self.device_name_lossy(),
            self.module_name_lossy(),
            self.version,
            self.flash_kb,
            self.boot_size,
            self.page_size
        )
    }
}

/// Flasher timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlasherConfig {
    /// Pause between opening the port and sending activate.
    pub settle_delay: Duration,
    /// Request/response timing.
    pub engine: EngineConfig,
}

impl Default for FlasherConfig {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            engine: EngineConfig::default(),
        }
    }
}

impl FlasherConfig {
    /// Set the settle delay.
    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the request/response timing.
    #[must_use]
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No bootloader session.
    Disconnected,
    /// Activation in progress.
    Connecting,
    /// Activated; device info is known.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        })
    }
}

/// Page bootloader flasher.
///
/// Owns the protocol engine (and through it the port) while connected. Any
/// failure inside a page loop drops the connection; reconnect before retrying.
pub struct Flasher<P: Port> {
    config: FlasherConfig,
    state: ConnectionState,
    engine: Option<ProtocolEngine<P>>,
    info: Option<DeviceInfo>,
    cancel: CancelToken,
}

impl<P: Port> Flasher<P> {
    /// Create a disconnected flasher.
    pub fn new(config: FlasherConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            engine: None,
            info: None,
            cancel: CancelToken::new(),
        }
    }

    /// Use `token` to cancel page loops.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token checked at every page boundary.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Timing in use.
    pub fn config(&self) -> &FlasherConfig {
        &self.config
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a bootloader session is active.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Device info of the active session.
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    /// Open a port and activate the bootloader.
    ///
    /// Any failure, including a port that cannot be opened, is reported as
    /// [`Error::ConnectFailed`] and leaves the flasher disconnected.
    ///
    /// A new session clears any earlier cancellation request.
    pub fn connect<F>(&mut self, open: F) -> Result<&DeviceInfo>
    where
        F: FnOnce() -> Result<P>,
    {
        if self.engine.is_some() {
            self.disconnect();
        }
        self.info = None;
        self.cancel.reset();
        self.state = ConnectionState::Connecting;

        match Self::activate(&self.config, open) {
            Ok((engine, info)) => {
                info!("Connected: {info}");
                self.engine = Some(engine);
                self.state = ConnectionState::Connected;
                Ok(self.info.insert(info))
            },
            Err(e) => {
                warn!("Connect failed: {e}");
                self.state = ConnectionState::Disconnected;
                Err(Error::ConnectFailed(Box::new(e)))
            },
        }
    }

    /// Activate over an already-open port.
    pub fn connect_port(&mut self, port: P) -> Result<&DeviceInfo> {
        self.connect(move || Ok(port))
    }

    fn activate<F>(config: &FlasherConfig, open: F) -> Result<(ProtocolEngine<P>, DeviceInfo)>
    where
        F: FnOnce() -> Result<P>,
    {
        let mut port = open()?;
        debug!("Opened {}", port.name());
        // Reads must return within one poll interval.
        if port.timeout() > config.engine.poll_interval {
            port.set_timeout(config.engine.poll_interval)?;
        }

        if !config.settle_delay.is_zero() {
            debug!(
                "Waiting {}ms for the bootloader",
                config.settle_delay.as_millis()
            );
            thread::sleep(config.settle_delay);
        }
        // Whatever the board printed while resetting is not a response.
        port.clear_buffers()?;

        let mut engine = ProtocolEngine::with_config(port, config.engine);
        engine.checked(Command::Activate, &[])?;
        let info = DeviceInfo {
            version: engine.version()?,
            device_name: engine.device_name()?,
            module_name: engine.module_name()?,
            boot_size: engine.boot_size()?,
            flash_kb: engine.flash_size()?,
            page_size: engine.page_size()?,
        };
        Ok((engine, info))
    }

    /// Read the whole flash as an image at address 0.
    ///
    /// Partial data is never returned: any failure aborts the read.
    pub fn read_flash(&mut self, progress: &mut ProgressFn<'_>) -> Result<FirmwareImage> {
        let info = self.session()?;
        let page = info.page_bytes()?;
        let flash = info.flash_bytes();
        if flash > ADDRESS_SPACE as usize {
            return Err(Error::InvalidGeometry(format!(
                "{} KB of flash exceeds the 64 KB hex address space",
                info.flash_kb
            )));
        }

        let total = flash / page;
        info!("Reading {flash} bytes of flash in {total} pages");
        let data = self.read_pages(Phase::Read, 0, total, page, progress)?;
        FirmwareImage::new(0, data)
    }

    /// Program `image`, then read it back if `verify` is set.
    ///
    /// An image larger than the flash outside the boot section is rejected
    /// before any page is sent. A failure part way leaves the device partially
    /// programmed.
    pub fn write_flash(
        &mut self,
        image: &FirmwareImage,
        verify: bool,
        progress: &mut ProgressFn<'_>,
    ) -> Result<()> {
        let info = self.session()?;
        let page = info.page_bytes()?;
        let available = info.usable_bytes();
        if image.len() > available {
            return Err(Error::ImageTooLarge {
                size: image.len(),
                available,
            });
        }

        let total = image.page_count(page);
        info!(
            "Writing {} bytes at 0x{:04X} in {total} pages",
            image.len(),
            image.start_address()
        );
        progress(ProgressEvent::Begin {
            phase: Phase::Write,
            total,
        });

        for (i, chunk) in image.data().chunks(page).enumerate() {
            let index = i + 1;
            let address = image.start_address() + (i * page) as u32;
            debug!(
                "Writing page {index}/{total} at 0x{address:04X} ({} bytes)",
                chunk.len()
            );
            if let Err(e) = self
                .check_cancel()
                .and_then(|()| self.write_page_at(address, chunk))
            {
                progress(ProgressEvent::Reset { phase: Phase::Write });
                self.disconnect();
                return Err(match e {
                    Error::Cancelled => Error::Cancelled,
                    e => Error::WriteFailed {
                        page: index,
                        total,
                        source: Box::new(e),
                    },
                });
            }
            progress(ProgressEvent::Advance {
                phase: Phase::Write,
                current: index,
                total,
            });
        }
        info!("Wrote {total} pages");

        if verify {
            self.verify(image, progress)?;
        }
        Ok(())
    }

    /// Read back the pages covering `image` and compare byte for byte.
    pub fn verify(&mut self, image: &FirmwareImage, progress: &mut ProgressFn<'_>) -> Result<()> {
        let page = self.session()?.page_bytes()?;
        let total = image.page_count(page);
        info!("Verifying {} bytes in {total} pages", image.len());

        let read = self.read_pages(Phase::Verify, image.start_address(), total, page, progress)?;
        compare(image, &read)?;
        info!("Verify OK");
        Ok(())
    }

    /// Drop the session and release the port.
    pub fn disconnect(&mut self) {
        if let Some(engine) = self.engine.take() {
            if let Err(e) = engine.close() {
                debug!("Error closing port: {e}");
            }
        }
        self.info = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Leave programming mode, then disconnect.
    ///
    /// Deactivation is best effort; failures are only logged.
    pub fn finish(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            match engine.deactivate() {
                Ok(true) => debug!("Bootloader deactivated"),
                Ok(false) => warn!("Deactivate was not acknowledged"),
                Err(e) => warn!("Deactivate failed: {e}"),
            }
        }
        self.disconnect();
    }

    fn session(&self) -> Result<DeviceInfo> {
        match (&self.engine, &self.info) {
            (Some(_), Some(info)) => Ok(info.clone()),
            _ => Err(Error::NotConnected),
        }
    }

    fn engine_mut(&mut self) -> Result<&mut ProtocolEngine<P>> {
        self.engine.as_mut().ok_or(Error::NotConnected)
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            info!("Cancelled at page boundary");
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn write_page_at(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let engine = self.engine_mut()?;
        engine.checked(Command::SetPageAddress, &address_payload(address))?;
        engine.checked(Command::WritePage, data)?;
        Ok(())
    }

    fn read_page_at(&mut self, address: u32) -> Result<Vec<u8>> {
        let engine = self.engine_mut()?;
        engine.checked(Command::SetPageAddress, &address_payload(address))?;
        Ok(engine.checked(Command::ReadPage, &[])?.into_payload())
    }

    fn read_pages(
        &mut self,
        phase: Phase,
        start: u32,
        total: usize,
        page: usize,
        progress: &mut ProgressFn<'_>,
    ) -> Result<Vec<u8>> {
        progress(ProgressEvent::Begin { phase, total });
        let mut data = Vec::with_capacity(total * page);

        for index in 1..=total {
            let address = start + ((index - 1) * page) as u32;
            debug!("Reading page {index}/{total} at 0x{address:04X}");
            match self
                .check_cancel()
                .and_then(|()| self.read_page_at(address))
            {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(e) => {
                    progress(ProgressEvent::Reset { phase });
                    self.disconnect();
                    return Err(match e {
                        Error::Cancelled => Error::Cancelled,
                        e => Error::ReadFailed {
                            page: index,
                            total,
                            source: Box::new(e),
                        },
                    });
                },
            }
            progress(ProgressEvent::Advance {
                phase,
                current: index,
                total,
            });
        }
        Ok(data)
    }
}

#[cfg(feature = "native")]
impl Flasher<crate::port::NativePort> {
    /// Open a serial port and activate the bootloader.
    pub fn connect_serial(&mut self, config: &crate::port::SerialConfig) -> Result<&DeviceInfo> {
        self.connect(|| crate::port::NativePort::open(config))
    }
}

/// Compare read-back data against the written image.
fn compare(image: &FirmwareImage, read: &[u8]) -> Result<()> {
    if read.len() < image.len() {
        return Err(Error::VerifyLengthMismatch {
            written: image.len(),
            read: read.len(),
        });
    }
    match image
        .data()
        .iter()
        .zip(read)
        .position(|(expected, actual)| expected != actual)
    {
        Some(offset) => Err(Error::VerifyMismatch {
            address: image.start_address() + offset as u32,
            expected: image.data()[offset],
            actual: read[offset],
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedDevice;

    fn quick() -> FlasherConfig {
        FlasherConfig::default()
            .with_settle_delay(Duration::ZERO)
            .with_engine(
                EngineConfig::default()
                    .with_response_timeout(Duration::from_millis(50))
                    .with_poll_interval(Duration::from_millis(5)),
            )
    }

    fn connected(device: &SimulatedDevice) -> Flasher<SimulatedDevice> {
        let mut flasher = Flasher::new(quick());
        flasher.connect_port(device.clone()).unwrap();
        flasher
    }

    #[test]
    fn test_connect_reads_device_info() {
        let device = SimulatedDevice::with_geometry(2, 512, 256);
        let mut flasher = Flasher::new(quick());
        let info = flasher.connect_port(device.clone()).unwrap().clone();

        assert_eq!(info.version, 1);
        assert_eq!(info.device_name_lossy(), "ATmega328P");
        assert_eq!(info.flash_kb, 2);
        assert_eq!(info.boot_size, 512);
        assert_eq!(info.page_size, 256);
        assert_eq!(info.usable_bytes(), 1536);
        assert_eq!(info.page_count(), 8);
        assert_eq!(flasher.state(), ConnectionState::Connected);
        assert!(device.is_active());
    }

    #[test]
    fn test_connect_open_failure() {
        let mut flasher: Flasher<SimulatedDevice> = Flasher::new(quick());
        let err = flasher
            .connect(|| Err(Error::Config("no port".into())))
            .unwrap_err();
        assert!(matches!(err, Error::ConnectFailed(inner) if matches!(*inner, Error::Config(_))));
        assert_eq!(flasher.state(), ConnectionState::Disconnected);
        assert!(flasher.device_info().is_none());
    }

    #[test]
    fn test_connect_rejected_activation() {
        let device = SimulatedDevice::default();
        device.corrupt_echo(Command::Activate);
        let mut flasher = Flasher::new(quick());
        let err = flasher.connect_port(device).unwrap_err();
        assert!(matches!(
            err,
            Error::ConnectFailed(inner) if matches!(*inner, Error::ProtocolMismatch { .. })
        ));
        assert!(!flasher.is_connected());
    }

    #[test]
    fn test_missing_queries_default_to_zero() {
        let device = SimulatedDevice::default();
        device.corrupt_echo(Command::ModuleName);
        device.corrupt_echo(Command::BootSize);
        let flasher = connected(&device);
        let info = flasher.device_info().unwrap();
        assert!(info.module_name.is_empty());
        assert_eq!(info.boot_size, 0);
        assert_eq!(info.page_size, 128);
    }

    #[test]
    fn test_operations_require_connection() {
        let mut flasher: Flasher<SimulatedDevice> = Flasher::new(quick());
        let image = FirmwareImage::new(0, vec![0; 4]).unwrap();
        assert!(matches!(
            flasher.write_flash(&image, false, &mut |_| {}),
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            flasher.read_flash(&mut |_| {}),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_zero_page_size_is_invalid_geometry() {
        let device = SimulatedDevice::with_geometry(1, 0, 0);
        let mut flasher = connected(&device);
        let image = FirmwareImage::new(0, vec![0; 4]).unwrap();
        assert!(matches!(
            flasher.write_flash(&image, false, &mut |_| {}),
            Err(Error::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_read_flash_refuses_large_geometry() {
        let device = SimulatedDevice::with_geometry(128, 4096, 256);
        let mut flasher = connected(&device);
        assert!(matches!(
            flasher.read_flash(&mut |_| {}),
            Err(Error::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_write_uses_start_address_and_offsets() {
        let device = SimulatedDevice::with_geometry(1, 256, 16);
        let mut flasher = connected(&device);
        let data: Vec<u8> = (0..40).collect();
        let image = FirmwareImage::new(0x40, data.clone()).unwrap();

        flasher.write_flash(&image, true, &mut |_| {}).unwrap();

        assert_eq!(device.writes(), vec![(0x40, 16), (0x50, 16), (0x60, 8)]);
        assert_eq!(&device.flash()[0x40..0x68], data.as_slice());
    }

    #[test]
    fn test_verify_mismatch_reports_address() {
        let device = SimulatedDevice::with_geometry(1, 256, 16);
        let mut flasher = connected(&device);
        let image = FirmwareImage::new(0, vec![0x55; 32]).unwrap();
        flasher.write_flash(&image, false, &mut |_| {}).unwrap();

        device.load(21, &[0x54]);
        let err = flasher.verify(&image, &mut |_| {}).unwrap_err();
        assert!(matches!(
            err,
            Error::VerifyMismatch {
                address: 21,
                expected: 0x55,
                actual: 0x54
            }
        ));
        assert!(flasher.is_connected());
    }

    #[test]
    fn test_write_failure_disconnects() {
        let device = SimulatedDevice::with_geometry(1, 256, 16);
        let mut flasher = connected(&device);
        device.fail_command(Command::WritePage);
        let image = FirmwareImage::new(0, vec![0x01; 20]).unwrap();

        let mut events = Vec::new();
        let err = flasher
            .write_flash(&image, false, &mut |e| events.push(e))
            .unwrap_err();
        assert!(matches!(err, Error::WriteFailed { page: 1, total: 2, .. }));
        assert_eq!(
            events.last(),
            Some(&ProgressEvent::Reset { phase: Phase::Write })
        );
        assert_eq!(flasher.state(), ConnectionState::Disconnected);
        assert!(flasher.device_info().is_none());
    }

    #[test]
    fn test_cancel_stops_at_page_boundary() {
        let device = SimulatedDevice::with_geometry(1, 256, 16);
        let mut flasher = connected(&device);
        let token = flasher.cancel_token().clone();
        let image = FirmwareImage::new(0, vec![0x01; 48]).unwrap();

        let err = flasher
            .write_flash(&image, false, &mut |e| {
                if matches!(e, ProgressEvent::Advance { current: 1, .. }) {
                    token.cancel();
                }
            })
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(device.writes().len(), 1);
        assert!(!flasher.is_connected());
    }

    #[test]
    fn test_reconnect_after_cancel_writes_again() {
        let device = SimulatedDevice::with_geometry(1, 256, 16);
        let mut flasher = connected(&device);
        let token = flasher.cancel_token().clone();
        let image = FirmwareImage::new(0, vec![0x3C; 48]).unwrap();

        let err = flasher
            .write_flash(&image, false, &mut |e| {
                if matches!(e, ProgressEvent::Advance { current: 1, .. }) {
                    token.cancel();
                }
            })
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        flasher.connect_port(device.clone()).unwrap();
        assert!(!token.is_cancelled());
        flasher.write_flash(&image, true, &mut |_| {}).unwrap();
        assert_eq!(device.writes().len(), 4);
        assert_eq!(&device.flash()[..48], image.data());
    }

    #[test]
    fn test_finish_deactivates() {
        let device = SimulatedDevice::default();
        let mut flasher = connected(&device);
        flasher.finish();
        assert!(!device.is_active());
        assert_eq!(device.close_count(), 1);
        assert_eq!(flasher.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_compare_prefers_length_mismatch() {
        let image = FirmwareImage::new(0, vec![1, 2, 3, 4]).unwrap();
        assert!(matches!(
            compare(&image, &[9, 9]),
            Err(Error::VerifyLengthMismatch { written: 4, read: 2 })
        ));
        assert!(compare(&image, &[1, 2, 3, 4, 0xFF]).is_ok());
    }
}
