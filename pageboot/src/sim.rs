//! In-memory bootloader for tests and dry runs.
//!
//! [`SimulatedDevice`] implements [`Port`] and answers request frames the way
//! the page bootloader firmware does:
//!
//! - only activate is accepted until the device is activated; everything
//!   else (and every unknown command) is answered with the error code
//! - set page address takes a 4-byte big-endian address
//! - read page always returns one full page
//! - write page programs the payload and pads a short page with `0xFF`
//!
//! Clones share the same device, so a test can keep one handle to inspect
//! flash contents while the flasher owns another. Closing a handle only
//! closes that handle.

use {
    crate::{
        error::Result,
        port::Port,
        protocol::frame::{
            Command, ERROR_CODE, HEADER_LEN, START_OF_FRAME, build_frame, declared_len,
        },
    },
    log::trace,
    std::{
        collections::{HashSet, VecDeque},
        io::{self, Read, Write},
        sync::{Arc, Mutex, MutexGuard},
        time::Duration,
    },
};

/// Version reported by the simulated firmware.
pub const SIM_VERSION: u8 = 1;

/// Flash layout and identity of a simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Device name.
    pub device_name: String,
    /// Module name.
    pub module_name: String,
    /// Flash size in KB.
    pub flash_kb: u16,
    /// Boot section size in bytes, at the top of flash.
    pub boot_size: u16,
    /// Page size in bytes.
    pub page_size: u16,
}

impl Default for DeviceProfile {
    /// An ATmega328P with a 2 KB boot section.
    fn default() -> Self {
        Self {
            device_name: "ATmega328P".into(),
            module_name: "pageboot-sim".into(),
            flash_kb: 32,
            boot_size: 2048,
            page_size: 128,
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    silent: bool,
    truncate_reads: Option<usize>,
    corrupt_echo: HashSet<u8>,
    error_reply: HashSet<u8>,
}

#[derive(Debug)]
struct DeviceState {
    profile: DeviceProfile,
    flash: Vec<u8>,
    active: bool,
    page_address: u32,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
    faults: Faults,
    writes: Vec<(u32, usize)>,
    requests: Vec<u8>,
    closes: usize,
}

/// Simulated page bootloader.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
    timeout: Duration,
    closed: bool,
}

impl SimulatedDevice {
    /// Create a device with erased flash.
    pub fn new(profile: DeviceProfile) -> Self {
        let flash = vec![0xFF; usize::from(profile.flash_kb) * 1024];
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                profile,
                flash,
                active: false,
                page_address: 0,
                rx: Vec::new(),
                tx: VecDeque::new(),
                faults: Faults::default(),
                writes: Vec::new(),
                requests: Vec::new(),
                closes: 0,
            })),
            timeout: Duration::ZERO,
            closed: false,
        }
    }

    /// Device with the given flash geometry and default names.
    pub fn with_geometry(flash_kb: u16, boot_size: u16, page_size: u16) -> Self {
        Self::new(DeviceProfile {
            flash_kb,
            boot_size,
            page_size,
            ..DeviceProfile::default()
        })
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        // A panicking test thread must not hide the device from the others.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Never answer any request.
    pub fn set_silent(&self, silent: bool) {
        self.lock().faults.silent = silent;
    }

    /// Return only the first `len` bytes of every page read.
    pub fn truncate_reads(&self, len: Option<usize>) {
        self.lock().faults.truncate_reads = len;
    }

    /// Answer `command` with a wrong echo byte.
    pub fn corrupt_echo(&self, command: Command) {
        self.lock().faults.corrupt_echo.insert(command.code());
    }

    /// Answer `command` with the error code.
    pub fn fail_command(&self, command: Command) {
        self.lock().faults.error_reply.insert(command.code());
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        self.lock().faults = Faults::default();
    }

    /// Overwrite flash contents starting at `address`.
    pub fn load(&self, address: usize, data: &[u8]) {
        let mut state = self.lock();
        let end = (address + data.len()).min(state.flash.len());
        if address < end {
            state.flash[address..end].copy_from_slice(&data[..end - address]);
        }
    }

    /// Snapshot of the whole flash.
    pub fn flash(&self) -> Vec<u8> {
        self.lock().flash.clone()
    }

    /// `(address, payload length)` of every page write, in order.
    pub fn writes(&self) -> Vec<(u32, usize)> {
        self.lock().writes.clone()
    }

    /// Command byte of every complete request received, in order.
    pub fn requests(&self) -> Vec<u8> {
        self.lock().requests.clone()
    }

    /// Whether the device is in programming mode.
    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// How many handles the host has closed.
    pub fn close_count(&self) -> usize {
        self.lock().closes
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new(DeviceProfile::default())
    }
}

impl DeviceState {
    /// Consume every complete request in `rx`.
    fn process(&mut self) {
        loop {
            let Some(start) = self.rx.iter().position(|&b| b == START_OF_FRAME) else {
                self.rx.clear();
                return;
            };
            self.rx.drain(..start);
            let Some(total) = declared_len(&self.rx) else {
                return;
            };
            if self.rx.len() < total {
                return;
            }
            let request: Vec<u8> = self.rx.drain(..total).collect();
            self.handle(request[1], &request[HEADER_LEN..]);
        }
    }

    fn handle(&mut self, code: u8, payload: &[u8]) {
        self.requests.push(code);
        if self.faults.silent {
            return;
        }

        let reply = if self.faults.error_reply.contains(&code) {
            None
        } else if code == Command::Activate.code() || self.active {
            self.execute(code, payload)
        } else {
            None
        };

        let response = match reply {
            Some(data) if self.faults.corrupt_echo.contains(&code) => build_frame(code, &data),
            Some(data) => build_frame(!code, &data),
            None => build_frame(ERROR_CODE, &[]),
        };
        trace!("sim: 0x{code:02X} -> {} bytes", response.len());
        self.tx.extend(response);
    }

    /// Response payload, or `None` to answer with the error code.
    fn execute(&mut self, code: u8, payload: &[u8]) -> Option<Vec<u8>> {
        let page = usize::from(self.profile.page_size);
        match Command::from_code(code)? {
            Command::Activate => {
                self.active = true;
                Some(Vec::new())
            },
            Command::Deactivate => {
                self.active = false;
                Some(Vec::new())
            },
            Command::Version => Some(vec![SIM_VERSION]),
            Command::DeviceName => Some(self.profile.device_name.as_bytes().to_vec()),
            Command::ModuleName => Some(self.profile.module_name.as_bytes().to_vec()),
            Command::BootSize => Some(self.profile.boot_size.to_be_bytes().to_vec()),
            Command::FlashSize => Some(self.profile.flash_kb.to_be_bytes().to_vec()),
            Command::PageSize => Some(self.profile.page_size.to_be_bytes().to_vec()),
            Command::SetPageAddress => {
                let bytes: [u8; 4] = payload.try_into().ok()?;
                self.page_address = u32::from_be_bytes(bytes);
                Some(Vec::new())
            },
            Command::ReadPage => {
                let start = self.page_address as usize;
                let mut data: Vec<u8> = (start..start + page)
                    .map(|a| self.flash.get(a).copied().unwrap_or(0xFF))
                    .collect();
                if let Some(len) = self.faults.truncate_reads {
                    data.truncate(len);
                }
                Some(data)
            },
            Command::WritePage => {
                let start = self.page_address as usize;
                let writable = self.flash.len().saturating_sub(usize::from(self.profile.boot_size));
                if payload.len() > page || start + page > writable {
                    return None;
                }
                self.flash[start..start + payload.len()].copy_from_slice(payload);
                self.flash[start + payload.len()..start + page].fill(0xFF);
                self.writes.push((self.page_address, payload.len()));
                Some(Vec::new())
            },
        }
    }
}

impl Read for SimulatedDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.tx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.tx.len());
        for (dst, src) in buf.iter_mut().zip(state.tx.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for SimulatedDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        let mut state = self.lock();
        state.rx.extend_from_slice(buf);
        state.process();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for SimulatedDevice {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.rx.clear();
        state.tx.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated"
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.lock().closes += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(dev: &mut SimulatedDevice, command: u8, payload: &[u8]) -> Vec<u8> {
        dev.write_all(&build_frame(command, payload)).unwrap();
        let mut buf = [0u8; 1024];
        let n = dev.read(&mut buf).unwrap();
        buf[..n].to_vec()
    }

    #[test]
    fn test_refuses_until_activated() {
        let mut dev = SimulatedDevice::default();
        assert_eq!(exchange(&mut dev, 0x04, &[]), vec![0x01, 0xFF, 0x00, 0x00]);
        assert_eq!(exchange(&mut dev, 0x02, &[]), vec![0x01, 0xFD, 0x00, 0x00]);
        assert_eq!(exchange(&mut dev, 0x04, &[]), vec![0x01, 0xFB, 0x00, 0x01, SIM_VERSION]);
        assert!(dev.is_active());
    }

    #[test]
    fn test_unknown_command_is_refused() {
        let mut dev = SimulatedDevice::default();
        exchange(&mut dev, 0x02, &[]);
        assert_eq!(exchange(&mut dev, 0x40, &[]), vec![0x01, 0xFF, 0x00, 0x00]);
    }

    #[test]
    fn test_short_write_pads_page() {
        let mut dev = SimulatedDevice::with_geometry(1, 256, 16);
        dev.load(0, &[0x00; 32]);
        exchange(&mut dev, 0x02, &[]);
        exchange(&mut dev, 0x30, &16u32.to_be_bytes());
        assert_eq!(exchange(&mut dev, 0x32, &[0xAA; 4]), vec![0x01, 0xCD, 0x00, 0x00]);

        let flash = dev.flash();
        assert_eq!(&flash[16..20], &[0xAA; 4]);
        assert_eq!(&flash[20..32], &[0xFF; 12]);
        assert_eq!(&flash[..16], &[0x00; 16]);
        assert_eq!(dev.writes(), vec![(16, 4)]);
    }

    #[test]
    fn test_boot_section_is_protected() {
        let mut dev = SimulatedDevice::with_geometry(1, 256, 256);
        exchange(&mut dev, 0x02, &[]);
        exchange(&mut dev, 0x30, &768u32.to_be_bytes());
        assert_eq!(exchange(&mut dev, 0x32, &[0x00; 8]), vec![0x01, 0xFF, 0x00, 0x00]);
    }

    #[test]
    fn test_read_returns_full_page() {
        let mut dev = SimulatedDevice::with_geometry(1, 0, 8);
        dev.load(8, &[1, 2, 3]);
        exchange(&mut dev, 0x02, &[]);
        exchange(&mut dev, 0x30, &8u32.to_be_bytes());
        let response = exchange(&mut dev, 0x31, &[]);
        assert_eq!(&response[..4], &[0x01, 0xCE, 0x00, 0x08]);
        assert_eq!(&response[4..], &[1, 2, 3, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_faults() {
        let mut dev = SimulatedDevice::default();
        dev.corrupt_echo(Command::Activate);
        assert_eq!(exchange(&mut dev, 0x02, &[]), vec![0x01, 0x02, 0x00, 0x00]);

        dev.fail_command(Command::Version);
        assert_eq!(exchange(&mut dev, 0x04, &[]), vec![0x01, 0xFF, 0x00, 0x00]);

        dev.set_silent(true);
        dev.write_all(&build_frame(0x02, &[])).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(
            dev.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );
        assert_eq!(dev.requests(), vec![0x02, 0x04, 0x02]);
    }

    #[test]
    fn test_request_split_across_writes() {
        let mut dev = SimulatedDevice::default();
        let frame = build_frame(0x02, &[]);
        dev.write_all(&frame[..2]).unwrap();
        let mut buf = [0u8; 8];
        assert!(dev.read(&mut buf).is_err());
        dev.write_all(&frame[2..]).unwrap();
        assert_eq!(dev.read(&mut buf).unwrap(), 4);
    }
}
