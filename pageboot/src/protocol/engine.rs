//! Request/response engine for the page bootloader.
//!
//! Every device operation is one frame out, one frame back. The engine owns
//! the port for its whole lifetime; there is never more than one request in
//! flight.

use {
    crate::{
        error::{Error, Result},
        port::{Port, is_no_data},
        protocol::frame::{Command, Frame, FrameAssembler, address_payload, build_frame, dump},
    },
    byteorder::{BigEndian, ByteOrder},
    log::{debug, trace, warn},
    std::{
        thread,
        time::{Duration, Instant},
    },
};

/// Default time to wait for a complete response frame.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default pause between polls of an idle port.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timing of the request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long to wait for a complete response to one request.
    pub response_timeout: Duration,
    /// Pause between polls while no input is available.
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Set the response timeout.
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Protocol engine bound to one port.
pub struct ProtocolEngine<P: Port> {
    port: P,
    config: EngineConfig,
}

impl<P: Port> ProtocolEngine<P> {
    /// Bind to an open port with default timing. No bytes are exchanged.
    pub fn new(port: P) -> Self {
        Self::with_config(port, EngineConfig::default())
    }

    /// Bind to an open port with custom timing.
    pub fn with_config(port: P, config: EngineConfig) -> Self {
        Self { port, config }
    }

    /// Timing in use.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the engine and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Release the port.
    pub fn close(mut self) -> Result<()> {
        self.port.close()
    }

    /// Send one request and wait for its response frame.
    ///
    /// Fails with [`Error::Timeout`] when no complete frame arrives in time and
    /// with [`Error::DeviceError`] when the device answers with the error code.
    /// The echoed command byte is *not* checked here; callers decide how to
    /// treat a mismatch.
    pub fn send_receive(&mut self, command: Command, payload: &[u8]) -> Result<Frame> {
        let request = build_frame(command.code(), payload);
        trace!("TX -> {}", dump(&request));
        self.port.write_all_bytes(&request)?;

        let frame = self.receive(command)?;
        trace!("RX <- {}", dump(frame.as_bytes()));

        if frame.is_error() {
            return Err(Error::DeviceError { command });
        }
        Ok(frame)
    }

    fn receive(&mut self, command: Command) -> Result<Frame> {
        let start = Instant::now();
        let mut assembler = FrameAssembler::new();
        let mut buf = [0u8; 512];

        loop {
            let poll_start = Instant::now();
            let received = match self.port.read(&mut buf) {
                Ok(n) => n,
                Err(e) if is_no_data(&e) => 0,
                Err(e) => return Err(Error::Io(e)),
            };
            if received > 0 {
                assembler.push(&buf[..received]);
                if let Some(frame) = assembler.take_frame() {
                    if assembler.discarded() > 0 {
                        debug!(
                            "Skipped {} bytes of noise before the response",
                            assembler.discarded()
                        );
                    }
                    return Ok(frame);
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= self.config.response_timeout {
                return Err(Error::Timeout {
                    command,
                    waited: elapsed,
                    received: assembler.len(),
                });
            }

            if received == 0 {
                let spent = poll_start.elapsed();
                if spent < self.config.poll_interval {
                    let remaining = self.config.response_timeout - elapsed;
                    thread::sleep((self.config.poll_interval - spent).min(remaining));
                }
            }
        }
    }

    /// Like [`send_receive`](Self::send_receive), but a wrong echo is an
    /// [`Error::ProtocolMismatch`].
    pub fn checked(&mut self, command: Command, payload: &[u8]) -> Result<Frame> {
        let frame = self.send_receive(command, payload)?;
        if !frame.is_echo_of(command) {
            return Err(Error::ProtocolMismatch {
                command,
                response: frame.command(),
            });
        }
        Ok(frame)
    }

    /// Send a command whose only result is the echo check.
    fn acknowledged(&mut self, command: Command, payload: &[u8]) -> Result<bool> {
        let frame = self.send_receive(command, payload)?;
        let ok = frame.is_echo_of(command);
        if !ok {
            debug!(
                "{command} answered with 0x{:02X} instead of 0x{:02X}",
                frame.command(),
                command.echo()
            );
        }
        Ok(ok)
    }

    /// Payload of a query response, or `None` when the echo does not match.
    fn query(&mut self, command: Command) -> Result<Option<Vec<u8>>> {
        let frame = self.send_receive(command, &[])?;
        if frame.is_echo_of(command) {
            Ok(Some(frame.into_payload()))
        } else {
            warn!(
                "{command} not available (response 0x{:02X})",
                frame.command()
            );
            Ok(None)
        }
    }

    fn query_u16(&mut self, command: Command) -> Result<u16> {
        match self.query(command)? {
            Some(payload) if payload.len() == 2 => Ok(BigEndian::read_u16(&payload)),
            Some(payload) => {
                warn!(
                    "{command} returned {} bytes, expected 2; treating as 0",
                    payload.len()
                );
                Ok(0)
            },
            None => Ok(0),
        }
    }

    /// Put the bootloader into programming mode.
    pub fn activate(&mut self) -> Result<bool> {
        self.acknowledged(Command::Activate, &[])
    }

    /// Leave programming mode.
    pub fn deactivate(&mut self) -> Result<bool> {
        self.acknowledged(Command::Deactivate, &[])
    }

    /// Bootloader version, 0 when not reported.
    pub fn version(&mut self) -> Result<u8> {
        match self.query(Command::Version)? {
            Some(payload) if payload.len() == 1 => Ok(payload[0]),
            _ => Ok(0),
        }
    }

    /// Device name, empty when not reported.
    pub fn device_name(&mut self) -> Result<Vec<u8>> {
        Ok(self.query(Command::DeviceName)?.unwrap_or_default())
    }

    /// Module name, empty when not reported.
    pub fn module_name(&mut self) -> Result<Vec<u8>> {
        Ok(self.query(Command::ModuleName)?.unwrap_or_default())
    }

    /// Boot section size in bytes, 0 when not reported.
    pub fn boot_size(&mut self) -> Result<u16> {
        self.query_u16(Command::BootSize)
    }

    /// Flash size in KB, 0 when not reported.
    pub fn flash_size(&mut self) -> Result<u16> {
        self.query_u16(Command::FlashSize)
    }

    /// Page size in bytes, 0 when not reported.
    pub fn page_size(&mut self) -> Result<u16> {
        self.query_u16(Command::PageSize)
    }

    /// Select the page for the next read or write.
    pub fn set_page_address(&mut self, address: u32) -> Result<bool> {
        self.acknowledged(Command::SetPageAddress, &address_payload(address))
    }

    /// Read the selected page. Empty when the echo does not match.
    pub fn read_page(&mut self) -> Result<Vec<u8>> {
        Ok(self.query(Command::ReadPage)?.unwrap_or_default())
    }

    /// Program the selected page. A short slice programs a partial page.
    pub fn write_page(&mut self, data: &[u8]) -> Result<bool> {
        self.acknowledged(Command::WritePage, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::ERROR_CODE;
    use std::collections::VecDeque;
    use std::io::{Read, Write};

    /// Mock serial port that releases one scripted reply per request.
    struct MockPort {
        replies: VecDeque<Vec<u8>>,
        read_buf: VecDeque<u8>,
        write_buf: Vec<u8>,
    }

    impl MockPort {
        fn new(replies: Vec<Vec<u8>>) -> Self {
            Self {
                replies: replies.into(),
                read_buf: VecDeque::new(),
                write_buf: Vec::new(),
            }
        }
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.read_buf.is_empty() {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
            }
            // Deliver at most 3 bytes per read to exercise accumulation.
            let n = buf.len().min(self.read_buf.len()).min(3);
            for b in buf.iter_mut().take(n) {
                *b = self.read_buf.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.write_buf.extend_from_slice(buf);
            if let Some(reply) = self.replies.pop_front() {
                self.read_buf.extend(reply);
            }
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Port for MockPort {
        fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
        fn timeout(&self) -> Duration {
            Duration::ZERO
        }
        fn clear_buffers(&mut self) -> Result<()> {
            self.read_buf.clear();
            Ok(())
        }
        fn name(&self) -> &str {
            "mock"
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn fast() -> EngineConfig {
        EngineConfig::default()
            .with_response_timeout(Duration::from_millis(60))
            .with_poll_interval(Duration::from_millis(5))
    }

    fn engine(reply: &[u8]) -> ProtocolEngine<MockPort> {
        scripted(vec![reply.to_vec()])
    }

    fn scripted(replies: Vec<Vec<u8>>) -> ProtocolEngine<MockPort> {
        ProtocolEngine::with_config(MockPort::new(replies), fast())
    }

    fn reply(command: Command, payload: &[u8]) -> Vec<u8> {
        build_frame(command.echo(), payload)
    }

    #[test]
    fn test_activate_sends_bare_frame() {
        let mut e = engine(&reply(Command::Activate, &[]));
        assert!(e.activate().unwrap());
        assert_eq!(e.port().write_buf, vec![0x01, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_activate_false_on_wrong_echo() {
        let mut e = engine(&build_frame(0xFE, &[]));
        assert!(!e.activate().unwrap());
    }

    #[test]
    fn test_error_code_is_device_error() {
        let mut e = engine(&build_frame(ERROR_CODE, &[]));
        let err = e.deactivate().unwrap_err();
        assert!(matches!(
            err,
            Error::DeviceError {
                command: Command::Deactivate
            }
        ));
    }

    #[test]
    fn test_silent_port_times_out() {
        let mut e = engine(&[]);
        let start = Instant::now();
        let err = e.version().unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert!(matches!(
            err,
            Error::Timeout {
                command: Command::Version,
                received: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_partial_frame_times_out() {
        // Header promises 4 payload bytes, only 2 arrive.
        let mut e = engine(&[0x01, 0xEF, 0x00, 0x04, 0x10, 0x20]);
        let err = e.device_name().unwrap_err();
        assert!(matches!(err, Error::Timeout { received: 6, .. }));
    }

    #[test]
    fn test_version() {
        let mut e = engine(&reply(Command::Version, &[0x01]));
        assert_eq!(e.version().unwrap(), 1);
    }

    #[test]
    fn test_version_wrong_length_is_zero() {
        let mut e = engine(&reply(Command::Version, &[0x01, 0x02]));
        assert_eq!(e.version().unwrap(), 0);
    }

    #[test]
    fn test_names() {
        let mut e = scripted(vec![
            reply(Command::DeviceName, b"ATmega328P"),
            reply(Command::ModuleName, b""),
        ]);
        assert_eq!(e.device_name().unwrap(), b"ATmega328P");
        assert!(e.module_name().unwrap().is_empty());
    }

    #[test]
    fn test_sizes_are_big_endian() {
        let mut e = scripted(vec![
            reply(Command::BootSize, &[0x08, 0x00]),
            reply(Command::FlashSize, &[0x00, 0x20]),
            reply(Command::PageSize, &[0x00, 0x80]),
        ]);
        assert_eq!(e.boot_size().unwrap(), 2048);
        assert_eq!(e.flash_size().unwrap(), 32);
        assert_eq!(e.page_size().unwrap(), 128);
    }

    #[test]
    fn test_size_query_mismatch_is_zero() {
        let mut e = scripted(vec![
            reply(Command::BootSize, &[0x08, 0x00]),
            // Answer to flash size carries the boot size echo.
            reply(Command::BootSize, &[0x00, 0x20]),
        ]);
        assert_eq!(e.boot_size().unwrap(), 2048);
        assert_eq!(e.flash_size().unwrap(), 0);
    }

    #[test]
    fn test_set_page_address_payload() {
        let mut e = engine(&reply(Command::SetPageAddress, &[]));
        assert!(e.set_page_address(0x0001_0280).unwrap());
        assert_eq!(
            e.port().write_buf,
            vec![0x01, 0x30, 0x00, 0x04, 0x00, 0x01, 0x02, 0x80]
        );
    }

    #[test]
    fn test_read_and_write_page() {
        let page: Vec<u8> = (0..16).collect();
        let mut e = scripted(vec![
            reply(Command::ReadPage, &page),
            reply(Command::WritePage, &[]),
        ]);

        assert_eq!(e.read_page().unwrap(), page);
        assert!(e.write_page(&[0xAA; 4]).unwrap());

        let written = &e.port().write_buf;
        assert_eq!(&written[..4], &[0x01, 0x31, 0x00, 0x00]);
        assert_eq!(&written[4..], &[0x01, 0x32, 0x00, 0x04, 0xAA, 0xAA, 0xAA, 0xAA]);
    }

    #[test]
    fn test_read_page_mismatch_is_empty() {
        let mut e = engine(&build_frame(0x00, &[1, 2, 3]));
        assert!(e.read_page().unwrap().is_empty());
    }

    #[test]
    fn test_noise_before_response_is_skipped() {
        let mut response = vec![0x00, 0x7F];
        response.extend(reply(Command::Activate, &[]));
        let mut e = engine(&response);
        assert!(e.activate().unwrap());
    }

    #[test]
    fn test_checked_rejects_wrong_echo() {
        let mut e = engine(&build_frame(0x12, &[]));
        let err = e.checked(Command::WritePage, &[0x00]).unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolMismatch {
                command: Command::WritePage,
                response: 0x12
            }
        ));
    }

    #[test]
    fn test_send_receive_returns_full_frame() {
        let mut e = engine(&reply(Command::PageSize, &[0x00, 0x40]));
        let frame = e.send_receive(Command::PageSize, &[]).unwrap();
        assert_eq!(frame.as_bytes(), &[0x01, 0xDD, 0x00, 0x02, 0x00, 0x40]);
    }
}
