//! Serial port backed by the `serialport` crate.

use {
    crate::{
        error::Result,
        port::{Port, SerialConfig},
    },
    log::debug,
    serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits},
    std::{
        io::{self, Read, Write},
        time::Duration,
    },
};

/// An open serial port, 8N1 without flow control.
pub struct NativePort {
    inner: Option<Box<dyn SerialPort>>,
    name: String,
    timeout: Duration,
}

impl NativePort {
    /// Open the port described by `config`.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        debug!(
            "Opening {} at {} baud (8N1)",
            config.port_name, config.baud_rate
        );
        let inner = serialport::new(&config.port_name, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(config.timeout)
            .open()?;

        Ok(Self {
            inner: Some(inner),
            name: config.port_name.clone(),
            timeout: config.timeout,
        })
    }

    fn io(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port closed"))
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(inner) = self.inner.as_mut() {
            inner.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(inner) = self.inner.as_mut() {
            inner.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        if self.inner.take().is_some() {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.io()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.io()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.io()?.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_open_missing_port_fails() {
        let config = SerialConfig::new("/dev/pageboot-does-not-exist", 115_200);
        assert!(matches!(NativePort::open(&config), Err(Error::Serial(_))));
    }
}
