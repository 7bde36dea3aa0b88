//! Serial port link.

use std::io::{self, Read, Write};
use std::time::Duration;

use armlink_common::config::BusConfig;
use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info};

use super::{LinkOpener, SerialLink};
use crate::error::BusError;

/// Upper bound on a single blocking read; the bus loops until its own
/// deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Link over an OS serial port.
pub struct SerialPortLink {
    name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialPortLink {
    /// Open `config.port` at `config.baudrate`, 8N1.
    pub fn open(config: &BusConfig) -> Result<Self, BusError> {
        let poll = config.timeout().min(POLL_INTERVAL);
        let port = serialport::new(&config.port, config.baudrate)
            .timeout(poll)
            .open()
            .map_err(|e| BusError::Open {
                port: config.port.clone(),
                reason: e.to_string(),
            })?;
        info!(
            "Opened serial port {} at {} baud",
            config.port, config.baudrate
        );
        Ok(Self {
            name: config.port.clone(),
            port: Some(port),
        })
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))
    }
}

impl Read for SerialPortLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port()?.read(buf)
    }
}

impl Write for SerialPortLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port()?.flush()
    }
}

impl SerialLink for SerialPortLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port()?
            .clear(ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(port) = self.port.take() {
            debug!("Closing serial port {}", self.name);
            drop(port);
        }
        Ok(())
    }
}

/// Opens [`SerialPortLink`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortOpener;

impl LinkOpener for SerialPortOpener {
    fn open(&self, config: &BusConfig) -> Result<Box<dyn SerialLink>, BusError> {
        Ok(Box::new(SerialPortLink::open(config)?))
    }
}
