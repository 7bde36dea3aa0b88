//! Byte links underneath the servo bus.
//!
//! A [`SerialLink`] is a raw half-duplex byte pipe; a [`LinkOpener`] turns
//! bus settings into a link. The registry is constructed with an opener,
//! so the same code drives a real serial port or the in-process
//! simulated arm.
//!
//! - [`serial`] - `serialport`-backed link
//! - [`simulation`] - Simulated six-servo arm

use std::io::{Read, Write};

use armlink_common::config::BusConfig;

use crate::error::BusError;

pub mod serial;
pub mod simulation;

pub use serial::{SerialPortLink, SerialPortOpener};
pub use simulation::{SimulatedArm, SimulatedLink, SimulatedOpener};

/// Half-duplex byte link.
///
/// `read` returns `Ok(0)` or an error of kind `TimedOut`/`WouldBlock` when
/// nothing arrived within the link's poll interval; the bus owns the
/// overall response deadline.
pub trait SerialLink: Read + Write + Send {
    /// Device path or simulation label.
    fn name(&self) -> &str;

    /// Discard bytes received but not yet read.
    fn clear_input(&mut self) -> std::io::Result<()>;

    /// Release the underlying device. Further I/O fails.
    fn close(&mut self) -> std::io::Result<()>;
}

/// Opens links for the registry.
pub trait LinkOpener: Send + Sync {
    /// Open a link for the given bus settings.
    fn open(&self, config: &BusConfig) -> Result<Box<dyn SerialLink>, BusError>;
}
