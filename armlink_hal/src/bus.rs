//! Servo bus: one serial link, strictly serialized.
//!
//! All traffic goes through a single lock around the link, so commands
//! from different controllers, the workflow sampler and the CLI never
//! interleave on the wire. Every command waits out the minimum gap since
//! the previous one; every write is followed by a settle delay. Reads are
//! retried with input flush and doubling backoff, then surfaced annotated
//! with the failing servo.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use armlink_common::config::{BusConfig, TimingConfig};
use armlink_common::consts::BROADCAST_ID;
use armlink_common::protocol::frame::{
    encode_ping, encode_read, encode_sync_read, encode_sync_write, encode_sync_write_positions,
    encode_write,
};
use armlink_common::protocol::{FrameDecoder, ProtocolError, Register, StatusPacket};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::error::BusError;
use crate::links::SerialLink;

/// Traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    /// Frames sent.
    pub commands: u64,
    /// Read attempts repeated after a failure.
    pub retries: u64,
    /// Operations that surfaced an error.
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    commands: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

struct BusIo {
    link: Box<dyn SerialLink>,
    decoder: FrameDecoder,
    last_command: Option<Instant>,
}

/// Serial bus shared by every controller on one port.
pub struct ServoBus {
    config: BusConfig,
    timing: TimingConfig,
    io: Mutex<Option<BusIo>>,
    counters: Counters,
}

impl ServoBus {
    /// Wrap an open link.
    pub fn new(link: Box<dyn SerialLink>, config: BusConfig, timing: TimingConfig) -> Self {
        info!(
            port = %config.port,
            baudrate = config.baudrate,
            timeout_ms = config.timeout_ms,
            "Servo bus ready on {}",
            link.name()
        );
        Self {
            config,
            timing,
            io: Mutex::new(Some(BusIo {
                link,
                decoder: FrameDecoder::new(),
                last_command: None,
            })),
            counters: Counters::default(),
        }
    }

    /// Device path.
    pub fn port(&self) -> &str {
        &self.config.port
    }

    /// Settings the bus was opened with.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Pacing and retry policy.
    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// True once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.io.lock().is_none()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BusStats {
        BusStats {
            commands: self.counters.commands.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    // ─── Single-servo operations ────────────────────────────────────

    /// Check that a servo answers.
    pub fn ping(&self, id: u8) -> Result<(), BusError> {
        let packet = encode_ping(id);
        self.exchange(id, |bus, io| {
            bus.send(io, &packet)?;
            bus.receive(io, id, 0).map(|_| ())
        })
    }

    /// Read `len` bytes starting at `address`.
    pub fn read_bytes(&self, id: u8, address: u8, len: u8) -> Result<Vec<u8>, BusError> {
        let packet = encode_read(id, address, len);
        self.exchange(id, |bus, io| {
            bus.send(io, &packet)?;
            bus.receive(io, id, len as usize).map(|status| status.params)
        })
    }

    /// Read and decode a register.
    pub fn read_register(&self, id: u8, register: Register) -> Result<i32, BusError> {
        let bytes = self.read_bytes(id, register.address(), register.size())?;
        Ok(register.decode(&bytes)?)
    }

    /// Read a register by name, returning its raw bytes.
    pub fn read_register_by_name(&self, id: u8, name: &str) -> Result<Vec<u8>, BusError> {
        let register =
            Register::from_name(name).ok_or_else(|| BusError::UnknownRegister(name.to_string()))?;
        self.read_bytes(id, register.address(), register.size())
    }

    /// Write bytes starting at `address` and wait for the acknowledgement
    /// (none for broadcast).
    pub fn write_bytes(&self, id: u8, address: u8, data: &[u8]) -> Result<(), BusError> {
        let packet = encode_write(id, address, data)?;
        let result = self.with_io(|bus, io| {
            bus.send(io, &packet)?;
            if id != BROADCAST_ID {
                bus.receive(io, id, 0)?;
            }
            bus.settle();
            Ok(())
        });
        self.count_failure(&result);
        result
    }

    /// Encode and write a register.
    pub fn write_register(&self, id: u8, register: Register, value: i32) -> Result<(), BusError> {
        let bytes = register.encode(value)?;
        self.write_bytes(id, register.address(), &bytes)
    }

    /// Write a register by name from raw bytes.
    pub fn write_register_by_name(&self, id: u8, name: &str, data: &[u8]) -> Result<(), BusError> {
        let register =
            Register::from_name(name).ok_or_else(|| BusError::UnknownRegister(name.to_string()))?;
        if data.len() != register.size() as usize {
            return Err(BusError::Encode(ProtocolError::PayloadSize {
                register: register.name(),
                expected: register.size() as usize,
                actual: data.len(),
            }));
        }
        self.write_bytes(id, register.address(), data)
    }

    // ─── Group operations ───────────────────────────────────────────

    /// Read present positions of several servos in one transaction.
    pub fn sync_read_positions(&self, ids: &[u8]) -> Result<BTreeMap<u8, u16>, BusError> {
        let Some(&first) = ids.first() else {
            return Ok(BTreeMap::new());
        };
        let register = Register::PresentPosition;
        let packet = encode_sync_read(register.address(), register.size(), ids)?;
        self.exchange(first, |bus, io| {
            bus.send(io, &packet)?;
            let mut positions = BTreeMap::new();
            for &id in ids {
                let status = bus.receive(io, id, register.size() as usize)?;
                positions.insert(id, u16::from_le_bytes([status.params[0], status.params[1]]));
            }
            Ok(positions)
        })
    }

    /// Write per-servo data to the same register block. No responses.
    pub fn sync_write(&self, address: u8, data_len: u8, data: &[(u8, &[u8])]) -> Result<(), BusError> {
        if data.is_empty() {
            return Ok(());
        }
        let packet = encode_sync_write(address, data_len, data)?;
        self.broadcast(&packet)
    }

    /// Write one value to the same register of several servos.
    pub fn sync_write_register(
        &self,
        register: Register,
        ids: &[u8],
        value: i32,
    ) -> Result<(), BusError> {
        let bytes = register.encode(value)?;
        let data: Vec<(u8, &[u8])> = ids.iter().map(|&id| (id, bytes.as_slice())).collect();
        self.sync_write(register.address(), register.size(), &data)
    }

    /// Write goal positions of several servos in one frame.
    pub fn sync_write_positions(&self, ids: &[u8], positions: &[u16]) -> Result<(), BusError> {
        if ids.len() != positions.len() {
            return Err(BusError::LengthMismatch {
                ids: ids.len(),
                values: positions.len(),
            });
        }
        if ids.is_empty() {
            return Ok(());
        }
        let targets: Vec<(u8, u16)> = ids.iter().copied().zip(positions.iter().copied()).collect();
        let packet = encode_sync_write_positions(Register::GoalPosition.address(), &targets)?;
        self.broadcast(&packet)
    }

    /// Close the link. Only the first call touches the device.
    pub fn close(&self) -> Result<(), BusError> {
        let Some(mut io) = self.io.lock().take() else {
            debug!("Bus on {} already closed", self.config.port);
            return Ok(());
        };
        info!("Closing servo bus on {}", self.config.port);
        io.link.close()?;
        Ok(())
    }

    // ─── Internals ──────────────────────────────────────────────────

    fn broadcast(&self, packet: &[u8]) -> Result<(), BusError> {
        let result = self.with_io(|bus, io| {
            bus.send(io, packet)?;
            bus.settle();
            Ok(())
        });
        self.count_failure(&result);
        result
    }

    fn with_io<T>(
        &self,
        op: impl FnOnce(&Self, &mut BusIo) -> Result<T, BusError>,
    ) -> Result<T, BusError> {
        let mut guard = self.io.lock();
        let io = guard.as_mut().ok_or_else(|| BusError::Closed {
            port: self.config.port.clone(),
        })?;
        op(self, io)
    }

    /// Run a request/response exchange with the read retry policy.
    fn exchange<T>(
        &self,
        id: u8,
        mut op: impl FnMut(&Self, &mut BusIo) -> Result<T, BusError>,
    ) -> Result<T, BusError> {
        let attempts = self.timing.read_attempts.max(1);
        let result = self.with_io(|bus, io| {
            let mut attempt = 1;
            loop {
                match op(bus, io) {
                    Ok(value) => return Ok(value),
                    Err(e) if e.is_retryable() && attempt < attempts => {
                        debug!(
                            servo = e.servo_id().unwrap_or(id),
                            attempt, "Bus read failed, retrying: {}", e
                        );
                        bus.counters.retries.fetch_add(1, Ordering::Relaxed);
                        bus.flush_input(io);
                        thread::sleep(bus.timing.backoff(attempt));
                        attempt += 1;
                    }
                    Err(e) if e.is_retryable() => {
                        let failing = e.servo_id().unwrap_or(id);
                        warn!(servo = failing, attempts, "Bus read failed: {}", e);
                        return Err(BusError::RetriesExhausted {
                            id: failing,
                            attempts,
                            last: Box::new(e),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
        });
        self.count_failure(&result);
        result
    }

    fn count_failure<T>(&self, result: &Result<T, BusError>) {
        if result.is_err() {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flush_input(&self, io: &mut BusIo) {
        io.decoder.clear();
        if let Err(e) = io.link.clear_input() {
            debug!("Failed to clear input on {}: {}", self.config.port, e);
        }
    }

    fn settle(&self) {
        let settle = self.timing.write_settle();
        if !settle.is_zero() {
            thread::sleep(settle);
        }
    }

    fn send(&self, io: &mut BusIo, packet: &[u8]) -> Result<(), BusError> {
        if let Some(last) = io.last_command {
            let gap = self.timing.min_command_gap();
            let elapsed = last.elapsed();
            if elapsed < gap {
                thread::sleep(gap - elapsed);
            }
        }
        self.flush_input(io);
        trace!(port = %self.config.port, "TX {:02X?}", packet);
        let written = io.link.write_all(packet).and_then(|()| io.link.flush());
        io.last_command = Some(Instant::now());
        self.counters.commands.fetch_add(1, Ordering::Relaxed);
        written.map_err(BusError::from)
    }

    /// Wait for one status packet from `id` carrying `expected_len` bytes.
    fn receive(
        &self,
        io: &mut BusIo,
        id: u8,
        expected_len: usize,
    ) -> Result<StatusPacket, BusError> {
        let started = Instant::now();
        let timeout = self.config.timeout();
        let mut buf = [0u8; 64];
        loop {
            match io.decoder.next_frame() {
                Ok(Some(frame)) => {
                    let status = StatusPacket::from(frame);
                    if status.id != id {
                        return Err(BusError::UnexpectedId {
                            expected: id,
                            actual: status.id,
                        });
                    }
                    if !status.status.is_ok() {
                        return Err(BusError::ServoFault {
                            id,
                            status: status.status,
                        });
                    }
                    if status.params.len() != expected_len {
                        return Err(BusError::ShortResponse {
                            id,
                            expected: expected_len,
                            actual: status.params.len(),
                        });
                    }
                    return Ok(status);
                }
                Ok(None) => {}
                Err(source) => return Err(BusError::Protocol { id, source }),
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(BusError::Timeout { id, waited });
            }
            match io.link.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    trace!(port = %self.config.port, "RX {:02X?}", &buf[..n]);
                    io.decoder.push(&buf[..n]);
                }
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(BusError::Io(e)),
            }
        }
    }
}

impl Drop for ServoBus {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close bus on {}: {}", self.config.port, e);
        }
    }
}

impl std::fmt::Debug for ServoBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServoBus")
            .field("port", &self.config.port)
            .field("closed", &self.is_closed())
            .finish()
    }
}
