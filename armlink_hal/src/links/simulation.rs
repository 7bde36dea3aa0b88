//! Simulated six-servo arm.
//!
//! Parses instruction frames written by the host, keeps a control table
//! per servo and queues status frames for the host to read. Writes to the
//! goal position move the joint instantly (within its position limits).
//! Sync writes and broadcast writes are silent, as on real hardware.
//!
//! Test hooks cover the failure modes the bus must handle: silent servos,
//! corrupted responses, fault bits and failed opens.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use armlink_common::config::BusConfig;
use armlink_common::consts::{BROADCAST_ID, RAW_HOME, RAW_MAX, SERVO_IDS};
use armlink_common::protocol::frame::encode_status;
use armlink_common::protocol::{Frame, FrameDecoder, Instruction, Register};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{LinkOpener, SerialLink};
use crate::error::BusError;

/// Control-table bytes per servo.
const REGISTER_SPACE: usize = 128;

/// STS3215 model number.
const MODEL_NUMBER: i32 = 777;

/// Frames kept in the received-frame log.
const FRAME_LOG_CAPACITY: usize = 4096;

/// Delay of an empty read, standing in for the port's poll timeout.
const EMPTY_READ_DELAY: Duration = Duration::from_millis(1);

const ENCODER_COUNTS: i32 = RAW_MAX as i32 + 1;

// ─── Servo model ────────────────────────────────────────────────────

struct SimServo {
    registers: [u8; REGISTER_SPACE],
    /// Encoder position before the homing offset is applied.
    physical: i32,
    responsive: bool,
    status: u8,
}

impl SimServo {
    fn new(id: u8) -> Self {
        let mut servo = Self {
            registers: [0; REGISTER_SPACE],
            physical: RAW_HOME,
            responsive: true,
            status: 0,
        };
        servo.set(Register::ModelNumber, MODEL_NUMBER);
        servo.set(Register::Id, id as i32);
        servo.set(Register::MinPositionLimit, 0);
        servo.set(Register::MaxPositionLimit, RAW_MAX as i32);
        servo.set(Register::Lock, 1);
        servo.set(Register::GoalPosition, RAW_HOME);
        servo
    }

    fn get(&self, reg: Register) -> i32 {
        let start = reg.address() as usize;
        reg.decode(&self.registers[start..start + reg.size() as usize])
            .unwrap_or(0)
    }

    fn set(&mut self, reg: Register, value: i32) {
        if let Ok(bytes) = reg.encode(value) {
            let start = reg.address() as usize;
            self.registers[start..start + bytes.len()].copy_from_slice(&bytes);
        }
    }

    fn present(&self) -> u16 {
        (self.physical - self.get(Register::HomingOffset)).rem_euclid(ENCODER_COUNTS) as u16
    }

    fn read_block(&mut self, addr: u8, len: u8) -> Vec<u8> {
        self.set(Register::PresentPosition, self.present() as i32);
        let start = (addr as usize).min(REGISTER_SPACE);
        let end = (start + len as usize).min(REGISTER_SPACE);
        self.registers[start..end].to_vec()
    }

    fn write_block(&mut self, addr: u8, data: &[u8]) {
        let start = (addr as usize).min(REGISTER_SPACE);
        let end = (start + data.len()).min(REGISTER_SPACE);
        self.registers[start..end].copy_from_slice(&data[..end - start]);

        let goal = Register::GoalPosition.address() as usize;
        if start <= goal && end >= goal + 2 {
            let min = self.get(Register::MinPositionLimit);
            let max = self.get(Register::MaxPositionLimit).max(min);
            let target = self.get(Register::GoalPosition).clamp(min, max);
            self.physical =
                (target + self.get(Register::HomingOffset)).rem_euclid(ENCODER_COUNTS);
        }
    }
}

// ─── Shared state ───────────────────────────────────────────────────

struct SimState {
    servos: BTreeMap<u8, SimServo>,
    decoder: FrameDecoder,
    rx: VecDeque<u8>,
    frames: VecDeque<Frame>,
    corrupt_next: bool,
    fail_open: bool,
    opens: u32,
    closes: u32,
}

impl SimState {
    fn new() -> Self {
        Self {
            servos: SERVO_IDS.iter().map(|&id| (id, SimServo::new(id))).collect(),
            decoder: FrameDecoder::new(),
            rx: VecDeque::new(),
            frames: VecDeque::new(),
            corrupt_next: false,
            fail_open: false,
            opens: 0,
            closes: 0,
        }
    }

    fn receive(&mut self, bytes: &[u8]) {
        self.decoder.push(bytes);
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => self.handle(frame),
                Ok(None) => break,
                Err(e) => debug!("Simulated arm dropped corrupt instruction: {}", e),
            }
        }
    }

    fn handle(&mut self, frame: Frame) {
        trace!(id = frame.id, code = frame.code, "Simulated arm received frame");
        if self.frames.len() == FRAME_LOG_CAPACITY {
            self.frames.pop_front();
        }
        self.frames.push_back(frame.clone());

        let Some(instruction) = Instruction::from_u8(frame.code) else {
            return;
        };
        let params = frame.params.as_slice();
        match instruction {
            Instruction::Ping | Instruction::RegWrite | Instruction::Action => {
                self.reply(frame.id, Vec::new())
            }
            Instruction::Read => {
                if let &[addr, len] = params {
                    if let Some(servo) = self.servos.get_mut(&frame.id) {
                        let data = servo.read_block(addr, len);
                        self.reply(frame.id, data);
                    }
                }
            }
            Instruction::Write => {
                let Some((&addr, data)) = params.split_first() else {
                    return;
                };
                if frame.id == BROADCAST_ID {
                    for servo in self.servos.values_mut() {
                        servo.write_block(addr, data);
                    }
                } else if let Some(servo) = self.servos.get_mut(&frame.id) {
                    if servo.responsive {
                        servo.write_block(addr, data);
                    }
                    self.reply(frame.id, Vec::new());
                }
            }
            Instruction::SyncRead => {
                let [addr, len, ids @ ..] = params else {
                    return;
                };
                for &id in ids {
                    if let Some(servo) = self.servos.get_mut(&id) {
                        let data = servo.read_block(*addr, *len);
                        self.reply(id, data);
                    }
                }
            }
            Instruction::SyncWrite => {
                let [addr, len, rest @ ..] = params else {
                    return;
                };
                let stride = *len as usize + 1;
                for chunk in rest.chunks_exact(stride) {
                    if let Some(servo) = self.servos.get_mut(&chunk[0]) {
                        if servo.responsive {
                            servo.write_block(*addr, &chunk[1..]);
                        }
                    }
                }
            }
        }
    }

    fn reply(&mut self, id: u8, params: Vec<u8>) {
        let Some(servo) = self.servos.get(&id) else {
            return;
        };
        if !servo.responsive {
            return;
        }
        let Ok(mut bytes) = encode_status(id, servo.status, &params) else {
            return;
        };
        if self.corrupt_next {
            self.corrupt_next = false;
            let idx = bytes.len() - 2;
            bytes[idx] ^= 0x10;
        }
        self.rx.extend(bytes);
    }
}

// ─── Arm handle ─────────────────────────────────────────────────────

/// Simulated arm shared by its links and the test code driving it.
#[derive(Clone)]
pub struct SimulatedArm {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedArm {
    /// Six responsive servos at the home position.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    /// Opener producing links to this arm.
    pub fn opener(&self) -> SimulatedOpener {
        SimulatedOpener { arm: self.clone() }
    }

    /// Open a link directly.
    pub fn link(&self, name: &str) -> SimulatedLink {
        self.state.lock().opens += 1;
        SimulatedLink {
            name: name.to_string(),
            state: Arc::clone(&self.state),
            closed: false,
        }
    }

    /// Move a joint so it reports `raw` under its current homing offset.
    pub fn set_present_position(&self, id: u8, raw: u16) {
        if let Some(servo) = self.state.lock().servos.get_mut(&id) {
            servo.physical =
                (raw as i32 + servo.get(Register::HomingOffset)).rem_euclid(ENCODER_COUNTS);
        }
    }

    /// Position the joint reports.
    pub fn present_position(&self, id: u8) -> Option<u16> {
        self.state.lock().servos.get(&id).map(SimServo::present)
    }

    /// Current register value.
    pub fn register(&self, id: u8, reg: Register) -> Option<i32> {
        self.state.lock().servos.get(&id).map(|s| s.get(reg))
    }

    /// Overwrite a register without bus traffic.
    pub fn set_register(&self, id: u8, reg: Register, value: i32) {
        if let Some(servo) = self.state.lock().servos.get_mut(&id) {
            servo.set(reg, value);
        }
    }

    /// Make a servo ignore every instruction.
    pub fn set_responsive(&self, id: u8, responsive: bool) {
        if let Some(servo) = self.state.lock().servos.get_mut(&id) {
            servo.responsive = responsive;
        }
    }

    /// Error byte the servo reports in its status frames.
    pub fn set_status_error(&self, id: u8, status: u8) {
        if let Some(servo) = self.state.lock().servos.get_mut(&id) {
            servo.status = status;
        }
    }

    /// Flip one bit of the next status frame.
    pub fn corrupt_next_response(&self) {
        self.state.lock().corrupt_next = true;
    }

    /// Make subsequent opens fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Links opened so far.
    pub fn open_count(&self) -> u32 {
        self.state.lock().opens
    }

    /// Links closed so far.
    pub fn close_count(&self) -> u32 {
        self.state.lock().closes
    }

    /// Received instruction frames of one kind (from the bounded log).
    pub fn frame_count(&self, instruction: Instruction) -> usize {
        self.state
            .lock()
            .frames
            .iter()
            .filter(|f| f.code == instruction as u8)
            .count()
    }
}

impl Default for SimulatedArm {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Link ───────────────────────────────────────────────────────────

/// Link to a [`SimulatedArm`].
pub struct SimulatedLink {
    name: String,
    state: Arc<Mutex<SimState>>,
    closed: bool,
}

impl SimulatedLink {
    fn ensure_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "simulated link closed",
            ));
        }
        Ok(())
    }
}

impl Read for SimulatedLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if state.rx.is_empty() {
            drop(state);
            std::thread::sleep(EMPTY_READ_DELAY);
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimulatedLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_open()?;
        self.state.lock().receive(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ensure_open()
    }
}

impl SerialLink for SimulatedLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        self.state.lock().rx.clear();
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if !self.closed {
            self.closed = true;
            self.state.lock().closes += 1;
            debug!("Closed simulated link {}", self.name);
        }
        Ok(())
    }
}

/// Opens links to a [`SimulatedArm`].
#[derive(Clone)]
pub struct SimulatedOpener {
    arm: SimulatedArm,
}

impl SimulatedOpener {
    /// Arm behind this opener.
    pub fn arm(&self) -> &SimulatedArm {
        &self.arm
    }
}

impl LinkOpener for SimulatedOpener {
    fn open(&self, config: &BusConfig) -> Result<Box<dyn SerialLink>, BusError> {
        if self.arm.state.lock().fail_open {
            return Err(BusError::Open {
                port: config.port.clone(),
                reason: "simulated open failure".to_string(),
            });
        }
        debug!("Opening simulated arm as {}", config.port);
        Ok(Box::new(self.arm.link(&config.port)))
    }
}
