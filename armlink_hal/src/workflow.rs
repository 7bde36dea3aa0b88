//! Interactive calibration workflow.
//!
//! Walks the operator through homing and range-of-motion recording on a
//! shared controller:
//!
//! 1. `start` disables torque so the arm can be moved by hand.
//! 2. `set_homing` resets the calibration registers, reads the pose and
//!    writes homing offsets that map it to the encoder midpoint.
//! 3. `start_range_recording` spawns the background sampler.
//! 4. `stop_range_recording` stops it and checks every joint moved.
//! 5. `save_calibration` writes the calibration file, pushes the position
//!    limits to the servos and hot-updates the controller.
//!
//! # Module Structure
//!
//! - [`machine`] - States and transition table
//! - `sampler` - Background range sampler

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use armlink_common::calibration::{FullCalibration, MotorCalibration, file};
use armlink_common::config::WorkflowConfig;
use armlink_common::consts::{RAW_HOME, RAW_MAX, joint_name};
use armlink_common::protocol::registers::HOMING_OFFSET_SIGN_BIT;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::controller::SharedController;
use crate::error::WorkflowError;

pub mod machine;
mod sampler;

pub use machine::{TransitionResult, WorkflowEvent, WorkflowMachine, WorkflowState};

use sampler::RangeSampler;

/// Recorded minimum before any sample arrived.
const UNSET_MIN: i32 = RAW_MAX as i32 + 1;
/// Recorded maximum before any sample arrived.
const UNSET_MAX: i32 = -1;

// ─── Session data ───────────────────────────────────────────────────

/// Per-joint scratch data of one calibration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JointCalibrationData {
    /// Servo ID.
    pub id: u8,
    /// Joint name.
    pub name: &'static str,
    /// Offset written by `set_homing`.
    pub homing_offset: i32,
    /// Accepted lower limit.
    pub range_min: u16,
    /// Accepted upper limit.
    pub range_max: u16,
    /// Last sampled raw position.
    pub current_pos: i32,
    /// Lowest sampled raw position.
    pub recorded_min: i32,
    /// Highest sampled raw position.
    pub recorded_max: i32,
    /// Range accepted.
    pub is_completed: bool,
}

impl JointCalibrationData {
    fn new(id: u8) -> Self {
        Self {
            id,
            name: joint_name(id).unwrap_or("unknown"),
            homing_offset: 0,
            range_min: 0,
            range_max: RAW_MAX,
            current_pos: 0,
            recorded_min: UNSET_MIN,
            recorded_max: UNSET_MAX,
            is_completed: false,
        }
    }

    fn clear_recording(&mut self) {
        self.recorded_min = UNSET_MIN;
        self.recorded_max = UNSET_MAX;
        self.is_completed = false;
    }

    fn has_range(&self) -> bool {
        self.recorded_min < self.recorded_max
    }
}

/// One sampler reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionSample {
    /// Milliseconds since recording started.
    pub elapsed_ms: u64,
    /// Raw position per servo.
    pub positions: BTreeMap<u8, u16>,
}

/// Snapshot returned by [`CalibrationWorkflow::status`].
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatus {
    /// Current state.
    pub state: WorkflowState,
    /// Last operator-facing message.
    pub message: String,
    /// Per-joint data.
    pub joints: Vec<JointCalibrationData>,
    /// Samples folded in since recording started.
    pub samples_taken: u64,
    /// Samples currently kept.
    pub history_len: usize,
    /// Calibration file written by `save_calibration`.
    pub output: String,
}

/// State shared with the sampler thread.
pub(crate) struct Session {
    machine: WorkflowMachine,
    message: String,
    joints: Vec<JointCalibrationData>,
    history: VecDeque<PositionSample>,
    history_capacity: usize,
    samples_taken: u64,
}

impl Session {
    fn new(ids: &[u8], history_capacity: usize) -> Self {
        Self {
            machine: WorkflowMachine::new(),
            message: "ready".to_string(),
            joints: ids.iter().map(|&id| JointCalibrationData::new(id)).collect(),
            history: VecDeque::with_capacity(history_capacity),
            history_capacity,
            samples_taken: 0,
        }
    }

    fn reset_data(&mut self) {
        for joint in &mut self.joints {
            *joint = JointCalibrationData::new(joint.id);
        }
        self.history.clear();
        self.samples_taken = 0;
    }

    /// Fold one reading in. Returns false once recording is over.
    pub(crate) fn record(&mut self, positions: &BTreeMap<u8, u16>, elapsed: Duration) -> bool {
        if self.machine.state() != WorkflowState::RangeRecording {
            return false;
        }
        for joint in &mut self.joints {
            if let Some(&raw) = positions.get(&joint.id) {
                let raw = raw as i32;
                joint.current_pos = raw;
                joint.recorded_min = joint.recorded_min.min(raw);
                joint.recorded_max = joint.recorded_max.max(raw);
            }
        }
        if self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(PositionSample {
            elapsed_ms: elapsed.as_millis() as u64,
            positions: positions.clone(),
        });
        self.samples_taken += 1;
        true
    }

    fn transition(
        &mut self,
        command: &'static str,
        event: WorkflowEvent,
    ) -> Result<WorkflowState, WorkflowError> {
        match self.machine.handle_event(event) {
            TransitionResult::Ok(next) => {
                debug!(command, state = %next, "Calibration workflow transition");
                Ok(next)
            }
            TransitionResult::Rejected(reason) => {
                debug!(command, reason, "Calibration command rejected");
                Err(WorkflowError::InvalidTransition {
                    command,
                    state: self.machine.state(),
                })
            }
        }
    }

    fn ensure(&self, command: &'static str, event: WorkflowEvent) -> Result<(), WorkflowError> {
        match self.machine.peek(event) {
            TransitionResult::Ok(_) => Ok(()),
            TransitionResult::Rejected(_) => Err(WorkflowError::InvalidTransition {
                command,
                state: self.machine.state(),
            }),
        }
    }
}

// ─── Workflow ───────────────────────────────────────────────────────

/// Calibration workflow bound to one shared controller.
pub struct CalibrationWorkflow {
    controller: Arc<SharedController>,
    config: WorkflowConfig,
    session: Arc<Mutex<Session>>,
    /// Serializes commands; taken before `session`.
    commands: Mutex<Option<RangeSampler>>,
}

impl CalibrationWorkflow {
    /// Workflow over `config.servo_ids` of `controller`.
    pub fn new(controller: Arc<SharedController>, config: WorkflowConfig) -> Self {
        let session = Session::new(&config.servo_ids, config.history_capacity.max(1));
        Self {
            controller,
            config,
            session: Arc::new(Mutex::new(session)),
            commands: Mutex::new(None),
        }
    }

    /// Current state.
    pub fn state(&self) -> WorkflowState {
        self.session.lock().machine.state()
    }

    /// Calibrated servos.
    pub fn servo_ids(&self) -> &[u8] {
        &self.config.servo_ids
    }

    /// Calibration file written by `save_calibration`.
    pub fn output(&self) -> &Path {
        &self.config.output
    }

    /// Begin a calibration: torque off, scratch data cleared.
    pub fn start(&self) -> Result<WorkflowState, WorkflowError> {
        let _commands = self.commands.lock();
        self.session.lock().ensure("start", WorkflowEvent::Start)?;

        self.controller
            .set_torque_enable_for(self.servo_ids(), false)?;

        let mut session = self.session.lock();
        session.reset_data();
        let state = session.transition("start", WorkflowEvent::Start)?;
        session.message = "torque disabled; move the arm to the middle of its range".to_string();
        info!("Calibration started for servos {:?}", self.servo_ids());
        Ok(state)
    }

    /// Record the current pose as home.
    ///
    /// Factory limits are restored first so the pose is read without a
    /// stale offset; the offset maps the pose to the encoder midpoint.
    pub fn set_homing(&self) -> Result<WorkflowState, WorkflowError> {
        let _commands = self.commands.lock();
        self.session
            .lock()
            .ensure("set_homing", WorkflowEvent::HomingSet)?;

        let ids = self.servo_ids();
        self.controller.reset_calibration_registers(ids)?;
        let raw = self.controller.read_raw_positions(ids)?;
        let limit = (1i32 << HOMING_OFFSET_SIGN_BIT) - 1;
        let mut offsets = Vec::with_capacity(ids.len());
        for &id in ids {
            let current = raw.get(&id).map_or(RAW_HOME, |&r| r as i32);
            let offset = (current - RAW_HOME).clamp(-limit, limit);
            self.controller.write_homing_offset(id, offset)?;
            offsets.push((id, current, offset));
        }

        let mut session = self.session.lock();
        for (id, current, offset) in offsets {
            if let Some(joint) = session.joints.iter_mut().find(|j| j.id == id) {
                joint.homing_offset = offset;
                joint.current_pos = current;
                debug!(servo = id, raw = current, offset, "Homing offset written");
            }
        }
        let state = session.transition("set_homing", WorkflowEvent::HomingSet)?;
        session.message = "homing set; start range recording".to_string();
        info!("Homing offsets written");
        Ok(state)
    }

    /// Start tracking each joint's range of motion in the background.
    pub fn start_range_recording(&self) -> Result<WorkflowState, WorkflowError> {
        let mut sampler = self.commands.lock();
        let state = {
            let mut session = self.session.lock();
            session.ensure("start_range_recording", WorkflowEvent::RecordingStarted)?;
            for joint in &mut session.joints {
                joint.clear_recording();
            }
            session.history.clear();
            session.samples_taken = 0;
            let state =
                session.transition("start_range_recording", WorkflowEvent::RecordingStarted)?;
            session.message = "recording; move every joint through its full range".to_string();
            state
        };

        match RangeSampler::spawn(
            Arc::clone(&self.controller),
            Arc::clone(&self.session),
            self.servo_ids().to_vec(),
            self.config.sample_period(),
        ) {
            Ok(running) => {
                *sampler = Some(running);
                Ok(state)
            }
            Err(e) => {
                let mut session = self.session.lock();
                session.machine.force_error();
                session.message = format!("failed to start range sampler: {e}");
                Err(WorkflowError::Spawn(e))
            }
        }
    }

    /// Stop recording and accept the ranges. A joint that never moved sends
    /// the workflow to `Error`.
    pub fn stop_range_recording(&self) -> Result<WorkflowState, WorkflowError> {
        let mut sampler = self.commands.lock();
        self.session
            .lock()
            .ensure("stop_range_recording", WorkflowEvent::RecordingAccepted)?;
        if let Some(mut running) = sampler.take() {
            running.stop();
        }

        let mut session = self.session.lock();
        let degenerate: Vec<&'static str> = session
            .joints
            .iter()
            .filter(|j| !j.has_range())
            .map(|j| j.name)
            .collect();
        if !degenerate.is_empty() {
            session.transition("stop_range_recording", WorkflowEvent::RecordingRejected)?;
            session.message = format!("no range recorded for: {}", degenerate.join(", "));
            warn!("Range recording rejected: {}", session.message);
            return Err(WorkflowError::DegenerateRange { joints: degenerate });
        }
        for joint in &mut session.joints {
            joint.range_min = joint.recorded_min.clamp(0, RAW_MAX as i32) as u16;
            joint.range_max = joint.recorded_max.clamp(0, RAW_MAX as i32) as u16;
            joint.is_completed = true;
        }
        let state = session.transition("stop_range_recording", WorkflowEvent::RecordingAccepted)?;
        session.message = "ranges recorded; save to finish".to_string();
        info!(
            samples = session.samples_taken,
            "Range recording complete"
        );
        Ok(state)
    }

    /// Write the calibration file, push position limits to the servos and
    /// hot-update the controller. Returns the saved calibration.
    pub fn save_calibration(&self) -> Result<FullCalibration, WorkflowError> {
        let _commands = self.commands.lock();
        let joints = {
            let session = self.session.lock();
            session.ensure("save_calibration", WorkflowEvent::Saved)?;
            session.joints.clone()
        };

        let mut calibration = self.controller.get_calibration();
        for joint in &joints {
            let current = *calibration.get(joint.id)?;
            calibration.set(MotorCalibration {
                homing_offset: joint.homing_offset,
                range_min: joint.range_min,
                range_max: joint.range_max,
                ..current
            })?;
        }
        file::save(&calibration, &self.config.output)?;
        for joint in &joints {
            self.controller
                .write_position_limits(joint.id, joint.range_min, joint.range_max)?;
        }
        self.controller.set_calibration(calibration.clone())?;

        let mut session = self.session.lock();
        session.transition("save_calibration", WorkflowEvent::Saved)?;
        session.message = format!("calibration saved to {}", self.config.output.display());
        info!("Calibration saved to {}", self.config.output.display());
        Ok(calibration)
    }

    /// Abandon the run from any state. Stops the sampler; servo registers
    /// are left as they are.
    pub fn abort(&self) -> WorkflowState {
        let mut sampler = self.commands.lock();
        if let Some(mut running) = sampler.take() {
            running.stop();
        }
        let mut session = self.session.lock();
        let previous = session.machine.state();
        session.machine.handle_event(WorkflowEvent::Abort);
        session.reset_data();
        session.message = "aborted".to_string();
        info!(from = %previous, "Calibration aborted");
        session.machine.state()
    }

    /// Acknowledge an error and return to `Idle`.
    pub fn reset(&self) -> Result<WorkflowState, WorkflowError> {
        let _commands = self.commands.lock();
        let mut session = self.session.lock();
        let state = session.transition("reset", WorkflowEvent::Reset)?;
        session.reset_data();
        session.message = "ready".to_string();
        Ok(state)
    }

    /// Snapshot of the run.
    pub fn status(&self) -> WorkflowStatus {
        let session = self.session.lock();
        WorkflowStatus {
            state: session.machine.state(),
            message: session.message.clone(),
            joints: session.joints.clone(),
            samples_taken: session.samples_taken,
            history_len: session.history.len(),
            output: self.config.output.display().to_string(),
        }
    }

    /// Copy of the kept samples, oldest first.
    pub fn history(&self) -> Vec<PositionSample> {
        self.session.lock().history.iter().cloned().collect()
    }
}

impl Drop for CalibrationWorkflow {
    fn drop(&mut self) {
        if let Some(mut running) = self.commands.get_mut().take() {
            running.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        let mut s = Session::new(&[1, 2], 3);
        s.machine.handle_event(WorkflowEvent::Start);
        s.machine.handle_event(WorkflowEvent::HomingSet);
        s.machine.handle_event(WorkflowEvent::RecordingStarted);
        s
    }

    fn sample(a: u16, b: u16) -> BTreeMap<u8, u16> {
        BTreeMap::from([(1, a), (2, b)])
    }

    #[test]
    fn test_record_tracks_extremes() {
        let mut s = session();
        assert!(s.record(&sample(2000, 1000), Duration::ZERO));
        assert!(s.record(&sample(1500, 3000), Duration::from_millis(10)));
        assert_eq!(s.joints[0].recorded_min, 1500);
        assert_eq!(s.joints[0].recorded_max, 2000);
        assert_eq!(s.joints[1].recorded_min, 1000);
        assert_eq!(s.joints[1].current_pos, 3000);
        assert_eq!(s.samples_taken, 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut s = session();
        for i in 0..5u16 {
            s.record(&sample(i, i), Duration::from_millis(i as u64));
        }
        assert_eq!(s.history.len(), 3);
        assert_eq!(s.history.front().map(|p| p.elapsed_ms), Some(2));
        assert_eq!(s.samples_taken, 5);
    }

    #[test]
    fn test_record_stops_outside_recording() {
        let mut s = Session::new(&[1], 10);
        assert!(!s.record(&sample(1, 1), Duration::ZERO));
        assert!(s.history.is_empty());
    }

    #[test]
    fn test_single_reading_is_not_a_range() {
        let mut joint = JointCalibrationData::new(4);
        assert!(!joint.has_range());
        joint.recorded_min = 2047;
        joint.recorded_max = 2047;
        assert!(!joint.has_range());
        joint.recorded_max = 2048;
        assert!(joint.has_range());
    }
}
