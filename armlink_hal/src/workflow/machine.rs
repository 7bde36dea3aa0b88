//! Calibration workflow states and transitions.
//!
//! Idle → Started → HomingPosition → RangeRecording → Completed → Idle,
//! with Error reachable from a failed recording and Abort returning to
//! Idle from anywhere.

use std::fmt;

use serde::Serialize;

/// Calibration workflow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// No calibration in progress.
    #[default]
    Idle,
    /// Torque off, waiting for the operator to pose the arm at home.
    Started,
    /// Homing offsets written.
    HomingPosition,
    /// Sampler tracking the range of motion.
    RangeRecording,
    /// Ranges recorded, ready to save.
    Completed,
    /// Recording failed; needs `reset` or a new `start`.
    Error,
}

impl WorkflowState {
    /// Snake-case name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Started => "started",
            Self::HomingPosition => "homing_position",
            Self::RangeRecording => "range_recording",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a transition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition succeeded, new state.
    Ok(WorkflowState),
    /// Transition rejected, reason.
    Rejected(&'static str),
}

/// Event driving the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowEvent {
    /// Operator started a calibration.
    Start,
    /// Homing offsets written.
    HomingSet,
    /// Sampler running.
    RecordingStarted,
    /// Every joint moved through a usable range.
    RecordingAccepted,
    /// At least one joint never moved.
    RecordingRejected,
    /// Calibration file written and limits pushed.
    Saved,
    /// Operator abandoned the calibration.
    Abort,
    /// Operator acknowledged an error.
    Reset,
}

/// Workflow state holder.
#[derive(Debug, Clone, Default)]
pub struct WorkflowMachine {
    state: WorkflowState,
}

impl WorkflowMachine {
    /// Machine in `Idle`.
    pub const fn new() -> Self {
        Self {
            state: WorkflowState::Idle,
        }
    }

    /// Current state.
    #[inline]
    pub const fn state(&self) -> WorkflowState {
        self.state
    }

    /// Target of `event` from the current state, without applying it.
    pub fn peek(&self, event: WorkflowEvent) -> TransitionResult {
        use WorkflowEvent::*;
        use WorkflowState::*;

        let next = match (self.state, event) {
            (Idle | Completed | Error, Start) => Started,
            (Started, HomingSet) => HomingPosition,
            (HomingPosition, RecordingStarted) => RangeRecording,
            (RangeRecording, RecordingAccepted) => Completed,
            (RangeRecording, RecordingRejected) => Error,
            (Completed, Saved) => Idle,
            (_, Abort) => Idle,
            (Error, Reset) => Idle,
            _ => return TransitionResult::Rejected(rejection_reason(event)),
        };
        TransitionResult::Ok(next)
    }

    /// Apply `event`. A rejected event leaves the state unchanged.
    pub fn handle_event(&mut self, event: WorkflowEvent) -> TransitionResult {
        let result = self.peek(event);
        if let TransitionResult::Ok(next) = result {
            self.state = next;
        }
        result
    }

    /// Force the machine into `Error`.
    #[inline]
    pub fn force_error(&mut self) {
        self.state = WorkflowState::Error;
    }
}

fn rejection_reason(event: WorkflowEvent) -> &'static str {
    use WorkflowEvent::*;
    match event {
        Start => "start requires idle, completed or error",
        HomingSet => "set_homing requires started",
        RecordingStarted => "start_range_recording requires homing_position",
        RecordingAccepted | RecordingRejected => "stop_range_recording requires range_recording",
        Saved => "save_calibration requires completed",
        Reset => "reset requires error",
        Abort => "abort is always accepted",
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
