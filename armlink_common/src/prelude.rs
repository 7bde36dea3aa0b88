//! Prelude module for common re-exports.
//!
//! ```rust
//! use armlink_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    ArmConfig, BusConfig, ConfigError, ConfigLoader, LogLevel, ServoIdSet, SharedConfig,
    TimingConfig, WorkflowConfig,
};

// ─── Arm Constants ──────────────────────────────────────────────────
pub use crate::consts::{GRIPPER_ID, JOINT_NAMES, NUM_SERVOS, RAW_HOME, RAW_MAX, SERVO_IDS};

// ─── Calibration ────────────────────────────────────────────────────
pub use crate::calibration::{
    CalibrationError, DriveMode, FullCalibration, MotorCalibration, NormMode, denormalize,
    normalize,
};

// ─── Protocol ───────────────────────────────────────────────────────
pub use crate::protocol::{Frame, FrameDecoder, Instruction, ProtocolError, Register, ServoStatus};

// ─── Commands ───────────────────────────────────────────────────────
pub use crate::command::{ArmRequest, CommandError, Response, WorkflowRequest};
