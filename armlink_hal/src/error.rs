//! Error types for bus, controller, registry and workflow operations.

use std::time::Duration;

use armlink_common::calibration::CalibrationError;
use armlink_common::config::ConfigError;
use armlink_common::protocol::{ProtocolError, ServoStatus};
use thiserror::Error;

use crate::workflow::WorkflowState;

/// Wire and transport errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// Serial port could not be opened.
    #[error("failed to open {port}: {reason}")]
    Open {
        /// Device path.
        port: String,
        /// Driver message.
        reason: String,
    },

    /// Bus was closed; no further traffic is possible.
    #[error("bus on {port} is closed")]
    Closed {
        /// Device path.
        port: String,
    },

    /// Link-level I/O failure.
    #[error("serial I/O: {0}")]
    Io(#[from] std::io::Error),

    /// No complete response arrived in time.
    #[error("servo {id}: no response within {waited:?}")]
    Timeout {
        /// Addressed servo.
        id: u8,
        /// Time spent waiting.
        waited: Duration,
    },

    /// Response failed framing or checksum verification.
    #[error("servo {id}: {source}")]
    Protocol {
        /// Addressed servo.
        id: u8,
        /// Codec error.
        source: ProtocolError,
    },

    /// A different servo answered.
    #[error("expected response from servo {expected}, got servo {actual}")]
    UnexpectedId {
        /// Addressed servo.
        expected: u8,
        /// Responding servo.
        actual: u8,
    },

    /// Servo reported a fault in its status byte.
    #[error("servo {id} reported fault {status:?}")]
    ServoFault {
        /// Responding servo.
        id: u8,
        /// Fault flags.
        status: ServoStatus,
    },

    /// Response carried the wrong number of data bytes.
    #[error("servo {id}: expected {expected} data byte(s), got {actual}")]
    ShortResponse {
        /// Responding servo.
        id: u8,
        /// Requested length.
        expected: usize,
        /// Received length.
        actual: usize,
    },

    /// Read attempt budget exhausted.
    #[error("servo {id}: giving up after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        /// Failing servo.
        id: u8,
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        #[source]
        last: Box<BusError>,
    },

    /// Parallel ID and value arrays differ in length.
    #[error("{ids} servo id(s) but {values} value(s)")]
    LengthMismatch {
        /// Number of IDs.
        ids: usize,
        /// Number of values.
        values: usize,
    },

    /// Register name not in the control table.
    #[error("unknown register '{0}'")]
    UnknownRegister(String),

    /// Outgoing frame or register value could not be encoded.
    #[error("encode: {0}")]
    Encode(#[from] ProtocolError),
}

impl BusError {
    /// Servo the error is attributed to, if any.
    pub fn servo_id(&self) -> Option<u8> {
        match self {
            Self::Timeout { id, .. }
            | Self::Protocol { id, .. }
            | Self::ServoFault { id, .. }
            | Self::ShortResponse { id, .. }
            | Self::RetriesExhausted { id, .. } => Some(*id),
            Self::UnexpectedId { expected, .. } => Some(*expected),
            _ => None,
        }
    }

    /// Whether another read attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Protocol { .. }
                | Self::UnexpectedId { .. }
                | Self::ShortResponse { .. }
        )
    }
}

/// Joint-space operation errors.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Bus operation failed.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Calibration missing or invalid.
    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    /// Angle and servo arrays differ in length.
    #[error("{ids} servo id(s) but {positions} position(s)")]
    LengthMismatch {
        /// Number of IDs.
        ids: usize,
        /// Number of angles.
        positions: usize,
    },

    /// Sync read returned no position for a requested servo.
    #[error("no position reading for servo {id}")]
    MissingReading {
        /// Servo without a reading.
        id: u8,
    },

    /// A servo did not answer a ping.
    #[error("ping failed for servo {id}: {source}")]
    PingFailed {
        /// Silent servo.
        id: u8,
        /// Bus error.
        source: BusError,
    },
}

/// Controller registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Port already open with incompatible settings.
    #[error(
        "port {port} already open with {existing}, requested {requested} (ref count {ref_count})"
    )]
    ConfigConflict {
        /// Device path.
        port: String,
        /// Settings of the live controller.
        existing: String,
        /// Rejected settings.
        requested: String,
        /// Live reference count.
        ref_count: i64,
    },

    /// Controller bring-up failed; the failure stays cached until the port
    /// is force-closed.
    #[error("controller for {port} unavailable: {reason}")]
    BringUpFailed {
        /// Device path.
        port: String,
        /// Cached failure.
        reason: String,
    },

    /// Handle does not belong to a live entry.
    #[error("handle for {port} is not live")]
    StaleHandle {
        /// Device path.
        port: String,
    },

    /// Bus settings rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Bus could not be opened.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Supplied calibration rejected.
    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    /// Calibration hot-update failed.
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

/// Calibration workflow errors.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Command not valid in the current state.
    #[error("cannot {command} while {state}")]
    InvalidTransition {
        /// Rejected command.
        command: &'static str,
        /// Current state.
        state: WorkflowState,
    },

    /// Joints whose recorded range is empty.
    #[error("no range of motion recorded for: {}", joints.join(", "))]
    DegenerateRange {
        /// Offending joint names.
        joints: Vec<&'static str>,
    },

    /// Controller operation failed.
    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// Recorded calibration rejected or not saved.
    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    /// Sampler thread could not be started.
    #[error("failed to start range sampler: {0}")]
    Spawn(#[source] std::io::Error),
}
