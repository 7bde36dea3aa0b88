//! Command and response surface for higher-level components.
//!
//! Requests are JSON objects `{"op": "<name>", "params": {...}}` decoded
//! into tagged enums, one strongly-typed parameter struct per operation.
//! Unknown operations, unknown fields and missing required parameters are
//! rejected; nothing is defaulted except explicitly optional fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::calibration::FullCalibration;
use crate::protocol::Register;

/// Request decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Not a JSON object with a string `op`.
    #[error("request must be an object with a string 'op' field")]
    MissingOp,

    /// `op` names no operation of this surface.
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    /// Parameters missing, mistyped or unexpected.
    #[error("invalid parameters for '{op}': {reason}")]
    InvalidParams {
        /// Operation name.
        op: String,
        /// Decoder message.
        reason: String,
    },

    /// Request is not JSON.
    #[error("malformed request: {0}")]
    Malformed(String),
}

// ─── Parameter structs ──────────────────────────────────────────────

/// Move every servo of the arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MoveParams {
    /// Target angles in radians, one per servo in ID order.
    pub positions: Vec<f64>,
    /// Optional goal velocity.
    #[serde(default)]
    pub speed: Option<u16>,
    /// Optional acceleration.
    #[serde(default)]
    pub acceleration: Option<u8>,
}

/// Move a subset of servos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MoveServosParams {
    /// Servos to move.
    pub servo_ids: Vec<u8>,
    /// Target angles in radians, parallel to `servo_ids`.
    pub positions: Vec<f64>,
    /// Optional goal velocity.
    #[serde(default)]
    pub speed: Option<u16>,
    /// Optional acceleration.
    #[serde(default)]
    pub acceleration: Option<u8>,
}

/// Servo subset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServoIdsParams {
    /// Servos to address.
    pub servo_ids: Vec<u8>,
}

/// Torque switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TorqueParams {
    /// Enable or disable holding torque.
    pub enable: bool,
}

/// Calibration replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationParams {
    /// New calibration, keyed by joint name.
    pub calibration: FullCalibration,
}

/// Register read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadRegisterParams {
    /// Target servo.
    pub servo_id: u8,
    /// Register name.
    #[serde(with = "register_name")]
    pub register: Register,
}

/// Register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteRegisterParams {
    /// Target servo.
    pub servo_id: u8,
    /// Register name.
    #[serde(with = "register_name")]
    pub register: Register,
    /// Value to write.
    pub value: i32,
}

mod register_name {
    use serde::{Deserialize, Deserializer, Serializer, de};

    use crate::protocol::Register;

    pub fn serialize<S: Serializer>(register: &Register, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(register.name())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Register, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(de::Error::custom)
    }
}

// ─── Requests ───────────────────────────────────────────────────────

/// Operations on an arm or gripper controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "params", rename_all = "snake_case", deny_unknown_fields)]
pub enum ArmRequest {
    /// Move all servos.
    MoveToPositions(MoveParams),
    /// Move a servo subset.
    MoveServosToPositions(MoveServosParams),
    /// Read all joint angles.
    GetJointPositions,
    /// Read a subset of joint angles.
    GetJointPositionsForServos(ServoIdsParams),
    /// Raw encoder readings.
    ReadRawPositions(ServoIdsParams),
    /// Enable or disable torque.
    SetTorqueEnable(TorqueParams),
    /// Hold current positions.
    Stop,
    /// Ping every servo.
    Ping,
    /// Current calibration.
    GetCalibration,
    /// Replace calibration.
    SetCalibration(CalibrationParams),
    /// Read one register.
    ReadRegister(ReadRegisterParams),
    /// Write one register.
    WriteRegister(WriteRegisterParams),
}

impl ArmRequest {
    /// Every operation name.
    pub const OPS: &'static [&'static str] = &[
        "move_to_positions",
        "move_servos_to_positions",
        "get_joint_positions",
        "get_joint_positions_for_servos",
        "read_raw_positions",
        "set_torque_enable",
        "stop",
        "ping",
        "get_calibration",
        "set_calibration",
        "read_register",
        "write_register",
    ];

    /// Decode a JSON request.
    pub fn from_json(json: &str) -> Result<Self, CommandError> {
        decode_request(json, Self::OPS)
    }
}

/// Operations on the calibration workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "params", rename_all = "snake_case", deny_unknown_fields)]
pub enum WorkflowRequest {
    /// Begin a calibration.
    Start,
    /// Capture the homing pose.
    SetHoming,
    /// Begin range sampling.
    StartRangeRecording,
    /// End range sampling.
    StopRangeRecording,
    /// Persist and apply the recorded calibration.
    SaveCalibration,
    /// Abandon the calibration.
    Abort,
    /// Leave the error state.
    Reset,
    /// Workflow snapshot.
    Status,
    /// Recorded sample history.
    History,
}

impl WorkflowRequest {
    /// Every operation name.
    pub const OPS: &'static [&'static str] = &[
        "start",
        "set_homing",
        "start_range_recording",
        "stop_range_recording",
        "save_calibration",
        "abort",
        "reset",
        "status",
        "history",
    ];

    /// Decode a JSON request.
    pub fn from_json(json: &str) -> Result<Self, CommandError> {
        decode_request(json, Self::OPS)
    }

    /// snake_case operation name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::SetHoming => "set_homing",
            Self::StartRangeRecording => "start_range_recording",
            Self::StopRangeRecording => "stop_range_recording",
            Self::SaveCalibration => "save_calibration",
            Self::Abort => "abort",
            Self::Reset => "reset",
            Self::Status => "status",
            Self::History => "history",
        }
    }
}

fn decode_request<T: serde::de::DeserializeOwned>(
    json: &str,
    ops: &[&str],
) -> Result<T, CommandError> {
    let value: Value =
        serde_json::from_str(json).map_err(|e| CommandError::Malformed(e.to_string()))?;
    let op = value
        .get("op")
        .and_then(Value::as_str)
        .ok_or(CommandError::MissingOp)?
        .to_string();
    if !ops.contains(&op.as_str()) {
        return Err(CommandError::UnknownOperation(op));
    }
    serde_json::from_value(value).map_err(|e| CommandError::InvalidParams {
        op,
        reason: e.to_string(),
    })
}

// ─── Responses ──────────────────────────────────────────────────────

/// Result bag plus success flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Operation result; `null` on failure.
    #[serde(default)]
    pub result: Value,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// Successful response carrying `result`.
    pub fn ok(result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self {
                success: true,
                result,
                error: None,
            },
            Err(e) => Self::error(format!("result not serializable: {e}")),
        }
    }

    /// Successful response without payload.
    pub fn done() -> Self {
        Self {
            success: true,
            result: Value::Null,
            error: None,
        }
    }

    /// Failed response.
    pub fn error(message: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: Some(message.to_string()),
        }
    }
}

impl<T: Serialize, E: std::fmt::Display> From<Result<T, E>> for Response {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(v) => Self::ok(v),
            Err(e) => Self::error(e),
        }
    }
}
