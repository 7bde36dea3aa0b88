//! Calibration record types and validation.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{
    GRIPPER_ID, JOINT_NAMES, MAX_WIRE_ID, MIN_GRIPPER_RANGE, MIN_JOINT_RANGE, NUM_SERVOS,
    RAW_MAX, SERVO_IDS, joint_name, servo_index,
};
use crate::protocol::registers::HOMING_OFFSET_SIGN_BIT;

/// Calibration validation and persistence errors.
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// ID does not fit on the wire.
    #[error("servo id {0} outside wire range 0..={MAX_WIRE_ID}")]
    InvalidId(i64),

    /// ID is valid on the wire but names no arm joint.
    #[error("servo id {0} is not an arm joint (expected 1..={NUM_SERVOS})")]
    UnnamedId(i64),

    /// `range_min >= range_max`.
    #[error("servo {id}: degenerate range [{min}, {max}]")]
    DegenerateRange {
        /// Servo ID.
        id: u8,
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
    },

    /// Range bound outside the encoder range.
    #[error("servo {id}: range [{min}, {max}] outside 0..={RAW_MAX}")]
    RangeOutOfBounds {
        /// Servo ID.
        id: u8,
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
    },

    /// Usable span below the joint minimum.
    #[error("joint {joint}: span {span} below minimum {min_span}")]
    SpanTooNarrow {
        /// Joint name.
        joint: &'static str,
        /// Calibrated span.
        span: u16,
        /// Required span.
        min_span: u16,
    },

    /// Homing offset does not fit the sign-magnitude register.
    #[error("servo {id}: homing offset {offset} out of range")]
    HomingOffsetOutOfRange {
        /// Servo ID.
        id: u8,
        /// Rejected offset.
        offset: i64,
    },

    /// Norm mode code outside the four known modes.
    #[error("unknown norm mode {0}")]
    UnknownNormMode(i64),

    /// Drive mode other than 0 or 1.
    #[error("unknown drive mode {0}")]
    UnknownDriveMode(i64),

    /// No calibration record for this servo.
    #[error("no calibration record for servo {0}")]
    UnknownServo(u8),

    /// Record stored under a joint name carries another joint's ID.
    #[error("joint {joint}: expected id {expected}, found {actual}")]
    IdMismatch {
        /// Joint name.
        joint: &'static str,
        /// ID of the joint.
        expected: u8,
        /// ID in the record.
        actual: i64,
    },

    /// Calibration file lacks a joint.
    #[error("missing calibration for joint {0}")]
    MissingJoint(&'static str),

    /// Calibration file names a joint the arm does not have.
    #[error("unknown joint '{0}'")]
    UnknownJoint(String),

    /// File could not be read or written.
    #[error("calibration file {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// File is not valid calibration JSON.
    #[error("calibration JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Engineering unit a joint position is normalized into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum NormMode {
    /// Raw encoder counts.
    Raw = 0,
    /// Percentage of the calibrated range, 0..100.
    RangeZeroToHundred = 1,
    /// Signed percentage around the range center, -100..100.
    RangeMinusHundredToHundred = 2,
    /// Degrees around the range center.
    #[default]
    Degrees = 3,
}

impl NormMode {
    /// Decode a norm mode code.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Raw),
            1 => Some(Self::RangeZeroToHundred),
            2 => Some(Self::RangeMinusHundredToHundred),
            3 => Some(Self::Degrees),
            _ => None,
        }
    }

    /// Mode used when a record does not specify one: degrees for arm
    /// joints, 0..100 for the gripper.
    #[inline]
    pub const fn default_for(id: u8) -> Self {
        if id == GRIPPER_ID {
            Self::RangeZeroToHundred
        } else {
            Self::Degrees
        }
    }
}

impl TryFrom<u8> for NormMode {
    type Error = CalibrationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or(CalibrationError::UnknownNormMode(value as i64))
    }
}

impl From<NormMode> for u8 {
    fn from(mode: NormMode) -> Self {
        mode as u8
    }
}

/// Mechanical direction of a joint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum DriveMode {
    /// Nominal direction.
    #[default]
    Normal = 0,
    /// Direction inverted relative to the nominal convention.
    Inverted = 1,
}

impl DriveMode {
    /// True for [`DriveMode::Inverted`].
    #[inline]
    pub const fn is_inverted(self) -> bool {
        matches!(self, Self::Inverted)
    }
}

impl TryFrom<u8> for DriveMode {
    type Error = CalibrationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Inverted),
            other => Err(CalibrationError::UnknownDriveMode(other as i64)),
        }
    }
}

impl From<DriveMode> for u8 {
    fn from(mode: DriveMode) -> Self {
        mode as u8
    }
}

/// Calibration of a single servo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorCalibration {
    /// Bus ID (1..=6).
    pub id: u8,
    /// Direction inversion.
    pub drive_mode: DriveMode,
    /// Signed homing offset written to the servo.
    pub homing_offset: i32,
    /// Lower end of the usable raw range.
    pub range_min: u16,
    /// Upper end of the usable raw range.
    pub range_max: u16,
    /// Engineering unit.
    pub norm_mode: NormMode,
}

impl MotorCalibration {
    /// Uncalibrated record: full encoder range, no offset, joint default unit.
    pub const fn default_for(id: u8) -> Self {
        Self {
            id,
            drive_mode: DriveMode::Normal,
            homing_offset: 0,
            range_min: 0,
            range_max: RAW_MAX,
            norm_mode: NormMode::default_for(id),
        }
    }

    /// Joint name of this servo.
    pub fn joint_name(&self) -> Option<&'static str> {
        joint_name(self.id)
    }

    /// Range center in raw counts.
    #[inline]
    pub fn center(&self) -> f64 {
        (self.range_min as f64 + self.range_max as f64) / 2.0
    }

    /// Calibrated span in raw counts.
    #[inline]
    pub fn span(&self) -> u16 {
        self.range_max.saturating_sub(self.range_min)
    }

    /// Field-level validation.
    ///
    /// # Errors
    ///
    /// - `InvalidId` / `UnnamedId` for IDs outside the wire or joint range
    /// - `DegenerateRange` when `range_min >= range_max`
    /// - `RangeOutOfBounds` when a bound exceeds the encoder range
    /// - `HomingOffsetOutOfRange` when the offset does not fit the register
    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.id > MAX_WIRE_ID {
            return Err(CalibrationError::InvalidId(self.id as i64));
        }
        if servo_index(self.id).is_none() {
            return Err(CalibrationError::UnnamedId(self.id as i64));
        }
        if self.range_min >= self.range_max {
            return Err(CalibrationError::DegenerateRange {
                id: self.id,
                min: self.range_min as i64,
                max: self.range_max as i64,
            });
        }
        if self.range_max > RAW_MAX {
            return Err(CalibrationError::RangeOutOfBounds {
                id: self.id,
                min: self.range_min as i64,
                max: self.range_max as i64,
            });
        }
        let offset_max = (1i32 << HOMING_OFFSET_SIGN_BIT) - 1;
        if self.homing_offset.abs() > offset_max {
            return Err(CalibrationError::HomingOffsetOutOfRange {
                id: self.id,
                offset: self.homing_offset as i64,
            });
        }
        Ok(())
    }

    /// Field-level validation plus the joint-specific minimum span.
    pub fn validate_for_arm(&self) -> Result<(), CalibrationError> {
        self.validate()?;
        let min_span = if self.id == GRIPPER_ID {
            MIN_GRIPPER_RANGE
        } else {
            MIN_JOINT_RANGE
        };
        if self.span() < min_span {
            return Err(CalibrationError::SpanTooNarrow {
                joint: self.joint_name().unwrap_or("unknown"),
                span: self.span(),
                min_span,
            });
        }
        Ok(())
    }
}

/// Calibration of the whole arm: one record per servo, in ID order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullCalibration {
    motors: [MotorCalibration; NUM_SERVOS],
}

impl FullCalibration {
    /// Build from six records in ID order and validate the set.
    pub fn new(motors: [MotorCalibration; NUM_SERVOS]) -> Result<Self, CalibrationError> {
        let cal = Self { motors };
        cal.validate()?;
        Ok(cal)
    }

    /// Record for a servo.
    ///
    /// # Errors
    /// `UnknownServo` if the ID has no record; never falls back to a default.
    pub fn get(&self, id: u8) -> Result<&MotorCalibration, CalibrationError> {
        servo_index(id)
            .map(|idx| &self.motors[idx])
            .ok_or(CalibrationError::UnknownServo(id))
    }

    /// Replace one record after validating it.
    pub fn set(&mut self, motor: MotorCalibration) -> Result<(), CalibrationError> {
        motor.validate_for_arm()?;
        let idx = servo_index(motor.id).ok_or(CalibrationError::UnknownServo(motor.id))?;
        self.motors[idx] = motor;
        Ok(())
    }

    /// Iterate over records in ID order.
    pub fn iter(&self) -> impl Iterator<Item = &MotorCalibration> {
        self.motors.iter()
    }

    /// Records as an array.
    pub fn motors(&self) -> &[MotorCalibration; NUM_SERVOS] {
        &self.motors
    }

    /// Full-arm validation: every record valid, stored in its own slot,
    /// and wide enough to be usable.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        for (idx, motor) in self.motors.iter().enumerate() {
            let expected = SERVO_IDS[idx];
            if motor.id != expected {
                return Err(CalibrationError::IdMismatch {
                    joint: JOINT_NAMES[idx],
                    expected,
                    actual: motor.id as i64,
                });
            }
            motor.validate_for_arm()?;
        }
        Ok(())
    }
}

impl Default for FullCalibration {
    fn default() -> Self {
        Self {
            motors: SERVO_IDS.map(MotorCalibration::default_for),
        }
    }
}
