//! Calibration file format.
//!
//! A JSON object keyed by joint name. Values are decoded with wide
//! integers so out-of-range numbers reach validation instead of failing
//! deserialization with an opaque message:
//!
//! ```json
//! {
//!   "shoulder_pan": { "id": 1, "drive_mode": 0, "homing_offset": -12,
//!                     "range_min": 812, "range_max": 3300, "norm_mode": 3 },
//!   ...
//! }
//! ```
//!
//! `norm_mode` is optional and defaults to degrees for arm joints and
//! 0..100 for the gripper.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::consts::{JOINT_NAMES, MAX_WIRE_ID, NUM_SERVOS, SERVO_IDS};

use super::types::{CalibrationError, DriveMode, FullCalibration, MotorCalibration, NormMode};

/// One joint as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointRecord {
    /// Servo ID.
    pub id: i64,
    /// 0 = normal, 1 = inverted.
    pub drive_mode: i64,
    /// Signed homing offset.
    pub homing_offset: i64,
    /// Lower raw bound.
    pub range_min: i64,
    /// Upper raw bound.
    pub range_max: i64,
    /// Norm mode code; absent means the joint default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub norm_mode: Option<i64>,
}

impl JointRecord {
    /// Check field ranges and narrow into a [`MotorCalibration`].
    pub fn into_motor(self) -> Result<MotorCalibration, CalibrationError> {
        if !(0..=MAX_WIRE_ID as i64).contains(&self.id) {
            return Err(CalibrationError::InvalidId(self.id));
        }
        let id = self.id as u8;
        if !SERVO_IDS.contains(&id) {
            return Err(CalibrationError::UnnamedId(self.id));
        }
        if self.range_min >= self.range_max {
            return Err(CalibrationError::DegenerateRange {
                id,
                min: self.range_min,
                max: self.range_max,
            });
        }
        let range_min = u16::try_from(self.range_min);
        let range_max = u16::try_from(self.range_max);
        let (Ok(range_min), Ok(range_max)) = (range_min, range_max) else {
            return Err(CalibrationError::RangeOutOfBounds {
                id,
                min: self.range_min,
                max: self.range_max,
            });
        };
        let homing_offset =
            i32::try_from(self.homing_offset).map_err(|_| CalibrationError::HomingOffsetOutOfRange {
                id,
                offset: self.homing_offset,
            })?;
        let drive_mode = u8::try_from(self.drive_mode)
            .ok()
            .and_then(|v| DriveMode::try_from(v).ok())
            .ok_or(CalibrationError::UnknownDriveMode(self.drive_mode))?;
        let norm_mode = match self.norm_mode {
            None => NormMode::default_for(id),
            Some(code) => u8::try_from(code)
                .ok()
                .and_then(NormMode::from_u8)
                .ok_or(CalibrationError::UnknownNormMode(code))?,
        };

        let motor = MotorCalibration {
            id,
            drive_mode,
            homing_offset,
            range_min,
            range_max,
            norm_mode,
        };
        motor.validate()?;
        Ok(motor)
    }
}

impl From<&MotorCalibration> for JointRecord {
    fn from(m: &MotorCalibration) -> Self {
        Self {
            id: m.id as i64,
            drive_mode: u8::from(m.drive_mode) as i64,
            homing_offset: m.homing_offset as i64,
            range_min: m.range_min as i64,
            range_max: m.range_max as i64,
            norm_mode: Some(u8::from(m.norm_mode) as i64),
        }
    }
}

impl TryFrom<BTreeMap<String, JointRecord>> for FullCalibration {
    type Error = CalibrationError;

    fn try_from(mut map: BTreeMap<String, JointRecord>) -> Result<Self, Self::Error> {
        let mut motors = SERVO_IDS.map(MotorCalibration::default_for);
        for (idx, &joint) in JOINT_NAMES.iter().enumerate() {
            let record = map.remove(joint).ok_or(CalibrationError::MissingJoint(joint))?;
            let motor = record.into_motor()?;
            if motor.id != SERVO_IDS[idx] {
                return Err(CalibrationError::IdMismatch {
                    joint,
                    expected: SERVO_IDS[idx],
                    actual: motor.id as i64,
                });
            }
            motors[idx] = motor;
        }
        if let Some(extra) = map.into_keys().next() {
            return Err(CalibrationError::UnknownJoint(extra));
        }
        FullCalibration::new(motors)
    }
}

impl Serialize for FullCalibration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(NUM_SERVOS))?;
        for (joint, motor) in JOINT_NAMES.iter().zip(self.iter()) {
            map.serialize_entry(joint, &JointRecord::from(motor))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FullCalibration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<String, JointRecord>::deserialize(deserializer)?;
        FullCalibration::try_from(map).map_err(de::Error::custom)
    }
}

/// Parse calibration JSON.
pub fn from_json_str(json: &str) -> Result<FullCalibration, CalibrationError> {
    let map: BTreeMap<String, JointRecord> = serde_json::from_str(json)?;
    FullCalibration::try_from(map)
}

/// Render calibration JSON, joints in ID order.
pub fn to_json_string(cal: &FullCalibration) -> Result<String, CalibrationError> {
    Ok(serde_json::to_string_pretty(cal)?)
}

/// Load and validate a calibration file.
pub fn load(path: &Path) -> Result<FullCalibration, CalibrationError> {
    let json = fs::read_to_string(path).map_err(|source| CalibrationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let cal = from_json_str(&json)?;
    debug!(path = %path.display(), "Calibration loaded");
    Ok(cal)
}

/// Load a calibration file, falling back to defaults with a warning when
/// no path is given or the file is unusable.
pub fn load_or_default(path: Option<&Path>) -> FullCalibration {
    let Some(path) = path else {
        info!("No calibration file configured, using defaults");
        return FullCalibration::default();
    };
    match load(path) {
        Ok(cal) => cal,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Calibration unusable, using defaults");
            FullCalibration::default()
        }
    }
}

/// Write a calibration file.
///
/// The JSON is written to a sibling temp file and renamed over the target
/// so readers never see a partial file.
pub fn save(cal: &FullCalibration, path: &Path) -> Result<(), CalibrationError> {
    let io_err = |source: std::io::Error| CalibrationError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = to_json_string(cal)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    info!(path = %path.display(), "Calibration saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> FullCalibration {
        let mut cal = FullCalibration::default();
        cal.set(MotorCalibration {
            id: 2,
            drive_mode: DriveMode::Inverted,
            homing_offset: -150,
            range_min: 812,
            range_max: 3300,
            norm_mode: NormMode::Degrees,
        })
        .unwrap();
        cal
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("calibration.json");
        let cal = sample();

        save(&cal, &path).unwrap();
        assert_eq!(load(&path).unwrap(), cal);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_json_keys_follow_joint_order() {
        let json = to_json_string(&sample()).unwrap();
        let positions: Vec<usize> = JOINT_NAMES
            .iter()
            .map(|j| json.find(&format!("\"{j}\"")).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_missing_norm_mode_uses_joint_default() {
        let mut value = serde_json::to_value(sample()).unwrap();
        for joint in JOINT_NAMES {
            value[joint].as_object_mut().unwrap().remove("norm_mode");
        }
        let cal = from_json_str(&value.to_string()).unwrap();
        assert_eq!(cal.get(1).unwrap().norm_mode, NormMode::Degrees);
        assert_eq!(cal.get(6).unwrap().norm_mode, NormMode::RangeZeroToHundred);
    }

    #[test]
    fn test_rejects_missing_joint() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value.as_object_mut().unwrap().remove("elbow_flex");
        assert!(matches!(
            from_json_str(&value.to_string()),
            Err(CalibrationError::MissingJoint("elbow_flex"))
        ));
    }

    #[test]
    fn test_rejects_foreign_or_wire_id() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["wrist_flex"]["id"] = serde_json::json!(300);
        assert!(matches!(
            from_json_str(&value.to_string()),
            Err(CalibrationError::InvalidId(300))
        ));

        value["wrist_flex"]["id"] = serde_json::json!(2);
        assert!(matches!(
            from_json_str(&value.to_string()),
            Err(CalibrationError::IdMismatch { joint: "wrist_flex", actual: 2, .. })
        ));

        let record = JointRecord {
            id: 300,
            drive_mode: 0,
            homing_offset: 0,
            range_min: 0,
            range_max: 4095,
            norm_mode: None,
        };
        assert!(matches!(record.into_motor(), Err(CalibrationError::InvalidId(300))));
    }

    #[test]
    fn test_rejects_bad_ranges() {
        let record = |min, max| JointRecord {
            id: 1,
            drive_mode: 0,
            homing_offset: 0,
            range_min: min,
            range_max: max,
            norm_mode: Some(3),
        };
        assert!(matches!(
            record(3000, 1000).into_motor(),
            Err(CalibrationError::DegenerateRange { .. })
        ));
        assert!(matches!(
            record(0, 70000).into_motor(),
            Err(CalibrationError::RangeOutOfBounds { .. })
        ));
        assert!(matches!(
            record(0, 4096).into_motor(),
            Err(CalibrationError::RangeOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_rejects_unknown_joint() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["tail"] = value["gripper"].clone();
        assert!(matches!(
            from_json_str(&value.to_string()),
            Err(CalibrationError::UnknownJoint(name)) if name == "tail"
        ));
    }

    #[test]
    fn test_load_or_default_falls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_or_default(Some(&path)), FullCalibration::default());
        assert_eq!(load_or_default(None), FullCalibration::default());
    }
}
