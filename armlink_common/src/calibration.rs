//! Calibration engine.
//!
//! Converts between raw encoder counts and engineering units and owns
//! the calibration record types and their file format.
//!
//! - [`types`] - `MotorCalibration`, `FullCalibration`, norm/drive modes, validation
//! - [`normalize`] - raw ↔ normalized value conversion
//! - [`file`] - JSON calibration file (one key per joint name)

pub mod file;
pub mod normalize;
pub mod types;

pub use normalize::{degrees_to_radians, denormalize, normalize, radians_to_degrees};
pub use types::{CalibrationError, DriveMode, FullCalibration, MotorCalibration, NormMode};
