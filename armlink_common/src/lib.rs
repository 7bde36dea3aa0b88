//! armlink common library
//!
//! Shared types for the armlink workspace: the servo bus wire protocol,
//! the calibration engine, configuration loading and the command surface.
//! Nothing here touches a serial port.
//!
//! # Module Structure
//!
//! - [`consts`] - Arm geometry, register limits, timing defaults
//! - [`protocol`] - Frame codec, register map, status flags
//! - [`calibration`] - Normalization math, calibration records and file format
//! - [`config`] - TOML configuration loading
//! - [`command`] - JSON request/response surface
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```toml
//! [dependencies]
//! armlink = { package = "armlink_common", path = "../armlink_common" }
//! ```
//!
//! ```rust
//! use armlink_common::calibration::{normalize, MotorCalibration};
//!
//! let cal = MotorCalibration::default_for(1);
//! assert!(normalize(2047, &cal).abs() < 0.1);
//! ```

pub mod calibration;
pub mod command;
pub mod config;
pub mod consts;
pub mod prelude;
pub mod protocol;
