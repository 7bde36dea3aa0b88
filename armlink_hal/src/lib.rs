//! # Armlink HAL Library
//!
//! Serial-bus driver for a six-servo arm: bus access, calibrated joint
//! control shared between independent callers, and the interactive
//! calibration workflow.
//!
//! # Module Structure
//!
//! - [`links`] - Serial port and simulated arm links
//! - [`bus`] - Servo bus: framing, pacing, retries
//! - [`controller`] - Joint-space controller over a calibrated bus
//! - [`registry`] - One shared controller per serial port
//! - [`workflow`] - Calibration state machine and range sampler
//! - [`dispatch`] - JSON command routing
//! - [`error`] - Error types
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       armlink_hal                                │
//! │  ┌─────────────┐    ┌──────────────────┐    ┌─────────────────┐  │
//! │  │  dispatch   │───►│ SharedController │◄───│ Calibration     │  │
//! │  │  (JSON)     │    │ (radians ⇄ raw)  │    │ Workflow        │  │
//! │  └─────────────┘    └────────┬─────────┘    └─────────────────┘  │
//! │        ControllerRegistry ───┤  one per port, ref-counted        │
//! │                              ▼                                   │
//! │                     ┌──────────────────┐                         │
//! │                     │    ServoBus      │                         │
//! │                     └────────┬─────────┘                         │
//! │                              ▼                                   │
//! │                     ┌──────────────────┐                         │
//! │                     │   SerialLink     │ (trait object)          │
//! │                     └──────────────────┘                         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod bus;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod links;
pub mod registry;
pub mod workflow;

// Re-export key types for convenience
pub use crate::bus::ServoBus;
pub use crate::controller::SharedController;
pub use crate::error::{BusError, ControllerError, RegistryError, WorkflowError};
pub use crate::registry::{CalibrationSource, ControllerHandle, ControllerRegistry};
pub use crate::workflow::{CalibrationWorkflow, WorkflowState};
