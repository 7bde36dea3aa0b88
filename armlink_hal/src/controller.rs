//! Joint-space controller over a calibrated servo bus.
//!
//! Angles cross the API in radians. On the way down they are converted to
//! degrees and then denormalized through each joint's calibration; joints
//! calibrated in a non-degree unit (the gripper's 0..100 by default) take
//! the degree-scaled value as a value in that unit. Readings follow the
//! same path in reverse.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use armlink_common::calibration::{
    FullCalibration, MotorCalibration, degrees_to_radians, denormalize, normalize,
    radians_to_degrees,
};
use armlink_common::consts::{RAW_MAX, REGISTER_SETTLE_MS, SERVO_IDS};
use armlink_common::protocol::Register;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::bus::ServoBus;
use crate::error::ControllerError;

/// Controller shared by every component driving one arm.
///
/// Lock order: `move_lock` before the bus lock; the calibration lock is
/// never held across bus I/O.
pub struct SharedController {
    bus: Arc<ServoBus>,
    calibration: RwLock<FullCalibration>,
    move_lock: Mutex<()>,
}

impl SharedController {
    /// Bind the six arm servos on `bus` to `calibration`.
    pub fn new(bus: Arc<ServoBus>, calibration: FullCalibration) -> Self {
        Self {
            bus,
            calibration: RwLock::new(calibration),
            move_lock: Mutex::new(()),
        }
    }

    /// Underlying bus.
    pub fn bus(&self) -> &Arc<ServoBus> {
        &self.bus
    }

    /// All servo IDs of the arm.
    pub fn servo_ids(&self) -> &'static [u8] {
        &SERVO_IDS
    }

    // ─── Motion ─────────────────────────────────────────────────────

    /// Move every servo, angles in ID order.
    pub fn move_to_positions(
        &self,
        angles_rad: &[f64],
        speed: Option<u16>,
        acceleration: Option<u8>,
    ) -> Result<(), ControllerError> {
        self.move_servos_to_positions(&SERVO_IDS, angles_rad, speed, acceleration)
    }

    /// Move a subset of servos. Velocity and acceleration, when given, are
    /// written to the same servos before the goal positions.
    pub fn move_servos_to_positions(
        &self,
        ids: &[u8],
        angles_rad: &[f64],
        speed: Option<u16>,
        acceleration: Option<u8>,
    ) -> Result<(), ControllerError> {
        if ids.len() != angles_rad.len() {
            return Err(ControllerError::LengthMismatch {
                ids: ids.len(),
                positions: angles_rad.len(),
            });
        }
        let targets = {
            let calibration = self.calibration.read();
            ids.iter()
                .zip(angles_rad)
                .map(|(&id, &angle)| {
                    let motor = calibration.get(id)?;
                    Ok(denormalize(radians_to_degrees(angle), motor))
                })
                .collect::<Result<Vec<u16>, ControllerError>>()?
        };

        let _guard = self.move_lock.lock();
        if let Some(speed) = speed {
            self.bus
                .sync_write_register(Register::GoalVelocity, ids, speed as i32)?;
        }
        if let Some(acceleration) = acceleration {
            self.bus
                .sync_write_register(Register::Acceleration, ids, acceleration as i32)?;
        }
        self.bus.sync_write_positions(ids, &targets)?;
        debug!(?ids, ?targets, "Goal positions written");
        Ok(())
    }

    /// Hold every servo at its current position.
    pub fn stop(&self) -> Result<(), ControllerError> {
        let _guard = self.move_lock.lock();
        let positions = self.bus.sync_read_positions(&SERVO_IDS)?;
        let (ids, raws): (Vec<u8>, Vec<u16>) = positions.into_iter().unzip();
        self.bus.sync_write_positions(&ids, &raws)?;
        info!("Arm stopped at current positions");
        Ok(())
    }

    /// Enable or disable holding torque on every servo.
    pub fn set_torque_enable(&self, enable: bool) -> Result<(), ControllerError> {
        self.set_torque_enable_for(&SERVO_IDS, enable)
    }

    /// Enable or disable holding torque on a subset.
    pub fn set_torque_enable_for(&self, ids: &[u8], enable: bool) -> Result<(), ControllerError> {
        self.bus
            .sync_write_register(Register::TorqueEnable, ids, enable as i32)?;
        info!(?ids, enable, "Torque switched");
        Ok(())
    }

    // ─── Readback ───────────────────────────────────────────────────

    /// Joint angles of every servo, radians in ID order.
    pub fn get_joint_positions(&self) -> Result<Vec<f64>, ControllerError> {
        self.get_joint_positions_for_servos(&SERVO_IDS)
    }

    /// Joint angles of a subset, radians in the order of `ids`.
    pub fn get_joint_positions_for_servos(&self, ids: &[u8]) -> Result<Vec<f64>, ControllerError> {
        let motors = self.motors_for(ids)?;
        let raw = self.bus.sync_read_positions(ids)?;
        ids.iter()
            .zip(&motors)
            .map(|(id, motor)| {
                let value = raw
                    .get(id)
                    .copied()
                    .ok_or(ControllerError::MissingReading { id: *id })?;
                Ok(degrees_to_radians(normalize(value, motor)))
            })
            .collect()
    }

    /// Raw encoder readings.
    pub fn read_raw_positions(&self, ids: &[u8]) -> Result<BTreeMap<u8, u16>, ControllerError> {
        Ok(self.bus.sync_read_positions(ids)?)
    }

    /// Ping every servo; the error names the first silent one.
    pub fn ping(&self) -> Result<(), ControllerError> {
        for &id in &SERVO_IDS {
            self.bus
                .ping(id)
                .map_err(|source| ControllerError::PingFailed { id, source })?;
        }
        Ok(())
    }

    // ─── Registers ──────────────────────────────────────────────────

    /// Read one register.
    pub fn read_register(&self, id: u8, register: Register) -> Result<i32, ControllerError> {
        Ok(self.bus.read_register(id, register)?)
    }

    /// Write one register.
    pub fn write_register(
        &self,
        id: u8,
        register: Register,
        value: i32,
    ) -> Result<(), ControllerError> {
        Ok(self.bus.write_register(id, register, value)?)
    }

    /// Write EEPROM registers of one servo with the lock released.
    fn write_eeprom(&self, id: u8, writes: &[(Register, i32)]) -> Result<(), ControllerError> {
        self.bus.write_register(id, Register::Lock, 0)?;
        let written = writes
            .iter()
            .try_for_each(|&(register, value)| self.bus.write_register(id, register, value));
        self.bus.write_register(id, Register::Lock, 1)?;
        Ok(written?)
    }

    /// Restore factory homing offset and position limits, then wait for
    /// the servos to apply them.
    pub fn reset_calibration_registers(&self, ids: &[u8]) -> Result<(), ControllerError> {
        for &id in ids {
            self.write_eeprom(
                id,
                &[
                    (Register::HomingOffset, 0),
                    (Register::MinPositionLimit, 0),
                    (Register::MaxPositionLimit, RAW_MAX as i32),
                ],
            )?;
        }
        thread::sleep(Duration::from_millis(REGISTER_SETTLE_MS));
        debug!(?ids, "Calibration registers reset");
        Ok(())
    }

    /// Write one servo's homing offset.
    pub fn write_homing_offset(&self, id: u8, offset: i32) -> Result<(), ControllerError> {
        self.write_eeprom(id, &[(Register::HomingOffset, offset)])
    }

    /// Write one servo's position limits.
    pub fn write_position_limits(&self, id: u8, min: u16, max: u16) -> Result<(), ControllerError> {
        self.write_eeprom(
            id,
            &[
                (Register::MinPositionLimit, min as i32),
                (Register::MaxPositionLimit, max as i32),
            ],
        )
    }

    /// Push homing offsets and position limits of the current calibration
    /// to every servo.
    pub fn write_calibration_to_bus(&self) -> Result<(), ControllerError> {
        let calibration = self.get_calibration();
        for motor in calibration.iter() {
            self.write_eeprom(
                motor.id,
                &[
                    (Register::HomingOffset, motor.homing_offset),
                    (Register::MinPositionLimit, motor.range_min as i32),
                    (Register::MaxPositionLimit, motor.range_max as i32),
                ],
            )?;
        }
        info!(port = %self.bus.port(), "Calibration written to servos");
        Ok(())
    }

    // ─── Calibration ────────────────────────────────────────────────

    /// Replace the calibration after full-arm validation; on error the
    /// current calibration is kept.
    pub fn set_calibration(&self, calibration: FullCalibration) -> Result<(), ControllerError> {
        calibration.validate()?;
        *self.calibration.write() = calibration;
        info!(port = %self.bus.port(), "Calibration updated");
        Ok(())
    }

    /// Snapshot of the current calibration.
    pub fn get_calibration(&self) -> FullCalibration {
        self.calibration.read().clone()
    }

    fn motors_for(&self, ids: &[u8]) -> Result<Vec<MotorCalibration>, ControllerError> {
        let calibration = self.calibration.read();
        ids.iter()
            .map(|&id| calibration.get(id).copied().map_err(ControllerError::from))
            .collect()
    }
}

impl std::fmt::Debug for SharedController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedController")
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::SimulatedArm;
    use armlink_common::calibration::{DriveMode, NormMode};
    use armlink_common::config::{BusConfig, TimingConfig};
    use armlink_common::protocol::Instruction;
    use std::f64::consts::FRAC_PI_4;

    fn controller(arm: &SimulatedArm) -> SharedController {
        let bus = ServoBus::new(
            Box::new(arm.link("sim")),
            BusConfig::for_port("sim"),
            TimingConfig::immediate(),
        );
        SharedController::new(Arc::new(bus), FullCalibration::default())
    }

    #[test]
    fn test_length_mismatch_touches_nothing() {
        let arm = SimulatedArm::new();
        let ctl = controller(&arm);
        let err = ctl
            .move_servos_to_positions(&[1, 2], &[0.0], None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            ControllerError::LengthMismatch { ids: 2, positions: 1 }
        ));
        assert_eq!(arm.frame_count(Instruction::SyncWrite), 0);
    }

    #[test]
    fn test_unknown_servo_is_an_error() {
        let arm = SimulatedArm::new();
        let ctl = controller(&arm);
        assert!(matches!(
            ctl.move_servos_to_positions(&[9], &[0.0], None, None),
            Err(ControllerError::Calibration(_))
        ));
        assert!(ctl.get_joint_positions_for_servos(&[1, 9]).is_err());
    }

    #[test]
    fn test_move_then_read_back() {
        let arm = SimulatedArm::new();
        let ctl = controller(&arm);
        let target = [0.0, FRAC_PI_4, -FRAC_PI_4, 0.5, -0.5, 0.0];
        ctl.move_to_positions(&target, None, None).unwrap();

        let read = ctl.get_joint_positions().unwrap();
        for (want, got) in target.iter().zip(&read).take(5) {
            // One encoder count is 360/4095 degrees.
            assert!((want - got).abs() < degrees_to_radians(0.2), "{want} vs {got}");
        }
    }

    #[test]
    fn test_speed_and_acceleration_written_first() {
        let arm = SimulatedArm::new();
        let ctl = controller(&arm);
        ctl.move_servos_to_positions(&[2, 3], &[0.1, 0.2], Some(300), Some(20))
            .unwrap();
        assert_eq!(arm.register(2, Register::GoalVelocity), Some(300));
        assert_eq!(arm.register(3, Register::Acceleration), Some(20));
        assert_eq!(arm.register(1, Register::GoalVelocity), Some(0));
        assert_eq!(arm.frame_count(Instruction::SyncWrite), 3);
    }

    #[test]
    fn test_inverted_joint_moves_the_other_way() {
        let arm = SimulatedArm::new();
        let ctl = controller(&arm);
        let mut cal = FullCalibration::default();
        cal.set(MotorCalibration {
            id: 1,
            drive_mode: DriveMode::Inverted,
            homing_offset: 0,
            range_min: 1000,
            range_max: 3000,
            norm_mode: NormMode::Degrees,
        })
        .unwrap();
        ctl.set_calibration(cal).unwrap();

        ctl.move_servos_to_positions(&[1], &[FRAC_PI_4], None, None)
            .unwrap();
        assert!(arm.present_position(1).unwrap() < 2000);
    }

    #[test]
    fn test_stop_holds_current_positions() {
        let arm = SimulatedArm::new();
        arm.set_present_position(2, 1500);
        let ctl = controller(&arm);
        ctl.stop().unwrap();
        assert_eq!(arm.register(2, Register::GoalPosition), Some(1500));
    }

    #[test]
    fn test_ping_names_silent_servo() {
        let arm = SimulatedArm::new();
        arm.set_responsive(3, false);
        let ctl = controller(&arm);
        assert!(matches!(
            ctl.ping(),
            Err(ControllerError::PingFailed { id: 3, .. })
        ));
    }

    #[test]
    fn test_torque_switch() {
        let arm = SimulatedArm::new();
        let ctl = controller(&arm);
        ctl.set_torque_enable(true).unwrap();
        assert!(SERVO_IDS
            .iter()
            .all(|&id| arm.register(id, Register::TorqueEnable) == Some(1)));
        ctl.set_torque_enable(false).unwrap();
        assert_eq!(arm.register(6, Register::TorqueEnable), Some(0));
    }

    #[test]
    fn test_set_calibration_replaces_snapshot() {
        let arm = SimulatedArm::new();
        let ctl = controller(&arm);
        let mut cal = ctl.get_calibration();
        cal.set(MotorCalibration {
            id: 2,
            drive_mode: DriveMode::Normal,
            homing_offset: 40,
            range_min: 900,
            range_max: 3100,
            norm_mode: NormMode::Degrees,
        })
        .unwrap();
        ctl.set_calibration(cal.clone()).unwrap();
        assert_eq!(ctl.get_calibration(), cal);
        assert_eq!(ctl.get_calibration().get(2).unwrap().range_min, 900);
    }

    #[test]
    fn test_write_calibration_to_bus() {
        let arm = SimulatedArm::new();
        let ctl = controller(&arm);
        let mut cal = FullCalibration::default();
        cal.set(MotorCalibration {
            id: 4,
            drive_mode: DriveMode::Normal,
            homing_offset: -120,
            range_min: 700,
            range_max: 3300,
            norm_mode: NormMode::Degrees,
        })
        .unwrap();
        ctl.set_calibration(cal).unwrap();
        ctl.write_calibration_to_bus().unwrap();
        assert_eq!(arm.register(4, Register::HomingOffset), Some(-120));
        assert_eq!(arm.register(4, Register::MinPositionLimit), Some(700));
        assert_eq!(arm.register(4, Register::MaxPositionLimit), Some(3300));
        assert_eq!(arm.register(4, Register::Lock), Some(1));
    }
}
