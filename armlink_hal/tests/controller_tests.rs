//! Shared controller integration tests.
//!
//! Calibration file → registry → controller → simulated servos, and the
//! JSON command surface on top.

use std::f64::consts::FRAC_PI_2;
use std::sync::Arc;
use std::thread;

use armlink_common::calibration::{file, radians_to_degrees};
use armlink_common::config::{BusConfig, TimingConfig};
use armlink_common::protocol::{Instruction, Register};
use armlink_hal::dispatch::handle_arm_json;
use armlink_hal::links::SimulatedArm;
use armlink_hal::{CalibrationSource, ControllerError, ControllerRegistry};
use tempfile::TempDir;

const CALIBRATION_JSON: &str = r#"{
    "shoulder_pan":  {"id": 1, "drive_mode": 0, "homing_offset": 0,   "range_min": 500,  "range_max": 3500},
    "shoulder_lift": {"id": 2, "drive_mode": 1, "homing_offset": -40, "range_min": 600,  "range_max": 3400},
    "elbow_flex":    {"id": 3, "drive_mode": 0, "homing_offset": 12,  "range_min": 700,  "range_max": 3300},
    "wrist_flex":    {"id": 4, "drive_mode": 0, "homing_offset": 0,   "range_min": 800,  "range_max": 3200},
    "wrist_roll":    {"id": 5, "drive_mode": 0, "homing_offset": 0,   "range_min": 0,    "range_max": 4095},
    "gripper":       {"id": 6, "drive_mode": 0, "homing_offset": 0,   "range_min": 2000, "range_max": 3000}
}"#;

fn setup() -> (SimulatedArm, ControllerRegistry, TempDir) {
    let arm = SimulatedArm::new();
    let registry = ControllerRegistry::new(Arc::new(arm.opener()), TimingConfig::immediate());
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("calibration.json"), CALIBRATION_JSON).unwrap();
    (arm, registry, dir)
}

#[test]
fn test_file_calibration_drives_joints() {
    let (arm, registry, dir) = setup();
    let cal = file::load(&dir.path().join("calibration.json")).unwrap();
    let handle = registry
        .acquire(&BusConfig::for_port("sim"), CalibrationSource::File(cal))
        .unwrap();

    // Pan at 0 rad sits at the range center.
    handle
        .move_servos_to_positions(&[1], &[0.0], None, None)
        .unwrap();
    assert_eq!(arm.present_position(1), Some(2000));

    // Inverted lift moves below center for a positive angle.
    handle
        .move_servos_to_positions(&[2], &[0.5], None, None)
        .unwrap();
    assert!(arm.present_position(2).unwrap() < 2000);

    let angles = handle.get_joint_positions_for_servos(&[1, 2]).unwrap();
    assert!(angles[0].abs() < 1e-3);
    assert!((angles[1] - 0.5).abs() < 2e-3);
}

#[test]
fn test_targets_clamped_to_calibrated_range() {
    let (arm, registry, dir) = setup();
    let cal = file::load(&dir.path().join("calibration.json")).unwrap();
    let handle = registry
        .acquire(&BusConfig::for_port("sim"), CalibrationSource::File(cal))
        .unwrap();
    // 3 rad is ~172 degrees, beyond wrist_flex's calibrated range.
    handle
        .move_servos_to_positions(&[4], &[3.0], None, None)
        .unwrap();
    assert_eq!(arm.present_position(4), Some(3200));
}

#[test]
fn test_gripper_uses_percent_scale() {
    let (arm, registry, dir) = setup();
    let cal = file::load(&dir.path().join("calibration.json")).unwrap();
    let handle = registry
        .acquire(&BusConfig::for_port("sim"), CalibrationSource::File(cal))
        .unwrap();
    // Angles are degree-scaled before reaching the gripper's 0..100 unit.
    let half_open = 50.0_f64.to_radians();
    handle
        .move_servos_to_positions(&[6], &[half_open], None, None)
        .unwrap();
    assert_eq!(arm.present_position(6), Some(2500));
    let read = handle.get_joint_positions_for_servos(&[6]).unwrap();
    assert!((radians_to_degrees(read[0]) - 50.0).abs() < 0.2);
}

#[test]
fn test_concurrent_moves_are_serialized() {
    let (arm, registry, _dir) = setup();
    let handle = Arc::new(
        registry
            .acquire(&BusConfig::for_port("sim"), CalibrationSource::Hardware)
            .unwrap(),
    );
    let workers: Vec<_> = (0..4)
        .map(|i| {
            let handle = Arc::clone(&handle);
            thread::spawn(move || {
                for _ in 0..10 {
                    let angle = (i as f64) * 0.1;
                    handle.move_to_positions(&[angle; 6], None, None).unwrap();
                    handle.get_joint_positions().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(arm.frame_count(Instruction::SyncWrite), 40);
    assert_eq!(handle.bus().stats().failures, 0);
}

#[test]
fn test_length_mismatch_before_bus() {
    let (arm, registry, _dir) = setup();
    let handle = registry
        .acquire(&BusConfig::for_port("sim"), CalibrationSource::Hardware)
        .unwrap();
    let before = arm.frame_count(Instruction::SyncWrite);
    assert!(matches!(
        handle.move_to_positions(&[0.0; 5], None, None),
        Err(ControllerError::LengthMismatch { ids: 6, positions: 5 })
    ));
    assert_eq!(arm.frame_count(Instruction::SyncWrite), before);
}

#[test]
fn test_json_move_and_read() {
    let (arm, registry, _dir) = setup();
    let handle = registry
        .acquire(&BusConfig::for_port("sim"), CalibrationSource::Hardware)
        .unwrap();

    let resp = handle_arm_json(
        &handle,
        &format!(
            r#"{{"op":"move_servos_to_positions","params":{{"servo_ids":[3],"positions":[{}],"speed":400}}}}"#,
            FRAC_PI_2 / 2.0
        ),
    );
    assert!(resp.success, "{:?}", resp.error);
    assert_eq!(arm.register(3, Register::GoalVelocity), Some(400));

    let resp = handle_arm_json(
        &handle,
        r#"{"op":"get_joint_positions_for_servos","params":{"servo_ids":[3]}}"#,
    );
    let angle = resp.result[0].as_f64().unwrap();
    assert!((angle - FRAC_PI_2 / 2.0).abs() < 2e-3);

    let resp = handle_arm_json(
        &handle,
        r#"{"op":"move_to_positions","params":{"positions":[0,0,0,0,0,0],"bogus":1}}"#,
    );
    assert!(!resp.success);
}

#[test]
fn test_set_calibration_over_json() {
    let (_arm, registry, _dir) = setup();
    let handle = registry
        .acquire(&BusConfig::for_port("sim"), CalibrationSource::Hardware)
        .unwrap();
    let request = format!(r#"{{"op":"set_calibration","params":{{"calibration":{CALIBRATION_JSON}}}}}"#);
    let resp = handle_arm_json(&handle, &request);
    assert!(resp.success, "{:?}", resp.error);
    assert_eq!(handle.get_calibration().get(3).unwrap().homing_offset, 12);

    let resp = handle_arm_json(&handle, r#"{"op":"get_calibration"}"#);
    assert_eq!(resp.result["elbow_flex"]["range_min"], 700);
}

#[test]
fn test_closed_bus_surfaces_errors() {
    let (_arm, registry, _dir) = setup();
    let handle = registry
        .acquire(&BusConfig::for_port("sim"), CalibrationSource::Hardware)
        .unwrap();
    registry.force_close("sim");
    assert!(matches!(
        handle.get_joint_positions(),
        Err(ControllerError::Bus(_))
    ));
}
