//! Calibration workflow integration tests.
//!
//! Drives the full homing / range-recording / save sequence against the
//! simulated arm, moving joints by hand between steps.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use armlink_common::calibration::{FullCalibration, file};
use armlink_common::config::{BusConfig, TimingConfig, WorkflowConfig};
use armlink_common::consts::SERVO_IDS;
use armlink_common::protocol::Register;
use armlink_hal::dispatch::handle_workflow_json;
use armlink_hal::links::SimulatedArm;
use armlink_hal::{CalibrationWorkflow, ServoBus, SharedController, WorkflowError, WorkflowState};
use tempfile::TempDir;

struct Rig {
    arm: SimulatedArm,
    controller: Arc<SharedController>,
    workflow: CalibrationWorkflow,
    dir: TempDir,
}

fn rig(history_capacity: usize) -> Rig {
    let arm = SimulatedArm::new();
    let bus = ServoBus::new(
        Box::new(arm.link("sim")),
        BusConfig::for_port("sim"),
        TimingConfig::immediate(),
    );
    let controller = Arc::new(SharedController::new(
        Arc::new(bus),
        FullCalibration::default(),
    ));
    let dir = TempDir::new().unwrap();
    let config = WorkflowConfig {
        sample_period_ms: 2,
        history_capacity,
        output: dir.path().join("calibration.json"),
        ..WorkflowConfig::default()
    };
    let workflow = CalibrationWorkflow::new(Arc::clone(&controller), config);
    Rig {
        arm,
        controller,
        workflow,
        dir,
    }
}

/// Wait until the sampler has folded in `extra` more readings.
fn wait_for_samples(workflow: &CalibrationWorkflow, extra: u64) {
    let target = workflow.status().samples_taken + extra;
    let deadline = Instant::now() + Duration::from_secs(5);
    while workflow.status().samples_taken < target {
        assert!(Instant::now() < deadline, "sampler made no progress");
        thread::sleep(Duration::from_millis(2));
    }
}

fn move_all(arm: &SimulatedArm, raw: u16) {
    for id in SERVO_IDS {
        arm.set_present_position(id, raw);
    }
}

fn record_full_sweep(rig: &Rig) {
    rig.workflow.start().unwrap();
    rig.workflow.set_homing().unwrap();
    rig.workflow.start_range_recording().unwrap();
    move_all(&rig.arm, 1000);
    wait_for_samples(&rig.workflow, 3);
    move_all(&rig.arm, 3000);
    wait_for_samples(&rig.workflow, 3);
}

#[test]
fn test_full_calibration_run() {
    let rig = rig(1000);
    record_full_sweep(&rig);
    assert_eq!(
        rig.workflow.stop_range_recording().unwrap(),
        WorkflowState::Completed
    );

    let saved = rig.workflow.save_calibration().unwrap();
    assert_eq!(rig.workflow.state(), WorkflowState::Idle);

    let motor = saved.get(2).unwrap();
    assert_eq!(motor.range_min, 1000);
    assert_eq!(motor.range_max, 3000);
    assert_eq!(rig.arm.register(2, Register::MinPositionLimit), Some(1000));
    assert_eq!(rig.arm.register(2, Register::MaxPositionLimit), Some(3000));
    assert_eq!(rig.controller.get_calibration(), saved);

    let loaded = file::load(&rig.dir.path().join("calibration.json")).unwrap();
    assert_eq!(loaded, saved);
}

#[test]
fn test_homing_maps_pose_to_midpoint() {
    let rig = rig(100);
    rig.arm.set_register(2, Register::HomingOffset, 300);
    rig.arm.set_register(2, Register::MinPositionLimit, 500);
    rig.arm.set_present_position(2, 2600);
    rig.workflow.start().unwrap();
    rig.workflow.set_homing().unwrap();

    // Registers were reset before the pose was read.
    let physical = 2600 + 300;
    assert_eq!(
        rig.arm.register(2, Register::HomingOffset),
        Some(physical - 2047)
    );
    assert_eq!(rig.arm.register(2, Register::MinPositionLimit), Some(0));
    assert_eq!(rig.arm.present_position(2), Some(2047));

    let status = rig.workflow.status();
    assert_eq!(status.state, WorkflowState::HomingPosition);
    let joint = status.joints.iter().find(|j| j.id == 2).unwrap();
    assert_eq!(joint.homing_offset, physical - 2047);
}

#[test]
fn test_start_disables_torque() {
    let rig = rig(100);
    rig.controller.set_torque_enable(true).unwrap();
    rig.workflow.start().unwrap();
    assert!(
        SERVO_IDS
            .iter()
            .all(|&id| rig.arm.register(id, Register::TorqueEnable) == Some(0))
    );
}

#[test]
fn test_recording_from_idle_rejected() {
    let rig = rig(100);
    match rig.workflow.start_range_recording() {
        Err(WorkflowError::InvalidTransition { command, state }) => {
            assert_eq!(command, "start_range_recording");
            assert_eq!(state, WorkflowState::Idle);
        }
        other => panic!("expected invalid transition, got {other:?}"),
    }
    assert_eq!(rig.workflow.state(), WorkflowState::Idle);
}

#[test]
fn test_save_only_from_completed() {
    let rig = rig(100);
    rig.workflow.start().unwrap();
    assert!(matches!(
        rig.workflow.save_calibration(),
        Err(WorkflowError::InvalidTransition { .. })
    ));
    assert_eq!(rig.workflow.state(), WorkflowState::Started);
    assert!(!rig.dir.path().join("calibration.json").exists());
}

#[test]
fn test_unmoved_joint_sends_workflow_to_error() {
    let rig = rig(100);
    rig.workflow.start().unwrap();
    rig.workflow.set_homing().unwrap();
    rig.workflow.start_range_recording().unwrap();
    for id in 1..=5 {
        rig.arm.set_present_position(id, 1000);
    }
    wait_for_samples(&rig.workflow, 3);
    for id in 1..=5 {
        rig.arm.set_present_position(id, 3000);
    }
    wait_for_samples(&rig.workflow, 3);

    match rig.workflow.stop_range_recording() {
        Err(WorkflowError::DegenerateRange { joints }) => assert_eq!(joints, vec!["gripper"]),
        other => panic!("expected degenerate range, got {other:?}"),
    }
    assert_eq!(rig.workflow.state(), WorkflowState::Error);
    assert!(rig.workflow.status().message.contains("gripper"));

    assert!(rig.workflow.save_calibration().is_err());
    assert_eq!(rig.workflow.reset().unwrap(), WorkflowState::Idle);
}

#[test]
fn test_abort_stops_sampler() {
    let rig = rig(100);
    rig.workflow.start().unwrap();
    rig.workflow.set_homing().unwrap();
    rig.workflow.start_range_recording().unwrap();
    wait_for_samples(&rig.workflow, 2);

    let before = rig.arm.register(1, Register::HomingOffset);
    assert_eq!(rig.workflow.abort(), WorkflowState::Idle);
    thread::sleep(Duration::from_millis(20));
    let status = rig.workflow.status();
    assert_eq!(status.samples_taken, 0);
    assert_eq!(status.history_len, 0);
    assert_eq!(rig.arm.register(1, Register::HomingOffset), before);
}

#[test]
fn test_history_is_bounded() {
    let rig = rig(4);
    record_full_sweep(&rig);
    wait_for_samples(&rig.workflow, 4);
    let status = rig.workflow.status();
    assert_eq!(status.history_len, 4);
    assert!(status.samples_taken > 4);
    let history = rig.workflow.history();
    assert_eq!(history.len(), 4);
    assert!(history.windows(2).all(|w| w[0].elapsed_ms <= w[1].elapsed_ms));
    rig.workflow.abort();
}

#[test]
fn test_restart_after_completion() {
    let rig = rig(100);
    record_full_sweep(&rig);
    rig.workflow.stop_range_recording().unwrap();
    assert_eq!(rig.workflow.start().unwrap(), WorkflowState::Started);
    let status = rig.workflow.status();
    assert!(status.joints.iter().all(|j| !j.is_completed));
}

#[test]
fn test_json_surface() {
    let rig = rig(100);
    let resp = handle_workflow_json(&rig.workflow, r#"{"op":"status"}"#);
    assert!(resp.success);
    assert_eq!(resp.result["state"], "idle");

    let resp = handle_workflow_json(&rig.workflow, r#"{"op":"reset"}"#);
    assert!(!resp.success);
    assert!(resp.error.unwrap().contains("idle"));

    let resp = handle_workflow_json(&rig.workflow, r#"{"op":"start"}"#);
    assert!(resp.success);
    assert_eq!(resp.result, "started");

    let resp = handle_workflow_json(&rig.workflow, r#"{"op":"calibrate"}"#);
    assert!(!resp.success);
}
