//! Command dispatch.
//!
//! Routes decoded requests to the controller or the calibration workflow
//! and folds the outcome into a [`Response`]. Decoding failures become
//! error responses as well, so callers always get a well-formed reply.

use armlink_common::command::{ArmRequest, Response, WorkflowRequest};
use tracing::debug;

use crate::controller::SharedController;
use crate::workflow::CalibrationWorkflow;

/// Execute an arm request.
pub fn dispatch_arm(controller: &SharedController, request: ArmRequest) -> Response {
    match request {
        ArmRequest::MoveToPositions(p) => controller
            .move_to_positions(&p.positions, p.speed, p.acceleration)
            .into(),
        ArmRequest::MoveServosToPositions(p) => controller
            .move_servos_to_positions(&p.servo_ids, &p.positions, p.speed, p.acceleration)
            .into(),
        ArmRequest::GetJointPositions => controller.get_joint_positions().into(),
        ArmRequest::GetJointPositionsForServos(p) => {
            controller.get_joint_positions_for_servos(&p.servo_ids).into()
        }
        ArmRequest::ReadRawPositions(p) => controller.read_raw_positions(&p.servo_ids).into(),
        ArmRequest::SetTorqueEnable(p) => controller.set_torque_enable(p.enable).into(),
        ArmRequest::Stop => controller.stop().into(),
        ArmRequest::Ping => controller.ping().into(),
        ArmRequest::GetCalibration => Response::ok(controller.get_calibration()),
        ArmRequest::SetCalibration(p) => controller.set_calibration(p.calibration).into(),
        ArmRequest::ReadRegister(p) => controller.read_register(p.servo_id, p.register).into(),
        ArmRequest::WriteRegister(p) => controller
            .write_register(p.servo_id, p.register, p.value)
            .into(),
    }
}

/// Execute a workflow request.
pub fn dispatch_workflow(workflow: &CalibrationWorkflow, request: WorkflowRequest) -> Response {
    debug!(op = request.name(), "Workflow request");
    match request {
        WorkflowRequest::Start => workflow.start().into(),
        WorkflowRequest::SetHoming => workflow.set_homing().into(),
        WorkflowRequest::StartRangeRecording => workflow.start_range_recording().into(),
        WorkflowRequest::StopRangeRecording => workflow.stop_range_recording().into(),
        WorkflowRequest::SaveCalibration => workflow.save_calibration().into(),
        WorkflowRequest::Abort => Response::ok(workflow.abort()),
        WorkflowRequest::Reset => workflow.reset().into(),
        WorkflowRequest::Status => Response::ok(workflow.status()),
        WorkflowRequest::History => Response::ok(workflow.history()),
    }
}

/// Decode and execute a JSON arm request.
pub fn handle_arm_json(controller: &SharedController, json: &str) -> Response {
    match ArmRequest::from_json(json) {
        Ok(request) => dispatch_arm(controller, request),
        Err(e) => Response::error(e),
    }
}

/// Decode and execute a JSON workflow request.
pub fn handle_workflow_json(workflow: &CalibrationWorkflow, json: &str) -> Response {
    match WorkflowRequest::from_json(json) {
        Ok(request) => dispatch_workflow(workflow, request),
        Err(e) => Response::error(e),
    }
}
