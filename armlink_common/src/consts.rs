//! System-wide constants for the armlink workspace.
//!
//! Servo identities, encoder geometry, bus timing defaults and
//! calibration workflow limits. Everything here is a plain `const` so it
//! can be used from both the codec and the runtime crates.

use static_assertions::const_assert;

// ─── Servo identities ───────────────────────────────────────────────

/// Number of servos on the arm (5 joints + gripper).
pub const NUM_SERVOS: usize = 6;

/// Bus IDs of the arm servos, in joint order.
pub const SERVO_IDS: [u8; NUM_SERVOS] = [1, 2, 3, 4, 5, 6];

/// Joint names, indexed by `servo_id - 1`.
pub const JOINT_NAMES: [&str; NUM_SERVOS] = [
    "shoulder_pan",
    "shoulder_lift",
    "elbow_flex",
    "wrist_flex",
    "wrist_roll",
    "gripper",
];

/// Bus ID of the gripper servo.
pub const GRIPPER_ID: u8 = 6;

/// Highest ID a servo may carry on the wire (0xFE is broadcast).
pub const MAX_WIRE_ID: u8 = 253;

/// Broadcast ID used by sync read / sync write.
pub const BROADCAST_ID: u8 = 0xFE;

// ─── Encoder geometry ───────────────────────────────────────────────

/// Largest raw encoder value of the 12-bit rotary encoder.
pub const RAW_MAX: u16 = 4095;

/// Raw value the homing pose is mapped to (`homing_offset = raw - RAW_HOME`).
pub const RAW_HOME: i32 = 2047;

/// Fixed resolution used by the degrees norm mode (raw counts per 360°).
pub const DEGREES_RESOLUTION: f64 = 4095.0;

/// Minimum usable calibrated span for an arm joint, in raw counts.
pub const MIN_JOINT_RANGE: u16 = 200;

/// Minimum usable calibrated span for the gripper, in raw counts.
pub const MIN_GRIPPER_RANGE: u16 = 50;

// ─── Bus defaults ───────────────────────────────────────────────────

/// Default serial baud rate (1 Mbps).
pub const DEFAULT_BAUDRATE: u32 = 1_000_000;

/// Default per-read port timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Minimum gap between two consecutive bus commands in milliseconds.
pub const DEFAULT_MIN_COMMAND_GAP_MS: u64 = 5;

/// Settle delay after every write in milliseconds.
pub const DEFAULT_WRITE_SETTLE_MS: u64 = 2;

/// Attempts per read before the error is surfaced.
pub const DEFAULT_READ_ATTEMPTS: u32 = 3;

/// Base backoff between read attempts in milliseconds (doubled per attempt).
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 2;

/// Delay after resetting calibration registers before reading positions.
pub const REGISTER_SETTLE_MS: u64 = 50;

// ─── Calibration workflow ───────────────────────────────────────────

/// Default range-recording sample period in milliseconds.
pub const DEFAULT_SAMPLE_PERIOD_MS: u64 = 10;

/// Default cap of the range-recording sample history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Default calibration file name.
pub const DEFAULT_CALIBRATION_FILE: &str = "calibration.json";

/// Canonical service name used for logging.
pub const SERVICE_NAME: &str = "armlink";

const_assert!(SERVO_IDS.len() == JOINT_NAMES.len());
const_assert!(GRIPPER_ID as usize == NUM_SERVOS);
const_assert!(MIN_GRIPPER_RANGE < MIN_JOINT_RANGE);

/// Joint name for a servo ID, or `None` outside `1..=6`.
#[inline]
pub fn joint_name(id: u8) -> Option<&'static str> {
    servo_index(id).map(|idx| JOINT_NAMES[idx])
}

/// Array index for a servo ID, or `None` outside `1..=6`.
#[inline]
pub fn servo_index(id: u8) -> Option<usize> {
    if (1..=NUM_SERVOS as u8).contains(&id) {
        Some(id as usize - 1)
    } else {
        None
    }
}

/// Servo ID for a joint name.
pub fn servo_id_by_name(name: &str) -> Option<u8> {
    JOINT_NAMES
        .iter()
        .position(|&n| n == name)
        .map(|idx| SERVO_IDS[idx])
}
