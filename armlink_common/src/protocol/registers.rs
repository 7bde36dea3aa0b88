//! Named control-table registers.
//!
//! Addresses and widths follow the STS3215 control table. Multi-byte
//! values are little-endian; the homing offset is sign-magnitude with
//! the sign in bit 11.

use std::fmt;
use std::str::FromStr;

use super::frame::ProtocolError;

/// Sign bit of the homing offset register.
pub const HOMING_OFFSET_SIGN_BIT: u8 = 11;

/// Control-table register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// Model number (read-only).
    ModelNumber,
    /// Bus ID.
    Id,
    /// Baud rate index.
    BaudRate,
    /// Lower position limit.
    MinPositionLimit,
    /// Upper position limit.
    MaxPositionLimit,
    /// Homing offset applied by the servo to its present position.
    HomingOffset,
    /// 0=position, 1=velocity, 2=PWM, 3=step.
    OperatingMode,
    /// Torque enable flag.
    TorqueEnable,
    /// Acceleration.
    Acceleration,
    /// Goal position.
    GoalPosition,
    /// Goal time.
    GoalTime,
    /// Goal velocity.
    GoalVelocity,
    /// EEPROM lock flag.
    Lock,
    /// Present position (read-only).
    PresentPosition,
    /// Present velocity (read-only).
    PresentVelocity,
    /// Moving flag (read-only).
    Moving,
}

impl Register {
    /// Every known register.
    pub const ALL: [Register; 16] = [
        Self::ModelNumber,
        Self::Id,
        Self::BaudRate,
        Self::MinPositionLimit,
        Self::MaxPositionLimit,
        Self::HomingOffset,
        Self::OperatingMode,
        Self::TorqueEnable,
        Self::Acceleration,
        Self::GoalPosition,
        Self::GoalTime,
        Self::GoalVelocity,
        Self::Lock,
        Self::PresentPosition,
        Self::PresentVelocity,
        Self::Moving,
    ];

    /// Control-table address.
    #[inline]
    pub const fn address(self) -> u8 {
        match self {
            Self::ModelNumber => 3,
            Self::Id => 5,
            Self::BaudRate => 6,
            Self::MinPositionLimit => 9,
            Self::MaxPositionLimit => 11,
            Self::HomingOffset => 31,
            Self::OperatingMode => 33,
            Self::TorqueEnable => 40,
            Self::Acceleration => 41,
            Self::GoalPosition => 42,
            Self::GoalTime => 44,
            Self::GoalVelocity => 46,
            Self::Lock => 55,
            Self::PresentPosition => 56,
            Self::PresentVelocity => 58,
            Self::Moving => 66,
        }
    }

    /// Register width in bytes.
    #[inline]
    pub const fn size(self) -> u8 {
        match self {
            Self::Id
            | Self::BaudRate
            | Self::OperatingMode
            | Self::TorqueEnable
            | Self::Acceleration
            | Self::Lock
            | Self::Moving => 1,
            _ => 2,
        }
    }

    /// snake_case register name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::ModelNumber => "model_number",
            Self::Id => "id",
            Self::BaudRate => "baud_rate",
            Self::MinPositionLimit => "min_position_limit",
            Self::MaxPositionLimit => "max_position_limit",
            Self::HomingOffset => "homing_offset",
            Self::OperatingMode => "operating_mode",
            Self::TorqueEnable => "torque_enable",
            Self::Acceleration => "acceleration",
            Self::GoalPosition => "goal_position",
            Self::GoalTime => "goal_time",
            Self::GoalVelocity => "goal_velocity",
            Self::Lock => "lock",
            Self::PresentPosition => "present_position",
            Self::PresentVelocity => "present_velocity",
            Self::Moving => "moving",
        }
    }

    /// Look up a register by name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.name() == name)
    }

    /// Encode a value into register bytes.
    pub fn encode(self, value: i32) -> Result<Vec<u8>, ProtocolError> {
        let out_of_range = || ProtocolError::ValueOutOfRange {
            register: self.name(),
            value,
        };
        match (self, self.size()) {
            (Self::HomingOffset, _) => {
                let magnitude_max = (1i32 << HOMING_OFFSET_SIGN_BIT) - 1;
                if value.abs() > magnitude_max {
                    return Err(out_of_range());
                }
                Ok(encode_sign_magnitude(value, HOMING_OFFSET_SIGN_BIT)
                    .to_le_bytes()
                    .to_vec())
            }
            (_, 1) => u8::try_from(value)
                .map(|v| vec![v])
                .map_err(|_| out_of_range()),
            _ => u16::try_from(value)
                .map(|v| v.to_le_bytes().to_vec())
                .map_err(|_| out_of_range()),
        }
    }

    /// Decode register bytes into a value.
    pub fn decode(self, bytes: &[u8]) -> Result<i32, ProtocolError> {
        if bytes.len() != self.size() as usize {
            return Err(ProtocolError::PayloadSize {
                register: self.name(),
                expected: self.size() as usize,
                actual: bytes.len(),
            });
        }
        Ok(match self {
            Self::HomingOffset => decode_sign_magnitude(
                u16::from_le_bytes([bytes[0], bytes[1]]),
                HOMING_OFFSET_SIGN_BIT,
            ),
            _ if bytes.len() == 1 => bytes[0] as i32,
            _ => u16::from_le_bytes([bytes[0], bytes[1]]) as i32,
        })
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Register {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unknown register '{s}'"))
    }
}

/// Sign-magnitude encoding with the sign at `sign_bit`.
#[inline]
pub fn encode_sign_magnitude(value: i32, sign_bit: u8) -> u16 {
    let magnitude = (value.unsigned_abs() as u16) & ((1u16 << sign_bit) - 1);
    if value < 0 {
        magnitude | (1u16 << sign_bit)
    } else {
        magnitude
    }
}

/// Inverse of [`encode_sign_magnitude`].
#[inline]
pub fn decode_sign_magnitude(raw: u16, sign_bit: u8) -> i32 {
    let magnitude = (raw & ((1u16 << sign_bit) - 1)) as i32;
    if raw & (1u16 << sign_bit) != 0 {
        -magnitude
    } else {
        magnitude
    }
}
