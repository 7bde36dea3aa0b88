//! Status packets and the servo error byte.

use bitflags::bitflags;

use super::frame::Frame;

bitflags! {
    /// Error byte reported by a servo in every status packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ServoStatus: u8 {
        /// Input voltage outside the configured window.
        const VOLTAGE = 0x01;
        /// Goal position outside the position limits.
        const ANGLE = 0x02;
        /// Internal temperature above the limit.
        const OVERHEAT = 0x04;
        /// Current above the protection threshold.
        const OVERCURRENT = 0x08;
        /// Sustained load above the protection threshold.
        const OVERLOAD = 0x20;
    }
}

impl ServoStatus {
    /// True when the servo reported no fault.
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.is_empty()
    }
}

/// Status packet returned by a single servo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPacket {
    /// Responding servo.
    pub id: u8,
    /// Fault flags (unknown bits are preserved).
    pub status: ServoStatus,
    /// Returned data.
    pub params: Vec<u8>,
}

impl From<Frame> for StatusPacket {
    fn from(frame: Frame) -> Self {
        Self {
            id: frame.id,
            status: ServoStatus::from_bits_retain(frame.code),
            params: frame.params,
        }
    }
}
