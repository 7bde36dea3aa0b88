//! Servo bus wire protocol.
//!
//! Half-duplex serial bus shared by up to 253 daisy-chained servos.
//! Every transaction is a single frame:
//!
//! ```text
//! ┌──────┬──────┬────┬────────┬─────────────┬───────────┬──────────┐
//! │ 0xFF │ 0xFF │ id │ length │ instr/error │ params... │ checksum │
//! └──────┴──────┴────┴────────┴─────────────┴───────────┴──────────┘
//!                     length = params + 2
//!                     checksum = !(id + length + instr + params)  (mod 256)
//! ```
//!
//! - [`frame`] - Frame encoding, decoding and stream resynchronization
//! - [`registers`] - Named control-table registers and value encoding
//! - [`status`] - Status packets and the servo error byte

pub mod frame;
pub mod registers;
pub mod status;

pub use frame::{checksum, decode, Frame, FrameDecoder, Instruction, ProtocolError, HEADER};
pub use registers::Register;
pub use status::{ServoStatus, StatusPacket};
