pub mod codec;
pub mod cursor;
pub mod frame;
pub mod payload;

pub use codec::FrameCodec;
pub use frame::{Command, Frame, ReturnCode};
pub use payload::{AlarmData, AnalogData, CellStatus, Limit, Protection, Warning};
