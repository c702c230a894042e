use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChecksumField {
    Length,
    Frame,
}

impl std::fmt::Display for ChecksumField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Length => write!(f, "length"),
            Self::Frame => write!(f, "frame"),
        }
    }
}

/// Failures turning characters into an ASCII-hex frame and back.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum CodecError {
    #[error("bad framing: {0}")]
    BadFraming(&'static str),

    #[error("length field declares {declared} info chars but frame carries {actual}")]
    BadLength { declared: usize, actual: usize },

    #[error("{field} checksum mismatch: got {got:04X}, expected {expected:04X}")]
    BadChecksum {
        field: ChecksumField,
        got: u16,
        expected: u16,
    },

    #[error("truncated: needed {needed} chars, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
}

/// Failures decoding or encoding an analog/alarm info payload.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum PayloadError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("{field} count {count} outside 1..={max}")]
    BadCount {
        field: &'static str,
        count: usize,
        max: usize,
    },

    #[error("{field} value {value} cannot be encoded")]
    Unencodable { field: &'static str, value: f64 },
}

/// Why a broadcast frame was discarded.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum TelemetryError {
    #[error("frame 0x{id:03X} payload too short ({len} bytes)")]
    ShortPayload { id: u32, len: usize },

    #[error("frame 0x{id:03X} {field} = {value} outside {min}..={max}")]
    OutOfRange {
        id: u32,
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("frame 0x{0:03X} is a reset marker")]
    ResetMarker(u32),
}

/// Register-protocol failures. Everything except `Exception`, `InvalidRequest`
/// and `Transport` is treated as a corruption signal and retried.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum RegisterError {
    #[error("response too short: {len} bytes, need {min}")]
    ShortResponse { len: usize, min: usize },

    #[error("function code mismatch: got 0x{got:02X}, expected 0x{expected:02X}")]
    FunctionCodeMismatch { expected: u8, got: u8 },

    #[error("slave id mismatch: got {got}, expected {expected}")]
    SlaveMismatch { expected: u8, got: u8 },

    #[error("byte count mismatch: got {got}, expected {expected}")]
    ByteCountMismatch { expected: usize, got: usize },

    #[error("crc mismatch: got {got:04X}, expected {expected:04X}")]
    CrcMismatch { expected: u16, got: u16 },

    #[error("write echo mismatch: got register {register} count {count}")]
    EchoMismatch { register: u16, count: u16 },

    #[error("implausible value {value} for register {register}")]
    Implausible { register: u16, value: f64 },

    #[error("exception {code}: {}", exception_name(*.code))]
    Exception { code: u8 },

    #[error("no response within {0}ms")]
    Timeout(u64),

    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("transport: {0}")]
    Transport(String),

    #[error("corrupted after {attempts} attempts, last error: {last}")]
    Corrupted {
        attempts: u8,
        last: Box<RegisterError>,
    },
}

impl RegisterError {
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ShortResponse { .. }
                | Self::FunctionCodeMismatch { .. }
                | Self::SlaveMismatch { .. }
                | Self::ByteCountMismatch { .. }
                | Self::CrcMismatch { .. }
                | Self::EchoMismatch { .. }
                | Self::Implausible { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.is_corruption() || matches!(self, Self::Timeout(_))
    }
}

pub fn exception_name(code: u8) -> &'static str {
    match code {
        1 => "Illegal Function",
        2 => "Illegal Data Address",
        3 => "Illegal Data Value",
        4 => "Slave Device Failure",
        5 => "Acknowledge",
        6 => "Slave Device Busy",
        _ => "Unknown",
    }
}
