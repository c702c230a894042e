use crate::error::{ChecksumField, CodecError};
use crate::pylon::cursor::{is_hex, HexCursor};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::convert::TryFrom;

pub const SOI: u8 = b'~';
pub const EOI: u8 = b'\r';

pub const PROTOCOL_VERSION: u8 = 0x20;
pub const CID1_BATTERY: u8 = 0x46;

const HEADER_CHARS: usize = 12;
const CHECKSUM_CHARS: usize = 4;
/// `~` + header + checksum + `\r`
pub const MIN_FRAME_LEN: usize = 1 + HEADER_CHARS + CHECKSUM_CHARS + 1;
pub const MAX_INFO_CHARS: usize = 0xFFF;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    GetAnalog = 0x42,
    GetAlarm = 0x44,
    GetSystemParameter = 0x4F,
    GetManufacturer = 0x61,
    GetFirmwareVersion = 0x62,
    GetSerialNumber = 0x63,
    GetProtocolVersion = 0x90,
    GetChargeManagement = 0x92,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ReturnCode {
    Normal = 0x00,
    VersionError = 0x01,
    ChecksumError = 0x02,
    LengthChecksumError = 0x03,
    InvalidCid2 = 0x04,
    CommandFormatError = 0x05,
    InvalidData = 0x06,
}

/// One wire frame. A request carries a `Command` in `cid2`; a response
/// carries a `ReturnCode` there instead.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub version: u8,
    pub address: u8,
    pub cid1: u8,
    pub cid2: u8,
    pub info: String,
}

impl Frame {
    pub fn request(address: u8, command: Command, info: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            address,
            cid1: CID1_BATTERY,
            cid2: command.into(),
            info: info.into(),
        }
    }

    pub fn response(address: u8, rtn: ReturnCode, info: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            address,
            cid1: CID1_BATTERY,
            cid2: rtn.into(),
            info: info.into(),
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::try_from(self.cid2).ok()
    }

    pub fn return_code(&self) -> Option<ReturnCode> {
        ReturnCode::try_from(self.cid2).ok()
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode_versioned(self.version, self.address, self.cid1, self.cid2, &self.info)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        decode(raw)
    }
}

/// Builds `~VER ADR CID1 CID2 LENID INFO CHKSUM\r`. `info` must already be hex.
pub fn encode(address: u8, cid1: u8, cid2: u8, info: &str) -> Result<Vec<u8>, CodecError> {
    encode_versioned(PROTOCOL_VERSION, address, cid1, cid2, info)
}

pub fn encode_versioned(
    version: u8,
    address: u8,
    cid1: u8,
    cid2: u8,
    info: &str,
) -> Result<Vec<u8>, CodecError> {
    if !is_hex(info.as_bytes()) {
        return Err(CodecError::BadFraming("info must be ascii hex"));
    }
    let lenid = lenid(info.len())?;

    let content = format!(
        "{:02X}{:02X}{:02X}{:02X}{:04X}{}",
        version,
        address,
        cid1,
        cid2,
        lenid,
        info.to_ascii_uppercase()
    );
    let checksum = frame_checksum(content.as_bytes());

    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(SOI);
    out.extend_from_slice(content.as_bytes());
    out.extend_from_slice(format!("{:04X}", checksum).as_bytes());
    out.push(EOI);
    Ok(out)
}

pub fn decode(raw: &[u8]) -> Result<Frame, CodecError> {
    if raw.first() != Some(&SOI) {
        return Err(CodecError::BadFraming("missing start marker"));
    }
    if raw.len() < MIN_FRAME_LEN {
        return Err(CodecError::Truncated {
            needed: MIN_FRAME_LEN,
            remaining: raw.len(),
        });
    }
    if raw.last() != Some(&EOI) {
        return Err(CodecError::BadFraming("missing terminator"));
    }

    let body = &raw[1..raw.len() - 1];
    if !is_hex(body) {
        return Err(CodecError::BadFraming("non-hex character"));
    }
    let (content, checksum_chars) = body.split_at(body.len() - CHECKSUM_CHARS);

    let mut cursor = HexCursor::new(content);
    let version = cursor.read_u8()?;
    let address = cursor.read_u8()?;
    let cid1 = cursor.read_u8()?;
    let cid2 = cursor.read_u8()?;
    let length_check = cursor.read_nibble()?;
    let declared = ((cursor.read_nibble()? as usize) << 8) | cursor.read_u8()? as usize;

    let expected_nibble = length_checksum(declared);
    if length_check != expected_nibble {
        return Err(CodecError::BadChecksum {
            field: ChecksumField::Length,
            got: length_check as u16,
            expected: expected_nibble as u16,
        });
    }
    if declared != cursor.remaining() {
        return Err(CodecError::BadLength {
            declared,
            actual: cursor.remaining(),
        });
    }

    let expected = frame_checksum(content);
    let got = HexCursor::new(checksum_chars).read_u16()?;
    if got != expected {
        return Err(CodecError::BadChecksum {
            field: ChecksumField::Frame,
            got,
            expected,
        });
    }

    let info = String::from_utf8_lossy(cursor.rest()).to_ascii_uppercase();

    Ok(Frame {
        version,
        address,
        cid1,
        cid2,
        info,
    })
}

/// Two's complement (mod 16) of the sum of the three length digits.
pub fn length_checksum(len: usize) -> u8 {
    let sum = ((len >> 8) & 0xF) + ((len >> 4) & 0xF) + (len & 0xF);
    ((!sum).wrapping_add(1) & 0xF) as u8
}

/// LENID: checksum nibble followed by the 12-bit info length.
pub fn lenid(len: usize) -> Result<u16, CodecError> {
    if len > MAX_INFO_CHARS {
        return Err(CodecError::BadLength {
            declared: len,
            actual: MAX_INFO_CHARS,
        });
    }
    Ok(((length_checksum(len) as u16) << 12) | len as u16)
}

/// Two's complement (mod 65536) of the sum of every character between the
/// start marker and the checksum field.
pub fn frame_checksum(content: &[u8]) -> u16 {
    let sum = content.iter().fold(0u32, |acc, c| acc + *c as u32);
    ((!sum).wrapping_add(1) & 0xFFFF) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenid_for_two_chars() {
        assert_eq!(lenid(2).unwrap(), 0xE002);
        assert_eq!(lenid(0).unwrap(), 0x0000);
    }

    #[test]
    fn lenid_rejects_oversize_info() {
        assert!(lenid(MAX_INFO_CHARS + 1).is_err());
    }
}
