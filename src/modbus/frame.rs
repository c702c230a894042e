use crate::error::RegisterError;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Deserialize;

/// Registers per read request the protocol allows.
pub const MAX_READ_COUNT: u16 = 125;
/// Registers per write-multiple request the protocol allows.
pub const MAX_WRITE_COUNT: u16 = 123;

const EXCEPTION_FLAG: u8 = 0x80;
/// slave, function, exception code, crc
pub const EXCEPTION_LEN: usize = 5;
/// slave, function, address, count, crc
const WRITE_ECHO_LEN: usize = 8;

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, IntoPrimitive, TryFromPrimitive,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum FunctionCode {
    #[serde(rename = "holding")]
    ReadHolding = 0x03,
    #[serde(rename = "input")]
    ReadInput = 0x04,
    #[serde(skip)]
    WriteMultiple = 0x10,
}

/// A register as the cache keys it: input and holding spaces overlap.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Register {
    pub function: FunctionCode,
    pub address: u16,
}

impl Register {
    pub fn holding(address: u16) -> Self {
        Self {
            function: FunctionCode::ReadHolding,
            address,
        }
    }

    pub fn input(address: u16) -> Self {
        Self {
            function: FunctionCode::ReadInput,
            address,
        }
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.function {
            FunctionCode::ReadInput => write!(f, "input/{}", self.address),
            _ => write!(f, "hold/{}", self.address),
        }
    }
}

/// Modbus CRC16 (poly 0xA001, seed 0xFFFF), low byte first.
pub fn crc16(data: &[u8]) -> [u8; 2] {
    crc16::State::<crc16::MODBUS>::calculate(data).to_le_bytes()
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    pub slave: u8,
    pub function: FunctionCode,
    pub address: u16,
    pub count: u16,
    pub values: Vec<u16>,
}

impl Request {
    pub fn read(
        slave: u8,
        function: FunctionCode,
        address: u16,
        count: u16,
    ) -> Result<Self, RegisterError> {
        if function == FunctionCode::WriteMultiple {
            return Err(RegisterError::InvalidRequest("read with a write function code"));
        }
        if count == 0 || count > MAX_READ_COUNT {
            return Err(RegisterError::InvalidRequest("read count outside 1..=125"));
        }
        Ok(Self {
            slave,
            function,
            address,
            count,
            values: Vec::new(),
        })
    }

    pub fn write(slave: u8, address: u16, values: Vec<u16>) -> Result<Self, RegisterError> {
        if values.is_empty() || values.len() > MAX_WRITE_COUNT as usize {
            return Err(RegisterError::InvalidRequest("write count outside 1..=123"));
        }
        Ok(Self {
            slave,
            function: FunctionCode::WriteMultiple,
            address,
            count: values.len() as u16,
            values,
        })
    }

    pub fn is_write(&self) -> bool {
        self.function == FunctionCode::WriteMultiple
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.slave, self.function.into()];
        out.extend_from_slice(&self.address.to_be_bytes());
        out.extend_from_slice(&self.count.to_be_bytes());
        if self.is_write() {
            out.push((self.values.len() * 2) as u8);
            for v in &self.values {
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        let crc = crc16(&out);
        out.extend_from_slice(&crc);
        out
    }

    /// Length of a well-formed normal response.
    pub fn expected_len(&self) -> usize {
        if self.is_write() {
            WRITE_ECHO_LEN
        } else {
            3 + self.count as usize * 2 + 2
        }
    }

    /// Structural checks, cheapest first. Returns the register values for a
    /// read and the written values for a write.
    pub fn validate(&self, response: &[u8]) -> Result<Vec<u16>, RegisterError> {
        if response.len() < EXCEPTION_LEN {
            return Err(RegisterError::ShortResponse {
                len: response.len(),
                min: EXCEPTION_LEN,
            });
        }

        let function: u8 = self.function.into();

        if response[1] == function | EXCEPTION_FLAG {
            let frame = &response[..EXCEPTION_LEN];
            check_crc(frame)?;
            if response[0] != self.slave {
                return Err(RegisterError::SlaveMismatch {
                    expected: self.slave,
                    got: response[0],
                });
            }
            return Err(RegisterError::Exception { code: response[2] });
        }

        if response[1] != function {
            return Err(RegisterError::FunctionCodeMismatch {
                expected: function,
                got: response[1],
            });
        }
        if response[0] != self.slave {
            return Err(RegisterError::SlaveMismatch {
                expected: self.slave,
                got: response[0],
            });
        }

        if !self.is_write() {
            let expected = self.count as usize * 2;
            let declared = response[2] as usize;
            if declared != expected {
                return Err(RegisterError::ByteCountMismatch {
                    expected,
                    got: declared,
                });
            }
        }

        let len = self.expected_len();
        if response.len() < len {
            return Err(RegisterError::ShortResponse {
                len: response.len(),
                min: len,
            });
        }
        let frame = &response[..len];
        check_crc(frame)?;

        if self.is_write() {
            let register = u16::from_be_bytes([frame[2], frame[3]]);
            let count = u16::from_be_bytes([frame[4], frame[5]]);
            if register != self.address || count != self.count {
                return Err(RegisterError::EchoMismatch { register, count });
            }
            return Ok(self.values.clone());
        }

        Ok(frame[3..len - 2]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }
}

fn check_crc(frame: &[u8]) -> Result<(), RegisterError> {
    let (body, tail) = frame.split_at(frame.len() - 2);
    let expected = crc16(body);
    if tail != expected {
        return Err(RegisterError::CrcMismatch {
            expected: u16::from_le_bytes(expected),
            got: u16::from_le_bytes([tail[0], tail[1]]),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(slave: u8, function: u8, payload: &[u8]) -> Vec<u8> {
        let mut r = vec![slave, function];
        r.extend_from_slice(payload);
        let crc = crc16(&r);
        r.extend_from_slice(&crc);
        r
    }

    #[test]
    fn read_request_bytes() {
        let req = Request::read(1, FunctionCode::ReadHolding, 0, 10).unwrap();
        assert_eq!(req.to_bytes(), vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
        assert_eq!(req.expected_len(), 25);
    }

    #[test]
    fn write_request_bytes() {
        let req = Request::write(10, 0x9008, vec![1, 2]).unwrap();
        let bytes = req.to_bytes();
        assert_eq!(&bytes[..11], &[10, 0x10, 0x90, 0x08, 0x00, 0x02, 0x04, 0, 1, 0, 2]);
        assert_eq!(bytes.len(), 13);
    }

    #[test]
    fn rejects_bad_counts() {
        assert!(Request::read(1, FunctionCode::ReadInput, 0, 0).is_err());
        assert!(Request::read(1, FunctionCode::ReadInput, 0, 126).is_err());
        assert!(Request::write(1, 0, vec![]).is_err());
    }

    #[test]
    fn validates_read() {
        let req = Request::read(10, FunctionCode::ReadInput, 0x3100, 2).unwrap();
        let ok = response(10, 0x04, &[4, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(req.validate(&ok).unwrap(), vec![0x0102, 0x0304]);

        let mut flipped = ok.clone();
        flipped[1] = 0x06;
        assert!(matches!(
            req.validate(&flipped),
            Err(RegisterError::FunctionCodeMismatch { expected: 4, got: 6 })
        ));

        let mut bad_crc = ok.clone();
        bad_crc[4] ^= 0x01;
        assert!(matches!(req.validate(&bad_crc), Err(RegisterError::CrcMismatch { .. })));

        let short_count = response(10, 0x04, &[2, 0x01, 0x02]);
        assert!(matches!(
            req.validate(&short_count),
            Err(RegisterError::ByteCountMismatch { expected: 4, got: 2 })
        ));
    }

    #[test]
    fn surfaces_exception() {
        let req = Request::read(10, FunctionCode::ReadHolding, 0x9000, 1).unwrap();
        let exc = response(10, 0x83, &[0x02]);
        assert_eq!(req.validate(&exc), Err(RegisterError::Exception { code: 2 }));
    }

    #[test]
    fn checks_write_echo() {
        let req = Request::write(10, 0x9008, vec![5]).unwrap();
        let echo = response(10, 0x10, &[0x90, 0x08, 0x00, 0x01]);
        assert_eq!(req.validate(&echo).unwrap(), vec![5]);

        let wrong = response(10, 0x10, &[0x90, 0x09, 0x00, 0x01]);
        assert!(matches!(req.validate(&wrong), Err(RegisterError::EchoMismatch { .. })));
    }
}
