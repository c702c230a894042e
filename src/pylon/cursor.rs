use crate::error::CodecError;

/// Bounded reader over ASCII-hex characters. Every read states how many
/// characters it consumes and fails with `Truncated` instead of slicing short.
#[derive(Clone, Debug)]
pub struct HexCursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> HexCursor<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let chunk = &self.input[self.pos..self.pos + n];
        self.pos += n;
        Ok(chunk)
    }

    fn read_hex(&mut self, digits: usize) -> Result<u32, CodecError> {
        self.take(digits)?
            .iter()
            .try_fold(0u32, |acc, c| Ok((acc << 4) | nibble(*c)? as u32))
    }

    pub fn read_nibble(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_hex(1)? as u8)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_hex(2)? as u8)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(self.read_hex(4)? as u16)
    }

    pub fn read_i16(&mut self) -> Result<i16, CodecError> {
        Ok(self.read_u16()? as i16)
    }

    /// Reads `n` bytes encoded as 2n hex characters.
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, CodecError> {
        (0..n).map(|_| self.read_u8()).collect()
    }

    /// Everything not yet consumed, as raw characters.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.input[self.pos..];
        self.pos = self.input.len();
        rest
    }
}

pub fn nibble(c: u8) -> Result<u8, CodecError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(CodecError::BadFraming("non-hex character")),
    }
}

pub fn is_hex(chars: &[u8]) -> bool {
    chars.iter().all(|c| c.is_ascii_hexdigit())
}

/// Encodes ASCII text as uppercase hex, two characters per byte.
pub fn ascii_to_hex(text: &str) -> String {
    text.bytes().map(|b| format!("{:02X}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_fields_in_order() {
        let mut c = HexCursor::new(b"0210FFF6");
        assert_eq!(c.read_u8().unwrap(), 0x02);
        assert_eq!(c.read_u8().unwrap(), 0x10);
        assert_eq!(c.read_i16().unwrap(), -10);
        assert!(c.is_empty());
    }

    #[test]
    fn fails_loudly_on_truncation() {
        let mut c = HexCursor::new(b"0D0");
        assert_eq!(
            c.read_u16(),
            Err(CodecError::Truncated {
                needed: 4,
                remaining: 3
            })
        );
    }

    #[test]
    fn ascii_hex() {
        assert_eq!(ascii_to_hex("V1.0"), "56312E30");
    }
}
