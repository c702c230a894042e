use nom::number::complete::{le_i16, le_u16};
use nom::IResult;

pub struct Utils;

impl Utils {
    pub fn le_u16_div10(input: &[u8]) -> IResult<&[u8], f64> {
        let (input, num) = le_u16(input)?;
        Ok((input, num as f64 / 10.0))
    }

    pub fn le_u16_div100(input: &[u8]) -> IResult<&[u8], f64> {
        let (input, num) = le_u16(input)?;
        Ok((input, num as f64 / 100.0))
    }

    pub fn le_u16_div1000(input: &[u8]) -> IResult<&[u8], f64> {
        let (input, num) = le_u16(input)?;
        Ok((input, num as f64 / 1000.0))
    }

    pub fn le_i16_div10(input: &[u8]) -> IResult<&[u8], f64> {
        let (input, num) = le_i16(input)?;
        Ok((input, num as f64 / 10.0))
    }

    /// Milliseconds from `since` to `now` on a wrapping u32 tick counter.
    pub fn elapsed_ms(now: u32, since: u32) -> u32 {
        now.wrapping_sub(since)
    }

    pub fn round(value: f64, places: i32) -> f64 {
        let factor = 10f64.powi(places);
        (value * factor).round() / factor
    }
}

/// Monotonic millisecond tick shared by every component. Wraps after ~49 days;
/// all consumers compare ticks with `Utils::elapsed_ms`.
#[derive(Clone, Copy, Debug)]
pub struct Clock {
    start: std::time::Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_survives_rollover() {
        assert_eq!(Utils::elapsed_ms(499, u32::MAX - 500), 1000);
        assert_eq!(Utils::elapsed_ms(2000, 1000), 1000);
    }

    #[test]
    fn div_parsers() {
        let (_, v) = Utils::le_u16_div10(&[0x14, 0x02]).unwrap();
        assert_eq!(v, 53.2);
        let (_, v) = Utils::le_i16_div10(&[0xF6, 0xFF]).unwrap();
        assert_eq!(v, -1.0);
    }
}
