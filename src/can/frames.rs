use crate::utils::Utils;

use nom_derive::{Nom, Parse};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

pub const PAYLOAD_LEN: usize = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum FrameId {
    Limits = 0x351,
    SocSoh = 0x355,
    PackStatus = 0x356,
    AlarmLegacy = 0x359,
    AlarmExtended = 0x35A,
    Requests = 0x35C,
    Manufacturer = 0x35E,
    Extremes = 0x370,
    ExtremeIndices = 0x371,
}

// 0x351 {{{
#[derive(Clone, Debug, PartialEq, Serialize, Nom)]
#[nom(LittleEndian)]
pub struct Limits {
    #[nom(Parse = "Utils::le_u16_div10")]
    pub charge_voltage: f64,
    #[nom(Parse = "Utils::le_u16_div10")]
    pub charge_current: f64,
    #[nom(Parse = "Utils::le_u16_div10")]
    pub discharge_current: f64,
    #[nom(Parse = "Utils::le_u16_div10")]
    pub discharge_voltage: f64,
} // }}}

// 0x355 {{{
#[derive(Clone, Debug, PartialEq, Serialize, Nom)]
#[nom(LittleEndian)]
pub struct SocSoh {
    pub soc: u16,
    pub soh: u16,
} // }}}

// 0x356 {{{
#[derive(Clone, Debug, PartialEq, Serialize, Nom)]
#[nom(LittleEndian)]
pub struct PackStatus {
    #[nom(Parse = "Utils::le_u16_div100")]
    pub voltage: f64,
    #[nom(Parse = "Utils::le_i16_div10")]
    pub current: f64,
    #[nom(Parse = "Utils::le_i16_div10")]
    pub temperature: f64,
} // }}}

// 0x359 / 0x35A {{{
#[derive(Clone, Debug, PartialEq, Serialize, Nom)]
#[nom(LittleEndian)]
pub struct AlarmWord {
    pub flags: u64,
}

// byte 0-1 protections, byte 2-3 warnings
const LEGACY_PROTECTIONS: [(u32, &str); 7] = [
    (1, "cell_overvolt"),
    (2, "cell_undervolt"),
    (3, "overtemp"),
    (4, "undertemp"),
    (7, "discharge_overcurrent"),
    (8, "charge_overcurrent"),
    (11, "system_error"),
];

const LEGACY_WARNINGS: [(u32, &str); 7] = [
    (17, "high_voltage"),
    (18, "low_voltage"),
    (19, "high_temp"),
    (20, "low_temp"),
    (23, "discharge_high_current"),
    (24, "charge_high_current"),
    (27, "internal_comm_fail"),
];

impl AlarmWord {
    pub fn legacy_protections(&self) -> Vec<&'static str> {
        Self::names(self.flags, &LEGACY_PROTECTIONS)
    }

    pub fn legacy_warnings(&self) -> Vec<&'static str> {
        Self::names(self.flags, &LEGACY_WARNINGS)
    }

    fn names(flags: u64, table: &[(u32, &'static str)]) -> Vec<&'static str> {
        table
            .iter()
            .filter(|(bit, _)| flags & (1u64 << *bit) != 0)
            .map(|(_, name)| *name)
            .collect()
    }
} // }}}

// 0x35C {{{
#[derive(Clone, Debug, PartialEq, Serialize, Nom)]
#[nom(LittleEndian)]
pub struct Requests {
    pub flags: u8,
} // }}}

// 0x370 {{{
#[derive(Clone, Debug, PartialEq, Serialize, Nom)]
#[nom(LittleEndian)]
pub struct Extremes {
    #[nom(Parse = "Utils::le_i16_div10")]
    pub temperature_1: f64,
    #[nom(Parse = "Utils::le_i16_div10")]
    pub temperature_2: f64,
    #[nom(Parse = "Utils::le_u16_div1000")]
    pub cell_voltage_1: f64,
    #[nom(Parse = "Utils::le_u16_div1000")]
    pub cell_voltage_2: f64,
} // }}}

// 0x371 {{{
#[derive(Clone, Debug, PartialEq, Serialize, Nom)]
#[nom(LittleEndian)]
pub struct ExtremeIndices {
    pub a: u16,
    pub b: u16,
    pub c: u16,
    pub d: u16,
} // }}}

/// ASCII name, NUL/space padded.
pub fn manufacturer(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

pub fn parse<'a, T: Parse<&'a [u8]>>(data: &'a [u8]) -> Option<T> {
    match T::parse(data) {
        Ok((_, r)) => Some(r),
        Err(_) => None,
    }
}
