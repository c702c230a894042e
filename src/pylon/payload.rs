use crate::error::PayloadError;
use crate::pylon::cursor::HexCursor;

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Write;

pub const MAX_CELLS: usize = 16;
pub const MAX_TEMPERATURES: usize = 8;

/// 0 °C expressed in the wire's tenths of a Kelvin.
const KELVIN_OFFSET: i32 = 2731;

// AnalogData {{{
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnalogData {
    pub info_flag: u8,
    pub battery: u8,
    /// volts
    pub cells: Vec<f64>,
    /// °C
    pub temperatures: Vec<f64>,
    /// amps, positive while charging
    pub current: f64,
    pub voltage: f64,
    /// Ah
    pub remaining_capacity: f64,
    pub user_defined: u8,
    /// Ah
    pub total_capacity: f64,
    pub cycles: u16,
}

impl AnalogData {
    pub fn soc(&self) -> Option<f64> {
        if self.total_capacity > 0.0 {
            Some(self.remaining_capacity / self.total_capacity * 100.0)
        } else {
            None
        }
    }
} // }}}

pub fn decode_analog(info: &str) -> Result<AnalogData, PayloadError> {
    let mut c = HexCursor::new(info.as_bytes());

    let info_flag = c.read_u8()?;
    let battery = c.read_u8()?;

    let cell_count = count(&mut c, "cell", MAX_CELLS)?;
    let cells = (0..cell_count)
        .map(|_| c.read_u16().map(|v| v as f64 / 1000.0))
        .collect::<Result<Vec<_>, _>>()?;

    let temp_count = count(&mut c, "temperature", MAX_TEMPERATURES)?;
    let temperatures = (0..temp_count)
        .map(|_| c.read_u16().map(|v| (v as i32 - KELVIN_OFFSET) as f64 / 10.0))
        .collect::<Result<Vec<_>, _>>()?;

    let current = c.read_i16()? as f64 / 100.0;
    let voltage = c.read_u16()? as f64 / 1000.0;
    let remaining_capacity = c.read_u16()? as f64 / 100.0;
    let user_defined = c.read_u8()?;
    let total_capacity = c.read_u16()? as f64 / 100.0;
    let cycles = c.read_u16()?;

    Ok(AnalogData {
        info_flag,
        battery,
        cells,
        temperatures,
        current,
        voltage,
        remaining_capacity,
        user_defined,
        total_capacity,
        cycles,
    })
}

pub fn encode_analog(data: &AnalogData) -> Result<String, PayloadError> {
    check_count("cell", data.cells.len(), MAX_CELLS)?;
    check_count("temperature", data.temperatures.len(), MAX_TEMPERATURES)?;

    let mut out = String::new();
    push_u8(&mut out, data.info_flag);
    push_u8(&mut out, data.battery);

    push_u8(&mut out, data.cells.len() as u8);
    for v in &data.cells {
        push_u16(&mut out, scaled_u16("cell", *v, 1000.0)?);
    }

    push_u8(&mut out, data.temperatures.len() as u8);
    for t in &data.temperatures {
        let raw = (t * 10.0).round() as i64 + KELVIN_OFFSET as i64;
        push_u16(&mut out, fit_u16("temperature", raw, *t)?);
    }

    let current = (data.current * 100.0).round() as i64;
    if current < i16::MIN as i64 || current > i16::MAX as i64 {
        return Err(PayloadError::Unencodable {
            field: "current",
            value: data.current,
        });
    }
    push_u16(&mut out, current as i16 as u16);
    push_u16(&mut out, scaled_u16("voltage", data.voltage, 1000.0)?);
    push_u16(
        &mut out,
        scaled_u16("remaining_capacity", data.remaining_capacity, 100.0)?,
    );
    push_u8(&mut out, data.user_defined);
    push_u16(
        &mut out,
        scaled_u16("total_capacity", data.total_capacity, 100.0)?,
    );
    push_u16(&mut out, data.cycles);

    Ok(out)
}

// Alarm bit table {{{
//
// Per-cell, per-temperature and the three pack alarm bytes:
//   0x01 below lower limit -> warning
//   0x02 above upper limit -> warning
//   0x80 (cells only) balancing -> status, neither set
//
// status[0] protections:
//   0x01 module over-voltage      0x02 module under-voltage
//   0x04 charge over-current      0x08 discharge over-current
//   0x10 over-temperature         0x20 under-temperature
// status[1] switches: 0x01 charge MOSFET on, 0x02 discharge MOSFET on
// status[2] system: 0x08 fully charged
// status[3] cell 1-8 fault -> protection, status[4] cell 9-16 fault -> protection

const LIMIT_LOW: u8 = 0x01;
const LIMIT_HIGH: u8 = 0x02;
const CELL_BALANCING: u8 = 0x80;

const PROTECTION_BITS: [(u8, Protection); 6] = [
    (0x01, Protection::ModuleOvervolt),
    (0x02, Protection::ModuleUndervolt),
    (0x04, Protection::ChargeOvercurrent),
    (0x08, Protection::DischargeOvercurrent),
    (0x10, Protection::Overtemperature),
    (0x20, Protection::Undertemperature),
];

const CHARGE_MOSFET: u8 = 0x01;
const DISCHARGE_MOSFET: u8 = 0x02;
const FULLY_CHARGED: u8 = 0x08;
// }}}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub enum Limit {
    Low,
    High,
}

impl Limit {
    fn from_byte(b: u8) -> Option<Self> {
        match b & !CELL_BALANCING {
            LIMIT_LOW => Some(Self::Low),
            LIMIT_HIGH => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub enum Warning {
    Cell(u8, Limit),
    Temperature(u8, Limit),
    ChargeCurrent(Limit),
    PackVoltage(Limit),
    DischargeCurrent(Limit),
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = |l: &Limit| match l {
            Limit::Low => "low",
            Limit::High => "high",
        };
        match self {
            Self::Cell(n, l) => write!(f, "cell{}_{}", n, level(l)),
            Self::Temperature(n, l) => write!(f, "temp{}_{}", n, level(l)),
            Self::ChargeCurrent(l) => write!(f, "charge_current_{}", level(l)),
            Self::PackVoltage(l) => write!(f, "pack_voltage_{}", level(l)),
            Self::DischargeCurrent(l) => write!(f, "discharge_current_{}", level(l)),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub enum Protection {
    ModuleOvervolt,
    ModuleUndervolt,
    ChargeOvercurrent,
    DischargeOvercurrent,
    Overtemperature,
    Undertemperature,
    CellFault(u8),
}

impl std::fmt::Display for Protection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModuleOvervolt => write!(f, "module_overvolt"),
            Self::ModuleUndervolt => write!(f, "module_undervolt"),
            Self::ChargeOvercurrent => write!(f, "charge_overcurrent"),
            Self::DischargeOvercurrent => write!(f, "discharge_overcurrent"),
            Self::Overtemperature => write!(f, "overtemp"),
            Self::Undertemperature => write!(f, "undertemp"),
            Self::CellFault(n) => write!(f, "cell{}_fault", n),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum CellStatus {
    Normal,
    Undervolt,
    Overvolt,
    Balancing,
}

impl CellStatus {
    pub fn from_byte(b: u8) -> Self {
        match Limit::from_byte(b) {
            Some(Limit::Low) => Self::Undervolt,
            Some(Limit::High) => Self::Overvolt,
            None if b & CELL_BALANCING != 0 => Self::Balancing,
            None => Self::Normal,
        }
    }
}

// AlarmData {{{
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct AlarmData {
    pub info_flag: u8,
    pub battery: u8,
    /// raw per-cell status bytes
    pub cells: Vec<u8>,
    /// raw per-sensor status bytes
    pub temperatures: Vec<u8>,
    pub charge_current: u8,
    pub pack_voltage: u8,
    pub discharge_current: u8,
    pub status: [u8; 5],
}

impl AlarmData {
    pub fn cell_status(&self) -> Vec<CellStatus> {
        self.cells.iter().map(|b| CellStatus::from_byte(*b)).collect()
    }

    pub fn balancing_cells(&self) -> Vec<u8> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, b)| *b & CELL_BALANCING != 0)
            .map(|(i, _)| i as u8 + 1)
            .collect()
    }

    pub fn warnings(&self) -> BTreeSet<Warning> {
        let mut r = BTreeSet::new();

        for (i, b) in self.cells.iter().enumerate() {
            if let Some(l) = Limit::from_byte(*b) {
                r.insert(Warning::Cell(i as u8 + 1, l));
            }
        }
        for (i, b) in self.temperatures.iter().enumerate() {
            if let Some(l) = Limit::from_byte(*b) {
                r.insert(Warning::Temperature(i as u8 + 1, l));
            }
        }
        if let Some(l) = Limit::from_byte(self.charge_current) {
            r.insert(Warning::ChargeCurrent(l));
        }
        if let Some(l) = Limit::from_byte(self.pack_voltage) {
            r.insert(Warning::PackVoltage(l));
        }
        if let Some(l) = Limit::from_byte(self.discharge_current) {
            r.insert(Warning::DischargeCurrent(l));
        }

        r
    }

    pub fn protections(&self) -> BTreeSet<Protection> {
        let mut r: BTreeSet<Protection> = PROTECTION_BITS
            .iter()
            .filter(|(bit, _)| self.status[0] & bit != 0)
            .map(|(_, p)| *p)
            .collect();

        for (byte, first_cell) in [(self.status[3], 1u8), (self.status[4], 9u8)] {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    r.insert(Protection::CellFault(first_cell + bit));
                }
            }
        }

        r
    }

    pub fn charge_enabled(&self) -> bool {
        self.status[1] & CHARGE_MOSFET != 0
    }

    pub fn discharge_enabled(&self) -> bool {
        self.status[1] & DISCHARGE_MOSFET != 0
    }

    pub fn fully_charged(&self) -> bool {
        self.status[2] & FULLY_CHARGED != 0
    }

    /// Alarm payload for a healthy pack with both MOSFETs on.
    pub fn normal(battery: u8, cells: usize, temperatures: usize) -> Self {
        Self {
            info_flag: 0x11,
            battery,
            cells: vec![0; cells],
            temperatures: vec![0; temperatures],
            charge_current: 0,
            pack_voltage: 0,
            discharge_current: 0,
            status: [0, CHARGE_MOSFET | DISCHARGE_MOSFET, 0, 0, 0],
        }
    }
} // }}}

pub fn decode_alarm(info: &str) -> Result<AlarmData, PayloadError> {
    let mut c = HexCursor::new(info.as_bytes());

    let info_flag = c.read_u8()?;
    let battery = c.read_u8()?;
    let cell_count = count(&mut c, "cell", MAX_CELLS)?;
    let cells = c.read_bytes(cell_count)?;
    let temp_count = count(&mut c, "temperature", MAX_TEMPERATURES)?;
    let temperatures = c.read_bytes(temp_count)?;
    let charge_current = c.read_u8()?;
    let pack_voltage = c.read_u8()?;
    let discharge_current = c.read_u8()?;

    let mut status = [0u8; 5];
    for s in status.iter_mut() {
        *s = c.read_u8()?;
    }

    Ok(AlarmData {
        info_flag,
        battery,
        cells,
        temperatures,
        charge_current,
        pack_voltage,
        discharge_current,
        status,
    })
}

pub fn encode_alarm(data: &AlarmData) -> Result<String, PayloadError> {
    check_count("cell", data.cells.len(), MAX_CELLS)?;
    check_count("temperature", data.temperatures.len(), MAX_TEMPERATURES)?;

    let mut out = String::new();
    push_u8(&mut out, data.info_flag);
    push_u8(&mut out, data.battery);
    push_u8(&mut out, data.cells.len() as u8);
    data.cells.iter().for_each(|b| push_u8(&mut out, *b));
    push_u8(&mut out, data.temperatures.len() as u8);
    data.temperatures.iter().for_each(|b| push_u8(&mut out, *b));
    push_u8(&mut out, data.charge_current);
    push_u8(&mut out, data.pack_voltage);
    push_u8(&mut out, data.discharge_current);
    data.status.iter().for_each(|b| push_u8(&mut out, *b));

    Ok(out)
}

fn count(c: &mut HexCursor, field: &'static str, max: usize) -> Result<usize, PayloadError> {
    let n = c.read_u8()? as usize;
    check_count(field, n, max)?;
    Ok(n)
}

fn check_count(field: &'static str, count: usize, max: usize) -> Result<(), PayloadError> {
    if count == 0 || count > max {
        return Err(PayloadError::BadCount { field, count, max });
    }
    Ok(())
}

fn scaled_u16(field: &'static str, value: f64, factor: f64) -> Result<u16, PayloadError> {
    fit_u16(field, (value * factor).round() as i64, value)
}

fn fit_u16(field: &'static str, raw: i64, value: f64) -> Result<u16, PayloadError> {
    if !value.is_finite() || raw < 0 || raw > u16::MAX as i64 {
        return Err(PayloadError::Unencodable { field, value });
    }
    Ok(raw as u16)
}

fn push_u8(out: &mut String, v: u8) {
    let _ = write!(out, "{:02X}", v);
}

fn push_u16(out: &mut String, v: u16) {
    let _ = write!(out, "{:04X}", v);
}
