use crate::pylon::{AlarmData, AnalogData, CellStatus, Protection, Warning};
use crate::utils::Utils;

use serde::Serialize;
use std::collections::BTreeSet;
use tokio::sync::watch;

/// Current magnitude (A) below which a unit counts as idle.
const IDLE_CURRENT: f64 = 0.5;

// StackState {{{
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StackState {
    pub charge_voltage_limit: Option<f64>,
    pub charge_current_limit: Option<f64>,
    pub discharge_current_limit: Option<f64>,
    pub discharge_voltage_limit: Option<f64>,

    pub soc: Option<f64>,
    pub soh: Option<f64>,

    pub pack_voltage: Option<f64>,
    pub pack_current: Option<f64>,
    pub pack_temperature: Option<f64>,

    pub cell_voltage_min: Option<f64>,
    pub cell_voltage_max: Option<f64>,
    pub temperature_min: Option<f64>,
    pub temperature_max: Option<f64>,
    pub extreme_indices: Option<[u16; 4]>,

    pub alarm: Option<AlarmFlags>,
    pub requests: Option<RequestFlags>,
    pub manufacturer: Option<String>,

    /// tick of the last validated frame
    pub last_update: Option<u32>,
    pub rejected_frames: u64,
}

impl StackState {
    pub fn cell_voltage_delta(&self) -> Option<f64> {
        match (self.cell_voltage_min, self.cell_voltage_max) {
            (Some(min), Some(max)) => Some(Utils::round(max - min, 3)),
            _ => None,
        }
    }

    pub fn is_stale(&self, now: u32, stale_after_ms: u32) -> bool {
        match self.last_update {
            Some(t) => Utils::elapsed_ms(now, t) >= stale_after_ms,
            None => true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AlarmFlags {
    pub id: u32,
    pub raw: u64,
    pub protections: Vec<&'static str>,
    pub warnings: Vec<&'static str>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RequestFlags {
    pub charge_enable: bool,
    pub discharge_enable: bool,
    pub force_charge_1: bool,
    pub force_charge_2: bool,
    pub full_charge: bool,
}

impl RequestFlags {
    pub fn new(byte: u8) -> Self {
        Self {
            charge_enable: byte & (1 << 7) != 0,
            discharge_enable: byte & (1 << 6) != 0,
            force_charge_1: byte & (1 << 5) != 0,
            force_charge_2: byte & (1 << 4) != 0,
            full_charge: byte & (1 << 3) != 0,
        }
    }
} // }}}

// UnitState {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum OperatingState {
    Discharge,
    Charge,
    Float,
    Full,
    Standby,
    Shutdown,
}

impl OperatingState {
    /// Both switches off wins; otherwise the current sign decides, with the
    /// fully-charged flag splitting Charge/Float and Standby/Full.
    pub fn derive(current: f64, alarm: &AlarmData) -> Self {
        if !alarm.charge_enabled() && !alarm.discharge_enabled() {
            Self::Shutdown
        } else if current <= -IDLE_CURRENT {
            Self::Discharge
        } else if current >= IDLE_CURRENT && alarm.fully_charged() {
            Self::Float
        } else if current >= IDLE_CURRENT {
            Self::Charge
        } else if alarm.fully_charged() {
            Self::Full
        } else {
            Self::Standby
        }
    }
}

impl std::fmt::Display for OperatingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Discharge => "discharge",
            Self::Charge => "charge",
            Self::Float => "float",
            Self::Full => "full",
            Self::Standby => "standby",
            Self::Shutdown => "shutdown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UnitState {
    pub index: u8,
    pub cells: Vec<f64>,
    pub cell_status: Vec<CellStatus>,
    pub temperatures: Vec<f64>,
    pub current: Option<f64>,
    pub voltage: Option<f64>,
    pub soc: Option<f64>,
    pub remaining_capacity: Option<f64>,
    pub total_capacity: Option<f64>,
    pub cycles: Option<u16>,
    pub operating_state: Option<OperatingState>,
    pub warnings: BTreeSet<Warning>,
    pub protections: BTreeSet<Protection>,
    pub balancing: Vec<u8>,
    pub stale: bool,
    pub last_update: Option<u32>,
    #[serde(skip)]
    alarm: Option<AlarmData>,
}

impl UnitState {
    /// Sentinel state before the first successful poll.
    pub fn unknown(index: u8) -> Self {
        Self {
            index,
            cells: Vec::new(),
            cell_status: Vec::new(),
            temperatures: Vec::new(),
            current: None,
            voltage: None,
            soc: None,
            remaining_capacity: None,
            total_capacity: None,
            cycles: None,
            operating_state: None,
            warnings: BTreeSet::new(),
            protections: BTreeSet::new(),
            balancing: Vec::new(),
            stale: true,
            last_update: None,
            alarm: None,
        }
    }

    pub fn apply_analog(&mut self, data: &AnalogData, now: u32) {
        self.cells = data.cells.clone();
        self.temperatures = data.temperatures.clone();
        self.current = Some(data.current);
        self.voltage = Some(data.voltage);
        self.soc = data.soc().map(|s| Utils::round(s, 1));
        self.remaining_capacity = Some(data.remaining_capacity);
        self.total_capacity = Some(data.total_capacity);
        self.cycles = Some(data.cycles);
        self.touch(now);
    }

    pub fn apply_alarm(&mut self, data: &AlarmData, now: u32) {
        self.cell_status = data.cell_status();
        self.warnings = data.warnings();
        self.protections = data.protections();
        self.balancing = data.balancing_cells();
        self.alarm = Some(data.clone());
        self.touch(now);
    }

    pub fn alarm(&self) -> Option<&AlarmData> {
        self.alarm.as_ref()
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn has_analog(&self) -> bool {
        !self.cells.is_empty() && self.voltage.is_some()
    }

    fn touch(&mut self, now: u32) {
        self.stale = false;
        self.last_update = Some(now);
        if let (Some(current), Some(alarm)) = (self.current, &self.alarm) {
            self.operating_state = Some(OperatingState::derive(current, alarm));
        }
    }
} // }}}

// StackSummary {{{
/// Aggregate over every fresh unit after a full poll cycle.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StackSummary {
    pub units: usize,
    pub cell_min_mv: Option<u16>,
    pub cell_max_mv: Option<u16>,
    pub cell_delta_mv: Option<u16>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub temperature_min: Option<f64>,
    pub temperature_max: Option<f64>,
    pub balancing: Vec<String>,
    pub warnings: Vec<String>,
    pub protections: Vec<String>,
}

impl StackSummary {
    pub fn from_units(units: &[UnitState]) -> Self {
        let fresh: Vec<&UnitState> = units.iter().filter(|u| !u.stale && u.has_analog()).collect();
        if fresh.is_empty() {
            return Self::default();
        }

        let cells_mv: Vec<u16> = fresh
            .iter()
            .flat_map(|u| u.cells.iter())
            .map(|v| (v * 1000.0).round() as u16)
            .collect();
        let cell_min_mv = cells_mv.iter().min().copied();
        let cell_max_mv = cells_mv.iter().max().copied();

        let voltages: Vec<f64> = fresh.iter().filter_map(|u| u.voltage).collect();
        let voltage = if voltages.is_empty() {
            None
        } else {
            Some(Utils::round(voltages.iter().sum::<f64>() / voltages.len() as f64, 3))
        };

        let temps = fresh.iter().flat_map(|u| u.temperatures.iter().copied());
        let temperature_min = temps.clone().reduce(f64::min);
        let temperature_max = temps.reduce(f64::max);

        let mut warnings = BTreeSet::new();
        let mut protections = BTreeSet::new();
        let mut balancing = Vec::new();
        for u in &fresh {
            warnings.extend(u.warnings.iter().map(|w| format!("B{}_{}", u.index, w)));
            protections.extend(u.protections.iter().map(|p| format!("B{}_{}", u.index, p)));
            balancing.extend(u.balancing.iter().map(|c| format!("B{}C{}", u.index, c)));
        }

        Self {
            units: fresh.len(),
            cell_min_mv,
            cell_max_mv,
            cell_delta_mv: cell_min_mv.zip(cell_max_mv).map(|(min, max)| max - min),
            voltage,
            current: Some(Utils::round(fresh.iter().filter_map(|u| u.current).sum(), 2)),
            temperature_min,
            temperature_max,
            balancing,
            warnings: warnings.into_iter().collect(),
            protections: protections.into_iter().collect(),
        }
    }
} // }}}

// Snapshot handles {{{
//
// Each field group has exactly one writer. Readers clone a whole snapshot, so
// they never see half of an update.

pub struct StackWriter(watch::Sender<StackState>);

#[derive(Clone)]
pub struct StackReader(watch::Receiver<StackState>);

pub fn stack_channel() -> (StackWriter, StackReader) {
    let (tx, rx) = watch::channel(StackState::default());
    (StackWriter(tx), StackReader(rx))
}

impl StackWriter {
    pub fn update<F: FnOnce(&mut StackState)>(&self, f: F) {
        self.0.send_modify(f);
    }

    pub fn snapshot(&self) -> StackState {
        self.0.borrow().clone()
    }

    pub fn reader(&self) -> StackReader {
        StackReader(self.0.subscribe())
    }
}

impl StackReader {
    pub fn snapshot(&self) -> StackState {
        self.0.borrow().clone()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UnitsSnapshot {
    pub units: Vec<UnitState>,
    pub summary: StackSummary,
}

pub struct UnitWriter(watch::Sender<UnitsSnapshot>);

#[derive(Clone)]
pub struct UnitReader(watch::Receiver<UnitsSnapshot>);

pub fn unit_channel(count: u8) -> (UnitWriter, UnitReader) {
    let (tx, rx) = watch::channel(UnitsSnapshot {
        units: (0..count).map(UnitState::unknown).collect(),
        summary: StackSummary::default(),
    });
    (UnitWriter(tx), UnitReader(rx))
}

impl UnitWriter {
    pub fn update_unit<F: FnOnce(&mut UnitState)>(&self, index: u8, f: F) {
        self.0.send_modify(|s| {
            if let Some(unit) = s.units.iter_mut().find(|u| u.index == index) {
                f(unit);
            }
        });
    }

    pub fn summarise(&self) {
        self.0
            .send_modify(|s| s.summary = StackSummary::from_units(&s.units));
    }

    pub fn snapshot(&self) -> UnitsSnapshot {
        self.0.borrow().clone()
    }

    pub fn reader(&self) -> UnitReader {
        UnitReader(self.0.subscribe())
    }
}

impl UnitReader {
    pub fn snapshot(&self) -> UnitsSnapshot {
        self.0.borrow().clone()
    }

    pub fn unit(&self, index: u8) -> Option<UnitState> {
        self.0.borrow().units.iter().find(|u| u.index == index).cloned()
    }
} // }}}
