//! Builds replies for the passive role. Analog and alarm replies come from
//! the first polled unit when it is fresh, otherwise they are synthesised
//! from the broadcast stack state.

use crate::engine::machine::{Context, DropReason, Settings};
use crate::pylon::cursor::{ascii_to_hex, HexCursor};
use crate::pylon::frame::{Command, Frame, ReturnCode, PROTOCOL_VERSION};
use crate::pylon::payload::{self, AlarmData, AnalogData, MAX_CELLS};
use crate::state::{StackState, UnitState};
use crate::utils::Utils;

const SYNTHETIC_TEMPERATURES: usize = 4;
const ANALOG_INFO_FLAG: u8 = 0x00;
/// capacities fit in two bytes
const USER_DEFINED: u8 = 0x02;

// alarm byte values, see the bit table in pylon::payload
const BELOW_LIMIT: u8 = 0x01;
const ABOVE_LIMIT: u8 = 0x02;
const CHARGE_MOSFET: u8 = 0x01;
const DISCHARGE_MOSFET: u8 = 0x02;
const FULLY_CHARGED: u8 = 0x08;

const BROADCAST_PROTECTIONS: [(&str, u8); 6] = [
    ("cell_overvolt", 0x01),
    ("cell_undervolt", 0x02),
    ("charge_overcurrent", 0x04),
    ("discharge_overcurrent", 0x08),
    ("overtemp", 0x10),
    ("undertemp", 0x20),
];

pub fn respond(
    request: &Frame,
    ctx: &Context,
    settings: &Settings,
) -> Result<(Frame, Option<Command>), DropReason> {
    let address = settings.address;

    if request.version != PROTOCOL_VERSION {
        return Ok((Frame::response(address, ReturnCode::VersionError, ""), None));
    }

    let command = match request.command() {
        Some(c) => c,
        None => return Ok((Frame::response(address, ReturnCode::InvalidCid2, ""), None)),
    };

    let battery = requested_battery(&request.info);

    let info = match command {
        Command::GetAnalog => {
            let data = analog_source(battery, ctx, settings).ok_or(DropReason::NoData(command))?;
            payload::encode_analog(&data).map_err(DropReason::Payload)?
        }
        Command::GetAlarm => {
            let data = alarm_source(battery, ctx, settings).ok_or(DropReason::NoData(command))?;
            payload::encode_alarm(&data).map_err(DropReason::Payload)?
        }
        // accepted with nothing to say
        Command::GetSystemParameter | Command::GetChargeManagement => String::new(),
        Command::GetManufacturer => ascii_to_hex(&settings.identity.manufacturer),
        Command::GetFirmwareVersion => ascii_to_hex(&settings.identity.firmware),
        Command::GetSerialNumber => ascii_to_hex(&settings.identity.serial_number),
        Command::GetProtocolVersion => format!("{:04X}", PROTOCOL_VERSION),
    };

    Ok((Frame::response(address, ReturnCode::Normal, info), Some(command)))
}

/// Battery number from the request INFO, 0 when absent.
fn requested_battery(info: &str) -> u8 {
    HexCursor::new(info.as_bytes()).read_u8().unwrap_or(0)
}

fn fresh_unit<'a>(ctx: &Context<'a>, settings: &Settings) -> Option<&'a UnitState> {
    ctx.unit0.filter(|u| {
        !u.stale
            && u.last_update
                .map_or(false, |t| Utils::elapsed_ms(ctx.now, t) < settings.stale_after_ms)
    })
}

fn fresh_stack<'a>(ctx: &Context<'a>, settings: &Settings) -> Option<&'a StackState> {
    Some(ctx.stack).filter(|s| !s.is_stale(ctx.now, settings.stale_after_ms))
}

pub fn analog_source(battery: u8, ctx: &Context, settings: &Settings) -> Option<AnalogData> {
    if let Some(unit) = fresh_unit(ctx, settings).filter(|u| u.has_analog()) {
        return Some(AnalogData {
            info_flag: ANALOG_INFO_FLAG,
            battery,
            cells: unit.cells.clone(),
            temperatures: unit.temperatures.clone(),
            current: unit.current.unwrap_or(0.0),
            voltage: unit.voltage.unwrap_or(0.0),
            remaining_capacity: unit.remaining_capacity.unwrap_or(0.0),
            user_defined: USER_DEFINED,
            total_capacity: unit.total_capacity.unwrap_or(settings.capacity_ah),
            cycles: unit.cycles.unwrap_or(0),
        });
    }

    let stack = fresh_stack(ctx, settings)?;
    synthesise_analog(battery, stack, settings.capacity_ah)
}

/// Cells at min and max with the rest on the midpoint, so the reported
/// extremes survive; temperatures as min, mid, mid, max.
pub fn synthesise_analog(battery: u8, stack: &StackState, capacity_ah: f64) -> Option<AnalogData> {
    let voltage = stack.pack_voltage?;
    let soc = stack.soc?;
    let (cell_min, cell_max) = stack.cell_voltage_min.zip(stack.cell_voltage_max)?;

    let cell_mid = Utils::round((cell_min + cell_max) / 2.0, 3);
    let mut cells = vec![cell_mid; MAX_CELLS];
    cells[0] = cell_min;
    cells[MAX_CELLS - 1] = cell_max;

    let (t_min, t_max) = match (stack.temperature_min, stack.temperature_max) {
        (Some(min), Some(max)) => (min, max),
        _ => {
            let t = stack.pack_temperature?;
            (t, t)
        }
    };
    let t_mid = Utils::round((t_min + t_max) / 2.0, 1);
    let mut temperatures = vec![t_mid; SYNTHETIC_TEMPERATURES];
    temperatures[0] = t_min;
    temperatures[SYNTHETIC_TEMPERATURES - 1] = t_max;

    Some(AnalogData {
        info_flag: ANALOG_INFO_FLAG,
        battery,
        cells,
        temperatures,
        current: stack.pack_current.unwrap_or(0.0),
        voltage,
        remaining_capacity: Utils::round(soc / 100.0 * capacity_ah, 2),
        user_defined: USER_DEFINED,
        total_capacity: capacity_ah,
        cycles: 0,
    })
}

pub fn alarm_source(battery: u8, ctx: &Context, settings: &Settings) -> Option<AlarmData> {
    if let Some(alarm) = fresh_unit(ctx, settings).and_then(|u| u.alarm()) {
        let mut data = alarm.clone();
        data.battery = battery;
        return Some(data);
    }

    let stack = fresh_stack(ctx, settings)?;
    Some(synthesise_alarm(battery, stack))
}

/// Maps broadcast alarm names and request flags onto the serial alarm layout.
pub fn synthesise_alarm(battery: u8, stack: &StackState) -> AlarmData {
    let mut data = AlarmData::normal(battery, MAX_CELLS, SYNTHETIC_TEMPERATURES);

    if let Some(requests) = &stack.requests {
        data.status[1] = 0;
        if requests.charge_enable {
            data.status[1] |= CHARGE_MOSFET;
        }
        if requests.discharge_enable {
            data.status[1] |= DISCHARGE_MOSFET;
        }
        if requests.full_charge {
            data.status[2] |= FULLY_CHARGED;
        }
    }

    if let Some(alarm) = &stack.alarm {
        for (name, bit) in BROADCAST_PROTECTIONS.iter() {
            if alarm.protections.contains(name) {
                data.status[0] |= bit;
            }
        }
        for warning in &alarm.warnings {
            match *warning {
                "high_voltage" => data.pack_voltage = ABOVE_LIMIT,
                "low_voltage" => data.pack_voltage = BELOW_LIMIT,
                "charge_high_current" => data.charge_current = ABOVE_LIMIT,
                "discharge_high_current" => data.discharge_current = ABOVE_LIMIT,
                "high_temp" => data.temperatures.iter_mut().for_each(|t| *t = ABOVE_LIMIT),
                "low_temp" => data.temperatures.iter_mut().for_each(|t| *t = BELOW_LIMIT),
                _ => {}
            }
        }
    }

    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AlarmFlags, RequestFlags};

    fn stack() -> StackState {
        StackState {
            soc: Some(80.0),
            pack_voltage: Some(53.2),
            pack_current: Some(-12.5),
            cell_voltage_min: Some(3.320),
            cell_voltage_max: Some(3.340),
            temperature_min: Some(21.0),
            temperature_max: Some(25.0),
            last_update: Some(1000),
            ..Default::default()
        }
    }

    #[test]
    fn synthesised_analog_keeps_extremes() {
        let data = synthesise_analog(0, &stack(), 100.0).unwrap();
        assert_eq!(data.cells.len(), 16);
        assert_eq!(data.cells[0], 3.320);
        assert_eq!(data.cells[15], 3.340);
        assert_eq!(data.cells[7], 3.330);
        assert_eq!(data.temperatures, vec![21.0, 23.0, 23.0, 25.0]);
        assert_eq!(data.remaining_capacity, 80.0);
        assert_eq!(data.current, -12.5);
    }

    #[test]
    fn synthesis_needs_cell_extremes() {
        let mut s = stack();
        s.cell_voltage_max = None;
        assert!(synthesise_analog(0, &s, 100.0).is_none());
    }

    #[test]
    fn synthesised_alarm_maps_broadcast_flags() {
        let mut s = stack();
        s.requests = Some(RequestFlags::new(0x80));
        s.alarm = Some(AlarmFlags {
            id: 0x359,
            raw: 0,
            protections: vec!["overtemp"],
            warnings: vec!["high_voltage"],
        });

        let data = synthesise_alarm(3, &s);
        assert_eq!(data.battery, 3);
        assert!(data.charge_enabled());
        assert!(!data.discharge_enabled());
        assert_eq!(data.status[0], 0x10);
        assert_eq!(data.pack_voltage, ABOVE_LIMIT);
    }
}
