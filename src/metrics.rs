//! Flattens the shared state into keyed samples for the publication gate.

use crate::modbus::{Point, Register};
use crate::prelude::*;
use crate::publish_gate::{Sample, Value};
use crate::state::{StackState, UnitsSnapshot};

use std::collections::HashMap;

fn number(out: &mut Vec<Sample>, key: String, value: Option<f64>, now: u32) {
    if let Some(v) = value {
        out.push(Sample::new(key, Value::Number(v), now));
    }
}

fn join<T: ToString>(items: impl IntoIterator<Item = T>) -> String {
    let joined: Vec<String> = items.into_iter().map(|i| i.to_string()).collect();
    if joined.is_empty() {
        "none".to_string()
    } else {
        joined.join(",")
    }
}

pub fn stack_samples(stack: &StackState, now: u32) -> Vec<Sample> {
    let mut out = Vec::new();

    for (name, value) in [
        ("charge_voltage_limit", stack.charge_voltage_limit),
        ("charge_current_limit", stack.charge_current_limit),
        ("discharge_current_limit", stack.discharge_current_limit),
        ("discharge_voltage_limit", stack.discharge_voltage_limit),
        ("soc", stack.soc),
        ("soh", stack.soh),
        ("voltage", stack.pack_voltage),
        ("current", stack.pack_current),
        ("temperature", stack.pack_temperature),
        ("cell_voltage_min", stack.cell_voltage_min),
        ("cell_voltage_max", stack.cell_voltage_max),
        ("cell_voltage_delta", stack.cell_voltage_delta()),
        ("temperature_min", stack.temperature_min),
        ("temperature_max", stack.temperature_max),
    ] {
        number(&mut out, format!("stack/{}", name), value, now);
    }

    if let Some(requests) = &stack.requests {
        for (name, flag) in [
            ("charge_enable", requests.charge_enable),
            ("discharge_enable", requests.discharge_enable),
            ("force_charge", requests.force_charge_1 || requests.force_charge_2),
            ("full_charge", requests.full_charge),
        ] {
            out.push(Sample::new(format!("stack/{}", name), Value::Flag(flag), now));
        }
    }

    if let Some(alarm) = &stack.alarm {
        out.push(Sample::new(
            "stack/protections",
            Value::Text(join(alarm.protections.iter())),
            now,
        ));
        out.push(Sample::new(
            "stack/warnings",
            Value::Text(join(alarm.warnings.iter())),
            now,
        ));
        out.push(Sample::new(
            "stack/alarm_active",
            Value::Flag(!alarm.protections.is_empty()),
            now,
        ));
    }

    if let Some(manufacturer) = &stack.manufacturer {
        out.push(Sample::new(
            "stack/manufacturer",
            Value::Text(manufacturer.clone()),
            now,
        ));
    }

    out.push(Sample::new(
        "stack/rejected_frames",
        Value::Number(stack.rejected_frames as f64),
        now,
    ));

    out
}

pub fn unit_samples(snapshot: &UnitsSnapshot, now: u32) -> Vec<Sample> {
    let mut out = Vec::new();

    for unit in &snapshot.units {
        let prefix = format!("battery/{}", unit.index);
        out.push(Sample::new(format!("{}/stale", prefix), Value::Flag(unit.stale), now));
        if unit.stale {
            continue;
        }

        for (name, value) in [
            ("voltage", unit.voltage),
            ("current", unit.current),
            ("soc", unit.soc),
            ("remaining_capacity", unit.remaining_capacity),
            ("total_capacity", unit.total_capacity),
            ("cycles", unit.cycles.map(f64::from)),
        ] {
            number(&mut out, format!("{}/{}", prefix, name), value, now);
        }
        for (i, v) in unit.cells.iter().enumerate() {
            number(&mut out, format!("{}/cell/{}", prefix, i + 1), Some(*v), now);
        }
        for (i, t) in unit.temperatures.iter().enumerate() {
            number(&mut out, format!("{}/temperature/{}", prefix, i + 1), Some(*t), now);
        }

        if let Some(state) = unit.operating_state {
            out.push(Sample::new(
                format!("{}/state", prefix),
                Value::Text(state.to_string()),
                now,
            ));
        }
        if unit.alarm().is_some() {
            out.push(Sample::new(
                format!("{}/warnings", prefix),
                Value::Text(join(unit.warnings.iter())),
                now,
            ));
            out.push(Sample::new(
                format!("{}/protections", prefix),
                Value::Text(join(unit.protections.iter())),
                now,
            ));
            out.push(Sample::new(
                format!("{}/balancing", prefix),
                Value::Flag(!unit.balancing.is_empty()),
                now,
            ));
        }
    }

    let summary = &snapshot.summary;
    if summary.units > 0 {
        for (name, value) in [
            ("cell_min_mv", summary.cell_min_mv.map(f64::from)),
            ("cell_max_mv", summary.cell_max_mv.map(f64::from)),
            ("cell_delta_mv", summary.cell_delta_mv.map(f64::from)),
            ("voltage", summary.voltage),
            ("current", summary.current),
            ("temperature_min", summary.temperature_min),
            ("temperature_max", summary.temperature_max),
        ] {
            number(&mut out, format!("summary/{}", name), value, now);
        }
        out.push(Sample::new(
            "summary/balancing",
            Value::Text(join(summary.balancing.iter())),
            now,
        ));
        out.push(Sample::new(
            "summary/warnings",
            Value::Text(join(summary.warnings.iter())),
            now,
        ));
        out.push(Sample::new(
            "summary/protections",
            Value::Text(join(summary.protections.iter())),
            now,
        ));
        match serde_json::to_string(summary) {
            Ok(json) => out.push(Sample::new("summary/json", Value::Text(json), now)),
            Err(e) => warn!("summary/json: {}", e),
        }
    }

    out
}

/// Only registers the cache holds are reported; a missing register has never
/// passed validation.
pub fn register_samples(
    points: &[Point],
    registers: &HashMap<Register, u16>,
    corruptions_recent: u64,
    now: u32,
) -> Vec<Sample> {
    let mut out: Vec<Sample> = points
        .iter()
        .filter_map(|p| {
            registers.get(&p.register()).map(|raw| {
                Sample::new(format!("modbus/{}", p.name), Value::Number(p.value(*raw)), now)
            })
        })
        .collect();

    out.push(Sample::new(
        "modbus/corruptions_10min",
        Value::Number(corruptions_recent as f64),
        now,
    ));

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::FunctionCode;
    use crate::state::{RequestFlags, StackSummary};

    #[test]
    fn stack_skips_unknown_fields() {
        let stack = StackState {
            soc: Some(80.0),
            requests: Some(RequestFlags::new(0xC0)),
            ..Default::default()
        };
        let samples = stack_samples(&stack, 5);
        let keys: Vec<&str> = samples.iter().map(|s| s.key.as_str()).collect();
        assert!(keys.contains(&"stack/soc"));
        assert!(!keys.contains(&"stack/voltage"));
        assert!(samples.contains(&Sample::new("stack/charge_enable", Value::Flag(true), 5)));
        assert!(samples.contains(&Sample::new("stack/full_charge", Value::Flag(false), 5)));
    }

    #[test]
    fn summary_is_also_published_as_json() {
        let mut unit = UnitState::unknown(0);
        unit.cells = vec![3.301, 3.304];
        unit.voltage = Some(6.6);
        unit.current = Some(-1.0);
        unit.stale = false;
        let snapshot = UnitsSnapshot {
            summary: StackSummary::from_units(std::slice::from_ref(&unit)),
            units: vec![unit],
        };

        let samples = unit_samples(&snapshot, 0);
        let json = samples
            .iter()
            .find(|s| s.key == "summary/json")
            .map(|s| s.value.to_string())
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["units"], 1);
        assert_eq!(parsed["cell_delta_mv"], 3);
    }

    #[test]
    fn registers_scaled_by_point() {
        let points = vec![Point {
            name: "pv_voltage".to_string(),
            address: 0x3100,
            function: FunctionCode::ReadInput,
            scale: 0.01,
            signed: false,
            min: None,
            max: None,
            writable: false,
        }];
        let mut registers = HashMap::new();
        registers.insert(Register::input(0x3100), 1234);
        let samples = register_samples(&points, &registers, 2, 0);
        assert_eq!(samples[0], Sample::new("modbus/pv_voltage", Value::Number(12.34), 0));
        assert_eq!(samples[1].value, Value::Number(2.0));
    }
}
