#![allow(dead_code)]

use pylon_bridge::engine::Settings;
use pylon_bridge::modbus::frame::crc16;
use pylon_bridge::prelude::*;
use pylon_bridge::pylon::frame::{Frame, ReturnCode};
use pylon_bridge::pylon::payload::{self, AlarmData, AnalogData};

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Factory();
impl Factory {
    pub fn analog(battery: u8) -> AnalogData {
        AnalogData {
            info_flag: 0x00,
            battery,
            cells: vec![3.301, 3.302, 3.303, 3.304],
            temperatures: vec![21.5, 22.0],
            current: -5.25,
            voltage: 13.21,
            remaining_capacity: 80.0,
            user_defined: 0x02,
            total_capacity: 100.0,
            cycles: 42,
        }
    }

    pub fn alarm(battery: u8) -> AlarmData {
        AlarmData::normal(battery, 4, 2)
    }

    /// Encoded response frame as a unit at `address` would send it.
    pub fn analog_response(address: u8, battery: u8) -> Vec<u8> {
        let info = payload::encode_analog(&Self::analog(battery)).unwrap();
        Frame::response(address, ReturnCode::Normal, info)
            .encode()
            .unwrap()
    }

    pub fn alarm_response(address: u8, battery: u8) -> Vec<u8> {
        let info = payload::encode_alarm(&Self::alarm(battery)).unwrap();
        Frame::response(address, ReturnCode::Normal, info)
            .encode()
            .unwrap()
    }

    pub fn settings() -> Settings {
        Settings {
            address: 2,
            batteries: 1,
            response_window_ms: 300,
            response_budget_ms: 500,
            poll_interval_ms: 5000,
            max_attempts: 2,
            stale_after_ms: 30_000,
            capacity_ah: 100.0,
            ..Default::default()
        }
    }

    pub fn stack_state(now: u32) -> StackState {
        StackState {
            charge_voltage_limit: Some(53.2),
            charge_current_limit: Some(370.0),
            discharge_current_limit: Some(370.0),
            discharge_voltage_limit: Some(46.0),
            soc: Some(80.0),
            soh: Some(99.0),
            pack_voltage: Some(53.2),
            pack_current: Some(-12.5),
            pack_temperature: Some(23.0),
            cell_voltage_min: Some(3.320),
            cell_voltage_max: Some(3.340),
            temperature_min: Some(21.0),
            temperature_max: Some(25.0),
            last_update: Some(now),
            ..Default::default()
        }
    }

    /// Register protocol response with a valid CRC.
    pub fn modbus_response(slave: u8, function: u8, payload: &[u8]) -> Vec<u8> {
        let mut r = vec![slave, function];
        r.extend_from_slice(payload);
        let crc = crc16(&r);
        r.extend_from_slice(&crc);
        r
    }

    pub fn config_yaml() -> &'static str {
        r#"
mqtt:
  enabled: false
  host: localhost
can:
  source: tcp
  host: 127.0.0.1
  port: 8881
"#
    }

    pub fn config() -> ConfigWrapper {
        ConfigWrapper::from_config(Config::from_yaml(Self::config_yaml()).unwrap())
    }
}
