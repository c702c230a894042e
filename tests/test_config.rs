mod common;
use common::*;

use pylon_bridge::config::{AlarmFrame, CanSource, RoleName};
use pylon_bridge::engine::{Link, Role};
use pylon_bridge::modbus::FunctionCode;
use pylon_bridge::prelude::*;

use std::io::Write;
use std::time::Duration;

const FULL: &str = r#"
loglevel: debug
can:
  source: tcp
  host: 10.0.0.5
  port: 9000
  alarm_frame: extended
  stale_after_ms: 20000
rs485:
  - role: active
    device: /dev/ttyUSB0
    baud: 115200
    batteries: 3
    response_window_ms: 250
  - role: passive
    host: 10.0.0.6
    port: 8899
    address: 2
    manufacturer: ACME
modbus:
  enabled: true
  host: 10.0.0.7
  slave: 1
  retry_delay_ms: 50
  timeout_ms: 1500
  poll_interval_ms: 2000
  registers:
    - name: battery_voltage
      address: 13082
      function: input
      scale: 0.01
      min: 8
      max: 70
    - name: load_switch
      address: 2
      writable: true
publish:
  interval_ms: 500
  default:
    threshold: 0.05
  overrides:
    stack/soc:
      threshold: 1
      heartbeat_ms: 300000
mqtt:
  host: broker
  namespace: home/pylon
"#;

#[test]
fn minimal_config_gets_defaults() {
    common_setup();
    let config = Factory::config();

    let can = config.can();
    assert!(can.enabled());
    assert_eq!(can.source(), CanSource::Tcp);
    assert_eq!(can.host(), "127.0.0.1");
    assert_eq!(can.alarm_frame(), AlarmFrame::Legacy);
    assert_eq!(can.stale_after_ms(), 30_000);

    assert!(config.rs485().is_empty());
    assert!(!config.modbus().enabled());
    assert_eq!(config.modbus().client_settings().max_attempts, 3);
    assert_eq!(config.publish().interval(), Duration::from_millis(1000));
    assert_eq!(config.mqtt().port(), 1883);
    assert_eq!(config.mqtt().namespace(), "pylon");
    assert_eq!(config.loglevel(), "info");
}

#[test]
fn full_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(FULL.as_bytes()).unwrap();

    let config = ConfigWrapper::new(file.path().to_string_lossy().to_string()).unwrap();

    let can = config.can();
    assert_eq!(can.port(), 9000);
    assert_eq!(can.alarm_frame(), AlarmFrame::Extended);

    let rs485 = config.rs485();
    assert_eq!(rs485.len(), 2);
    assert_eq!(rs485[0].role, RoleName::Active);
    assert_eq!(
        rs485[0].link(),
        Some(Link::Serial {
            path: "/dev/ttyUSB0".to_string(),
            baud: 115200
        })
    );
    assert_eq!(
        rs485[1].link(),
        Some(Link::Tcp {
            host: "10.0.0.6".to_string(),
            port: 8899
        })
    );

    let active = rs485[0].engine_config(can.stale_after_ms()).unwrap();
    assert!(matches!(active.role, Role::Active(_)));
    assert_eq!(active.settings.batteries, 3);
    assert_eq!(active.settings.response_window_ms, 250);
    assert_eq!(active.settings.max_attempts, 2);
    assert_eq!(active.settings.stale_after_ms, 20_000);

    let passive = rs485[1].engine_config(can.stale_after_ms()).unwrap();
    assert!(matches!(passive.role, Role::Passive(_)));
    assert_eq!(passive.settings.response_budget_ms, 500);
    assert_eq!(passive.settings.identity.manufacturer, "ACME");
    assert_eq!(passive.settings.identity.firmware, "V1.0");

    let modbus = config.modbus();
    assert!(modbus.enabled());
    assert_eq!(modbus.port(), 9999);
    assert_eq!(modbus.poll_interval(), Duration::from_secs(2));
    let client = modbus.client_settings();
    assert_eq!(client.slave, 1);
    assert_eq!(client.retry_delay, Duration::from_millis(50));
    assert_eq!(client.timeout, Duration::from_millis(1500));

    let registers = modbus.registers();
    assert_eq!(registers[0].function, FunctionCode::ReadInput);
    assert_eq!(registers[0].address, 0x331A);
    assert_eq!(registers[0].max, Some(70.0));
    assert_eq!(registers[1].function, FunctionCode::ReadHolding);
    assert_eq!(registers[1].scale, 1.0);
    assert!(registers[1].writable);

    let publish = config.publish();
    assert_eq!(publish.interval(), Duration::from_millis(500));
    assert_eq!(publish.default.threshold, 0.05);
    assert_eq!(publish.default.heartbeat_ms, 60_000);
    assert_eq!(publish.overrides["stack/soc"].heartbeat_ms, 300_000);
    assert_eq!(publish.overrides["stack/soc"].min_interval_ms, 1000);

    assert_eq!(config.mqtt().namespace(), "home/pylon");
    assert_eq!(config.loglevel(), "debug");
}

#[test]
fn missing_file_is_an_error() {
    assert!(ConfigWrapper::new("/nonexistent/pylon-bridge.yaml".to_string()).is_err());
}

fn with(extra: &str) -> Result<Config> {
    Config::from_yaml(&format!("{}{}", Factory::config_yaml(), extra))
}

#[test]
fn rejects_response_window_outside_range() {
    let err = with(
        r#"
rs485:
  - role: active
    device: /dev/ttyUSB0
    response_window_ms: 301
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("response_window_ms"));
}

#[test]
fn rejects_two_active_channels() {
    let err = with(
        r#"
rs485:
  - role: active
    device: /dev/ttyUSB0
  - role: active
    device: /dev/ttyUSB1
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("at most one"));
}

#[test]
fn disabled_channels_are_not_validated() {
    let config = with(
        r#"
rs485:
  - role: active
    device: /dev/ttyUSB0
  - role: active
    enabled: false
"#,
    )
    .unwrap();
    assert_eq!(config.rs485.len(), 2);
    assert_eq!(ConfigWrapper::from_config(config).enabled_rs485().len(), 1);
}

#[test]
fn rejects_channel_without_link() {
    assert!(with(
        r#"
rs485:
  - role: passive
    host: 10.0.0.6
"#,
    )
    .is_err());
}

#[test]
fn rejects_bad_passive_budget_and_battery_count() {
    assert!(with(
        r#"
rs485:
  - role: passive
    device: /dev/ttyUSB0
    response_budget_ms: 100
"#,
    )
    .is_err());

    assert!(with(
        r#"
rs485:
  - role: active
    device: /dev/ttyUSB0
    batteries: 17
"#,
    )
    .is_err());
}

#[test]
fn rejects_more_than_one_retry() {
    let err = with(
        r#"
rs485:
  - role: active
    device: /dev/ttyUSB0
    max_attempts: 5
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("max_attempts"));

    assert!(with(
        r#"
rs485:
  - role: active
    device: /dev/ttyUSB0
    max_attempts: 1
"#,
    )
    .is_ok());
}

#[test]
fn rejects_zero_modbus_poll_interval() {
    let err = with(
        r#"
modbus:
  enabled: true
  poll_interval_ms: 0
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("poll_interval_ms"));
}

#[test]
fn rejects_bad_modbus_points() {
    assert!(with(
        r#"
modbus:
  enabled: true
  registers:
    - name: broken
      address: 1
      min: 10
      max: 5
"#,
    )
    .is_err());

    assert!(with(
        r#"
modbus:
  enabled: true
  registers:
    - name: zero
      address: 1
      scale: 0
"#,
    )
    .is_err());
}

#[test]
fn tcp_can_needs_host() {
    assert!(Config::from_yaml(
        r#"
mqtt:
  host: localhost
can:
  source: tcp
"#,
    )
    .is_err());

    let config = Config::from_yaml(
        r#"
mqtt:
  host: localhost
"#,
    )
    .unwrap();
    assert_eq!(config.can.source, CanSource::Socketcan);
    assert_eq!(config.can.interface(), "can0");
}
