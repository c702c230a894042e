use crate::engine::{self, EngineConfig, Identity, Link, Role};
use crate::modbus::{ClientSettings, Point};
use crate::prelude::*;
use crate::publish_gate::Policy;

use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub use crate::can::AlarmFrame;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_can")]
    pub can: Can,

    #[serde(default = "Vec::new")]
    pub rs485: Vec<Rs485>,

    #[serde(default = "Config::default_modbus")]
    pub modbus: Modbus,

    #[serde(default)]
    pub publish: Publish,

    pub mqtt: Mqtt,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Can {{{
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CanSource {
    /// frames relayed by a CAN-to-TCP gateway
    Tcp,
    /// local SocketCAN interface
    Socketcan,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Can {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    #[serde(default = "Config::default_can_source")]
    pub source: CanSource,
    #[serde(default = "Config::default_can_interface")]
    pub interface: String,
    pub host: Option<String>,
    pub port: Option<u16>,

    #[serde(default)]
    pub alarm_frame: AlarmFrame,
    #[serde(default = "Config::default_stale_after_ms")]
    pub stale_after_ms: u32,
}

impl Can {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn source(&self) -> CanSource {
        self.source
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8881)
    }

    pub fn alarm_frame(&self) -> AlarmFrame {
        self.alarm_frame
    }

    pub fn stale_after_ms(&self) -> u32 {
        self.stale_after_ms
    }
} // }}}

// Rs485 {{{
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RoleName {
    Active,
    Passive,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Rs485 {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub role: RoleName,

    /// serial device path; takes precedence over host/port
    pub device: Option<String>,
    #[serde(default = "Config::default_baud")]
    pub baud: u32,
    pub host: Option<String>,
    pub port: Option<u16>,

    #[serde(default = "Config::default_address")]
    pub address: u8,
    #[serde(default = "Config::default_batteries")]
    pub batteries: u8,
    #[serde(default = "Config::default_response_window_ms")]
    pub response_window_ms: u32,
    #[serde(default = "Config::default_response_budget_ms")]
    pub response_budget_ms: u32,
    #[serde(default = "Config::default_poll_interval_ms")]
    pub poll_interval_ms: u32,
    #[serde(default = "Config::default_rs485_attempts")]
    pub max_attempts: u8,
    #[serde(default = "Config::default_tick_ms")]
    pub tick_ms: u64,

    pub manufacturer: Option<String>,
    pub firmware: Option<String>,
    pub serial_number: Option<String>,

    #[serde(default = "Config::default_capacity_ah")]
    pub capacity_ah: f64,
}

impl Rs485 {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn link(&self) -> Option<Link> {
        match (&self.device, &self.host, self.port) {
            (Some(path), _, _) => Some(Link::Serial {
                path: path.clone(),
                baud: self.baud,
            }),
            (None, Some(host), Some(port)) => Some(Link::Tcp {
                host: host.clone(),
                port,
            }),
            _ => None,
        }
    }

    pub fn role(&self) -> Role {
        match self.role {
            RoleName::Active => Role::Active(engine::machine::Active),
            RoleName::Passive => Role::Passive(engine::machine::Passive),
        }
    }

    pub fn identity(&self) -> Identity {
        let default = Identity::default();
        Identity {
            manufacturer: self.manufacturer.clone().unwrap_or(default.manufacturer),
            firmware: self.firmware.clone().unwrap_or(default.firmware),
            serial_number: self.serial_number.clone().unwrap_or(default.serial_number),
        }
    }

    /// Freshness follows the broadcast bus setting so both roles agree on
    /// what counts as stale.
    pub fn engine_config(&self, stale_after_ms: u32) -> Result<EngineConfig> {
        let link = self
            .link()
            .ok_or_else(|| anyhow!("rs485 channel needs either device or host and port"))?;

        Ok(EngineConfig {
            link,
            role: self.role(),
            settings: engine::Settings {
                address: self.address,
                batteries: self.batteries,
                response_window_ms: self.response_window_ms,
                response_budget_ms: self.response_budget_ms,
                poll_interval_ms: self.poll_interval_ms,
                max_attempts: self.max_attempts,
                stale_after_ms,
                capacity_ah: self.capacity_ah,
                identity: self.identity(),
            },
            tick_ms: self.tick_ms,
        })
    }
} // }}}

// Modbus {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Modbus {
    #[serde(default = "Config::default_disabled")]
    pub enabled: bool,

    #[serde(default = "Config::default_modbus_host")]
    pub host: String,
    #[serde(default = "Config::default_modbus_port")]
    pub port: u16,
    #[serde(default = "Config::default_modbus_slave")]
    pub slave: u8,
    #[serde(default = "Config::default_modbus_attempts")]
    pub max_attempts: u8,

    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(default, rename = "retry_delay_ms")]
    pub retry_delay: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(default, rename = "timeout_ms")]
    pub timeout: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(default, rename = "poll_interval_ms")]
    pub poll_interval: Option<Duration>,

    #[serde(default = "Vec::new")]
    pub registers: Vec<Point>,
}

impl Modbus {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn registers(&self) -> Vec<Point> {
        self.registers.clone()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval.unwrap_or(Duration::from_secs(10))
    }

    pub fn client_settings(&self) -> ClientSettings {
        let default = ClientSettings::default();
        ClientSettings {
            slave: self.slave,
            max_attempts: self.max_attempts,
            retry_delay: self.retry_delay.unwrap_or(default.retry_delay),
            timeout: self.timeout.unwrap_or(default.timeout),
        }
    }
} // }}}

// Publish {{{
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Publish {
    #[serde(default)]
    pub default: Policy,
    #[serde(default)]
    pub overrides: HashMap<String, Policy>,
    pub interval_ms: Option<u64>,
}

impl Publish {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.unwrap_or(1000).max(1))
    }
} // }}}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_namespace")]
    pub namespace: String,
}

impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> Option<&String> {
        self.username.as_ref()
    }

    pub fn password(&self) -> Option<&String> {
        self.password.as_ref()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
} // }}}

pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl Clone for ConfigWrapper {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        Ok(Self::from_config(Config::new(file)?))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    // nothing holds the lock across a panic point, so a poisoned value is
    // still the last complete config
    fn lock(&self) -> MutexGuard<'_, Config> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn can(&self) -> Can {
        self.lock().can.clone()
    }

    pub fn rs485(&self) -> Vec<Rs485> {
        self.lock().rs485.clone()
    }

    pub fn enabled_rs485(&self) -> Vec<Rs485> {
        self.rs485().into_iter().filter(|r| r.enabled()).collect()
    }

    pub fn modbus(&self) -> Modbus {
        self.lock().modbus.clone()
    }

    pub fn publish(&self) -> Publish {
        self.lock().publish.clone()
    }

    pub fn mqtt(&self) -> Mqtt {
        self.lock().mqtt.clone()
    }

    pub fn loglevel(&self) -> String {
        self.lock().loglevel.clone()
    }

    pub fn log_summary(&self) {
        self.lock().log_summary();
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("error reading {}: {}", file, err))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn log_summary(&self) {
        info!("Configuration loaded successfully:");
        info!("  CAN: {}", if self.can.enabled { "enabled" } else { "disabled" });
        if self.can.enabled {
            match self.can.source {
                CanSource::Tcp => info!("    Gateway: {}:{}", self.can.host(), self.can.port()),
                CanSource::Socketcan => info!("    Interface: {}", self.can.interface),
            }
            info!("    Alarm frame: {:?}", self.can.alarm_frame);
            info!("    Stale after: {}ms", self.can.stale_after_ms);
        }

        info!(
            "  RS485: {} configured, {} enabled",
            self.rs485.len(),
            self.rs485.iter().filter(|r| r.enabled).count()
        );
        for (i, r) in self.rs485.iter().enumerate() {
            info!("    Channel[{}]:", i);
            info!("      Enabled: {}", r.enabled);
            info!("      Role: {:?}", r.role);
            if let Some(link) = r.link() {
                info!("      Link: {}", link);
            }
            info!("      Address: {}", r.address);
            match r.role {
                RoleName::Active => {
                    info!("      Batteries: {}", r.batteries);
                    info!("      Response window: {}ms", r.response_window_ms);
                    info!("      Poll interval: {}ms", r.poll_interval_ms);
                }
                RoleName::Passive => {
                    info!("      Response budget: {}ms", r.response_budget_ms);
                }
            }
        }

        info!("  Modbus: {}", if self.modbus.enabled { "enabled" } else { "disabled" });
        if self.modbus.enabled {
            info!("    Bridge: {}:{}", self.modbus.host, self.modbus.port);
            info!("    Slave: {}", self.modbus.slave);
            info!("    Registers: {}", self.modbus.registers.len());
        }

        info!("  MQTT: {}", if self.mqtt.enabled { "enabled" } else { "disabled" });
        if self.mqtt.enabled {
            info!("    Host: {}", self.mqtt.host);
            info!("    Port: {}", self.mqtt.port);
            info!("    Namespace: {}", self.mqtt.namespace);
        }

        info!("  Log Level: {}", self.loglevel);
    }

    pub fn validate(&self) -> Result<()> {
        if self.mqtt.enabled {
            if self.mqtt.port == 0 {
                bail!("mqtt.port must be between 1 and 65535");
            }
            if self.mqtt.host.is_empty() {
                bail!("mqtt.host cannot be empty");
            }
        }

        if self.can.enabled && self.can.source == CanSource::Tcp && self.can.host.is_none() {
            bail!("can.host is required when can.source is tcp");
        }
        if self.can.stale_after_ms == 0 {
            bail!("can.stale_after_ms must be positive");
        }

        let mut active = 0;
        for (i, r) in self.rs485.iter().enumerate().filter(|(_, r)| r.enabled) {
            if r.link().is_none() {
                bail!("rs485[{}] needs either device or host and port", i);
            }
            match r.role {
                RoleName::Active => {
                    active += 1;
                    if !(250..=300).contains(&r.response_window_ms) {
                        bail!("rs485[{}].response_window_ms must be within 250..=300", i);
                    }
                    if r.batteries == 0 || r.batteries > 16 {
                        bail!("rs485[{}].batteries must be within 1..=16", i);
                    }
                    if !(1..=2).contains(&r.max_attempts) {
                        bail!("rs485[{}].max_attempts must be within 1..=2", i);
                    }
                }
                RoleName::Passive => {
                    if !(200..=500).contains(&r.response_budget_ms) {
                        bail!("rs485[{}].response_budget_ms must be within 200..=500", i);
                    }
                }
            }
        }
        if active > 1 {
            bail!("at most one rs485 channel may be active, found {}", active);
        }

        if self.modbus.enabled {
            if self.modbus.max_attempts == 0 {
                bail!("modbus.max_attempts must be at least 1");
            }
            if self.modbus.poll_interval() == Duration::ZERO {
                bail!("modbus.poll_interval_ms must be positive");
            }
            for p in &self.modbus.registers {
                if p.scale == 0.0 {
                    bail!("modbus register {} has a zero scale", p.name);
                }
                if let (Some(min), Some(max)) = (p.min, p.max) {
                    if min > max {
                        bail!("modbus register {} has min above max", p.name);
                    }
                }
            }
        }

        Ok(())
    }

    fn default_can() -> Can {
        Can {
            enabled: Self::default_enabled(),
            source: Self::default_can_source(),
            interface: Self::default_can_interface(),
            host: None,
            port: None,
            alarm_frame: AlarmFrame::default(),
            stale_after_ms: Self::default_stale_after_ms(),
        }
    }

    fn default_modbus() -> Modbus {
        Modbus {
            enabled: Self::default_disabled(),
            host: Self::default_modbus_host(),
            port: Self::default_modbus_port(),
            slave: Self::default_modbus_slave(),
            max_attempts: Self::default_modbus_attempts(),
            retry_delay: None,
            timeout: None,
            poll_interval: None,
            registers: Vec::new(),
        }
    }

    fn default_can_source() -> CanSource {
        CanSource::Socketcan
    }
    fn default_can_interface() -> String {
        "can0".to_string()
    }
    fn default_stale_after_ms() -> u32 {
        30_000
    }

    fn default_baud() -> u32 {
        9600
    }
    fn default_address() -> u8 {
        2
    }
    fn default_batteries() -> u8 {
        1
    }
    fn default_response_window_ms() -> u32 {
        300
    }
    fn default_response_budget_ms() -> u32 {
        500
    }
    fn default_poll_interval_ms() -> u32 {
        5000
    }
    fn default_rs485_attempts() -> u8 {
        2
    }
    fn default_tick_ms() -> u64 {
        10
    }
    fn default_capacity_ah() -> f64 {
        100.0
    }

    fn default_modbus_host() -> String {
        "10.10.0.117".to_string()
    }
    fn default_modbus_port() -> u16 {
        9999
    }
    fn default_modbus_slave() -> u8 {
        10
    }
    fn default_modbus_attempts() -> u8 {
        3
    }

    fn default_mqtt_port() -> u16 {
        1883
    }
    fn default_mqtt_namespace() -> String {
        "pylon".to_string()
    }

    fn default_enabled() -> bool {
        true
    }
    fn default_disabled() -> bool {
        false
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}
