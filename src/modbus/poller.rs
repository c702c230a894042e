use crate::error::RegisterError;
use crate::modbus::client::{RegisterClient, RegisterTransaction, Transport};
use crate::modbus::frame::{FunctionCode, Register};
use crate::modbus::transport::TcpTransport;
use crate::modbus::ChannelData;
use crate::prelude::*;

use serde::Deserialize;
use tokio::time::MissedTickBehavior;

/// A named register with its scaling and plausibility bounds.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Point {
    pub name: String,
    pub address: u16,
    #[serde(default = "Point::default_function")]
    pub function: FunctionCode,
    #[serde(default = "Point::default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub signed: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    #[serde(default)]
    pub writable: bool,
}

impl Point {
    fn default_function() -> FunctionCode {
        FunctionCode::ReadHolding
    }

    fn default_scale() -> f64 {
        1.0
    }

    pub fn register(&self) -> Register {
        Register {
            function: self.function,
            address: self.address,
        }
    }

    pub fn value(&self, raw: u16) -> f64 {
        let v = if self.signed {
            raw as i16 as f64
        } else {
            raw as f64
        };
        Utils::round(v * self.scale, 4)
    }

    pub fn check(&self, raw: u16) -> Result<f64, RegisterError> {
        let value = self.value(raw);
        let low = self.min.map_or(true, |min| value >= min);
        let high = self.max.map_or(true, |max| value <= max);
        if low && high {
            Ok(value)
        } else {
            Err(RegisterError::Implausible {
                register: self.address,
                value,
            })
        }
    }

    /// Engineering value back to the raw register word.
    pub fn raw(&self, value: f64) -> Option<u16> {
        if !value.is_finite() || self.scale == 0.0 {
            return None;
        }
        let scaled = (value / self.scale).round();
        if self.signed {
            if scaled < i16::MIN as f64 || scaled > i16::MAX as f64 {
                return None;
            }
            Some(scaled as i16 as u16)
        } else {
            if scaled < 0.0 || scaled > u16::MAX as f64 {
                return None;
            }
            Some(scaled as u16)
        }
    }
}

impl<T: Transport> RegisterClient<T> {
    pub async fn read_point(&mut self, point: &Point) -> RegisterTransaction {
        let check = |values: &[u16]| -> Result<(), RegisterError> {
            match values.first() {
                Some(raw) => point.check(*raw).map(|_| ()),
                None => Err(RegisterError::ShortResponse { len: 0, min: 1 }),
            }
        };
        self.read_checked(point.function, point.address, 1, check)
            .await
    }
}

/// Periodically reads the configured points and feeds validated values to the
/// register cache. Also carries out writes requested over the channel.
pub struct Poller {
    config: ConfigWrapper,
    channels: Channels,
    clock: Clock,
    stats: SharedStats,
}

impl Poller {
    pub fn new(config: ConfigWrapper, channels: Channels, clock: Clock, stats: SharedStats) -> Self {
        Self {
            config,
            channels,
            clock,
            stats,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let modbus = self.config.modbus();
        if !modbus.enabled() {
            info!("modbus disabled, skipping");
            return Ok(());
        }

        let transport = TcpTransport::new(modbus.host().to_string(), modbus.port());
        let client = RegisterClient::new(transport, modbus.client_settings(), self.clock);
        self.run(client, modbus.registers(), modbus.poll_interval()).await
    }

    pub fn stop(&self) {
        let _ = self.channels.to_modbus.send(ChannelData::Shutdown);
    }

    /// Runs against any transport until shutdown.
    pub async fn run<T: Transport>(
        &self,
        mut client: RegisterClient<T>,
        points: Vec<Point>,
        interval: std::time::Duration,
    ) -> Result<()> {
        let mut receiver = self.channels.to_modbus.subscribe();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "modbus: polling {} register(s) from slave {}",
            points.len(),
            client.settings().slave
        );

        loop {
            tokio::select! {
                message = receiver.recv() => match message {
                    Ok(ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                    Ok(ChannelData::Write { name, value }) => {
                        self.write(&mut client, &points, &name, value).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("modbus: lagged {} messages", n);
                    }
                },
                _ = ticker.tick() => self.poll(&mut client, &points).await,
            }
        }

        info!("modbus: poller exiting");
        Ok(())
    }

    async fn poll<T: Transport>(&self, client: &mut RegisterClient<T>, points: &[Point]) {
        for point in points {
            let tx = client.read_point(point).await;
            self.record(&tx, false);

            match tx.outcome {
                Ok(values) => {
                    if let Some(raw) = values.first() {
                        trace!("modbus: {} = {}", point.name, point.value(*raw));
                    }
                    let _ = self
                        .channels
                        .to_register_cache
                        .send(register_cache::ChannelData::RegisterData(
                            point.register(),
                            values,
                        ));
                }
                Err(e) => warn!("modbus: read {} failed: {}", point.name, e),
            }
        }

        let recent = client.recent_corruptions() as u64;
        if let Ok(mut stats) = self.stats.lock() {
            stats.register_corruptions_recent = recent;
        }
    }

    async fn write<T: Transport>(
        &self,
        client: &mut RegisterClient<T>,
        points: &[Point],
        name: &str,
        value: f64,
    ) {
        let point = match points.iter().find(|p| p.name == name) {
            Some(p) if p.writable => p,
            Some(_) => {
                warn!("modbus: {} is not writable", name);
                return;
            }
            None => {
                warn!("modbus: unknown register {}", name);
                return;
            }
        };
        let raw = match point.raw(value).filter(|raw| point.check(*raw).is_ok()) {
            Some(raw) => raw,
            None => {
                warn!("modbus: {} out of range for {}", value, name);
                return;
            }
        };

        let tx = client.write(point.address, vec![raw]).await;
        self.record(&tx, true);

        match tx.outcome {
            Ok(values) => {
                info!("modbus: wrote {} = {}", name, value);
                let _ = self
                    .channels
                    .to_register_cache
                    .send(register_cache::ChannelData::RegisterData(
                        point.register(),
                        values,
                    ));
            }
            Err(e) => warn!("modbus: write {} failed: {}", name, e),
        }
    }

    fn record(&self, tx: &RegisterTransaction, write: bool) {
        if let Ok(mut stats) = self.stats.lock() {
            if write {
                stats.register_writes += 1;
            } else {
                stats.register_reads += 1;
            }
            stats.register_attempts += tx.attempts as u64;
            match &tx.outcome {
                Ok(_) => {}
                Err(RegisterError::Corrupted { .. }) => {
                    stats.register_corruptions += 1;
                    stats.register_failures += 1;
                }
                Err(_) => stats.register_failures += 1,
            }
        }
    }
}
