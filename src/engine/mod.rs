pub mod machine;
pub mod responder;

pub use machine::{
    Context, DropReason, Effect, Event, Exchange, Failure, Identity, Machine, PollKind, Role,
    Settings, State,
};

use crate::prelude::*;
use crate::pylon::FrameCodec;
use crate::state::unit_channel;

use futures::StreamExt;
use net2::TcpStreamExt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::MissedTickBehavior;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::FramedRead;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const WRITE_TIMEOUT_SECS: u64 = 1;
const RECONNECT_DELAY_SECS: u64 = 5;
const TCP_KEEPALIVE_SECS: u64 = 60;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelData {
    Shutdown,
}

/// Any half-duplex byte stream the engine can own.
pub trait Channel: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Channel for T {}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Link {
    Serial { path: String, baud: u32 },
    Tcp { host: String, port: u16 },
}

impl std::fmt::Display for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial { path, .. } => write!(f, "{}", path),
            Self::Tcp { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub link: Link,
    pub role: Role,
    pub settings: Settings,
    pub tick_ms: u64,
}

enum Units {
    Owned(UnitWriter),
    Shared(UnitReader),
    Unavailable,
}

/// Drives one RS485 channel: owns the transport, feeds ticks and frames to
/// the `Machine`, and carries out the effects it returns.
pub struct Engine {
    config: EngineConfig,
    channels: Channels,
    stack: StackReader,
    units: Units,
    clock: Clock,
    stats: SharedStats,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        channels: Channels,
        stack: StackReader,
        clock: Clock,
        stats: SharedStats,
    ) -> Self {
        let units = match config.role {
            Role::Active(_) => Units::Owned(unit_channel(config.settings.batteries).0),
            Role::Passive(_) => Units::Unavailable,
        };

        Self {
            config,
            channels,
            stack,
            units,
            clock,
            stats,
        }
    }

    /// Lets a passive engine answer from units polled by an active one.
    pub fn with_units(mut self, reader: UnitReader) -> Self {
        if let Units::Unavailable = self.units {
            self.units = Units::Shared(reader);
        }
        self
    }

    pub fn units(&self) -> Option<UnitReader> {
        match &self.units {
            Units::Owned(writer) => Some(writer.reader()),
            Units::Shared(reader) => Some(reader.clone()),
            Units::Unavailable => None,
        }
    }

    pub fn name(&self) -> String {
        self.config.link.to_string()
    }

    pub async fn start(&self) -> Result<()> {
        let mut shutdown = self.channels.to_engine.subscribe();

        loop {
            let result = match self.open().await {
                Ok(channel) => self.run(channel, &mut shutdown).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => break,
                Err(e) => {
                    error!("rs485 {}: {}", self.name(), e);
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.rs485_disconnections += 1;
                    }
                    info!(
                        "rs485 {}: reconnecting in {}s",
                        self.name(),
                        RECONNECT_DELAY_SECS
                    );
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
                    }
                }
            }
        }

        info!("rs485 {}: engine exiting", self.name());
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_engine.send(ChannelData::Shutdown);
    }

    async fn open(&self) -> Result<Box<dyn Channel>> {
        match &self.config.link {
            Link::Serial { path, baud } => {
                info!("rs485 {}: opening at {} baud", path, baud);
                let port = tokio_serial::new(path, *baud)
                    .data_bits(tokio_serial::DataBits::Eight)
                    .parity(tokio_serial::Parity::None)
                    .stop_bits(tokio_serial::StopBits::One)
                    .flow_control(tokio_serial::FlowControl::None)
                    .open_native_async()
                    .map_err(|e| anyhow!("failed to open {}: {}", path, e))?;
                Ok(Box::new(port))
            }
            Link::Tcp { host, port } => {
                info!("rs485 {}:{}: connecting", host, port);
                let stream = match tokio::time::timeout(
                    Duration::from_secs(CONNECT_TIMEOUT_SECS),
                    tokio::net::TcpStream::connect((host.as_str(), *port)),
                )
                .await
                {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => bail!("failed to connect: {}", e),
                    Err(_) => bail!("connection timeout after {} seconds", CONNECT_TIMEOUT_SECS),
                };

                let std_stream = stream.into_std()?;
                if let Err(e) =
                    std_stream.set_keepalive(Some(Duration::new(TCP_KEEPALIVE_SECS, 0)))
                {
                    warn!("rs485 {}:{}: failed to set TCP keepalive: {}", host, port, e);
                }
                let stream = tokio::net::TcpStream::from_std(std_stream)?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Runs the engine over an already open channel until shutdown (`Ok`) or
    /// until the channel fails.
    pub async fn run<C: Channel>(
        &self,
        channel: C,
        shutdown: &mut broadcast::Receiver<ChannelData>,
    ) -> Result<()> {
        let (reader, mut writer) = tokio::io::split(channel);
        let mut frames = FramedRead::new(reader, FrameCodec::new());
        let mut machine = Machine::new(self.config.role, self.config.settings.clone());

        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.tick_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("rs485 {}: running as {:?}", self.name(), self.config.role);

        loop {
            let event = tokio::select! {
                _ = shutdown.recv() => {
                    info!("rs485 {}: received shutdown signal", self.name());
                    return Ok(());
                }
                _ = ticker.tick() => Event::Tick,
                frame = frames.next() => match frame {
                    Some(Ok(raw)) => Event::Frame { raw, received_at: self.clock.now_ms() },
                    Some(Err(e)) => bail!("read error: {}", e),
                    None => bail!("channel closed"),
                },
            };

            let effects = self.step(&mut machine, event);
            self.apply(effects, &mut writer).await?;
        }
    }

    fn step(&self, machine: &mut Machine, event: Event) -> Vec<Effect> {
        let stack = self.stack.snapshot();
        let unit0 = match &self.units {
            Units::Shared(reader) => reader.unit(0),
            _ => None,
        };
        let ctx = Context {
            now: self.clock.now_ms(),
            stack: &stack,
            unit0: unit0.as_ref(),
        };

        machine.step(event, &ctx)
    }

    async fn apply<W: AsyncWrite + Unpin>(&self, effects: Vec<Effect>, writer: &mut W) -> Result<()> {
        let name = self.name();
        let now = self.clock.now_ms();

        for effect in effects {
            match effect {
                Effect::Transmit(bytes) => {
                    debug!("rs485 {}: TX {}", name, String::from_utf8_lossy(&bytes).trim_end());
                    match tokio::time::timeout(Duration::from_secs(WRITE_TIMEOUT_SECS), async {
                        writer.write_all(&bytes).await?;
                        writer.flush().await
                    })
                    .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => bail!("write failed: {}", e),
                        Err(_) => bail!("write timeout after {} seconds", WRITE_TIMEOUT_SECS),
                    }
                    if let Role::Active(_) = self.config.role {
                        self.count(|s| s.requests_sent += 1);
                    }
                }
                Effect::Analog { target, data } => {
                    debug!("rs485 {}: battery {} analog ok", name, target);
                    self.count(|s| s.responses_ok += 1);
                    self.update_unit(target, |u| u.apply_analog(&data, now));
                }
                Effect::Alarm { target, data } => {
                    debug!("rs485 {}: battery {} alarm ok", name, target);
                    self.count(|s| s.responses_ok += 1);
                    self.update_unit(target, |u| u.apply_alarm(&data, now));
                }
                Effect::MarkStale(target) => self.update_unit(target, |u| u.mark_stale()),
                Effect::Retry {
                    target,
                    kind,
                    reason,
                } => {
                    warn!(
                        "rs485 {}: battery {} {:?}: {}, retrying",
                        name, target, kind, reason
                    );
                    self.count_failure(&reason);
                    self.count(|s| s.response_retries += 1);
                }
                Effect::Failed {
                    target,
                    kind,
                    reason,
                } => {
                    warn!("rs485 {}: battery {} {:?}: {}, giving up", name, target, kind, reason);
                    self.count_failure(&reason);
                }
                Effect::CycleComplete => {
                    if let Units::Owned(writer) = &self.units {
                        writer.summarise();
                    }
                    self.count(|s| s.cycles_completed += 1);
                    debug!("rs485 {}: poll cycle complete", name);
                }
                Effect::Replied(command) => {
                    debug!("rs485 {}: replied to {:?}", name, command);
                    self.count(|s| s.replies_sent += 1);
                }
                Effect::Dropped(reason) => {
                    match reason {
                        DropReason::Unsolicited | DropReason::ForeignAddress(_) => {
                            debug!("rs485 {}: dropped {}", name, reason)
                        }
                        _ => warn!("rs485 {}: dropped {}", name, reason),
                    }
                    self.count(|s| s.requests_dropped += 1);
                }
            }
        }

        Ok(())
    }

    fn update_unit<F: FnOnce(&mut UnitState)>(&self, target: u8, f: F) {
        if let Units::Owned(writer) = &self.units {
            writer.update_unit(target, f);
        }
    }

    fn count_failure(&self, reason: &Failure) {
        match reason {
            Failure::Timeout => self.count(|s| s.response_timeouts += 1),
            r if r.is_checksum() => self.count(|s| {
                s.response_corrupt += 1;
                s.checksum_failures += 1;
            }),
            _ => self.count(|s| s.response_corrupt += 1),
        }
    }

    fn count<F: FnOnce(&mut Stats)>(&self, f: F) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}
