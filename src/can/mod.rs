pub mod decoder;
pub mod frames;
pub mod gateway;

pub use decoder::{AlarmFrame, Outcome, TelemetryDecoder};
pub use gateway::{GatewayCodec, RawFrame};

use crate::config::CanSource;
use crate::prelude::*;

use futures::StreamExt;
use net2::TcpStreamExt;
use std::time::Duration;
use tokio_util::codec::FramedRead;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const RECONNECT_DELAY_SECS: u64 = 5;
const TCP_KEEPALIVE_SECS: u64 = 60;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelData {
    Shutdown,
}

/// Owns the broadcast bus and feeds every frame through the telemetry decoder.
pub struct CanReader {
    config: ConfigWrapper,
    channels: Channels,
    decoder: TelemetryDecoder,
    clock: Clock,
    stats: SharedStats,
}

impl CanReader {
    pub fn new(
        config: ConfigWrapper,
        channels: Channels,
        writer: StackWriter,
        clock: Clock,
        stats: SharedStats,
    ) -> Self {
        let decoder = TelemetryDecoder::new(writer, config.can().alarm_frame(), stats.clone());
        Self {
            config,
            channels,
            decoder,
            clock,
            stats,
        }
    }

    pub fn reader(&self) -> StackReader {
        self.decoder.reader()
    }

    pub async fn start(&self) -> Result<()> {
        let can = self.config.can();
        if !can.enabled() {
            info!("can disabled, skipping");
            return Ok(());
        }

        let mut shutdown = self.channels.to_can.subscribe();

        loop {
            match self.run(&can, &mut shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    error!("can: {}", e);
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.can_disconnections += 1;
                    }
                    info!("can: reconnecting in {}s", RECONNECT_DELAY_SECS);
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
                    }
                }
            }
        }

        info!("can: reader exiting");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_can.send(ChannelData::Shutdown);
    }

    // returns Ok only on shutdown
    async fn run(
        &self,
        can: &config::Can,
        shutdown: &mut broadcast::Receiver<ChannelData>,
    ) -> Result<()> {
        match can.source() {
            CanSource::Tcp => self.run_gateway(can, shutdown).await,
            CanSource::Socketcan => self.run_socketcan(can, shutdown).await,
        }
    }

    async fn run_gateway(
        &self,
        can: &config::Can,
        shutdown: &mut broadcast::Receiver<ChannelData>,
    ) -> Result<()> {
        let hp = (can.host().to_owned(), can.port());
        info!("can: connecting to gateway {}:{}", hp.0, hp.1);

        let stream = match tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            tokio::net::TcpStream::connect(hp),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => bail!("failed to connect to gateway: {}", e),
            Err(_) => bail!("connection timeout after {} seconds", CONNECT_TIMEOUT_SECS),
        };

        let std_stream = stream.into_std()?;
        if let Err(e) = std_stream.set_keepalive(Some(Duration::new(TCP_KEEPALIVE_SECS, 0))) {
            warn!("can: failed to set TCP keepalive: {}", e);
        }
        let stream = tokio::net::TcpStream::from_std(std_stream)?;
        info!("can: gateway connected");

        let mut frames = FramedRead::new(stream, GatewayCodec);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("can: received shutdown signal");
                    return Ok(());
                }
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => self.handle(frame),
                    Some(Err(e)) => bail!("read error: {}", e),
                    None => bail!("connection closed by gateway"),
                }
            }
        }
    }

    #[cfg(feature = "socketcan")]
    async fn run_socketcan(
        &self,
        can: &config::Can,
        shutdown: &mut broadcast::Receiver<ChannelData>,
    ) -> Result<()> {
        use socketcan::{EmbeddedFrame, Id};

        let socket = socketcan::tokio::CanSocket::open(can.interface())
            .map_err(|e| anyhow!("failed to open {}: {}", can.interface(), e))?;
        info!("can: listening on {}", can.interface());

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("can: received shutdown signal");
                    return Ok(());
                }
                frame = socket.read_frame() => {
                    let frame = frame?;
                    let id = match frame.id() {
                        Id::Standard(id) => id.as_raw() as u32,
                        Id::Extended(id) => id.as_raw(),
                    };
                    self.handle(RawFrame { id, data: frame.data().to_vec() });
                }
            }
        }
    }

    #[cfg(not(feature = "socketcan"))]
    async fn run_socketcan(
        &self,
        can: &config::Can,
        shutdown: &mut broadcast::Receiver<ChannelData>,
    ) -> Result<()> {
        warn!(
            "can: {} requested but built without the socketcan feature",
            can.interface()
        );
        let _ = shutdown.recv().await;
        Ok(())
    }

    fn handle(&self, frame: RawFrame) {
        let outcome = self
            .decoder
            .ingest(frame.id, &frame.data, self.clock.now_ms());
        if let Outcome::Applied(id) = outcome {
            trace!("can: applied {:?}", id);
        }
    }
}
