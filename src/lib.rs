pub mod can;
pub mod channels;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod modbus;
pub mod mqtt;
pub mod options;
pub mod prelude;
pub mod publish_gate;
pub mod publisher;
pub mod pylon;
pub mod register_cache;
pub mod state;
pub mod stats;
pub mod utils;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::can::CanReader;
use crate::config::RoleName;
use crate::engine::Engine;
use crate::modbus::Poller;
use crate::mqtt::Mqtt;
use crate::prelude::*;
use crate::publisher::Publisher;
use crate::state::stack_channel;

use std::io::Write;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub fn init_logging(default_level: &str) {
    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();

    if let Err(e) = result {
        eprintln!("logging already initialised: {}", e);
    }
}

/// Every long-running part of the bridge, wired to one set of channels.
#[derive(Clone)]
pub struct Components {
    pub can: Arc<CanReader>,
    pub engines: Vec<Arc<Engine>>,
    pub poller: Arc<Poller>,
    pub register_cache: Arc<RegisterCache>,
    pub publisher: Arc<Publisher>,
    pub mqtt: Arc<Mqtt>,
    pub channels: Channels,
    pub stats: SharedStats,
}

impl Components {
    pub fn new(config: ConfigWrapper, channels: Channels) -> Result<Self> {
        let clock = Clock::new();
        let stats = Stats::shared();

        let (stack_writer, _) = stack_channel();
        let can = CanReader::new(
            config.clone(),
            channels.clone(),
            stack_writer,
            clock,
            stats.clone(),
        );
        let stack = can.reader();
        let stale_after_ms = config.can().stale_after_ms();

        // active channel first so passive ones can answer from its units
        let mut rs485 = config.enabled_rs485();
        rs485.sort_by_key(|r| r.role != RoleName::Active);

        let mut units = None;
        let mut engines = Vec::new();
        for channel in rs485 {
            let mut engine = Engine::new(
                channel.engine_config(stale_after_ms)?,
                channels.clone(),
                stack.clone(),
                clock,
                stats.clone(),
            );
            match &units {
                None => units = engine.units(),
                Some(reader) => engine = engine.with_units(reader.clone()),
            }
            engines.push(Arc::new(engine));
        }

        let poller = Poller::new(config.clone(), channels.clone(), clock, stats.clone());
        let register_cache = RegisterCache::new(channels.clone());
        let publisher = Publisher::new(
            config.clone(),
            channels.clone(),
            stack,
            units,
            clock,
            stats.clone(),
        );
        let mqtt = Mqtt::new(config, channels.clone(), stats.clone());

        Ok(Self {
            can: Arc::new(can),
            engines,
            poller: Arc::new(poller),
            register_cache: Arc::new(register_cache),
            publisher: Arc::new(publisher),
            mqtt: Arc::new(mqtt),
            channels,
            stats,
        })
    }

    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let register_cache = self.register_cache.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = register_cache.start().await {
                error!("RegisterCache task failed: {}", e);
            }
        }));

        let mqtt = self.mqtt.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = mqtt.start().await {
                error!("MQTT task failed: {}", e);
            }
        }));

        let can = self.can.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = can.start().await {
                error!("CAN task failed: {}", e);
            }
        }));

        for engine in &self.engines {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = engine.start().await {
                    error!("RS485 {} task failed: {}", engine.name(), e);
                }
            }));
        }

        let poller = self.poller.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = poller.start().await {
                error!("Modbus task failed: {}", e);
            }
        }));

        let publisher = self.publisher.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = publisher.start().await {
                error!("Publisher task failed: {}", e);
            }
        }));

        handles
    }

    /// Producers first so the sinks can drain what is already queued.
    pub fn stop(&self) {
        info!("Stopping all components...");

        self.can.stop();
        if let Some(engine) = self.engines.first() {
            // engines share one shutdown channel
            engine.stop();
        }
        self.poller.stop();
        self.publisher.stop();
        self.mqtt.stop();
        self.register_cache.stop();
    }
}

/// Runs until `shutdown_rx` fires, then stops everything and prints the
/// counters.
pub async fn app(
    mut shutdown_rx: broadcast::Receiver<()>,
    config: ConfigWrapper,
) -> Result<()> {
    info!("pylon-bridge {} starting", CARGO_PKG_VERSION);
    config.log_summary();

    let channels = Channels::new();
    let components = Components::new(config, channels)?;
    let handles = components.spawn();

    info!("Waiting for shutdown signal...");
    let _ = shutdown_rx.recv().await;

    info!("Shutdown signal received, stopping components...");
    components.stop();

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Error waiting for task: {}", e);
        }
    }

    if let Ok(stats) = components.stats.lock() {
        stats.print_summary();
    }

    info!("Application shutdown complete");
    Ok(())
}

/// Wires ctrl-c and the optional runtime limit to the shutdown signal.
pub async fn run(config: ConfigWrapper, runtime: Option<u64>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl+c: {}", e);
        }
        let _ = tx.send(());
    });

    if let Some(secs) = runtime {
        info!("Runtime limited to {}s", secs);
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
            let _ = tx.send(());
        });
    }

    app(shutdown_rx, config).await
}
