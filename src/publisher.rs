use crate::metrics;
use crate::prelude::*;
use crate::publish_gate::{Policy, PublishGate, Sample};

use tokio::time::MissedTickBehavior;

const AVAILABILITY: &str = "availability";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelData {
    Shutdown,
}

/// Samples the shared state on a fixed tick, runs every value through the
/// publication gate and hands the survivors to mqtt.
pub struct Publisher {
    config: ConfigWrapper,
    channels: Channels,
    stack: StackReader,
    units: Option<UnitReader>,
    clock: Clock,
    stats: SharedStats,
}

impl Publisher {
    pub fn new(
        config: ConfigWrapper,
        channels: Channels,
        stack: StackReader,
        units: Option<UnitReader>,
        clock: Clock,
        stats: SharedStats,
    ) -> Self {
        Self {
            config,
            channels,
            stack,
            units,
            clock,
            stats,
        }
    }

    pub fn gate(&self) -> PublishGate {
        let publish = self.config.publish();
        let mut gate = PublishGate::new(publish.default, publish.overrides.clone());
        // availability transitions go out immediately
        if !publish.overrides.contains_key(AVAILABILITY) {
            gate.set_policy(
                AVAILABILITY,
                Policy {
                    min_interval_ms: 0,
                    ..publish.default
                },
            );
        }
        gate
    }

    pub async fn start(&self) -> Result<()> {
        let mut shutdown = self.channels.to_publisher.subscribe();
        let mut gate = self.gate();

        let mut ticker = tokio::time::interval(self.config.publish().interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("publisher starting");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("publisher received shutdown signal");
                    break;
                }
                _ = ticker.tick() => self.cycle(&mut gate).await,
            }
        }

        info!("publisher exiting");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_publisher.send(ChannelData::Shutdown);
    }

    pub async fn cycle(&self, gate: &mut PublishGate) {
        let now = self.clock.now_ms();
        let stale_after_ms = self.config.can().stale_after_ms();

        let stack = self.stack.snapshot();
        let stack_online = !stack.is_stale(now, stale_after_ms);

        let units = self.units.as_ref().map(|u| u.snapshot());
        let units_online = units
            .as_ref()
            .map_or(false, |s| s.units.iter().any(|u| !u.stale));

        let online = stack_online || units_online;
        if gate.text(AVAILABILITY, if online { "online" } else { "offline" }, now) {
            info!("publisher: {}", if online { "online" } else { "offline" });
            self.send(mqtt::Message::availability(online));
        }

        let mut samples: Vec<Sample> = Vec::new();
        if stack_online {
            samples.extend(metrics::stack_samples(&stack, now));
        }
        if let Some(units) = &units {
            samples.extend(metrics::unit_samples(units, now));
        }

        let modbus = self.config.modbus();
        if modbus.enabled() {
            let registers = RegisterCache::get_all(&self.channels).await;
            let corruptions = self
                .stats
                .lock()
                .map(|s| s.register_corruptions_recent)
                .unwrap_or(0);
            samples.extend(metrics::register_samples(
                &modbus.registers,
                &registers,
                corruptions,
                now,
            ));
        }

        for sample in &samples {
            if gate.offer(sample) {
                self.send(mqtt::Message::for_sample(sample));
            }
        }

        if let Ok(mut stats) = self.stats.lock() {
            stats.published = gate.published();
            stats.suppressed = gate.suppressed();
        }
    }

    fn send(&self, message: mqtt::Message) {
        if self
            .channels
            .to_mqtt
            .send(mqtt::ChannelData::Message(message))
            .is_err()
        {
            trace!("publisher: nobody listening on to_mqtt");
        }
    }
}
