use crate::prelude::*;
use crate::publish_gate::Sample;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Publish, QoS};

const RECONNECT_DELAY_SECS: u64 = 5;
const PUBLISH_ATTEMPTS: u32 = 3;

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

/// Something an incoming cmd topic asks us to do.
#[derive(PartialEq, Debug, Clone)]
pub enum Command {
    WriteRegister { name: String, value: f64 },
}

impl Message {
    pub fn for_sample(sample: &Sample) -> Self {
        Self {
            topic: sample.key.clone(),
            retain: false,
            payload: sample.value.to_string(),
        }
    }

    pub fn availability(online: bool) -> Self {
        Self {
            topic: "availability".to_string(),
            retain: true,
            payload: if online { "online" } else { "offline" }.to_string(),
        }
    }

    // topic has the namespace stripped already, eg
    //   cmd/modbus/load_switch => WriteRegister { name: "load_switch", .. }
    pub fn to_command(&self) -> Result<Command> {
        let parts: Vec<&str> = self.topic.split('/').collect();

        match parts[..] {
            ["cmd", "modbus", name] if !name.is_empty() => Ok(Command::WriteRegister {
                name: name.to_string(),
                value: self.payload_float()?,
            }),
            [..] => bail!("unhandled: {:?}", self),
        }
    }

    fn payload_float(&self) -> Result<f64> {
        let value: f64 = match self.payload.to_ascii_lowercase().as_str() {
            "on" | "true" => 1.0,
            "off" | "false" => 0.0,
            other => other
                .trim()
                .parse()
                .map_err(|err| anyhow!("payload_float: {}", err))?,
        };
        if !value.is_finite() {
            bail!("payload_float: {} is not finite", self.payload);
        }
        Ok(value)
    }
} // }}}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Message(Message),
    Shutdown,
}

pub type Sender = broadcast::Sender<ChannelData>;

#[derive(Clone)]
pub struct Mqtt {
    config: ConfigWrapper,
    channels: Channels,
    stats: SharedStats,
}

impl Mqtt {
    pub fn new(config: ConfigWrapper, channels: Channels, stats: SharedStats) -> Self {
        Self {
            config,
            channels,
            stats,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let c = self.config.mqtt();

        if !c.enabled() {
            info!("mqtt disabled, skipping");
            return Ok(());
        }

        let mut options = MqttOptions::new("pylon-bridge", c.host(), c.port());

        let will = LastWill {
            topic: self.topic("availability"),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(std::time::Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", c.host(), c.port());

        let (client, eventloop) = AsyncClient::new(options, 10);

        futures::try_join!(
            self.setup(client.clone()),
            self.receiver(eventloop),
            self.sender(client)
        )?;

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_mqtt.send(ChannelData::Shutdown);
    }

    async fn setup(&self, client: AsyncClient) -> Result<()> {
        client
            .subscribe(self.topic("cmd/modbus/+"), QoS::AtMostOnce)
            .await?;

        Ok(())
    }

    // mqtt -> modbus poller
    async fn receiver(&self, mut eventloop: EventLoop) -> Result<()> {
        let mut shutdown = self.channels.to_mqtt.subscribe();

        loop {
            tokio::select! {
                message = shutdown.recv() => match message {
                    Ok(ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                    _ => {}
                },
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if let Err(e) = self.handle_message(publish) {
                            warn!("mqtt: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("mqtt: {}", e);
                        if let Ok(mut stats) = self.stats.lock() {
                            stats.mqtt_errors += 1;
                        }
                        info!("mqtt: reconnecting in {}s", RECONNECT_DELAY_SECS);
                        tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS))
                            .await;
                    }
                    _ => {} // keepalives etc
                },
            }
        }

        info!("mqtt: receiver loop exiting");
        Ok(())
    }

    fn handle_message(&self, publish: Publish) -> Result<()> {
        // strip the namespace and its slash; namespaces may contain slashes
        let namespace = self.config.mqtt().namespace().to_owned();
        let topic = publish
            .topic
            .strip_prefix(&namespace)
            .and_then(|t| t.strip_prefix('/'))
            .ok_or_else(|| anyhow!("topic outside namespace: {}", publish.topic))?
            .to_owned();

        let message = Message {
            topic,
            retain: publish.retain,
            payload: String::from_utf8(publish.payload.to_vec())?,
        };
        debug!("mqtt: RX {:?}", message);

        match message.to_command()? {
            Command::WriteRegister { name, value } => {
                if self
                    .channels
                    .to_modbus
                    .send(modbus::ChannelData::Write { name, value })
                    .is_err()
                {
                    bail!("send(to_modbus) failed - channel closed?");
                }
            }
        }

        Ok(())
    }

    // publisher -> mqtt
    async fn sender(&self, client: AsyncClient) -> Result<()> {
        let mut receiver = self.channels.to_mqtt.subscribe();

        // initial availability is the publisher's call, not ours
        loop {
            match receiver.recv().await {
                Ok(ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed) => {
                    info!("mqtt: sender received shutdown signal");
                    let _ = client
                        .publish(self.topic("availability"), QoS::AtLeastOnce, true, "offline")
                        .await;
                    let _ = client.disconnect().await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("mqtt: sender lagged, {} messages lost", n);
                }
                Ok(ChannelData::Message(message)) => self.publish(&client, message).await,
            }
        }

        info!("mqtt: sender loop exiting");
        Ok(())
    }

    async fn publish(&self, client: &AsyncClient, message: Message) {
        let topic = self.topic(&message.topic);
        debug!("mqtt: publishing {} = {}", topic, message.payload);

        for attempt in 1..=PUBLISH_ATTEMPTS {
            match client
                .publish(&topic, QoS::AtLeastOnce, message.retain, message.payload.as_bytes())
                .await
            {
                Ok(()) => {
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.mqtt_messages_sent += 1;
                    }
                    return;
                }
                Err(err) => {
                    error!(
                        "mqtt: publish to {} failed: {:?} (attempt {}/{})",
                        topic, err, attempt, PUBLISH_ATTEMPTS
                    );
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.mqtt_errors += 1;
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.config.mqtt().namespace(), suffix)
    }
}
