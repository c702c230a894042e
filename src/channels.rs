use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct Channels {
    pub to_can: broadcast::Sender<can::ChannelData>,
    pub to_engine: broadcast::Sender<engine::ChannelData>,
    pub to_modbus: broadcast::Sender<modbus::ChannelData>,
    pub to_publisher: broadcast::Sender<publisher::ChannelData>,
    pub to_mqtt: broadcast::Sender<mqtt::ChannelData>,
    pub read_register_cache: broadcast::Sender<register_cache::ChannelData>,
    pub to_register_cache: broadcast::Sender<register_cache::ChannelData>,
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

impl Channels {
    pub fn new() -> Self {
        Self {
            to_can: Self::channel(),
            to_engine: Self::channel(),
            to_modbus: Self::channel(),
            to_publisher: Self::channel(),
            to_mqtt: Self::channel(),
            read_register_cache: Self::channel(),
            to_register_cache: Self::channel(),
        }
    }

    fn channel<T: Clone>() -> broadcast::Sender<T> {
        broadcast::channel(2048).0
    }
}
