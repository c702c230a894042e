use crate::modbus::Register;
use crate::prelude::*;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Reply<T> = Arc<Mutex<Option<oneshot::Sender<T>>>>;

#[derive(Clone, Debug)]
pub enum ChannelData {
    ReadRegister(Register, Reply<Option<u16>>),
    ReadAll(Reply<HashMap<Register, u16>>),
    /// consecutive registers starting at the given one
    RegisterData(Register, Vec<u16>),
    Shutdown,
}

/// Last validated value of every register the poller has read. Nothing else
/// writes here, so a value present is a value that passed validation.
pub struct RegisterCache {
    channels: Channels,
    register_data: Arc<Mutex<HashMap<Register, u16>>>,
}

impl RegisterCache {
    pub fn new(channels: Channels) -> Self {
        Self {
            channels,
            register_data: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn start(&self) -> Result<()> {
        futures::try_join!(self.cache_getter(), self.cache_setter())?;

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.read_register_cache.send(ChannelData::Shutdown);
        let _ = self.channels.to_register_cache.send(ChannelData::Shutdown);
    }

    // helper for other components:
    //
    //   RegisterCache::get(&self.channels, Register::input(0x331A)).await
    //
    pub async fn get(channels: &Channels, register: Register) -> Option<u16> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        if channels
            .read_register_cache
            .send(ChannelData::ReadRegister(register, tx))
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn get_all(channels: &Channels) -> HashMap<Register, u16> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        if channels
            .read_register_cache
            .send(ChannelData::ReadAll(tx))
            .is_err()
        {
            return HashMap::new();
        }
        rx.await.unwrap_or_default()
    }

    fn reply<T>(tx: Reply<T>, value: T) {
        if let Ok(mut tx) = tx.lock() {
            if let Some(tx) = tx.take() {
                let _ = tx.send(value);
            }
        }
    }

    async fn cache_getter(&self) -> Result<()> {
        let mut receiver = self.channels.read_register_cache.subscribe();

        debug!("register_cache getter starting");

        loop {
            match receiver.recv().await {
                Ok(ChannelData::ReadRegister(register, tx)) => {
                    let value = self
                        .register_data
                        .lock()
                        .map_err(|_| anyhow!("register cache poisoned"))?
                        .get(&register)
                        .copied();
                    Self::reply(tx, value);
                }
                Ok(ChannelData::ReadAll(tx)) => {
                    let all = self
                        .register_data
                        .lock()
                        .map_err(|_| anyhow!("register cache poisoned"))?
                        .clone();
                    Self::reply(tx, all);
                }
                Ok(ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                Ok(ChannelData::RegisterData(..)) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("register_cache getter: lagged {} messages", n);
                }
            }
        }

        Ok(())
    }

    async fn cache_setter(&self) -> Result<()> {
        let mut receiver = self.channels.to_register_cache.subscribe();

        debug!("register_cache setter starting");

        loop {
            match receiver.recv().await {
                Ok(ChannelData::RegisterData(start, values)) => {
                    let mut cache = self
                        .register_data
                        .lock()
                        .map_err(|_| anyhow!("register cache poisoned"))?;
                    for (offset, value) in values.into_iter().enumerate() {
                        let register = Register {
                            function: start.function,
                            address: start.address.wrapping_add(offset as u16),
                        };
                        cache.insert(register, value);
                    }
                }
                Ok(ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("register_cache setter: lagged {} messages", n);
                }
            }
        }

        Ok(())
    }
}
