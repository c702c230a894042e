pub use anyhow::{anyhow, bail, Error, Result};
pub use log::{debug, error, info, trace, warn};
pub use tokio::sync::{broadcast, oneshot};

pub use crate::channels::Channels;
pub use crate::config::{self, Config, ConfigWrapper};
pub use crate::options::Options;
pub use crate::register_cache::RegisterCache;
pub use crate::state::{
    StackReader, StackState, StackWriter, UnitReader, UnitState, UnitWriter, UnitsSnapshot,
};
pub use crate::stats::{SharedStats, Stats};
pub use crate::utils::{Clock, Utils};
pub use crate::{can, engine, modbus, mqtt, publisher, register_cache};
