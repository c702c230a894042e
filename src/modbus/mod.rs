pub mod client;
pub mod frame;
pub mod poller;
pub mod transport;

pub use client::{ClientSettings, CorruptionTracker, RegisterClient, RegisterTransaction, Transport};
pub use frame::{FunctionCode, Register, Request};
pub use poller::{Point, Poller};
pub use transport::TcpTransport;

#[derive(Clone, Debug, PartialEq)]
pub enum ChannelData {
    /// engineering value for the named writable point
    Write { name: String, value: f64 },
    Shutdown,
}
