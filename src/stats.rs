use crate::prelude::*;

use std::sync::{Arc, Mutex};

pub type SharedStats = Arc<Mutex<Stats>>;

#[derive(Debug, Default, Clone)]
pub struct Stats {
    // broadcast bus
    pub can_frames_accepted: u64,
    pub can_frames_rejected: u64,
    pub can_frames_ignored: u64,
    pub can_frames_malformed: u64,
    pub can_reset_markers: u64,
    pub can_disconnections: u64,

    // rs485 engine
    pub requests_sent: u64,
    pub responses_ok: u64,
    pub response_timeouts: u64,
    pub response_retries: u64,
    pub response_corrupt: u64,
    pub checksum_failures: u64,
    pub cycles_completed: u64,
    pub replies_sent: u64,
    pub requests_dropped: u64,
    pub rs485_disconnections: u64,

    // register client
    pub register_reads: u64,
    pub register_writes: u64,
    pub register_attempts: u64,
    pub register_corruptions: u64,
    pub register_corruptions_recent: u64,
    pub register_failures: u64,

    // publishing
    pub published: u64,
    pub suppressed: u64,
    pub mqtt_messages_sent: u64,
    pub mqtt_errors: u64,
}

impl Stats {
    pub fn shared() -> SharedStats {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn print_summary(&self) {
        info!("Statistics:");
        info!("  Broadcast bus:");
        info!("    Frames accepted: {}", self.can_frames_accepted);
        info!("    Frames rejected (range): {}", self.can_frames_rejected);
        info!("    Frames ignored: {}", self.can_frames_ignored);
        info!("    Frames malformed: {}", self.can_frames_malformed);
        info!("    Reset markers: {}", self.can_reset_markers);
        info!("    Disconnections: {}", self.can_disconnections);
        info!("  RS485:");
        info!("    Requests sent: {}", self.requests_sent);
        info!("    Responses ok: {}", self.responses_ok);
        info!("    Timeouts: {}", self.response_timeouts);
        info!("    Retries: {}", self.response_retries);
        info!("    Corrupt responses: {}", self.response_corrupt);
        info!("    Checksum failures: {}", self.checksum_failures);
        info!("    Poll cycles: {}", self.cycles_completed);
        info!("    Replies sent: {}", self.replies_sent);
        info!("    Requests dropped: {}", self.requests_dropped);
        info!("    Disconnections: {}", self.rs485_disconnections);
        info!("  Register client:");
        info!("    Reads: {}", self.register_reads);
        info!("    Writes: {}", self.register_writes);
        info!("    Attempts: {}", self.register_attempts);
        info!("    Corruptions: {}", self.register_corruptions);
        info!("    Corruptions (last 10 min): {}", self.register_corruptions_recent);
        info!("    Failures: {}", self.register_failures);
        info!("  Publishing:");
        info!("    Published: {}", self.published);
        info!("    Suppressed: {}", self.suppressed);
        info!("    MQTT messages sent: {}", self.mqtt_messages_sent);
        info!("    MQTT errors: {}", self.mqtt_errors);
    }
}
