//! Decides whether a metric value should be published now. Knows nothing
//! about the sink; callers deliver whatever it lets through.
//!
//! Every timestamp is a wrapping millisecond tick, and every elapsed time is
//! taken with `Utils::elapsed_ms` so a counter rollover never reads as a huge
//! or negative gap.

use crate::utils::Utils;

use serde::Deserialize;
use std::collections::HashMap;

/// Deltas this close to the threshold count as reaching it.
const EPSILON: f64 = 1e-9;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
pub struct Policy {
    #[serde(default = "Policy::default_threshold")]
    pub threshold: f64,
    #[serde(default = "Policy::default_min_interval_ms")]
    pub min_interval_ms: u32,
    #[serde(default = "Policy::default_heartbeat_ms")]
    pub heartbeat_ms: u32,
    #[serde(default = "Policy::default_debounce_ms")]
    pub debounce_ms: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            threshold: Self::default_threshold(),
            min_interval_ms: Self::default_min_interval_ms(),
            heartbeat_ms: Self::default_heartbeat_ms(),
            debounce_ms: Self::default_debounce_ms(),
        }
    }
}

impl Policy {
    fn default_threshold() -> f64 {
        0.01
    }
    fn default_min_interval_ms() -> u32 {
        1000
    }
    fn default_heartbeat_ms() -> u32 {
        60000
    }
    fn default_debounce_ms() -> u32 {
        2000
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Number(f64),
    Flag(bool),
    Text(String),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Flag(b) => write!(f, "{}", if *b { "ON" } else { "OFF" }),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

/// One observation offered to the gate.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub key: String,
    pub value: Value,
    pub timestamp: u32,
}

impl Sample {
    pub fn new<K: Into<String>>(key: K, value: Value, timestamp: u32) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp,
        }
    }
}

#[derive(Debug)]
struct NumericEntry {
    value: f64,
    published_at: u32,
}

#[derive(Debug)]
struct FlagEntry {
    committed: bool,
    published_at: u32,
    pending: Option<(bool, u32)>,
}

#[derive(Debug)]
struct TextEntry {
    value: String,
    published_at: u32,
}

#[derive(Debug, Default)]
pub struct PublishGate {
    default: Policy,
    overrides: HashMap<String, Policy>,
    numbers: HashMap<String, NumericEntry>,
    flags: HashMap<String, FlagEntry>,
    texts: HashMap<String, TextEntry>,
    published: u64,
    suppressed: u64,
}

impl PublishGate {
    pub fn new(default: Policy, overrides: HashMap<String, Policy>) -> Self {
        Self {
            default,
            overrides,
            ..Default::default()
        }
    }

    pub fn set_policy<K: Into<String>>(&mut self, key: K, policy: Policy) {
        self.overrides.insert(key.into(), policy);
    }

    pub fn policy(&self, key: &str) -> Policy {
        self.overrides.get(key).copied().unwrap_or(self.default)
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    pub fn offer(&mut self, sample: &Sample) -> bool {
        match &sample.value {
            Value::Number(v) => self.numeric(&sample.key, *v, sample.timestamp),
            Value::Flag(b) => self.boolean(&sample.key, *b, sample.timestamp),
            Value::Text(s) => self.text(&sample.key, s, sample.timestamp),
        }
    }

    pub fn numeric(&mut self, key: &str, value: f64, now: u32) -> bool {
        if !value.is_finite() {
            return self.tally(false);
        }
        let policy = self.policy(key);

        let publish = match self.numbers.get_mut(key) {
            None => {
                self.numbers.insert(
                    key.to_string(),
                    NumericEntry {
                        value,
                        published_at: now,
                    },
                );
                true
            }
            Some(entry) => {
                let elapsed = Utils::elapsed_ms(now, entry.published_at);
                let moved = (value - entry.value).abs() + EPSILON >= policy.threshold;
                let publish = elapsed >= policy.min_interval_ms
                    && (moved || elapsed >= policy.heartbeat_ms);
                if publish {
                    entry.value = value;
                    entry.published_at = now;
                }
                publish
            }
        };

        self.tally(publish)
    }

    /// A change only commits once it has held for the debounce window; a
    /// reversal inside the window drops it. The committed value is repeated
    /// on heartbeat.
    pub fn boolean(&mut self, key: &str, value: bool, now: u32) -> bool {
        let policy = self.policy(key);

        let publish = match self.flags.get_mut(key) {
            None => {
                self.flags.insert(
                    key.to_string(),
                    FlagEntry {
                        committed: value,
                        published_at: now,
                        pending: None,
                    },
                );
                true
            }
            Some(entry) if value == entry.committed => {
                entry.pending = None;
                if Utils::elapsed_ms(now, entry.published_at) >= policy.heartbeat_ms {
                    entry.published_at = now;
                    true
                } else {
                    false
                }
            }
            Some(entry) => {
                let since = match entry.pending {
                    Some((pending, since)) if pending == value => since,
                    _ => {
                        entry.pending = Some((value, now));
                        now
                    }
                };
                if Utils::elapsed_ms(now, since) >= policy.debounce_ms {
                    entry.committed = value;
                    entry.pending = None;
                    entry.published_at = now;
                    true
                } else {
                    false
                }
            }
        };

        self.tally(publish)
    }

    pub fn text(&mut self, key: &str, value: &str, now: u32) -> bool {
        let policy = self.policy(key);

        let publish = match self.texts.get_mut(key) {
            None => {
                self.texts.insert(
                    key.to_string(),
                    TextEntry {
                        value: value.to_string(),
                        published_at: now,
                    },
                );
                true
            }
            Some(entry) => {
                let elapsed = Utils::elapsed_ms(now, entry.published_at);
                let publish = elapsed >= policy.min_interval_ms
                    && (entry.value != value || elapsed >= policy.heartbeat_ms);
                if publish {
                    entry.value = value.to_string();
                    entry.published_at = now;
                }
                publish
            }
        };

        self.tally(publish)
    }

    fn tally(&mut self, publish: bool) -> bool {
        if publish {
            self.published += 1;
        } else {
            self.suppressed += 1;
        }
        publish
    }
}
