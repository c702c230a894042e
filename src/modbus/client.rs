use crate::error::RegisterError;
use crate::modbus::frame::{FunctionCode, Request};
use crate::prelude::*;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;

/// How long a corruption event counts towards the recent total.
pub const CORRUPTION_WINDOW_MS: u32 = 10 * 60 * 1000;

/// Moves raw frames to and from the slave. Implementations return whatever
/// bytes arrived; all validation happens in the client.
#[async_trait]
pub trait Transport: Send {
    async fn exchange(
        &mut self,
        request: &[u8],
        expected_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, RegisterError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClientSettings {
    pub slave: u8,
    /// total attempts, first one included
    pub max_attempts: u8,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            slave: 10,
            max_attempts: 3,
            retry_delay: Duration::from_millis(200),
            timeout: Duration::from_secs(2),
        }
    }
}

/// One logical register access and how it ended.
#[derive(Clone, Debug, PartialEq)]
pub struct RegisterTransaction {
    pub request: Request,
    pub attempts: u8,
    pub outcome: Result<Vec<u16>, RegisterError>,
}

impl RegisterTransaction {
    pub fn retries(&self) -> u8 {
        self.attempts.saturating_sub(1)
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Corruption events seen within a sliding window.
#[derive(Clone, Debug)]
pub struct CorruptionTracker {
    window_ms: u32,
    events: VecDeque<u32>,
}

impl CorruptionTracker {
    pub fn new(window_ms: u32) -> Self {
        Self {
            window_ms,
            events: VecDeque::new(),
        }
    }

    pub fn record(&mut self, now: u32) {
        self.events.push_back(now);
        self.prune(now);
    }

    pub fn count(&mut self, now: u32) -> usize {
        self.prune(now);
        self.events.len()
    }

    fn prune(&mut self, now: u32) {
        while let Some(t) = self.events.front() {
            if Utils::elapsed_ms(now, *t) >= self.window_ms {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct RegisterClient<T: Transport> {
    transport: T,
    settings: ClientSettings,
    tracker: CorruptionTracker,
    clock: Clock,
}

impl<T: Transport> RegisterClient<T> {
    pub fn new(transport: T, settings: ClientSettings, clock: Clock) -> Self {
        Self {
            transport,
            settings,
            tracker: CorruptionTracker::new(CORRUPTION_WINDOW_MS),
            clock,
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn recent_corruptions(&mut self) -> usize {
        let now = self.clock.now_ms();
        self.tracker.count(now)
    }

    pub async fn read(
        &mut self,
        function: FunctionCode,
        address: u16,
        count: u16,
    ) -> RegisterTransaction {
        self.read_checked(function, address, count, |_| Ok(())).await
    }

    /// Read whose values must also pass `plausible`; an implausible value is
    /// treated like any other corruption and retried.
    pub async fn read_checked<F>(
        &mut self,
        function: FunctionCode,
        address: u16,
        count: u16,
        plausible: F,
    ) -> RegisterTransaction
    where
        F: Fn(&[u16]) -> Result<(), RegisterError> + Send + Sync,
    {
        match Request::read(self.settings.slave, function, address, count) {
            Ok(request) => self.transact(request, plausible).await,
            Err(e) => Self::rejected(self.settings.slave, function, address, e),
        }
    }

    pub async fn write(&mut self, address: u16, values: Vec<u16>) -> RegisterTransaction {
        match Request::write(self.settings.slave, address, values) {
            Ok(request) => self.transact(request, |_| Ok(())).await,
            Err(e) => Self::rejected(self.settings.slave, FunctionCode::WriteMultiple, address, e),
        }
    }

    fn rejected(
        slave: u8,
        function: FunctionCode,
        address: u16,
        e: RegisterError,
    ) -> RegisterTransaction {
        RegisterTransaction {
            request: Request {
                slave,
                function,
                address,
                count: 0,
                values: Vec::new(),
            },
            attempts: 0,
            outcome: Err(e),
        }
    }

    async fn transact<F>(&mut self, request: Request, plausible: F) -> RegisterTransaction
    where
        F: Fn(&[u16]) -> Result<(), RegisterError> + Send + Sync,
    {
        let bytes = request.to_bytes();
        let mut attempts = 0;
        let mut last = RegisterError::Timeout(self.settings.timeout.as_millis() as u64);

        while attempts < self.settings.max_attempts {
            if attempts > 0 {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
            attempts += 1;

            let result = match self
                .transport
                .exchange(&bytes, request.expected_len(), self.settings.timeout)
                .await
            {
                Ok(response) => request
                    .validate(&response)
                    .and_then(|values| plausible(&values).map(|_| values)),
                Err(e) => Err(e),
            };

            match result {
                Ok(values) => {
                    debug!(
                        "modbus: {:?} {} x{} ok after {} attempt(s)",
                        request.function, request.address, request.count, attempts
                    );
                    return RegisterTransaction {
                        request,
                        attempts,
                        outcome: Ok(values),
                    };
                }
                Err(e) if e.is_retryable() => {
                    if e.is_corruption() {
                        self.tracker.record(self.clock.now_ms());
                    }
                    warn!(
                        "modbus: {:?} {} attempt {}/{}: {}",
                        request.function, request.address, attempts, self.settings.max_attempts, e
                    );
                    last = e;
                }
                Err(e) => {
                    return RegisterTransaction {
                        request,
                        attempts,
                        outcome: Err(e),
                    };
                }
            }
        }

        RegisterTransaction {
            request,
            attempts,
            outcome: Err(RegisterError::Corrupted {
                attempts,
                last: Box::new(last),
            }),
        }
    }
}
