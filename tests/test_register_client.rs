mod common;
use common::*;

use pylon_bridge::error::RegisterError;
use pylon_bridge::modbus::{
    self, ClientSettings, FunctionCode, Point, Poller, Register, RegisterClient, Transport,
};
use pylon_bridge::prelude::*;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SLAVE: u8 = 10;

/// Replays canned responses in order and records every request it was given.
struct Scripted {
    responses: VecDeque<Result<Vec<u8>, RegisterError>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Scripted {
    fn new(responses: Vec<Result<Vec<u8>, RegisterError>>) -> Self {
        Self {
            responses: responses.into(),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Transport for Scripted {
    async fn exchange(
        &mut self,
        request: &[u8],
        _expected_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, RegisterError> {
        self.sent.lock().unwrap().push(request.to_vec());
        self.responses
            .pop_front()
            .unwrap_or(Err(RegisterError::Timeout(timeout.as_millis() as u64)))
    }
}

fn settings() -> ClientSettings {
    ClientSettings {
        slave: SLAVE,
        max_attempts: 3,
        retry_delay: Duration::from_millis(1),
        timeout: Duration::from_millis(50),
    }
}

fn client(responses: Vec<Result<Vec<u8>, RegisterError>>) -> RegisterClient<Scripted> {
    RegisterClient::new(Scripted::new(responses), settings(), Clock::new())
}

/// 53.20 in a single holding register.
fn voltage_response() -> Vec<u8> {
    Factory::modbus_response(SLAVE, 0x03, &[0x02, 0x14, 0xC8])
}

fn with_bad_crc(mut frame: Vec<u8>) -> Vec<u8> {
    let last = frame.len() - 1;
    frame[last] ^= 0xFF;
    frame
}

#[tokio::test]
async fn recovers_from_two_corrupt_responses() {
    common_setup();

    let responses = vec![
        // function code flipped to read-input
        Ok(Factory::modbus_response(SLAVE, 0x04, &[0x02, 0x14, 0xC8])),
        Ok(with_bad_crc(voltage_response())),
        Ok(voltage_response()),
    ];
    let transport = Scripted::new(responses);
    let sent = transport.sent.clone();
    let mut client = RegisterClient::new(transport, settings(), Clock::new());

    let tx = client.read(FunctionCode::ReadHolding, 0x0100, 1).await;

    assert_eq!(tx.outcome, Ok(vec![5320]));
    assert_eq!(tx.attempts, 3);
    assert_eq!(tx.retries(), 2);
    assert_eq!(client.recent_corruptions(), 2);

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 3);
    assert_eq!(&sent[0][..6], &[SLAVE, 0x03, 0x01, 0x00, 0x00, 0x01]);
    assert!(sent.iter().all(|r| *r == sent[0]));
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let mut client = client(vec![
        Ok(with_bad_crc(voltage_response())),
        Ok(with_bad_crc(voltage_response())),
        Ok(with_bad_crc(voltage_response())),
        Ok(voltage_response()),
    ]);

    let tx = client.read(FunctionCode::ReadHolding, 0x0100, 1).await;

    assert_eq!(tx.attempts, 3);
    match tx.outcome {
        Err(RegisterError::Corrupted { attempts, last }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, RegisterError::CrcMismatch { .. }));
        }
        other => panic!("expected Corrupted, got {:?}", other),
    }
    assert_eq!(client.recent_corruptions(), 3);
}

#[tokio::test]
async fn exception_is_not_retried() {
    let mut client = client(vec![
        Ok(Factory::modbus_response(SLAVE, 0x83, &[0x02])),
        Ok(voltage_response()),
    ]);

    let tx = client.read(FunctionCode::ReadHolding, 0x0100, 1).await;

    assert_eq!(tx.outcome, Err(RegisterError::Exception { code: 2 }));
    assert_eq!(tx.attempts, 1);
    assert_eq!(client.recent_corruptions(), 0);
}

#[tokio::test]
async fn timeout_is_retried_but_not_counted_as_corruption() {
    let mut client = client(vec![
        Err(RegisterError::Timeout(50)),
        Ok(voltage_response()),
    ]);

    let tx = client.read(FunctionCode::ReadHolding, 0x0100, 1).await;

    assert!(tx.is_ok());
    assert_eq!(tx.retries(), 1);
    assert_eq!(client.recent_corruptions(), 0);
}

#[tokio::test]
async fn implausible_values_are_retried() {
    let mut client = client(vec![
        Ok(Factory::modbus_response(SLAVE, 0x03, &[0x02, 0xFF, 0xFF])),
        Ok(voltage_response()),
    ]);

    let plausible = |values: &[u16]| match values.first() {
        Some(v) if *v > 7000 => Err(RegisterError::Implausible {
            register: 0x0100,
            value: *v as f64,
        }),
        _ => Ok(()),
    };
    let tx = client
        .read_checked(FunctionCode::ReadHolding, 0x0100, 1, plausible)
        .await;

    assert_eq!(tx.outcome, Ok(vec![5320]));
    assert_eq!(tx.attempts, 2);
    assert_eq!(client.recent_corruptions(), 1);
}

#[tokio::test]
async fn point_bounds_reject_garbage() {
    let point = Point {
        name: "battery_voltage".to_string(),
        address: 0x0100,
        function: FunctionCode::ReadHolding,
        scale: 0.01,
        signed: false,
        min: Some(8.0),
        max: Some(70.0),
        writable: false,
    };
    let mut client = client(vec![
        Ok(Factory::modbus_response(SLAVE, 0x03, &[0x02, 0x00, 0x00])),
        Ok(Factory::modbus_response(SLAVE, 0x03, &[0x02, 0xFF, 0xFF])),
        Ok(voltage_response()),
    ]);

    let tx = client.read_point(&point).await;

    assert_eq!(tx.outcome, Ok(vec![5320]));
    assert_eq!(tx.retries(), 2);
}

#[tokio::test]
async fn write_checks_echo() {
    let mut client = client(vec![
        // echo names the wrong register count
        Ok(Factory::modbus_response(SLAVE, 0x10, &[0x02, 0x00, 0x00, 0x01])),
        Ok(Factory::modbus_response(SLAVE, 0x10, &[0x02, 0x00, 0x00, 0x02])),
    ]);

    let tx = client.write(0x0200, vec![1, 2]).await;

    assert_eq!(tx.outcome, Ok(vec![1, 2]));
    assert_eq!(tx.attempts, 2);
    assert!(tx.request.is_write());
}

#[tokio::test]
async fn invalid_request_never_reaches_the_wire() {
    let transport = Scripted::new(vec![Ok(voltage_response())]);
    let sent = transport.sent.clone();
    let mut client = RegisterClient::new(transport, settings(), Clock::new());

    let tx = client.read(FunctionCode::ReadHolding, 0x0100, 0).await;
    assert_eq!(tx.attempts, 0);
    assert!(matches!(tx.outcome, Err(RegisterError::InvalidRequest(_))));

    let tx = client.write(0x0100, Vec::new()).await;
    assert_eq!(tx.attempts, 0);

    assert!(sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn poller_feeds_cache_and_carries_out_writes() {
    common_setup();

    let channels = Channels::new();
    let stats = Stats::shared();
    let cache = RegisterCache::new(channels.clone());
    let poller = Poller::new(Factory::config(), channels.clone(), Clock::new(), stats.clone());

    let point = Point {
        name: "boost_voltage".to_string(),
        address: 0x0100,
        function: FunctionCode::ReadHolding,
        scale: 0.01,
        signed: false,
        min: Some(8.0),
        max: Some(70.0),
        writable: true,
    };
    let client = client(vec![
        Ok(with_bad_crc(voltage_response())),
        Ok(voltage_response()),
        Ok(Factory::modbus_response(SLAVE, 0x10, &[0x01, 0x00, 0x00, 0x01])),
    ]);
    let register = Register::holding(0x0100);

    let wait_for = |expected: u16| {
        let channels = channels.clone();
        async move {
            for _ in 0..200 {
                if RegisterCache::get(&channels, register).await == Some(expected) {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            bail!("register never reached {}", expected)
        }
    };

    let driver = async {
        wait_for(5320).await?;

        channels
            .to_modbus
            .send(modbus::ChannelData::Write {
                name: "boost_voltage".to_string(),
                value: 54.0,
            })
            .map_err(|_| anyhow!("send(to_modbus) failed"))?;
        wait_for(5400).await?;

        let _ = channels.to_modbus.send(modbus::ChannelData::Shutdown);
        cache.stop();
        Ok::<(), anyhow::Error>(())
    };

    tokio::time::timeout(
        Duration::from_secs(5),
        async {
            futures::try_join!(
                cache.start(),
                poller.run(client, vec![point], Duration::from_secs(3600)),
                driver
            )
        },
    )
    .await
    .expect("poller test timed out")
    .unwrap();

    let stats = stats.lock().unwrap();
    assert_eq!(stats.register_reads, 1);
    assert_eq!(stats.register_writes, 1);
    assert_eq!(stats.register_attempts, 3);
    assert_eq!(stats.register_failures, 0);
    assert_eq!(stats.register_corruptions_recent, 1);
}
