mod common;
use common::*;

use pylon_bridge::engine::machine::{Active, Passive};
use pylon_bridge::engine::{self, Engine, EngineConfig, Link, Role};
use pylon_bridge::pylon::frame::{self, Command, ReturnCode};
use pylon_bridge::pylon::{payload, FrameCodec};
use pylon_bridge::prelude::*;
use pylon_bridge::state::stack_channel;

use futures::StreamExt;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::FramedRead;

fn engine_config(role: Role) -> EngineConfig {
    EngineConfig {
        link: Link::Tcp {
            host: "duplex".to_string(),
            port: 0,
        },
        role,
        settings: Factory::settings(),
        tick_ms: 5,
    }
}

async fn next_frame<R>(frames: &mut FramedRead<R, FrameCodec>) -> Result<frame::Frame>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let raw = tokio::time::timeout(Duration::from_secs(2), frames.next())
        .await
        .map_err(|_| anyhow!("no frame within 2s"))?
        .ok_or_else(|| anyhow!("stream closed"))??;
    Ok(frame::decode(&raw)?)
}

#[tokio::test]
async fn active_engine_polls_a_unit() {
    common_setup();

    let channels = Channels::new();
    let stats = Stats::shared();
    let (_, stack) = stack_channel();
    let engine = Engine::new(
        engine_config(Role::Active(Active)),
        channels.clone(),
        stack,
        Clock::new(),
        stats.clone(),
    );
    let units = engine.units().unwrap();
    let mut shutdown = channels.to_engine.subscribe();

    let (engine_side, peer_side) = tokio::io::duplex(4096);

    let peer = async {
        let (reader, mut writer) = tokio::io::split(peer_side);
        let mut frames = FramedRead::new(reader, FrameCodec::new());

        let request = next_frame(&mut frames).await?;
        assert_eq!(request.command(), Some(Command::GetAnalog));
        assert_eq!(request.info, "00");
        writer.write_all(&Factory::analog_response(2, 0)).await?;

        let request = next_frame(&mut frames).await?;
        assert_eq!(request.command(), Some(Command::GetAlarm));
        writer.write_all(&Factory::alarm_response(2, 0)).await?;

        for _ in 0..400 {
            if units.snapshot().summary.units == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        channels
            .to_engine
            .send(engine::ChannelData::Shutdown)
            .map_err(|_| anyhow!("send(to_engine) failed"))?;
        Ok::<(), anyhow::Error>(())
    };

    futures::try_join!(engine.run(engine_side, &mut shutdown), peer).unwrap();

    let unit = units.unit(0).unwrap();
    assert!(!unit.stale);
    assert_eq!(unit.cells, vec![3.301, 3.302, 3.303, 3.304]);
    assert_eq!(unit.soc, Some(80.0));
    assert_eq!(unit.cycles, Some(42));
    assert!(unit.protections.is_empty());

    let summary = units.snapshot().summary;
    assert_eq!(summary.units, 1);
    assert_eq!(summary.cell_min_mv, Some(3301));
    assert_eq!(summary.cell_max_mv, Some(3304));
    assert_eq!(summary.cell_delta_mv, Some(3));

    let stats = stats.lock().unwrap();
    assert_eq!(stats.requests_sent, 2);
    assert_eq!(stats.responses_ok, 2);
    assert_eq!(stats.cycles_completed, 1);
}

#[tokio::test]
async fn active_engine_marks_silent_unit_stale() {
    let channels = Channels::new();
    let stats = Stats::shared();
    let (_, stack) = stack_channel();
    let engine = Engine::new(
        engine_config(Role::Active(Active)),
        channels.clone(),
        stack,
        Clock::new(),
        stats.clone(),
    );
    let mut shutdown = channels.to_engine.subscribe();

    let (engine_side, peer_side) = tokio::io::duplex(4096);

    let peer = async {
        let (reader, _writer) = tokio::io::split(peer_side);
        let mut frames = FramedRead::new(reader, FrameCodec::new());

        // analog twice, then alarm twice, all unanswered
        for _ in 0..4 {
            next_frame(&mut frames).await?;
        }

        channels
            .to_engine
            .send(engine::ChannelData::Shutdown)
            .map_err(|_| anyhow!("send(to_engine) failed"))?;
        Ok::<(), anyhow::Error>(())
    };

    futures::try_join!(engine.run(engine_side, &mut shutdown), peer).unwrap();

    assert!(engine.units().unwrap().unit(0).unwrap().stale);
    let stats = stats.lock().unwrap();
    assert!(stats.response_timeouts >= 3);
    assert!(stats.response_retries >= 2);
}

#[tokio::test]
async fn passive_engine_answers_inverter() {
    common_setup();

    let channels = Channels::new();
    let stats = Stats::shared();
    let clock = Clock::new();
    let (writer, stack) = stack_channel();
    writer.update(|s| *s = Factory::stack_state(clock.now_ms()));

    let engine = Engine::new(
        engine_config(Role::Passive(Passive)),
        channels.clone(),
        stack,
        clock,
        stats.clone(),
    );
    let mut shutdown = channels.to_engine.subscribe();

    let (engine_side, peer_side) = tokio::io::duplex(4096);

    let peer = async {
        let (reader, mut w) = tokio::io::split(peer_side);
        let mut frames = FramedRead::new(reader, FrameCodec::new());

        // not for us
        w.write_all(&frame::encode(5, 0x46, 0x42, "00")?).await?;
        w.write_all(&frame::encode(2, 0x46, 0x42, "00")?).await?;

        let reply = next_frame(&mut frames).await?;
        assert_eq!(reply.address, 2);
        assert_eq!(reply.return_code(), Some(ReturnCode::Normal));
        let data = payload::decode_analog(&reply.info)?;
        assert_eq!(data.voltage, 53.2);

        channels
            .to_engine
            .send(engine::ChannelData::Shutdown)
            .map_err(|_| anyhow!("send(to_engine) failed"))?;
        Ok::<(), anyhow::Error>(())
    };

    futures::try_join!(engine.run(engine_side, &mut shutdown), peer).unwrap();

    let stats = stats.lock().unwrap();
    assert_eq!(stats.replies_sent, 1);
    assert_eq!(stats.requests_dropped, 1);
    assert_eq!(stats.requests_sent, 0);
}

#[tokio::test]
async fn engine_reports_closed_channel() {
    let channels = Channels::new();
    let (_, stack) = stack_channel();
    let engine = Engine::new(
        engine_config(Role::Passive(Passive)),
        channels.clone(),
        stack,
        Clock::new(),
        Stats::shared(),
    );
    let mut shutdown = channels.to_engine.subscribe();

    let (engine_side, peer_side) = tokio::io::duplex(64);
    drop(peer_side);

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        engine.run(engine_side, &mut shutdown),
    )
    .await
    .unwrap();
    assert!(result.is_err());
}
