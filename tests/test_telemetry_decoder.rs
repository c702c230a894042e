mod common;
use common::*;

use pylon_bridge::can::frames::FrameId;
use pylon_bridge::can::{AlarmFrame, Outcome, TelemetryDecoder};
use pylon_bridge::error::TelemetryError;
use pylon_bridge::prelude::*;
use pylon_bridge::state::stack_channel;

const STALE_AFTER_MS: u32 = 30_000;

fn setup(alarm_frame: AlarmFrame) -> (TelemetryDecoder, SharedStats) {
    let stats = Stats::shared();
    let (writer, _) = stack_channel();
    (TelemetryDecoder::new(writer, alarm_frame, stats.clone()), stats)
}

#[test]
fn decodes_charge_limits() {
    common_setup();
    let (decoder, stats) = setup(AlarmFrame::Legacy);

    let outcome = decoder.ingest(0x351, &[0x14, 0x02, 0x74, 0x0E, 0x74, 0x0E, 0xCC, 0x01], 1000);
    assert_eq!(outcome, Outcome::Applied(FrameId::Limits));

    let s = decoder.reader().snapshot();
    assert_eq!(s.charge_voltage_limit, Some(53.2));
    assert_eq!(s.charge_current_limit, Some(370.0));
    assert_eq!(s.discharge_current_limit, Some(370.0));
    assert_eq!(s.discharge_voltage_limit, Some(46.0));
    assert_eq!(s.last_update, Some(1000));
    assert_eq!(stats.lock().unwrap().can_frames_accepted, 1);
}

#[test]
fn decodes_pack_frames() {
    let (decoder, _) = setup(AlarmFrame::Legacy);

    // soc 80, soh 99
    decoder.ingest(0x355, &[0x50, 0x00, 0x63, 0x00], 10);
    // 53.20V, -12.5A, 23.0C
    decoder.ingest(0x356, &[0xC8, 0x14, 0x83, 0xFF, 0xE6, 0x00], 20);
    // 21.0C / 25.0C, 3.320V / 3.340V
    decoder.ingest(0x370, &[0xD2, 0x00, 0xFA, 0x00, 0xF8, 0x0C, 0x0C, 0x0D], 30);
    decoder.ingest(0x35E, b"PYLON\0\0\0", 40);
    // charge and discharge enabled
    decoder.ingest(0x35C, &[0xC0], 50);

    let s = decoder.reader().snapshot();
    assert_eq!(s.soc, Some(80.0));
    assert_eq!(s.soh, Some(99.0));
    assert_eq!(s.pack_voltage, Some(53.2));
    assert_eq!(s.pack_current, Some(-12.5));
    assert_eq!(s.pack_temperature, Some(23.0));
    assert_eq!(s.temperature_min, Some(21.0));
    assert_eq!(s.temperature_max, Some(25.0));
    assert_eq!(s.cell_voltage_min, Some(3.32));
    assert_eq!(s.cell_voltage_max, Some(3.34));
    assert_eq!(s.cell_voltage_delta(), Some(0.02));
    assert_eq!(s.manufacturer.as_deref(), Some("PYLON"));

    let requests = s.requests.unwrap();
    assert!(requests.charge_enable);
    assert!(requests.discharge_enable);
    assert!(!requests.force_charge_1);
    assert!(!requests.full_charge);
    assert_eq!(s.last_update, Some(50));
}

#[test]
fn out_of_range_frame_leaves_cache_untouched() {
    let (decoder, stats) = setup(AlarmFrame::Legacy);
    decoder.ingest(0x356, &[0xC8, 0x14, 0x83, 0xFF, 0xE6, 0x00], 100);
    let before = decoder.reader().snapshot();

    // 5.00V pack voltage
    let outcome = decoder.ingest(0x356, &[0xF4, 0x01, 0x00, 0x00, 0xFA, 0x00], 200);
    assert!(matches!(
        outcome,
        Outcome::Discarded(TelemetryError::OutOfRange {
            field: "voltage",
            ..
        })
    ));

    let after = decoder.reader().snapshot();
    assert_eq!(after.pack_voltage, before.pack_voltage);
    assert_eq!(after.last_update, Some(100));
    assert_eq!(after.rejected_frames, before.rejected_frames + 1);
    assert_eq!(stats.lock().unwrap().can_frames_rejected, 1);
}

#[test]
fn zeroed_limits_are_a_reset_marker() {
    let (decoder, stats) = setup(AlarmFrame::Legacy);
    decoder.ingest(0x351, &[0x14, 0x02, 0x74, 0x0E, 0x74, 0x0E, 0xCC, 0x01], 100);

    let outcome = decoder.ingest(0x351, &[0; 8], 200);
    assert_eq!(
        outcome,
        Outcome::Discarded(TelemetryError::ResetMarker(0x351))
    );

    let s = decoder.reader().snapshot();
    assert_eq!(s.charge_voltage_limit, Some(53.2));
    assert_eq!(s.rejected_frames, 0);
    assert_eq!(stats.lock().unwrap().can_reset_markers, 1);
}

#[test]
fn short_payload_is_malformed() {
    let (decoder, stats) = setup(AlarmFrame::Legacy);

    assert!(matches!(
        decoder.ingest(0x351, &[0x14, 0x02], 100),
        Outcome::Discarded(TelemetryError::ShortPayload { id: 0x351, len: 2 })
    ));
    assert_eq!(decoder.reader().snapshot().last_update, None);
    assert_eq!(stats.lock().unwrap().can_frames_malformed, 1);
}

#[test]
fn unknown_ids_are_ignored() {
    let (decoder, stats) = setup(AlarmFrame::Legacy);

    assert_eq!(decoder.ingest(0x305, &[0; 8], 100), Outcome::Ignored(0x305));
    assert_eq!(decoder.ingest(0x1806E5F4, &[0; 8], 100), Outcome::Ignored(0x1806E5F4));
    assert_eq!(decoder.reader().snapshot().last_update, None);
    assert_eq!(stats.lock().unwrap().can_frames_ignored, 2);
}

#[test]
fn only_selected_alarm_frame_is_used() {
    let (decoder, _) = setup(AlarmFrame::Legacy);

    // bit 1 cell overvolt protection, bit 17 high voltage warning
    let outcome = decoder.ingest(0x359, &[0x02, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00], 100);
    assert_eq!(outcome, Outcome::Applied(FrameId::AlarmLegacy));
    assert_eq!(
        decoder.ingest(0x35A, &[0xFF; 8], 110),
        Outcome::Ignored(0x35A)
    );

    let alarm = decoder.reader().snapshot().alarm.unwrap();
    assert_eq!(alarm.id, 0x359);
    assert_eq!(alarm.protections, vec!["cell_overvolt"]);
    assert_eq!(alarm.warnings, vec!["high_voltage"]);

    let (extended, _) = setup(AlarmFrame::Extended);
    assert_eq!(
        extended.ingest(0x359, &[0x02; 8], 100),
        Outcome::Ignored(0x359)
    );
    assert_eq!(
        extended.ingest(0x35A, &[0x01, 0, 0, 0, 0, 0, 0], 100),
        Outcome::Applied(FrameId::AlarmExtended)
    );
    let alarm = extended.reader().snapshot().alarm.unwrap();
    assert_eq!(alarm.raw, 1);
    assert!(alarm.protections.is_empty());
}

#[test]
fn stack_goes_stale_and_recovers() {
    let (decoder, _) = setup(AlarmFrame::Legacy);
    let limits = [0x14, 0x02, 0x74, 0x0E, 0x74, 0x0E, 0xCC, 0x01];

    assert!(decoder.reader().snapshot().is_stale(0, STALE_AFTER_MS));

    decoder.ingest(0x351, &limits, 1_000);
    assert!(!decoder.reader().snapshot().is_stale(30_999, STALE_AFTER_MS));
    assert!(decoder.reader().snapshot().is_stale(32_000, STALE_AFTER_MS));

    decoder.ingest(0x351, &limits, 32_000);
    assert!(!decoder.reader().snapshot().is_stale(32_500, STALE_AFTER_MS));
}

#[test]
fn staleness_survives_tick_rollover() {
    let (decoder, _) = setup(AlarmFrame::Legacy);
    decoder.ingest(0x351, &[0x14, 0x02, 0x74, 0x0E, 0x74, 0x0E, 0xCC, 0x01], u32::MAX - 1_000);

    let s = decoder.reader().snapshot();
    assert!(!s.is_stale(5_000, STALE_AFTER_MS));
    assert!(s.is_stale(40_000, STALE_AFTER_MS));
}
