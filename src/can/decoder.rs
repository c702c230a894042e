use crate::can::frames::{self, AlarmWord, ExtremeIndices, Extremes, FrameId, Limits, PackStatus, Requests, SocSoh};
use crate::error::TelemetryError;
use crate::prelude::*;
use crate::state::{AlarmFlags, RequestFlags};
use crate::stats::SharedStats;

use serde::Deserialize;
use std::convert::TryFrom;

const PACK_VOLTAGE: (f64, f64) = (30.0, 65.0);
const CURRENT_LIMIT: (f64, f64) = (0.0, 500.0);
const PACK_CURRENT: (f64, f64) = (-500.0, 500.0);
const TEMPERATURE: (f64, f64) = (-40.0, 80.0);
const PERCENT: (f64, f64) = (0.0, 100.0);
const CELL_VOLTAGE: (f64, f64) = (2.0, 4.5);

/// Cell readings below this are the BMS zeroing its registers during a reset.
const CELL_RESET_FLOOR: f64 = 0.5;

/// Which broadcast id carries the authoritative alarm word.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmFrame {
    #[default]
    Legacy,
    Extended,
}

impl AlarmFrame {
    pub fn id(self) -> FrameId {
        match self {
            Self::Legacy => FrameId::AlarmLegacy,
            Self::Extended => FrameId::AlarmExtended,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Applied(FrameId),
    Ignored(u32),
    Discarded(TelemetryError),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Update {
    Limits(Limits),
    SocSoh(SocSoh),
    PackStatus(PackStatus),
    Alarm(FrameId, AlarmWord),
    Requests(Requests),
    Manufacturer(String),
    Extremes(Extremes),
    ExtremeIndices(ExtremeIndices),
}

/// Sole writer of `StackState`. `ingest` never does I/O and never fails
/// outward: bad frames are counted and dropped, leaving the cache untouched.
pub struct TelemetryDecoder {
    writer: StackWriter,
    alarm_frame: AlarmFrame,
    stats: SharedStats,
}

impl TelemetryDecoder {
    pub fn new(writer: StackWriter, alarm_frame: AlarmFrame, stats: SharedStats) -> Self {
        Self {
            writer,
            alarm_frame,
            stats,
        }
    }

    pub fn reader(&self) -> StackReader {
        self.writer.reader()
    }

    pub fn ingest(&self, id: u32, data: &[u8], now: u32) -> Outcome {
        match Self::decode(id, data, self.alarm_frame) {
            Ok(Some(update)) => {
                let frame_id = update.frame_id();
                self.writer.update(|s| {
                    update.apply(s);
                    s.last_update = Some(now);
                });
                self.count(|stats| stats.can_frames_accepted += 1);
                Outcome::Applied(frame_id)
            }
            Ok(None) => {
                self.count(|stats| stats.can_frames_ignored += 1);
                Outcome::Ignored(id)
            }
            Err(err @ TelemetryError::ShortPayload { .. }) => {
                self.count(|stats| stats.can_frames_malformed += 1);
                Outcome::Discarded(err)
            }
            Err(err @ TelemetryError::ResetMarker(_)) => {
                debug!("{}", err);
                self.count(|stats| stats.can_reset_markers += 1);
                Outcome::Discarded(err)
            }
            Err(err) => {
                warn!("discarding broadcast frame: {}", err);
                self.writer.update(|s| s.rejected_frames += 1);
                self.count(|stats| stats.can_frames_rejected += 1);
                Outcome::Discarded(err)
            }
        }
    }

    /// Decodes and range-checks one frame. `Ok(None)` for ids we don't consume.
    pub fn decode(
        id: u32,
        data: &[u8],
        alarm_frame: AlarmFrame,
    ) -> Result<Option<Update>, TelemetryError> {
        let frame_id = match u16::try_from(id).ok().and_then(|i| FrameId::try_from(i).ok()) {
            Some(f) => f,
            None => return Ok(None),
        };

        let update = match frame_id {
            FrameId::Limits => {
                let r: Limits = parse(id, data, 8)?;
                if data[..8].iter().all(|b| *b == 0) {
                    return Err(TelemetryError::ResetMarker(id));
                }
                check(id, "charge_voltage", r.charge_voltage, PACK_VOLTAGE)?;
                check(id, "charge_current", r.charge_current, CURRENT_LIMIT)?;
                check(id, "discharge_current", r.discharge_current, CURRENT_LIMIT)?;
                check(id, "discharge_voltage", r.discharge_voltage, PACK_VOLTAGE)?;
                Update::Limits(r)
            }
            FrameId::SocSoh => {
                let r: SocSoh = parse(id, data, 4)?;
                check(id, "soc", r.soc as f64, PERCENT)?;
                check(id, "soh", r.soh as f64, PERCENT)?;
                Update::SocSoh(r)
            }
            FrameId::PackStatus => {
                let r: PackStatus = parse(id, data, 6)?;
                check(id, "voltage", r.voltage, PACK_VOLTAGE)?;
                check(id, "current", r.current, PACK_CURRENT)?;
                check(id, "temperature", r.temperature, TEMPERATURE)?;
                Update::PackStatus(r)
            }
            FrameId::AlarmLegacy | FrameId::AlarmExtended => {
                if frame_id != alarm_frame.id() {
                    return Ok(None);
                }
                if data.len() < 4 {
                    return Err(TelemetryError::ShortPayload { id, len: data.len() });
                }
                // some BMS send 7 bytes; the tail is zero
                let mut padded = [0u8; 8];
                let n = data.len().min(8);
                padded[..n].copy_from_slice(&data[..n]);
                let r: AlarmWord = parse(id, &padded, 8)?;
                Update::Alarm(frame_id, r)
            }
            FrameId::Requests => Update::Requests(parse(id, data, 1)?),
            FrameId::Manufacturer => {
                if data.is_empty() {
                    return Err(TelemetryError::ShortPayload { id, len: 0 });
                }
                Update::Manufacturer(frames::manufacturer(data))
            }
            FrameId::Extremes => {
                let r: Extremes = parse(id, data, 8)?;
                if r.cell_voltage_1 < CELL_RESET_FLOOR && r.cell_voltage_2 < CELL_RESET_FLOOR {
                    return Err(TelemetryError::ResetMarker(id));
                }
                check(id, "temperature_1", r.temperature_1, TEMPERATURE)?;
                check(id, "temperature_2", r.temperature_2, TEMPERATURE)?;
                check(id, "cell_voltage_1", r.cell_voltage_1, CELL_VOLTAGE)?;
                check(id, "cell_voltage_2", r.cell_voltage_2, CELL_VOLTAGE)?;
                Update::Extremes(r)
            }
            FrameId::ExtremeIndices => Update::ExtremeIndices(parse(id, data, 8)?),
        };

        Ok(Some(update))
    }

    fn count<F: FnOnce(&mut crate::stats::Stats)>(&self, f: F) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

impl Update {
    pub fn frame_id(&self) -> FrameId {
        match self {
            Self::Limits(_) => FrameId::Limits,
            Self::SocSoh(_) => FrameId::SocSoh,
            Self::PackStatus(_) => FrameId::PackStatus,
            Self::Alarm(id, _) => *id,
            Self::Requests(_) => FrameId::Requests,
            Self::Manufacturer(_) => FrameId::Manufacturer,
            Self::Extremes(_) => FrameId::Extremes,
            Self::ExtremeIndices(_) => FrameId::ExtremeIndices,
        }
    }

    fn apply(&self, s: &mut StackState) {
        match self {
            Self::Limits(r) => {
                s.charge_voltage_limit = Some(r.charge_voltage);
                s.charge_current_limit = Some(r.charge_current);
                s.discharge_current_limit = Some(r.discharge_current);
                s.discharge_voltage_limit = Some(r.discharge_voltage);
            }
            Self::SocSoh(r) => {
                s.soc = Some(r.soc as f64);
                s.soh = Some(r.soh as f64);
            }
            Self::PackStatus(r) => {
                s.pack_voltage = Some(r.voltage);
                s.pack_current = Some(r.current);
                s.pack_temperature = Some(r.temperature);
            }
            Self::Alarm(id, r) => {
                let legacy = *id == FrameId::AlarmLegacy;
                s.alarm = Some(AlarmFlags {
                    id: u16::from(*id) as u32,
                    raw: r.flags,
                    protections: if legacy { r.legacy_protections() } else { Vec::new() },
                    warnings: if legacy { r.legacy_warnings() } else { Vec::new() },
                });
            }
            Self::Requests(r) => s.requests = Some(RequestFlags::new(r.flags)),
            Self::Manufacturer(name) => s.manufacturer = Some(name.clone()),
            Self::Extremes(r) => {
                s.temperature_min = Some(r.temperature_1.min(r.temperature_2));
                s.temperature_max = Some(r.temperature_1.max(r.temperature_2));
                s.cell_voltage_min = Some(r.cell_voltage_1.min(r.cell_voltage_2));
                s.cell_voltage_max = Some(r.cell_voltage_1.max(r.cell_voltage_2));
            }
            Self::ExtremeIndices(r) => s.extreme_indices = Some([r.a, r.b, r.c, r.d]),
        }
    }
}

fn parse<'a, T: nom_derive::Parse<&'a [u8]>>(
    id: u32,
    data: &'a [u8],
    min_len: usize,
) -> Result<T, TelemetryError> {
    if data.len() < min_len {
        return Err(TelemetryError::ShortPayload { id, len: data.len() });
    }
    frames::parse(data).ok_or(TelemetryError::ShortPayload { id, len: data.len() })
}

fn check(id: u32, field: &'static str, value: f64, (min, max): (f64, f64)) -> Result<(), TelemetryError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(TelemetryError::OutOfRange {
            id,
            field,
            value,
            min,
            max,
        })
    }
}
