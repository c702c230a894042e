use crate::engine::responder;
use crate::error::{CodecError, PayloadError};
use crate::pylon::frame::{self, Command, ReturnCode};
use crate::pylon::payload::{self, AlarmData, AnalogData};
use crate::state::{StackState, UnitState};
use crate::utils::Utils;

use enum_dispatch::*;

/// Upper bound on transient transitions taken for one event.
const MAX_TRANSITIONS: usize = 8;

// Settings {{{
#[derive(Clone, Debug, PartialEq)]
pub struct Identity {
    pub manufacturer: String,
    pub firmware: String,
    pub serial_number: String,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            manufacturer: "PYLONTECH".to_string(),
            firmware: "V1.0".to_string(),
            serial_number: "FAKE00001".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// frame ADDR we poll, or answer as
    pub address: u8,
    pub batteries: u8,
    pub response_window_ms: u32,
    pub response_budget_ms: u32,
    pub poll_interval_ms: u32,
    /// first request plus retries
    pub max_attempts: u8,
    pub stale_after_ms: u32,
    pub capacity_ah: f64,
    pub identity: Identity,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            address: 2,
            batteries: 1,
            response_window_ms: 300,
            response_budget_ms: 500,
            poll_interval_ms: 5000,
            max_attempts: 2,
            stale_after_ms: 30_000,
            capacity_ah: 100.0,
            identity: Identity::default(),
        }
    }
} // }}}

// States and events {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PollKind {
    Analog,
    Alarm,
}

impl PollKind {
    pub fn command(self) -> Command {
        match self {
            Self::Analog => Command::GetAnalog,
            Self::Alarm => Command::GetAlarm,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Exchange {
    Poll {
        target: u8,
        kind: PollKind,
        attempt: u8,
    },
    Reply,
}

impl Exchange {
    fn first() -> Self {
        Self::Poll {
            target: 0,
            kind: PollKind::Analog,
            attempt: 1,
        }
    }

    /// Analog then Alarm for each target in turn; `None` once the cycle is done.
    fn next(self, batteries: u8) -> Option<Self> {
        match self {
            Self::Poll {
                target,
                kind: PollKind::Analog,
                ..
            } => Some(Self::Poll {
                target,
                kind: PollKind::Alarm,
                attempt: 1,
            }),
            Self::Poll {
                target,
                kind: PollKind::Alarm,
                ..
            } if target + 1 < batteries => Some(Self::Poll {
                target: target + 1,
                kind: PollKind::Analog,
                attempt: 1,
            }),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum State {
    Idle {
        since: Option<u32>,
    },
    SendRequest {
        exchange: Exchange,
    },
    AwaitResponse {
        exchange: Exchange,
        sent_at: u32,
    },
    ParseResponse {
        exchange: Exchange,
        raw: Vec<u8>,
        received_at: u32,
    },
    NextTarget {
        exchange: Exchange,
    },
}

impl State {
    /// Transient states are left within the same step; the rest wait for
    /// time or bytes.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SendRequest { .. } | Self::ParseResponse { .. } | Self::NextTarget { .. }
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Tick,
    /// one complete `~...\r` frame and the tick it finished arriving on
    Frame { raw: Vec<u8>, received_at: u32 },
}

/// Snapshot of everything a step may read.
pub struct Context<'a> {
    pub now: u32,
    pub stack: &'a StackState,
    pub unit0: Option<&'a UnitState>,
}
// }}}

// Effects {{{
#[derive(Clone, Debug, PartialEq)]
pub enum Failure {
    Timeout,
    Codec(CodecError),
    Payload(PayloadError),
    Rejected(u8),
    Mismatch(&'static str),
}

impl Failure {
    pub fn is_checksum(&self) -> bool {
        matches!(self, Self::Codec(CodecError::BadChecksum { .. }))
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "no response within window"),
            Self::Codec(e) => write!(f, "{}", e),
            Self::Payload(e) => write!(f, "{}", e),
            Self::Rejected(rtn) => write!(f, "unit answered RTN 0x{:02X}", rtn),
            Self::Mismatch(field) => write!(f, "response {} does not match request", field),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DropReason {
    Malformed(CodecError),
    ForeignAddress(u8),
    ForeignDevice(u8),
    Late { elapsed: u32 },
    NoData(Command),
    Payload(PayloadError),
    Unsolicited,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed request: {}", e),
            Self::ForeignAddress(a) => write!(f, "request for address {}", a),
            Self::ForeignDevice(c) => write!(f, "request for device type 0x{:02X}", c),
            Self::Late { elapsed } => write!(f, "request {}ms old, budget exceeded", elapsed),
            Self::NoData(c) => write!(f, "no fresh data for {:?}", c),
            Self::Payload(e) => write!(f, "cannot encode reply: {}", e),
            Self::Unsolicited => write!(f, "unsolicited frame"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    Transmit(Vec<u8>),
    Analog { target: u8, data: AnalogData },
    Alarm { target: u8, data: AlarmData },
    MarkStale(u8),
    Retry { target: u8, kind: PollKind, reason: Failure },
    Failed { target: u8, kind: PollKind, reason: Failure },
    CycleComplete,
    /// `None` when the command was unknown and RTN 04 went out
    Replied(Option<Command>),
    Dropped(DropReason),
}
// }}}

// Roles {{{
#[enum_dispatch]
pub trait Step {
    /// One transition. `event` is only offered to the first transition of a step.
    fn advance(
        &self,
        state: State,
        event: Option<Event>,
        ctx: &Context,
        settings: &Settings,
        effects: &mut Vec<Effect>,
    ) -> State;
}

/// Polls real units.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Active;

/// Answers an inverter's queries from cached telemetry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Passive;

#[enum_dispatch(Step)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Active(Active),
    Passive(Passive),
}

enum Reading {
    Analog(AnalogData),
    Alarm(AlarmData),
}

impl Step for Active {
    fn advance(
        &self,
        state: State,
        event: Option<Event>,
        ctx: &Context,
        settings: &Settings,
        effects: &mut Vec<Effect>,
    ) -> State {
        match (state, event) {
            (State::Idle { since }, Some(Event::Frame { .. })) => {
                effects.push(Effect::Dropped(DropReason::Unsolicited));
                State::Idle { since }
            }
            (State::Idle { since }, _) => {
                let due = since
                    .map_or(true, |t| Utils::elapsed_ms(ctx.now, t) >= settings.poll_interval_ms);
                if due && settings.batteries > 0 {
                    State::SendRequest {
                        exchange: Exchange::first(),
                    }
                } else {
                    State::Idle { since }
                }
            }

            (State::SendRequest { exchange }, _) => {
                let (target, kind) = match exchange {
                    Exchange::Poll { target, kind, .. } => (target, kind),
                    Exchange::Reply => return State::Idle { since: None },
                };
                let info = format!("{:02X}", target);
                match frame::encode(settings.address, frame::CID1_BATTERY, kind.command().into(), &info) {
                    Ok(bytes) => {
                        effects.push(Effect::Transmit(bytes));
                        State::AwaitResponse {
                            exchange,
                            sent_at: ctx.now,
                        }
                    }
                    Err(e) => {
                        effects.push(Effect::Failed {
                            target,
                            kind,
                            reason: Failure::Codec(e),
                        });
                        State::NextTarget { exchange }
                    }
                }
            }

            (State::AwaitResponse { exchange, .. }, Some(Event::Frame { raw, received_at })) => {
                State::ParseResponse {
                    exchange,
                    raw,
                    received_at,
                }
            }
            (State::AwaitResponse { exchange, sent_at }, _) => {
                if Utils::elapsed_ms(ctx.now, sent_at) >= settings.response_window_ms {
                    self.fail(exchange, Failure::Timeout, settings, effects)
                } else {
                    State::AwaitResponse { exchange, sent_at }
                }
            }

            (State::ParseResponse { exchange, raw, .. }, _) => {
                let (target, kind) = match exchange {
                    Exchange::Poll { target, kind, .. } => (target, kind),
                    Exchange::Reply => return State::Idle { since: None },
                };
                match parse_reading(&raw, target, kind, settings) {
                    Ok(Reading::Analog(data)) => {
                        effects.push(Effect::Analog { target, data });
                        State::NextTarget { exchange }
                    }
                    Ok(Reading::Alarm(data)) => {
                        effects.push(Effect::Alarm { target, data });
                        State::NextTarget { exchange }
                    }
                    Err(reason) => self.fail(exchange, reason, settings, effects),
                }
            }

            (State::NextTarget { exchange }, _) => match exchange.next(settings.batteries) {
                Some(next) => State::SendRequest { exchange: next },
                None => {
                    effects.push(Effect::CycleComplete);
                    State::Idle {
                        since: Some(ctx.now),
                    }
                }
            },
        }
    }
}

impl Active {
    fn fail(
        &self,
        exchange: Exchange,
        reason: Failure,
        settings: &Settings,
        effects: &mut Vec<Effect>,
    ) -> State {
        let (target, kind, attempt) = match exchange {
            Exchange::Poll {
                target,
                kind,
                attempt,
            } => (target, kind, attempt),
            Exchange::Reply => return State::Idle { since: None },
        };

        effects.push(Effect::MarkStale(target));

        if attempt < settings.max_attempts {
            effects.push(Effect::Retry {
                target,
                kind,
                reason,
            });
            State::SendRequest {
                exchange: Exchange::Poll {
                    target,
                    kind,
                    attempt: attempt + 1,
                },
            }
        } else {
            effects.push(Effect::Failed {
                target,
                kind,
                reason,
            });
            State::NextTarget { exchange }
        }
    }
}

fn parse_reading(
    raw: &[u8],
    target: u8,
    kind: PollKind,
    settings: &Settings,
) -> Result<Reading, Failure> {
    let response = frame::decode(raw).map_err(Failure::Codec)?;

    if response.address != settings.address {
        return Err(Failure::Mismatch("address"));
    }
    if response.return_code() != Some(ReturnCode::Normal) {
        return Err(Failure::Rejected(response.cid2));
    }

    let reading = match kind {
        PollKind::Analog => {
            let data = payload::decode_analog(&response.info).map_err(Failure::Payload)?;
            if data.battery != target {
                return Err(Failure::Mismatch("battery number"));
            }
            Reading::Analog(data)
        }
        PollKind::Alarm => {
            let data = payload::decode_alarm(&response.info).map_err(Failure::Payload)?;
            if data.battery != target {
                return Err(Failure::Mismatch("battery number"));
            }
            Reading::Alarm(data)
        }
    };

    Ok(reading)
}

impl Step for Passive {
    fn advance(
        &self,
        state: State,
        event: Option<Event>,
        ctx: &Context,
        settings: &Settings,
        effects: &mut Vec<Effect>,
    ) -> State {
        match (state, event) {
            (State::Idle { .. }, Some(Event::Frame { raw, received_at })) => {
                State::ParseResponse {
                    exchange: Exchange::Reply,
                    raw,
                    received_at,
                }
            }
            (State::ParseResponse { raw, received_at, .. }, _) => {
                match reply(&raw, received_at, ctx, settings) {
                    Ok((bytes, command)) => {
                        effects.push(Effect::Transmit(bytes));
                        effects.push(Effect::Replied(command));
                    }
                    Err(reason) => effects.push(Effect::Dropped(reason)),
                }
                State::Idle {
                    since: Some(ctx.now),
                }
            }
            (State::Idle { since }, _) => State::Idle { since },
            // passive never sends requests of its own
            _ => State::Idle { since: None },
        }
    }
}

fn reply(
    raw: &[u8],
    received_at: u32,
    ctx: &Context,
    settings: &Settings,
) -> Result<(Vec<u8>, Option<Command>), DropReason> {
    let elapsed = Utils::elapsed_ms(ctx.now, received_at);
    if elapsed > settings.response_budget_ms {
        return Err(DropReason::Late { elapsed });
    }

    let request = frame::decode(raw).map_err(DropReason::Malformed)?;
    if request.address != settings.address {
        return Err(DropReason::ForeignAddress(request.address));
    }
    if request.cid1 != frame::CID1_BATTERY {
        return Err(DropReason::ForeignDevice(request.cid1));
    }

    let (response, command) = responder::respond(&request, ctx, settings)?;
    let bytes = response
        .encode()
        .map_err(|e| DropReason::Payload(PayloadError::Codec(e)))?;

    Ok((bytes, command))
}
// }}}

/// The engine's pure core: feed it events, get back effects to perform.
#[derive(Clone, Debug)]
pub struct Machine {
    role: Role,
    settings: Settings,
    state: State,
}

impl Machine {
    pub fn new(role: Role, settings: Settings) -> Self {
        Self {
            role,
            settings,
            state: State::Idle { since: None },
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn step(&mut self, event: Event, ctx: &Context) -> Vec<Effect> {
        let mut effects = Vec::new();
        let state = std::mem::replace(&mut self.state, State::Idle { since: None });

        let mut state = self
            .role
            .advance(state, Some(event), ctx, &self.settings, &mut effects);
        let mut transitions = 1;
        while state.is_transient() && transitions < MAX_TRANSITIONS {
            state = self
                .role
                .advance(state, None, ctx, &self.settings, &mut effects);
            transitions += 1;
        }

        self.state = state;
        effects
    }
}
