use serde::Deserialize;


/// Sender class stamped into every mailbox message.
///
/// A receiver knows which actor may legitimately write the slot it reads; any other tag means
/// the shared memory was overwritten by someone else.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    Host = 0xa5,
    Pru0 = 0x50,
    Pru1 = 0x51,
}

impl Origin {
    /// Decodes a raw tag byte.
    pub fn from_u8(tag: u8) -> Option<Origin> {
        match tag {
            0xa5 => Some(Origin::Host),
            0x50 => Some(Origin::Pru0),
            0x51 => Some(Origin::Pru1),
            _ => None,
        }
    }
}


/// Mailbox message type.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MsgType {
    None = 0x00,
    /// PRU0 to host: `v1` is the buffer index, `v2` the number of valid samples.
    BufferFilled = 0x10,
    /// PRU1 to host: `v1` is the IEP counter at request time, `v2` the period index.
    SyncRequest = 0x20,
    /// Host to PRU1, extended payload.
    SyncReply = 0x21,
    /// Host to PRU0: echo `v1`/`v2` back (debug passthrough).
    Ping = 0x30,
    /// PRU0 to host: reply to `Ping`.
    Pong = 0x31,
}

impl MsgType {
    /// Decodes a raw type byte.
    pub fn from_u8(raw: u8) -> Option<MsgType> {
        match raw {
            0x00 => Some(MsgType::None),
            0x10 => Some(MsgType::BufferFilled),
            0x20 => Some(MsgType::SyncRequest),
            0x21 => Some(MsgType::SyncReply),
            0x30 => Some(MsgType::Ping),
            0x31 => Some(MsgType::Pong),
            _ => None,
        }
    }
}


/// Status and error events surfaced to the supervisor.
///
/// Status slots carry the code in the message type byte; the values do not overlap `MsgType`.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Restart = 0xf0,
    MemoryCorruption = 0xf1,
    Backpressure = 0xf2,
    BufferPoolExhausted = 0xf3,
    TimestampImplausible = 0xf4,
    SyncStateViolation = 0xf5,
    InvalidCommand = 0xf6,
    ValueOutOfRange = 0xf7,
}

impl StatusCode {
    /// Decodes a raw status byte.
    pub fn from_u8(raw: u8) -> Option<StatusCode> {
        match raw {
            0xf0 => Some(StatusCode::Restart),
            0xf1 => Some(StatusCode::MemoryCorruption),
            0xf2 => Some(StatusCode::Backpressure),
            0xf3 => Some(StatusCode::BufferPoolExhausted),
            0xf4 => Some(StatusCode::TimestampImplausible),
            0xf5 => Some(StatusCode::SyncStateViolation),
            0xf6 => Some(StatusCode::InvalidCommand),
            0xf7 => Some(StatusCode::ValueOutOfRange),
            _ => None,
        }
    }

    /// Severe classes are followed by a rate-limiting delay on the emitting side.
    pub fn is_severe(self) -> bool {
        match self {
            StatusCode::MemoryCorruption
            | StatusCode::Backpressure
            | StatusCode::SyncStateViolation => true,
            _ => false,
        }
    }
}


/// Session state as published by the host.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle = 0,
    Armed = 1,
    Running = 2,
    Reset = 3,
    Fault = 4,
}

impl SessionState {
    pub fn from_u32(raw: u32) -> Option<SessionState> {
        match raw {
            0 => Some(SessionState::Idle),
            1 => Some(SessionState::Armed),
            2 => Some(SessionState::Running),
            3 => Some(SessionState::Reset),
            4 => Some(SessionState::Fault),
            _ => None,
        }
    }

    /// Returns true if the host may move the session from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (_, Fault) => true,
            (Idle, Armed) | (Armed, Running) | (Armed, Idle) => true,
            (Running, Reset) | (Armed, Reset) | (Fault, Reset) | (Idle, Reset) => true,
            (Reset, Idle) => true,
            _ => false,
        }
    }
}


/// Which engine phases execute on every sample tick.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Harvest = 0,
    Emulate = 1,
    DebugPassthrough = 2,
    Disabled = 3,
}

impl Mode {
    pub fn from_u32(raw: u32) -> Option<Mode> {
        match raw {
            0 => Some(Mode::Harvest),
            1 => Some(Mode::Emulate),
            2 => Some(Mode::DebugPassthrough),
            3 => Some(Mode::Disabled),
            _ => None,
        }
    }
}

impl Default for Mode {
    fn default() -> Mode {
        Mode::Emulate
    }
}


/// DAC output channels driven by PRU0.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DacChannel {
    /// Harvester setpoint (input side).
    Harvester,
    /// Emulated supply voltage (target side).
    Target,
}
