//! Single-producer/single-consumer message slots living in shared memory.
//!
//! A slot holds one message at a time. The writer fills the payload and only then raises the
//! `unread` byte (release); the reader checks `unread` (acquire), copies the payload and only then
//! lowers it. A writer facing a raised `unread` byte is refused: the old payload stays intact and
//! the refusal is reported as backpressure on the writer's status slot.
//!
//! Status slots follow different rules: the newest event overwrites an unread one, an event
//! identical to the one already in the slot is dropped, and severe events are followed by a
//! fixed delay on the emitting side.

use std::sync::atomic::{fence, AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use std::mem;

use crate::pubdef::{MsgType, Origin, StatusCode};



/// Wire image of a regular message.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RawMessage {
    pub tag: u8,
    pub unread: u8,
    pub msg_type: u8,
    pub reserved: u8,
    pub value: [u32; 2],
}

/// Wire image of a sync reply.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RawSyncReply {
    pub tag: u8,
    pub unread: u8,
    pub msg_type: u8,
    pub reserved: u8,
    pub sync_interval_ticks: u32,
    pub sample_interval_ticks: u32,
    pub compensation_steps: u32,
    pub next_timestamp_ns: u64,
}

const _: () = assert!(mem::size_of::<RawMessage>() == 12);
const _: () = assert!(mem::size_of::<RawSyncReply>() == 24);
const _: () = assert!(mem::size_of::<MessageSlot>() == mem::size_of::<RawMessage>());
const _: () = assert!(mem::size_of::<SyncReplySlot>() == mem::size_of::<RawSyncReply>());

impl RawMessage {
    pub fn to_bytes(&self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&[self.tag, self.unread, self.msg_type, self.reserved]);
        bytes[4..8].copy_from_slice(&self.value[0].to_le_bytes());
        bytes[8..12].copy_from_slice(&self.value[1].to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 12]) -> RawMessage {
        RawMessage {
            tag: bytes[0],
            unread: bytes[1],
            msg_type: bytes[2],
            reserved: bytes[3],
            value: [read_u32(bytes, 4), read_u32(bytes, 8)],
        }
    }
}

impl RawSyncReply {
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut bytes = [0u8; 24];
        bytes[..4].copy_from_slice(&[self.tag, self.unread, self.msg_type, self.reserved]);
        bytes[4..8].copy_from_slice(&self.sync_interval_ticks.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.sample_interval_ticks.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.compensation_steps.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.next_timestamp_ns.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 24]) -> RawSyncReply {
        RawSyncReply {
            tag: bytes[0],
            unread: bytes[1],
            msg_type: bytes[2],
            reserved: bytes[3],
            sync_interval_ticks: read_u32(bytes, 4),
            sample_interval_ticks: read_u32(bytes, 8),
            compensation_steps: read_u32(bytes, 12),
            next_timestamp_ns: read_u32(bytes, 16) as u64 | (read_u32(bytes, 20) as u64) << 32,
        }
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}



/// A decoded regular message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub origin: Origin,
    pub msg_type: MsgType,
    pub value: [u32; 2],
}

/// Reply of the host to a sync request.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReply {
    /// IEP compare value for the next period, nominal period plus correction.
    pub sync_interval_ticks: u32,
    /// Integer part of the per-sample interval.
    pub sample_interval_ticks: u32,
    /// Number of samples of the next period that get one extra tick.
    pub compensation_steps: u32,
    /// Timestamp of the next period boundary.
    pub next_timestamp_ns: u64,
}

impl SyncReply {
    fn to_words(&self) -> [u32; 5] {
        [self.sync_interval_ticks,
         self.sample_interval_ticks,
         self.compensation_steps,
         self.next_timestamp_ns as u32,
         (self.next_timestamp_ns >> 32) as u32]
    }

    fn from_words(words: [u32; 5]) -> SyncReply {
        SyncReply {
            sync_interval_ticks: words[0],
            sample_interval_ticks: words[1],
            compensation_steps: words[2],
            next_timestamp_ns: words[3] as u64 | (words[4] as u64) << 32,
        }
    }
}

/// A status event as seen by the supervisor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusEvent {
    pub origin: Origin,
    pub code: StatusCode,
    pub value: [u32; 2],
}



/// Refused send; the message is handed back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// The previous message is still unread.
    Full(T),
}

/// Failed receive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    /// The tag does not belong to the expected sender; the message was discarded.
    Corrupted { tag: u8 },
    /// The tag is right but the type byte is unknown or not allowed on this slot.
    InvalidType { msg_type: u8 },
}



/// A message slot with `W` payload words.
#[repr(C)]
#[derive(Debug)]
pub struct Slot<const W: usize> {
    tag: AtomicU8,
    unread: AtomicU8,
    msg_type: AtomicU8,
    reserved: AtomicU8,
    value: [AtomicU32; W],
}

pub type MessageSlot = Slot<2>;

pub type SyncReplySlot = Slot<5>;

impl<const W: usize> Slot<W> {
    pub fn new() -> Self {
        Slot {
            tag: AtomicU8::new(0),
            unread: AtomicU8::new(0),
            msg_type: AtomicU8::new(0),
            reserved: AtomicU8::new(0),
            value: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    /// Writes a message unless the previous one is unread.
    fn try_write(&self, tag: u8, msg_type: u8, words: [u32; W]) -> bool {
        if self.unread.load(Ordering::Acquire) != 0 {
            return false;
        }
        for (cell, word) in self.value.iter().zip(words.iter()) {
            cell.store(*word, Ordering::Relaxed);
        }
        self.msg_type.store(msg_type, Ordering::Relaxed);
        self.tag.store(tag, Ordering::Relaxed);
        self.unread.store(1, Ordering::Release);
        true
    }

    /// Copies an unread message out and marks the slot as read.
    fn try_take(&self) -> Option<(u8, u8, [u32; W])> {
        if self.unread.load(Ordering::Acquire) == 0 {
            return None;
        }
        let words: [u32; W] = std::array::from_fn(|i| self.value[i].load(Ordering::Relaxed));
        let msg_type = self.msg_type.load(Ordering::Relaxed);
        let tag = self.tag.load(Ordering::Relaxed);
        self.unread.store(0, Ordering::Release);
        Some((tag, msg_type, words))
    }

    /// Returns true if a message is waiting.
    pub fn is_unread(&self) -> bool {
        self.unread.load(Ordering::Acquire) != 0
    }

    /// Clears the slot on session reset.
    pub(crate) fn clear(&self) {
        self.unread.store(0, Ordering::Release);
        self.tag.store(0, Ordering::Relaxed);
        self.msg_type.store(0, Ordering::Relaxed);
        for cell in self.value.iter() {
            cell.store(0, Ordering::Relaxed);
        }
    }

    /// Current byte image of the slot, as laid out in shared memory.
    pub fn wire_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![
            self.tag.load(Ordering::Relaxed),
            self.unread.load(Ordering::Relaxed),
            self.msg_type.load(Ordering::Relaxed),
            self.reserved.load(Ordering::Relaxed),
        ];
        for cell in self.value.iter() {
            bytes.extend_from_slice(&cell.load(Ordering::Relaxed).to_le_bytes());
        }
        bytes
    }

    /// Overwrites the tag byte; only used to inject corruption in tests.
    #[cfg(test)]
    pub(crate) fn poke_tag(&self, tag: u8) {
        self.tag.store(tag, Ordering::Relaxed);
    }
}



/// Writer end of a slot. There is exactly one per slot.
pub struct Sender<'a, const W: usize> {
    slot: &'a Slot<W>,
    origin: Origin,
    status: StatusReporter<'a>,
}

impl<'a, const W: usize> Sender<'a, W> {
    pub(crate) fn new(slot: &'a Slot<W>, origin: Origin, status: StatusReporter<'a>)
        -> Sender<'a, W> {
        Sender { slot: slot, origin: origin, status: status }
    }

    fn try_send_words(&self, msg_type: MsgType, words: [u32; W]) -> bool {
        self.slot.try_write(self.origin as u8, msg_type as u8, words)
    }

    /// Returns true if the receiver has not consumed the last message yet.
    pub fn is_pending(&self) -> bool {
        self.slot.is_unread()
    }
}

impl<'a> Sender<'a, 2> {
    /// Attempts to write a message without reporting a refusal.
    pub fn try_send(&self, msg_type: MsgType, v1: u32, v2: u32)
        -> Result<(), TrySendError<(MsgType, u32, u32)>> {
        if self.try_send_words(msg_type, [v1, v2]) {
            Ok(())
        } else {
            Err(TrySendError::Full((msg_type, v1, v2)))
        }
    }

    /// Writes a message, or reports backpressure and returns false.
    pub fn send(&self, msg_type: MsgType, v1: u32, v2: u32) -> bool {
        match self.try_send(msg_type, v1, v2) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.status.report(StatusCode::Backpressure, msg_type as u32, v1);
                false
            }
        }
    }
}

impl<'a> Sender<'a, 5> {
    pub fn try_send_reply(&self, reply: &SyncReply) -> Result<(), TrySendError<SyncReply>> {
        if self.try_send_words(MsgType::SyncReply, reply.to_words()) {
            Ok(())
        } else {
            Err(TrySendError::Full(*reply))
        }
    }

    /// Writes a sync reply, or reports backpressure and returns false.
    pub fn send_reply(&self, reply: &SyncReply) -> bool {
        match self.try_send_reply(reply) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.status.report(StatusCode::Backpressure, MsgType::SyncReply as u32,
                                   reply.sync_interval_ticks);
                false
            }
        }
    }
}



/// Reader end of a slot. There is exactly one per slot.
pub struct Receiver<'a, const W: usize> {
    slot: &'a Slot<W>,
    expected: Origin,
    status: StatusReporter<'a>,
}

impl<'a, const W: usize> Receiver<'a, W> {
    pub(crate) fn new(slot: &'a Slot<W>, expected: Origin, status: StatusReporter<'a>)
        -> Receiver<'a, W> {
        Receiver { slot: slot, expected: expected, status: status }
    }

    fn try_take(&self) -> Result<(MsgType, [u32; W]), TryRecvError> {
        let (tag, msg_type, words) = match self.slot.try_take() {
            Some(m) => m,
            None => return Err(TryRecvError::Empty),
        };
        if tag != self.expected as u8 {
            return Err(TryRecvError::Corrupted { tag: tag });
        }
        match MsgType::from_u8(msg_type) {
            Some(t) if t != MsgType::None => Ok((t, words)),
            _ => Err(TryRecvError::InvalidType { msg_type: msg_type }),
        }
    }

    fn report(&self, err: TryRecvError) {
        match err {
            TryRecvError::Empty => {}
            TryRecvError::Corrupted { tag } => {
                self.status.report(StatusCode::MemoryCorruption, tag as u32, self.expected as u32);
            }
            TryRecvError::InvalidType { msg_type } => {
                self.status.report(StatusCode::InvalidCommand, msg_type as u32, 0);
            }
        }
    }
}

impl<'a> Receiver<'a, 2> {
    /// Consumes a waiting message without reporting failures.
    pub fn try_receive(&self) -> Result<Message, TryRecvError> {
        self.try_take().map(|(msg_type, value)| {
            Message { origin: self.expected, msg_type: msg_type, value: value }
        })
    }

    /// Consumes a waiting message; corrupted or malformed messages are reported and dropped.
    pub fn receive(&self) -> Option<Message> {
        match self.try_receive() {
            Ok(m) => Some(m),
            Err(e) => {
                self.report(e);
                None
            }
        }
    }
}

impl<'a> Receiver<'a, 5> {
    pub fn try_receive_reply(&self) -> Result<SyncReply, TryRecvError> {
        match self.try_take()? {
            (MsgType::SyncReply, words) => Ok(SyncReply::from_words(words)),
            (other, _) => Err(TryRecvError::InvalidType { msg_type: other as u8 }),
        }
    }

    pub fn receive_reply(&self) -> Option<SyncReply> {
        match self.try_receive_reply() {
            Ok(r) => Some(r),
            Err(e) => {
                self.report(e);
                None
            }
        }
    }
}



/// A status slot: one message slot plus a sequence counter for torn-read detection.
///
/// The reader remembers the sequence number of the last event it took; an event is pending
/// while the published sequence differs from it. The `unread` byte mirrors that for the wire
/// image only.
#[repr(C)]
#[derive(Debug)]
pub struct StatusSlot {
    slot: Slot<2>,
    seq: AtomicU32,
    // Reader side only.
    delivered: AtomicU32,
}

impl StatusSlot {
    pub fn new() -> StatusSlot {
        StatusSlot { slot: Slot::new(), seq: AtomicU32::new(0), delivered: AtomicU32::new(0) }
    }

    pub(crate) fn clear(&self) {
        self.slot.clear();
        self.delivered.store(self.seq.load(Ordering::Acquire), Ordering::Relaxed);
    }

    fn holds(&self, tag: u8, code: StatusCode, v1: u32, v2: u32) -> bool {
        self.slot.tag.load(Ordering::Relaxed) == tag
            && self.slot.msg_type.load(Ordering::Relaxed) == code as u8
            && self.slot.value[0].load(Ordering::Relaxed) == v1
            && self.slot.value[1].load(Ordering::Relaxed) == v2
    }

    fn overwrite(&self, tag: u8, code: StatusCode, v1: u32, v2: u32) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.slot.value[0].store(v1, Ordering::Relaxed);
        self.slot.value[1].store(v2, Ordering::Relaxed);
        self.slot.msg_type.store(code as u8, Ordering::Relaxed);
        self.slot.tag.store(tag, Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
        self.slot.unread.store(1, Ordering::Release);
    }

    fn take(&self) -> Option<(u8, u8, [u32; 2])> {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            if before == self.delivered.load(Ordering::Relaxed) {
                return None;
            }
            let tag = self.slot.tag.load(Ordering::Relaxed);
            let code = self.slot.msg_type.load(Ordering::Relaxed);
            let value = [self.slot.value[0].load(Ordering::Relaxed),
                         self.slot.value[1].load(Ordering::Relaxed)];
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) != before {
                continue;
            }
            self.delivered.store(before, Ordering::Relaxed);
            self.slot.unread.store(0, Ordering::Release);
            // A newer event may have raised the byte in the meantime.
            if self.seq.load(Ordering::Acquire) != before {
                self.slot.unread.store(1, Ordering::Release);
            }
            return Some((tag, code, value));
        }
    }
}



/// Writer end of an actor's status slot.
///
/// Every mailbox end of an actor holds a copy; they all run on the actor's own loop.
#[derive(Copy, Clone)]
pub struct StatusReporter<'a> {
    slot: &'a StatusSlot,
    origin: Origin,
    severe_delay: Duration,
}

impl<'a> StatusReporter<'a> {
    pub(crate) fn new(slot: &'a StatusSlot, origin: Origin, severe_delay: Duration)
        -> StatusReporter<'a> {
        StatusReporter { slot: slot, origin: origin, severe_delay: severe_delay }
    }

    /// Publishes a status event and returns true, unless the slot already holds the very same
    /// event.
    pub fn report(&self, code: StatusCode, v1: u32, v2: u32) -> bool {
        let tag = self.origin as u8;
        if self.slot.holds(tag, code, v1, v2) {
            return false;
        }
        self.slot.overwrite(tag, code, v1, v2);
        if code.is_severe() {
            spin_for(self.severe_delay);
        }
        true
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }
}

/// Busy-waits for a bounded duration.
fn spin_for(delay: Duration) {
    if delay == Duration::ZERO {
        return;
    }
    let start = Instant::now();
    while start.elapsed() < delay {
        std::hint::spin_loop();
    }
}



/// Reader end of an actor's status slot, owned by the host.
pub struct StatusReceiver<'a> {
    slot: &'a StatusSlot,
    expected: Origin,
}

impl<'a> StatusReceiver<'a> {
    pub(crate) fn new(slot: &'a StatusSlot, expected: Origin) -> StatusReceiver<'a> {
        StatusReceiver { slot: slot, expected: expected }
    }

    /// Takes the pending status event, if any.
    ///
    /// An event whose tag or code is invalid is itself turned into a memory corruption event.
    pub fn poll(&self) -> Option<StatusEvent> {
        let (tag, code, value) = self.slot.take()?;
        match StatusCode::from_u8(code) {
            Some(code) if tag == self.expected as u8 => {
                Some(StatusEvent { origin: self.expected, code: code, value: value })
            }
            _ => Some(StatusEvent {
                origin: self.expected,
                code: StatusCode::MemoryCorruption,
                value: [tag as u32, code as u32],
            }),
        }
    }
}
