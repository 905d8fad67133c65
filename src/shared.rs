//! The shared-memory arena and the per-actor views of it.
//!
//! [`SharedMem`] is the one structure touched by the host and both PRUs. It is never handed out
//! mutably: [`SharedMem::split`] produces one set of ports per actor, and each field can only be
//! written through the port of its designated writer:
//!
//! | field                  | writer   | reader        |
//! |------------------------|----------|---------------|
//! | session state, mode    | host     | PRU0, PRU1    |
//! | reset acks             | PRU0/1   | host          |
//! | sync trigger           | host     | PRU1          |
//! | swap/sample triggers   | PRU1     | PRU0          |
//! | free ring tail         | host     | PRU0          |
//! | free ring head         | PRU0     | host          |
//! | `pru0_to_host`         | PRU0     | host          |
//! | `host_to_pru0`         | host     | PRU0          |
//! | `pru1_to_host`         | PRU1     | host          |
//! | `host_to_pru1`         | host     | PRU1          |
//! | status slots           | owner    | host          |
//! | edge target            | PRU0 (swap), PRU1 (append) under the spin lock |

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read};
use std::mem;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::buffer::{
    detach_edge_target, record_edge, swap_edge_target, BufferHandle, BufferMeta, BufferOwner,
    BufferPool, EdgeEvent, EdgeLock, EdgeTarget, FilledBuffer, FreeRing,
};
use crate::def::{CANARY_VALUE_U32, DRAM2_OFFSET, DRAM2_SIZE};
use crate::error::Error;
use crate::mailbox::{
    Message, MessageSlot, Receiver, Sender, StatusReceiver, StatusReporter, StatusSlot,
    SyncReplySlot,
};
use crate::pubdef::{Mode, MsgType, Origin, SessionState, StatusCode};
use crate::util::{AtomicFlag, SpinLock};
use crate::Result;



/// The shared arena.
#[repr(C)]
pub struct SharedMem {
    canary: AtomicU32,
    session_state: AtomicU32,
    mode: AtomicU32,

    pru0_reset_ack: AtomicFlag,
    pru1_reset_ack: AtomicFlag,
    sync_trigger: AtomicFlag,
    buffer_swap_trigger: AtomicFlag,
    sample_trigger: AtomicFlag,
    // Timestamp of the period announced by the last swap trigger.
    buffer_timestamp_ns: AtomicU64,

    pru0_to_host: MessageSlot,
    host_to_pru0: MessageSlot,
    pru1_to_host: MessageSlot,
    host_to_pru1: SyncReplySlot,

    host_status: StatusSlot,
    pru0_status: StatusSlot,
    pru1_status: StatusSlot,

    free_ring: FreeRing,
    edge_target: EdgeLock,

    split: AtomicBool,
}

impl SharedMem {
    pub fn new() -> SharedMem {
        SharedMem {
            canary: AtomicU32::new(CANARY_VALUE_U32),
            session_state: AtomicU32::new(SessionState::Idle as u32),
            mode: AtomicU32::new(Mode::default() as u32),
            pru0_reset_ack: AtomicFlag::new(),
            pru1_reset_ack: AtomicFlag::new(),
            sync_trigger: AtomicFlag::new(),
            buffer_swap_trigger: AtomicFlag::new(),
            sample_trigger: AtomicFlag::new(),
            buffer_timestamp_ns: AtomicU64::new(0),
            pru0_to_host: MessageSlot::new(),
            host_to_pru0: MessageSlot::new(),
            pru1_to_host: MessageSlot::new(),
            host_to_pru1: SyncReplySlot::new(),
            host_status: StatusSlot::new(),
            pru0_status: StatusSlot::new(),
            pru1_status: StatusSlot::new(),
            free_ring: FreeRing::new(),
            edge_target: SpinLock::new(EdgeTarget::default()),
            split: AtomicBool::new(false),
        }
    }

    pub fn check_canary(&self) -> Result<()> {
        let found = self.canary.load(Ordering::Acquire);
        if found != CANARY_VALUE_U32 {
            return Err(Error::CanaryMismatch { expected: CANARY_VALUE_U32, found: found });
        }
        Ok(())
    }

    pub fn session_state(&self) -> SessionState {
        // An unknown value can only come from a corrupted arena.
        SessionState::from_u32(self.session_state.load(Ordering::Acquire))
            .unwrap_or(SessionState::Fault)
    }

    pub fn mode(&self) -> Mode {
        Mode::from_u32(self.mode.load(Ordering::Acquire)).unwrap_or(Mode::Disabled)
    }

    pub fn free_ring(&self) -> &FreeRing {
        &self.free_ring
    }

    /// Splits the arena into the ports of the three actors and fills the free ring with every
    /// buffer of `pool`.
    ///
    /// An arena can only be split once, and a pool only serves one arena.
    pub fn split<'a>(&'a self, pool: &'a BufferPool, severe_delay: Duration) -> Result<Ports<'a>> {
        self.check_canary()?;
        if self.split.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyInstantiated);
        }
        if let Err(e) = pool.attach() {
            self.split.store(false, Ordering::Release);
            return Err(e);
        }
        self.clear_channels();
        self.refill_ring(pool);

        let host = StatusReporter::new(&self.host_status, Origin::Host, severe_delay);
        let pru0 = StatusReporter::new(&self.pru0_status, Origin::Pru0, severe_delay);
        let pru1 = StatusReporter::new(&self.pru1_status, Origin::Pru1, severe_delay);

        Ok(Ports {
            session: SessionControl { mem: self, pool: pool, status: host },
            pump: PumpPort {
                mem: self,
                pool: pool,
                from_pru0: Receiver::new(&self.pru0_to_host, Origin::Pru0, host),
                to_pru0: Sender::new(&self.host_to_pru0, Origin::Host, host),
                host_status: StatusReceiver::new(&self.host_status, Origin::Host),
                pru0_status: StatusReceiver::new(&self.pru0_status, Origin::Pru0),
                pru1_status: StatusReceiver::new(&self.pru1_status, Origin::Pru1),
                status: host,
            },
            sync: SyncPort {
                mem: self,
                from_pru1: Receiver::new(&self.pru1_to_host, Origin::Pru1, host),
                to_pru1: Sender::new(&self.host_to_pru1, Origin::Host, host),
                status: host,
            },
            pru0: Pru0Port {
                mem: self,
                pool: pool,
                from_host: Receiver::new(&self.host_to_pru0, Origin::Host, pru0),
                to_host: Sender::new(&self.pru0_to_host, Origin::Pru0, pru0),
                status: pru0,
            },
            pru1: Pru1Port {
                mem: self,
                pool: pool,
                to_host: Sender::new(&self.pru1_to_host, Origin::Pru1, pru1),
                from_host: Receiver::new(&self.host_to_pru1, Origin::Host, pru1),
                status: pru1,
            },
        })
    }

    fn clear_channels(&self) {
        self.pru0_to_host.clear();
        self.host_to_pru0.clear();
        self.pru1_to_host.clear();
        self.host_to_pru1.clear();
        self.host_status.clear();
        self.pru0_status.clear();
        self.pru1_status.clear();
        self.pru0_reset_ack.lower();
        self.pru1_reset_ack.lower();
        self.sync_trigger.lower();
        self.buffer_swap_trigger.lower();
        self.sample_trigger.lower();
        *self.edge_target.lock() = EdgeTarget::default();
    }

    fn refill_ring(&self, pool: &BufferPool) {
        self.free_ring.reset();
        for index in 0..pool.len() as u32 {
            if pool.owner(index) == Some(BufferOwner::FreeRing) {
                self.free_ring.push(index);
            }
        }
    }
}

impl Default for SharedMem {
    fn default() -> SharedMem {
        SharedMem::new()
    }
}



/// The ports of all actors.
pub struct Ports<'a> {
    pub session: SessionControl<'a>,
    pub pump: PumpPort<'a>,
    pub sync: SyncPort<'a>,
    pub pru0: Pru0Port<'a>,
    pub pru1: Pru1Port<'a>,
}



/// Host view of the session control fields.
#[derive(Copy, Clone)]
pub struct SessionControl<'a> {
    mem: &'a SharedMem,
    pool: &'a BufferPool,
    status: StatusReporter<'a>,
}

impl<'a> SessionControl<'a> {
    pub fn state(&self) -> SessionState {
        self.mem.session_state()
    }

    pub fn mode(&self) -> Mode {
        self.mem.mode()
    }

    /// Moves the session to `next` if the transition is allowed.
    pub fn set_state(&self, next: SessionState) -> Result<()> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(Error::InvalidTransition { from: current, to: next });
        }
        log::info!("session {:?} -> {:?}", current, next);
        self.mem.session_state.store(next as u32, Ordering::Release);
        Ok(())
    }

    /// Selects the mode; only allowed while the session is not running.
    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        match self.state() {
            SessionState::Idle | SessionState::Armed => {
                log::info!("mode {:?}", mode);
                self.mem.mode.store(mode as u32, Ordering::Release);
                Ok(())
            }
            state => Err(Error::InvalidConfig(format!("cannot change mode while {:?}", state))),
        }
    }

    /// Asks both PRUs to drop their session state.
    pub fn request_reset(&self) -> Result<()> {
        self.set_state(SessionState::Reset)
    }

    /// Returns true once both PRUs acknowledged the reset.
    pub fn reset_acknowledged(&self) -> bool {
        self.mem.pru0_reset_ack.is_raised() && self.mem.pru1_reset_ack.is_raised()
    }

    /// Finishes a reset: clears every channel, refills the free ring and returns to `Idle`.
    ///
    /// Fails with `BuffersHeld` while a producer handle or a host `FilledBuffer` is alive; the
    /// host recycles its buffers and retries.
    pub fn complete_reset(&self) -> Result<()> {
        if self.state() != SessionState::Reset {
            return Err(Error::InvalidTransition { from: self.state(), to: SessionState::Idle });
        }
        if !self.reset_acknowledged() {
            return Err(Error::ResetPending);
        }
        self.pool.reclaim()?;
        self.mem.clear_channels();
        self.mem.refill_ring(self.pool);
        self.status.report(StatusCode::Restart, 0, 0);
        self.set_state(SessionState::Idle)
    }
}



/// Host end of the buffer hand-over and the supervisor inputs.
pub struct PumpPort<'a> {
    mem: &'a SharedMem,
    pool: &'a BufferPool,
    from_pru0: Receiver<'a, 2>,
    to_pru0: Sender<'a, 2>,
    host_status: StatusReceiver<'a>,
    pru0_status: StatusReceiver<'a>,
    pru1_status: StatusReceiver<'a>,
    status: StatusReporter<'a>,
}

impl<'a> PumpPort<'a> {
    pub fn pool(&self) -> &'a BufferPool {
        self.pool
    }

    pub fn free_ring(&self) -> &'a FreeRing {
        &self.mem.free_ring
    }

    pub fn receive(&self) -> Option<Message> {
        self.from_pru0.receive()
    }

    pub fn send(&self, msg_type: MsgType, v1: u32, v2: u32) -> bool {
        self.to_pru0.send(msg_type, v1, v2)
    }

    /// Claims a buffer announced by PRU0; a buffer not in the filled state is reported.
    pub fn claim(&self, index: u32) -> Option<FilledBuffer<'a>> {
        let claimed = self.pool.claim_filled(index);
        if claimed.is_none() {
            let owner = self.pool.owner(index).map(|o| o as u32).unwrap_or(u32::MAX);
            self.status.report(StatusCode::MemoryCorruption, index, owner);
        }
        claimed
    }

    /// Returns a consumed buffer to the free ring.
    pub fn recycle(&self, buffer: FilledBuffer<'a>) -> bool {
        let index = self.pool.release_consumed(buffer);
        let pushed = self.mem.free_ring.push(index);
        if !pushed {
            self.status.report(StatusCode::ValueOutOfRange, index, self.mem.free_ring.len() as u32);
        }
        pushed
    }

    /// Takes the pending status events of all actors, host first.
    pub fn poll_status(&self) -> impl Iterator<Item = crate::mailbox::StatusEvent> {
        [self.host_status.poll(), self.pru0_status.poll(), self.pru1_status.poll()]
            .into_iter()
            .flatten()
    }

    pub fn status(&self) -> StatusReporter<'a> {
        self.status
    }
}



/// Host end of the sync exchange.
pub struct SyncPort<'a> {
    mem: &'a SharedMem,
    from_pru1: Receiver<'a, 2>,
    to_pru1: Sender<'a, 5>,
    status: StatusReporter<'a>,
}

impl<'a> SyncPort<'a> {
    /// Signals PRU1 to stamp its timer.
    pub fn raise_trigger(&self) {
        self.mem.sync_trigger.raise();
    }

    pub fn receiver(&self) -> &Receiver<'a, 2> {
        &self.from_pru1
    }

    pub fn sender(&self) -> &Sender<'a, 5> {
        &self.to_pru1
    }

    pub fn status(&self) -> StatusReporter<'a> {
        self.status
    }

    pub fn session_state(&self) -> SessionState {
        self.mem.session_state()
    }
}



/// PRU0 view: buffer production, sample and swap triggers.
pub struct Pru0Port<'a> {
    mem: &'a SharedMem,
    pool: &'a BufferPool,
    from_host: Receiver<'a, 2>,
    to_host: Sender<'a, 2>,
    status: StatusReporter<'a>,
}

impl<'a> Pru0Port<'a> {
    /// Pops a free buffer, or reports exhaustion and returns `None`.
    pub fn acquire_free_buffer(&self) -> Option<BufferHandle<'a>> {
        let index = match self.mem.free_ring.pop() {
            Some(index) => index,
            None => {
                self.status.report(StatusCode::BufferPoolExhausted, 0, self.pool.len() as u32);
                return None;
            }
        };
        let handle = self.pool.take_for_producer(index);
        if handle.is_none() {
            let owner = self.pool.owner(index).map(|o| o as u32).unwrap_or(u32::MAX);
            self.status.report(StatusCode::MemoryCorruption, index, owner);
        }
        handle
    }

    /// Hands a completed buffer to the host.
    ///
    /// If the host has not read the previous announcement yet, the buffer is given back and
    /// the refusal is reported as backpressure. Edge capture into the buffer stops either way.
    pub fn release_filled_buffer(&self, handle: BufferHandle<'a>, meta: &BufferMeta)
        -> std::result::Result<(), BufferHandle<'a>> {
        detach_edge_target(&self.mem.edge_target, handle.index());
        let (index, count) = self.pool.mark_filled(handle, meta);
        if self.to_host.send(MsgType::BufferFilled, index, count) {
            return Ok(());
        }
        match self.pool.unmark_filled(index) {
            Some(handle) => Err(handle),
            // The host claimed a buffer it was never told about.
            None => {
                self.status.report(StatusCode::MemoryCorruption, index, 0);
                Ok(())
            }
        }
    }

    /// Directs edge capture to `index`, or stops it.
    pub fn swap_edges(&self, index: Option<u32>) {
        swap_edge_target(&self.mem.edge_target, self.pool, index);
    }

    pub fn swap_pending(&self) -> bool {
        self.mem.buffer_swap_trigger.is_raised()
    }

    /// Consumes the swap trigger and returns the timestamp of the new period.
    pub fn take_swap_trigger(&self) -> Option<u64> {
        if self.mem.buffer_swap_trigger.take() {
            Some(self.mem.buffer_timestamp_ns.load(Ordering::Acquire))
        } else {
            None
        }
    }

    pub fn take_sample_trigger(&self) -> bool {
        self.mem.sample_trigger.take()
    }

    pub fn session_state(&self) -> SessionState {
        self.mem.session_state()
    }

    pub fn mode(&self) -> Mode {
        self.mem.mode()
    }

    pub fn acknowledge_reset(&self) {
        self.mem.pru0_reset_ack.raise();
        self.status.report(StatusCode::Restart, 0, 0);
    }

    pub fn receive(&self) -> Option<Message> {
        self.from_host.receive()
    }

    pub fn send(&self, msg_type: MsgType, v1: u32, v2: u32) -> bool {
        self.to_host.send(msg_type, v1, v2)
    }

    pub fn status(&self) -> StatusReporter<'a> {
        self.status
    }
}



/// PRU1 view: timer triggers, sync requests and edge capture.
pub struct Pru1Port<'a> {
    mem: &'a SharedMem,
    pool: &'a BufferPool,
    to_host: Sender<'a, 2>,
    from_host: Receiver<'a, 5>,
    status: StatusReporter<'a>,
}

impl<'a> Pru1Port<'a> {
    pub fn take_sync_trigger(&self) -> bool {
        self.mem.sync_trigger.take()
    }

    /// Announces a new buffer period to PRU0.
    pub fn raise_buffer_swap(&self, timestamp_ns: u64) {
        self.mem.buffer_timestamp_ns.store(timestamp_ns, Ordering::Release);
        self.mem.buffer_swap_trigger.raise();
    }

    pub fn raise_sample(&self) {
        self.mem.sample_trigger.raise();
    }

    pub fn sample_pending(&self) -> bool {
        self.mem.sample_trigger.is_raised()
    }

    /// Returns true while PRU0 has not taken the last swap or sample trigger.
    pub fn triggers_pending(&self) -> bool {
        self.mem.buffer_swap_trigger.is_raised() || self.mem.sample_trigger.is_raised()
    }

    /// Appends an edge to the buffer currently being filled.
    pub fn record_edge(&self, event: EdgeEvent) -> bool {
        record_edge(&self.mem.edge_target, self.pool, event)
    }

    pub fn sender(&self) -> &Sender<'a, 2> {
        &self.to_host
    }

    pub fn receiver(&self) -> &Receiver<'a, 5> {
        &self.from_host
    }

    pub fn session_state(&self) -> SessionState {
        self.mem.session_state()
    }

    pub fn acknowledge_reset(&self) {
        self.mem.pru1_reset_ack.raise();
        self.status.report(StatusCode::Restart, 0, 0);
    }

    pub fn status(&self) -> StatusReporter<'a> {
        self.status
    }
}



/// Memory holding a [`SharedMem`]: the heap for simulation, or the PRU shared RAM.
pub struct SharedRegion {
    backing: Backing,
}

enum Backing {
    Heap(Box<SharedMem>),
    Mapped { _file: SyncFile, map: MemMap, offset: usize },
}

unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    pub fn heap() -> SharedRegion {
        SharedRegion { backing: Backing::Heap(Box::new(SharedMem::new())) }
    }

    /// Maps the PRU memory of a UIO device and initializes the arena in its shared data RAM.
    ///
    /// `size_path` is the sysfs attribute holding the size of the first UIO map.
    pub fn open_uio(device_path: &str, size_path: &str) -> Result<SharedRegion> {
        let available = DRAM2_SIZE;
        let required = mem::size_of::<SharedMem>();
        if required > available {
            return Err(Error::RegionTooSmall { available: available, required: required });
        }
        let map_size = read_map_size(size_path)?;
        if DRAM2_OFFSET + required > map_size {
            return Err(Error::RegionTooSmall {
                available: map_size.saturating_sub(DRAM2_OFFSET),
                required: required,
            });
        }

        let file = SyncFile::new(device_path)?;
        let map = MemMap::new(file.fd, map_size)?;
        unsafe {
            let at = map.base.add(DRAM2_OFFSET) as *mut SharedMem;
            ptr::write(at, SharedMem::new());
        }
        log::info!("shared arena mapped at {:#x} of {}", DRAM2_OFFSET, device_path);
        Ok(SharedRegion {
            backing: Backing::Mapped { _file: file, map: map, offset: DRAM2_OFFSET },
        })
    }
}

impl Deref for SharedRegion {
    type Target = SharedMem;

    fn deref(&self) -> &SharedMem {
        match self.backing {
            Backing::Heap(ref mem) => mem,
            Backing::Mapped { ref map, offset, .. } => unsafe {
                &*(map.base.add(offset) as *const SharedMem)
            },
        }
    }
}

// The sysfs size attribute reads as "0x..." in hexadecimal.
fn read_map_size(path: &str) -> io::Result<usize> {
    let mut f = File::open(path)?;
    let mut buffer = String::new();
    f.read_to_string(&mut buffer)?;
    let digits = buffer.trim().trim_start_matches("0x");
    usize::from_str_radix(digits, 16)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}



/// A read-write file with synchronized I/O.
struct SyncFile {
    fd: libc::c_int,
}

impl SyncFile {
    fn new(path: &str) -> io::Result<SyncFile> {
        let path = CString::new(path).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_SYNC) };
        if fd < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(SyncFile { fd: fd })
        }
    }
}

impl Drop for SyncFile {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}



/// Memory-mapped device memory.
struct MemMap {
    base: *mut u8,
    size: usize,
}

impl MemMap {
    fn new(fd: libc::c_int, size: usize) -> io::Result<MemMap> {
        let base = unsafe {
            libc::mmap(ptr::null_mut(),
                       size as libc::size_t,
                       libc::PROT_READ | libc::PROT_WRITE,
                       libc::MAP_SHARED,
                       fd,
                       0)
        };
        if base == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(MemMap { base: base as *mut u8, size: size })
        }
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size as libc::size_t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn split_only_once() {
        let region = SharedRegion::heap();
        let pool = BufferPool::new(4, 8).unwrap();
        let ports = region.split(&pool, Duration::ZERO).unwrap();
        assert_eq!(ports.pump.free_ring().len(), 4);
        assert!(matches!(region.split(&pool, Duration::ZERO), Err(Error::AlreadyInstantiated)));
    }

    #[test]
    fn buffer_travels_producer_to_host_and_back() {
        let region = SharedRegion::heap();
        let pool = BufferPool::new(2, 8).unwrap();
        let ports = region.split(&pool, Duration::ZERO).unwrap();

        let mut handle = ports.pru0.acquire_free_buffer().unwrap();
        let index = handle.index();
        assert_eq!(pool.owner(index), Some(BufferOwner::Producer));
        assert!(!region.free_ring().contains(index));
        handle.put(0, 1, 2);
        let meta = BufferMeta { timestamp_ns: 77, sample_count: 1, ..BufferMeta::default() };
        assert!(ports.pru0.release_filled_buffer(handle, &meta).is_ok());
        assert_eq!(pool.owner(index), Some(BufferOwner::Filled));

        let msg = ports.pump.receive().unwrap();
        assert_eq!(msg.msg_type, MsgType::BufferFilled);
        assert_eq!(msg.value, [index, 1]);
        let filled = ports.pump.claim(index).unwrap();
        assert_eq!(filled.timestamp_ns(), 77);
        assert_eq!(filled.voltage(), &[1]);
        assert!(ports.pump.recycle(filled));
        assert_eq!(pool.owner(index), Some(BufferOwner::FreeRing));
        assert!(region.free_ring().contains(index));
    }

    #[test]
    fn refused_release_returns_the_handle() {
        let region = SharedRegion::heap();
        let pool = BufferPool::new(2, 8).unwrap();
        let ports = region.split(&pool, Duration::ZERO).unwrap();

        let first = ports.pru0.acquire_free_buffer().unwrap();
        let second = ports.pru0.acquire_free_buffer().unwrap();
        assert!(ports.pru0.release_filled_buffer(first, &BufferMeta::default()).is_ok());
        let back = ports.pru0.release_filled_buffer(second, &BufferMeta::default()).unwrap_err();
        assert_eq!(pool.owner(back.index()), Some(BufferOwner::Producer));

        let events: Vec<_> = ports.pump.poll_status().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].origin, Origin::Pru0);
        assert_eq!(events[0].code, StatusCode::Backpressure);
    }

    #[test]
    fn exhausted_pool_reports_once() {
        let region = SharedRegion::heap();
        let pool = BufferPool::new(1, 8).unwrap();
        let ports = region.split(&pool, Duration::ZERO).unwrap();
        let _held = ports.pru0.acquire_free_buffer().unwrap();
        assert!(ports.pru0.acquire_free_buffer().is_none());
        assert!(ports.pru0.acquire_free_buffer().is_none());
        let events: Vec<_> = ports.pump.poll_status().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].code, StatusCode::BufferPoolExhausted);
    }

    #[test]
    fn claiming_unannounced_buffer_is_corruption() {
        let region = SharedRegion::heap();
        let pool = BufferPool::new(2, 8).unwrap();
        let ports = region.split(&pool, Duration::ZERO).unwrap();
        assert!(ports.pump.claim(1).is_none());
        let event = ports.pump.poll_status().next().unwrap();
        assert_eq!(event.origin, Origin::Host);
        assert_eq!(event.code, StatusCode::MemoryCorruption);
    }

    #[test]
    fn session_transitions_are_checked() {
        let region = SharedRegion::heap();
        let pool = BufferPool::new(2, 8).unwrap();
        let ports = region.split(&pool, Duration::ZERO).unwrap();
        let session = &ports.session;

        assert!(session.set_state(SessionState::Running).is_err());
        session.set_mode(Mode::Harvest).unwrap();
        session.set_state(SessionState::Armed).unwrap();
        session.set_state(SessionState::Running).unwrap();
        assert!(session.set_mode(Mode::Emulate).is_err());
        assert_eq!(ports.pru0.mode(), Mode::Harvest);
        assert_eq!(ports.pru1.session_state(), SessionState::Running);
    }

    #[test]
    fn reset_needs_both_acks_and_restores_pool() {
        let region = SharedRegion::heap();
        let pool = BufferPool::new(3, 8).unwrap();
        let ports = region.split(&pool, Duration::ZERO).unwrap();
        let session = &ports.session;
        session.set_state(SessionState::Armed).unwrap();
        session.set_state(SessionState::Running).unwrap();

        let handle = ports.pru0.acquire_free_buffer().unwrap();
        assert!(ports.pru0.release_filled_buffer(handle, &BufferMeta::default()).is_ok());
        ports.pru0.swap_edges(Some(0));
        session.request_reset().unwrap();

        ports.pru0.acknowledge_reset();
        assert!(matches!(session.complete_reset(), Err(Error::ResetPending)));
        ports.pru1.acknowledge_reset();
        session.complete_reset().unwrap();

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(region.free_ring().len(), 3);
        assert!((0..3).all(|i| pool.owner(i) == Some(BufferOwner::FreeRing)));
        assert!(ports.pump.receive().is_none());
        assert!(!ports.pru1.record_edge(EdgeEvent::default()));
        assert!(!session.reset_acknowledged());
    }

    #[test]
    fn reset_waits_for_claimed_buffers() {
        let region = SharedRegion::heap();
        let pool = BufferPool::new(2, 8).unwrap();
        let ports = region.split(&pool, Duration::ZERO).unwrap();
        let session = &ports.session;
        session.set_state(SessionState::Armed).unwrap();
        session.set_state(SessionState::Running).unwrap();

        let mut handle = ports.pru0.acquire_free_buffer().unwrap();
        let index = handle.index();
        handle.put(0, 111, 5);
        let meta = BufferMeta { sample_count: 1, ..BufferMeta::default() };
        assert!(ports.pru0.release_filled_buffer(handle, &meta).is_ok());
        ports.pump.receive().unwrap();
        let filled = ports.pump.claim(index).unwrap();

        session.request_reset().unwrap();
        ports.pru0.acknowledge_reset();
        ports.pru1.acknowledge_reset();
        assert!(matches!(session.complete_reset(), Err(Error::BuffersHeld { count: 1 })));
        assert_eq!(session.state(), SessionState::Reset);
        assert!(!region.free_ring().contains(index));

        // The producer cannot get at the claimed buffer while the host still reads it.
        assert!(pool.take_for_producer(index).is_none());
        assert_eq!(filled.voltage(), &[111]);

        assert!(ports.pump.recycle(filled));
        session.complete_reset().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(region.free_ring().len(), 2);
    }

    #[test]
    fn dropped_producer_handle_is_reclaimed_on_reset() {
        let region = SharedRegion::heap();
        let pool = BufferPool::new(2, 8).unwrap();
        let ports = region.split(&pool, Duration::ZERO).unwrap();
        let session = &ports.session;
        session.set_state(SessionState::Armed).unwrap();
        session.set_state(SessionState::Running).unwrap();

        let handle = ports.pru0.acquire_free_buffer().unwrap();
        let index = handle.index();
        drop(handle);
        assert_eq!(pool.owner(index), Some(BufferOwner::Detached));

        session.request_reset().unwrap();
        ports.pru0.acknowledge_reset();
        ports.pru1.acknowledge_reset();
        session.complete_reset().unwrap();
        assert_eq!(pool.owner(index), Some(BufferOwner::FreeRing));
        assert_eq!(region.free_ring().len(), 2);
    }

    #[test]
    fn pool_serves_a_single_arena() {
        let first = SharedRegion::heap();
        let second = SharedRegion::heap();
        let pool = BufferPool::new(2, 8).unwrap();
        let _ports = first.split(&pool, Duration::ZERO).unwrap();
        assert!(matches!(second.split(&pool, Duration::ZERO), Err(Error::AlreadyInstantiated)));

        // The refused arena stays available for another pool.
        let other = BufferPool::new(1, 8).unwrap();
        assert!(second.split(&other, Duration::ZERO).is_ok());
    }

    #[test]
    fn released_buffer_no_longer_receives_edges() {
        let region = SharedRegion::heap();
        let pool = BufferPool::new(2, 8).unwrap();
        let ports = region.split(&pool, Duration::ZERO).unwrap();

        let handle = ports.pru0.acquire_free_buffer().unwrap();
        let index = handle.index();
        ports.pru0.swap_edges(Some(index));
        assert!(ports.pru1.record_edge(EdgeEvent { sample_index: 0, timestamp_ns: 1, bitmask: 1 }));
        assert!(ports.pru0.release_filled_buffer(handle, &BufferMeta::default()).is_ok());

        assert!(!ports.pru1.record_edge(EdgeEvent { sample_index: 1, timestamp_ns: 2, bitmask: 0 }));
        ports.pump.receive().unwrap();
        let filled = ports.pump.claim(index).unwrap();
        assert_eq!(filled.edges().events().len(), 1);
        assert!(ports.pump.recycle(filled));
    }

    #[test]
    fn corrupted_canary_refuses_split() {
        let region = SharedRegion::heap();
        region.canary.store(0, Ordering::Relaxed);
        let pool = BufferPool::new(1, 1).unwrap();
        assert!(matches!(region.split(&pool, Duration::ZERO), Err(Error::CanaryMismatch { .. })));
    }

    #[test]
    fn map_size_is_parsed_as_hex() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0x00080000").unwrap();
        let path = file.path().to_str().unwrap().to_owned();
        assert_eq!(read_map_size(&path).unwrap(), 0x80000);
    }

    #[test]
    fn missing_device_maps_to_not_found() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0x80000").unwrap();
        let path = file.path().to_str().unwrap().to_owned();
        let result = SharedRegion::open_uio("/nonexistent/uio-device", &path);
        assert!(matches!(result, Err(Error::DeviceNotFound)));
    }

    #[test]
    fn arena_fits_shared_ram() {
        assert!(mem::size_of::<SharedMem>() <= DRAM2_SIZE);
    }
}
