//! Sample buffers and their hand-over between PRU0 and the host.
//!
//! Every buffer of the pool is owned by exactly one party at a time: the free ring, the
//! producer (PRU0) or the consumer's filled queue on the host. Ownership is tracked by a
//! per-buffer state byte that only ever moves through compare-and-swap transitions, and the
//! typed handles below can only be obtained through those transitions.

use std::cell::UnsafeCell;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crate::def::{EDGE_LOG_CAPACITY, RING_CAPACITY};
use crate::error::Error;
use crate::util::SpinLock;
use crate::Result;



/// A level change captured on the target's GPIO lines.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EdgeEvent {
    /// Index of the sample during which the edge occurred.
    pub sample_index: u32,
    pub timestamp_ns: u64,
    /// Line levels after the edge.
    pub bitmask: u32,
}

/// Edge events of one buffer period, bounded.
#[derive(Clone, Debug)]
pub struct EdgeLog {
    events: Vec<EdgeEvent>,
    dropped: u32,
}

impl EdgeLog {
    fn new() -> EdgeLog {
        EdgeLog { events: Vec::with_capacity(EDGE_LOG_CAPACITY), dropped: 0 }
    }

    fn push(&mut self, event: EdgeEvent) -> bool {
        if self.events.len() < EDGE_LOG_CAPACITY {
            self.events.push(event);
            true
        } else {
            self.dropped = self.dropped.saturating_add(1);
            false
        }
    }

    fn clear(&mut self) {
        self.events.clear();
        self.dropped = 0;
    }

    pub fn events(&self) -> &[EdgeEvent] {
        &self.events
    }

    /// Number of edges that did not fit.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

/// Processing load of PRU0 over one buffer, in timer ticks per sample.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Utilization {
    pub ticks_max: u32,
    pub ticks_sum: u64,
}

impl Utilization {
    pub fn record(&mut self, ticks: u32) {
        self.ticks_max = self.ticks_max.max(ticks);
        self.ticks_sum = self.ticks_sum.saturating_add(ticks as u64);
    }
}

#[allow(non_snake_case)]
/// Metadata attached to a buffer when it is handed to the host.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferMeta {
    pub timestamp_ns: u64,
    pub sample_count: u32,
    pub util: Utilization,
    /// Converter input power summed over the samples, in fW.
    pub input_power_fW: u64,
}



/// A fixed-length buffer of voltage/current sample pairs.
#[derive(Clone, Debug)]
pub struct SampleBuffer {
    timestamp_ns: u64,
    len: u32,
    voltage: Box<[u32]>,
    current: Box<[u32]>,
    util: Utilization,
    input_power_fW: u64,
}

impl SampleBuffer {
    pub fn new(capacity: usize) -> SampleBuffer {
        SampleBuffer {
            timestamp_ns: 0,
            len: 0,
            voltage: vec![0; capacity].into_boxed_slice(),
            current: vec![0; capacity].into_boxed_slice(),
            util: Utilization::default(),
            input_power_fW: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.voltage.len()
    }

    /// Writes sample `index`; out of range samples are ignored and false is returned.
    #[inline]
    pub fn put(&mut self, index: usize, voltage: u32, current: u32) -> bool {
        if index >= self.voltage.len() {
            return false;
        }
        self.voltage[index] = voltage;
        self.current[index] = current;
        self.len = self.len.max(index as u32 + 1);
        true
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn voltage(&self) -> &[u32] {
        &self.voltage[..self.len as usize]
    }

    pub fn current(&self) -> &[u32] {
        &self.current[..self.len as usize]
    }

    pub fn utilization(&self) -> Utilization {
        self.util
    }

    /// Converter input power summed over the buffer, in fW.
    #[allow(non_snake_case)]
    pub fn input_power_fW(&self) -> u64 {
        self.input_power_fW
    }

    fn apply(&mut self, meta: &BufferMeta) {
        self.timestamp_ns = meta.timestamp_ns;
        self.len = meta.sample_count.min(self.voltage.len() as u32);
        self.util = meta.util;
        self.input_power_fW = meta.input_power_fW;
    }

    fn reset(&mut self) {
        self.timestamp_ns = 0;
        self.len = 0;
        self.util = Utilization::default();
        self.input_power_fW = 0;
    }
}



/// Current owner of a buffer.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferOwner {
    FreeRing = 0,
    Producer = 1,
    /// Announced to the host, not yet claimed.
    Filled = 2,
    /// Claimed by the host, still part of its filled queue.
    Consumer = 3,
    /// Its handle was dropped without a hand-over; reclaimed on session reset.
    Detached = 4,
}

impl BufferOwner {
    fn from_u8(raw: u8) -> BufferOwner {
        match raw {
            0 => BufferOwner::FreeRing,
            1 => BufferOwner::Producer,
            2 => BufferOwner::Filled,
            3 => BufferOwner::Consumer,
            _ => BufferOwner::Detached,
        }
    }

    /// True while a live handle grants access to the buffer.
    pub fn is_held(self) -> bool {
        self == BufferOwner::Producer || self == BufferOwner::Consumer
    }
}



/// The pool of sample buffers, allocated once per session.
pub struct BufferPool {
    buffers: Box<[UnsafeCell<SampleBuffer>]>,
    edges: Box<[UnsafeCell<EdgeLog>]>,
    owners: Box<[AtomicU8]>,
    attached: AtomicBool,
}

// Access to a buffer is only granted to the party whose ownership transition succeeded.
unsafe impl Sync for BufferPool {}
unsafe impl Send for BufferPool {}

impl BufferPool {
    /// Allocates `count` buffers of `samples` samples each, all owned by the free ring.
    pub fn new(count: usize, samples: usize) -> Result<BufferPool> {
        if count == 0 || count > RING_CAPACITY {
            return Err(Error::InvalidConfig(
                format!("buffer count {} outside 1..={}", count, RING_CAPACITY)));
        }
        if samples == 0 {
            return Err(Error::InvalidConfig("buffers must hold at least one sample".into()));
        }
        Ok(BufferPool {
            buffers: (0..count).map(|_| UnsafeCell::new(SampleBuffer::new(samples))).collect(),
            edges: (0..count).map(|_| UnsafeCell::new(EdgeLog::new())).collect(),
            owners: (0..count).map(|_| AtomicU8::new(BufferOwner::FreeRing as u8)).collect(),
            attached: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn owner(&self, index: u32) -> Option<BufferOwner> {
        self.owners.get(index as usize)
            .map(|o| BufferOwner::from_u8(o.load(Ordering::Acquire)))
    }

    fn transition(&self, index: u32, from: BufferOwner, to: BufferOwner) -> bool {
        match self.owners.get(index as usize) {
            Some(o) => o.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            None => false,
        }
    }

    /// Binds the pool to a shared arena; a pool serves one arena only.
    pub(crate) fn attach(&self) -> Result<()> {
        if self.attached.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyInstantiated);
        }
        Ok(())
    }

    /// Number of buffers a live producer or consumer handle points at.
    pub fn held(&self) -> usize {
        self.owners.iter()
            .filter(|o| BufferOwner::from_u8(o.load(Ordering::Acquire)).is_held())
            .count()
    }

    /// Hands every filled or detached buffer back to the free ring state.
    ///
    /// Refused with the number of held buffers while any handle is alive.
    pub(crate) fn reclaim(&self) -> Result<()> {
        let held = self.held();
        if held > 0 {
            return Err(Error::BuffersHeld { count: held });
        }
        for index in 0..self.len() as u32 {
            if !self.transition(index, BufferOwner::Filled, BufferOwner::FreeRing) {
                self.transition(index, BufferOwner::Detached, BufferOwner::FreeRing);
            }
        }
        Ok(())
    }

    /// Takes producer ownership of a buffer popped from the free ring.
    pub(crate) fn take_for_producer(&self, index: u32) -> Option<BufferHandle> {
        if !self.transition(index, BufferOwner::FreeRing, BufferOwner::Producer) {
            return None;
        }
        let buffer = unsafe { &mut *self.buffers[index as usize].get() };
        buffer.reset();
        Some(BufferHandle { index: index, buffer: buffer, pool: self })
    }

    /// Marks a producer buffer as filled; consumes the handle.
    pub(crate) fn mark_filled<'a>(&'a self, mut handle: BufferHandle<'a>, meta: &BufferMeta)
        -> (u32, u32) {
        handle.buffer.apply(meta);
        let (index, count) = (handle.index, handle.buffer.len);
        mem::forget(handle);
        let ok = self.transition(index, BufferOwner::Producer, BufferOwner::Filled);
        debug_assert!(ok);
        (index, count)
    }

    /// Reverts a refused hand-over and gives the handle back to the producer.
    pub(crate) fn unmark_filled(&self, index: u32) -> Option<BufferHandle> {
        if !self.transition(index, BufferOwner::Filled, BufferOwner::Producer) {
            return None;
        }
        Some(BufferHandle {
            index: index,
            buffer: unsafe { &mut *self.buffers[index as usize].get() },
            pool: self,
        })
    }

    /// Claims a filled buffer announced through the mailbox.
    pub(crate) fn claim_filled(&self, index: u32) -> Option<FilledBuffer> {
        if !self.transition(index, BufferOwner::Filled, BufferOwner::Consumer) {
            return None;
        }
        Some(FilledBuffer {
            index: index,
            buffer: unsafe { &*self.buffers[index as usize].get() },
            edges: unsafe { &*self.edges[index as usize].get() },
            pool: self,
        })
    }

    /// Returns a consumed buffer to the free ring ownership state.
    pub(crate) fn release_consumed(&self, buffer: FilledBuffer) -> u32 {
        let index = buffer.index;
        mem::forget(buffer);
        let ok = self.transition(index, BufferOwner::Consumer, BufferOwner::FreeRing);
        debug_assert!(ok);
        index
    }

    /// Edge log of a buffer; the caller must hold the edge target lock for that buffer.
    unsafe fn edge_log(&self, index: u32) -> &mut EdgeLog {
        &mut *self.edges[index as usize].get()
    }
}



/// Exclusive producer access to a buffer.
///
/// Dropping a handle without handing the buffer over detaches it until the next session reset.
pub struct BufferHandle<'a> {
    index: u32,
    buffer: &'a mut SampleBuffer,
    pool: &'a BufferPool,
}

impl<'a> BufferHandle<'a> {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl<'a> Deref for BufferHandle<'a> {
    type Target = SampleBuffer;

    fn deref(&self) -> &SampleBuffer {
        &*self.buffer
    }
}

impl<'a> DerefMut for BufferHandle<'a> {
    fn deref_mut(&mut self) -> &mut SampleBuffer {
        &mut *self.buffer
    }
}

impl<'a> Drop for BufferHandle<'a> {
    fn drop(&mut self) {
        self.pool.transition(self.index, BufferOwner::Producer, BufferOwner::Detached);
    }
}

/// Read access to a filled buffer held by the host.
///
/// Dropping it without recycling detaches the buffer until the next session reset.
pub struct FilledBuffer<'a> {
    index: u32,
    buffer: &'a SampleBuffer,
    edges: &'a EdgeLog,
    pool: &'a BufferPool,
}

impl<'a> FilledBuffer<'a> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn edges(&self) -> &EdgeLog {
        self.edges
    }
}

impl<'a> Deref for FilledBuffer<'a> {
    type Target = SampleBuffer;

    fn deref(&self) -> &SampleBuffer {
        self.buffer
    }
}

impl<'a> Drop for FilledBuffer<'a> {
    fn drop(&mut self) {
        self.pool.transition(self.index, BufferOwner::Consumer, BufferOwner::Detached);
    }
}



/// Circular queue of free buffer indices in shared memory.
///
/// The host is the only producer and PRU0 the only consumer. `head` is written by the consumer,
/// `tail` by the producer; the fill level is their difference.
#[repr(C)]
#[derive(Debug)]
pub struct FreeRing {
    slots: [AtomicU32; RING_CAPACITY],
    head: AtomicU32,
    tail: AtomicU32,
}

impl FreeRing {
    pub fn new() -> FreeRing {
        FreeRing {
            slots: std::array::from_fn(|_| AtomicU32::new(0)),
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        RING_CAPACITY
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head) as usize
    }

    /// True when no index is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= RING_CAPACITY
    }

    /// Queues an index; refused when full.
    pub(crate) fn push(&self, index: u32) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) as usize >= RING_CAPACITY {
            return false;
        }
        self.slots[tail as usize % RING_CAPACITY].store(index, Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Dequeues the oldest index.
    pub(crate) fn pop(&self) -> Option<u32> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let index = self.slots[head as usize % RING_CAPACITY].load(Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(index)
    }

    /// Returns true if `index` is currently queued.
    pub fn contains(&self, index: u32) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let len = self.len() as u32;
        (0..len).any(|i| {
            self.slots[head.wrapping_add(i) as usize % RING_CAPACITY].load(Ordering::Relaxed) == index
        })
    }

    pub(crate) fn reset(&self) {
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
    }
}



/// Destination of captured edges, swapped by PRU0 at every buffer boundary.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EdgeTarget {
    pub index: u32,
    pub active: bool,
}

pub type EdgeLock = SpinLock<EdgeTarget>;

/// Points edge capture at a new buffer (clearing its log) or at nothing.
pub(crate) fn swap_edge_target(lock: &EdgeLock, pool: &BufferPool, next: Option<u32>) {
    let mut target = lock.lock();
    match next {
        Some(index) if (index as usize) < pool.len() => {
            unsafe { pool.edge_log(index).clear(); }
            *target = EdgeTarget { index: index, active: true };
        }
        _ => *target = EdgeTarget { index: 0, active: false },
    }
}

/// Stops edge capture into `index` if it is the current target.
pub(crate) fn detach_edge_target(lock: &EdgeLock, index: u32) {
    let mut target = lock.lock();
    if target.active && target.index == index {
        *target = EdgeTarget { index: 0, active: false };
    }
}

/// Appends an edge to the current target; false if there is none or its log is full.
pub(crate) fn record_edge(lock: &EdgeLock, pool: &BufferPool, event: EdgeEvent) -> bool {
    let target = lock.lock();
    if !target.active || target.index as usize >= pool.len() {
        return false;
    }
    unsafe { pool.edge_log(target.index).push(event) }
}
