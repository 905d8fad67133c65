//! Host-side services: message pump, sync service and the periodic timers that drive them.
//!
//! Both services are plain objects with a non-blocking `service` method. A [`PeriodicTimer`]
//! runs one of them on a scoped thread at a fixed rate; it can be cancelled and started again at
//! any time without touching the state shared with the PRUs.

use std::time::Duration;

use crossbeam::channel::{self, Sender};
use crossbeam::thread::Scope;

use crate::buffer::{FilledBuffer, Utilization};
use crate::clock_sync::{
    Alignment, Plausibility, SyncConfig, SyncController, SyncOutcome, TriggerAligner, WallClock,
};
use crate::mailbox::StatusEvent;
use crate::pubdef::{MsgType, SessionState, StatusCode};
use crate::shared::{PumpPort, SessionControl, SyncPort};
use crate::Result;



/// Summary of a buffer handed over by PRU0.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferSummary {
    pub index: u32,
    pub timestamp_ns: u64,
    pub samples: u32,
    pub edges: u32,
    pub edges_dropped: u32,
    pub util: Utilization,
    /// Converter input power summed over the samples, in fW.
    #[allow(non_snake_case)]
    pub input_power_fW: u64,
}

impl<'a> From<&FilledBuffer<'a>> for BufferSummary {
    fn from(buffer: &FilledBuffer<'a>) -> BufferSummary {
        BufferSummary {
            index: buffer.index(),
            timestamp_ns: buffer.timestamp_ns(),
            samples: buffer.len() as u32,
            edges: buffer.edges().events().len() as u32,
            edges_dropped: buffer.edges().dropped(),
            util: buffer.utilization(),
            input_power_fW: buffer.input_power_fW(),
        }
    }
}

/// Events forwarded to the supervisor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HostEvent {
    Buffer(BufferSummary),
    Pong([u32; 2]),
    Status(StatusEvent),
}

/// Consumer of the sample data of filled buffers.
pub trait BufferSink {
    fn consume(&mut self, buffer: &FilledBuffer<'_>);
}

impl<F> BufferSink for F
where
    F: FnMut(&FilledBuffer<'_>),
{
    fn consume(&mut self, buffer: &FilledBuffer<'_>) {
        self(buffer)
    }
}

/// Log level of a status event.
pub fn status_level(code: StatusCode) -> log::Level {
    if code.is_severe() {
        log::Level::Error
    } else if code == StatusCode::Restart {
        log::Level::Info
    } else {
        log::Level::Warn
    }
}



#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub buffers: u64,
    pub samples: u64,
    pub statuses: u64,
    pub faults: u64,
}

/// Drains PRU0's mailbox and every status channel.
pub struct MessagePump<'a> {
    port: PumpPort<'a>,
    session: SessionControl<'a>,
    events: Sender<HostEvent>,
    stats: PumpStats,
}

impl<'a> MessagePump<'a> {
    pub fn new(port: PumpPort<'a>, session: SessionControl<'a>, events: Sender<HostEvent>)
        -> MessagePump<'a> {
        MessagePump { port: port, session: session, events: events, stats: PumpStats::default() }
    }

    pub fn port(&self) -> &PumpPort<'a> {
        &self.port
    }

    pub fn stats(&self) -> PumpStats {
        self.stats
    }

    /// Sends a ping to PRU0; the pong shows up as a [`HostEvent::Pong`].
    pub fn ping(&self, v1: u32, v2: u32) -> bool {
        self.port.send(MsgType::Ping, v1, v2)
    }

    /// Handles every pending status event and at most one message.
    ///
    /// Returns true if anything was received.
    pub fn service<S: BufferSink + ?Sized>(&mut self, sink: &mut S) -> bool {
        let mut busy = false;
        let statuses: Vec<StatusEvent> = self.port.poll_status().collect();
        for event in statuses {
            self.on_status(event);
            busy = true;
        }

        if let Some(msg) = self.port.receive() {
            busy = true;
            match msg.msg_type {
                MsgType::BufferFilled => self.on_buffer(msg.value[0], sink),
                MsgType::Pong => self.forward(HostEvent::Pong(msg.value)),
                other => {
                    self.port.status().report(StatusCode::InvalidCommand, other as u32, msg.value[0]);
                }
            }
        }
        busy
    }

    fn on_buffer<S: BufferSink + ?Sized>(&mut self, index: u32, sink: &mut S) {
        // A refused claim has already been reported as corruption.
        let buffer = match self.port.claim(index) {
            Some(buffer) => buffer,
            None => return,
        };
        sink.consume(&buffer);
        let summary = BufferSummary::from(&buffer);
        self.port.recycle(buffer);

        self.stats.buffers += 1;
        self.stats.samples += summary.samples as u64;
        log::debug!("buffer {} at {} ns: {} samples", summary.index, summary.timestamp_ns,
                    summary.samples);
        self.forward(HostEvent::Buffer(summary));
    }

    fn on_status(&mut self, event: StatusEvent) {
        self.stats.statuses += 1;
        log::log!(status_level(event.code), "{:?}: {:?} [{:#x}, {:#x}]",
                  event.origin, event.code, event.value[0], event.value[1]);
        if event.code == StatusCode::SyncStateViolation && self.session.state() != SessionState::Fault {
            self.stats.faults += 1;
            // Fault is reachable from every state.
            let _ = self.session.set_state(SessionState::Fault);
        }
        self.forward(HostEvent::Status(event));
    }

    fn forward(&self, event: HostEvent) {
        // The supervisor may have gone away; events are then only logged.
        let _ = self.events.try_send(event);
    }
}



/// Host end of the clock sync: raises the trigger and answers PRU1's requests.
pub struct HostSync<'a, C> {
    port: SyncPort<'a>,
    controller: SyncController,
    aligner: TriggerAligner,
    clock: C,
    trigger_ns: Option<u64>,
}

impl<'a, C: WallClock> HostSync<'a, C> {
    pub fn new(port: SyncPort<'a>, cfg: SyncConfig, clock: C) -> Result<HostSync<'a, C>> {
        Ok(HostSync {
            port: port,
            controller: SyncController::new(cfg)?,
            aligner: TriggerAligner::new(&cfg),
            clock: clock,
            trigger_ns: None,
        })
    }

    pub fn controller(&self) -> &SyncController {
        &self.controller
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Waits for the next period boundary and raises the trigger.
    ///
    /// After a missed boundary the schedule is realigned and no trigger is raised.
    pub fn trigger(&mut self) -> Alignment {
        let alignment = self.aligner.wait(&self.clock);
        match alignment {
            Alignment::Aligned { deadline_ns, late_ns } => {
                self.port.raise_trigger();
                self.trigger_ns = Some(deadline_ns + late_ns);
            }
            Alignment::Resynced { next_deadline_ns, missed_periods } => {
                log::warn!("sync trigger missed {} periods, next at {} ns", missed_periods,
                           next_deadline_ns);
            }
        }
        alignment
    }

    /// Answers a pending sync request, if any.
    pub fn service(&mut self) -> Option<SyncOutcome> {
        let msg = self.port.receiver().receive()?;
        if msg.msg_type != MsgType::SyncRequest {
            self.port.status().report(StatusCode::InvalidCommand, msg.msg_type as u32, msg.value[0]);
            return None;
        }
        let trigger_ns = match self.trigger_ns.take() {
            Some(ts) => ts,
            None => {
                self.port.status().report(StatusCode::InvalidCommand, msg.msg_type as u32,
                                          msg.value[0]);
                return None;
            }
        };

        let outcome = self.controller.handle_request(msg.value[0], trigger_ns);
        if !self.port.sender().send_reply(&outcome.reply) {
            log::warn!("sync reply refused, previous reply still unread");
        }
        match outcome.plausibility {
            Plausibility::Plausible => {}
            Plausibility::Implausible { delta_ns } => {
                log::warn!("sync requests {} ns apart", delta_ns);
                self.port.status().report(StatusCode::TimestampImplausible,
                                          delta_ns.min(u32::MAX as u64) as u32, msg.value[0]);
            }
            Plausibility::Restarted { delta_ns } => {
                self.port.status().report(StatusCode::TimestampImplausible,
                                          delta_ns.min(u32::MAX as u64) as u32, msg.value[0]);
                self.aligner.resync();
            }
        }
        log::trace!("sync error {} ns, correction {} ticks", self.controller.state().error_now_ns,
                    self.controller.state().correction_ticks);
        Some(outcome)
    }

    /// Drops the controller state, as after a session reset.
    pub fn reset(&mut self) {
        self.controller.reset();
        self.aligner.resync();
        self.trigger_ns = None;
    }
}



/// A task run at a fixed rate on a scoped thread, until cancelled.
pub struct PeriodicTimer {
    name: &'static str,
    period: Duration,
    cancel: Option<Sender<()>>,
}

impl PeriodicTimer {
    pub fn new(name: &'static str, period: Duration) -> PeriodicTimer {
        PeriodicTimer { name: name, period: period, cancel: None }
    }

    pub fn is_running(&self) -> bool {
        self.cancel.is_some()
    }

    /// Starts the task, cancelling a previous run first.
    ///
    /// The task stops itself by returning false.
    pub fn start<'env, F>(&mut self, scope: &Scope<'env>, mut task: F)
    where
        F: FnMut() -> bool + Send + 'env,
    {
        self.cancel();
        let (cancel_tx, cancel_rx) = channel::bounded::<()>(0);
        let ticker = channel::tick(self.period);
        let name = self.name;
        scope.spawn(move |_| {
            log::debug!("{} timer started", name);
            loop {
                crossbeam::select! {
                    recv(ticker) -> _ => {
                        if !task() {
                            break;
                        }
                    }
                    recv(cancel_rx) -> _ => break,
                }
            }
            log::debug!("{} timer stopped", name);
        });
        self.cancel = Some(cancel_tx);
    }

    /// Stops the running task after its current iteration; returns false if none was running.
    pub fn cancel(&mut self) -> bool {
        // Dropping the sender disconnects the cancel channel.
        self.cancel.take().is_some()
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}



#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::shared::SharedRegion;
    use crate::sim::{ManualClock, SimTimer};
    use crate::timing::TimingLoop;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn small_config() -> SyncConfig {
        SyncConfig { period_ns: 5_000, tick_ns: 5, samples_per_period: 10, spin_window_ns: 0 }
    }

    #[test]
    fn pump_recycles_buffers_and_forwards_summaries() {
        let region = SharedRegion::heap();
        let pool = BufferPool::new(2, 4).unwrap();
        let ports = region.split(&pool, Duration::ZERO).unwrap();
        let (tx, rx) = channel::unbounded();
        let mut pump = MessagePump::new(ports.pump, ports.session, tx);

        let mut handle = ports.pru0.acquire_free_buffer().unwrap();
        handle.put(0, 10, 20);
        handle.put(1, 11, 21);
        let meta = crate::buffer::BufferMeta { timestamp_ns: 42, sample_count: 2, ..Default::default() };
        assert!(ports.pru0.release_filled_buffer(handle, &meta).is_ok());

        let mut seen = Vec::new();
        assert!(pump.service(&mut |buffer: &FilledBuffer<'_>| seen.extend_from_slice(buffer.voltage())));
        assert_eq!(seen, vec![10, 11]);
        assert_eq!(region.free_ring().len(), 2);
        match rx.try_recv().unwrap() {
            HostEvent::Buffer(summary) => {
                assert_eq!(summary.timestamp_ns, 42);
                assert_eq!(summary.samples, 2);
            }
            other => panic!("{:?}", other),
        }
        assert_eq!(pump.stats().buffers, 1);
        assert!(!pump.service(&mut |_: &FilledBuffer<'_>| {}));
    }

    #[test]
    fn sync_violation_faults_the_session() {
        let region = SharedRegion::heap();
        let pool = BufferPool::new(2, 4).unwrap();
        let ports = region.split(&pool, Duration::ZERO).unwrap();
        ports.session.set_state(SessionState::Armed).unwrap();
        ports.session.set_state(SessionState::Running).unwrap();
        let (tx, rx) = channel::unbounded();
        let mut pump = MessagePump::new(ports.pump, ports.session, tx);

        ports.pru1.status().report(StatusCode::SyncStateViolation, 7, 0);
        pump.service(&mut |_: &FilledBuffer<'_>| {});
        assert_eq!(ports.session.state(), SessionState::Fault);
        assert_eq!(pump.stats().faults, 1);
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, HostEvent::Status(e) if e.code == StatusCode::SyncStateViolation));
    }

    #[test]
    fn unknown_buffer_index_is_reported() {
        let region = SharedRegion::heap();
        let pool = BufferPool::new(2, 4).unwrap();
        let ports = region.split(&pool, Duration::ZERO).unwrap();
        let (tx, rx) = channel::unbounded();
        let mut pump = MessagePump::new(ports.pump, ports.session, tx);

        assert!(ports.pru0.send(MsgType::BufferFilled, 1, 4));
        pump.service(&mut |_: &FilledBuffer<'_>| panic!("nothing was filled"));
        pump.service(&mut |_: &FilledBuffer<'_>| {});
        let codes: Vec<_> = rx.try_iter()
            .filter_map(|e| match e { HostEvent::Status(s) => Some(s.code), _ => None })
            .collect();
        assert_eq!(codes, vec![StatusCode::MemoryCorruption]);
    }

    #[test]
    fn pong_is_forwarded() {
        let region = SharedRegion::heap();
        let pool = BufferPool::new(2, 4).unwrap();
        let ports = region.split(&pool, Duration::ZERO).unwrap();
        let (tx, rx) = channel::unbounded();
        let mut pump = MessagePump::new(ports.pump, ports.session, tx);
        assert!(pump.ping(1, 2));
        let ping = ports.pru0.receive().unwrap();
        assert!(ports.pru0.send(MsgType::Pong, ping.value[0], ping.value[1]));
        pump.service(&mut |_: &FilledBuffer<'_>| {});
        assert_eq!(rx.try_recv().unwrap(), HostEvent::Pong([1, 2]));
    }

    #[test]
    fn sync_round_trip_with_timing_loop() {
        let region = SharedRegion::heap();
        let pool = BufferPool::new(2, 16).unwrap();
        let ports = region.split(&pool, Duration::ZERO).unwrap();
        ports.session.set_state(SessionState::Armed).unwrap();
        ports.session.set_state(SessionState::Running).unwrap();
        let mut timing = TimingLoop::new(ports.pru1, SimTimer::new(1_000), small_config());
        timing.step();
        timing.step();
        let mut sync = HostSync::new(ports.sync, small_config(), ManualClock::new(0, 1)).unwrap();

        assert_eq!(sync.trigger(), Alignment::Aligned { deadline_ns: 5_000, late_ns: 0 });
        assert!(sync.service().is_none());
        timing.timer_mut().advance(40);
        timing.step();

        let outcome = sync.service().unwrap();
        assert_eq!(outcome.plausibility, Plausibility::Plausible);
        assert_eq!(outcome.reply.sync_interval_ticks, 1_000);
        assert_eq!(outcome.reply.next_timestamp_ns, 10_000);

        timing.step();
        timing.timer_mut().advance(960);
        timing.step();
        assert_eq!(ports.pru0.take_swap_trigger(), Some(10_000));
    }

    #[test]
    fn request_without_trigger_is_rejected() {
        let region = SharedRegion::heap();
        let pool = BufferPool::new(2, 4).unwrap();
        let ports = region.split(&pool, Duration::ZERO).unwrap();
        let mut sync = HostSync::new(ports.sync, small_config(), ManualClock::new(0, 1)).unwrap();
        assert!(ports.pru1.sender().send(MsgType::SyncRequest, 3, 0));
        assert!(sync.service().is_none());
        let codes: Vec<_> = ports.pump.poll_status().map(|e| e.code).collect();
        assert_eq!(codes, vec![StatusCode::InvalidCommand]);
    }

    #[test]
    fn timer_can_be_cancelled_and_restarted() {
        let count = AtomicUsize::new(0);
        crossbeam::scope(|scope| {
            let mut timer = PeriodicTimer::new("test", Duration::from_millis(1));
            timer.start(scope, || {
                count.fetch_add(1, Ordering::SeqCst);
                true
            });
            thread::sleep(Duration::from_millis(30));
            assert!(timer.cancel());
            assert!(!timer.is_running());
            thread::sleep(Duration::from_millis(10));
            let stopped = count.load(Ordering::SeqCst);
            assert!(stopped > 0);
            thread::sleep(Duration::from_millis(20));
            assert_eq!(count.load(Ordering::SeqCst), stopped);

            timer.start(scope, || {
                count.fetch_add(1, Ordering::SeqCst);
                true
            });
            thread::sleep(Duration::from_millis(30));
            timer.cancel();
            assert!(count.load(Ordering::SeqCst) > stopped);
        })
        .unwrap();
    }

    #[test]
    fn task_can_stop_its_timer() {
        let count = AtomicUsize::new(0);
        // Outlives the scope, so only the task can stop it.
        let mut timer = PeriodicTimer::new("once", Duration::from_millis(1));
        crossbeam::scope(|scope| {
            timer.start(scope, || count.fetch_add(1, Ordering::SeqCst) < 2);
        })
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
