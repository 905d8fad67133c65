//! Real-time loop of PRU1: period and sample timing, clock sync and edge capture.
//!
//! The IEP timer wraps once per buffer period. At every wrap the loop applies the last sync
//! reply, announces the new period to PRU0 and paces the samples of that period through the
//! sample compare, spreading the compensation ticks over the first samples.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::buffer::EdgeEvent;
use crate::clock_sync::{SyncClient, SyncConfig};
use crate::mailbox::SyncReply;
use crate::pubdef::{SessionState, StatusCode};
use crate::sampler::LoopState;
use crate::shared::Pru1Port;



/// The IEP timer and GPIO inputs of PRU1.
pub trait Timer {
    /// Ticks since the last wrap.
    fn counter(&self) -> u32;

    /// Sets the wrap value for the following periods.
    fn set_period(&mut self, ticks: u32);

    /// Consumes the wrap event.
    fn take_wrap(&mut self) -> bool;

    /// Arms the sample compare at counter value `ticks`.
    fn set_sample_compare(&mut self, ticks: u32);

    /// Consumes the sample compare event.
    fn take_sample_match(&mut self) -> bool;

    /// Levels of the monitored target lines.
    fn gpio(&self) -> u32;
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TimingStats {
    pub periods: u64,
    pub samples: u64,
    pub sync_requests: u64,
    pub replies_applied: u64,
    pub edges: u64,
    pub edges_dropped: u64,
    /// Sample ticks raised while PRU0 still had the previous one pending.
    pub overruns: u64,
}

pub struct TimingLoop<'a, T> {
    port: Pru1Port<'a>,
    timer: T,
    cfg: SyncConfig,
    client: SyncClient,
    state: LoopState,
    reset_acked: bool,

    next_reply: Option<SyncReply>,
    period_ticks: u32,
    sample_interval: u32,
    compensation: u32,
    compensation_left: u32,
    next_compare: u32,
    sample_index: u32,
    period_timestamp_ns: u64,
    last_gpio: u32,
    stats: TimingStats,
}

impl<'a, T: Timer> TimingLoop<'a, T> {
    pub fn new(port: Pru1Port<'a>, timer: T, cfg: SyncConfig) -> TimingLoop<'a, T> {
        let nominal = cfg.nominal_ticks();
        let samples = cfg.samples_per_period.max(1);
        TimingLoop {
            port: port,
            timer: timer,
            cfg: cfg,
            client: SyncClient::new(),
            state: LoopState::Reset,
            reset_acked: false,
            next_reply: None,
            period_ticks: nominal,
            sample_interval: nominal / samples,
            compensation: nominal % samples,
            compensation_left: 0,
            next_compare: 0,
            sample_index: 0,
            period_timestamp_ns: 0,
            last_gpio: 0,
            stats: TimingStats::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> TimingStats {
        self.stats
    }

    pub fn port(&self) -> &Pru1Port<'a> {
        &self.port
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut T {
        &mut self.timer
    }

    pub fn period_ticks(&self) -> u32 {
        self.period_ticks
    }

    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            self.step();
            std::hint::spin_loop();
        }
    }

    pub fn step(&mut self) -> LoopState {
        let next = match self.state {
            LoopState::Reset => self.do_reset(),
            LoopState::AwaitStart => self.await_start(),
            LoopState::Running => self.do_running(),
            LoopState::Fault => match self.port.session_state() {
                SessionState::Reset => LoopState::Reset,
                _ => LoopState::Fault,
            },
        };
        if next != self.state {
            log::debug!("pru1 {:?} -> {:?}", self.state, next);
            self.state = next;
        }
        next
    }

    fn do_reset(&mut self) -> LoopState {
        // The timer keeps running; only the session state goes.
        self.client.reset();
        self.next_reply = None;
        self.apply_period(self.cfg.nominal_ticks());
        self.sample_index = 0;
        self.period_timestamp_ns = 0;
        if self.port.session_state() == SessionState::Reset {
            if !self.reset_acked {
                self.stats = TimingStats::default();
                self.port.acknowledge_reset();
                self.reset_acked = true;
            }
            LoopState::Reset
        } else {
            self.reset_acked = false;
            LoopState::AwaitStart
        }
    }

    fn await_start(&mut self) -> LoopState {
        self.port.take_sync_trigger();
        match self.port.session_state() {
            SessionState::Running => {
                self.timer.take_wrap();
                self.timer.take_sample_match();
                self.last_gpio = self.timer.gpio();
                LoopState::Running
            }
            SessionState::Reset => LoopState::Reset,
            SessionState::Fault => LoopState::Fault,
            SessionState::Idle | SessionState::Armed => LoopState::AwaitStart,
        }
    }

    fn do_running(&mut self) -> LoopState {
        match self.port.session_state() {
            SessionState::Running => {}
            SessionState::Reset => return LoopState::Reset,
            SessionState::Fault => return LoopState::Fault,
            SessionState::Idle | SessionState::Armed => return LoopState::AwaitStart,
        }

        if self.port.take_sync_trigger() {
            let iep = self.timer.counter();
            match self.client.on_trigger(iep, self.port.sender()) {
                Ok(true) => self.stats.sync_requests += 1,
                Ok(false) => {}
                Err(violation) => {
                    self.port.status().report(StatusCode::SyncStateViolation, violation.iep_ticks, 0);
                    return LoopState::Fault;
                }
            }
        }
        if let Some(reply) = self.port.receiver().receive_reply() {
            match self.client.on_reply(reply) {
                Some(reply) => self.next_reply = Some(reply),
                None => {
                    self.port.status().report(StatusCode::InvalidCommand,
                                              reply.sync_interval_ticks, 0);
                }
            }
        }

        if self.timer.take_wrap() {
            self.begin_period();
        } else if self.timer.take_sample_match() {
            self.sample();
        }
        self.capture_edges();
        LoopState::Running
    }

    fn apply_period(&mut self, ticks: u32) {
        let samples = self.cfg.samples_per_period.max(1);
        self.period_ticks = ticks;
        self.sample_interval = ticks / samples;
        self.compensation = ticks % samples;
        self.timer.set_period(ticks);
    }

    fn begin_period(&mut self) {
        let elapsed_ns = self.period_ticks as u64 * self.cfg.tick_ns;
        match self.next_reply.take() {
            Some(reply) => {
                self.apply_period(reply.sync_interval_ticks);
                self.sample_interval = reply.sample_interval_ticks;
                self.compensation = reply.compensation_steps;
                self.period_timestamp_ns = reply.next_timestamp_ns;
                self.stats.replies_applied += 1;
            }
            None => self.period_timestamp_ns += elapsed_ns,
        }
        self.stats.periods += 1;
        self.port.raise_buffer_swap(self.period_timestamp_ns);

        self.sample_index = 0;
        self.compensation_left = self.compensation;
        self.next_compare = 0;
        self.sample();
    }

    fn sample(&mut self) {
        if self.port.sample_pending() {
            self.stats.overruns += 1;
        }
        self.port.raise_sample();
        self.stats.samples += 1;
        self.sample_index += 1;
        if self.sample_index < self.cfg.samples_per_period {
            let mut interval = self.sample_interval;
            if self.compensation_left > 0 {
                interval += 1;
                self.compensation_left -= 1;
            }
            self.next_compare += interval;
            self.timer.set_sample_compare(self.next_compare);
        }
    }

    fn capture_edges(&mut self) {
        let levels = self.timer.gpio();
        if levels == self.last_gpio {
            return;
        }
        self.last_gpio = levels;
        let event = EdgeEvent {
            sample_index: self.sample_index.saturating_sub(1),
            timestamp_ns: self.period_timestamp_ns + self.timer.counter() as u64 * self.cfg.tick_ns,
            bitmask: levels,
        };
        if self.port.record_edge(event) {
            self.stats.edges += 1;
        } else {
            self.stats.edges_dropped += 1;
        }
    }
}
