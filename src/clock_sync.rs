//! Phase lock of the PRU1 timer onto the host wall clock.
//!
//! Once per buffer period the host raises the sync trigger and notes its own timestamp. PRU1
//! answers with the value of its IEP counter ([`SyncClient`]), the host compares both phases and
//! replies with the compare value of the next period ([`SyncController`]). The host side trigger
//! is aligned to the period boundary by [`TriggerAligner`].

use std::hint;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;

use crate::def::{
    NOMINAL_PERIOD_TICKS, SAMPLES_PER_PERIOD, SYNC_CORRECTION_LIMIT_DIVISOR, SYNC_I_DIVISOR,
    SYNC_PERIOD_NS, SYNC_P_DIVISOR, TICK_NS, TIMESTAMP_PLAUSIBLE_MAX_PERCENT,
    TIMESTAMP_PLAUSIBLE_MIN_PERCENT, TRIGGER_SPIN_WINDOW_NS,
};
use crate::error::Error;
use crate::mailbox::{Sender, SyncReply};
use crate::pubdef::MsgType;
use crate::Result;



/// Timing of the synchronization loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub period_ns: u64,
    pub tick_ns: u64,
    pub samples_per_period: u32,
    /// The host trigger spins over this window before the deadline instead of sleeping.
    pub spin_window_ns: u64,
}

impl Default for SyncConfig {
    fn default() -> SyncConfig {
        SyncConfig {
            period_ns: SYNC_PERIOD_NS,
            tick_ns: TICK_NS,
            samples_per_period: SAMPLES_PER_PERIOD,
            spin_window_ns: TRIGGER_SPIN_WINDOW_NS,
        }
    }
}

impl SyncConfig {
    pub fn nominal_ticks(&self) -> u32 {
        (self.period_ns / self.tick_ns.max(1)).min(u32::MAX as u64) as u32
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_ns == 0 || self.period_ns == 0 {
            return Err(Error::InvalidConfig("sync period and tick must be positive".into()));
        }
        if self.period_ns % self.tick_ns != 0 || self.period_ns / self.tick_ns > u32::MAX as u64 / 2 {
            return Err(Error::InvalidConfig(
                format!("sync period {} ns is not a representable tick count", self.period_ns)));
        }
        if self.samples_per_period == 0 || self.samples_per_period > self.nominal_ticks() {
            return Err(Error::InvalidConfig(
                format!("{} samples do not fit one period", self.samples_per_period)));
        }
        Ok(())
    }
}



/// Folds a phase error into `[-period/2, period/2]`.
#[inline]
pub fn fold_error(error_ns: i64, period_ns: i64) -> i64 {
    if error_ns < -period_ns / 2 {
        error_ns + period_ns
    } else if error_ns > period_ns / 2 {
        error_ns - period_ns
    } else {
        error_ns
    }
}

/// Controller state, reset to zero on every (re)start.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncState {
    pub error_prev_ns: i64,
    pub error_now_ns: i64,
    pub error_sum_ns: i64,
    /// Last correction in timer ticks.
    pub correction_ticks: i32,
    pub previous_period_ticks: u32,
}

/// Verdict on the spacing between two consecutive sync requests.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Plausibility {
    Plausible,
    /// Outside the tolerated window; the controller carried on.
    Implausible { delta_ns: u64 },
    /// So far off that the other side must have restarted; the controller was reset.
    Restarted { delta_ns: u64 },
}

/// Result of one request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SyncOutcome {
    pub reply: SyncReply,
    pub plausibility: Plausibility,
}



/// Host-side PI controller.
pub struct SyncController {
    cfg: SyncConfig,
    nominal_ticks: u32,
    state: SyncState,
    previous_timestamp_ns: u64,
    anchored: bool,
    last_request_ns: Option<u64>,
}

impl SyncController {
    pub fn new(cfg: SyncConfig) -> Result<SyncController> {
        cfg.validate()?;
        let nominal = cfg.nominal_ticks();
        Ok(SyncController {
            cfg: cfg,
            nominal_ticks: nominal,
            state: SyncState { previous_period_ticks: nominal, ..SyncState::default() },
            previous_timestamp_ns: 0,
            anchored: false,
            last_request_ns: None,
        })
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn nominal_ticks(&self) -> u32 {
        self.nominal_ticks
    }

    /// Largest correction magnitude in ticks.
    pub fn correction_limit(&self) -> i64 {
        self.nominal_ticks as i64 / SYNC_CORRECTION_LIMIT_DIVISOR
    }

    pub fn reset(&mut self) {
        self.state = SyncState { previous_period_ticks: self.nominal_ticks, ..SyncState::default() };
        self.anchored = false;
        self.last_request_ns = None;
    }

    /// Handles a sync request carrying the IEP counter stamped by PRU1, given the host time at
    /// which the trigger was raised.
    pub fn handle_request(&mut self, iep_ticks: u32, sys_ts_ns: u64) -> SyncOutcome {
        let period = self.cfg.period_ns;
        let plausibility = self.check_spacing(sys_ts_ns);
        if let Plausibility::Restarted { delta_ns } = plausibility {
            log::warn!("sync requests {} ns apart, restarting controller", delta_ns);
            self.reset();
        }
        self.last_request_ns = Some(sys_ts_ns);
        if !self.anchored {
            self.previous_timestamp_ns = sys_ts_ns - sys_ts_ns % period;
            self.anchored = true;
        }

        let iep_phase_ns = (iep_ticks as u128 * period as u128
                            / self.state.previous_period_ticks.max(1) as u128) as i64;
        let sys_phase_ns = (sys_ts_ns % period) as i64;
        let reply = self.apply_error(iep_phase_ns - sys_phase_ns);
        SyncOutcome { reply: reply, plausibility: plausibility }
    }

    /// Runs the PI law on one raw phase error and produces the reply for the next period.
    pub fn apply_error(&mut self, error_ns: i64) -> SyncReply {
        let error = fold_error(error_ns, self.cfg.period_ns as i64);
        self.state.error_prev_ns = self.state.error_now_ns;
        self.state.error_now_ns = error;
        self.state.error_sum_ns = self.state.error_sum_ns.saturating_add(error);

        let correction_ns = error / SYNC_P_DIVISOR + self.state.error_sum_ns / SYNC_I_DIVISOR;
        let limit = self.correction_limit();
        let correction = (correction_ns / self.cfg.tick_ns as i64).clamp(-limit, limit);
        let period_ticks = (self.nominal_ticks as i64 + correction) as u32;

        self.state.correction_ticks = correction as i32;
        self.state.previous_period_ticks = period_ticks;
        self.previous_timestamp_ns += period_ticks as u64 * self.cfg.tick_ns;

        SyncReply {
            sync_interval_ticks: period_ticks,
            sample_interval_ticks: period_ticks / self.cfg.samples_per_period,
            compensation_steps: period_ticks % self.cfg.samples_per_period,
            next_timestamp_ns: self.previous_timestamp_ns,
        }
    }

    fn check_spacing(&self, sys_ts_ns: u64) -> Plausibility {
        let last = match self.last_request_ns {
            Some(last) => last,
            None => return Plausibility::Plausible,
        };
        let period = self.cfg.period_ns;
        if sys_ts_ns <= last {
            return Plausibility::Restarted { delta_ns: 0 };
        }
        let delta = sys_ts_ns - last;
        let percent = delta as u128 * 100 / period as u128;
        if delta > 2 * period {
            Plausibility::Restarted { delta_ns: delta }
        } else if percent < TIMESTAMP_PLAUSIBLE_MIN_PERCENT as u128
            || percent >= TIMESTAMP_PLAUSIBLE_MAX_PERCENT as u128 {
            Plausibility::Implausible { delta_ns: delta }
        } else {
            Plausibility::Plausible
        }
    }
}



/// State of the PRU1 side of the exchange.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    ReplyPending,
}

/// A second trigger arrived while a reply was still outstanding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SyncViolation {
    pub iep_ticks: u32,
}

/// PRU1 side of the exchange: at most one outstanding request.
#[derive(Debug)]
pub struct SyncClient {
    state: ClientState,
    requests: u32,
}

impl SyncClient {
    pub fn new() -> SyncClient {
        SyncClient { state: ClientState::Idle, requests: 0 }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Handles the host trigger by sending a request stamped with `iep_ticks`.
    ///
    /// Returns `Ok(false)` if the request slot was still occupied; the trigger is then lost and
    /// the client stays idle.
    pub fn on_trigger(&mut self, iep_ticks: u32, tx: &Sender<'_, 2>)
        -> std::result::Result<bool, SyncViolation> {
        match self.state {
            ClientState::ReplyPending => Err(SyncViolation { iep_ticks: iep_ticks }),
            ClientState::Idle => {
                if tx.send(MsgType::SyncRequest, iep_ticks, self.requests) {
                    self.requests = self.requests.wrapping_add(1);
                    self.state = ClientState::ReplyPending;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Accepts a reply; unsolicited replies are dropped.
    pub fn on_reply(&mut self, reply: SyncReply) -> Option<SyncReply> {
        match self.state {
            ClientState::ReplyPending => {
                self.state = ClientState::Idle;
                Some(reply)
            }
            ClientState::Idle => None,
        }
    }

    pub fn reset(&mut self) {
        self.state = ClientState::Idle;
    }
}



/// Host wall clock.
pub trait WallClock {
    fn now_ns(&self) -> u64;

    /// Sleeps until about `deadline_ns`; may return early.
    fn sleep_until_ns(&self, deadline_ns: u64);
}

/// The system real-time clock.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_ns(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
    }

    fn sleep_until_ns(&self, deadline_ns: u64) {
        let now = self.now_ns();
        if deadline_ns > now {
            thread::sleep(Duration::from_nanos(deadline_ns - now));
        }
    }
}

/// Outcome of waiting for the next trigger deadline.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Alignment {
    /// The deadline was reached; trigger now.
    Aligned { deadline_ns: u64, late_ns: u64 },
    /// The deadline was missed by more than a period; realigned without triggering.
    Resynced { next_deadline_ns: u64, missed_periods: u64 },
}

/// Aligns the host trigger to period boundaries of the wall clock.
pub struct TriggerAligner {
    period_ns: u64,
    spin_window_ns: u64,
    next_deadline_ns: Option<u64>,
}

impl TriggerAligner {
    pub fn new(cfg: &SyncConfig) -> TriggerAligner {
        TriggerAligner {
            period_ns: cfg.period_ns.max(1),
            spin_window_ns: cfg.spin_window_ns,
            next_deadline_ns: None,
        }
    }

    fn next_boundary(&self, now_ns: u64) -> u64 {
        (now_ns / self.period_ns + 1) * self.period_ns
    }

    /// Sleeps, then spins up to the next deadline.
    pub fn wait<C: WallClock + ?Sized>(&mut self, clock: &C) -> Alignment {
        let now = clock.now_ns();
        let deadline = match self.next_deadline_ns {
            Some(deadline) => deadline,
            None => self.next_boundary(now),
        };
        if now > deadline.saturating_add(self.period_ns) {
            let next = self.next_boundary(now);
            self.next_deadline_ns = Some(next);
            return Alignment::Resynced {
                next_deadline_ns: next,
                missed_periods: (now - deadline) / self.period_ns,
            };
        }

        if now.saturating_add(self.spin_window_ns) < deadline {
            clock.sleep_until_ns(deadline - self.spin_window_ns);
        }
        let mut now = clock.now_ns();
        while now < deadline {
            hint::spin_loop();
            now = clock.now_ns();
        }
        self.next_deadline_ns = Some(deadline + self.period_ns);
        Alignment::Aligned { deadline_ns: deadline, late_ns: now - deadline }
    }

    /// Forgets the schedule; the next wait aligns to the next boundary.
    pub fn resync(&mut self) {
        self.next_deadline_ns = None;
    }
}
