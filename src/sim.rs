//! Simulated peripherals, for running both real-time loops on the host.
//!
//! [`SimFrontend`] models a linearized harvesting cell behind the harvester DAC and an ohmic
//! target load behind the target DAC. [`SimTimer`] is a tick-accurate IEP timer that only moves
//! when told to, and [`ManualClock`] a wall clock that advances by a fixed step on every read.
#![allow(non_snake_case)]

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::calibration::Calibration;
use crate::clock_sync::WallClock;
use crate::pubdef::DacChannel;
use crate::sampler::Frontend;
use crate::timing::Timer;


// Cycles charged for every frontend access.
const ACCESS_CYCLES: u32 = 40;


/// Analog front-end wired to a simulated cell and load.
#[derive(Clone, Debug)]
pub struct SimFrontend {
    calibration: Calibration,
    voc_uV: u32,
    isc_nA: u32,
    load_ohm: u32,
    dac: [u32; 2],
    power_good: bool,
    cycles: Cell<u32>,
}

impl Default for SimFrontend {
    fn default() -> SimFrontend {
        SimFrontend::new(Calibration::default())
    }
}

impl SimFrontend {
    /// A 5 V / 1 mA cell and no load.
    pub fn new(calibration: Calibration) -> SimFrontend {
        SimFrontend {
            calibration: calibration,
            voc_uV: 5_000_000,
            isc_nA: 1_000_000,
            load_ohm: 0,
            dac: [0; 2],
            power_good: false,
            cycles: Cell::new(0),
        }
    }

    pub fn with_cell(mut self, voc_uV: u32, isc_nA: u32) -> SimFrontend {
        self.voc_uV = voc_uV;
        self.isc_nA = isc_nA;
        self
    }

    /// Ohmic target load; zero disconnects the target.
    pub fn with_load(mut self, load_ohm: u32) -> SimFrontend {
        self.load_ohm = load_ohm;
        self
    }

    /// Last code written to a DAC channel.
    pub fn dac(&self, channel: DacChannel) -> u32 {
        self.dac[channel as usize]
    }

    pub fn power_good(&self) -> bool {
        self.power_good
    }

    /// Cell current at a given terminal voltage.
    pub fn cell_current_nA(&self, voltage_uV: u32) -> u32 {
        if voltage_uV >= self.voc_uV || self.voc_uV == 0 {
            return 0;
        }
        let headroom = (self.voc_uV - voltage_uV) as u64;
        (self.isc_nA as u64 * headroom / self.voc_uV as u64) as u32
    }

    fn charge(&self) {
        self.cycles.set(self.cycles.get().wrapping_add(ACCESS_CYCLES));
    }
}

impl Frontend for SimFrontend {
    fn read_input(&mut self) -> (u32, u32) {
        self.charge();
        let cal = self.calibration;
        let setpoint = cal.dac_voltage.raw_to_uV(self.dac(DacChannel::Harvester));
        let voltage = setpoint.min(self.voc_uV);
        let current = self.cell_current_nA(voltage);
        (cal.adc_voltage.si_to_raw(voltage), cal.adc_current.si_to_raw(current))
    }

    fn read_output_current(&mut self) -> u32 {
        self.charge();
        if self.load_ohm == 0 {
            return 0;
        }
        let cal = self.calibration;
        let voltage = cal.dac_voltage.raw_to_uV(self.dac(DacChannel::Target)) as u64;
        let current = (voltage * 1_000 / self.load_ohm as u64).min(u32::MAX as u64);
        cal.adc_current.si_to_raw(current as u32)
    }

    fn set_dac(&mut self, channel: DacChannel, raw: u32) {
        self.charge();
        self.dac[channel as usize] = raw;
    }

    fn set_power_good(&mut self, good: bool) {
        self.power_good = good;
    }

    fn cycles(&self) -> u32 {
        self.cycles.get()
    }
}



/// IEP timer advanced explicitly, tick by tick or in bulk.
#[derive(Clone, Debug)]
pub struct SimTimer {
    counter: u32,
    period: u32,
    compare: Option<u32>,
    wrapped: bool,
    matched: bool,
    gpio: u32,
}

impl SimTimer {
    pub fn new(period: u32) -> SimTimer {
        SimTimer {
            counter: 0,
            period: period.max(1),
            compare: None,
            wrapped: false,
            matched: false,
            gpio: 0,
        }
    }

    pub fn period(&self) -> u32 {
        self.period
    }

    pub fn set_gpio(&mut self, levels: u32) {
        self.gpio = levels;
    }

    /// Moves the counter forward, latching every wrap and compare match on the way.
    pub fn advance(&mut self, ticks: u32) {
        let mut left = ticks;
        while left > 0 {
            let step = left.min(self.period.saturating_sub(self.counter).max(1));
            let from = self.counter;
            let to = from + step;
            if let Some(compare) = self.compare {
                if from < compare && compare <= to {
                    self.matched = true;
                    self.compare = None;
                }
            }
            if to >= self.period {
                self.counter = 0;
                self.wrapped = true;
            } else {
                self.counter = to;
            }
            left -= step;
        }
    }
}

impl Timer for SimTimer {
    fn counter(&self) -> u32 {
        self.counter
    }

    fn set_period(&mut self, ticks: u32) {
        self.period = ticks.max(1);
    }

    fn take_wrap(&mut self) -> bool {
        std::mem::replace(&mut self.wrapped, false)
    }

    fn set_sample_compare(&mut self, ticks: u32) {
        self.compare = Some(ticks);
    }

    fn take_sample_match(&mut self) -> bool {
        std::mem::replace(&mut self.matched, false)
    }

    fn gpio(&self) -> u32 {
        self.gpio
    }
}



/// Wall clock that moves only by reading or sleeping.
#[derive(Debug)]
pub struct ManualClock {
    now_ns: AtomicU64,
    step_ns: u64,
}

impl ManualClock {
    pub fn new(start_ns: u64, step_ns: u64) -> ManualClock {
        ManualClock { now_ns: AtomicU64::new(start_ns), step_ns: step_ns }
    }

    pub fn set(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::Release);
    }

    pub fn advance(&self, delta_ns: u64) {
        self.now_ns.fetch_add(delta_ns, Ordering::AcqRel);
    }

    /// Current time, without moving the clock.
    pub fn peek(&self) -> u64 {
        self.now_ns.load(Ordering::Acquire)
    }
}

impl WallClock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.fetch_add(self.step_ns, Ordering::AcqRel)
    }

    fn sleep_until_ns(&self, deadline_ns: u64) {
        self.now_ns.fetch_max(deadline_ns, Ordering::AcqRel);
    }
}



#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_follows_harvester_setpoint() {
        let cal = Calibration::default();
        let mut fe = SimFrontend::default();
        fe.set_dac(DacChannel::Harvester, cal.dac_voltage.uV_to_raw(2_500_000));
        let (v_raw, i_raw) = fe.read_input();
        let voltage = cal.adc_voltage.raw_to_si(v_raw);
        let current = cal.adc_current.raw_to_si(i_raw);
        assert!((voltage as i64 - 2_500_000).abs() < 1_000, "{}", voltage);
        assert!((current as i64 - 500_000).abs() < 1_000, "{}", current);
        assert_eq!(fe.cycles(), 2 * ACCESS_CYCLES);
    }

    #[test]
    fn load_draws_ohmic_current() {
        let cal = Calibration::default();
        let mut fe = SimFrontend::default().with_load(1_000);
        assert_eq!(fe.read_output_current(), 0);
        fe.set_dac(DacChannel::Target, cal.dac_voltage.uV_to_raw(3_000_000));
        let current = cal.adc_current.raw_to_si(fe.read_output_current());
        assert!((current as i64 - 3_000_000).abs() < 2_000, "{}", current);
    }

    #[test]
    fn timer_latches_wrap_and_compare() {
        let mut timer = SimTimer::new(100);
        timer.set_sample_compare(30);
        timer.advance(29);
        assert!(!timer.take_sample_match());
        timer.advance(1);
        assert!(timer.take_sample_match());
        assert!(!timer.take_sample_match());
        timer.advance(75);
        assert!(timer.take_wrap());
        assert_eq!(timer.counter(), 5);
    }

    #[test]
    fn shortened_period_wraps_at_once() {
        let mut timer = SimTimer::new(100);
        timer.advance(80);
        timer.set_period(50);
        timer.advance(1);
        assert!(timer.take_wrap());
        assert_eq!(timer.counter(), 0);
    }

    #[test]
    fn manual_clock_steps_on_read() {
        let clock = ManualClock::new(1_000, 10);
        assert_eq!(clock.now_ns(), 1_000);
        assert_eq!(clock.now_ns(), 1_010);
        clock.sleep_until_ns(5_000);
        assert_eq!(clock.peek(), 5_000);
        clock.sleep_until_ns(10);
        assert_eq!(clock.peek(), 5_000);
    }
}
