//! Virtual harvester: picks the operating point of the harvesting transducer.
#![allow(non_snake_case)]

use serde::Deserialize;

use crate::def::CANARY_VALUE_U32;
use crate::error::Error;
use crate::Result;


/// Operating point tracking algorithm.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Constant voltage.
    Cv,
    /// Fractional open-circuit voltage.
    MpptVoc,
    /// Perturb and observe.
    MpptPo,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HarvesterConfig {
    pub algorithm: Algorithm,
    /// Fixed setpoint for `Cv`, starting point otherwise.
    pub voltage_uV: u32,
    pub voltage_min_uV: u32,
    pub voltage_max_uV: u32,
    /// Operating point as a fraction of the open-circuit voltage, 8 fractional bits.
    pub voc_ratio_n8: u32,
    /// Ticks between two measurements or perturbations.
    pub interval_n: u32,
    /// Ticks spent measuring the open-circuit voltage.
    pub duration_n: u32,
    pub step_uV: u32,
    pub canary: u32,
}

impl Default for HarvesterConfig {
    fn default() -> HarvesterConfig {
        HarvesterConfig {
            algorithm: Algorithm::Cv,
            voltage_uV: 2_500_000,
            voltage_min_uV: 0,
            voltage_max_uV: 5_000_000,
            voc_ratio_n8: 195, // 76%
            interval_n: 100,
            duration_n: 10,
            step_uV: 10_000,
            canary: CANARY_VALUE_U32,
        }
    }
}

impl HarvesterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.canary != CANARY_VALUE_U32 {
            return Err(Error::CanaryMismatch { expected: CANARY_VALUE_U32, found: self.canary });
        }
        if self.voltage_min_uV > self.voltage_max_uV {
            return Err(Error::InvalidConfig("harvester voltage range is empty".into()));
        }
        if self.interval_n == 0 {
            return Err(Error::InvalidConfig("harvester interval must be at least 1".into()));
        }
        if self.algorithm == Algorithm::MpptVoc && self.duration_n >= self.interval_n {
            return Err(Error::InvalidConfig(
                "open-circuit measurement must be shorter than the interval".into()));
        }
        if self.voc_ratio_n8 > 256 {
            return Err(Error::InvalidConfig("open-circuit ratio above 1".into()));
        }
        Ok(())
    }

    fn clamp(&self, voltage_uV: u32) -> u32 {
        voltage_uV.clamp(self.voltage_min_uV, self.voltage_max_uV)
    }
}


/// The point actually harvested during one tick.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HarvestPoint {
    pub voltage_uV: u32,
    pub current_nA: u32,
}

pub struct VirtualHarvester {
    cfg: HarvesterConfig,
    setpoint_uV: u32,
    counter: u32,
    voc_uV: u32,
    last_power: u64,
    rising: bool,
}

impl VirtualHarvester {
    pub fn new(cfg: HarvesterConfig) -> Result<VirtualHarvester> {
        cfg.validate()?;
        let setpoint = cfg.clamp(cfg.voltage_uV);
        Ok(VirtualHarvester {
            cfg: cfg,
            setpoint_uV: setpoint,
            counter: 0,
            voc_uV: 0,
            last_power: 0,
            rising: true,
        })
    }

    pub fn reset(&mut self) {
        self.setpoint_uV = self.cfg.clamp(self.cfg.voltage_uV);
        self.counter = 0;
        self.voc_uV = 0;
        self.last_power = 0;
        self.rising = true;
    }

    /// Voltage the transducer should be held at during the next tick.
    pub fn setpoint_uV(&self) -> u32 {
        self.setpoint_uV
    }

    /// Last measured open-circuit voltage.
    pub fn voc_uV(&self) -> u32 {
        self.voc_uV
    }

    /// Takes the measurement made at the current setpoint and moves the setpoint.
    pub fn step(&mut self, voltage_uV: u32, current_nA: u32) -> HarvestPoint {
        match self.cfg.algorithm {
            Algorithm::Cv => HarvestPoint { voltage_uV: voltage_uV, current_nA: current_nA },
            Algorithm::MpptVoc => self.step_voc(voltage_uV, current_nA),
            Algorithm::MpptPo => self.step_po(voltage_uV, current_nA),
        }
    }

    fn advance(&mut self) -> u32 {
        let position = self.counter;
        self.counter += 1;
        if self.counter >= self.cfg.interval_n {
            self.counter = 0;
        }
        position
    }

    fn step_voc(&mut self, voltage_uV: u32, current_nA: u32) -> HarvestPoint {
        let position = self.advance();
        let duration = self.cfg.duration_n;
        if position < duration {
            // Transducer disconnected: nothing is harvested.
            if position + 1 == duration {
                self.voc_uV = voltage_uV;
                let target = (voltage_uV as u64 * self.cfg.voc_ratio_n8 as u64) >> 8;
                self.setpoint_uV = self.cfg.clamp(target as u32);
            } else {
                self.setpoint_uV = self.cfg.voltage_max_uV;
            }
            return HarvestPoint { voltage_uV: voltage_uV, current_nA: 0 };
        }
        if position + 1 == self.cfg.interval_n {
            self.setpoint_uV = self.cfg.voltage_max_uV;
        }
        HarvestPoint { voltage_uV: voltage_uV, current_nA: current_nA }
    }

    fn step_po(&mut self, voltage_uV: u32, current_nA: u32) -> HarvestPoint {
        if self.advance() + 1 == self.cfg.interval_n {
            let power = voltage_uV as u64 * current_nA as u64;
            if power < self.last_power {
                self.rising = !self.rising;
            }
            self.last_power = power;
            let next = if self.rising {
                self.setpoint_uV.saturating_add(self.cfg.step_uV)
            } else {
                self.setpoint_uV.saturating_sub(self.cfg.step_uV)
            };
            self.setpoint_uV = self.cfg.clamp(next);
        }
        HarvestPoint { voltage_uV: voltage_uV, current_nA: current_nA }
    }
}
