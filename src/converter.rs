//! Virtual power converter.
//!
//! Emulates a harvesting front-end charging a storage capacitor that supplies the target
//! through an optional buck regulator with a hysteretic enable. One sample tick runs four
//! phases, each taking the token produced by the previous one so that they can only be called in
//! order:
//!
//! 1. [`VirtualConverter::calc_inp_power`]: power flowing in from the harvester,
//! 2. [`VirtualConverter::calc_out_power`]: power drawn by the target plus leakage,
//! 3. [`VirtualConverter::update_cap_storage`]: integration into the storage voltage,
//! 4. [`VirtualConverter::update_states_and_output`]: hysteresis and emulated output voltage.
//!
//! Units: voltages in µV, currents in nA, powers in fW (µV × nA) with 8 fractional bits, the
//! storage voltage in µV with 32 fractional bits.
#![allow(non_snake_case)]

use serde::Deserialize;

use crate::calibration::Calibration;
use crate::def::{CANARY_VALUE_U32, LUT_SIZE};
use crate::error::Error;
use crate::fixed::{log2_safe, UFixed};
use crate::Result;


/// Power in femtowatts, 8 fractional bits.
pub type Power = UFixed<8>;

/// Storage voltage in microvolts, 32 fractional bits.
pub type StorageVoltage = UFixed<32>;

const ETA_ONE_N8: u64 = 1 << 8;


/// Parameter block of the virtual converter.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Without storage the output follows the input voltage directly.
    pub enable_storage: bool,
    /// Input boost converter: input voltage is not limited by the storage voltage.
    pub enable_boost: bool,
    /// Output buck regulator: output is limited to `V_output_uV`.
    pub enable_buck: bool,

    /// Number of ticks after (re)start during which no output power is drawn.
    pub interval_startup_delay_drain_n: u32,

    pub V_input_max_uV: u32,
    pub I_input_max_nA: u32,
    /// Forward drop of the input diode.
    pub V_input_drop_uV: u32,
    /// Series resistor limiting the charge current without boost, zero to disable.
    pub R_input_kOhm: u32,
    /// Minimum input voltage at which the boost converter operates.
    pub V_input_boost_threshold_uV: u32,

    /// Sample period divided by storage capacitance, 28 fractional bits.
    pub Constant_us_per_nF_n28: u32,
    pub V_intermediate_init_uV: u32,
    pub V_intermediate_max_uV: u32,
    pub I_intermediate_leak_nA: u32,

    pub V_enable_output_threshold_uV: u32,
    pub V_disable_output_threshold_uV: u32,
    /// Charge taken from storage by the output capacitor when the output switches on.
    pub dV_enable_output_uV: u32,
    /// Hysteresis is evaluated every this many ticks.
    pub interval_check_thresholds_n: u32,

    pub V_pwr_good_enable_threshold_uV: u32,
    pub V_pwr_good_disable_threshold_uV: u32,

    pub V_output_uV: u32,
    pub V_buck_drop_uV: u32,

    pub LUT_input_V_min_log2_uV: u32,
    pub LUT_input_I_min_log2_nA: u32,
    pub LUT_output_I_min_log2_nA: u32,
    /// Input efficiency, 8 fractional bits, indexed by `[voltage bucket][current bucket]`.
    pub LUT_inp_efficiency_n8: [[u8; LUT_SIZE]; LUT_SIZE],
    /// Inverse output efficiency, 8 fractional bits, indexed by current bucket.
    pub LUT_out_inv_efficiency_n8: [u32; LUT_SIZE],

    pub canary: u32,
}

impl Default for ConverterConfig {
    fn default() -> ConverterConfig {
        ConverterConfig {
            enable_storage: true,
            enable_boost: false,
            enable_buck: false,
            interval_startup_delay_drain_n: 0,
            V_input_max_uV: 10_000_000,
            I_input_max_nA: 50_000_000,
            V_input_drop_uV: 0,
            R_input_kOhm: 0,
            V_input_boost_threshold_uV: 0,
            Constant_us_per_nF_n28: ConverterConfig::time_constant_n28(10, 10_000),
            V_intermediate_init_uV: 3_000_000,
            V_intermediate_max_uV: 5_000_000,
            I_intermediate_leak_nA: 0,
            V_enable_output_threshold_uV: 3_000_000,
            V_disable_output_threshold_uV: 2_300_000,
            dV_enable_output_uV: 0,
            interval_check_thresholds_n: 1,
            V_pwr_good_enable_threshold_uV: 2_800_000,
            V_pwr_good_disable_threshold_uV: 2_400_000,
            V_output_uV: 3_300_000,
            V_buck_drop_uV: 0,
            LUT_input_V_min_log2_uV: 17,
            LUT_input_I_min_log2_nA: 10,
            LUT_output_I_min_log2_nA: 10,
            LUT_inp_efficiency_n8: [[230; LUT_SIZE]; LUT_SIZE],
            LUT_out_inv_efficiency_n8: [ETA_ONE_N8 as u32; LUT_SIZE],
            canary: CANARY_VALUE_U32,
        }
    }
}

impl ConverterConfig {
    /// Computes `Constant_us_per_nF_n28` for a sample period and a storage capacitance.
    pub fn time_constant_n28(sample_period_us: u32, capacitance_nF: u32) -> u32 {
        let value = ((sample_period_us as u64) << 28) / capacitance_nF.max(1) as u64;
        value.min(u32::MAX as u64) as u32
    }

    pub fn validate(&self) -> Result<()> {
        if self.canary != CANARY_VALUE_U32 {
            return Err(Error::CanaryMismatch { expected: CANARY_VALUE_U32, found: self.canary });
        }
        if self.interval_check_thresholds_n == 0 {
            return Err(Error::InvalidConfig("threshold check interval must be at least 1".into()));
        }
        if self.V_enable_output_threshold_uV < self.V_disable_output_threshold_uV {
            return Err(Error::InvalidConfig("output enable threshold below disable threshold".into()));
        }
        if self.V_pwr_good_enable_threshold_uV < self.V_pwr_good_disable_threshold_uV {
            return Err(Error::InvalidConfig("power-good enable threshold below disable threshold".into()));
        }
        if self.V_intermediate_max_uV == 0 {
            return Err(Error::InvalidConfig("storage maximum voltage must be positive".into()));
        }
        if self.LUT_input_V_min_log2_uV >= 32 || self.LUT_input_I_min_log2_nA >= 32
            || self.LUT_output_I_min_log2_nA >= 32 {
            return Err(Error::InvalidConfig("LUT offsets must be below 32".into()));
        }
        Ok(())
    }

    #[inline]
    fn input_efficiency_n8(&self, voltage_uV: u32, current_nA: u32) -> u64 {
        let v = lut_bucket(voltage_uV, self.LUT_input_V_min_log2_uV);
        let i = lut_bucket(current_nA, self.LUT_input_I_min_log2_nA);
        self.LUT_inp_efficiency_n8[v][i] as u64
    }

    #[inline]
    fn output_inv_efficiency_n8(&self, current_nA: u32) -> u64 {
        self.LUT_out_inv_efficiency_n8[lut_bucket(current_nA, self.LUT_output_I_min_log2_nA)] as u64
    }
}

/// Logarithmic table bucket, clamped to the last entry.
#[inline]
fn lut_bucket(value: u32, min_log2: u32) -> usize {
    (log2_safe(value >> min_log2.min(31)) as usize).min(LUT_SIZE - 1)
}



/// Dynamic state of the converter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConverterState {
    pub P_inp_fW: Power,
    pub P_out_fW: Power,
    pub V_mid_uV: StorageVoltage,
    /// Input voltage after drop and limits, before it is pulled down to storage.
    pub V_input_uV: u32,
    pub output_enabled: bool,
    pub V_out_uV: u32,
    pub V_out_dac_raw: u32,
    pub power_good: bool,
    startup_drain_left: u32,
    check_counter: u32,
}

impl ConverterState {
    /// Integer part of the storage voltage.
    pub fn storage_uV(&self) -> u32 {
        self.V_mid_uV.to_u32()
    }
}

/// Result of the last phase, applied to the DAC and power-good line by the caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConverterOutput {
    pub V_out_uV: u32,
    pub dac_raw: u32,
    pub power_good: bool,
}

/// Proof that phase 1 ran in the current tick.
#[must_use]
pub struct InputPhase(());

/// Proof that phase 2 ran in the current tick.
#[must_use]
pub struct OutputPhase(());

/// Proof that phase 3 ran in the current tick.
#[must_use]
pub struct StoragePhase(());



/// The virtual converter.
pub struct VirtualConverter {
    cfg: ConverterConfig,
    cal: Calibration,
    state: ConverterState,
}

impl VirtualConverter {
    pub fn new(cfg: ConverterConfig, cal: Calibration) -> Result<VirtualConverter> {
        cfg.validate()?;
        cal.validate()?;
        let mut converter = VirtualConverter {
            state: initial_state(&cfg),
            cfg: cfg,
            cal: cal,
        };
        converter.reset();
        Ok(converter)
    }

    /// Returns to the initial state, restarting the startup drain delay.
    pub fn reset(&mut self) {
        self.state = initial_state(&self.cfg);
        let output = self.output_voltage();
        self.state.V_out_uV = output;
        self.state.V_out_dac_raw = self.cal.dac_voltage.uV_to_raw(output);
    }

    pub fn state(&self) -> &ConverterState {
        &self.state
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.cfg
    }

    /// Phase 1: input power from the harvested voltage and current.
    pub fn calc_inp_power(&mut self, voltage_uV: u32, current_nA: u32) -> InputPhase {
        let cfg = &self.cfg;
        let mut voltage = voltage_uV.saturating_sub(cfg.V_input_drop_uV).min(cfg.V_input_max_uV);
        let mut current = current_nA.min(cfg.I_input_max_nA);
        self.state.V_input_uV = voltage;

        let eta_n8 = if cfg.enable_boost {
            if voltage < cfg.V_input_boost_threshold_uV {
                voltage = 0;
            }
            cfg.input_efficiency_n8(voltage, current)
        } else {
            let storage = self.state.V_mid_uV.to_u32();
            if cfg.enable_storage {
                if voltage <= storage {
                    // input diode blocks
                    voltage = 0;
                } else {
                    if cfg.R_input_kOhm > 0 {
                        let limit = UFixed::<0>::from_int((voltage - storage) as u64)
                            .div_lut(cfg.R_input_kOhm);
                        current = current.min(limit.to_u32());
                    }
                    voltage = storage;
                }
            }
            ETA_ONE_N8
        };

        let raw_power = UFixed::<0>::from_int(voltage as u64).mul_int(current as u64);
        self.state.P_inp_fW = raw_power.mul_into(UFixed::<8>::from_raw(eta_n8));
        InputPhase(())
    }

    /// Phase 2: output power from the raw output current reading.
    pub fn calc_out_power(&mut self, _: InputPhase, current_adc_raw: u32) -> OutputPhase {
        let current = self.cal.adc_current.raw_to_si(current_adc_raw);
        let inv_eta_n8 = self.cfg.output_inv_efficiency_n8(current);
        let load = UFixed::<0>::from_int(self.state.V_out_uV as u64).mul_int(current as u64);
        let load: Power = load.mul_into(UFixed::<8>::from_raw(inv_eta_n8));
        let leak = UFixed::<0>::from_int(self.state.V_mid_uV.to_int())
            .mul_int(self.cfg.I_intermediate_leak_nA as u64);

        self.state.P_out_fW = if self.state.startup_drain_left > 0 {
            self.state.startup_drain_left -= 1;
            Power::ZERO
        } else {
            load + leak.rescale()
        };
        OutputPhase(())
    }

    /// Phase 3: integrates the power balance into the storage voltage.
    pub fn update_cap_storage(&mut self, _: OutputPhase) -> StoragePhase {
        let cfg = &self.cfg;
        let floor = StorageVoltage::from_int(1);
        let ceiling = StorageVoltage::from_int(cfg.V_intermediate_max_uV as u64);

        if !cfg.enable_storage {
            self.state.V_mid_uV = StorageVoltage::from_int(self.state.V_input_uV as u64)
                .clamp_to(floor, ceiling);
            return StoragePhase(());
        }

        let old = self.state.V_mid_uV;
        let voltage = old.to_u32().max(1);
        let (p_in, p_out) = (self.state.P_inp_fW, self.state.P_out_fW);
        let charging = p_in >= p_out;
        let delta_power = if charging { p_in - p_out } else { p_out - p_in };
        let current_n8 = delta_power.div_lut(voltage);
        let dV: StorageVoltage =
            current_n8.mul_into(UFixed::<28>::from_raw(cfg.Constant_us_per_nF_n28 as u64));

        let mut next = if charging { old + dV } else { old - dV };
        if !cfg.enable_boost && !p_in.is_zero() {
            next = next.min(StorageVoltage::from_int(self.state.V_input_uV as u64).max(old));
        }
        self.state.V_mid_uV = next.clamp_to(floor, ceiling);
        StoragePhase(())
    }

    /// Phase 4: hysteresis, power-good and emulated output voltage.
    pub fn update_states_and_output(&mut self, _: StoragePhase) -> ConverterOutput {
        self.state.check_counter += 1;
        if self.state.check_counter >= self.cfg.interval_check_thresholds_n {
            self.state.check_counter = 0;
            self.check_thresholds();
        }

        let output = self.output_voltage();
        self.state.V_out_uV = output;
        self.state.V_out_dac_raw = self.cal.dac_voltage.uV_to_raw(output);
        ConverterOutput {
            V_out_uV: output,
            dac_raw: self.state.V_out_dac_raw,
            power_good: self.state.power_good,
        }
    }

    /// Runs all four phases of one tick.
    pub fn tick(&mut self, voltage_uV: u32, current_nA: u32, current_adc_raw: u32)
        -> ConverterOutput {
        let input = self.calc_inp_power(voltage_uV, current_nA);
        let output = self.calc_out_power(input, current_adc_raw);
        let storage = self.update_cap_storage(output);
        self.update_states_and_output(storage)
    }

    fn check_thresholds(&mut self) {
        let cfg = &self.cfg;
        let storage = self.state.V_mid_uV.to_u32();
        if self.state.output_enabled {
            if storage < cfg.V_disable_output_threshold_uV {
                self.state.output_enabled = false;
            }
        } else if storage >= cfg.V_enable_output_threshold_uV {
            self.state.output_enabled = true;
            let debit = StorageVoltage::from_int(cfg.dV_enable_output_uV as u64);
            self.state.V_mid_uV = (self.state.V_mid_uV - debit).max(StorageVoltage::from_int(1));
        }

        let storage = self.state.V_mid_uV.to_u32();
        if storage >= cfg.V_pwr_good_enable_threshold_uV {
            self.state.power_good = true;
        } else if storage < cfg.V_pwr_good_disable_threshold_uV {
            self.state.power_good = false;
        }
    }

    fn output_voltage(&self) -> u32 {
        if !self.state.output_enabled {
            return 0;
        }
        let voltage = self.state.V_mid_uV.to_u32().saturating_sub(self.cfg.V_buck_drop_uV);
        if self.cfg.enable_buck {
            voltage.min(self.cfg.V_output_uV)
        } else {
            voltage
        }
    }
}

fn initial_state(cfg: &ConverterConfig) -> ConverterState {
    let storage = StorageVoltage::from_int(cfg.V_intermediate_init_uV as u64)
        .clamp_to(StorageVoltage::from_int(1),
                  StorageVoltage::from_int(cfg.V_intermediate_max_uV as u64));
    let storage_uV = storage.to_u32();
    ConverterState {
        P_inp_fW: Power::ZERO,
        P_out_fW: Power::ZERO,
        V_mid_uV: storage,
        V_input_uV: 0,
        output_enabled: storage_uV >= cfg.V_enable_output_threshold_uV,
        V_out_uV: 0,
        V_out_dac_raw: 0,
        power_good: storage_uV >= cfg.V_pwr_good_enable_threshold_uV,
        startup_drain_left: cfg.interval_startup_delay_drain_n,
        check_counter: 0,
    }
}



#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cold_start_config() -> ConverterConfig {
        ConverterConfig {
            enable_boost: false,
            V_intermediate_init_uV: 2_000_000,
            interval_startup_delay_drain_n: 50,
            ..ConverterConfig::default()
        }
    }

    #[test]
    fn cold_start_charges_without_drain() {
        let mut converter = VirtualConverter::new(cold_start_config(), Calibration::default())
            .unwrap();
        let mut previous = converter.state().V_mid_uV;
        for tick in 0..50 {
            let input = converter.calc_inp_power(3_300_000, 500_000);
            let output = converter.calc_out_power(input, 40_000_000);
            assert!(converter.state().P_out_fW.is_zero(), "tick {}", tick);
            let storage = converter.update_cap_storage(output);
            converter.update_states_and_output(storage);
            let now = converter.state().V_mid_uV;
            assert!(now > previous, "tick {}: {:?} <= {:?}", tick, now, previous);
            previous = now;
        }
        // about 500 µV per tick at 10 µF and 1 mW
        let gained = previous.to_u32() - 2_000_000;
        assert!(gained > 24_000 && gained < 26_000, "{}", gained);
    }

    #[test]
    fn drain_starts_after_startup_delay() {
        let mut converter = VirtualConverter::new(ConverterConfig {
            V_intermediate_init_uV: 4_000_000,
            interval_startup_delay_drain_n: 2,
            ..ConverterConfig::default()
        }, Calibration::default()).unwrap();
        for _ in 0..2 {
            converter.tick(0, 0, 1_000_000);
            assert!(converter.state().P_out_fW.is_zero());
        }
        converter.tick(0, 0, 1_000_000);
        assert!(!converter.state().P_out_fW.is_zero());
    }

    #[test]
    fn reset_restarts_startup_delay() {
        let mut converter = VirtualConverter::new(ConverterConfig {
            V_intermediate_init_uV: 4_000_000,
            interval_startup_delay_drain_n: 2,
            ..ConverterConfig::default()
        }, Calibration::default()).unwrap();
        for _ in 0..3 {
            converter.tick(0, 0, 1_000_000);
        }
        assert!(!converter.state().P_out_fW.is_zero());

        converter.reset();
        for _ in 0..2 {
            converter.tick(0, 0, 1_000_000);
            assert!(converter.state().P_out_fW.is_zero());
        }
        converter.tick(0, 0, 1_000_000);
        assert!(!converter.state().P_out_fW.is_zero());
    }

    #[test]
    fn boost_disabled_input_limited_to_storage() {
        let mut converter = VirtualConverter::new(ConverterConfig {
            V_intermediate_init_uV: 2_000_000,
            ..ConverterConfig::default()
        }, Calibration::default()).unwrap();
        let _ = converter.calc_inp_power(3_300_000, 1_000);
        assert_eq!(converter.state().P_inp_fW.to_int(), 2_000_000 * 1_000);

        // Input below storage: the diode blocks.
        let mut converter = VirtualConverter::new(ConverterConfig {
            V_intermediate_init_uV: 4_000_000,
            ..ConverterConfig::default()
        }, Calibration::default()).unwrap();
        let _ = converter.calc_inp_power(3_300_000, 1_000);
        assert!(converter.state().P_inp_fW.is_zero());
    }

    #[test]
    fn storage_never_exceeds_input_without_boost() {
        let mut converter = VirtualConverter::new(ConverterConfig {
            V_intermediate_init_uV: 2_999_990,
            Constant_us_per_nF_n28: ConverterConfig::time_constant_n28(10, 1),
            ..ConverterConfig::default()
        }, Calibration::default()).unwrap();
        converter.tick(3_000_000, 10_000_000, 0);
        assert_eq!(converter.state().storage_uV(), 3_000_000);
    }

    #[test]
    fn trickle_resistor_limits_current() {
        let mut converter = VirtualConverter::new(ConverterConfig {
            V_intermediate_init_uV: 2_000_000,
            R_input_kOhm: 1_000,
            ..ConverterConfig::default()
        }, Calibration::default()).unwrap();
        let _ = converter.calc_inp_power(3_000_000, 10_000_000);
        // (3 V - 2 V) / 1 MOhm = 1 µA
        let current = converter.state().P_inp_fW.to_int() / 2_000_000;
        assert!(current <= 1_000 && current > 990, "{}", current);
    }

    #[test]
    fn boost_applies_efficiency_table() {
        let mut cfg = ConverterConfig {
            enable_boost: true,
            V_input_boost_threshold_uV: 500_000,
            ..ConverterConfig::default()
        };
        cfg.LUT_inp_efficiency_n8 = [[128; LUT_SIZE]; LUT_SIZE];
        let mut converter = VirtualConverter::new(cfg, Calibration::default()).unwrap();
        let _ = converter.calc_inp_power(1_000_000, 1_000);
        assert_eq!(converter.state().P_inp_fW.to_int(), 500_000_000);
        let _ = converter.calc_inp_power(400_000, 1_000);
        assert!(converter.state().P_inp_fW.is_zero());
    }

    #[test]
    fn lut_index_clamps_to_last_entry() {
        assert_eq!(lut_bucket(u32::MAX, 0), LUT_SIZE - 1);
        assert_eq!(lut_bucket(0, 10), 0);
        assert_eq!(lut_bucket(1 << 13, 10), 3);
    }

    #[test]
    fn hysteresis_round_trip_applies_inrush_debit() {
        let cfg = ConverterConfig {
            V_intermediate_init_uV: 3_200_000,
            V_enable_output_threshold_uV: 3_000_000,
            V_disable_output_threshold_uV: 2_500_000,
            dV_enable_output_uV: 100_000,
            V_intermediate_max_uV: 5_000_000,
            ..ConverterConfig::default()
        };
        let mut converter = VirtualConverter::new(cfg, Calibration::default()).unwrap();
        assert!(converter.state().output_enabled);

        // Discharge through the target until the output switches off.
        let mut ticks = 0;
        while converter.state().output_enabled {
            let out = converter.tick(0, 0, 20_000_000);
            ticks += 1;
            assert!(ticks < 100_000);
            if !converter.state().output_enabled {
                assert!(converter.state().storage_uV() < 2_500_000);
                assert_eq!(out.V_out_uV, 0);
            }
        }

        // Recharge without load until it switches back on.
        loop {
            let input = converter.calc_inp_power(4_500_000, 20_000_000);
            let output = converter.calc_out_power(input, 0);
            let storage = converter.update_cap_storage(output);
            let before = converter.state().V_mid_uV;
            let out = converter.update_states_and_output(storage);
            if converter.state().output_enabled {
                assert!(before.to_u32() >= 3_000_000);
                assert_eq!(before - converter.state().V_mid_uV, StorageVoltage::from_int(100_000));
                assert!(out.V_out_uV > 0);
                break;
            }
            assert_eq!(out.V_out_uV, 0);
            assert_eq!(out.dac_raw, 0);
        }
    }

    #[test]
    fn thresholds_only_checked_on_interval() {
        let cfg = ConverterConfig {
            V_intermediate_init_uV: 2_000_000,
            interval_check_thresholds_n: 4,
            ..ConverterConfig::default()
        };
        let mut converter = VirtualConverter::new(cfg, Calibration::default()).unwrap();
        assert!(!converter.state().output_enabled);
        converter.state.V_mid_uV = StorageVoltage::from_int(4_000_000);
        for _ in 0..3 {
            converter.tick(0, 0, 0);
            assert!(!converter.state().output_enabled);
        }
        converter.tick(0, 0, 0);
        assert!(converter.state().output_enabled);
        assert!(converter.state().power_good);
    }

    #[test]
    fn buck_limits_output_and_dac_follows() {
        let cfg = ConverterConfig {
            enable_buck: true,
            V_intermediate_init_uV: 4_500_000,
            V_output_uV: 3_300_000,
            V_buck_drop_uV: 200_000,
            ..ConverterConfig::default()
        };
        let cal = Calibration::default();
        let mut converter = VirtualConverter::new(cfg, cal).unwrap();
        let out = converter.tick(0, 0, 0);
        assert_eq!(out.V_out_uV, 3_300_000);
        assert_eq!(out.dac_raw, cal.dac_voltage.uV_to_raw(3_300_000));
    }

    #[test]
    fn without_storage_output_follows_input() {
        let cfg = ConverterConfig {
            enable_storage: false,
            V_intermediate_init_uV: 3_000_000,
            ..ConverterConfig::default()
        };
        let mut converter = VirtualConverter::new(cfg, Calibration::default()).unwrap();
        let out = converter.tick(3_600_000, 1_000, 0);
        assert_eq!(converter.state().storage_uV(), 3_600_000);
        assert_eq!(out.V_out_uV, 3_600_000);
    }

    proptest! {
        #[test]
        fn storage_stays_within_bounds(
            boost in any::<bool>(),
            ticks in prop::collection::vec((0u32..20_000_000, 0u32..100_000_000, any::<u32>()), 1..200)
        ) {
            let cfg = ConverterConfig {
                enable_boost: boost,
                V_intermediate_max_uV: 4_200_000,
                Constant_us_per_nF_n28: ConverterConfig::time_constant_n28(10, 100),
                ..ConverterConfig::default()
            };
            let mut converter = VirtualConverter::new(cfg, Calibration::default()).unwrap();
            for (voltage, current, load) in ticks {
                let out = converter.tick(voltage, current, load);
                let storage = converter.state().storage_uV();
                prop_assert!(storage >= 1 && storage <= 4_200_000);
                prop_assert!(out.V_out_uV <= storage);
            }
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = ConverterConfig { interval_check_thresholds_n: 0, ..ConverterConfig::default() };
        assert!(VirtualConverter::new(cfg, Calibration::default()).is_err());
        let cfg = ConverterConfig { canary: 1, ..ConverterConfig::default() };
        assert!(matches!(VirtualConverter::new(cfg, Calibration::default()),
                         Err(Error::CanaryMismatch { .. })));
    }
}
