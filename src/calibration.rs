//! Affine calibration of the analog front-end.
//!
//! ADC readings are converted as `si = raw * gain + offset`, DAC codes as
//! `raw = (si - offset) * inv_gain`, with gains in 20-bit fixed point. Conversions saturate at
//! the representable range instead of wrapping.
#![allow(non_snake_case)]

use serde::Deserialize;

use crate::def::{CANARY_VALUE_U32, DAC_MAX_RAW};
use crate::error::Error;
use crate::Result;


const GAIN_FRAC: u32 = 20;


/// ADC channel calibration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AdcCalibration {
    /// SI units (nA or µV) per LSB, 20 fractional bits.
    pub gain_n20: u32,
    pub offset: i32,
}

impl AdcCalibration {
    /// Converts a raw reading into nA or µV, clamped at zero.
    #[inline]
    pub fn raw_to_si(&self, raw: u32) -> u32 {
        let scaled = (raw as u64 * self.gain_n20 as u64) >> GAIN_FRAC;
        (scaled as i64 + self.offset as i64).clamp(0, u32::MAX as i64) as u32
    }

    /// Inverse conversion, used to synthesize raw readings.
    pub fn si_to_raw(&self, si: u32) -> u32 {
        let shifted = (si as i64 - self.offset as i64).max(0) as u128;
        let raw = (shifted << GAIN_FRAC) / self.gain_n20.max(1) as u128;
        raw.min(u32::MAX as u128) as u32
    }
}

impl Default for AdcCalibration {
    fn default() -> AdcCalibration {
        AdcCalibration { gain_n20: 1 << GAIN_FRAC, offset: 0 }
    }
}


/// DAC channel calibration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct DacCalibration {
    /// LSB per µV, 20 fractional bits.
    pub inv_gain_n20: u32,
    pub offset_uV: i32,
}

impl DacCalibration {
    /// Converts a voltage into a DAC code, saturating at the DAC's maximum code.
    #[inline]
    pub fn uV_to_raw(&self, voltage_uV: u32) -> u32 {
        let diff = voltage_uV as i64 - self.offset_uV as i64;
        if diff <= 0 {
            return 0;
        }
        let raw = (diff as u128 * self.inv_gain_n20 as u128) >> GAIN_FRAC;
        raw.min(DAC_MAX_RAW as u128) as u32
    }

    /// Voltage produced by a DAC code.
    pub fn raw_to_uV(&self, raw: u32) -> u32 {
        let scaled = ((raw as u128) << GAIN_FRAC) / self.inv_gain_n20.max(1) as u128;
        (scaled as i128 + self.offset_uV as i128).clamp(0, u32::MAX as i128) as u32
    }
}

impl Default for DacCalibration {
    fn default() -> DacCalibration {
        // 16 bit over 5 V
        DacCalibration { inv_gain_n20: 13_744, offset_uV: 0 }
    }
}


/// Calibration of all front-end channels, consumed read-only by the real-time loops.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Calibration {
    pub adc_current: AdcCalibration,
    pub adc_voltage: AdcCalibration,
    pub dac_voltage: DacCalibration,
    pub canary: u32,
}

impl Default for Calibration {
    fn default() -> Calibration {
        Calibration {
            adc_current: AdcCalibration::default(),
            adc_voltage: AdcCalibration::default(),
            dac_voltage: DacCalibration::default(),
            canary: CANARY_VALUE_U32,
        }
    }
}

impl Calibration {
    pub fn validate(&self) -> Result<()> {
        if self.canary != CANARY_VALUE_U32 {
            return Err(Error::CanaryMismatch { expected: CANARY_VALUE_U32, found: self.canary });
        }
        if self.adc_current.gain_n20 == 0 || self.adc_voltage.gain_n20 == 0
            || self.dac_voltage.inv_gain_n20 == 0 {
            return Err(Error::InvalidConfig("calibration gains must be non-zero".into()));
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adc_offset_clamps_at_zero() {
        let cal = AdcCalibration { gain_n20: 1 << 19, offset: -100 };
        assert_eq!(cal.raw_to_si(1000), 400);
        assert_eq!(cal.raw_to_si(100), 0);
    }

    #[test]
    fn adc_round_trip_is_close() {
        let cal = AdcCalibration { gain_n20: 200_000, offset: 50 };
        let raw = cal.si_to_raw(1_000_000);
        let back = cal.raw_to_si(raw);
        assert!(back <= 1_000_000 && back > 999_990);
    }

    #[test]
    fn dac_saturates_at_max_code() {
        let cal = DacCalibration::default();
        assert_eq!(cal.uV_to_raw(0), 0);
        assert_eq!(cal.uV_to_raw(u32::MAX), DAC_MAX_RAW);
        let half = cal.uV_to_raw(2_500_000);
        assert!(half > 32_700 && half < 32_800);
    }

    #[test]
    fn dac_below_offset_is_zero() {
        let cal = DacCalibration { inv_gain_n20: 1 << 20, offset_uV: 1000 };
        assert_eq!(cal.uV_to_raw(999), 0);
        assert_eq!(cal.uV_to_raw(1500), 500);
        assert_eq!(cal.raw_to_uV(500), 1500);
    }

    #[test]
    fn canary_is_checked() {
        let mut cal = Calibration::default();
        assert!(cal.validate().is_ok());
        cal.canary = 0;
        assert!(matches!(cal.validate(), Err(Error::CanaryMismatch { .. })));
    }
}
