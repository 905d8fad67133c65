//! Session configuration, read from TOML.
//!
//! Every section is optional and falls back to its default. A configuration is only handed to
//! the engines after [`SessionConfig::validate`] accepted it.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::buffer::BufferPool;
use crate::cache::{CacheConfig, SampleSource, StageCache};
use crate::calibration::Calibration;
use crate::clock_sync::SyncConfig;
use crate::converter::{ConverterConfig, VirtualConverter};
use crate::def::{PRUSS_DEVICE_PATH, RING_CAPACITY, SAMPLES_PER_PERIOD};
use crate::error::Error;
use crate::harvester::{HarvesterConfig, VirtualHarvester};
use crate::pubdef::Mode;
use crate::sampler::Engines;
use crate::Result;


/// Location of the PRU memory.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UioConfig {
    pub device: String,
    /// Sysfs attribute holding the size of the PRU memory map.
    pub size_path: String,
}

impl Default for UioConfig {
    fn default() -> UioConfig {
        UioConfig {
            device: PRUSS_DEVICE_PATH.to_string(),
            size_path: "/sys/class/uio/uio0/maps/map0/size".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub mode: Mode,
    pub buffer_count: usize,
    pub samples_per_buffer: usize,
    /// Busy wait after a severe status event, in microseconds.
    pub severe_delay_us: u64,
    pub uio: UioConfig,
    pub sync: SyncConfig,
    pub cache: CacheConfig,
    pub converter: ConverterConfig,
    pub harvester: HarvesterConfig,
    pub calibration: Calibration,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            mode: Mode::Emulate,
            buffer_count: RING_CAPACITY,
            samples_per_buffer: SAMPLES_PER_PERIOD as usize,
            severe_delay_us: 10,
            uio: UioConfig::default(),
            sync: SyncConfig::default(),
            cache: CacheConfig::default(),
            converter: ConverterConfig::default(),
            harvester: HarvesterConfig::default(),
            calibration: Calibration::default(),
        }
    }
}

impl SessionConfig {
    /// Parses and validates a configuration.
    pub fn from_toml_str(text: &str) -> Result<SessionConfig> {
        let config: SessionConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<SessionConfig> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config = SessionConfig::from_toml_str(&text)?;
        log::info!("configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_count == 0 || self.buffer_count > RING_CAPACITY {
            return Err(Error::InvalidConfig(
                format!("buffer count {} outside 1..={}", self.buffer_count, RING_CAPACITY)));
        }
        if self.samples_per_buffer < self.sync.samples_per_period as usize {
            return Err(Error::InvalidConfig(format!(
                "{} samples per buffer cannot hold a period of {} samples",
                self.samples_per_buffer, self.sync.samples_per_period)));
        }
        self.sync.validate()?;
        self.cache.validate()?;
        self.calibration.validate()?;
        self.converter.validate()?;
        self.harvester.validate()
    }

    pub fn severe_delay(&self) -> Duration {
        Duration::from_micros(self.severe_delay_us)
    }

    pub fn buffer_pool(&self) -> Result<BufferPool> {
        BufferPool::new(self.buffer_count, self.samples_per_buffer)
    }

    /// Builds the engines of PRU0 over the input trace `source`.
    pub fn engines<S: SampleSource>(&self, source: S) -> Result<Engines<S>> {
        Ok(Engines {
            converter: VirtualConverter::new(self.converter.clone(), self.calibration)?,
            harvester: VirtualHarvester::new(self.harvester.clone())?,
            cache: StageCache::new(source, self.cache)?,
            calibration: self.calibration,
        })
    }
}
