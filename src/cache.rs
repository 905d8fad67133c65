//! Staging of emulation input samples in fast memory.
//!
//! The emulation input (a voltage/current trace) lives in slow host memory. The cache keeps a
//! sliding window of `blocks` contiguous blocks of `block_samples` samples in front of the
//! reader so that PRU0 never pays the slow-memory latency in the sample path. Maintenance does
//! at most one eviction and one fetch per call.
//!
//! Reads are served identically whether the cache is enabled or not; a disabled cache simply
//! forwards every read to the slow source.

use serde::Deserialize;

use crate::error::Error;
use crate::util::BitField64;
use crate::Result;



/// One input sample of the emulated harvesting source.
#[allow(non_snake_case)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IvSample {
    pub voltage_uV: u32,
    pub current_nA: u32,
}

/// Slow memory holding the input trace.
pub trait SampleSource {
    /// Number of samples already written by the producer of the trace.
    fn available(&self) -> usize;

    /// Reads one sample; indices past `available` read as zero.
    fn read(&self, index: usize) -> IvSample;
}

impl SampleSource for Vec<IvSample> {
    fn available(&self) -> usize {
        self.len()
    }

    fn read(&self, index: usize) -> IvSample {
        self.get(index).copied().unwrap_or_default()
    }
}

impl<'a, S: SampleSource + ?Sized> SampleSource for &'a S {
    fn available(&self) -> usize {
        (**self).available()
    }

    fn read(&self, index: usize) -> IvSample {
        (**self).read(index)
    }
}



/// Cache geometry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Number of blocks in the window, at most 64.
    pub blocks: u8,
    pub block_samples: u32,
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig { enabled: true, blocks: 16, block_samples: 256 }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.blocks == 0 || self.blocks > 64 {
            return Err(Error::InvalidConfig(format!("cache blocks {} outside 1..=64", self.blocks)));
        }
        if self.block_samples == 0 {
            return Err(Error::InvalidConfig("cache blocks must hold at least one sample".into()));
        }
        Ok(())
    }
}

/// What a maintenance tick did.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Maintenance {
    pub evicted: bool,
    pub fetched: bool,
}



/// Sliding window of input blocks in front of the reader.
pub struct StageCache<S> {
    source: S,
    config: CacheConfig,
    storage: Vec<IvSample>,
    present: BitField64,
    // Absolute block numbers: blocks [head, tail) are cached.
    head: usize,
    tail: usize,
    fill_level: u32,
    hits: u64,
    misses: u64,
}

impl<S: SampleSource> StageCache<S> {
    pub fn new(source: S, config: CacheConfig) -> Result<StageCache<S>> {
        config.validate()?;
        let storage = if config.enabled {
            vec![IvSample::default(); config.blocks as usize * config.block_samples as usize]
        } else {
            Vec::new()
        };
        Ok(StageCache {
            source: source,
            config: config,
            storage: storage,
            present: BitField64::new(config.blocks),
            head: 0,
            tail: 0,
            fill_level: 0,
            hits: 0,
            misses: 0,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    #[inline]
    fn block_samples(&self) -> usize {
        self.config.block_samples as usize
    }

    #[inline]
    fn slot(&self, block: usize) -> usize {
        block % self.config.blocks as usize
    }

    /// Reads input sample `index`, from the window if it is staged, from slow memory otherwise.
    #[inline]
    pub fn read(&mut self, index: usize) -> IvSample {
        if self.config.enabled {
            let block = index / self.block_samples();
            if block >= self.head && block < self.tail && self.present.test(self.slot(block) as u8) {
                self.hits += 1;
                let at = self.slot(block) * self.block_samples() + index % self.block_samples();
                return self.storage[at];
            }
        }
        self.misses += 1;
        self.source.read(index)
    }

    /// Advances the window for a reader positioned at sample `reader`.
    ///
    /// Evicts the oldest block if the reader is past it, then fetches the next block if the
    /// window has room and the producer has written it completely.
    pub fn maintain(&mut self, reader: usize) -> Maintenance {
        let mut done = Maintenance::default();
        if !self.config.enabled {
            return done;
        }
        let b = self.block_samples();
        let reader_block = reader / b;

        if self.head < self.tail && (self.head + 1) * b <= reader {
            let slot = self.slot(self.head) as u8;
            self.present.try_clear(slot);
            self.head += 1;
            self.fill_level -= 1;
            done.evicted = true;
        }
        if self.head == self.tail && self.tail < reader_block {
            // The reader ran past an empty window; restart it at the reader.
            self.head = reader_block;
            self.tail = reader_block;
        }

        let window_full = self.tail - self.head >= self.config.blocks as usize;
        let written = (self.tail + 1) * b <= self.source.available();
        if !window_full && written {
            let slot = self.slot(self.tail);
            let first = self.tail * b;
            for i in 0..b {
                self.storage[slot * b + i] = self.source.read(first + i);
            }
            self.present.try_set(slot as u8);
            self.tail += 1;
            self.fill_level += 1;
            done.fetched = true;
        }
        done
    }

    /// Drops all staged blocks and rewinds the window.
    pub fn reset(&mut self) {
        self.present.clear_all();
        self.head = 0;
        self.tail = 0;
        self.fill_level = 0;
        self.hits = 0;
        self.misses = 0;
    }

    pub fn fill_level(&self) -> u32 {
        self.fill_level
    }

    /// Number of set presence bits; always equal to `fill_level`.
    pub fn present_count(&self) -> u32 {
        self.present.count()
    }

    /// Number of blocks staged ahead of `reader`, including the reader's own block.
    pub fn blocks_ahead(&self, reader: usize) -> usize {
        let reader_block = reader / self.block_samples();
        self.tail.saturating_sub(reader_block.max(self.head))
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}
