// System paths
pub const PRUSS_DEVICE_PATH: &'static str = "/dev/uio0";


// Shared data RAM of the PRU subsystem, relative to the PRU memory base.
pub const DRAM2_OFFSET: usize = 0x10000;
pub const DRAM2_SIZE: usize = 0x03000; // 12kB


// Sentinel written once into every structure shared with the co-processors.
pub const CANARY_VALUE_U32: u32 = 0xdebac1e5;


// Free ring capacity; the buffer pool may not be larger.
pub const RING_CAPACITY: usize = 64;


// Timing
pub const TICK_NS: u64 = 5; // 200MHz IEP counter
pub const SYNC_PERIOD_NS: u64 = 100_000_000;
pub const SAMPLE_PERIOD_NS: u64 = 10_000;
pub const NOMINAL_PERIOD_TICKS: u32 = (SYNC_PERIOD_NS / TICK_NS) as u32;
pub const SAMPLES_PER_PERIOD: u32 = (SYNC_PERIOD_NS / SAMPLE_PERIOD_NS) as u32;


// Clock sync PI law
pub const SYNC_P_DIVISOR: i64 = 128;
pub const SYNC_I_DIVISOR: i64 = 256;
pub const SYNC_CORRECTION_LIMIT_DIVISOR: i64 = 250; // 0.4% of the nominal period
pub const TIMESTAMP_PLAUSIBLE_MIN_PERCENT: u64 = 95;
pub const TIMESTAMP_PLAUSIBLE_MAX_PERCENT: u64 = 105;


// Trigger alignment spin
pub const TRIGGER_SPIN_WINDOW_NS: u64 = 200_000;


// Sample buffers
pub const EDGE_LOG_CAPACITY: usize = 512;


// Converter
pub const LUT_SIZE: usize = 12;
pub const DAC_MAX_RAW: u32 = 0xffff;
