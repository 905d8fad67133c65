//! Real-time coordination core of an energy-harvesting emulator running on the two TI
//! Programmable Real-time Units (PRU) of a Sitara SoC and on the host processor.
//!
//! The crate covers what flows between the three actors:
//!
//! * lock-free mailboxes and status channels in PRU shared memory,
//! * the hand-over of fixed-size sample buffers from PRU0 to the host, which never blocks PRU0,
//! * the phase lock of the PRU1 timer onto the host wall clock,
//! * a fixed-point model of the harvesting front end and of the power converter feeding the
//!   emulated target.
//!
//!
//! # Design rationale
//!
//! All shared state lives in one [`SharedMem`] arena, either on the heap for simulation or in the
//! PRU shared data RAM mapped through the `uio_pruss` device. The arena is split exactly once into
//! per-actor ports ([`Ports`]); each port only exposes the operations its actor is allowed to
//! perform, so that the single-writer rule of every mailbox is enforced by the type system rather
//! than by convention.
//!
//! The two real-time loops ([`SamplingLoop`] and [`TimingLoop`]) are explicit state machines whose
//! `step` never blocks and never fails: faults are reported through the status channel of the
//! actor and collected on the host by the [`MessagePump`].
//!
//!
//! # Hello world
//!
//! ```
//! use shepherd::{BufferPool, SessionState, SharedRegion};
//! use std::time::Duration;
//!
//! let region = SharedRegion::heap();
//! let pool = BufferPool::new(4, 100).unwrap();
//! let ports = region.split(&pool, Duration::from_micros(10)).unwrap();
//!
//! ports.session.set_state(SessionState::Armed).unwrap();
//! let buffer = ports.pru0.acquire_free_buffer().unwrap();
//! assert_eq!(buffer.capacity(), 100);
//! assert_eq!(region.free_ring().len(), 3);
//! ```

extern crate libc;

mod def;
mod error;
mod pubdef;
pub mod util;

pub mod buffer;
pub mod cache;
pub mod calibration;
pub mod clock_sync;
pub mod config;
pub mod converter;
pub mod fixed;
pub mod harvester;
pub mod host;
pub mod mailbox;
pub mod sampler;
pub mod shared;
pub mod sim;
pub mod timing;

pub use buffer::{BufferHandle, BufferMeta, BufferPool, FilledBuffer, FreeRing, SampleBuffer};
pub use clock_sync::{SyncClient, SyncConfig, SyncController};
pub use config::SessionConfig;
pub use converter::{ConverterConfig, VirtualConverter};
pub use error::Error;
pub use host::{HostEvent, HostSync, MessagePump, PeriodicTimer};
pub use pubdef::*;
pub use sampler::{Engines, Frontend, SamplingLoop};
pub use shared::{Ports, SharedMem, SharedRegion};
pub use timing::{Timer, TimingLoop};

use std::result;



/// Result type of the set-up and supervision paths.
pub type Result<T> = result::Result<T, Error>;
