//! Runs a short emulation session on the host, with simulated PRUs.
//!
//! This example demonstrates:
//!
//! * splitting the shared arena into the ports of the three actors,
//! * PRU0 sampling on its own thread while PRU1 is driven in lock step with the host clock,
//! * the message pump running on a cancellable periodic timer.
//!
//! An optional argument names a TOML session configuration; run with `RUST_LOG=debug` to see the
//! state transitions of both loops.

extern crate crossbeam;
extern crate env_logger;
extern crate shepherd;

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use shepherd::cache::{CacheConfig, IvSample};
use shepherd::host::{HostEvent, HostSync, MessagePump, PeriodicTimer};
use shepherd::sim::{ManualClock, SimFrontend, SimTimer};
use shepherd::{FilledBuffer, SamplingLoop, SessionConfig, SessionState, SharedRegion, SyncConfig};
use shepherd::{Timer, TimingLoop};


const PERIODS: u32 = 8;


fn demo_config() -> SessionConfig {
    SessionConfig {
        buffer_count: 8,
        samples_per_buffer: 100,
        sync: SyncConfig { period_ns: 1_000_000, tick_ns: 5, samples_per_period: 100, spin_window_ns: 0 },
        cache: CacheConfig { enabled: true, blocks: 8, block_samples: 32 },
        ..SessionConfig::default()
    }
}

// A cell slowly losing light.
fn trace(len: usize) -> Vec<IvSample> {
    (0..len)
        .map(|i| IvSample {
            voltage_uV: 4_200_000 - (i as u32 % 1_000) * 500,
            current_nA: 800_000 - (i as u32 % 1_000) * 200,
        })
        .collect()
}


fn main() {
    env_logger::init();

    let cfg = match env::args().nth(1) {
        Some(path) => SessionConfig::load(&path).unwrap_or_else(|e| panic!("{}: {}", path, e)),
        None => demo_config(),
    };
    let samples = cfg.sync.samples_per_period;
    let interval = cfg.sync.nominal_ticks() / samples;

    let region = SharedRegion::heap();
    let pool = cfg.buffer_pool().unwrap();
    let ports = region.split(&pool, cfg.severe_delay()).unwrap();
    ports.session.set_mode(cfg.mode).unwrap();
    let session = ports.session;

    let engines = cfg.engines(trace((samples * PERIODS) as usize)).unwrap();
    let mut sampler = SamplingLoop::new(ports.pru0, SimFrontend::default().with_load(2_000), engines);
    let mut timing = TimingLoop::new(ports.pru1, SimTimer::new(cfg.sync.nominal_ticks()), cfg.sync);
    let mut sync = HostSync::new(ports.sync, cfg.sync, ManualClock::new(0, 1)).unwrap();
    let (events_tx, events_rx) = crossbeam::channel::unbounded();
    let mut pump = MessagePump::new(ports.pump, session, events_tx);

    let stop = AtomicBool::new(false);
    let mut pump_timer = PeriodicTimer::new("pump", Duration::from_micros(200));

    crossbeam::scope(|scope| {
        scope.spawn(|_| sampler.run(&stop));
        pump_timer.start(scope, move || {
            while pump.service(&mut |buffer: &FilledBuffer<'_>| {
                let mean = buffer.voltage().iter().map(|&v| v as u64).sum::<u64>()
                    / buffer.len().max(1) as u64;
                println!("buffer {} at {} ns: mean output {} uV", buffer.index(),
                         buffer.timestamp_ns(), mean);
            }) {}
            true
        });

        session.set_state(SessionState::Armed).unwrap();
        session.set_state(SessionState::Running).unwrap();
        timing.step();
        timing.step();
        thread::sleep(Duration::from_millis(10));

        for _ in 0..PERIODS {
            sync.trigger();
            for _ in 0..samples {
                timing.timer_mut().advance(interval);
                timing.step();
                if let Some(outcome) = sync.service() {
                    println!("sync: {:?}", outcome.plausibility);
                }
                while timing.port().triggers_pending() {
                    thread::yield_now();
                }
            }
        }
        // Last buffers drain before the pump stops.
        thread::sleep(Duration::from_millis(20));
        pump_timer.cancel();
        stop.store(true, Ordering::Release);
    })
    .unwrap();

    for event in events_rx.try_iter() {
        if let HostEvent::Status(status) = event {
            println!("{:?} reported {:?} {:?}", status.origin, status.code, status.value);
        }
    }
    println!("PRU1 counter at {} ticks, {:?}", timing.timer().counter(), timing.stats());
    println!("Goodbye!");
}
