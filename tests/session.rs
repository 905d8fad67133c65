//! Complete sessions with PRU0, the host pump and the PRU1 driver on separate threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use shepherd::cache::{CacheConfig, IvSample};
use shepherd::clock_sync::{Plausibility, SyncOutcome};
use shepherd::host::{HostEvent, HostSync, MessagePump};
use shepherd::sim::{ManualClock, SimFrontend, SimTimer};
use shepherd::{
    FilledBuffer, Mode, Origin, SamplingLoop, SessionConfig, SessionState, SharedRegion,
    StatusCode, SyncConfig, TimingLoop,
};


fn config() -> SessionConfig {
    SessionConfig {
        mode: Mode::Emulate,
        buffer_count: 4,
        samples_per_buffer: 10,
        severe_delay_us: 0,
        sync: SyncConfig { period_ns: 5_000, tick_ns: 5, samples_per_period: 10, spin_window_ns: 0 },
        cache: CacheConfig { enabled: true, blocks: 4, block_samples: 8 },
        ..SessionConfig::default()
    }
}

fn trace() -> Vec<IvSample> {
    vec![IvSample { voltage_uV: 4_000_000, current_nA: 500_000 }; 512]
}

// Waits until PRU0 took every trigger raised so far.
fn settle(timing: &TimingLoop<SimTimer>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while timing.port().triggers_pending() {
        assert!(Instant::now() < deadline, "PRU0 stopped taking triggers");
        thread::yield_now();
    }
}

// One period of PRU1 in steps of 10 ticks, answering the sync request on the way.
fn run_period(timing: &mut TimingLoop<SimTimer>, sync: &mut HostSync<ManualClock>,
              outcomes: &mut Vec<SyncOutcome>) {
    sync.trigger();
    for _ in 0..100 {
        timing.timer_mut().advance(10);
        timing.step();
        if let Some(outcome) = sync.service() {
            outcomes.push(outcome);
        }
        settle(timing);
    }
}

fn start(timing: &mut TimingLoop<SimTimer>, session: &shepherd::shared::SessionControl) {
    session.set_state(SessionState::Armed).unwrap();
    session.set_state(SessionState::Running).unwrap();
    timing.step();
    timing.step();
    // Gives PRU0 time to see the start before the first period ends.
    thread::sleep(Duration::from_millis(50));
}


#[test]
fn emulation_session_across_threads() {
    let _ = env_logger::builder().is_test(true).try_init();
    let cfg = config();
    let region = SharedRegion::heap();
    let pool = cfg.buffer_pool().unwrap();
    let ports = region.split(&pool, cfg.severe_delay()).unwrap();
    ports.session.set_mode(cfg.mode).unwrap();
    let session = ports.session;

    let mut sampler = SamplingLoop::new(ports.pru0, SimFrontend::default().with_load(10_000),
                                        cfg.engines(trace()).unwrap());
    let mut timing = TimingLoop::new(ports.pru1, SimTimer::new(cfg.sync.nominal_ticks()), cfg.sync);
    let mut sync = HostSync::new(ports.sync, cfg.sync, ManualClock::new(0, 1)).unwrap();
    let (tx, rx) = crossbeam::channel::unbounded();
    let mut pump = MessagePump::new(ports.pump, session, tx);

    let stop_rt = AtomicBool::new(false);
    let stop_pump = AtomicBool::new(false);
    let mut outcomes = Vec::new();
    let mut voltages = Vec::new();

    crossbeam::scope(|scope| {
        let pru0 = scope.spawn(|_| {
            sampler.run(&stop_rt);
            sampler.stats()
        });
        let host = scope.spawn(|_| {
            let mut sink = |buffer: &FilledBuffer<'_>| voltages.extend_from_slice(buffer.voltage());
            while !stop_pump.load(Ordering::Acquire) {
                if !pump.service(&mut sink) {
                    thread::yield_now();
                }
            }
            while pump.service(&mut sink) {}
            pump.stats()
        });

        start(&mut timing, &session);
        for _ in 0..12 {
            run_period(&mut timing, &mut sync, &mut outcomes);
        }

        stop_rt.store(true, Ordering::Release);
        let pru0_stats = pru0.join().unwrap();
        stop_pump.store(true, Ordering::Release);
        let pump_stats = host.join().unwrap();

        assert_eq!(pump_stats.buffers, pru0_stats.buffers_released);
        assert!(pru0_stats.buffers_released + pru0_stats.buffers_dropped >= 9, "{:?}", pru0_stats);
        assert_eq!(pump_stats.samples, 10 * pump_stats.buffers);
    })
    .unwrap();

    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(timing.stats().periods, 12);
    assert_eq!(timing.stats().replies_applied, 12);
    assert_eq!(outcomes.len(), 12);
    assert!(outcomes.iter().all(|o| o.plausibility == Plausibility::Plausible));

    assert!(!voltages.is_empty());
    assert!(voltages.iter().all(|&v| v <= 5_000_000));

    let mut timestamps = Vec::new();
    for event in rx.try_iter() {
        match event {
            HostEvent::Buffer(summary) => {
                assert_eq!(summary.samples, 10);
                timestamps.push(summary.timestamp_ns);
            }
            HostEvent::Status(status) => {
                assert_ne!(status.code, StatusCode::MemoryCorruption);
                assert_ne!(status.code, StatusCode::SyncStateViolation);
            }
            HostEvent::Pong(_) => panic!("no ping was sent"),
        }
    }
    // Buffers cover whole periods; a dropped buffer leaves a gap of whole periods.
    for pair in timestamps.windows(2) {
        assert!(pair[1] > pair[0]);
        assert_eq!((pair[1] - pair[0]) % 5_000, 0);
    }
}

#[test]
fn reset_handshake_across_threads() {
    let _ = env_logger::builder().is_test(true).try_init();
    let cfg = config();
    let region = SharedRegion::heap();
    let pool = cfg.buffer_pool().unwrap();
    let ports = region.split(&pool, cfg.severe_delay()).unwrap();
    ports.session.set_mode(Mode::Harvest).unwrap();
    let session = ports.session;

    let mut sampler = SamplingLoop::new(ports.pru0, SimFrontend::default(),
                                        cfg.engines(trace()).unwrap());
    let mut timing = TimingLoop::new(ports.pru1, SimTimer::new(cfg.sync.nominal_ticks()), cfg.sync);
    let mut sync = HostSync::new(ports.sync, cfg.sync, ManualClock::new(0, 1)).unwrap();
    let (tx, rx) = crossbeam::channel::unbounded();
    let pump = MessagePump::new(ports.pump, session, tx);

    let stop_rt = AtomicBool::new(false);
    let stop_pump = AtomicBool::new(false);
    let mut outcomes = Vec::new();

    crossbeam::scope(|scope| {
        let stop_pump = &stop_pump;
        let pru0 = scope.spawn(|_| {
            sampler.run(&stop_rt);
            sampler.stats()
        });
        let host = scope.spawn(move |_| {
            let mut pump = pump;
            while !stop_pump.load(Ordering::Acquire) {
                if !pump.service(&mut |_: &FilledBuffer<'_>| {}) {
                    thread::yield_now();
                }
            }
            pump
        });

        start(&mut timing, &session);
        for _ in 0..3 {
            run_period(&mut timing, &mut sync, &mut outcomes);
        }

        // The host must not hold a buffer across the reset.
        stop_pump.store(true, Ordering::Release);
        let mut pump = host.join().unwrap();

        session.request_reset().unwrap();
        timing.step();
        timing.step();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !session.reset_acknowledged() {
            assert!(Instant::now() < deadline, "PRU0 never acknowledged the reset");
            thread::yield_now();
        }
        session.complete_reset().unwrap();
        sync.reset();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(region.free_ring().len(), 4);

        start(&mut timing, &session);
        for _ in 0..3 {
            run_period(&mut timing, &mut sync, &mut outcomes);
        }
        stop_rt.store(true, Ordering::Release);
        let stats = pru0.join().unwrap();
        while pump.service(&mut |_: &FilledBuffer<'_>| {}) {}

        // Counters restart with the session.
        assert!(stats.samples <= 30, "{:?}", stats);
        assert_eq!(timing.stats().periods, 3);
    })
    .unwrap();

    assert_eq!(outcomes.len(), 6);
    assert!(outcomes.iter().all(|o| o.plausibility == Plausibility::Plausible));
    let restarts: Vec<_> = rx.try_iter()
        .filter_map(|e| match e {
            HostEvent::Status(s) if s.code == StatusCode::Restart => Some(s.origin),
            _ => None,
        })
        .collect();
    assert!(restarts.contains(&Origin::Host));
}
