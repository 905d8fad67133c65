//! Real-time loop of PRU0: sampling, emulation and buffer production.
//!
//! The loop is an explicit state machine driven by [`SamplingLoop::step`], which never blocks.
//! While running, PRU1 paces it through two triggers: the buffer swap trigger at every period
//! boundary and the sample trigger at every sample tick. A pending swap is always handled before
//! a sample of the same tick.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::buffer::{BufferHandle, BufferMeta, Utilization};
use crate::cache::{SampleSource, StageCache};
use crate::calibration::Calibration;
use crate::converter::VirtualConverter;
use crate::harvester::VirtualHarvester;
use crate::pubdef::{DacChannel, Mode, MsgType, SessionState, StatusCode};
use crate::shared::Pru0Port;



/// Analog front-end as seen by PRU0.
pub trait Frontend {
    /// Raw voltage and current of the harvesting input.
    fn read_input(&mut self) -> (u32, u32);

    /// Raw current drawn by the target.
    fn read_output_current(&mut self) -> u32;

    fn set_dac(&mut self, channel: DacChannel, raw: u32);

    fn set_power_good(&mut self, good: bool);

    /// Free-running cycle counter, used for the utilization statistics.
    fn cycles(&self) -> u32;
}

impl<'a, F: Frontend + ?Sized> Frontend for &'a mut F {
    fn read_input(&mut self) -> (u32, u32) {
        (**self).read_input()
    }

    fn read_output_current(&mut self) -> u32 {
        (**self).read_output_current()
    }

    fn set_dac(&mut self, channel: DacChannel, raw: u32) {
        (**self).set_dac(channel, raw)
    }

    fn set_power_good(&mut self, good: bool) {
        (**self).set_power_good(good)
    }

    fn cycles(&self) -> u32 {
        (**self).cycles()
    }
}



/// States of the PRU0 loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoopState {
    /// Dropping all session state; acknowledges a host reset request.
    Reset,
    /// Waiting for the host to start the session.
    AwaitStart,
    Running,
    /// Stopped after a fatal error, until the host resets the session.
    Fault,
}

/// Counters of the current session.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub samples: u64,
    /// Samples taken without a buffer to store them in.
    pub discarded: u64,
    pub buffers_released: u64,
    /// Finished buffers that were reused because the host did not keep up.
    pub buffers_dropped: u64,
}

/// The engines driven on every sample tick.
pub struct Engines<S> {
    pub converter: VirtualConverter,
    pub harvester: VirtualHarvester,
    pub cache: StageCache<S>,
    pub calibration: Calibration,
}

pub struct SamplingLoop<'a, F, S> {
    port: Pru0Port<'a>,
    frontend: F,
    engines: Engines<S>,
    state: LoopState,
    reset_acked: bool,

    current: Option<BufferHandle<'a>>,
    pending: Option<(BufferHandle<'a>, BufferMeta)>,
    buffer_timestamp_ns: u64,
    sample_index: u32,
    input_index: usize,
    util: Utilization,
    input_power_fW: u64,
    stats: SamplerStats,
}

impl<'a, F: Frontend, S: SampleSource> SamplingLoop<'a, F, S> {
    pub fn new(port: Pru0Port<'a>, frontend: F, engines: Engines<S>) -> SamplingLoop<'a, F, S> {
        SamplingLoop {
            port: port,
            frontend: frontend,
            engines: engines,
            state: LoopState::Reset,
            reset_acked: false,
            current: None,
            pending: None,
            buffer_timestamp_ns: 0,
            sample_index: 0,
            input_index: 0,
            util: Utilization::default(),
            input_power_fW: 0,
            stats: SamplerStats::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> SamplerStats {
        self.stats
    }

    pub fn engines(&self) -> &Engines<S> {
        &self.engines
    }

    pub fn frontend(&self) -> &F {
        &self.frontend
    }

    /// Runs the loop until `stop` is raised.
    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            self.step();
            std::hint::spin_loop();
        }
    }

    /// One iteration of the dispatch loop.
    pub fn step(&mut self) -> LoopState {
        let next = match self.state {
            LoopState::Reset => self.do_reset(),
            LoopState::AwaitStart => self.await_start(),
            LoopState::Running => self.do_running(),
            LoopState::Fault => match self.port.session_state() {
                SessionState::Reset => LoopState::Reset,
                _ => LoopState::Fault,
            },
        };
        if next != self.state {
            log::debug!("pru0 {:?} -> {:?}", self.state, next);
            self.state = next;
        }
        next
    }

    fn do_reset(&mut self) -> LoopState {
        if self.current.is_some() || self.pending.is_some() {
            self.port.swap_edges(None);
            self.current = None;
            self.pending = None;
        }
        self.sample_index = 0;
        self.input_index = 0;
        self.util = Utilization::default();
        self.input_power_fW = 0;
        self.engines.converter.reset();
        self.engines.harvester.reset();
        self.engines.cache.reset();
        self.frontend.set_dac(DacChannel::Target, 0);
        self.frontend.set_dac(DacChannel::Harvester, 0);
        self.frontend.set_power_good(false);

        if self.port.session_state() == SessionState::Reset {
            if !self.reset_acked {
                self.stats = SamplerStats::default();
                self.port.acknowledge_reset();
                self.reset_acked = true;
            }
            LoopState::Reset
        } else {
            self.reset_acked = false;
            LoopState::AwaitStart
        }
    }

    fn await_start(&mut self) -> LoopState {
        // Triggers raised before the start belong to no session.
        self.port.take_swap_trigger();
        self.port.take_sample_trigger();
        self.serve_commands();
        match self.port.session_state() {
            SessionState::Running => LoopState::Running,
            SessionState::Reset => LoopState::Reset,
            SessionState::Fault => LoopState::Fault,
            SessionState::Idle | SessionState::Armed => {
                if self.port.mode() == Mode::Emulate {
                    self.engines.cache.maintain(0);
                }
                LoopState::AwaitStart
            }
        }
    }

    fn do_running(&mut self) -> LoopState {
        match self.port.session_state() {
            SessionState::Running => {}
            SessionState::Reset => return LoopState::Reset,
            SessionState::Fault => return LoopState::Fault,
            SessionState::Idle | SessionState::Armed => return LoopState::AwaitStart,
        }

        self.retry_pending();
        let mut busy = false;
        if let Some(timestamp) = self.port.take_swap_trigger() {
            self.handle_swap(timestamp);
            busy = true;
        }
        if self.port.take_sample_trigger() {
            // A swap raised after the sample trigger still belongs before it.
            if let Some(timestamp) = self.port.take_swap_trigger() {
                self.handle_swap(timestamp);
            }
            self.handle_sample();
            busy = true;
        }
        if !busy {
            if self.port.mode() == Mode::Emulate {
                self.engines.cache.maintain(self.input_index);
            }
            self.serve_commands();
        }
        LoopState::Running
    }

    fn serve_commands(&mut self) {
        if let Some(msg) = self.port.receive() {
            match msg.msg_type {
                MsgType::Ping => {
                    self.port.send(MsgType::Pong, msg.value[0], msg.value[1]);
                }
                other => {
                    self.port.status().report(StatusCode::InvalidCommand, other as u32, msg.value[0]);
                }
            }
        }
    }

    fn retry_pending(&mut self) {
        if let Some((handle, meta)) = self.pending.take() {
            match self.port.release_filled_buffer(handle, &meta) {
                Ok(()) => self.stats.buffers_released += 1,
                Err(handle) => self.pending = Some((handle, meta)),
            }
        }
    }

    fn handle_swap(&mut self, timestamp_ns: u64) {
        let meta = BufferMeta {
            timestamp_ns: self.buffer_timestamp_ns,
            sample_count: self.sample_index,
            util: self.util,
            input_power_fW: self.input_power_fW,
        };
        let (reuse, finished) = match self.current.take() {
            Some(handle) if self.pending.is_some() => {
                // The host still has not taken the previous buffer.
                self.stats.buffers_dropped += 1;
                (Some(handle), None)
            }
            other => (None, other),
        };

        self.buffer_timestamp_ns = timestamp_ns;
        self.sample_index = 0;
        self.util = Utilization::default();
        self.input_power_fW = 0;
        self.current = reuse.or_else(|| self.port.acquire_free_buffer());
        // Edge capture must leave the finished buffer before the host can claim it.
        self.port.swap_edges(self.current.as_ref().map(|h| h.index()));

        if let Some(handle) = finished {
            match self.port.release_filled_buffer(handle, &meta) {
                Ok(()) => self.stats.buffers_released += 1,
                Err(handle) => self.pending = Some((handle, meta)),
            }
        }
    }

    fn handle_sample(&mut self) {
        let start = self.frontend.cycles();
        let (voltage, current) = self.sample_once();

        let stored = match self.current.as_mut() {
            Some(buffer) => buffer.put(self.sample_index as usize, voltage, current),
            None => false,
        };
        if !stored {
            self.stats.discarded += 1;
        }
        self.stats.samples += 1;
        self.sample_index = self.sample_index.saturating_add(1);
        self.util.record(self.frontend.cycles().wrapping_sub(start));
    }

    /// Runs the engine phases enabled by the mode and returns the sample to record.
    fn sample_once(&mut self) -> (u32, u32) {
        let engines = &mut self.engines;
        let cal = engines.calibration;
        match self.port.mode() {
            Mode::Harvest => {
                let (v_raw, i_raw) = self.frontend.read_input();
                let voltage = cal.adc_voltage.raw_to_si(v_raw);
                let current = cal.adc_current.raw_to_si(i_raw);
                let point = engines.harvester.step(voltage, current);
                let setpoint = engines.harvester.setpoint_uV();
                self.frontend.set_dac(DacChannel::Harvester, cal.dac_voltage.uV_to_raw(setpoint));
                let _ = engines.converter.calc_inp_power(point.voltage_uV, point.current_nA);
                self.input_power_fW = self.input_power_fW
                    .saturating_add(engines.converter.state().P_inp_fW.to_int());
                (point.voltage_uV, point.current_nA)
            }
            Mode::Emulate => {
                let input = engines.cache.read(self.input_index);
                self.input_index += 1;
                let i_out_raw = self.frontend.read_output_current();
                let out = engines.converter.tick(input.voltage_uV, input.current_nA, i_out_raw);
                self.input_power_fW = self.input_power_fW
                    .saturating_add(engines.converter.state().P_inp_fW.to_int());
                self.frontend.set_dac(DacChannel::Target, out.dac_raw);
                self.frontend.set_power_good(out.power_good);
                (out.V_out_uV, cal.adc_current.raw_to_si(i_out_raw))
            }
            Mode::DebugPassthrough => {
                let (v_raw, _) = self.frontend.read_input();
                let i_raw = self.frontend.read_output_current();
                let voltage = cal.adc_voltage.raw_to_si(v_raw);
                self.frontend.set_dac(DacChannel::Target, cal.dac_voltage.uV_to_raw(voltage));
                (v_raw, i_raw)
            }
            Mode::Disabled => {
                self.frontend.set_dac(DacChannel::Target, 0);
                (0, 0)
            }
        }
    }
}
