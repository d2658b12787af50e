//! Motion control: the bridge from the interpreter to the planner.
//!
//! Implements the parser's [`MotionControl`] contract against the shared
//! motion state. Lines block politely while the plan buffer is full, arcs
//! are decomposed into chords before they reach the planner, and dwells
//! sleep in short slices so an alarm is never more than a few tens of
//! milliseconds from being honored.

use std::sync::Arc;
use std::time::Duration;

use motion::arc::ArcTrace;
use motion::axis::{Axis, N_AXIS};
use motion::gcode::{MotionControl, SpindleState};
use motion::planner::{condition, LineData, Planner};
use motion::math::DWELL_TIME_STEP;
use motion::segment::SegmentGenerator;
use motion::settings::Settings;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::fsm::{Fsm, SysState};
use crate::messages::{Message, MessageSender};
use crate::stepgen::StepGen;

/// How long a blocked producer sleeps before re-checking the buffer.
const BUFFER_FULL_POLL: Duration = Duration::from_millis(100);

/// The planner and segment rings behind one lock.
///
/// The step-generator thread takes this lock briefly per segment; motion
/// control takes it to append blocks. Nobody holds it while doing I/O.
pub struct MotionState {
    pub planner: Planner,
    pub segments: SegmentGenerator,
}

pub struct SharedMotion {
    pub state: Mutex<MotionState>,
    /// Signaled whenever the step generator frees ring space.
    pub space: Condvar,
}

impl SharedMotion {
    pub fn new(settings: Arc<Settings>) -> Arc<SharedMotion> {
        Arc::new(SharedMotion {
            state: Mutex::new(MotionState {
                planner: Planner::new(settings.clone()),
                segments: SegmentGenerator::new(settings),
            }),
            space: Condvar::new(),
        })
    }
}

/// Per-worker handle implementing the interpreter's motion interface.
pub struct MotionCtl {
    settings: Arc<Settings>,
    motion: Arc<SharedMotion>,
    fsm: Fsm,
    stepgen: StepGen,
    messages: MessageSender,
    auto_cycle: bool,
}

impl MotionCtl {
    pub fn new(
        settings: Arc<Settings>,
        motion: Arc<SharedMotion>,
        fsm: Fsm,
        stepgen: StepGen,
        messages: MessageSender,
        auto_cycle: bool,
    ) -> Self {
        Self {
            settings,
            motion,
            fsm,
            stepgen,
            messages,
            auto_cycle,
        }
    }

    /// Request a cycle start: ask for RUN and wake the step generator.
    pub fn cycle_start(&self) {
        self.fsm.request(SysState::Run);
        self.stepgen.wake_up();
    }

    fn auto_cycle_start(&self) {
        if self.auto_cycle && self.fsm.state() != SysState::Run {
            self.cycle_start();
        }
    }
}

impl MotionControl for MotionCtl {
    fn line(&mut self, target: &[f32; N_AXIS], data: LineData) {
        let mut state = self.motion.state.lock();
        // A full buffer means we are well ahead of the machine. Start the
        // cycle if configured, then wait for the executor to make room.
        while state.planner.check_full_buffer() {
            if self.fsm.is_abort() {
                return;
            }
            self.auto_cycle_start();
            let _ = self
                .motion
                .space
                .wait_for(&mut state, BUFFER_FULL_POLL);
        }
        if self.fsm.is_abort() {
            return;
        }

        let MotionState { planner, segments } = &mut *state;
        let queued = planner.buffer_line(target, &data, segments);
        drop(state);

        if queued {
            self.stepgen.work_available();
        } else if self.settings.laser_power_correction
            && data.condition & condition::SPINDLE_CW != 0
        {
            // Zero-length move in constant-power mode still has to carry
            // its laser state to the stream.
            self.spindle_sync(SpindleState::EnableCw, data.spindle_speed);
        }
    }

    fn arc(
        &mut self,
        target: &[f32; N_AXIS],
        position: &[f32; N_AXIS],
        offset: &[f32; N_AXIS],
        radius: f32,
        axis_0: Axis,
        axis_1: Axis,
        axis_linear: Axis,
        is_clockwise: bool,
        mut data: LineData,
    ) {
        let trace = ArcTrace::new(
            position,
            target,
            offset,
            radius,
            axis_0,
            axis_1,
            axis_linear,
            is_clockwise,
            self.settings.arc_tolerance,
        );

        // Inverse time was specified for the whole arc; each chord gets an
        // absolute rate instead.
        if trace.chord_count() > 0 && data.condition & condition::INVERSE_TIME != 0 {
            data.feed_rate *= f32::from(trace.chord_count());
            data.condition &= !condition::INVERSE_TIME;
        }

        for chord in trace {
            if self.fsm.is_abort() {
                return;
            }
            self.line(&chord, data);
        }
    }

    fn dwell(&mut self, seconds: f32) {
        debug!(seconds, "dwell");
        self.buffer_synchronize();
        let ticks = ((1000.0 / DWELL_TIME_STEP as f32) * seconds).ceil() as u32;
        for _ in 0..ticks {
            if self.fsm.is_abort() {
                return;
            }
            std::thread::sleep(Duration::from_millis(DWELL_TIME_STEP));
        }
    }

    /// Block until every buffered step has been handed to the pulse
    /// device. Returns immediately under alarm or fault.
    fn buffer_synchronize(&mut self) {
        let mut state = self.motion.state.lock();
        while !(state.planner.is_empty() && state.segments.is_empty()) {
            if self.fsm.is_abort() {
                return;
            }
            self.auto_cycle_start();
            let _ = self
                .motion
                .space
                .wait_for(&mut state, BUFFER_FULL_POLL);
        }
    }

    fn spindle_sync(&mut self, state: SpindleState, rpm: f32) {
        // State changes apply between motions, so drain what is queued
        // first. The power itself rides in the step stream.
        self.buffer_synchronize();
        debug!(?state, rpm, "laser sync");
    }

    fn feedback(&mut self, message: &str) {
        self.messages.send(Message::Feedback(message.to_string()));
    }
}
