//! Step-generator thread.
//!
//! The highest-priority loop in the process: pulls segments from the
//! segment ring, replays them through the [`StepTicker`] into the pulse
//! sink, and keeps the ring topped up by running segment prep after every
//! segment it retires.
//!
//! The thread self-suspends when it drains the rings outside a run
//! request, and `wake_up` releases it again. Both are idempotent: a
//! spurious wake that finds nothing to do just parks the thread again.
//! Nothing is ever emitted while holding the motion lock; the segment and
//! its Bresenham block are copied out first.

use std::sync::Arc;
use std::time::Duration;

use motion::settings::Settings;
use motion::stepper::{PulseSink, StepTicker, SysPosition};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::fsm::{Fsm, SubFsm, SysState};
use crate::motion_ctl::{MotionState, SharedMotion};

/// Motion subsystem states reported to the system FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MotState {
    Init = 0,
    Idle = 1,
    Run = 2,
    Hold = 3,
    Alarm = 4,
    Fault = 5,
}

const MOTION_STATE_MAP: &[(SysState, u8)] = &[
    (SysState::Init, MotState::Init as u8),
    (SysState::Sleep, MotState::Idle as u8),
    (SysState::Idle, MotState::Idle as u8),
    (SysState::Homing, MotState::Idle as u8),
    (SysState::Homing, MotState::Run as u8),
    (SysState::Run, MotState::Run as u8),
    (SysState::Hold, MotState::Hold as u8),
    (SysState::Alarm, MotState::Alarm as u8),
    (SysState::Fault, MotState::Fault as u8),
];

struct Inner {
    motion: Arc<SharedMotion>,
    fsm: Fsm,
    position: Arc<SysPosition>,
    settings: Arc<Settings>,
    /// True while the loop is released; guarded wait target for suspend.
    awake: Mutex<bool>,
    wake: Condvar,
}

/// Handle to the step-generator thread.
#[derive(Clone)]
pub struct StepGen {
    inner: Arc<Inner>,
}

impl StepGen {
    /// Register the motion sub-FSM and start the generator thread.
    pub fn spawn(
        motion: Arc<SharedMotion>,
        fsm: Fsm,
        position: Arc<SysPosition>,
        settings: Arc<Settings>,
        sink: Box<dyn PulseSink + Send>,
    ) -> StepGen {
        fsm.register(SubFsm::Motion, MOTION_STATE_MAP, None);
        fsm.update(SubFsm::Motion, MotState::Idle as u8);

        let inner = Arc::new(Inner {
            motion,
            fsm,
            position,
            settings,
            awake: Mutex::new(false),
            wake: Condvar::new(),
        });

        let thread_inner = inner.clone();
        std::thread::Builder::new()
            .name("stepgen".into())
            .spawn(move || thread_inner.run(sink))
            .expect("spawning the step generator thread");

        StepGen { inner }
    }

    /// Release the generator loop. Idempotent; safe from any thread.
    pub fn wake_up(&self) {
        let mut awake = self.inner.awake.lock();
        if !*awake {
            debug!("step generator wake up");
            *awake = true;
        }
        self.inner.wake.notify_all();
    }

    /// Nudge a running generator that new planner blocks arrived.
    pub fn work_available(&self) {
        self.inner.wake.notify_all();
    }
}

impl Inner {
    fn run(self: Arc<Self>, mut sink: Box<dyn PulseSink + Send>) {
        let mut ticker = StepTicker::new();
        let mut mot_state = MotState::Idle;
        // Bytes emitted since the stream was last idle; used to arm the
        // pulse device once a full second of data is buffered ahead.
        let mut cycle_bytes: u64 = 0;
        let mut sink_armed = false;
        // Steps of the tail segment already emitted before an abort cut it
        // short; resuming skips them so nothing is stepped twice.
        let mut carry_steps: u16 = 0;

        loop {
            // Park until released. Each resume starts a fresh cycle as far
            // as the pulse device is concerned.
            {
                let mut awake = self.awake.lock();
                let mut was_parked = false;
                while !*awake {
                    self.wake.wait(&mut awake);
                    was_parked = true;
                }
                if was_parked {
                    sink_armed = false;
                    cycle_bytes = 0;
                }
            }

            if self.fsm.is_abort() {
                self.go_idle(&mut sink, &mut sink_armed, &mut cycle_bytes);
                self.set_mot_state(&mut mot_state, MotState::Idle);
                *self.awake.lock() = false;
                continue;
            }

            // Copy the next segment (and its Bresenham block) out under
            // the lock, topping the ring up first if it ran dry.
            let next = {
                let mut state = self.motion.state.lock();
                if state.segments.is_empty() {
                    let MotionState { planner, segments } = &mut *state;
                    segments.prep_buffer(planner);
                }
                state.segments.tail_segment().map(|segment| {
                    (segment, state.segments.st_block(segment.st_block_index))
                })
            };

            let Some((segment, block)) = next else {
                // Drained. If a run was requested before a second of data
                // accumulated, the device starts now; otherwise the cycle
                // is over.
                if self.fsm.requested() == Some(SysState::Run) && !sink_armed {
                    self.arm_sink(&mut sink, &mut sink_armed);
                } else {
                    info!("segment ring drained, going idle");
                    self.fsm.request(SysState::Idle);
                    self.set_mot_state(&mut mot_state, MotState::Idle);
                    cycle_bytes = 0;
                    sink_armed = false;
                }
                *self.awake.lock() = false;
                continue;
            };

            self.set_mot_state(&mut mot_state, MotState::Run);

            let mut pending = segment;
            pending.n_step = pending.n_step.saturating_sub(carry_steps);

            let fsm = self.fsm.clone();
            let mut abort = move || fsm.is_abort();
            let completed = match ticker.run_segment(
                &pending,
                &block,
                sink.as_mut(),
                &self.position,
                &mut abort,
            ) {
                Ok(run) => {
                    cycle_bytes += run.bytes;
                    if !sink_armed && cycle_bytes >= u64::from(self.settings.step_frequency) {
                        self.arm_sink(&mut sink, &mut sink_armed);
                    }
                    if run.steps < pending.n_step {
                        carry_steps += run.steps;
                        false
                    } else {
                        carry_steps = 0;
                        true
                    }
                }
                Err(err) => {
                    error!("pulse device write failed: {err}");
                    self.set_mot_state(&mut mot_state, MotState::Fault);
                    *self.awake.lock() = false;
                    continue;
                }
            };

            if completed {
                let mut state = self.motion.state.lock();
                state.segments.advance_tail();
                if !self.fsm.is_abort() {
                    let MotionState { planner, segments } = &mut *state;
                    segments.prep_buffer(planner);
                }
                drop(state);
                self.motion.space.notify_all();
            }

            if self.fsm.is_abort() {
                // Leave the rings as they are; an alarm is resumable.
                self.set_mot_state(&mut mot_state, MotState::Idle);
                *self.awake.lock() = false;
                continue;
            }
        }
    }

    fn set_mot_state(&self, current: &mut MotState, next: MotState) {
        if *current != next {
            *current = next;
            self.fsm.update(SubFsm::Motion, next as u8);
        }
    }

    fn arm_sink(&self, sink: &mut Box<dyn PulseSink + Send>, sink_armed: &mut bool) {
        if let Err(err) = sink.flush() {
            error!("pulse device flush failed: {err}");
            self.fsm.update(SubFsm::Motion, MotState::Fault as u8);
            return;
        }
        *sink_armed = true;
        info!("pulse stream armed");
    }

    fn go_idle(
        &self,
        sink: &mut Box<dyn PulseSink + Send>,
        sink_armed: &mut bool,
        cycle_bytes: &mut u64,
    ) {
        let _ = sink.flush();
        *sink_armed = false;
        *cycle_bytes = 0;
        // Give a polling supervisor a beat to observe the halt.
        std::thread::sleep(Duration::from_millis(1));
    }
}
