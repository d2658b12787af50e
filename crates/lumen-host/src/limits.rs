//! Axis limit switches.
//!
//! The hardware reader lives outside this process boundary; it delivers
//! open/close edges over a channel. This module keeps the per-switch state
//! table, derives the limits sub-FSM state from it, and raises ALARM the
//! moment any switch opens. The rings are not flushed on a limit alarm, so
//! a run can resume after the cause is cleared.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::fsm::{Fsm, FsmEvent, Handler, SubFsm, SysState};

/// The six gantry limit switches; Y has one pair per motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum LimitSwitch {
    XPos = 0,
    XNeg = 1,
    Y1Pos = 2,
    Y1Neg = 3,
    Y2Pos = 4,
    Y2Neg = 5,
}

pub const N_LIMIT_SW: usize = 6;

/// Limits sub-FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LimitState {
    Init = 0,
    Safe = 1,
    Homing = 2,
    Alarm = 3,
    Fault = 4,
}

const LIMIT_STATE_MAP: &[(SysState, u8)] = &[
    (SysState::Init, LimitState::Init as u8),
    (SysState::Sleep, LimitState::Safe as u8),
    (SysState::Idle, LimitState::Safe as u8),
    (SysState::Idle, LimitState::Homing as u8),
    (SysState::Homing, LimitState::Homing as u8),
    (SysState::Run, LimitState::Safe as u8),
    (SysState::Hold, LimitState::Safe as u8),
    (SysState::Fault, LimitState::Fault as u8),
    (SysState::Alarm, LimitState::Alarm as u8),
];

/// One switch edge from the input reader.
#[derive(Debug, Clone, Copy)]
pub struct LimitEvent {
    pub switch: LimitSwitch,
    /// True when the switch is made (carriage inside the envelope).
    pub closed: bool,
}

fn all_closed(status: &[bool; N_LIMIT_SW]) -> bool {
    status.iter().all(|&closed| closed)
}

/// Register the limits sub-FSM and spawn its event loop.
pub fn spawn(fsm: Fsm, mut events: mpsc::UnboundedReceiver<LimitEvent>) {
    // Until the reader says otherwise every switch is assumed closed.
    let status = Arc::new(Mutex::new([true; N_LIMIT_SW]));

    // Re-derive our vote whenever the system state moves under us, the
    // same way a status poll would.
    let handler_fsm_status = status.clone();
    let handler: Handler = {
        let fsm = fsm.clone();
        Box::new(move |_event: &FsmEvent| {
            let state = if all_closed(&handler_fsm_status.lock()) {
                LimitState::Safe
            } else {
                LimitState::Alarm
            };
            fsm.update(SubFsm::Limits, state as u8);
        })
    };

    fsm.register(SubFsm::Limits, LIMIT_STATE_MAP, Some(handler));
    fsm.update(SubFsm::Limits, LimitState::Safe as u8);
    info!("limit switches registered");

    tokio::spawn(async move {
        let mut reported = LimitState::Safe;
        while let Some(event) = events.recv().await {
            let ok = {
                let mut table = status.lock();
                table[event.switch as usize] = event.closed;
                all_closed(&table)
            };
            let state = if ok { LimitState::Safe } else { LimitState::Alarm };
            if state != reported {
                if state == LimitState::Alarm {
                    warn!(?event.switch, "limit switch open");
                }
                reported = state;
                fsm.update(SubFsm::Limits, state as u8);
            }
        }
        // Reader gone: the envelope can no longer be trusted.
        fsm.update(SubFsm::Limits, LimitState::Fault as u8);
    });
}
