//! Operator switches: lid, interlock, beam detect, and the start button.
//!
//! Works like the limits loop: edges arrive over a channel from the input
//! reader, the safety switches gate SAFE/ALARM, and the button doubles as
//! the physical cycle-start while a run is requested.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::fsm::{Fsm, FsmEvent, Handler, SubFsm, SysState};
use crate::stepgen::StepGen;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Switch {
    BeamDetect = 0,
    Interlock = 1,
    LidSw1 = 2,
    LidSw2 = 3,
    Button = 4,
}

pub const N_SWITCHES: usize = 5;

/// Switches sub-FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SwitchState {
    Init = 0,
    Safe = 1,
    Run = 2,
    Hold = 3,
    Alarm = 4,
    Fault = 5,
}

const SWITCH_STATE_MAP: &[(SysState, u8)] = &[
    (SysState::Init, SwitchState::Init as u8),
    (SysState::Sleep, SwitchState::Safe as u8),
    (SysState::Idle, SwitchState::Safe as u8),
    (SysState::Homing, SwitchState::Safe as u8),
    (SysState::Run, SwitchState::Run as u8),
    (SysState::Run, SwitchState::Safe as u8),
    (SysState::Hold, SwitchState::Hold as u8),
    (SysState::Fault, SwitchState::Fault as u8),
    (SysState::Alarm, SwitchState::Alarm as u8),
];

/// One switch edge from the input reader.
#[derive(Debug, Clone, Copy)]
pub struct SwitchEvent {
    pub switch: Switch,
    pub closed: bool,
}

/// Safety interlocks only; the button never gates SAFE.
fn interlocks_closed(status: &[bool; N_SWITCHES]) -> bool {
    status[..Switch::Button as usize].iter().all(|&c| c)
}

/// Register the switches sub-FSM and spawn its event loop.
pub fn spawn(fsm: Fsm, stepgen: StepGen, mut events: mpsc::UnboundedReceiver<SwitchEvent>) {
    let status = Arc::new(Mutex::new([true, true, true, true, false]));

    let handler_status = status.clone();
    let handler: Handler = {
        let fsm = fsm.clone();
        Box::new(move |event: &FsmEvent| {
            if !interlocks_closed(&handler_status.lock()) {
                fsm.update(SubFsm::Switches, SwitchState::Alarm as u8);
            } else if event.state == SysState::Run {
                fsm.update(SubFsm::Switches, SwitchState::Safe as u8);
            }
        })
    };

    fsm.register(SubFsm::Switches, SWITCH_STATE_MAP, Some(handler));
    fsm.update(SubFsm::Switches, SwitchState::Safe as u8);
    info!("operator switches registered");

    tokio::spawn(async move {
        let mut reported = SwitchState::Safe;
        while let Some(event) = events.recv().await {
            let (safe, button) = {
                let mut table = status.lock();
                table[event.switch as usize] = event.closed;
                (interlocks_closed(&table), table[Switch::Button as usize])
            };

            let state = if !safe {
                warn!(?event.switch, "interlock open");
                SwitchState::Alarm
            } else if button && fsm.requested() == Some(SysState::Run) {
                // Physical cycle start: the operator armed the run.
                stepgen.wake_up();
                SwitchState::Run
            } else {
                SwitchState::Safe
            };

            if state != reported {
                reported = state;
                fsm.update(SubFsm::Switches, state as u8);
            }
        }
        fsm.update(SubFsm::Switches, SwitchState::Fault as u8);
    });
}
