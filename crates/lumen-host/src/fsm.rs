//! System-level finite state machine.
//!
//! Every subsystem runs its own small FSM and registers, up front, which of
//! its states are acceptable under each system state. The coordinator task
//! serializes their updates through a queue and derives the one
//! authoritative system state from the whole set:
//!
//! * while any sub is unregistered the system is pinned to `Init`;
//! * priority states (`Init`, `Alarm`, `Fault`) are adopted as soon as a
//!   single sub reports a state mapped to them, highest index winning;
//! * the remaining states need consensus: every sub's current state must
//!   map to them. A requested state with consensus wins; otherwise a
//!   unique consensus is adopted, and conflicting consensus is logged and
//!   left unresolved.
//!
//! The published state is a plain atomic so hot paths (step generation,
//! motion control) read it without taking any lock.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Marker for a sub-FSM that has not registered yet.
pub const SUB_STATE_UNINITIALIZED: u8 = 255;

const REQ_NONE: u8 = 254;

/// Capacity of the coordinator queue. Overflow is a fault in the caller.
const QUEUE_DEPTH: usize = 64;

/// The authoritative machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Hash)]
#[repr(u8)]
pub enum SysState {
    Init = 0,
    Sleep = 1,
    Idle = 2,
    Homing = 3,
    Run = 4,
    Hold = 5,
    Alarm = 6,
    Fault = 7,
}

pub const N_SYS_STATES: usize = 8;

impl SysState {
    pub const ALL: [SysState; N_SYS_STATES] = [
        SysState::Init,
        SysState::Sleep,
        SysState::Idle,
        SysState::Homing,
        SysState::Run,
        SysState::Hold,
        SysState::Alarm,
        SysState::Fault,
    ];

    fn from_u8(value: u8) -> Option<SysState> {
        SysState::ALL.get(usize::from(value)).copied()
    }

    /// Adopted on a single sub's vote rather than by consensus.
    pub fn is_priority(self) -> bool {
        matches!(self, SysState::Init | SysState::Alarm | SysState::Fault)
    }

    /// State name used in status reports.
    pub fn name(self) -> &'static str {
        match self {
            SysState::Init => "Init",
            SysState::Sleep => "Sleep",
            SysState::Idle => "Idle",
            SysState::Homing => "Home",
            SysState::Run => "Run",
            SysState::Hold => "Hold",
            SysState::Alarm => "Alarm",
            SysState::Fault => "Fault",
        }
    }
}

/// The subsystems participating in the system FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SubFsm {
    /// Command line interface.
    Cli = 0,
    /// Pulse-engine driver.
    Driver = 1,
    /// Lid, interlock, and button switches.
    Switches = 2,
    /// Motion pipeline.
    Motion = 3,
    /// Axis limit switches.
    Limits = 4,
}

pub const N_FSM: usize = 5;

/// Snapshot handed to sub-FSM handlers on every change.
#[derive(Debug, Clone, Copy)]
pub struct FsmEvent {
    pub state: SysState,
    pub requested: Option<SysState>,
}

/// Handler invoked on system state changes and state requests. Must not
/// block: it runs on the coordinator task.
pub type Handler = Box<dyn Fn(&FsmEvent) + Send>;

enum Msg {
    Register {
        sub: SubFsm,
        map: Vec<(SysState, u8)>,
        handler: Option<Handler>,
    },
    Update {
        sub: SubFsm,
        sub_state: u8,
    },
    Request {
        state: SysState,
    },
}

struct Shared {
    state: AtomicU8,
    requested: AtomicU8,
}

/// Handle to the FSM coordinator. Cheap to clone; reads are lock free.
#[derive(Clone)]
pub struct Fsm {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Msg>,
}

impl Fsm {
    /// Spawn the coordinator task on the current runtime.
    pub fn spawn() -> Fsm {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(SysState::Init as u8),
            requested: AtomicU8::new(SysState::Idle as u8),
        });
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let coordinator = Coordinator {
            shared: shared.clone(),
            sub_state: [SUB_STATE_UNINITIALIZED; N_FSM],
            maps: Default::default(),
            handlers: Default::default(),
        };
        tokio::spawn(coordinator.run(rx));
        Fsm { shared, tx }
    }

    /// Declare the acceptable sub-states of `sub` under each system state.
    pub fn register(&self, sub: SubFsm, map: &[(SysState, u8)], handler: Option<Handler>) {
        self.send(Msg::Register {
            sub,
            map: map.to_vec(),
            handler,
        });
    }

    /// Report a sub-FSM state change. Updates from unregistered subs are
    /// dropped by the coordinator.
    pub fn update(&self, sub: SubFsm, sub_state: u8) {
        self.send(Msg::Update { sub, sub_state });
    }

    /// Ask the system to move to `state` once every sub allows it.
    pub fn request(&self, state: SysState) {
        self.send(Msg::Request { state });
    }

    fn send(&self, msg: Msg) {
        if let Err(err) = self.tx.try_send(msg) {
            // A full coordinator queue means state updates are being lost;
            // the machine can no longer be trusted to track reality.
            error!("fsm queue overflow: {err}");
            self.shared
                .state
                .store(SysState::Alarm as u8, Ordering::SeqCst);
        }
    }

    /// Current system state.
    pub fn state(&self) -> SysState {
        SysState::from_u8(self.shared.state.load(Ordering::SeqCst)).unwrap_or(SysState::Init)
    }

    /// Pending requested state, if any.
    pub fn requested(&self) -> Option<SysState> {
        SysState::from_u8(self.shared.requested.load(Ordering::SeqCst))
    }

    /// True in the states that abort motion.
    pub fn is_abort(&self) -> bool {
        matches!(self.state(), SysState::Alarm | SysState::Fault)
    }
}

struct Coordinator {
    shared: Arc<Shared>,
    sub_state: [u8; N_FSM],
    maps: [Vec<(SysState, u8)>; N_FSM],
    handlers: [Option<Handler>; N_FSM],
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::Receiver<Msg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Register { sub, map, handler } => {
                    // Registration marks the sub initialized; its first
                    // update supplies the real state.
                    self.sub_state[sub as usize] = 0;
                    self.maps[sub as usize] = map;
                    self.handlers[sub as usize] = handler;
                }
                Msg::Request { state } => {
                    let current = self.shared.requested.load(Ordering::SeqCst);
                    if current != state as u8 {
                        self.shared.requested.store(state as u8, Ordering::SeqCst);
                        debug!(state = state.name(), "state requested");
                        self.notify();
                    }
                }
                Msg::Update { sub, sub_state } => {
                    if self.maps[sub as usize].is_empty() {
                        warn!(?sub, "state update from unregistered sub ignored");
                        continue;
                    }
                    self.sub_state[sub as usize] = sub_state;
                    self.arbitrate();
                }
            }
        }
    }

    fn arbitrate(&mut self) {
        if self
            .sub_state
            .iter()
            .any(|&s| s == SUB_STATE_UNINITIALIZED)
        {
            self.update_system_state(SysState::Init);
            return;
        }

        // One bit per sub, per system state: which subs accept each state
        // given what they currently report.
        let all_subs: u16 = (1 << N_FSM) - 1;
        let mut accepts = [0u16; N_SYS_STATES];
        for sub in 0..N_FSM {
            for &(system_state, sub_state) in &self.maps[sub] {
                if sub_state == self.sub_state[sub] {
                    accepts[system_state as usize] |= 1 << sub;
                }
            }
        }

        // Priority states fire on any single vote, highest index winning.
        let mut priority_match = None;
        for state in SysState::ALL {
            if accepts[state as usize] != 0 && state.is_priority() {
                priority_match = Some(state);
            }
        }
        if let Some(state) = priority_match {
            self.update_system_state(state);
            return;
        }

        if let Some(requested) = SysState::from_u8(self.shared.requested.load(Ordering::SeqCst)) {
            if accepts[requested as usize] == all_subs {
                self.update_system_state(requested);
                return;
            }
        }

        let consensus: Vec<SysState> = SysState::ALL
            .into_iter()
            .filter(|&s| accepts[s as usize] == all_subs)
            .collect();
        match consensus.as_slice() {
            [] => {} // no agreement, hold the current state
            [state] => self.update_system_state(*state),
            states => {
                warn!(?states, "conflicting state consensus, holding current state");
            }
        }
    }

    fn update_system_state(&mut self, state: SysState) {
        let previous = self.shared.state.load(Ordering::SeqCst);
        if previous != state as u8 {
            info!(
                from = SysState::from_u8(previous).map(SysState::name).unwrap_or("?"),
                to = state.name(),
                "system state changed"
            );
            self.shared.state.store(state as u8, Ordering::SeqCst);
            if self.shared.requested.load(Ordering::SeqCst) == state as u8 {
                self.shared.requested.store(REQ_NONE, Ordering::SeqCst);
            }
            self.notify();
        }
    }

    fn notify(&self) {
        let event = FsmEvent {
            state: SysState::from_u8(self.shared.state.load(Ordering::SeqCst))
                .unwrap_or(SysState::Init),
            requested: SysState::from_u8(self.shared.requested.load(Ordering::SeqCst)),
        };
        for handler in self.handlers.iter().flatten() {
            handler(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn settle(fsm: &Fsm, expected: SysState) {
        for _ in 0..200 {
            if fsm.state() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("state never became {expected:?}, stuck at {:?}", fsm.state());
    }

    /// Register every sub with a map where sub-state 0 is Init, 1 accepts
    /// all consensus states, and 2 maps to Alarm.
    fn register_all(fsm: &Fsm) {
        let subs = [
            SubFsm::Cli,
            SubFsm::Driver,
            SubFsm::Switches,
            SubFsm::Motion,
            SubFsm::Limits,
        ];
        for sub in subs {
            fsm.register(
                sub,
                &[
                    (SysState::Init, 0),
                    (SysState::Sleep, 1),
                    (SysState::Idle, 1),
                    (SysState::Homing, 1),
                    (SysState::Run, 1),
                    (SysState::Hold, 1),
                    (SysState::Alarm, 2),
                    (SysState::Fault, 3),
                ],
                None,
            );
        }
    }

    fn update_all(fsm: &Fsm, sub_state: u8) {
        for sub in [
            SubFsm::Cli,
            SubFsm::Driver,
            SubFsm::Switches,
            SubFsm::Motion,
            SubFsm::Limits,
        ] {
            fsm.update(sub, sub_state);
        }
    }

    #[tokio::test]
    async fn consensus_reaches_the_requested_state() {
        let fsm = Fsm::spawn();
        register_all(&fsm);
        update_all(&fsm, 1);
        // Idle is the boot-time request.
        settle(&fsm, SysState::Idle).await;

        fsm.request(SysState::Run);
        // A request alone does not transition; the next update does.
        fsm.update(SubFsm::Motion, 1);
        settle(&fsm, SysState::Run).await;
        assert_eq!(fsm.requested(), None);
    }

    #[tokio::test]
    async fn any_single_alarm_vote_wins() {
        let fsm = Fsm::spawn();
        register_all(&fsm);
        update_all(&fsm, 1);
        settle(&fsm, SysState::Idle).await;

        fsm.update(SubFsm::Limits, 2);
        settle(&fsm, SysState::Alarm).await;
        assert!(fsm.is_abort());
    }

    #[tokio::test]
    async fn fault_outranks_alarm() {
        let fsm = Fsm::spawn();
        register_all(&fsm);
        update_all(&fsm, 1);
        settle(&fsm, SysState::Idle).await;

        fsm.update(SubFsm::Limits, 2);
        fsm.update(SubFsm::Driver, 3);
        settle(&fsm, SysState::Fault).await;
    }

    #[tokio::test]
    async fn unregistered_sub_forces_init() {
        let fsm = Fsm::spawn();
        // Only four of five register.
        for sub in [SubFsm::Cli, SubFsm::Driver, SubFsm::Switches, SubFsm::Motion] {
            fsm.register(sub, &[(SysState::Idle, 1)], None);
            fsm.update(sub, 1);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fsm.state(), SysState::Init);
    }

    #[tokio::test]
    async fn update_from_unregistered_sub_is_ignored() {
        let fsm = Fsm::spawn();
        fsm.update(SubFsm::Limits, 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fsm.state(), SysState::Init);
    }

    #[tokio::test]
    async fn handlers_observe_transitions() {
        let fsm = Fsm::spawn();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_by_handler = seen.clone();

        let subs = [
            SubFsm::Cli,
            SubFsm::Driver,
            SubFsm::Switches,
            SubFsm::Motion,
            SubFsm::Limits,
        ];
        for sub in subs {
            let handler: Option<Handler> = if sub == SubFsm::Cli {
                let seen = seen_by_handler.clone();
                Some(Box::new(move |event: &FsmEvent| {
                    seen.lock().unwrap().push(event.state);
                }))
            } else {
                None
            };
            fsm.register(
                sub,
                &[(SysState::Init, 0), (SysState::Idle, 1), (SysState::Alarm, 2)],
                handler,
            );
        }
        update_all(&fsm, 1);
        settle(&fsm, SysState::Idle).await;
        fsm.update(SubFsm::Motion, 2);
        settle(&fsm, SysState::Alarm).await;

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&SysState::Idle));
        assert!(seen.contains(&SysState::Alarm));
    }
}
