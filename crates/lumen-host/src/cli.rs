//! Command-line dispatch.
//!
//! Every line from a transport lands here. User commands (`~`, `?`, `$`,
//! `$T`, ...) are handled in place; anything else is groomed by the G-code
//! preprocessor and queued for the parser worker. The worker answers with
//! `ok`/`error:N` per line, so this layer stays silent for forwarded
//! G-code.

use std::sync::Arc;

use motion::gcode::{preprocess_line, LINE_LENGTH};
use motion::settings::Settings;
use motion::stepper::SysPosition;
use motion::Status;
use tracing::{error, info};

use crate::fsm::{Fsm, SubFsm, SysState};
use crate::messages::{Message, MessageSender};
use crate::stepgen::StepGen;

/// CLI sub-FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CliState {
    Init = 0,
    Operational = 1,
}

const CLI_STATE_MAP: &[(SysState, u8)] = &[
    (SysState::Init, CliState::Init as u8),
    (SysState::Sleep, CliState::Operational as u8),
    (SysState::Idle, CliState::Operational as u8),
    (SysState::Homing, CliState::Operational as u8),
    (SysState::Run, CliState::Operational as u8),
    (SysState::Hold, CliState::Operational as u8),
    (SysState::Alarm, CliState::Operational as u8),
    (SysState::Fault, CliState::Operational as u8),
];

/// Register the CLI sub-FSM. Called once by whichever transport starts.
/// The registered handler announces transitions into ALARM to the
/// operator.
pub fn register(fsm: &Fsm, messages: MessageSender) {
    let previous = parking_lot::Mutex::new(SysState::Init);
    let handler: crate::fsm::Handler = Box::new(move |event| {
        let mut previous = previous.lock();
        if event.state == SysState::Alarm && *previous != SysState::Alarm {
            messages.send(Message::Alarm(1));
        }
        *previous = event.state;
    });
    fsm.register(SubFsm::Cli, CLI_STATE_MAP, Some(handler));
    fsm.update(SubFsm::Cli, CliState::Operational as u8);
}

struct UserCommand {
    text: &'static str,
    takes_args: bool,
    kind: CommandKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    CycleStart,
    StatusReport,
    Help,
    TestCycle,
    CheckGcode,
    FeedHold,
    Reset,
    HomingCycle,
    Sleep,
}

// Longer spellings first so `$T` is not shadowed by `$`.
const COMMANDS: &[UserCommand] = &[
    UserCommand { text: "$SLP", takes_args: false, kind: CommandKind::Sleep },
    UserCommand { text: "$C", takes_args: false, kind: CommandKind::CheckGcode },
    UserCommand { text: "$H", takes_args: false, kind: CommandKind::HomingCycle },
    UserCommand { text: "$T", takes_args: false, kind: CommandKind::TestCycle },
    UserCommand { text: "$", takes_args: false, kind: CommandKind::Help },
    UserCommand { text: "~", takes_args: false, kind: CommandKind::CycleStart },
    UserCommand { text: "!", takes_args: false, kind: CommandKind::FeedHold },
    UserCommand { text: "?", takes_args: false, kind: CommandKind::StatusReport },
    UserCommand { text: "X", takes_args: false, kind: CommandKind::Reset },
];

/// Exercises the whole motion path across the bed, including a full
/// circle, without firing the laser.
const TEST_PROGRAM: &[&str] = &[
    "G0 X495.300 Y000.000",
    "G0 X495.300 Y279.400",
    "G0 X000.000 Y279.400",
    "G0 X200.000 Y135.000",
    "G2 X200.000 Y135.000 I050.000 J000.000 F3000",
    "G0 X000.000 Y279.400",
    "G0 X495.300 Y279.400",
    "G0 X000.000 Y000.000",
];

/// Everything `process_line` needs to act on a command.
#[derive(Clone)]
pub struct CliContext {
    pub settings: Arc<Settings>,
    pub fsm: Fsm,
    pub stepgen: StepGen,
    pub messages: MessageSender,
    pub position: Arc<SysPosition>,
    pub gcode_tx: crossbeam_channel::Sender<String>,
}

impl CliContext {
    fn status_report(&self) {
        let steps = self.position.snapshot();
        self.messages.send(Message::StatusReport {
            state: self.fsm.state(),
            mpos: self.settings.steps_to_mpos(&steps),
        });
    }

    fn queue_gcode(&self, line: &str) -> Result<(), Status> {
        if line.len() > LINE_LENGTH {
            return Err(Status::LineLengthExceeded);
        }
        let groomed = preprocess_line(line);
        // The queue owns its copy of the line from here on. A full queue
        // is reported rather than waited out; the transport must never
        // block.
        self.gcode_tx
            .try_send(groomed)
            .map_err(|_| Status::Overflow)
    }
}

/// A command matches when it takes no arguments and the line is exactly
/// the command text, or when it takes arguments and the line starts with
/// the command text.
fn match_command(line: &str) -> Option<CommandKind> {
    COMMANDS
        .iter()
        .find(|cmd| {
            if cmd.takes_args {
                line.starts_with(cmd.text)
            } else {
                line == cmd.text
            }
        })
        .map(|cmd| cmd.kind)
}

/// Handle one raw line from the active transport.
pub fn process_line(line: &str, ctx: &CliContext) {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        ctx.messages.send(Message::Ok);
        return;
    }

    match match_command(line) {
        Some(CommandKind::CycleStart) => {
            if matches!(ctx.fsm.state(), SysState::Idle | SysState::Hold) {
                ctx.fsm.request(SysState::Run);
                ctx.stepgen.wake_up();
            }
        }
        Some(CommandKind::StatusReport) => ctx.status_report(),
        Some(CommandKind::Help) => ctx.messages.send(Message::Help),
        Some(CommandKind::TestCycle) => {
            if ctx.fsm.state() == SysState::Idle && ctx.fsm.requested().is_none() {
                ctx.messages
                    .send(Message::Feedback("Queuing Test Code".into()));
                for gline in TEST_PROGRAM {
                    ctx.messages.send(Message::Plain((*gline).to_string()));
                    if let Err(status) = ctx.queue_gcode(gline) {
                        ctx.messages.send(Message::Error(status));
                        return;
                    }
                }
                ctx.messages
                    .send(Message::Feedback("Test Queued. '~' to cycle.".into()));
            } else {
                ctx.messages.send(Message::Error(Status::IdleError));
            }
        }
        Some(
            CommandKind::CheckGcode
            | CommandKind::FeedHold
            | CommandKind::Reset
            | CommandKind::HomingCycle
            | CommandKind::Sleep,
        ) => {
            info!(line, "unsupported user command");
            ctx.messages.send(Message::Error(Status::UnsupportedCommand));
        }
        None => {
            // Not a command: forward as G-code.
            if let Err(status) = ctx.queue_gcode(line) {
                error!(line, code = status.code(), "line not queued");
                ctx.messages.send(Message::Error(status));
            }
        }
    }
}
