//! Operator-facing messages.
//!
//! All output to the command interface funnels through one [`Message`]
//! enum and one formatting path, whatever transport is active. Subsystems
//! hold a cloned [`MessageSender`] and never write to the transport
//! directly.

use motion::axis::N_AXIS;
use motion::math::INCH_PER_MM;
use motion::Status;
use tokio::sync::mpsc;
use tracing::warn;

use crate::fsm::SysState;

/// One line (sometimes two) of output to the operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Command accepted.
    Ok,
    /// Command rejected with a status code.
    Error(Status),
    /// Alarm raised.
    Alarm(u8),
    /// `[MSG:...]` operator feedback.
    Feedback(String),
    /// Help listing.
    Help,
    /// Greeting on startup/connect.
    Welcome,
    /// Raw text passthrough.
    Plain(String),
    /// `<State,MPos:...>` report. Position is machine steps' mm value.
    StatusReport { state: SysState, mpos: [f32; N_AXIS] },
}

impl Message {
    /// Render the message body for the transport.
    pub fn render(&self, report_inches: bool) -> String {
        match self {
            Message::Ok => "ok".to_string(),
            Message::Error(status) => format!("error:{}", status.code()),
            Message::Alarm(code) => format!("ALARM:{code}"),
            Message::Feedback(text) => format!("[MSG:{text}]"),
            Message::Help => "[HLP:$ $T $SLP $C $X $H ~ ! ? X]".to_string(),
            Message::Welcome => format!(
                "Lumen CNC v{} ['$' for help]",
                env!("CARGO_PKG_VERSION")
            ),
            Message::Plain(text) => text.clone(),
            Message::StatusReport { state, mpos } => {
                let unit = |v: f32| if report_inches { v * INCH_PER_MM } else { v };
                format!(
                    "<{},MPos:{:.3},{:.3},{:.3}>",
                    state.name(),
                    unit(mpos[0]),
                    unit(mpos[1]),
                    unit(mpos[2])
                )
            }
        }
    }

    /// Reports and help are chased with an `ok` acknowledgment line.
    pub fn follows_with_ok(&self) -> bool {
        matches!(self, Message::Help | Message::StatusReport { .. })
    }
}

/// Cloneable handle for queueing messages to the active transport.
#[derive(Clone)]
pub struct MessageSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl MessageSender {
    pub fn channel() -> (MessageSender, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MessageSender { tx }, rx)
    }

    pub fn send(&self, message: Message) {
        if self.tx.send(message).is_err() {
            warn!("message dropped: transport is gone");
        }
    }

    /// Report the outcome of one command line.
    pub fn status(&self, result: Result<(), Status>) {
        match result {
            Ok(()) => self.send(Message::Ok),
            Err(status) => self.send(Message::Error(status)),
        }
    }
}
