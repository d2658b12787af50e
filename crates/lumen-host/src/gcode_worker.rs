//! G-code worker thread.
//!
//! Owns the interpreter and the motion-control handle. Lines arrive as
//! owned strings over a channel, execute one at a time, and each one is
//! answered with `ok` or `error:N`. The thread blocks freely (planner
//! backpressure, dwells), which is why it is a thread and not a task.

use std::sync::Arc;

use motion::gcode::Parser;
use motion::settings::Settings;
use motion::stepper::SysPosition;
use tracing::{debug, info};

use crate::messages::MessageSender;
use crate::motion_ctl::MotionCtl;

pub struct WorkerConfig {
    /// Start a cycle automatically after every successful line.
    pub mdi_mode: bool,
}

/// Spawn the worker. It exits when the line channel closes.
pub fn spawn(
    settings: Arc<Settings>,
    position: Arc<SysPosition>,
    mut motion_ctl: MotionCtl,
    lines: crossbeam_channel::Receiver<String>,
    messages: MessageSender,
    config: WorkerConfig,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("gcode".into())
        .spawn(move || {
            let mut parser = Parser::new(settings);
            parser.sync_position(&position.snapshot());
            info!("g-code worker running");
            for line in lines {
                debug!(line = %line, "executing");
                let result = parser.execute_line(&line, &mut motion_ctl);
                if result.is_ok() && config.mdi_mode {
                    motion_ctl.cycle_start();
                }
                messages.status(result);
            }
            info!("g-code worker stopped");
        })
        .expect("spawning the g-code worker thread")
}
