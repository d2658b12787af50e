//! # Lumen Host
//!
//! The controller daemon around the `motion` core. It owns every thread
//! and task in the process:
//!
//! * the system FSM coordinator, arbitrating sub-system states into one
//!   authoritative machine state,
//! * the command-line transports (console or TCP socket) feeding the
//!   G-code worker thread,
//! * motion control, which turns parsed commands into planner blocks,
//! * and the step-generator thread, which streams step bytes to the pulse
//!   device at the highest priority the platform gives us.
//!
//! Subsystems never reach into each other's state: they share the planner
//! and segment rings behind one mutex, the machine position as per-axis
//! atomics, and everything else moves over channels.

pub mod cli;
pub mod config;
pub mod console;
pub mod fsm;
pub mod gcode_worker;
pub mod limits;
pub mod messages;
pub mod motion_ctl;
pub mod pulse;
pub mod socket;
pub mod stepgen;
pub mod switches;
