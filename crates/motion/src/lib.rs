//! # Motion Core
//!
//! The deterministic heart of the Lumen laser CNC controller. Everything in
//! this crate is plain sequential code with no I/O: the host daemon decides
//! how it is threaded and where the step bytes go.
//!
//! The data path mirrors the machine itself:
//!
//! 1. [`gcode::Parser`] interprets one preprocessed RS-274/NGC line at a
//!    time and dispatches validated motion through a [`gcode::MotionControl`]
//!    implementation.
//! 2. [`planner::Planner`] buffers linear moves in a ring and continuously
//!    recalculates junction entry speeds under per-axis acceleration limits.
//! 3. [`segment::SegmentGenerator`] samples the trapezoidal velocity profile
//!    of the executing block into small fixed-duration segments.
//! 4. [`stepper::StepTicker`] traces each segment with a Bresenham line
//!    algorithm and emits one step/direction byte per tick to a
//!    [`stepper::PulseSink`].
//!
//! Arcs are decomposed into chords by [`arc::ArcTrace`] before they reach
//! the planner, so the planner only ever sees straight lines.

pub mod arc;
pub mod axis;
pub mod gcode;
pub mod math;
pub mod planner;
pub mod segment;
pub mod settings;
pub mod status;
pub mod stepper;

// Re-export core types for easier access
pub use axis::{Axis, N_AXIS};
pub use gcode::{MotionControl, Parser};
pub use planner::{LineData, PlanBlock, Planner};
pub use segment::SegmentGenerator;
pub use settings::Settings;
pub use status::Status;
pub use stepper::{MemorySink, PulseSink, StepTicker, SysPosition};
