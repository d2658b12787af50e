//! RS-274/NGC interpreter.
//!
//! Executes one preprocessed line of G-code at a time. A line is parsed
//! into a transient block, validated against the NIST modal-group rules,
//! and only then committed: the persistent modal state never changes on a
//! rejected line. Validated motion is dispatched through [`MotionControl`],
//! which keeps the interpreter free of any threading or hardware concerns.
//!
//! Lines are expected preprocessed: upper case, no whitespace, comments and
//! block-delete characters removed. [`preprocess_line`] implements that
//! contract for the transports.

use std::sync::Arc;

use tracing::debug;

use crate::axis::{Axis, N_AXIS};
use crate::math::{self, MM_PER_INCH};
use crate::planner::{condition, LineData};
use crate::settings::Settings;
use crate::status::Status;

/// Longest accepted command line, in bytes.
pub const LINE_LENGTH: usize = 512;

/// Line numbers above this are rejected. The RS-274 limit of 99999 is
/// raised to the largest integer a single-precision float can carry
/// without loss, since some senders number generously.
pub const MAX_LINE_NUMBER: i32 = 10_000_000;

/// Modal group G1: motion modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionMode {
    #[default]
    Seek,
    Linear,
    CwArc,
    CcwArc,
    /// G38.x straight probe. Parsed, but probing hardware is not wired.
    Probe,
    /// G80: motion canceled.
    None,
}

/// Modal group G5: feed rate interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedRateMode {
    #[default]
    UnitsPerMin,
    InverseTime,
}

/// Modal group G6: input units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitsMode {
    #[default]
    Mm,
    Inches,
}

/// Modal group G3: distance interpretation for axis words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMode {
    #[default]
    Absolute,
    Incremental,
}

/// Modal group G2: active plane for arc motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaneSelect {
    #[default]
    Xy,
    Zx,
    Yz,
}

impl PlaneSelect {
    /// Plane axes as (first arc axis, second arc axis, linear axis).
    pub fn axes(self) -> (Axis, Axis, Axis) {
        match self {
            PlaneSelect::Xy => (Axis::X, Axis::Y, Axis::Z),
            PlaneSelect::Zx => (Axis::Z, Axis::X, Axis::Y),
            PlaneSelect::Yz => (Axis::Y, Axis::Z, Axis::X),
        }
    }
}

/// Modal group M4: program flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgramFlow {
    #[default]
    Running,
    /// M0 and M1.
    Paused,
    /// M2 and M30.
    Completed,
}

/// Modal group M7: laser control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpindleState {
    #[default]
    Disable,
    /// M3: constant power.
    EnableCw,
    /// M4: speed-adjusted power.
    EnableCcw,
}

impl SpindleState {
    pub fn condition_flag(self) -> u8 {
        match self {
            SpindleState::Disable => 0,
            SpindleState::EnableCw => condition::SPINDLE_CW,
            SpindleState::EnableCcw => condition::SPINDLE_CCW,
        }
    }
}

/// Modal group M8: coolant / air assist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoolantState {
    #[default]
    Disable,
    Flood,
}

impl CoolantState {
    pub fn condition_flag(self) -> u8 {
        match self {
            CoolantState::Disable => 0,
            CoolantState::Flood => condition::COOLANT_FLOOD,
        }
    }
}

/// Non-modal commands (modal group G0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NonModal {
    Dwell,
    SetCoordinateData,
    GoHome0,
    SetHome0,
    GoHome1,
    SetHome1,
    AbsoluteOverride,
    SetCoordinateOffset,
    ResetCoordinateOffset,
}

/// Complete modal state, persisted across lines.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Modal {
    pub motion: MotionMode,
    pub feed_rate: FeedRateMode,
    pub units: UnitsMode,
    pub distance: DistanceMode,
    pub plane_select: PlaneSelect,
    pub coord_select: u8,
    pub program_flow: ProgramFlow,
    pub coolant: CoolantState,
    pub spindle: SpindleState,
}

#[derive(Debug, Clone, Copy, Default)]
struct Values {
    f: f32,
    ijk: [f32; N_AXIS],
    n: i32,
    p: f32,
    r: f32,
    s: f32,
    xyz: [f32; N_AXIS],
}

// Modal group indices for the duplicate-command check.
#[derive(Clone, Copy)]
enum ModalGroup {
    G0,
    G1,
    G2,
    G3,
    G4,
    G5,
    G6,
    G7,
    G12,
    G13,
    M4,
    M7,
    M8,
}

impl ModalGroup {
    fn bit(self) -> u16 {
        1 << self as u16
    }
}

// Value word bits for repeat and leftover tracking.
mod word {
    pub const F: u16 = 1 << 0;
    pub const I: u16 = 1 << 1;
    pub const J: u16 = 1 << 2;
    pub const K: u16 = 1 << 3;
    pub const L: u16 = 1 << 4;
    pub const N: u16 = 1 << 5;
    pub const P: u16 = 1 << 6;
    pub const R: u16 = 1 << 7;
    pub const S: u16 = 1 << 8;
    pub const T: u16 = 1 << 9;
    pub const X: u16 = 1 << 10;
    pub const Y: u16 = 1 << 11;
    pub const Z: u16 = 1 << 12;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AxisCommand {
    None,
    NonModal,
    Motion,
}

/// Effect interface the parser dispatches through.
///
/// Implementations decide how motion is queued and how long calls may
/// block; the parser only guarantees it calls these after full validation.
pub trait MotionControl {
    /// Queue a straight line to `target` (absolute mm).
    fn line(&mut self, target: &[f32; N_AXIS], data: LineData);

    /// Queue an arc from `position` to `target` around `position + offset`.
    #[allow(clippy::too_many_arguments)]
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
        data: LineData,
    );

    /// Pause for `seconds` without motion.
    fn dwell(&mut self, seconds: f32);

    /// Block until all buffered motion has executed.
    fn buffer_synchronize(&mut self);

    /// Apply a laser state change synchronized with motion.
    fn spindle_sync(&mut self, state: SpindleState, rpm: f32);

    /// Feedback message for the operator.
    fn feedback(&mut self, message: &str);
}

/// The interpreter. One instance per command stream.
pub struct Parser {
    settings: Arc<Settings>,
    modal: Modal,
    spindle_speed: f32,
    feed_rate: f32,
    line_number: i32,
    /// Where the interpreter considers the tool to be, in mm. This is the
    /// commanded target of the last motion, not the hardware position, so
    /// chained relative math stays exact while the machine catches up.
    position: [f32; N_AXIS],
}

impl Parser {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            modal: Modal::default(),
            spindle_speed: 0.0,
            feed_rate: 0.0,
            line_number: 0,
            position: [0.0; N_AXIS],
        }
    }

    pub fn modal(&self) -> &Modal {
        &self.modal
    }

    pub fn position(&self) -> [f32; N_AXIS] {
        self.position
    }

    pub fn line_number(&self) -> i32 {
        self.line_number
    }

    /// Reset the cached tool position from the hardware step count.
    pub fn sync_position(&mut self, sys_position: &[i32; N_AXIS]) {
        self.position = self.settings.steps_to_mpos(sys_position);
    }

    /// Execute one preprocessed line.
    ///
    /// On error the line is discarded whole: no modal state changes, no
    /// motion is queued, and the caller reports the status code.
    pub fn execute_line(&mut self, line: &str, mc: &mut dyn MotionControl) -> Result<(), Status> {
        let bytes = line.as_bytes();
        if bytes.len() > LINE_LENGTH {
            return Err(Status::LineLengthExceeded);
        }

        // The block under construction: modal state is copied, updated
        // while parsing, and only written back after all checks pass.
        let mut block_modal = self.modal;
        let mut non_modal: Option<NonModal> = None;
        let mut values = Values::default();

        let mut axis_command = AxisCommand::None;
        let mut command_words: u16 = 0;
        let mut value_words: u16 = 0;
        let mut axis_words: u8 = 0;
        let mut ijk_words: u8 = 0;

        let mut pos = 0usize;
        while pos < bytes.len() {
            let letter = bytes[pos];
            if !letter.is_ascii_uppercase() {
                return Err(Status::ExpectedCommandLetter);
            }
            pos += 1;
            let value = math::read_float(bytes, &mut pos).ok_or(Status::BadNumberFormat)?;

            let int_value = value.trunc() as u16;
            // Mantissa in hundredths catches Gxx.x commands and rejects
            // non-integer command values.
            let mut mantissa = (100.0 * (value - int_value as f32)).round() as u16;

            match letter {
                b'G' => {
                    let group = match int_value {
                        10 | 28 | 30 | 92 => {
                            if mantissa == 0 {
                                if axis_command != AxisCommand::None {
                                    return Err(Status::AxisCommandConflict);
                                }
                                axis_command = AxisCommand::NonModal;
                            }
                            non_modal = Some(match (int_value, mantissa) {
                                (10, 0) => NonModal::SetCoordinateData,
                                (28, 0) => NonModal::GoHome0,
                                (28, 10) => NonModal::SetHome0,
                                (30, 0) => NonModal::GoHome1,
                                (30, 10) => NonModal::SetHome1,
                                (92, 0) => NonModal::SetCoordinateOffset,
                                (92, 10) => NonModal::ResetCoordinateOffset,
                                (10, _) => return Err(Status::CommandValueNotInteger),
                                _ => return Err(Status::UnsupportedCommand),
                            });
                            mantissa = 0;
                            ModalGroup::G0
                        }
                        4 => {
                            non_modal = Some(NonModal::Dwell);
                            ModalGroup::G0
                        }
                        53 => {
                            non_modal = Some(NonModal::AbsoluteOverride);
                            ModalGroup::G0
                        }
                        0 | 1 | 2 | 3 | 38 => {
                            if axis_command != AxisCommand::None {
                                return Err(Status::AxisCommandConflict);
                            }
                            axis_command = AxisCommand::Motion;
                            block_modal.motion = match int_value {
                                0 => MotionMode::Seek,
                                1 => MotionMode::Linear,
                                2 => MotionMode::CwArc,
                                3 => MotionMode::CcwArc,
                                _ => {
                                    if !matches!(mantissa, 20 | 30 | 40 | 50) {
                                        return Err(Status::UnsupportedCommand);
                                    }
                                    mantissa = 0;
                                    MotionMode::Probe
                                }
                            };
                            ModalGroup::G1
                        }
                        80 => {
                            block_modal.motion = MotionMode::None;
                            ModalGroup::G1
                        }
                        17 | 18 | 19 => {
                            block_modal.plane_select = match int_value {
                                17 => PlaneSelect::Xy,
                                18 => PlaneSelect::Zx,
                                _ => PlaneSelect::Yz,
                            };
                            ModalGroup::G2
                        }
                        90 | 91 => {
                            if mantissa == 0 {
                                block_modal.distance = if int_value == 90 {
                                    DistanceMode::Absolute
                                } else {
                                    DistanceMode::Incremental
                                };
                                ModalGroup::G3
                            } else {
                                // Only G91.1 exists; incremental arc IJK is
                                // already the default, so it is a no-op.
                                if mantissa != 10 || int_value == 90 {
                                    return Err(Status::UnsupportedCommand);
                                }
                                mantissa = 0;
                                ModalGroup::G4
                            }
                        }
                        93 | 94 => {
                            block_modal.feed_rate = if int_value == 93 {
                                FeedRateMode::InverseTime
                            } else {
                                FeedRateMode::UnitsPerMin
                            };
                            ModalGroup::G5
                        }
                        20 | 21 => {
                            block_modal.units = if int_value == 20 {
                                UnitsMode::Inches
                            } else {
                                UnitsMode::Mm
                            };
                            ModalGroup::G6
                        }
                        // Cutter compensation is permanently off; G40 is
                        // accepted so program headers do not error out.
                        40 => ModalGroup::G7,
                        54..=59 => {
                            block_modal.coord_select = (int_value - 54) as u8;
                            ModalGroup::G12
                        }
                        61 => {
                            if mantissa != 0 {
                                return Err(Status::UnsupportedCommand);
                            }
                            ModalGroup::G13
                        }
                        _ => return Err(Status::UnsupportedCommand),
                    };
                    if mantissa > 0 {
                        return Err(Status::CommandValueNotInteger);
                    }
                    if command_words & group.bit() != 0 {
                        return Err(Status::ModalGroupViolation);
                    }
                    command_words |= group.bit();
                }
                b'M' => {
                    if mantissa > 0 {
                        return Err(Status::CommandValueNotInteger);
                    }
                    let group = match int_value {
                        0 | 1 | 2 | 30 => {
                            match int_value {
                                0 => block_modal.program_flow = ProgramFlow::Paused,
                                1 => {} // optional stop not supported
                                _ => block_modal.program_flow = ProgramFlow::Completed,
                            }
                            ModalGroup::M4
                        }
                        3 | 4 | 5 => {
                            block_modal.spindle = match int_value {
                                3 => SpindleState::EnableCw,
                                4 => SpindleState::EnableCcw,
                                _ => SpindleState::Disable,
                            };
                            ModalGroup::M7
                        }
                        8 | 9 => {
                            block_modal.coolant = if int_value == 8 {
                                CoolantState::Flood
                            } else {
                                CoolantState::Disable
                            };
                            ModalGroup::M8
                        }
                        _ => return Err(Status::UnsupportedCommand),
                    };
                    if command_words & group.bit() != 0 {
                        return Err(Status::ModalGroupViolation);
                    }
                    command_words |= group.bit();
                }
                _ => {
                    let word_bit = match letter {
                        b'F' => {
                            values.f = value;
                            word::F
                        }
                        b'I' => {
                            values.ijk[0] = value;
                            ijk_words |= 1 << 0;
                            word::I
                        }
                        b'J' => {
                            values.ijk[1] = value;
                            ijk_words |= 1 << 1;
                            word::J
                        }
                        b'K' => {
                            values.ijk[2] = value;
                            ijk_words |= 1 << 2;
                            word::K
                        }
                        b'L' => word::L,
                        b'N' => {
                            values.n = value.trunc() as i32;
                            word::N
                        }
                        b'P' => {
                            values.p = value;
                            word::P
                        }
                        b'R' => {
                            values.r = value;
                            word::R
                        }
                        b'S' => {
                            values.s = value;
                            word::S
                        }
                        b'T' => word::T,
                        b'X' => {
                            values.xyz[0] = value;
                            axis_words |= 1 << 0;
                            word::X
                        }
                        b'Y' => {
                            values.xyz[1] = value;
                            axis_words |= 1 << 1;
                            word::Y
                        }
                        b'Z' => {
                            values.xyz[2] = value;
                            axis_words |= 1 << 2;
                            word::Z
                        }
                        _ => return Err(Status::UnsupportedCommand),
                    };

                    if value_words & word_bit != 0 {
                        return Err(Status::WordRepeated);
                    }
                    if word_bit & (word::F | word::N | word::P | word::T | word::S) != 0
                        && value < 0.0
                    {
                        return Err(Status::NegativeValue);
                    }
                    value_words |= word_bit;
                }
            }
        }
        // Parsing complete. Error-check everything in NIST order before
        // touching the persistent state.

        if axis_words != 0 && axis_command == AxisCommand::None {
            axis_command = AxisCommand::Motion; // implicit motion mode
        }

        if value_words & word::N != 0 && values.n > MAX_LINE_NUMBER {
            return Err(Status::InvalidLineNumber);
        }

        // Feed rate mode. In inverse time mode every motion block needs a
        // fresh F word; in units mode the previous rate carries over.
        let mut parser_laser_disable = false;
        let mut parser_laser_is_motion = false;
        let mut parser_laser_force_sync = false;

        if block_modal.feed_rate == FeedRateMode::InverseTime {
            if axis_command == AxisCommand::Motion
                && !matches!(block_modal.motion, MotionMode::None | MotionMode::Seek)
                && value_words & word::F == 0
            {
                return Err(Status::UndefinedFeedRate);
            }
        } else if self.modal.feed_rate == FeedRateMode::UnitsPerMin {
            if value_words & word::F != 0 {
                if block_modal.units == UnitsMode::Inches {
                    values.f *= MM_PER_INCH;
                }
            } else {
                values.f = self.feed_rate;
            }
        }
        // Switching G93 -> G94 leaves the feed rate undefined until set.

        if value_words & word::S == 0 {
            values.s = self.spindle_speed;
        }

        if non_modal == Some(NonModal::Dwell) {
            if value_words & word::P == 0 {
                return Err(Status::ValueWordMissing);
            }
            value_words &= !word::P;
        }

        let (axis_0, axis_1, axis_linear) = block_modal.plane_select.axes();
        let (a0, a1) = (axis_0.index(), axis_1.index());

        if block_modal.units == UnitsMode::Inches {
            for idx in 0..N_AXIS {
                if axis_words & (1 << idx) != 0 {
                    values.xyz[idx] *= MM_PER_INCH;
                }
            }
        }

        // Absolute targets are machine coordinates; unspecified axes hold
        // position.
        let mut target = self.position;
        if axis_words != 0 {
            for idx in 0..N_AXIS {
                if axis_words & (1 << idx) != 0 {
                    target[idx] = match block_modal.distance {
                        DistanceMode::Absolute => values.xyz[idx],
                        DistanceMode::Incremental => self.position[idx] + values.xyz[idx],
                    };
                }
            }
        }

        let mut arc_is_clockwise = false;
        if block_modal.motion == MotionMode::None {
            if axis_words != 0 {
                return Err(Status::AxisWordsExist);
            }
        } else if axis_command == AxisCommand::Motion {
            match block_modal.motion {
                MotionMode::Seek => {
                    if axis_words == 0 {
                        axis_command = AxisCommand::None;
                    }
                }
                MotionMode::Probe => return Err(Status::UnsupportedCommand),
                _ => {
                    // All motion modes but G0 and G80 need a feed rate.
                    if values.f == 0.0 {
                        return Err(Status::UndefinedFeedRate);
                    }
                    match block_modal.motion {
                        MotionMode::Linear => {
                            if axis_words == 0 {
                                axis_command = AxisCommand::None;
                            }
                        }
                        MotionMode::CwArc | MotionMode::CcwArc => {
                            arc_is_clockwise = block_modal.motion == MotionMode::CwArc;
                            if axis_words == 0 {
                                return Err(Status::NoAxisWords);
                            }
                            if axis_words & ((1 << a0) | (1 << a1)) == 0 {
                                return Err(Status::NoAxisWordsInPlane);
                            }

                            let x = target[a0] - self.position[a0];
                            let y = target[a1] - self.position[a1];

                            if value_words & word::R != 0 {
                                // Radius mode: derive the center offsets.
                                value_words &= !word::R;
                                if target == self.position {
                                    return Err(Status::InvalidTarget);
                                }
                                if block_modal.units == UnitsMode::Inches {
                                    values.r *= MM_PER_INCH;
                                }
                                // 4r^2 - x^2 - y^2 < 0 means the endpoints
                                // are farther apart than the diameter.
                                let mut h_x2_div_d =
                                    4.0 * values.r * values.r - x * x - y * y;
                                if h_x2_div_d < 0.0 {
                                    return Err(Status::ArcRadiusError);
                                }
                                h_x2_div_d = -h_x2_div_d.sqrt() / math::hypot_f(x, y);
                                if block_modal.motion == MotionMode::CcwArc {
                                    h_x2_div_d = -h_x2_div_d;
                                }
                                // A negative radius selects the long way
                                // around: mirror the center across the chord.
                                if values.r < 0.0 {
                                    h_x2_div_d = -h_x2_div_d;
                                    values.r = -values.r;
                                }
                                values.ijk[a0] = 0.5 * (x - y * h_x2_div_d);
                                values.ijk[a1] = 0.5 * (y + x * h_x2_div_d);
                            } else {
                                // Center offset mode.
                                if ijk_words & ((1 << a0) | (1 << a1)) == 0 {
                                    return Err(Status::NoOffsetsInPlane);
                                }
                                value_words &= !(word::I | word::J | word::K);
                                if block_modal.units == UnitsMode::Inches {
                                    for idx in 0..N_AXIS {
                                        if ijk_words & (1 << idx) != 0 {
                                            values.ijk[idx] *= MM_PER_INCH;
                                        }
                                    }
                                }

                                let target_r = math::hypot_f(
                                    x - values.ijk[a0],
                                    y - values.ijk[a1],
                                );
                                values.r =
                                    math::hypot_f(values.ijk[a0], values.ijk[a1]);
                                let delta_r = (target_r - values.r).abs();
                                if delta_r > 0.005
                                    && (delta_r > 0.5 || delta_r > 0.001 * values.r)
                                {
                                    return Err(Status::InvalidTarget);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        // Leftover words mean the block used a value it had no command for.
        value_words &= !(word::N | word::F | word::S | word::T);
        if axis_command != AxisCommand::None {
            value_words &= !(word::X | word::Y | word::Z);
        }
        if value_words != 0 {
            return Err(Status::UnusedWords);
        }

        // Validation passed: commit the block in order of execution.

        if self.settings.laser_power_correction {
            if !matches!(
                block_modal.motion,
                MotionMode::Linear | MotionMode::CwArc | MotionMode::CcwArc
            ) {
                parser_laser_disable = true;
            }

            // Constant-power mode needs a sync whenever the laser state
            // would change without a motion to carry it.
            if axis_words != 0 && axis_command == AxisCommand::Motion {
                parser_laser_is_motion = true;
            } else if self.modal.spindle == SpindleState::EnableCw {
                if matches!(
                    self.modal.motion,
                    MotionMode::Linear | MotionMode::CwArc | MotionMode::CcwArc
                ) {
                    if parser_laser_disable {
                        parser_laser_force_sync = true;
                    }
                } else if !parser_laser_disable {
                    parser_laser_force_sync = true;
                }
            }
        }

        self.line_number = values.n;

        let mut pl_data = LineData::default();

        self.modal.feed_rate = block_modal.feed_rate;
        if self.modal.feed_rate == FeedRateMode::InverseTime {
            pl_data.condition |= condition::INVERSE_TIME;
        }

        self.feed_rate = values.f;
        pl_data.feed_rate = self.feed_rate;

        if self.spindle_speed != values.s || parser_laser_force_sync {
            if self.modal.spindle != SpindleState::Disable && !parser_laser_is_motion {
                let rpm = if parser_laser_disable { 0.0 } else { values.s };
                mc.spindle_sync(self.modal.spindle, rpm);
            }
            self.spindle_speed = values.s;
        }
        // Restricted laser motions carry zero power.
        if !parser_laser_disable {
            pl_data.spindle_speed = self.spindle_speed;
        }

        if self.modal.spindle != block_modal.spindle {
            mc.spindle_sync(block_modal.spindle, pl_data.spindle_speed);
            self.modal.spindle = block_modal.spindle;
        }
        pl_data.condition |= self.modal.spindle.condition_flag();

        self.modal.coolant = block_modal.coolant;
        pl_data.condition |= self.modal.coolant.condition_flag();

        if non_modal == Some(NonModal::Dwell) {
            mc.dwell(values.p);
        }

        self.modal.plane_select = block_modal.plane_select;
        self.modal.units = block_modal.units;
        self.modal.distance = block_modal.distance;
        self.modal.coord_select = block_modal.coord_select;

        // G10/G28/G30/G92 parse and validate, but coordinate offsets are
        // not implemented on this machine; they change no state.

        self.modal.motion = block_modal.motion;
        if self.modal.motion != MotionMode::None && axis_command == AxisCommand::Motion {
            match self.modal.motion {
                MotionMode::Linear => mc.line(&target, pl_data),
                MotionMode::Seek => {
                    pl_data.condition |= condition::RAPID_MOTION;
                    mc.line(&target, pl_data);
                }
                MotionMode::CwArc | MotionMode::CcwArc => {
                    mc.arc(
                        &target,
                        &self.position,
                        &values.ijk,
                        values.r,
                        axis_0,
                        axis_1,
                        axis_linear,
                        arc_is_clockwise,
                        pl_data,
                    );
                }
                _ => {}
            }
            // The parser's position is the commanded target from here on,
            // wherever the hardware actually is.
            self.position = target;
        }

        self.modal.program_flow = block_modal.program_flow;
        if self.modal.program_flow != ProgramFlow::Running {
            mc.buffer_synchronize();
            if self.modal.program_flow == ProgramFlow::Completed {
                // Program end resets a fixed subset of the modal groups.
                self.modal.motion = MotionMode::Linear;
                self.modal.plane_select = PlaneSelect::Xy;
                self.modal.distance = DistanceMode::Absolute;
                self.modal.feed_rate = FeedRateMode::UnitsPerMin;
                self.modal.coord_select = 0;
                self.modal.spindle = SpindleState::Disable;
                self.modal.coolant = CoolantState::Disable;
                mc.feedback("Pgm End");
            }
            self.modal.program_flow = ProgramFlow::Running;
        }

        debug!(line = %line, "executed");
        Ok(())
    }
}

/// Groom a raw input line into the form [`Parser::execute_line`] expects:
/// whitespace and control characters dropped, comments removed, block
/// delete ignored, letters upper-cased.
pub fn preprocess_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_paren_comment = false;
    let mut in_eol_comment = false;
    for c in line.chars() {
        if in_eol_comment {
            continue;
        }
        if in_paren_comment {
            if c == ')' {
                in_paren_comment = false;
            }
            continue;
        }
        match c {
            c if c <= ' ' => {}
            '/' => {} // block delete not supported
            '(' => in_paren_comment = true,
            ';' => in_eol_comment = true,
            c => out.push(c.to_ascii_uppercase()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every dispatched effect for inspection.
    #[derive(Default)]
    struct Recorder {
        lines: Vec<([f32; N_AXIS], LineData)>,
        arcs: Vec<([f32; N_AXIS], [f32; N_AXIS], f32, bool)>,
        dwells: Vec<f32>,
        syncs: usize,
        spindle_syncs: Vec<(SpindleState, f32)>,
        feedback: Vec<String>,
    }

    impl MotionControl for Recorder {
        fn line(&mut self, target: &[f32; N_AXIS], data: LineData) {
            self.lines.push((*target, data));
        }

        fn arc(
            &mut self,
            target: &[f32; N_AXIS],
            _position: &[f32; N_AXIS],
            offset: &[f32; N_AXIS],
            radius: f32,
            _axis_0: Axis,
            _axis_1: Axis,
            _axis_linear: Axis,
            is_clockwise: bool,
            _data: LineData,
        ) {
            self.arcs.push((*target, *offset, radius, is_clockwise));
        }

        fn dwell(&mut self, seconds: f32) {
            self.dwells.push(seconds);
        }

        fn buffer_synchronize(&mut self) {
            self.syncs += 1;
        }

        fn spindle_sync(&mut self, state: SpindleState, rpm: f32) {
            self.spindle_syncs.push((state, rpm));
        }

        fn feedback(&mut self, message: &str) {
            self.feedback.push(message.to_string());
        }
    }

    fn parser() -> (Parser, Recorder) {
        (
            Parser::new(Arc::new(Settings::default())),
            Recorder::default(),
        )
    }

    #[test]
    fn linear_move_updates_position_to_commanded_target() {
        let (mut parser, mut mc) = parser();
        parser.execute_line("G21", &mut mc).unwrap();
        parser.execute_line("G1X10Y0F600", &mut mc).unwrap();
        assert_eq!(parser.position(), [10.0, 0.0, 0.0]);
        assert_eq!(mc.lines.len(), 1);
        let (target, data) = &mc.lines[0];
        assert_eq!(*target, [10.0, 0.0, 0.0]);
        assert_eq!(data.feed_rate, 600.0);
        assert_eq!(data.condition & condition::RAPID_MOTION, 0);
    }

    #[test]
    fn unspecified_axes_hold_position() {
        let (mut parser, mut mc) = parser();
        parser.execute_line("G1X10Y5Z2F600", &mut mc).unwrap();
        parser.execute_line("G1X20", &mut mc).unwrap();
        assert_eq!(parser.position(), [20.0, 5.0, 2.0]);
    }

    #[test]
    fn incremental_mode_adds_to_position() {
        let (mut parser, mut mc) = parser();
        parser.execute_line("G91G1X5Y5F600", &mut mc).unwrap();
        parser.execute_line("G1X5", &mut mc).unwrap();
        assert_eq!(parser.position(), [10.0, 5.0, 0.0]);
    }

    #[test]
    fn seek_sets_the_rapid_condition() {
        let (mut parser, mut mc) = parser();
        parser.execute_line("G0X495.3", &mut mc).unwrap();
        let (_, data) = &mc.lines[0];
        assert_eq!(data.condition & condition::RAPID_MOTION, condition::RAPID_MOTION);
    }

    #[test]
    fn seek_without_axis_words_is_a_no_op() {
        let (mut parser, mut mc) = parser();
        parser.execute_line("G0", &mut mc).unwrap();
        assert!(mc.lines.is_empty());
    }

    #[test]
    fn inch_input_is_converted_to_mm() {
        let (mut parser, mut mc) = parser();
        parser.execute_line("G20G1X1.0F10", &mut mc).unwrap();
        assert!((parser.position()[0] - 25.4).abs() < 1e-4);
        // Feed rate converts from inch/min too.
        assert!((mc.lines[0].1.feed_rate - 254.0).abs() < 1e-3);
    }

    #[test]
    fn feed_rate_is_modal() {
        let (mut parser, mut mc) = parser();
        parser.execute_line("G1X10F600", &mut mc).unwrap();
        parser.execute_line("G1X20", &mut mc).unwrap();
        assert_eq!(mc.lines[1].1.feed_rate, 600.0);
    }

    #[test]
    fn missing_feed_rate_is_rejected() {
        let (mut parser, mut mc) = parser();
        assert_eq!(
            parser.execute_line("G1X10", &mut mc),
            Err(Status::UndefinedFeedRate)
        );
        assert_eq!(
            parser.execute_line("G1X10F0", &mut mc),
            Err(Status::UndefinedFeedRate)
        );
        // The failed lines must not have touched any state.
        assert_eq!(parser.position(), [0.0; N_AXIS]);
        assert!(mc.lines.is_empty());
    }

    #[test]
    fn inverse_time_requires_a_fresh_f_word() {
        let (mut parser, mut mc) = parser();
        parser.execute_line("G1X5F600", &mut mc).unwrap();
        assert_eq!(
            parser.execute_line("G93G1X10", &mut mc),
            Err(Status::UndefinedFeedRate)
        );
        parser.execute_line("G93G1X10F2", &mut mc).unwrap();
        let (_, data) = mc.lines.last().unwrap();
        assert_eq!(data.condition & condition::INVERSE_TIME, condition::INVERSE_TIME);
        assert_eq!(data.feed_rate, 2.0);
    }

    #[test]
    fn repeated_word_is_rejected() {
        let (mut parser, mut mc) = parser();
        assert_eq!(
            parser.execute_line("G1X10X20F600", &mut mc),
            Err(Status::WordRepeated)
        );
    }

    #[test]
    fn negative_f_is_rejected() {
        let (mut parser, mut mc) = parser();
        assert_eq!(
            parser.execute_line("G1X10F-600", &mut mc),
            Err(Status::NegativeValue)
        );
    }

    #[test]
    fn modal_group_violation_is_rejected() {
        let (mut parser, mut mc) = parser();
        assert_eq!(
            parser.execute_line("G0G1X10F600", &mut mc),
            Err(Status::ModalGroupViolation)
        );
        assert_eq!(
            parser.execute_line("G20G21", &mut mc),
            Err(Status::ModalGroupViolation)
        );
    }

    #[test]
    fn axis_command_conflict_is_rejected() {
        let (mut parser, mut mc) = parser();
        assert_eq!(
            parser.execute_line("G1G92X0", &mut mc),
            Err(Status::AxisCommandConflict)
        );
    }

    #[test]
    fn unknown_letters_and_bad_numbers_are_rejected() {
        let (mut parser, mut mc) = parser();
        assert_eq!(
            parser.execute_line("Q10", &mut mc),
            Err(Status::UnsupportedCommand)
        );
        assert_eq!(
            parser.execute_line("G", &mut mc),
            Err(Status::BadNumberFormat)
        );
        assert_eq!(
            parser.execute_line("g1x10", &mut mc),
            Err(Status::ExpectedCommandLetter)
        );
    }

    #[test]
    fn line_number_limit() {
        let (mut parser, mut mc) = parser();
        parser.execute_line("N99999G0X1", &mut mc).unwrap();
        assert_eq!(parser.line_number(), 99999);
        assert_eq!(
            parser.execute_line("N10000001G0X2", &mut mc),
            Err(Status::InvalidLineNumber)
        );
    }

    #[test]
    fn dwell_requires_p() {
        let (mut parser, mut mc) = parser();
        assert_eq!(
            parser.execute_line("G4", &mut mc),
            Err(Status::ValueWordMissing)
        );
        parser.execute_line("G4P0.5", &mut mc).unwrap();
        assert_eq!(mc.dwells, vec![0.5]);
    }

    #[test]
    fn unused_words_are_rejected() {
        let (mut parser, mut mc) = parser();
        assert_eq!(
            parser.execute_line("G0X1P2", &mut mc),
            Err(Status::UnusedWords)
        );
        assert_eq!(
            parser.execute_line("G1X1R5F600", &mut mc),
            Err(Status::UnusedWords)
        );
    }

    #[test]
    fn axis_words_with_motion_canceled_are_rejected() {
        let (mut parser, mut mc) = parser();
        parser.execute_line("G80", &mut mc).unwrap();
        assert_eq!(
            parser.execute_line("X5", &mut mc),
            Err(Status::AxisWordsExist)
        );
    }

    #[test]
    fn arc_radius_mode_computes_the_center() {
        let (mut parser, mut mc) = parser();
        // Quarter circle: (0,0) -> (5,5) with r = 5, CCW; center at (0,5).
        parser.execute_line("G3X5Y5R5F600", &mut mc).unwrap();
        let (target, offset, radius, clockwise) = &mc.arcs[0];
        assert_eq!(*target, [5.0, 5.0, 0.0]);
        assert!((radius - 5.0).abs() < 1e-4);
        assert!(!clockwise);
        assert!(offset[0].abs() < 1e-3, "i = {}", offset[0]);
        assert!((offset[1] - 5.0).abs() < 1e-3, "j = {}", offset[1]);
    }

    #[test]
    fn arc_radius_mode_rejects_zero_length_and_unreachable() {
        let (mut parser, mut mc) = parser();
        assert_eq!(
            parser.execute_line("G2X0Y0R5F600", &mut mc),
            Err(Status::InvalidTarget)
        );
        // Endpoints 20 apart cannot lie on a circle of radius 5.
        assert_eq!(
            parser.execute_line("G2X20Y0R5F600", &mut mc),
            Err(Status::ArcRadiusError)
        );
    }

    #[test]
    fn arc_offset_mode_checks_radius_consistency() {
        let (mut parser, mut mc) = parser();
        assert_eq!(
            parser.execute_line("G2X4Y0I1J0F600", &mut mc),
            Err(Status::InvalidTarget)
        );
        assert_eq!(
            parser.execute_line("G2X2Y0F600", &mut mc),
            Err(Status::NoOffsetsInPlane)
        );
        assert_eq!(
            parser.execute_line("G2R5F600", &mut mc),
            Err(Status::NoAxisWords)
        );
        // A consistent full circle is accepted.
        parser.execute_line("G1X10F600", &mut mc).unwrap();
        parser.execute_line("G2X10Y0I-5J0", &mut mc).unwrap();
        let (target, offset, radius, clockwise) = &mc.arcs[0];
        assert_eq!(*target, [10.0, 0.0, 0.0]);
        assert_eq!(offset[0], -5.0);
        assert!((radius - 5.0).abs() < 1e-5);
        assert!(clockwise);
    }

    #[test]
    fn program_end_resets_modal_state() {
        let (mut parser, mut mc) = parser();
        parser
            .execute_line("G18G91G93M4S100G1X1F2", &mut mc)
            .unwrap();
        parser.execute_line("M30", &mut mc).unwrap();
        let modal = parser.modal();
        assert_eq!(modal.motion, MotionMode::Linear);
        assert_eq!(modal.plane_select, PlaneSelect::Xy);
        assert_eq!(modal.distance, DistanceMode::Absolute);
        assert_eq!(modal.feed_rate, FeedRateMode::UnitsPerMin);
        assert_eq!(modal.spindle, SpindleState::Disable);
        assert_eq!(mc.syncs, 1);
        assert_eq!(mc.feedback, vec!["Pgm End".to_string()]);
    }

    #[test]
    fn laser_state_changes_sync_with_the_stream() {
        let (mut parser, mut mc) = parser();
        parser.execute_line("M4S500", &mut mc).unwrap();
        assert_eq!(mc.spindle_syncs.len(), 1);
        assert_eq!(mc.spindle_syncs[0].0, SpindleState::EnableCcw);
        parser.execute_line("G1X5F600", &mut mc).unwrap();
        let (_, data) = &mc.lines[0];
        assert_eq!(data.condition & condition::SPINDLE_CCW, condition::SPINDLE_CCW);
        assert_eq!(data.spindle_speed, 500.0);
    }

    #[test]
    fn non_motion_lines_in_laser_mode_carry_no_power() {
        let (mut parser, mut mc) = parser();
        parser.execute_line("M3S800", &mut mc).unwrap();
        parser.execute_line("G1X5F600", &mut mc).unwrap();
        // G0 is a restricted motion: power must drop to zero for it.
        parser.execute_line("G0X10", &mut mc).unwrap();
        let (_, data) = mc.lines.last().unwrap();
        assert_eq!(data.spindle_speed, 0.0);
    }

    #[test]
    fn coordinate_offset_commands_are_accepted_as_no_ops() {
        let (mut parser, mut mc) = parser();
        parser.execute_line("G1X5F600", &mut mc).unwrap();
        parser.execute_line("G92X0", &mut mc).unwrap();
        // Position is machine-absolute and unaffected.
        assert_eq!(parser.position(), [5.0, 0.0, 0.0]);
        assert_eq!(mc.lines.len(), 1);
    }

    #[test]
    fn probe_commands_are_rejected() {
        let (mut parser, mut mc) = parser();
        assert_eq!(
            parser.execute_line("G38.2X10F100", &mut mc),
            Err(Status::UnsupportedCommand)
        );
        assert_eq!(
            parser.execute_line("G38.9X10F100", &mut mc),
            Err(Status::UnsupportedCommand)
        );
    }

    #[test]
    fn preprocess_strips_comments_whitespace_and_case() {
        assert_eq!(preprocess_line("g1 x10 ; comment"), "G1X10");
        assert_eq!(preprocess_line("G1 (feed move) X10"), "G1X10");
        assert_eq!(preprocess_line("/ G1 X10"), "G1X10");
        assert_eq!(preprocess_line("  \t "), "");
    }

    #[test]
    fn over_long_lines_are_rejected() {
        let (mut parser, mut mc) = parser();
        let line = format!("G1F600X{}", "1".repeat(LINE_LENGTH));
        assert_eq!(
            parser.execute_line(&line, &mut mc),
            Err(Status::LineLengthExceeded)
        );
    }
}
