//! Lookahead motion planner.
//!
//! Buffers linear movements in a ring and keeps the acceleration profile
//! plan current: every appended block triggers a reverse pass that caps
//! entry speeds by what deceleration can absorb, then a forward pass that
//! caps them by what acceleration can reach. Blocks whose entry speed has
//! reached its ceiling are marked planned and never revisited, so the cost
//! of recalculation stays proportional to the unsettled span of the buffer.
//!
//! The planner's position is authoritative in integer steps; targets arrive
//! in millimeters and are quantized exactly once on entry.

use std::sync::Arc;

use tracing::trace;

use crate::axis::{Axis, N_AXIS};
use crate::math::{
    convert_delta_vector_to_unit_vector, limit_value_by_axis_maximum, MINIMUM_JUNCTION_SPEED,
    SOME_LARGE_VALUE,
};
use crate::segment::SegmentGenerator;
use crate::settings::Settings;

/// Number of linear motions the plan buffer can hold.
pub const BLOCK_BUFFER_SIZE: usize = 512;

/// Block condition flags carried from the parser into execution.
pub mod condition {
    /// Rapid (seek) motion, runs at the rapid rate.
    pub const RAPID_MOTION: u8 = 1 << 0;
    /// Reserved for single motions that bypass the planner state.
    pub const SYSTEM_MOTION: u8 = 1 << 1;
    /// Feed rate value is inverse time for this block.
    pub const INVERSE_TIME: u8 = 1 << 3;
    /// Laser in constant-power mode (M3).
    pub const SPINDLE_CW: u8 = 1 << 4;
    /// Laser in speed-adjusted power mode (M4).
    pub const SPINDLE_CCW: u8 = 1 << 5;
    /// Air assist on (M8).
    pub const COOLANT_FLOOD: u8 = 1 << 6;
    /// Reserved coolant channel.
    pub const COOLANT_MIST: u8 = 1 << 7;
}

/// Motion parameters for a new line, filled in by the parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineData {
    /// Desired feed rate. Ignored for rapid motions.
    pub feed_rate: f32,
    /// Laser power (S word) through this motion.
    pub spindle_speed: f32,
    /// Condition flags, see [`condition`].
    pub condition: u8,
}

/// One buffered linear movement with its planned kinematic envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanBlock {
    // Bresenham inputs, frozen at enqueue time. The step executor depends
    // on these staying untouched for the life of the block.
    pub steps: [u32; N_AXIS],
    pub step_event_count: u32,
    pub direction_bits: u8,

    pub condition: u8,
    pub spindle_speed: f32,

    /// Planned entry speed at the block junction in (mm/min)^2.
    pub entry_speed_sqr: f32,
    /// Ceiling for the entry speed: junction limit and neighbor nominals.
    pub max_entry_speed_sqr: f32,
    /// Axis-limit adjusted acceleration in mm/min^2. Never changes.
    pub acceleration: f32,
    /// Distance left to execute in mm. Counts down as segments are taken.
    pub millimeters: f32,

    /// Junction entry limit from the direction change at the block start.
    pub max_junction_speed_sqr: f32,
    /// Axis-limit adjusted maximum rate along this direction in mm/min.
    pub rapid_rate: f32,
    /// Programmed rate for this block in mm/min.
    pub programmed_rate: f32,
}

/// Ring buffer of movement blocks plus the running plan state.
pub struct Planner {
    settings: Arc<Settings>,
    blocks: Box<[PlanBlock]>,
    /// Index of the block being executed (next to execute when nonempty).
    tail: usize,
    /// Index of the next slot to write. The slot at `head` is always free.
    head: usize,
    /// Oldest block still eligible for recalculation.
    planned: usize,
    /// Planner position in steps. Tracks the committed tool path, not the
    /// hardware, so relative math stays exact while motion lags behind.
    position: [i32; N_AXIS],
    previous_unit_vec: [f32; N_AXIS],
    previous_nominal_speed: f32,
}

impl Planner {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            blocks: vec![PlanBlock::default(); BLOCK_BUFFER_SIZE].into_boxed_slice(),
            tail: 0,
            head: 0,
            planned: 0,
            position: [0; N_AXIS],
            previous_unit_vec: [0.0; N_AXIS],
            previous_nominal_speed: 0.0,
        }
    }

    fn next_index(index: usize) -> usize {
        (index + 1) % BLOCK_BUFFER_SIZE
    }

    fn prev_index(index: usize) -> usize {
        (index + BLOCK_BUFFER_SIZE - 1) % BLOCK_BUFFER_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// True when there is no room for another block.
    pub fn check_full_buffer(&self) -> bool {
        Self::next_index(self.head) == self.tail
    }

    /// Number of queued blocks.
    pub fn len(&self) -> usize {
        (self.head + BLOCK_BUFFER_SIZE - self.tail) % BLOCK_BUFFER_SIZE
    }

    /// Block currently at the execution end of the ring.
    pub fn current_block(&self) -> Option<&PlanBlock> {
        if self.is_empty() {
            None
        } else {
            Some(&self.blocks[self.tail])
        }
    }

    pub fn current_block_mut(&mut self) -> Option<&mut PlanBlock> {
        if self.is_empty() {
            None
        } else {
            Some(&mut self.blocks[self.tail])
        }
    }

    /// Block at `offset` positions behind the head, for inspection.
    pub fn block_from_head(&self, offset: usize) -> Option<&PlanBlock> {
        if offset >= self.len() {
            return None;
        }
        let mut index = self.head;
        for _ in 0..=offset {
            index = Self::prev_index(index);
        }
        Some(&self.blocks[index])
    }

    /// Release the executed block at the tail.
    pub fn discard_current_block(&mut self) {
        if self.is_empty() {
            return;
        }
        if self.tail == self.planned {
            self.planned = Self::next_index(self.planned);
        }
        self.tail = Self::next_index(self.tail);
    }

    /// Entry speed squared of the block after the executing one; zero when the
    /// executing block is the last in the buffer.
    pub fn exec_block_exit_speed_sqr(&self) -> f32 {
        let index = Self::next_index(self.tail);
        if index == self.head {
            0.0
        } else {
            self.blocks[index].entry_speed_sqr
        }
    }

    /// Speed the block cruises at when unconstrained by its neighbors.
    pub fn compute_profile_nominal_speed(&self, block: &PlanBlock) -> f32 {
        block.programmed_rate.max(self.settings.minimum_feed_rate)
    }

    fn compute_profile_parameters(
        block: &mut PlanBlock,
        nominal_speed: f32,
        prev_nominal_speed: f32,
    ) {
        let limit = nominal_speed.min(prev_nominal_speed);
        block.max_entry_speed_sqr = (limit * limit).min(block.max_junction_speed_sqr);
    }

    /// Add a new linear movement to the buffer.
    ///
    /// `target` is an absolute position in mm. Returns `false` without
    /// queueing when the move is shorter than one step on every axis; the
    /// caller is responsible for honoring any condition-only effects of
    /// such a block. The caller must guarantee the buffer is not full.
    pub fn buffer_line(
        &mut self,
        target: &[f32; N_AXIS],
        data: &LineData,
        prep: &mut SegmentGenerator,
    ) -> bool {
        let mut block = PlanBlock {
            condition: data.condition,
            spindle_speed: data.spindle_speed,
            ..PlanBlock::default()
        };

        // Quantize the target and derive the step counts. The unit vector
        // is computed from the quantized deltas so that planned distance
        // agrees exactly with the steps that will be emitted.
        let mut target_steps = [0i32; N_AXIS];
        let mut unit_vec = [0.0f32; N_AXIS];
        for idx in 0..N_AXIS {
            target_steps[idx] = (target[idx] * self.settings.steps_per_mm[idx]).round() as i32;
            let delta_steps = target_steps[idx] - self.position[idx];
            block.steps[idx] = delta_steps.unsigned_abs();
            block.step_event_count = block.step_event_count.max(block.steps[idx]);
            let delta_mm = delta_steps as f32 / self.settings.steps_per_mm[idx];
            unit_vec[idx] = delta_mm;
            if delta_mm < 0.0 {
                block.direction_bits |= Axis::ALL[idx].dir_bit();
            }
        }

        if block.step_event_count == 0 {
            return false;
        }

        block.millimeters = convert_delta_vector_to_unit_vector(&mut unit_vec);
        block.acceleration =
            limit_value_by_axis_maximum(&self.settings.acceleration, &unit_vec);
        block.rapid_rate = limit_value_by_axis_maximum(&self.settings.max_rate, &unit_vec);

        if block.condition & condition::RAPID_MOTION != 0 {
            block.programmed_rate = block.rapid_rate;
        } else {
            block.programmed_rate = data.feed_rate;
            if block.condition & condition::INVERSE_TIME != 0 {
                // Inverse time: F is 1/minutes for the whole move.
                block.programmed_rate *= block.millimeters;
                block.condition &= !condition::INVERSE_TIME;
            }
        }

        if self.is_empty() {
            // Starting from rest; there is no junction to negotiate.
            block.entry_speed_sqr = 0.0;
            block.max_junction_speed_sqr = 0.0;
        } else {
            // Centripetal cornering model: the max junction speed follows
            // from the angle between this move and the previous one and the
            // configured deviation from the ideal sharp corner.
            let mut junction_unit_vec = [0.0f32; N_AXIS];
            let mut junction_cos_theta = 0.0f32;
            for idx in 0..N_AXIS {
                junction_cos_theta -= self.previous_unit_vec[idx] * unit_vec[idx];
                junction_unit_vec[idx] = unit_vec[idx] - self.previous_unit_vec[idx];
            }

            if junction_cos_theta > 0.999999 {
                // Effectively a full reversal.
                block.max_junction_speed_sqr = MINIMUM_JUNCTION_SPEED * MINIMUM_JUNCTION_SPEED;
            } else if junction_cos_theta < -0.999999 {
                // Straight through; the junction does not limit speed.
                block.max_junction_speed_sqr = SOME_LARGE_VALUE;
            } else {
                convert_delta_vector_to_unit_vector(&mut junction_unit_vec);
                let junction_acceleration = limit_value_by_axis_maximum(
                    &self.settings.acceleration,
                    &junction_unit_vec,
                );
                let sin_theta_d2 = (0.5 * (1.0 - junction_cos_theta)).sqrt();
                block.max_junction_speed_sqr = (MINIMUM_JUNCTION_SPEED
                    * MINIMUM_JUNCTION_SPEED)
                    .max(
                        junction_acceleration * self.settings.junction_deviation * sin_theta_d2
                            / (1.0 - sin_theta_d2),
                    );
            }
        }

        let nominal_speed = self.compute_profile_nominal_speed(&block);
        Self::compute_profile_parameters(&mut block, nominal_speed, self.previous_nominal_speed);
        block.entry_speed_sqr = block.max_entry_speed_sqr;
        self.previous_nominal_speed = nominal_speed;
        self.previous_unit_vec = unit_vec;

        trace!(
            steps = block.step_event_count,
            mm = block.millimeters,
            rate = block.programmed_rate,
            "buffered block"
        );

        self.blocks[self.head] = block;
        self.head = Self::next_index(self.head);
        self.position = target_steps;

        self.recalculate(prep);
        true
    }

    /// Reverse/forward pass over the unplanned span of the buffer.
    fn recalculate(&mut self, prep: &mut SegmentGenerator) {
        // Newest block decelerates to rest at the buffer end.
        let mut block_index = Self::prev_index(self.head);
        if block_index == self.planned {
            return;
        }
        {
            let block = &mut self.blocks[block_index];
            block.entry_speed_sqr = block
                .max_entry_speed_sqr
                .min(2.0 * block.acceleration * block.millimeters);
        }

        // Reverse pass: cap each entry speed by what the following block
        // can absorb while decelerating.
        block_index = Self::prev_index(block_index);
        if block_index == self.planned {
            if block_index == self.tail {
                prep.plan_block_updated(&mut self.blocks[block_index]);
            }
        } else {
            let mut next_index = Self::prev_index(self.head);
            while block_index != self.planned {
                if block_index == self.tail {
                    prep.plan_block_updated(&mut self.blocks[block_index]);
                }
                let next_entry = self.blocks[next_index].entry_speed_sqr;
                let block = &mut self.blocks[block_index];
                if block.entry_speed_sqr != block.max_entry_speed_sqr {
                    block.entry_speed_sqr = block
                        .max_entry_speed_sqr
                        .min(next_entry + 2.0 * block.acceleration * block.millimeters);
                }
                next_index = block_index;
                block_index = Self::prev_index(block_index);
            }
        }

        // Forward pass: cap each entry speed by what the preceding block
        // can reach while accelerating, and advance the planned pointer
        // over blocks that can no longer improve.
        let mut current_index = self.planned;
        block_index = Self::next_index(self.planned);
        while block_index != self.head {
            let current = self.blocks[current_index];
            if current.entry_speed_sqr < self.blocks[block_index].entry_speed_sqr {
                let entry_speed_sqr =
                    current.entry_speed_sqr + 2.0 * current.acceleration * current.millimeters;
                if entry_speed_sqr < self.blocks[block_index].entry_speed_sqr {
                    self.blocks[block_index].entry_speed_sqr = entry_speed_sqr;
                    self.planned = block_index;
                }
            }
            let block = &self.blocks[block_index];
            if block.entry_speed_sqr == block.max_entry_speed_sqr {
                self.planned = block_index;
            }
            current_index = block_index;
            block_index = Self::next_index(block_index);
        }
    }

    /// Planner position in steps.
    pub fn position(&self) -> [i32; N_AXIS] {
        self.position
    }

    /// Reset the planner position from the hardware step count.
    pub fn sync_position(&mut self, sys_position: &[i32; N_AXIS]) {
        self.position = *sys_position;
    }

    /// Drop all buffered motion. The position is kept.
    pub fn reset_buffer(&mut self) {
        self.tail = 0;
        self.head = 0;
        self.planned = 0;
        self.previous_unit_vec = [0.0; N_AXIS];
        self.previous_nominal_speed = 0.0;
    }
}
