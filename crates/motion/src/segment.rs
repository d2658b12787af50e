//! Step segment generation.
//!
//! Slices the velocity profile of the executing planner block into small
//! fixed-duration segments the step executor can replay without any float
//! math. Each segment carries a step count and a tick period; the Bresenham
//! inputs are copied into a side pool of [`StBlock`]s so the planner block
//! can be discarded while its last segments are still being executed.
//!
//! The sampler walks the ramp sequence analytically (acceleration, cruise,
//! deceleration) and accounts for the partial step left over at the end of
//! every segment, so long-term step timing carries no drift.

use std::sync::Arc;

use tracing::trace;

use crate::axis::N_AXIS;
use crate::planner::{condition, PlanBlock, Planner};
use crate::settings::Settings;

/// Number of segments the segment ring can hold.
pub const SEGMENT_BUFFER_SIZE: usize = 256;

/// One fixed-duration slice of a block's velocity profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    /// Step events to execute during this segment.
    pub n_step: u16,
    /// Tick periods per step event.
    pub cycles_per_tick: u32,
    /// Which [`StBlock`] holds the Bresenham data for this segment.
    pub st_block_index: u8,
    /// Laser power sample for this segment.
    pub spindle_pwm: u8,
}

/// Bresenham data frozen out of a planner block.
///
/// Step counts are stored doubled so the executor can seed its counters at
/// half the event count without losing the odd bit.
#[derive(Debug, Clone, Copy, Default)]
pub struct StBlock {
    pub steps: [u32; N_AXIS],
    pub step_event_count: u32,
    pub direction_bits: u8,
    /// Motion requires constant power per distance, laser power follows the
    /// instantaneous speed.
    pub is_pwm_rate_adjusted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ramp {
    Accel,
    Cruise,
    Decel,
    DecelOverride,
}

// Guarantee at least one step per segment: segments shorter than a step get
// their duration extended by whole DT_SEGMENT increments.
const REQ_MM_INCREMENT_SCALAR: f32 = 1.25;

/// Produces segments from the block at the planner tail.
pub struct SegmentGenerator {
    settings: Arc<Settings>,
    segments: Box<[Segment]>,
    st_blocks: Box<[StBlock]>,
    tail: usize,
    head: usize,
    next_head: usize,

    /// A block is loaded and its profile parameters are valid.
    block_active: bool,
    st_block_index: usize,
    /// Reload the profile without recopying Bresenham data.
    recalculate: bool,
    /// Next block must inherit the forced-deceleration exit speed.
    decel_override: bool,
    /// Forced deceleration to zero speed is in progress.
    execute_hold: bool,
    /// Motion ended mid-block; generation is parked until reset.
    end_motion: bool,
    update_pwm: bool,

    dt_remainder: f32,
    steps_remaining: f32,
    step_per_mm: f32,
    req_mm_increment: f32,

    ramp: Ramp,
    /// End of the velocity profile, measured from the end of the block.
    mm_complete: f32,
    current_speed: f32,
    maximum_speed: f32,
    exit_speed: f32,
    /// Acceleration ramp end, measured from the end of the block.
    accelerate_until: f32,
    /// Deceleration ramp start, measured from the end of the block.
    decelerate_after: f32,

    inv_rate: f32,
    current_pwm: u8,
}

impl SegmentGenerator {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            segments: vec![Segment::default(); SEGMENT_BUFFER_SIZE].into_boxed_slice(),
            st_blocks: vec![StBlock::default(); SEGMENT_BUFFER_SIZE - 1].into_boxed_slice(),
            tail: 0,
            head: 0,
            next_head: 1,
            block_active: false,
            st_block_index: 0,
            recalculate: false,
            decel_override: false,
            execute_hold: false,
            end_motion: false,
            update_pwm: false,
            dt_remainder: 0.0,
            steps_remaining: 0.0,
            step_per_mm: 0.0,
            req_mm_increment: 0.0,
            ramp: Ramp::Accel,
            mm_complete: 0.0,
            current_speed: 0.0,
            maximum_speed: 0.0,
            exit_speed: 0.0,
            accelerate_until: 0.0,
            decelerate_after: 0.0,
            inv_rate: 0.0,
            current_pwm: 0,
        }
    }

    fn next_index(index: usize) -> usize {
        (index + 1) % SEGMENT_BUFFER_SIZE
    }

    fn next_block_index(index: usize) -> usize {
        (index + 1) % (SEGMENT_BUFFER_SIZE - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        self.next_head == self.tail
    }

    /// Segment at the execution end of the ring, if any.
    pub fn tail_segment(&self) -> Option<Segment> {
        if self.is_empty() {
            None
        } else {
            Some(self.segments[self.tail])
        }
    }

    /// Bresenham data referenced by a segment.
    pub fn st_block(&self, index: u8) -> StBlock {
        self.st_blocks[index as usize]
    }

    /// Release the executed segment at the tail.
    pub fn advance_tail(&mut self) {
        if !self.is_empty() {
            self.tail = Self::next_index(self.tail);
        }
    }

    /// True when motion was terminated mid-block by a forced deceleration.
    pub fn motion_ended(&self) -> bool {
        self.end_motion
    }

    /// Begin a forced deceleration to zero speed.
    pub fn execute_hold(&mut self, planner: &mut Planner) {
        self.execute_hold = true;
        if let Some(block) = planner.current_block_mut() {
            self.plan_block_updated(block);
        }
    }

    /// Resume generation after a hold ran to completion. The interrupted
    /// block restarts from rest with only its profile recomputed.
    pub fn release_hold(&mut self, planner: &mut Planner) {
        self.execute_hold = false;
        self.end_motion = false;
        if let Some(block) = planner.current_block_mut() {
            self.plan_block_updated(block);
        }
    }

    /// Called by the planner when recalculation touched the executing
    /// block. Folds the generator's progress back into the block and flags
    /// the profile for recomputation.
    pub fn plan_block_updated(&mut self, block: &mut PlanBlock) {
        if self.block_active {
            self.recalculate = true;
            block.entry_speed_sqr = self.current_speed * self.current_speed;
            self.block_active = false;
        }
    }

    /// Clear all segment state. Pending planner blocks are untouched.
    pub fn reset(&mut self) {
        self.tail = 0;
        self.head = 0;
        self.next_head = 1;
        self.block_active = false;
        self.recalculate = false;
        self.decel_override = false;
        self.execute_hold = false;
        self.end_motion = false;
        self.update_pwm = false;
        self.dt_remainder = 0.0;
        self.current_speed = 0.0;
        self.current_pwm = 0;
    }

    fn compute_pwm(&self, rpm: f32) -> u8 {
        if rpm <= 0.0 {
            return 0;
        }
        let scale = (rpm / self.settings.laser_s_max).min(1.0);
        (scale * 127.0).round() as u8
    }

    /// Fill the segment ring to within one slot of full from the block at
    /// the planner tail. Returns when the ring is full or the planner runs
    /// out of work.
    pub fn prep_buffer(&mut self, planner: &mut Planner) {
        if self.end_motion {
            return;
        }

        while !self.is_full() {
            if !self.block_active {
                if planner.current_block().is_none() {
                    return;
                }

                if self.recalculate {
                    // Same block, new plan: keep the Bresenham copy and the
                    // step bookkeeping, recompute the velocity profile only.
                    self.recalculate = false;
                } else {
                    let Some(&block) = planner.current_block() else {
                        return;
                    };

                    self.st_block_index = Self::next_block_index(self.st_block_index);
                    let st = &mut self.st_blocks[self.st_block_index];
                    st.direction_bits = block.direction_bits;
                    for idx in 0..N_AXIS {
                        st.steps[idx] = block.steps[idx] << 1;
                    }
                    st.step_event_count = block.step_event_count << 1;

                    self.steps_remaining = block.step_event_count as f32;
                    self.step_per_mm = self.steps_remaining / block.millimeters;
                    self.req_mm_increment = REQ_MM_INCREMENT_SCALAR / self.step_per_mm;
                    self.dt_remainder = 0.0;

                    if self.execute_hold || self.decel_override {
                        // Block loaded mid-deceleration: carry the speed
                        // across the junction instead of the planned entry.
                        self.current_speed = self.exit_speed;
                        if let Some(current) = planner.current_block_mut() {
                            current.entry_speed_sqr = self.exit_speed * self.exit_speed;
                        }
                        self.decel_override = false;
                    } else {
                        self.current_speed = block.entry_speed_sqr.sqrt();
                    }

                    let st = &mut self.st_blocks[self.st_block_index];
                    st.is_pwm_rate_adjusted = false;
                    if self.settings.laser_power_correction
                        && block.condition & condition::SPINDLE_CCW != 0
                    {
                        self.inv_rate = 1.0 / block.programmed_rate;
                        st.is_pwm_rate_adjusted = true;
                    }
                }

                // Compute or recompute the velocity profile of the block.
                let Some(&block) = planner.current_block() else {
                    return;
                };
                let inv_2_accel = 0.5 / block.acceleration;
                self.mm_complete = 0.0;

                if self.execute_hold {
                    // Forced deceleration to zero, overriding the plan.
                    self.ramp = Ramp::Decel;
                    let decel_dist =
                        block.millimeters - inv_2_accel * block.entry_speed_sqr;
                    if decel_dist < 0.0 {
                        // The hold does not end inside this block.
                        self.exit_speed = (block.entry_speed_sqr
                            - 2.0 * block.acceleration * block.millimeters)
                            .max(0.0)
                            .sqrt();
                    } else {
                        self.mm_complete = decel_dist;
                        self.exit_speed = 0.0;
                    }
                } else {
                    self.ramp = Ramp::Accel;
                    self.accelerate_until = block.millimeters;

                    let exit_speed_sqr = planner.exec_block_exit_speed_sqr();
                    self.exit_speed = exit_speed_sqr.sqrt();

                    let nominal_speed = planner.compute_profile_nominal_speed(&block);
                    let nominal_speed_sqr = nominal_speed * nominal_speed;
                    let intersect_distance = 0.5
                        * (block.millimeters
                            + inv_2_accel * (block.entry_speed_sqr - exit_speed_sqr));

                    if block.entry_speed_sqr > nominal_speed_sqr {
                        // Entering faster than the block's nominal speed.
                        self.accelerate_until = block.millimeters
                            - inv_2_accel * (block.entry_speed_sqr - nominal_speed_sqr);
                        if self.accelerate_until <= 0.0 {
                            // Deceleration through the whole block.
                            self.ramp = Ramp::Decel;
                            self.exit_speed = (block.entry_speed_sqr
                                - 2.0 * block.acceleration * block.millimeters)
                                .max(0.0)
                                .sqrt();
                            self.decel_override = true;
                        } else {
                            // Decelerate to the nominal speed, then carry on
                            // with a normal profile.
                            self.decelerate_after =
                                inv_2_accel * (nominal_speed_sqr - exit_speed_sqr);
                            self.maximum_speed = nominal_speed;
                            self.ramp = Ramp::DecelOverride;
                        }
                    } else if intersect_distance > 0.0 {
                        if intersect_distance < block.millimeters {
                            // Trapezoid or triangle.
                            self.decelerate_after =
                                inv_2_accel * (nominal_speed_sqr - exit_speed_sqr);
                            if self.decelerate_after < intersect_distance {
                                self.maximum_speed = nominal_speed;
                                if block.entry_speed_sqr == nominal_speed_sqr {
                                    self.ramp = Ramp::Cruise;
                                } else {
                                    self.accelerate_until -= inv_2_accel
                                        * (nominal_speed_sqr - block.entry_speed_sqr);
                                }
                            } else {
                                self.accelerate_until = intersect_distance;
                                self.decelerate_after = intersect_distance;
                                self.maximum_speed = (2.0
                                    * block.acceleration
                                    * intersect_distance
                                    + exit_speed_sqr)
                                    .sqrt();
                            }
                        } else {
                            self.ramp = Ramp::Decel;
                        }
                    } else {
                        // Acceleration through the whole block.
                        self.accelerate_until = 0.0;
                        self.decelerate_after = 0.0;
                        self.maximum_speed = self.exit_speed;
                    }
                }

                self.update_pwm = true;
                self.block_active = true;
            }

            let Some(&block) = planner.current_block() else {
                return;
            };
            let is_pwm_rate_adjusted = self.st_blocks[self.st_block_index].is_pwm_rate_adjusted;

            // Advance through the ramp phases until the segment duration is
            // filled or the profile ends. Each phase contributes time and
            // distance analytically.
            let dt_segment = self.settings.dt_segment();
            let mut dt_max = dt_segment;
            let mut dt = 0.0f32;
            let mut time_var = dt_max;
            let mut mm_var: f32;
            let mut speed_var: f32;
            let mut mm_remaining = block.millimeters;
            let minimum_mm = (mm_remaining - self.req_mm_increment).max(0.0);

            loop {
                match self.ramp {
                    Ramp::DecelOverride => {
                        speed_var = block.acceleration * time_var;
                        if self.current_speed - self.maximum_speed <= speed_var {
                            // Ramp hits the nominal speed; hand off to cruise.
                            mm_remaining = self.accelerate_until;
                            time_var = 2.0 * (block.millimeters - mm_remaining)
                                / (self.current_speed + self.maximum_speed);
                            self.ramp = Ramp::Cruise;
                            self.current_speed = self.maximum_speed;
                        } else {
                            mm_remaining -= time_var * (self.current_speed - 0.5 * speed_var);
                            self.current_speed -= speed_var;
                        }
                    }
                    Ramp::Accel => {
                        speed_var = block.acceleration * time_var;
                        mm_remaining -= time_var * (self.current_speed + 0.5 * speed_var);
                        if mm_remaining < self.accelerate_until {
                            // End of the acceleration ramp.
                            mm_remaining = self.accelerate_until;
                            time_var = 2.0 * (block.millimeters - mm_remaining)
                                / (self.current_speed + self.maximum_speed);
                            self.ramp = if mm_remaining == self.decelerate_after {
                                Ramp::Decel
                            } else {
                                Ramp::Cruise
                            };
                            self.current_speed = self.maximum_speed;
                        } else {
                            self.current_speed += speed_var;
                        }
                    }
                    Ramp::Cruise => {
                        mm_var = mm_remaining - self.maximum_speed * time_var;
                        if mm_var < self.decelerate_after {
                            // End of the cruise phase.
                            time_var =
                                (mm_remaining - self.decelerate_after) / self.maximum_speed;
                            mm_remaining = self.decelerate_after;
                            self.ramp = Ramp::Decel;
                        } else {
                            mm_remaining = mm_var;
                        }
                    }
                    Ramp::Decel => {
                        speed_var = block.acceleration * time_var;
                        if self.current_speed > speed_var {
                            mm_var = mm_remaining
                                - time_var * (self.current_speed - 0.5 * speed_var);
                            if mm_var > self.mm_complete {
                                // Still inside the deceleration ramp.
                                mm_remaining = mm_var;
                                self.current_speed -= speed_var;
                            } else {
                                time_var = 2.0 * (mm_remaining - self.mm_complete)
                                    / (self.current_speed + self.exit_speed);
                                mm_remaining = self.mm_complete;
                                self.current_speed = self.exit_speed;
                            }
                        } else {
                            time_var = 2.0 * (mm_remaining - self.mm_complete)
                                / (self.current_speed + self.exit_speed);
                            mm_remaining = self.mm_complete;
                            self.current_speed = self.exit_speed;
                        }
                    }
                }

                dt += time_var;
                if dt < dt_max {
                    time_var = dt_max - dt;
                } else if mm_remaining > minimum_mm {
                    // Too slow for a step in the nominal duration: stretch
                    // the segment until it carries at least one.
                    dt_max += dt_segment;
                    time_var = dt_max - dt;
                } else {
                    break;
                }

                if mm_remaining <= self.mm_complete {
                    break;
                }
            }

            if is_pwm_rate_adjusted || self.update_pwm {
                if block.condition & (condition::SPINDLE_CW | condition::SPINDLE_CCW) != 0 {
                    let mut rpm = block.spindle_speed;
                    if is_pwm_rate_adjusted {
                        rpm *= self.current_speed * self.inv_rate;
                    }
                    self.current_pwm = self.compute_pwm(rpm);
                } else {
                    self.current_pwm = 0;
                }
                self.update_pwm = false;
            }

            // Quantize to whole steps. The fractional step left at the end
            // of the segment rides along as extra execution time on the
            // next one, keeping the long-run rate exact.
            let step_dist_remaining = self.step_per_mm * mm_remaining;
            let n_steps_remaining = step_dist_remaining.ceil();
            let last_n_steps_remaining = self.steps_remaining.ceil();
            let n_step = (last_n_steps_remaining - n_steps_remaining) as u16;

            if n_step == 0 && self.execute_hold {
                // Less than one step left to reach zero speed; close enough.
                self.end_motion = true;
                return;
            }

            dt += self.dt_remainder;
            let inv_rate = dt / (last_n_steps_remaining - step_dist_remaining);
            let cycles = (self.settings.step_frequency as f32 * 60.0 * inv_rate).ceil() as u32;

            self.segments[self.head] = Segment {
                n_step,
                cycles_per_tick: cycles,
                st_block_index: self.st_block_index as u8,
                spindle_pwm: self.current_pwm,
            };
            self.head = self.next_head;
            self.next_head = Self::next_index(self.next_head);

            trace!(n_step, cycles, mm_remaining, "segment");

            if let Some(current) = planner.current_block_mut() {
                current.millimeters = mm_remaining;
            }
            self.steps_remaining = n_steps_remaining;
            self.dt_remainder = (n_steps_remaining - step_dist_remaining) * inv_rate;

            if mm_remaining == self.mm_complete {
                if mm_remaining > 0.0 {
                    // Forced termination mid-block; hold position here.
                    self.end_motion = true;
                    return;
                }
                // Block complete: every step is in the segment ring.
                self.block_active = false;
                planner.discard_current_block();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::LineData;
    use crate::settings::Settings;

    fn setup() -> (Planner, SegmentGenerator, Arc<Settings>) {
        let settings = Arc::new(Settings::default());
        (
            Planner::new(settings.clone()),
            SegmentGenerator::new(settings.clone()),
            settings,
        )
    }

    fn feed(rate: f32) -> LineData {
        LineData {
            feed_rate: rate,
            ..LineData::default()
        }
    }

    /// Drain every segment for all queued blocks, returning them in order.
    fn drain_all(planner: &mut Planner, prep: &mut SegmentGenerator) -> Vec<Segment> {
        let mut out = Vec::new();
        loop {
            prep.prep_buffer(planner);
            if prep.is_empty() {
                break;
            }
            while let Some(segment) = prep.tail_segment() {
                out.push(segment);
                prep.advance_tail();
            }
        }
        out
    }

    #[test]
    fn segment_steps_sum_to_the_step_event_count() {
        let (mut planner, mut prep, settings) = setup();
        assert!(planner.buffer_line(&[10.0, 0.0, 0.0], &feed(600.0), &mut prep));
        let expected = (10.0 * settings.steps_per_mm[0]).round() as u32;

        let segments = drain_all(&mut planner, &mut prep);
        let total: u32 = segments.iter().map(|s| u32::from(s.n_step)).sum();
        assert_eq!(total, expected);
        assert!(planner.is_empty());
    }

    #[test]
    fn trapezoid_accelerates_cruises_and_decelerates() {
        let (mut planner, mut prep, _) = setup();
        // Long enough to reach the programmed rate and cruise.
        assert!(planner.buffer_line(&[50.0, 0.0, 0.0], &feed(1200.0), &mut prep));
        let segments = drain_all(&mut planner, &mut prep);
        assert!(segments.len() > 10);

        // cycles_per_tick is inversely proportional to speed: it must fall
        // during acceleration, flatten, then rise again.
        let first = segments.first().unwrap().cycles_per_tick;
        let min = segments.iter().map(|s| s.cycles_per_tick).min().unwrap();
        let last = segments.last().unwrap().cycles_per_tick;
        assert!(first > min, "first {first} min {min}");
        assert!(last > min, "last {last} min {min}");

        // Cruise ticks match the programmed rate: steps/min at 1200 mm/min.
        let settings = Settings::default();
        let steps_per_min = 1200.0 * settings.steps_per_mm[0];
        let expected_cycles = (settings.step_frequency as f32 * 60.0 / steps_per_min).ceil();
        assert!((min as f32 - expected_cycles).abs() <= 1.0);
    }

    #[test]
    fn short_move_never_reaches_nominal_speed() {
        let (mut planner, mut prep, settings) = setup();
        // 0.5 mm at 3000 mm/min cannot reach the programmed rate.
        assert!(planner.buffer_line(&[0.5, 0.0, 0.0], &feed(3000.0), &mut prep));
        let segments = drain_all(&mut planner, &mut prep);
        let total: u32 = segments.iter().map(|s| u32::from(s.n_step)).sum();
        assert_eq!(total, (0.5 * settings.steps_per_mm[0]).round() as u32);

        let settings = Settings::default();
        let cruise_cycles =
            (settings.step_frequency as f32 * 60.0 / (3000.0 * settings.steps_per_mm[0])).ceil()
                as u32;
        // Every segment must run slower than the programmed rate.
        for segment in &segments {
            assert!(segment.cycles_per_tick > cruise_cycles);
        }
    }

    #[test]
    fn slow_moves_stretch_segments_to_carry_a_step() {
        let (mut planner, mut prep, _) = setup();
        // Z moves are capped at 50 mm/min: far less than one step per
        // nominal segment duration.
        assert!(planner.buffer_line(&[0.0, 0.0, 1.0], &feed(50.0), &mut prep));
        prep.prep_buffer(&mut planner);
        let mut checked = 0;
        while let Some(segment) = prep.tail_segment() {
            assert!(segment.n_step >= 1);
            prep.advance_tail();
            checked += 1;
        }
        assert!(checked > 0);

        prep.reset();
        assert!(prep.is_empty());
    }

    #[test]
    fn multi_block_streams_are_generated_in_order() {
        let (mut planner, mut prep, settings) = setup();
        planner.buffer_line(&[10.0, 0.0, 0.0], &feed(600.0), &mut prep);
        planner.buffer_line(&[10.0, 10.0, 0.0], &feed(600.0), &mut prep);
        let segments = drain_all(&mut planner, &mut prep);

        // Two distinct st blocks, never interleaved.
        let mut indices: Vec<u8> = segments.iter().map(|s| s.st_block_index).collect();
        indices.dedup();
        assert_eq!(indices.len(), 2);

        let per_axis = (10.0 * settings.steps_per_mm[0]).round() as u32
            + (10.0 * settings.steps_per_mm[1]).round() as u32;
        let total: u32 = segments.iter().map(|s| u32::from(s.n_step)).sum();
        assert_eq!(total, per_axis);
    }

    #[test]
    fn hold_decelerates_to_zero_and_parks_generation() {
        let (mut planner, mut prep, _) = setup();
        assert!(planner.buffer_line(&[100.0, 0.0, 0.0], &feed(3000.0), &mut prep));

        // Let the move get up to speed first.
        prep.prep_buffer(&mut planner);
        for _ in 0..64 {
            prep.advance_tail();
        }

        prep.execute_hold(&mut planner);
        loop {
            prep.prep_buffer(&mut planner);
            if prep.motion_ended() {
                break;
            }
            while prep.tail_segment().is_some() {
                prep.advance_tail();
            }
            assert!(!planner.is_empty(), "hold must not run off the block");
        }

        // The block was not completed and remains at the planner tail.
        let remaining = planner.current_block().unwrap().millimeters;
        assert!(remaining > 0.0);
        assert!(prep.motion_ended());
    }

    #[test]
    fn released_hold_finishes_the_block_with_exact_steps() {
        let (mut planner, mut prep, settings) = setup();
        assert!(planner.buffer_line(&[20.0, 0.0, 0.0], &feed(3000.0), &mut prep));
        let expected = (20.0 * settings.steps_per_mm[0]).round() as u32;

        fn drain(prep: &mut SegmentGenerator, total: &mut u32) {
            while let Some(segment) = prep.tail_segment() {
                *total += u32::from(segment.n_step);
                prep.advance_tail();
            }
        }

        let mut total: u32 = 0;

        // Get up to speed, then force a deceleration to rest.
        prep.prep_buffer(&mut planner);
        prep.execute_hold(&mut planner);
        while !prep.motion_ended() {
            prep.prep_buffer(&mut planner);
            drain(&mut prep, &mut total);
        }
        drain(&mut prep, &mut total);
        assert!(total < expected, "hold ran the block to completion");

        // Resume: the rest of the block executes from rest.
        prep.release_hold(&mut planner);
        loop {
            prep.prep_buffer(&mut planner);
            if prep.is_empty() {
                break;
            }
            drain(&mut prep, &mut total);
        }
        assert_eq!(total, expected);
        assert!(planner.is_empty());
    }

    #[test]
    fn laser_pwm_follows_speed_in_m4_mode() {
        let (mut planner, mut prep, settings) = setup();
        let data = LineData {
            feed_rate: 1200.0,
            spindle_speed: settings.laser_s_max,
            condition: condition::SPINDLE_CCW,
        };
        assert!(planner.buffer_line(&[50.0, 0.0, 0.0], &data, &mut prep));
        let segments = drain_all(&mut planner, &mut prep);

        let max_pwm = segments.iter().map(|s| s.spindle_pwm).max().unwrap();
        let first_pwm = segments.first().unwrap().spindle_pwm;
        let last_pwm = segments.last().unwrap().spindle_pwm;
        // Power scales with speed: low while ramping, full at cruise.
        assert_eq!(max_pwm, 127);
        assert!(first_pwm < max_pwm);
        assert!(last_pwm < max_pwm);
    }

    #[test]
    fn constant_power_mode_holds_the_programmed_pwm() {
        let (mut planner, mut prep, settings) = setup();
        let data = LineData {
            feed_rate: 1200.0,
            spindle_speed: settings.laser_s_max / 2.0,
            condition: condition::SPINDLE_CW,
        };
        assert!(planner.buffer_line(&[20.0, 0.0, 0.0], &data, &mut prep));
        let segments = drain_all(&mut planner, &mut prep);
        for segment in &segments {
            assert_eq!(segment.spindle_pwm, 64);
        }
    }
}
