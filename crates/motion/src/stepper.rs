//! Step byte execution.
//!
//! Replays prepared segments as a stream of output bytes for the pulse
//! engine: one byte per tick, either a spacer (`0x00`) or a step byte
//! carrying the step, direction, and laser bits. Laser power changes are
//! inserted into the stream as power-set opcode bytes.
//!
//! The ticker never holds references into the segment ring. The caller
//! copies the segment and its [`StBlock`] out under its lock and hands them
//! in by value, so emission runs without contending with segment prep.

use std::sync::atomic::{AtomicI32, Ordering};

use thiserror::Error;

use crate::axis::{Axis, LASER_ON_BIT, LASER_PWR_BIT, LASER_PWR_MASK, N_AXIS};
use crate::segment::{Segment, StBlock};

/// Failure writing to the pulse device.
#[derive(Debug, Error)]
pub enum PulseError {
    #[error("pulse device write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte-oriented sink for the step stream.
pub trait PulseSink {
    fn write_byte(&mut self, byte: u8) -> Result<(), PulseError>;

    fn flush(&mut self) -> Result<(), PulseError> {
        Ok(())
    }
}

/// Capture sink for tests and offline step-stream inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub bytes: Vec<u8>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-axis signed step totals recovered from the captured stream.
    pub fn decode_steps(&self) -> [i64; N_AXIS] {
        let mut totals = [0i64; N_AXIS];
        for &byte in &self.bytes {
            if byte & LASER_PWR_BIT != 0 {
                continue; // power-set opcode
            }
            for axis in Axis::ALL {
                if byte & axis.step_bit() != 0 {
                    if byte & axis.dir_bit() != 0 {
                        totals[axis.index()] -= 1;
                    } else {
                        totals[axis.index()] += 1;
                    }
                }
            }
        }
        totals
    }
}

impl PulseSink for MemorySink {
    fn write_byte(&mut self, byte: u8) -> Result<(), PulseError> {
        self.bytes.push(byte);
        Ok(())
    }
}

/// Machine position in steps, written by the step executor and read by
/// status reporting. Per-axis atomic access is sufficient; readers only
/// need a coherent per-axis value, not a consistent triple.
#[derive(Debug, Default)]
pub struct SysPosition {
    axes: [AtomicI32; N_AXIS],
}

impl SysPosition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, axis: Axis) -> i32 {
        self.axes[axis.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> [i32; N_AXIS] {
        let mut out = [0; N_AXIS];
        for axis in Axis::ALL {
            out[axis.index()] = self.get(axis);
        }
        out
    }

    fn step(&self, axis: Axis, negative: bool) {
        let delta = if negative { -1 } else { 1 };
        self.axes[axis.index()].fetch_add(delta, Ordering::Relaxed);
    }
}

/// Outcome of replaying one segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentRun {
    /// Bytes written to the sink, spacers and opcodes included.
    pub bytes: u64,
    /// Step events actually emitted. Less than the segment's count only
    /// when the abort poll cut the segment short.
    pub steps: u16,
}

/// Executes segments with the Bresenham line algorithm.
pub struct StepTicker {
    counter: [u32; N_AXIS],
    exec_block: StBlock,
    exec_block_index: Option<u8>,
    last_pwm: Option<u8>,
}

impl StepTicker {
    pub fn new() -> Self {
        Self {
            counter: [0; N_AXIS],
            exec_block: StBlock::default(),
            exec_block_index: None,
            last_pwm: None,
        }
    }

    pub fn reset(&mut self) {
        self.counter = [0; N_AXIS];
        self.exec_block_index = None;
        self.last_pwm = None;
    }

    /// Emit every tick of one segment into `sink`, updating `position` as
    /// steps are taken.
    ///
    /// `abort` is polled between step events; when it returns true the
    /// segment is cut short after the byte in flight, and the returned
    /// step count tells the caller how far it got. The Bresenham counters
    /// stay where they are, so re-running the rest of the segment later
    /// continues the line exactly.
    pub fn run_segment(
        &mut self,
        segment: &Segment,
        block: &StBlock,
        sink: &mut dyn PulseSink,
        position: &SysPosition,
        abort: &mut dyn FnMut() -> bool,
    ) -> Result<SegmentRun, PulseError> {
        // A new block index means new Bresenham data: reload the counters.
        if self.exec_block_index != Some(segment.st_block_index) {
            self.exec_block_index = Some(segment.st_block_index);
            self.exec_block = *block;
            let seed = self.exec_block.step_event_count >> 1;
            self.counter = [seed; N_AXIS];
        }

        let mut run = SegmentRun { bytes: 0, steps: 0 };

        if self.last_pwm != Some(segment.spindle_pwm) {
            self.last_pwm = Some(segment.spindle_pwm);
            sink.write_byte(LASER_PWR_BIT | (segment.spindle_pwm & LASER_PWR_MASK))?;
            run.bytes += 1;
        }

        let laser_on = segment.spindle_pwm > 0;

        for _ in 0..segment.n_step {
            if abort() {
                break;
            }

            // Spacer bytes pace the step to the segment's tick period.
            for _ in 1..segment.cycles_per_tick {
                sink.write_byte(0x00)?;
                run.bytes += 1;
            }

            let mut step_bits = 0u8;
            for axis in Axis::ALL {
                let idx = axis.index();
                self.counter[idx] += self.exec_block.steps[idx];
                if self.counter[idx] > self.exec_block.step_event_count {
                    step_bits |= axis.step_bit();
                    self.counter[idx] -= self.exec_block.step_event_count;
                    position.step(axis, self.exec_block.direction_bits & axis.dir_bit() != 0);
                }
            }

            let mut byte = step_bits | self.exec_block.direction_bits;
            if laser_on {
                byte |= LASER_ON_BIT;
            }
            sink.write_byte(byte)?;
            run.bytes += 1;
            run.steps += 1;
        }

        Ok(run)
    }
}

impl Default for StepTicker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never() -> impl FnMut() -> bool {
        || false
    }

    fn block(steps: [u32; N_AXIS], direction_bits: u8) -> StBlock {
        let event_count = steps.iter().copied().max().unwrap();
        StBlock {
            steps: [steps[0] << 1, steps[1] << 1, steps[2] << 1],
            step_event_count: event_count << 1,
            direction_bits,
            is_pwm_rate_adjusted: false,
        }
    }

    fn segment(n_step: u16, cycles_per_tick: u32) -> Segment {
        Segment {
            n_step,
            cycles_per_tick,
            st_block_index: 0,
            spindle_pwm: 0,
        }
    }

    #[test]
    fn bresenham_emits_exact_per_axis_counts() {
        let block = block([10, 3, 0], 0);
        let seg = segment(10, 1);
        let mut sink = MemorySink::new();
        let position = SysPosition::new();
        let mut ticker = StepTicker::new();
        let mut abort = never();

        ticker
            .run_segment(&seg, &block, &mut sink, &position, &mut abort)
            .unwrap();

        let totals = sink.decode_steps();
        assert_eq!(totals, [10, 3, 0]);
        assert_eq!(position.get(Axis::X), 10);
        assert_eq!(position.get(Axis::Y), 3);
    }

    #[test]
    fn bresenham_interleaves_minor_axis_evenly() {
        let block = block([8, 2, 0], 0);
        let seg = segment(8, 1);
        let mut sink = MemorySink::new();
        let position = SysPosition::new();
        let mut ticker = StepTicker::new();
        let mut abort = never();
        ticker
            .run_segment(&seg, &block, &mut sink, &position, &mut abort)
            .unwrap();

        // For each prefix of k X steps the line property requires the Y
        // count to track k*b/a within one step.
        let mut x = 0i64;
        let mut y = 0i64;
        for &byte in &sink.bytes {
            if byte & LASER_PWR_BIT != 0 {
                continue;
            }
            if byte & Axis::X.step_bit() != 0 {
                x += 1;
            }
            if byte & Axis::Y.step_bit() != 0 {
                y += 1;
            }
            assert!((x * 2 - y * 8).abs() <= 8, "x={x} y={y}");
        }
    }

    #[test]
    fn direction_bits_move_the_position_backwards() {
        let dirs = Axis::X.dir_bit() | Axis::Z.dir_bit();
        let block = block([5, 0, 5], dirs);
        let seg = segment(5, 1);
        let mut sink = MemorySink::new();
        let position = SysPosition::new();
        let mut ticker = StepTicker::new();
        let mut abort = never();
        ticker
            .run_segment(&seg, &block, &mut sink, &position, &mut abort)
            .unwrap();
        assert_eq!(position.snapshot(), [-5, 0, -5]);
    }

    #[test]
    fn spacer_bytes_pace_the_step_rate() {
        let block = block([4, 0, 0], 0);
        let seg = segment(4, 5);
        let mut sink = MemorySink::new();
        let position = SysPosition::new();
        let mut ticker = StepTicker::new();
        let mut abort = never();
        ticker
            .run_segment(&seg, &block, &mut sink, &position, &mut abort)
            .unwrap();

        // One power byte, then 4 steps of 5 ticks each.
        assert_eq!(sink.bytes.len(), 1 + 4 * 5);
        let spacers = sink.bytes.iter().filter(|&&b| b == 0).count();
        assert_eq!(spacers, 4 * 4);
    }

    #[test]
    fn power_opcode_emitted_only_on_change() {
        let block = block([2, 0, 0], 0);
        let mut seg = segment(1, 1);
        seg.spindle_pwm = 64;
        let mut sink = MemorySink::new();
        let position = SysPosition::new();
        let mut ticker = StepTicker::new();
        let mut abort = never();

        ticker
            .run_segment(&seg, &block, &mut sink, &position, &mut abort)
            .unwrap();
        ticker
            .run_segment(&seg, &block, &mut sink, &position, &mut abort)
            .unwrap();

        let power_bytes: Vec<u8> = sink
            .bytes
            .iter()
            .copied()
            .filter(|b| b & LASER_PWR_BIT != 0)
            .collect();
        assert_eq!(power_bytes, vec![LASER_PWR_BIT | 64]);

        // Step bytes carry the laser-on bit while power is nonzero.
        let step_bytes: Vec<u8> = sink
            .bytes
            .iter()
            .copied()
            .filter(|b| b & LASER_PWR_BIT == 0)
            .collect();
        for byte in step_bytes {
            assert_ne!(byte & LASER_ON_BIT, 0);
        }
    }

    #[test]
    fn aborted_segment_resumes_without_double_stepping() {
        let block = block([100, 37, 0], 0);
        let seg = segment(100, 1);
        let mut sink = MemorySink::new();
        let position = SysPosition::new();
        let mut ticker = StepTicker::new();

        let mut remaining = 10;
        let mut abort = move || {
            remaining -= 1;
            remaining <= 0
        };
        let run = ticker
            .run_segment(&seg, &block, &mut sink, &position, &mut abort)
            .unwrap();
        assert!(run.steps < 100);

        // Re-run the remainder; the counters pick up where they stopped.
        let mut rest = seg;
        rest.n_step = seg.n_step - run.steps;
        let mut never = || false;
        let resumed = ticker
            .run_segment(&rest, &block, &mut sink, &position, &mut never)
            .unwrap();
        assert_eq!(run.steps + resumed.steps, 100);
        assert_eq!(sink.decode_steps(), [100, 37, 0]);
        assert_eq!(position.snapshot(), [100, 37, 0]);
    }

    #[test]
    fn reset_reseeds_the_counters_for_a_fresh_stream() {
        let block = block([10, 3, 0], 0);
        let seg = segment(10, 1);
        let position = SysPosition::new();
        let mut ticker = StepTicker::new();
        let mut abort = never();

        let mut first = MemorySink::new();
        ticker
            .run_segment(&seg, &block, &mut first, &position, &mut abort)
            .unwrap();

        ticker.reset();
        let mut second = MemorySink::new();
        ticker
            .run_segment(&seg, &block, &mut second, &position, &mut abort)
            .unwrap();
        // Identical byte streams, including the initial power opcode.
        assert_eq!(first.bytes, second.bytes);
    }
}
