//! Machine settings shared by the parser, planner, and step generation.
//!
//! Values are held in machine units: millimeters, mm/min, and mm/min^2. The
//! defaults describe the stock gantry (0.15 mm full steps on X/Y, a
//! 0.70612 mm leadscrew pitch on Z, 16 microsteps everywhere) and are
//! overridden by the host's configuration file.

use crate::axis::N_AXIS;

/// Step pulse output frequency of the pulse engine in Hz.
pub const DEFAULT_STEP_FREQUENCY: u32 = 40_000;

/// Segment sampling rate for the trapezoidal profile generator.
pub const DEFAULT_ACCELERATION_TICKS_PER_SECOND: u32 = 1000;

const X_MM_PER_FULL_STEP: f32 = 0.15;
const Y_MM_PER_FULL_STEP: f32 = 0.15;
const Z_MM_PER_FULL_STEP: f32 = 0.70612;
const MICROSTEPS: f32 = 16.0;

/// Immutable machine configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Steps per millimeter of travel, per axis.
    pub steps_per_mm: [f32; N_AXIS],
    /// Maximum rate per axis in mm/min.
    pub max_rate: [f32; N_AXIS],
    /// Maximum acceleration per axis in mm/min^2.
    pub acceleration: [f32; N_AXIS],
    /// Usable travel per axis in mm.
    pub max_travel: [f32; N_AXIS],
    /// Cornering aggressiveness for the junction speed limit, in mm.
    pub junction_deviation: f32,
    /// Maximum chordal deviation when decomposing arcs, in mm.
    pub arc_tolerance: f32,
    /// Floor for planned feed rates in mm/min.
    pub minimum_feed_rate: f32,
    /// Step pulse output frequency in Hz.
    pub step_frequency: u32,
    /// Velocity profile sampling rate in segments per second.
    pub acceleration_ticks_per_second: u32,
    /// Scale laser power with instantaneous speed in M4 mode.
    pub laser_power_correction: bool,
    /// S word value that maps to full laser power.
    pub laser_s_max: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            steps_per_mm: [
                (1.0 / X_MM_PER_FULL_STEP) * MICROSTEPS,
                (1.0 / Y_MM_PER_FULL_STEP) * MICROSTEPS,
                (1.0 / Z_MM_PER_FULL_STEP) * MICROSTEPS,
            ],
            max_rate: [5000.0, 5000.0, 50.0],
            acceleration: [200.0 * 60.0 * 60.0; N_AXIS],
            max_travel: [-495.3, 279.4, -12.0],
            junction_deviation: 0.01,
            arc_tolerance: 0.002,
            minimum_feed_rate: 1.0,
            step_frequency: DEFAULT_STEP_FREQUENCY,
            acceleration_ticks_per_second: DEFAULT_ACCELERATION_TICKS_PER_SECOND,
            laser_power_correction: true,
            laser_s_max: 1000.0,
        }
    }
}

impl Settings {
    /// Nominal segment duration in minutes.
    pub fn dt_segment(&self) -> f32 {
        1.0 / (self.acceleration_ticks_per_second as f32 * 60.0)
    }

    /// Convert a step count on one axis to millimeters.
    pub fn steps_to_mm(&self, steps: i32, axis: usize) -> f32 {
        steps as f32 / self.steps_per_mm[axis]
    }

    /// Convert a step count array to a millimeter position.
    pub fn steps_to_mpos(&self, steps: &[i32; N_AXIS]) -> [f32; N_AXIS] {
        let mut mpos = [0.0; N_AXIS];
        for (idx, pos) in mpos.iter_mut().enumerate() {
            *pos = self.steps_to_mm(steps[idx], idx);
        }
        mpos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_to_mm_round_trips_integral_positions() {
        let settings = Settings::default();
        for steps in [0i32, 1, -1, 1067, -20000, 123456] {
            for axis in 0..N_AXIS {
                let mm = settings.steps_to_mm(steps, axis);
                let back = (mm * settings.steps_per_mm[axis]).round() as i32;
                assert_eq!(back, steps, "axis {axis} steps {steps}");
            }
        }
    }
}
