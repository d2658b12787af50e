//! Arc decomposition.
//!
//! G2/G3 arcs are approximated by a fan of chords whose endpoints lie on
//! the true arc; the chord count is chosen so the sag never exceeds the
//! configured tolerance. Chord positions come from repeated small-angle
//! rotation of the radius vector, with an exact sin/cos evaluation every
//! [`N_ARC_CORRECTION`] chords to cap the accumulated drift.

use crate::axis::{Axis, N_AXIS};
use crate::math::{ARC_ANGULAR_TRAVEL_EPSILON, N_ARC_CORRECTION};

/// Iterator over the chord endpoints of one arc, ending exactly on the
/// commanded target.
pub struct ArcTrace {
    target: [f32; N_AXIS],
    position: [f32; N_AXIS],
    axis_0: usize,
    axis_1: usize,
    axis_linear: usize,

    center_0: f32,
    center_1: f32,
    r_axis0: f32,
    r_axis1: f32,
    offset_0: f32,
    offset_1: f32,
    theta_per_segment: f32,
    linear_per_segment: f32,

    segments: u16,
    index: u16,
    correction_count: u16,
    done: bool,
}

impl ArcTrace {
    /// Plan an arc from `position` to `target`.
    ///
    /// `offset` is the signed center offset from the current position in
    /// the active plane and `radius` its magnitude; both have already been
    /// validated by the parser. A target equal to the position produces a
    /// full circle.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        position: &[f32; N_AXIS],
        target: &[f32; N_AXIS],
        offset: &[f32; N_AXIS],
        radius: f32,
        axis_0: Axis,
        axis_1: Axis,
        axis_linear: Axis,
        is_clockwise: bool,
        arc_tolerance: f32,
    ) -> Self {
        let (a0, a1, al) = (axis_0.index(), axis_1.index(), axis_linear.index());

        let center_0 = position[a0] + offset[a0];
        let center_1 = position[a1] + offset[a1];
        // Radius vector from the center to the current location.
        let r_axis0 = -offset[a0];
        let r_axis1 = -offset[a1];
        let rt_axis0 = target[a0] - center_0;
        let rt_axis1 = target[a1] - center_1;

        // CCW angle between position and target from the circle center.
        let mut angular_travel = (r_axis0 * rt_axis1 - r_axis1 * rt_axis0)
            .atan2(r_axis0 * rt_axis0 + r_axis1 * rt_axis1);
        if is_clockwise {
            if angular_travel >= -ARC_ANGULAR_TRAVEL_EPSILON {
                angular_travel -= 2.0 * std::f32::consts::PI;
            }
        } else if angular_travel <= ARC_ANGULAR_TRAVEL_EPSILON {
            angular_travel += 2.0 * std::f32::consts::PI;
        }

        // Chord endpoints sit on the arc, so the sag per chord is bounded
        // by the tolerance for this count.
        let segments = ((0.5 * angular_travel * radius).abs()
            / (arc_tolerance * (2.0 * radius - arc_tolerance)).sqrt())
        .floor() as u16;

        let (theta_per_segment, linear_per_segment) = if segments > 0 {
            (
                angular_travel / segments as f32,
                (target[al] - position[al]) / segments as f32,
            )
        } else {
            (0.0, 0.0)
        };

        Self {
            target: *target,
            position: *position,
            axis_0: a0,
            axis_1: a1,
            axis_linear: al,
            center_0,
            center_1,
            r_axis0,
            r_axis1,
            offset_0: offset[a0],
            offset_1: offset[a1],
            theta_per_segment,
            linear_per_segment,
            segments,
            index: 1,
            correction_count: 0,
            done: false,
        }
    }

    /// Number of chords the sag bound asks for. Zero means the arc
    /// degenerates to a single line to the target.
    pub fn chord_count(&self) -> u16 {
        self.segments
    }
}

impl Iterator for ArcTrace {
    type Item = [f32; N_AXIS];

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.index >= self.segments.max(1) {
            // Land exactly on the commanded target.
            self.done = true;
            return Some(self.target);
        }

        if self.correction_count < N_ARC_CORRECTION {
            // Second-order small-angle rotation of the radius vector.
            let theta = self.theta_per_segment;
            let mut cos_t = 2.0 - theta * theta;
            let sin_t = theta * 0.166_666_67 * (cos_t + 4.0);
            cos_t *= 0.5;

            let r_axisi = self.r_axis0 * sin_t + self.r_axis1 * cos_t;
            self.r_axis0 = self.r_axis0 * cos_t - self.r_axis1 * sin_t;
            self.r_axis1 = r_axisi;
            self.correction_count += 1;
        } else {
            // Periodic exact evaluation from the initial radius vector to
            // cancel the approximation drift.
            let angle = self.index as f32 * self.theta_per_segment;
            let cos_ti = angle.cos();
            let sin_ti = angle.sin();
            self.r_axis0 = -self.offset_0 * cos_ti + self.offset_1 * sin_ti;
            self.r_axis1 = -self.offset_0 * sin_ti - self.offset_1 * cos_ti;
            self.correction_count = 0;
        }

        self.position[self.axis_0] = self.center_0 + self.r_axis0;
        self.position[self.axis_1] = self.center_1 + self.r_axis1;
        self.position[self.axis_linear] += self.linear_per_segment;
        self.index += 1;

        Some(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f32 = 0.002;

    fn trace(
        position: [f32; N_AXIS],
        target: [f32; N_AXIS],
        offset: [f32; N_AXIS],
        radius: f32,
        clockwise: bool,
    ) -> ArcTrace {
        ArcTrace::new(
            &position, &target, &offset, radius, Axis::X, Axis::Y, Axis::Z, clockwise, TOL,
        )
    }

    #[test]
    fn quarter_arc_ends_on_target() {
        // CCW quarter circle of radius 10 around the origin.
        let points: Vec<_> =
            trace([10.0, 0.0, 0.0], [0.0, 10.0, 0.0], [-10.0, 0.0, 0.0], 10.0, false).collect();
        let last = points.last().unwrap();
        assert!((last[0] - 0.0).abs() < 1e-6);
        assert!((last[1] - 10.0).abs() < 1e-6);
        // Every chord endpoint stays on the circle within drift bounds.
        for point in &points {
            let r = (point[0] * point[0] + point[1] * point[1]).sqrt();
            assert!((r - 10.0).abs() < 1e-3, "r = {r}");
        }
    }

    #[test]
    fn full_circle_when_target_equals_position() {
        // Center 5 mm to the left of the start: a full CW circle of r = 5.
        let start = [10.0, 0.0, 0.0];
        let arc = trace(start, start, [-5.0, 0.0, 0.0], 5.0, true);
        let expected = ((std::f32::consts::PI * 5.0)
            / (TOL * (10.0 - TOL)).sqrt())
        .floor() as u16;
        assert_eq!(arc.chord_count(), expected);

        let points: Vec<_> = arc.collect();
        assert_eq!(points.len(), usize::from(expected));
        let last = points.last().unwrap();
        assert!((last[0] - 10.0).abs() < 1e-6);
        assert!(last[1].abs() < 1e-6);

        // The trace must actually sweep the far side of the circle.
        let min_x = points.iter().map(|p| p[0]).fold(f32::MAX, f32::min);
        assert!(min_x < 0.1, "min_x = {min_x}");
        for point in &points {
            let r = ((point[0] - 5.0).powi(2) + point[1].powi(2)).sqrt();
            assert!((r - 5.0).abs() < 5e-3, "r = {r}");
        }
    }

    #[test]
    fn tiny_arc_degenerates_to_one_line() {
        let arc = trace(
            [0.0, 0.0, 0.0],
            [0.005, 0.005, 0.0],
            [0.0, 0.005, 0.0],
            0.005,
            false,
        );
        assert_eq!(arc.chord_count(), 0);
        let points: Vec<_> = arc.collect();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0], [0.005, 0.005, 0.0]);
    }

    #[test]
    fn helical_arcs_spread_linear_travel_evenly() {
        let points: Vec<_> = trace(
            [10.0, 0.0, 0.0],
            [0.0, 10.0, 5.0],
            [-10.0, 0.0, 0.0],
            10.0,
            false,
        )
        .collect();
        let n = points.len() as f32;
        for (i, point) in points.iter().enumerate() {
            if i + 1 < points.len() {
                let expected_z = 5.0 * (i + 1) as f32 / n;
                assert!((point[2] - expected_z).abs() < 0.05);
            }
        }
        assert!((points.last().unwrap()[2] - 5.0).abs() < 1e-6);
    }

    #[test]
    fn clockwise_and_counterclockwise_sweep_opposite_sides() {
        // Half circle from (10,0) to (-10,0) around the origin.
        let cw: Vec<_> =
            trace([10.0, 0.0, 0.0], [-10.0, 0.0, 0.0], [-10.0, 0.0, 0.0], 10.0, true).collect();
        let ccw: Vec<_> =
            trace([10.0, 0.0, 0.0], [-10.0, 0.0, 0.0], [-10.0, 0.0, 0.0], 10.0, false).collect();
        // CW passes under the X axis, CCW over it.
        assert!(cw.iter().take(cw.len() - 1).all(|p| p[1] <= 1e-3));
        assert!(ccw.iter().take(ccw.len() - 1).all(|p| p[1] >= -1e-3));
    }
}
