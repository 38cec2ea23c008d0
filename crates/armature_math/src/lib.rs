//! Screw-theoretic spatial algebra and the dense factorizations used by the
//! Armature multibody solvers.
//!
//! All spatial 6-vectors are ordered with the angular part first: a twist is
//! `(ω; v)` and a wrench is `(m; f)`, both taken about the origin of the frame
//! they are expressed in.

pub mod euler;
pub mod factorize;
pub mod screw;

pub use euler::EulerOrder;
pub use factorize::{FactorizeError, Llt, PivotedQr};

use nalgebra::{Isometry3, Matrix6, Point3, UnitQuaternion, Vector6};

/// Floating point type used for dynamics computations.
#[allow(non_camel_case_types)]
pub type fph = f64;

/// A rigid-body pose (rotation and translation).
pub type Pose = Isometry3<fph>;

/// A position in 3D space.
pub type Position = Point3<fph>;

/// An orientation in 3D space.
pub type Orientation = UnitQuaternion<fph>;

/// A spatial velocity `(ω; v)` about the origin of its frame.
pub type Twist = Vector6<fph>;

/// A spatial force `(m; f)` about the origin of its frame.
pub type Wrench = Vector6<fph>;

/// A 6×6 spatial matrix (adjoint, inertia or constraint block).
pub type SpatialMatrix = Matrix6<fph>;

/// Shifts `angle` by whole turns so that it lands within half a turn of
/// `center`.
pub fn put_into_period(angle: fph, center: fph) -> fph {
    use std::f64::consts::TAU;
    angle + TAU * ((center - angle) / TAU).round()
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::{PI, TAU};

    #[test]
    fn should_keep_angle_already_in_period() {
        assert_abs_diff_eq!(put_into_period(0.3, 0.0), 0.3);
    }

    #[test]
    fn should_shift_angle_by_whole_turns() {
        assert_abs_diff_eq!(put_into_period(0.3 + TAU, 0.0), 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(put_into_period(0.3 - 3.0 * TAU, 0.0), 0.3, epsilon = 1e-12);
    }

    #[test]
    fn should_pick_representative_nearest_to_center() {
        assert_abs_diff_eq!(put_into_period(-PI + 0.1, PI), PI + 0.1, epsilon = 1e-12);
    }
}
