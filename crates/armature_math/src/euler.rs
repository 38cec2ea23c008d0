//! Conversions between pose representations: homogeneous matrices, Euler
//! angles, unit quaternions and rotation vectors.

use crate::{Orientation, Pose, fph};
use nalgebra::{Matrix4, Rotation3, Translation3, Unit, UnitQuaternion, Vector3};

/// An Euler-angle convention, written as three axis digits over `{1,2,3}`
/// ("313", "321", ...).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EulerOrder {
    axes: [usize; 3],
}

impl EulerOrder {
    /// The "313" (z-x-z) convention.
    pub const ZXZ: Self = Self { axes: [2, 0, 2] };
    /// The "321" (z-y-x) convention.
    pub const ZYX: Self = Self { axes: [2, 1, 0] };
    /// The "123" (x-y-z) convention.
    pub const XYZ: Self = Self { axes: [0, 1, 2] };

    /// Parses a three-digit convention string.
    ///
    /// # Panics
    /// If the string is not three digits over `{1,2,3}`, or two adjacent
    /// digits coincide.
    pub fn parse(order: &str) -> Self {
        let mut axes = [0; 3];
        let bytes = order.as_bytes();
        assert!(
            bytes.len() == 3,
            "invalid Euler order {order:?}: expected three digits"
        );
        for (axis, &byte) in axes.iter_mut().zip(bytes) {
            assert!(
                (b'1'..=b'3').contains(&byte),
                "invalid Euler order {order:?}: digits must be 1, 2 or 3"
            );
            *axis = usize::from(byte - b'1');
        }
        assert!(
            axes[0] != axes[1] && axes[1] != axes[2],
            "invalid Euler order {order:?}: adjacent axes must differ"
        );
        Self { axes }
    }

    /// The three rotation axes as indices into `{0, 1, 2}`.
    pub fn axes(&self) -> [usize; 3] {
        self.axes
    }

    /// Whether this is a proper Euler convention (first and last axis equal).
    pub fn is_proper(&self) -> bool {
        self.axes[0] == self.axes[2]
    }
}

fn basis_axis(axis: usize) -> Unit<Vector3<fph>> {
    match axis {
        0 => Vector3::x_axis(),
        1 => Vector3::y_axis(),
        _ => Vector3::z_axis(),
    }
}

fn permutation_sign(i: usize, j: usize, k: usize) -> fph {
    if (i, j, k) == (0, 1, 2) || (i, j, k) == (1, 2, 0) || (i, j, k) == (2, 0, 1) {
        1.0
    } else {
        -1.0
    }
}

/// Composes the rotation described by three Euler angles in the given
/// convention.
pub fn euler_to_rotation(angles: &[fph; 3], order: EulerOrder) -> Orientation {
    let [a, b, c] = order.axes();
    UnitQuaternion::from_axis_angle(&basis_axis(a), angles[0])
        * UnitQuaternion::from_axis_angle(&basis_axis(b), angles[1])
        * UnitQuaternion::from_axis_angle(&basis_axis(c), angles[2])
}

/// Extracts the Euler angles of the given convention from a rotation.
///
/// At the convention's singular configurations (second angle 0 or π for
/// proper conventions, ±π/2 for Tait-Bryan ones) the third angle is fixed to
/// zero and the first absorbs the remaining rotation.
pub fn rotation_to_euler(rotation: &Orientation, order: EulerOrder) -> [fph; 3] {
    const SINGULAR_TOLERANCE: fph = 1e-12;

    let r = rotation.to_rotation_matrix();
    let r = r.matrix();
    let [a, b, c] = order.axes();

    if order.is_proper() {
        let d = 3 - a - b;
        let eps = permutation_sign(a, b, d);
        let beta = r[(a, a)].clamp(-1.0, 1.0).acos();
        if beta.sin().abs() < SINGULAR_TOLERANCE {
            let alpha = fph::atan2(eps * r[(d, b)], r[(b, b)]);
            [alpha, beta, 0.0]
        } else {
            let alpha = fph::atan2(r[(b, a)], -eps * r[(d, a)]);
            let gamma = fph::atan2(r[(a, b)], eps * r[(a, d)]);
            [alpha, beta, gamma]
        }
    } else {
        let eps = permutation_sign(a, b, c);
        let sin_beta = (eps * r[(a, c)]).clamp(-1.0, 1.0);
        let beta = sin_beta.asin();
        if 1.0 - sin_beta.abs() < SINGULAR_TOLERANCE {
            let alpha = fph::atan2(eps * r[(c, b)], r[(b, b)]);
            [alpha, beta, 0.0]
        } else {
            let alpha = fph::atan2(-eps * r[(b, c)], r[(c, c)]);
            let gamma = fph::atan2(-eps * r[(a, b)], r[(a, a)]);
            [alpha, beta, gamma]
        }
    }
}

/// Builds a pose from `[x, y, z, α, β, γ]` with Euler angles of the given
/// convention.
pub fn pe_to_pose(pe: &[fph; 6], order: EulerOrder) -> Pose {
    let translation = Translation3::new(pe[0], pe[1], pe[2]);
    let rotation = euler_to_rotation(&[pe[3], pe[4], pe[5]], order);
    Pose::from_parts(translation, rotation)
}

/// Expresses a pose as `[x, y, z, α, β, γ]` with Euler angles of the given
/// convention.
pub fn pose_to_pe(pose: &Pose, order: EulerOrder) -> [fph; 6] {
    let t = pose.translation.vector;
    let [alpha, beta, gamma] = rotation_to_euler(&pose.rotation, order);
    [t.x, t.y, t.z, alpha, beta, gamma]
}

/// Builds a pose from `[x, y, z, qx, qy, qz, qw]`. The quaternion is
/// renormalized.
pub fn pq_to_pose(pq: &[fph; 7]) -> Pose {
    let translation = Translation3::new(pq[0], pq[1], pq[2]);
    let rotation = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
        pq[6], pq[3], pq[4], pq[5],
    ));
    Pose::from_parts(translation, rotation)
}

/// Expresses a pose as `[x, y, z, qx, qy, qz, qw]`.
pub fn pose_to_pq(pose: &Pose) -> [fph; 7] {
    let t = pose.translation.vector;
    let q = pose.rotation.coords;
    [t.x, t.y, t.z, q.x, q.y, q.z, q.w]
}

/// Builds a pose from `[x, y, z]` plus a rotation vector (axis times angle).
pub fn pa_to_pose(pa: &[fph; 6]) -> Pose {
    let translation = Translation3::new(pa[0], pa[1], pa[2]);
    let rotation = UnitQuaternion::from_scaled_axis(Vector3::new(pa[3], pa[4], pa[5]));
    Pose::from_parts(translation, rotation)
}

/// Expresses a pose as `[x, y, z]` plus a rotation vector (axis times angle).
pub fn pose_to_pa(pose: &Pose) -> [fph; 6] {
    let t = pose.translation.vector;
    let axis = pose.rotation.scaled_axis();
    [t.x, t.y, t.z, axis.x, axis.y, axis.z]
}

/// Builds a pose from a 4×4 homogeneous transform. The rotation block is
/// reorthonormalized.
pub fn matrix_to_pose(pm: &Matrix4<fph>) -> Pose {
    let rotation = Rotation3::from_matrix(&pm.fixed_view::<3, 3>(0, 0).into_owned());
    let translation = Translation3::new(pm[(0, 3)], pm[(1, 3)], pm[(2, 3)]);
    Pose::from_parts(translation, UnitQuaternion::from_rotation_matrix(&rotation))
}

/// Expresses a pose as a 4×4 homogeneous transform.
pub fn pose_to_matrix(pose: &Pose) -> Matrix4<fph> {
    pose.to_homogeneous()
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    const ORDERS: [&str; 6] = ["313", "321", "123", "312", "212", "131"];

    #[test]
    fn should_parse_known_orders() {
        assert_eq!(EulerOrder::parse("313"), EulerOrder::ZXZ);
        assert_eq!(EulerOrder::parse("321"), EulerOrder::ZYX);
        assert_eq!(EulerOrder::parse("123"), EulerOrder::XYZ);
    }

    #[test]
    #[should_panic]
    fn should_reject_repeated_adjacent_axes() {
        EulerOrder::parse("311");
    }

    #[test]
    #[should_panic]
    fn should_reject_digits_outside_range() {
        EulerOrder::parse("314");
    }

    #[test]
    fn should_recover_angles_for_each_order() {
        let angles = [0.4, 0.7, -1.1];
        for order in ORDERS {
            let order = EulerOrder::parse(order);
            let rotation = euler_to_rotation(&angles, order);
            let recovered = rotation_to_euler(&rotation, order);
            let rotation_back = euler_to_rotation(&recovered, order);
            assert_abs_diff_eq!(rotation.angle_to(&rotation_back), 0.0, epsilon = 1e-12);
            for (expected, actual) in angles.iter().zip(&recovered) {
                assert_abs_diff_eq!(expected, actual, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn should_fix_third_angle_at_tait_bryan_singularity() {
        let order = EulerOrder::ZYX;
        let rotation = euler_to_rotation(&[0.3, FRAC_PI_2, 0.2], order);
        let recovered = rotation_to_euler(&rotation, order);
        assert_abs_diff_eq!(recovered[2], 0.0);
        let rotation_back = euler_to_rotation(&recovered, order);
        assert_abs_diff_eq!(rotation.angle_to(&rotation_back), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn should_fix_third_angle_at_proper_singularity() {
        let order = EulerOrder::ZXZ;
        let rotation = euler_to_rotation(&[0.9, 0.0, -0.4], order);
        let recovered = rotation_to_euler(&rotation, order);
        assert_abs_diff_eq!(recovered[2], 0.0);
        let rotation_back = euler_to_rotation(&recovered, order);
        assert_abs_diff_eq!(rotation.angle_to(&rotation_back), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn should_round_trip_pq_and_pa() {
        let pose = pe_to_pose(&[0.1, -0.2, 0.3, 0.4, 0.5, 0.6], EulerOrder::ZXZ);
        let from_pq = pq_to_pose(&pose_to_pq(&pose));
        let from_pa = pa_to_pose(&pose_to_pa(&pose));
        assert_abs_diff_eq!(pose, from_pq, epsilon = 1e-14);
        assert_abs_diff_eq!(pose, from_pa, epsilon = 1e-12);
    }

    #[test]
    fn should_round_trip_homogeneous_matrix() {
        let pose = pe_to_pose(&[1.0, 2.0, 3.0, -0.3, 1.2, 2.5], EulerOrder::ZYX);
        let recovered = matrix_to_pose(&pose_to_matrix(&pose));
        assert_abs_diff_eq!(pose, recovered, epsilon = 1e-10);
    }

    proptest! {
        #[test]
        fn should_round_trip_rotation_through_every_order(
            alpha in -PI..PI,
            beta in 0.2..1.3f64,
            gamma in -PI..PI,
        ) {
            for order in ORDERS {
                let order = EulerOrder::parse(order);
                let rotation = euler_to_rotation(&[alpha, beta, gamma], order);
                let recovered = euler_to_rotation(&rotation_to_euler(&rotation, order), order);
                prop_assert!(rotation.angle_to(&recovered) < 1e-10);
            }
        }
    }
}
