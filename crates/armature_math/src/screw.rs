//! Spatial (screw) algebra: adjoint transforms of twists and wrenches,
//! se(3) cross products, the exponential and logarithm maps, and spatial
//! inertia construction.

use crate::{Pose, Position, SpatialMatrix, Twist, Wrench, fph};
use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Angular part of a spatial vector.
pub fn angular(v: &Twist) -> Vector3<fph> {
    v.fixed_rows::<3>(0).into_owned()
}

/// Linear part of a spatial vector.
pub fn linear(v: &Twist) -> Vector3<fph> {
    v.fixed_rows::<3>(3).into_owned()
}

/// Assembles a spatial vector from its angular and linear parts.
pub fn spatial(angular: Vector3<fph>, linear: Vector3<fph>) -> Twist {
    Twist::new(
        angular.x, angular.y, angular.z, linear.x, linear.y, linear.z,
    )
}

/// The 6×6 adjoint of `pose`, mapping twists expressed in the pose's source
/// frame to the target frame.
pub fn adjoint(pose: &Pose) -> SpatialMatrix {
    let r = pose.rotation.to_rotation_matrix().into_inner();
    let p = pose.translation.vector.cross_matrix();
    let mut ad = SpatialMatrix::zeros();
    ad.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
    ad.fixed_view_mut::<3, 3>(3, 0).copy_from(&(p * r));
    ad.fixed_view_mut::<3, 3>(3, 3).copy_from(&r);
    ad
}

/// The 6×6 co-adjoint of `pose`, mapping wrenches expressed in the pose's
/// source frame to the target frame.
pub fn coadjoint(pose: &Pose) -> SpatialMatrix {
    let r = pose.rotation.to_rotation_matrix().into_inner();
    let p = pose.translation.vector.cross_matrix();
    let mut ad = SpatialMatrix::zeros();
    ad.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
    ad.fixed_view_mut::<3, 3>(0, 3).copy_from(&(p * r));
    ad.fixed_view_mut::<3, 3>(3, 3).copy_from(&r);
    ad
}

/// Transforms a twist from the pose's source frame to the target frame.
pub fn tf_twist(pose: &Pose, twist: &Twist) -> Twist {
    let omega = pose.rotation * angular(twist);
    let v = pose.rotation * linear(twist) + pose.translation.vector.cross(&omega);
    spatial(omega, v)
}

/// Transforms a wrench from the pose's source frame to the target frame.
pub fn tf_wrench(pose: &Pose, wrench: &Wrench) -> Wrench {
    let f = pose.rotation * linear(wrench);
    let m = pose.rotation * angular(wrench) + pose.translation.vector.cross(&f);
    spatial(m, f)
}

/// Transforms a spatial inertia expressed in the pose's source frame to the
/// target frame.
pub fn tf_inertia(pose: &Pose, inertia: &SpatialMatrix) -> SpatialMatrix {
    let ad = adjoint(&pose.inverse());
    ad.transpose() * inertia * ad
}

/// Transforms a spatial acceleration from the pose's source frame to the
/// target frame when the source frame moves: `frame_twist` is the twist of
/// the source frame expressed in the target frame, and `velocity` is the
/// body's twist in the source frame. For rigidly attached frames
/// (`frame_twist` zero) this reduces to the plain twist transform.
pub fn tf_acceleration(
    pose: &Pose,
    frame_twist: &Twist,
    acceleration: &Twist,
    velocity: &Twist,
) -> Twist {
    tf_twist(pose, acceleration) + cross_twist(frame_twist, &tf_twist(pose, velocity))
}

/// The se(3) cross product (Lie bracket) of two twists.
pub fn cross_twist(a: &Twist, b: &Twist) -> Twist {
    let omega_a = angular(a);
    let v_a = linear(a);
    let omega_b = angular(b);
    let v_b = linear(b);
    spatial(
        omega_a.cross(&omega_b),
        omega_a.cross(&v_b) + v_a.cross(&omega_b),
    )
}

/// The dual cross product: the rate of change of a wrench rigidly attached
/// to a frame moving with the given twist.
pub fn cross_wrench(twist: &Twist, wrench: &Wrench) -> Wrench {
    let omega = angular(twist);
    let v = linear(twist);
    let m = angular(wrench);
    let f = linear(wrench);
    spatial(omega.cross(&m) + v.cross(&f), omega.cross(&f))
}

/// The exponential map from a displacement screw to a pose.
pub fn screw_exp(screw: &Twist) -> Pose {
    let omega = angular(screw);
    let v = linear(screw);
    let theta = omega.norm();
    let rotation = UnitQuaternion::from_scaled_axis(omega);

    let omega_x = omega.cross_matrix();
    let (c1, c2) = if theta < 1e-8 {
        (0.5, 1.0 / 6.0)
    } else {
        let theta2 = theta * theta;
        (
            (1.0 - theta.cos()) / theta2,
            (theta - theta.sin()) / (theta2 * theta),
        )
    };
    let translation = v + omega_x * v * c1 + omega_x * (omega_x * v) * c2;

    Pose::from_parts(translation.into(), rotation)
}

/// The logarithm map from a pose to a displacement screw.
pub fn screw_log(pose: &Pose) -> Twist {
    let omega = pose.rotation.scaled_axis();
    let theta = omega.norm();
    let t = pose.translation.vector;

    let omega_x = omega.cross_matrix();
    let c = if theta < 1e-8 {
        1.0 / 12.0
    } else {
        (1.0 - theta * theta.sin() / (2.0 * (1.0 - theta.cos()))) / (theta * theta)
    };
    let v = t - omega_x * t * 0.5 + omega_x * (omega_x * t) * c;

    spatial(omega, v)
}

/// Assembles the 6×6 spatial inertia of a body with the given mass, center
/// of mass and rotational inertia about the center of mass, all expressed in
/// the body frame. The result is taken about the body-frame origin.
///
/// # Panics
/// If the mass does not exceed zero.
pub fn spatial_inertia(
    mass: fph,
    center_of_mass: &Position,
    inertia_about_com: &Matrix3<fph>,
) -> SpatialMatrix {
    assert!(mass > 0.0, "body mass must exceed zero");
    let c = center_of_mass.coords.cross_matrix();
    let mut im = SpatialMatrix::zeros();
    im.fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&(inertia_about_com - c * c * mass));
    im.fixed_view_mut::<3, 3>(0, 3).copy_from(&(c * mass));
    im.fixed_view_mut::<3, 3>(3, 0).copy_from(&(c.transpose() * mass));
    im.fixed_view_mut::<3, 3>(3, 3)
        .copy_from(&(Matrix3::identity() * mass));
    im
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::{Translation3, point, vector};
    use proptest::prelude::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn sample_pose() -> Pose {
        Pose::from_parts(
            Translation3::new(0.3, -1.2, 0.8),
            UnitQuaternion::from_scaled_axis(vector![0.2, -0.5, 1.1]),
        )
    }

    #[test]
    fn should_match_adjoint_matrix_and_direct_twist_transform() {
        let pose = sample_pose();
        let twist = Twist::new(0.1, -0.4, 0.7, 1.0, 2.0, -3.0);
        assert_abs_diff_eq!(adjoint(&pose) * twist, tf_twist(&pose, &twist), epsilon = 1e-13);
    }

    #[test]
    fn should_match_coadjoint_matrix_and_direct_wrench_transform() {
        let pose = sample_pose();
        let wrench = Wrench::new(0.3, 0.1, -0.9, -2.0, 0.5, 4.0);
        assert_abs_diff_eq!(
            coadjoint(&pose) * wrench,
            tf_wrench(&pose, &wrench),
            epsilon = 1e-13
        );
    }

    #[test]
    fn should_preserve_power_pairing_under_transform() {
        let pose = sample_pose();
        let twist = Twist::new(0.1, -0.4, 0.7, 1.0, 2.0, -3.0);
        let wrench = Wrench::new(0.3, 0.1, -0.9, -2.0, 0.5, 4.0);
        let power = wrench.dot(&twist);
        let transformed = tf_wrench(&pose, &wrench).dot(&tf_twist(&pose, &twist));
        assert_abs_diff_eq!(power, transformed, epsilon = 1e-12);
    }

    #[test]
    fn should_preserve_kinetic_energy_under_inertia_transform() {
        let pose = sample_pose();
        let im = spatial_inertia(
            2.5,
            &point![0.1, 0.2, -0.3],
            &Matrix3::from_diagonal(&vector![0.2, 0.3, 0.4]),
        );
        let twist = Twist::new(0.1, -0.4, 0.7, 1.0, 2.0, -3.0);
        let energy = (twist.transpose() * im * twist)[0];
        let twist_world = tf_twist(&pose, &twist);
        let im_world = tf_inertia(&pose, &im);
        let energy_world = (twist_world.transpose() * im_world * twist_world)[0];
        assert_abs_diff_eq!(energy, energy_world, epsilon = 1e-11);
    }

    #[test]
    fn should_reduce_acceleration_transform_to_twist_transform_for_fixed_frames() {
        let pose = sample_pose();
        let acceleration = Twist::new(0.4, -0.1, 0.2, 0.7, -0.5, 0.3);
        let velocity = Twist::new(0.1, -0.4, 0.7, 1.0, 2.0, -3.0);
        assert_abs_diff_eq!(
            tf_acceleration(&pose, &Twist::zeros(), &acceleration, &velocity),
            tf_twist(&pose, &acceleration),
            epsilon = 1e-13
        );
    }

    #[test]
    fn should_add_frame_motion_term_to_acceleration_transform() {
        let pose = sample_pose();
        let frame_twist = Twist::new(0.2, 0.1, -0.3, 0.5, -0.2, 0.7);
        let acceleration = Twist::zeros();
        let velocity = Twist::new(0.1, -0.4, 0.7, 1.0, 2.0, -3.0);
        assert_abs_diff_eq!(
            tf_acceleration(&pose, &frame_twist, &acceleration, &velocity),
            cross_twist(&frame_twist, &tf_twist(&pose, &velocity)),
            epsilon = 1e-13
        );
    }

    #[test]
    fn should_expose_pure_rotation_through_exp() {
        let screw = Twist::new(0.0, 0.0, FRAC_PI_2, 0.0, 0.0, 0.0);
        let pose = screw_exp(&screw);
        assert_abs_diff_eq!(pose.translation.vector.norm(), 0.0);
        assert_abs_diff_eq!(
            pose.rotation.angle_to(&UnitQuaternion::from_scaled_axis(vector![
                0.0,
                0.0,
                FRAC_PI_2
            ])),
            0.0,
            epsilon = 1e-14
        );
    }

    #[test]
    fn should_translate_rotating_screw_along_helix() {
        // A unit z-rotation screw with unit pitch advances z by the angle.
        let screw = Twist::new(0.0, 0.0, 1.0, 0.0, 0.0, 1.0);
        let pose = screw_exp(&screw);
        assert_abs_diff_eq!(pose.translation.vector.z, 1.0, epsilon = 1e-14);
    }

    #[test]
    fn should_invert_exp_with_log() {
        let screw = Twist::new(0.2, -0.5, 1.1, 0.3, -1.2, 0.8);
        let recovered = screw_log(&screw_exp(&screw));
        assert_abs_diff_eq!(screw, recovered, epsilon = 1e-12);
    }

    #[test]
    fn should_vanish_for_identity_log() {
        assert_abs_diff_eq!(screw_log(&Pose::identity()), Twist::zeros());
    }

    #[test]
    fn should_satisfy_jacobi_antisymmetry_for_twist_cross() {
        let a = Twist::new(0.1, -0.4, 0.7, 1.0, 2.0, -3.0);
        let b = Twist::new(0.3, 0.1, -0.9, -2.0, 0.5, 4.0);
        assert_abs_diff_eq!(cross_twist(&a, &b), -cross_twist(&b, &a), epsilon = 1e-14);
        assert_abs_diff_eq!(cross_twist(&a, &a), Twist::zeros(), epsilon = 1e-14);
    }

    #[test]
    fn should_keep_power_rate_consistent_between_cross_forms() {
        // d/dt (w·t) for w, t both attached to a frame moving with u equals
        // (ad*_u w)·t + w·(ad_u t).
        let u = Twist::new(0.2, 0.1, -0.3, 0.5, -0.2, 0.7);
        let t = Twist::new(0.1, -0.4, 0.7, 1.0, 2.0, -3.0);
        let w = Wrench::new(0.3, 0.1, -0.9, -2.0, 0.5, 4.0);
        let rate = cross_wrench(&u, &w).dot(&t) + w.dot(&cross_twist(&u, &t));
        // The pairing of co-moving screws is invariant, so the rate is zero.
        assert_abs_diff_eq!(rate, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn should_build_point_mass_inertia() {
        let im = spatial_inertia(3.0, &Position::origin(), &Matrix3::zeros());
        let twist = Twist::new(0.0, 0.0, 0.0, 1.0, 2.0, 3.0);
        let momentum = im * twist;
        assert_abs_diff_eq!(linear(&momentum), vector![3.0, 6.0, 9.0]);
        assert_abs_diff_eq!(angular(&momentum), Vector3::zeros());
    }

    proptest! {
        #[test]
        fn should_round_trip_log_exp(
            wx in -1.5..1.5f64,
            wy in -1.5..1.5f64,
            wz in -1.5..1.5f64,
            x in -2.0..2.0f64,
            y in -2.0..2.0f64,
            z in -2.0..2.0f64,
        ) {
            prop_assume!(vector![wx, wy, wz].norm() < PI - 0.1);
            let screw = Twist::new(wx, wy, wz, x, y, z);
            let recovered = screw_log(&screw_exp(&screw));
            prop_assert!((screw - recovered).norm() < 1e-10);
        }
    }
}
