//! End-to-end robot scenarios: analytic branch selection, round trips
//! through forward kinematics, persistence and dynamics consistency.

use approx::assert_abs_diff_eq;
use armature_math::{EulerOrder, Pose, euler::pe_to_pose};
use armature_model::Model;
use armature_robot::{SevenAxisParam, UrParam, rokae_xb4, seven_axis, ur_arm};
use std::f64::consts::PI;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pose_error(a: &Pose, b: &Pose) -> (f64, f64) {
    (
        (a.translation.vector - b.translation.vector).norm(),
        a.rotation.angle_to(&b.rotation),
    )
}

#[test]
fn should_reproduce_ur_target_from_every_successful_branch() {
    init_logging();
    let mut robot = ur_arm(&UrParam::default()).unwrap();
    let target = pe_to_pose(&[0.3, 0.1, 0.5, 0.0, PI, 0.0], EulerOrder::ZYX);

    let mut successes = 0;
    for root in 0..8 {
        robot.set_end_effector_pose(&target);
        robot.inverse_solver.set_which_root(root);
        if robot.inverse_kinematics().is_err() {
            continue;
        }
        robot.forward_kinematics().unwrap();
        let (translation, rotation) = pose_error(robot.end_effector_pose(), &target);
        assert!(
            translation < 1e-8 && rotation < 1e-8,
            "branch {root}: translation error {translation:.3e}, rotation error {rotation:.3e}"
        );
        successes += 1;
    }
    assert!(successes >= 1, "no analytic branch succeeded");
}

#[test]
fn should_distinguish_ur_branches() {
    let mut robot = ur_arm(&UrParam::default()).unwrap();
    let target = pe_to_pose(&[0.3, 0.1, 0.5, 0.0, PI, 0.0], EulerOrder::ZYX);

    let mut solutions = Vec::new();
    for root in 0..8 {
        robot.set_end_effector_pose(&target);
        robot.inverse_solver.set_which_root(root);
        if robot.inverse_kinematics().is_ok() {
            solutions.push(robot.motion_positions());
        }
    }
    // At least two distinct joint configurations reach the same pose.
    let mut distinct = 0;
    for (i, a) in solutions.iter().enumerate() {
        let duplicate = solutions[..i].iter().any(|b| {
            a.iter()
                .zip(b)
                .all(|(x, y)| (x - y).abs() < 1e-6)
        });
        if !duplicate {
            distinct += 1;
        }
    }
    assert!(distinct >= 2, "expected multiple distinct branches");
}

#[test]
fn should_solve_seven_axis_branches_with_zero_arm_angle() {
    let mut robot = seven_axis(&SevenAxisParam::default()).unwrap();
    let target = pe_to_pose(&[0.1, 0.0, 1.2, 0.0, 0.0, 0.0], EulerOrder::ZYX);

    let mut successes = 0;
    for root in 0..8 {
        robot.set_end_effector_pose(&target);
        robot.inverse_solver.set_which_root(root);
        robot.inverse_solver.set_axis_angle(0.0);
        if robot.inverse_kinematics().is_err() {
            continue;
        }
        robot.forward_kinematics().unwrap();
        let (translation, rotation) = pose_error(robot.end_effector_pose(), &target);
        assert!(
            translation < 1e-8 && rotation < 1e-8,
            "branch {root}: translation error {translation:.3e}, rotation error {rotation:.3e}"
        );
        successes += 1;
    }
    assert!(successes >= 1, "no analytic branch succeeded");
}

#[test]
fn should_sweep_seven_axis_arm_angle_through_reachable_solutions() {
    let mut robot = seven_axis(&SevenAxisParam::default()).unwrap();
    let target = pe_to_pose(&[0.1, 0.0, 1.2, 0.0, 0.0, 0.0], EulerOrder::ZYX);

    for step in 0..4 {
        let axis_angle = -1.0 + 0.5 * f64::from(step);
        robot.set_end_effector_pose(&target);
        robot.inverse_solver.set_which_root(0);
        robot.inverse_solver.set_axis_angle(axis_angle);
        if robot.inverse_kinematics().is_err() {
            continue;
        }
        robot.forward_kinematics().unwrap();
        let (translation, rotation) = pose_error(robot.end_effector_pose(), &target);
        assert!(translation < 1e-8 && rotation < 1e-8);
    }
}

#[test]
fn should_round_trip_rokae_xb4_through_snapshot() {
    let mut robot = rokae_xb4().unwrap();
    robot.set_motion_positions(&[0.1, -0.2, 0.3, -0.4, 0.5, -0.6]);
    robot.forward_kinematics().unwrap();

    let saved = robot.model().save_snapshot();
    let loaded = Model::load_snapshot(&saved).unwrap();

    assert_eq!(loaded.save_snapshot(), saved);
    for index in 0..robot.model().n_parts() {
        let a = robot.model().part(robot.model().part_id(index)).pose();
        let b = loaded.part(loaded.part_id(index)).pose();
        let (translation, rotation) = pose_error(a, b);
        assert!(translation < 1e-12 && rotation < 1e-12);
    }
    assert_eq!(loaded.motion_positions(), robot.model().motion_positions());
}

#[test]
fn should_recover_joint_accelerations_on_rokae_xb4() {
    let mut robot = rokae_xb4().unwrap();
    let positions = [0.1, -0.2, 0.3, -0.4, 0.5, -0.6];
    let velocities = [0.3, 0.2, -0.1, 0.4, -0.2, 0.1];
    let accelerations = [0.7, -0.5, 0.3, -0.2, 0.6, -0.4];

    robot.set_motion_positions(&positions);
    robot.model_mut().set_motion_velocities(&velocities);
    robot.model_mut().set_motion_accelerations(&accelerations);
    robot.inverse_dynamics().unwrap();
    let motor_forces = robot.model().motion_forces();

    robot.model_mut().set_motion_forces(&motor_forces);
    robot.forward_dynamics().unwrap();

    for (measured, expected) in robot
        .model()
        .motion_accelerations()
        .iter()
        .zip(&accelerations)
    {
        assert_abs_diff_eq!(measured, expected, epsilon = 1e-8);
    }
}

#[test]
fn should_reconstruct_known_joint_configuration_through_ik() {
    let mut robot = rokae_xb4().unwrap();
    let reference = [0.2, 0.3, -0.4, 0.5, 0.6, -0.7];
    robot.set_motion_positions(&reference);
    robot.forward_kinematics().unwrap();
    let target = *robot.end_effector_pose();

    // Scramble the configuration, then ask the analytic solver for the
    // nominal branch of the recorded pose.
    robot.set_motion_positions(&[0.0; 6]);
    robot.forward_kinematics().unwrap();
    robot.set_end_effector_pose(&target);

    let mut recovered = None;
    for root in 0..8 {
        robot.set_end_effector_pose(&target);
        robot.inverse_solver.set_which_root(root);
        if robot.inverse_kinematics().is_err() {
            continue;
        }
        let positions = robot.motion_positions();
        if positions
            .iter()
            .zip(&reference)
            .all(|(a, b)| (a - b).abs() < 1e-6)
        {
            recovered = Some(root);
            break;
        }
    }
    assert!(
        recovered.is_some(),
        "no branch reproduced the reference configuration"
    );
}
