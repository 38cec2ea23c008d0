//! Seven-axis S-R-S redundant arms: template and analytic inverse
//! kinematics with an explicit arm angle.

use crate::SerialRobot;
use anyhow::Result;
use armature_math::{
    EulerOrder, Pose, fph, put_into_period,
    euler::rotation_to_euler,
    screw::spatial_inertia,
};
use armature_model::Model;
use armature_solver::{
    DiagonalSolver, DriveMode, ForwardKinematicSolver, SolveError, SolveReport, Solver,
    SolverConfig,
};
use nalgebra::{Matrix3, Point3, Translation3, Unit, UnitQuaternion, Vector3, point};
use std::f64::consts::PI;

/// Geometry of a spherical-revolute-spherical seven-axis arm in its zero
/// configuration (fully stretched upward): three axes intersect at the
/// shoulder (height `d1`), the elbow sits `d3` above it, three axes
/// intersect at the wrist `d5` above the elbow, and `tool0` places the
/// flange relative to the wrist frame.
#[derive(Clone, Debug)]
pub struct SevenAxisParam {
    pub d1: fph,
    pub d3: fph,
    pub d5: fph,
    pub tool0: Pose,
}

impl Default for SevenAxisParam {
    fn default() -> Self {
        Self {
            d1: 0.3705,
            d3: 0.330,
            d5: 0.320,
            tool0: Pose::from_parts(
                Translation3::new(0.0, 0.0, 0.2205),
                UnitQuaternion::identity(),
            ),
        }
    }
}

impl SevenAxisParam {
    pub fn shoulder(&self) -> Point3<fph> {
        point![0.0, 0.0, self.d1]
    }

    pub fn elbow(&self) -> Point3<fph> {
        point![0.0, 0.0, self.d1 + self.d3]
    }

    pub fn wrist(&self) -> Point3<fph> {
        point![0.0, 0.0, self.d1 + self.d3 + self.d5]
    }

    /// The flange pose on link 7 (link coordinates coincide with the world
    /// frame in the zero configuration).
    pub fn flange(&self) -> Pose {
        Pose::from_parts(self.wrist().coords.into(), UnitQuaternion::identity()) * self.tool0
    }
}

/// Builds a seven-axis S-R-S arm: seven links, seven driven revolute
/// joints and an end-effector general motion against the ground.
pub fn seven_axis(param: &SevenAxisParam) -> Result<SerialRobot<SevenAxisIkSolver>> {
    let mut model = Model::new();

    let masses = [5.0, 4.0, 4.0, 3.0, 3.0, 2.0, 1.0];
    let shoulder = param.shoulder();
    let elbow = param.elbow();
    let wrist = param.wrist();
    let coms = [
        point![0.0, 0.0, 0.5 * param.d1],
        shoulder,
        point![0.0, 0.0, param.d1 + 0.5 * param.d3],
        elbow,
        point![0.0, 0.0, param.d1 + param.d3 + 0.5 * param.d5],
        wrist,
        point![0.0, 0.0, param.d1 + param.d3 + param.d5 + 0.05],
    ];
    let mut links = Vec::new();
    for (index, (&mass, com)) in masses.iter().zip(&coms).enumerate() {
        let inertia = spatial_inertia(mass, com, &(Matrix3::identity() * (0.02 * mass)));
        links.push(model.add_part(&format!("link{}", index + 1), Pose::identity(), inertia)?);
    }

    let joints = [
        (point![0.0, 0.0, 0.0], Vector3::z()),
        (shoulder, Vector3::y()),
        (shoulder, Vector3::z()),
        (elbow, Vector3::y()),
        (elbow, Vector3::z()),
        (wrist, Vector3::y()),
        (wrist, Vector3::z()),
    ];
    for (index, (position, axis)) in joints.iter().enumerate() {
        let child = links[index];
        let parent = if index == 0 {
            Model::GROUND
        } else {
            links[index - 1]
        };
        let joint =
            model.add_revolute_joint(&format!("j{}", index + 1), child, parent, position, axis)?;
        model.add_motion(&format!("m{}", index + 1), joint)?;
    }

    let end_effector = model.add_general_motion("tcp", links[6], Model::GROUND, &param.flange())?;
    model.init()?;

    let solver = SevenAxisIkSolver::new(param.clone());
    Ok(SerialRobot::new(model, solver, end_effector))
}

/// Analytic inverse kinematics for S-R-S seven-axis arms.
///
/// The redundancy is resolved by the arm angle (`axis_angle`), which swings
/// the elbow about the shoulder-wrist line; the eight discrete branches are
/// indexed by `which_root`: bit 0 flips the shoulder, bit 1 the elbow,
/// bit 2 the wrist.
#[derive(Debug)]
pub struct SevenAxisIkSolver {
    param: SevenAxisParam,
    which_root: usize,
    axis_angle: fph,
    seed: ForwardKinematicSolver,
    refine: DiagonalSolver,
}

impl SevenAxisIkSolver {
    pub fn new(param: SevenAxisParam) -> Self {
        let config = SolverConfig::default();
        Self {
            param,
            which_root: 0,
            axis_angle: 0.0,
            seed: ForwardKinematicSolver::new(config),
            refine: DiagonalSolver::new(DriveMode::GeneralMotions, config),
        }
    }

    pub fn which_root(&self) -> usize {
        self.which_root
    }

    /// # Panics
    /// If `which_root` is not in `0..8`.
    pub fn set_which_root(&mut self, which_root: usize) {
        assert!(which_root < 8, "which_root must be in 0..8");
        self.which_root = which_root;
    }

    /// The arm angle resolving the redundant degree of freedom.
    pub fn axis_angle(&self) -> fph {
        self.axis_angle
    }

    pub fn set_axis_angle(&mut self, axis_angle: fph) {
        self.axis_angle = axis_angle;
    }

    /// The joint positions of one analytic branch for a world-frame flange
    /// target and arm angle.
    pub fn branch_positions(
        &self,
        target: &Pose,
        which_root: usize,
        axis_angle: fph,
    ) -> Result<[fph; 7], SolveError> {
        assert!(which_root < 8, "which_root must be in 0..8");
        let p = &self.param;
        let sign = |bit: usize| if which_root >> bit & 1 == 1 { -1.0 } else { 1.0 };
        let (shoulder_flip, elbow_sign, wrist_flip) = (sign(0), sign(1), sign(2));

        let x7 = target * p.flange().inverse();
        let wrist = x7 * p.wrist();
        let span = wrist - p.shoulder();
        let length = span.norm();
        if length > p.d3 + p.d5 || length < (p.d3 - p.d5).abs() {
            return Err(SolveError::Unreachable);
        }

        // Elbow angle from the shoulder-wrist distance.
        let cos_elbow =
            (length * length - p.d3 * p.d3 - p.d5 * p.d5) / (2.0 * p.d3 * p.d5);
        let q4 = elbow_sign * cos_elbow.clamp(-1.0, 1.0).acos();

        // Reference shoulder direction in the vertical plane of the
        // shoulder-wrist line, then swung by the arm angle.
        let azimuth = if span.x.abs() + span.y.abs() < 1e-12 {
            0.0
        } else {
            fph::atan2(span.y, span.x)
        };
        let polar = fph::atan2(span.x.hypot(span.y), span.z);
        let open = fph::atan2(p.d5 * q4.sin(), p.d3 + p.d5 * q4.cos());
        let swing = UnitQuaternion::from_axis_angle(&Unit::new_normalize(span), axis_angle);
        let reference = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), azimuth)
            * UnitQuaternion::from_axis_angle(&Vector3::y_axis(), polar - open);
        let shoulder_rotation = swing * reference;

        let [mut q1, mut q2, mut q3] =
            rotation_to_euler(&shoulder_rotation, EulerOrder::parse("323"));
        if shoulder_flip < 0.0 {
            q1 += PI;
            q2 = -q2;
            q3 += PI;
        }

        // Wrist z-y-z from the residual rotation.
        let r4 = shoulder_rotation * UnitQuaternion::from_axis_angle(&Vector3::y_axis(), q4);
        let residual = r4.inverse() * x7.rotation;
        let [mut q5, mut q6, mut q7] = rotation_to_euler(&residual, EulerOrder::parse("323"));
        if wrist_flip < 0.0 {
            q5 += PI;
            q6 = -q6;
            q7 += PI;
        }

        Ok([
            put_into_period(q1, 0.0),
            put_into_period(q2, 0.0),
            put_into_period(q3, 0.0),
            put_into_period(q4, 0.0),
            put_into_period(q5, 0.0),
            put_into_period(q6, 0.0),
            put_into_period(q7, 0.0),
        ])
    }
}

impl Solver for SevenAxisIkSolver {
    fn allocate_buffers(&mut self, model: &Model) {
        self.seed.allocate_buffers(model);
        self.refine.allocate_buffers(model);
    }

    fn kin_pos(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        let target = *model.general_motions()[0].target_pose();
        let positions = self.branch_positions(&target, self.which_root, self.axis_angle)?;
        model.set_motion_positions(&positions);
        let seeded = self.seed.kin_pos(model)?;
        let refined = self.refine.kin_pos(model)?;
        Ok(SolveReport {
            iterations: seeded.iterations + refined.iterations + 1,
            error: refined.error,
        })
    }

    fn kin_vel(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        self.refine.kin_vel(model)
    }

    fn kin_acc(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        self.refine.kin_acc(model)
    }

    fn dyn_fce(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        self.refine.dyn_fce(model)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::vector;

    #[test]
    fn should_reject_overextended_target() {
        let param = SevenAxisParam::default();
        let solver = SevenAxisIkSolver::new(param.clone());
        let target = Pose::from_parts(
            Translation3::new(0.0, 0.0, param.d1 + param.d3 + param.d5 + 0.2205 + 0.5),
            UnitQuaternion::identity(),
        );
        assert_eq!(
            solver.branch_positions(&target, 0, 0.0),
            Err(SolveError::Unreachable)
        );
    }

    #[test]
    fn should_close_position_loop_for_reference_branch() {
        let param = SevenAxisParam::default();
        let solver = SevenAxisIkSolver::new(param.clone());
        let target = Pose::from_parts(
            Translation3::new(0.1, 0.0, 1.2),
            UnitQuaternion::identity(),
        );
        let q = solver.branch_positions(&target, 0, 0.0).unwrap();

        // Replay the chain with the product of exponentials and check the
        // wrist lands where the analytic solution put it.
        let p = &param;
        let shoulder_rotation = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), q[0])
            * UnitQuaternion::from_axis_angle(&Vector3::y_axis(), q[1])
            * UnitQuaternion::from_axis_angle(&Vector3::z_axis(), q[2]);
        let elbow = p.shoulder() + shoulder_rotation * vector![0.0, 0.0, p.d3];
        let forearm = shoulder_rotation
            * UnitQuaternion::from_axis_angle(&Vector3::y_axis(), q[3])
            * vector![0.0, 0.0, p.d5];
        let wrist = elbow + forearm;

        let x7 = target * p.flange().inverse();
        let expected = x7 * p.wrist();
        assert_abs_diff_eq!(wrist, expected, epsilon = 1e-9);
    }
}
