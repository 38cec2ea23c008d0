//! UR-family 6R arms (non-spherical wrist): template and analytic inverse
//! kinematics.

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
use nalgebra::{Matrix3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3, point, vector};
use std::f64::consts::PI;

/// Geometry of a UR-like arm in its zero configuration (arm stretched
/// along +x, tool pointing along +y):
///
/// - axis 1 is vertical through the origin, the shoulder at height `d1`;
/// - axes 2, 3 and 4 are parallel (y), separated by the link lengths `a2`
///   and `a3`;
/// - the wrist offsets `d4` (lateral, +y), `d5` (down) and `d6` (along the
///   tool axis) complete the chain.
#[derive(Clone, Debug)]
pub struct UrParam {
    pub d1: fph,
    pub a2: fph,
    pub a3: fph,
    pub d4: fph,
    pub d5: fph,
    pub d6: fph,
}

impl Default for UrParam {
    /// The UR5 geometry.
    fn default() -> Self {
        Self {
            d1: 0.089159,
            a2: 0.425,
            a3: 0.39225,
            d4: 0.10915,
            d5: 0.09465,
            d6: 0.0823,
        }
    }
}

impl UrParam {
    /// The point where the fifth and sixth axes intersect, in the zero
    /// configuration.
    pub fn wrist_point(&self) -> Point3<fph> {
        point![self.a2 + self.a3, self.d4, self.d1 - self.d5]
    }

    /// The flange pose on link 6 (link coordinates coincide with the world
    /// frame in the zero configuration). The flange z-axis is the tool
    /// (approach) direction, +y in the zero configuration.
    pub fn flange(&self) -> Pose {
        let rotation = Rotation3::from_matrix_unchecked(Matrix3::from_columns(&[
            vector![-1.0, 0.0, 0.0],
            vector![0.0, 0.0, 1.0],
            vector![0.0, 1.0, 0.0],
        ]));
        Pose::from_parts(
            Translation3::new(self.a2 + self.a3, self.d4 + self.d6, self.d1 - self.d5),
            UnitQuaternion::from_rotation_matrix(&rotation),
        )
    }
}

/// Builds a UR-like arm: six links, six driven revolute joints and an
/// end-effector general motion against the ground.
pub fn ur_arm(param: &UrParam) -> Result<SerialRobot<UrIkSolver>> {
    let mut model = Model::new();

    let masses = [3.7, 8.4, 2.3, 1.2, 1.2, 0.25];
    let coms = [
        point![0.0, 0.0, 0.5 * param.d1],
        point![0.5 * param.a2, 0.0, param.d1],
        point![param.a2 + 0.5 * param.a3, 0.0, param.d1],
        point![param.a2 + param.a3, 0.5 * param.d4, param.d1],
        point![param.a2 + param.a3, param.d4, param.d1 - 0.5 * param.d5],
        point![param.a2 + param.a3, param.d4 + 0.5 * param.d6, param.d1 - param.d5],
    ];
    let mut links = Vec::new();
    for (index, (&mass, com)) in masses.iter().zip(&coms).enumerate() {
        let inertia = spatial_inertia(mass, com, &(Matrix3::identity() * (0.02 * mass)));
        links.push(model.add_part(&format!("link{}", index + 1), Pose::identity(), inertia)?);
    }

    let joints = [
        (point![0.0, 0.0, 0.0], Vector3::z()),
        (point![0.0, 0.0, param.d1], Vector3::y()),
        (point![param.a2, 0.0, param.d1], Vector3::y()),
        (point![param.a2 + param.a3, 0.0, param.d1], Vector3::y()),
        (
            point![param.a2 + param.a3, param.d4, param.d1],
            Vector3::z(),
        ),
        (
            point![param.a2 + param.a3, param.d4, param.d1 - param.d5],
            Vector3::y(),
        ),
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

    let end_effector = model.add_general_motion("tcp", links[5], Model::GROUND, &param.flange())?;
    model.init()?;

    let solver = UrIkSolver::new(param.clone());
    Ok(SerialRobot::new(model, solver, end_effector))
}

/// Analytic inverse kinematics for UR-like arms.
///
/// Eight closed-form branches indexed by `which_root`: bit 0 flips the
/// shoulder, bit 1 the elbow, bit 2 the wrist. The branch seeds the
/// mechanism before a Newton refinement against the end-effector target.
#[derive(Debug)]
pub struct UrIkSolver {
    param: UrParam,
    which_root: usize,
    seed: ForwardKinematicSolver,
    refine: DiagonalSolver,
}

impl UrIkSolver {
    pub fn new(param: UrParam) -> Self {
        let config = SolverConfig::default();
        Self {
            param,
            which_root: 0,
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

    /// The joint positions of one analytic branch for a world-frame flange
    /// target.
    pub fn branch_positions(
        &self,
        target: &Pose,
        which_root: usize,
    ) -> Result<[fph; 6], SolveError> {
        assert!(which_root < 8, "which_root must be in 0..8");
        let p = &self.param;
        let sign = |bit: usize| if which_root >> bit & 1 == 1 { -1.0 } else { 1.0 };
        let (shoulder, elbow, wrist_flip) = (sign(0), sign(1), sign(2));

        let x6 = target * p.flange().inverse();
        let wrist = x6 * p.wrist_point();

        // Base angle: the wrist point sits at lateral offset d4 from the
        // arm plane.
        let radius2 = wrist.x * wrist.x + wrist.y * wrist.y;
        let lateral2 = p.d4 * p.d4;
        if radius2 < lateral2 {
            return Err(SolveError::Unreachable);
        }
        let reach = shoulder * (radius2 - lateral2).sqrt();
        let q1 = fph::atan2(wrist.y, wrist.x) - fph::atan2(p.d4, reach);

        // Total pitch, wrist bend and roll from the residual y-z-y Euler
        // decomposition.
        let base = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), q1);
        let residual = base.inverse() * x6.rotation;
        let [mut q234, mut q5, mut q6] = rotation_to_euler(&residual, EulerOrder::parse("232"));
        if wrist_flip < 0.0 {
            q234 += PI;
            q5 = -q5;
            q6 += PI;
        }

        // Locate joint 4 and solve the planar two-link for the shoulder
        // and elbow.
        let y1 = base * Vector3::y();
        let pitch = base * UnitQuaternion::from_axis_angle(&Vector3::y_axis(), q234);
        let elbow_point = wrist.coords - y1 * p.d4 + (pitch * Vector3::z()) * p.d5;
        let in_plane = base.inverse() * elbow_point;
        let u = in_plane.x;
        let w = p.d1 - in_plane.z;
        let c3 = (u * u + w * w - p.a2 * p.a2 - p.a3 * p.a3) / (2.0 * p.a2 * p.a3);
        if c3.abs() > 1.0 + 1e-12 {
            return Err(SolveError::Unreachable);
        }
        let q3 = elbow * c3.clamp(-1.0, 1.0).acos();
        let q2 =
            fph::atan2(w, u) - fph::atan2(p.a3 * q3.sin(), p.a2 + p.a3 * q3.cos());
        let q4 = q234 - q2 - q3;

        Ok([
            put_into_period(q1, 0.0),
            put_into_period(q2, 0.0),
            put_into_period(q3, 0.0),
            put_into_period(q4, 0.0),
            put_into_period(q5, 0.0),
            put_into_period(q6, 0.0),
        ])
    }
}

impl Solver for UrIkSolver {
    fn allocate_buffers(&mut self, model: &Model) {
        self.seed.allocate_buffers(model);
        self.refine.allocate_buffers(model);
    }

    fn kin_pos(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        let target = *model.general_motions()[0].target_pose();
        let positions = self.branch_positions(&target, self.which_root)?;
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

    #[test]
    fn should_return_zero_branch_for_zero_target() {
        let param = UrParam::default();
        let solver = UrIkSolver::new(param.clone());
        let q = solver.branch_positions(&param.flange(), 0).unwrap();
        for value in q {
            assert_abs_diff_eq!(value, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn should_keep_flange_z_axis_along_tool_direction() {
        let param = UrParam::default();
        let approach = param.flange().rotation * Vector3::z();
        assert_abs_diff_eq!(approach, vector![0.0, 1.0, 0.0], epsilon = 1e-12);
    }

    #[test]
    fn should_reject_wrist_target_on_base_axis() {
        let param = UrParam::default();
        let solver = UrIkSolver::new(param.clone());
        // Pull the wrist point onto the base axis; the lateral offset d4
        // can no longer be honored.
        let offset = param.wrist_point().coords;
        let target = Pose::from_parts(
            (param.flange().translation.vector - vector![offset.x, offset.y, 0.0]).into(),
            param.flange().rotation,
        );
        assert_eq!(
            solver.branch_positions(&target, 0),
            Err(SolveError::Unreachable)
        );
    }
}
