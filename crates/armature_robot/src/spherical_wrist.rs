//! Six-axis arms with a spherical wrist (Puma and Rokae XB4 geometries):
//! template and analytic inverse kinematics.

use crate::SerialRobot;
use anyhow::Result;
use armature_math::{
    EulerOrder, Pose, fph, put_into_period,
    euler::rotation_to_euler,
    screw::spatial_inertia,
};
use armature_solver::{
    DiagonalSolver, DriveMode, ForwardKinematicSolver, SolveError, SolveReport, Solver,
    SolverConfig,
};
use armature_model::Model;
use nalgebra::{Matrix3, Point3, Translation3, UnitQuaternion, Vector3, point};

/// Geometry of a spherical-wrist 6R arm, in its zero configuration (arm
/// stretched upward):
///
/// - axis 1 is vertical through the origin;
/// - axes 2 and 3 are horizontal (y) at heights `d1` and `d1 + a2`, with a
///   forward offset `a1` and a lateral offset `d3`;
/// - the forearm is vertical at forward offset `a1 + a3`, reaching the
///   wrist center at height `d1 + a2 + d4`, where axes 4, 5 and 6
///   intersect;
/// - `tool0` places the flange relative to the wrist-center frame.
#[derive(Clone, Debug)]
pub struct SphericalWristParam {
    pub d1: fph,
    pub a1: fph,
    pub a2: fph,
    pub d3: fph,
    pub a3: fph,
    pub d4: fph,
    pub tool0: Pose,
}

impl Default for SphericalWristParam {
    /// The Rokae XB4 geometry.
    fn default() -> Self {
        Self {
            d1: 0.3295,
            a1: 0.04,
            a2: 0.275,
            d3: 0.0,
            a3: 0.025,
            d4: 0.28,
            tool0: Pose::from_parts(Translation3::new(0.0, 0.0, 0.1), UnitQuaternion::identity()),
        }
    }
}

impl SphericalWristParam {
    /// The wrist-center position in the zero configuration.
    pub fn wrist_center(&self) -> Point3<fph> {
        point![self.a1 + self.a3, self.d3, self.d1 + self.a2 + self.d4]
    }

    /// The flange pose on link 6 (in link coordinates, which coincide with
    /// the world frame in the zero configuration).
    pub fn flange(&self) -> Pose {
        Pose::from_parts(self.wrist_center().coords.into(), UnitQuaternion::identity())
            * self.tool0
    }
}

/// Builds a Rokae XB4 model with its analytic solver.
pub fn rokae_xb4() -> Result<SerialRobot<SphericalWristIkSolver>> {
    spherical_wrist_arm(&SphericalWristParam::default())
}

/// Builds a spherical-wrist 6R arm: six links, six driven revolute joints
/// and an end-effector general motion against the ground.
pub fn spherical_wrist_arm(
    param: &SphericalWristParam,
) -> Result<SerialRobot<SphericalWristIkSolver>> {
    let mut model = Model::new();

    let masses = [6.0, 10.0, 6.0, 3.0, 2.0, 1.0];
    let coms = [
        point![0.0, 0.0, 0.5 * param.d1],
        point![param.a1, param.d3, param.d1 + 0.5 * param.a2],
        point![param.a1 + 0.5 * param.a3, param.d3, param.d1 + param.a2],
        point![param.a1 + param.a3, param.d3, param.d1 + param.a2 + 0.5 * param.d4],
        point![param.a1 + param.a3, param.d3, param.d1 + param.a2 + param.d4],
        point![param.a1 + param.a3, param.d3, param.d1 + param.a2 + param.d4],
    ];
    let mut links = Vec::new();
    for (index, (&mass, com)) in masses.iter().zip(&coms).enumerate() {
        let inertia = spatial_inertia(mass, com, &(Matrix3::identity() * (0.02 * mass)));
        links.push(model.add_part(&format!("link{}", index + 1), Pose::identity(), inertia)?);
    }

    let wrist = param.wrist_center();
    let joints = [
        (point![0.0, 0.0, 0.0], Vector3::z()),
        (point![param.a1, param.d3, param.d1], Vector3::y()),
        (point![param.a1, param.d3, param.d1 + param.a2], Vector3::y()),
        (
            point![param.a1 + param.a3, param.d3, param.d1 + param.a2],
            Vector3::z(),
        ),
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

    let end_effector = model.add_general_motion("tcp", links[5], Model::GROUND, &param.flange())?;
    model.init()?;

    let solver = SphericalWristIkSolver::new(param.clone());
    Ok(SerialRobot::new(model, solver, end_effector))
}

/// Analytic inverse kinematics for spherical-wrist 6R arms.
///
/// The eight closed-form branches are indexed by `which_root`: bit 0 flips
/// the shoulder, bit 1 the elbow, bit 2 the wrist. The selected branch
/// seeds the mechanism before a Newton refinement against the end-effector
/// target; the refinement also writes the measured motion positions back.
#[derive(Debug)]
pub struct SphericalWristIkSolver {
    param: SphericalWristParam,
    which_root: usize,
    seed: ForwardKinematicSolver,
    refine: DiagonalSolver,
}

impl SphericalWristIkSolver {
    pub fn new(param: SphericalWristParam) -> Self {
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

        let w0 = p.wrist_center();
        let x6 = target * p.flange().inverse();
        let wrist = x6 * w0;

        // Base angle: the arm plane sits at lateral offset d3.
        let radius2 = wrist.x * wrist.x + wrist.y * wrist.y;
        let lateral2 = p.d3 * p.d3;
        if radius2 < lateral2 {
            return Err(SolveError::Unreachable);
        }
        let reach = shoulder * (radius2 - lateral2).sqrt();
        let q1 = fph::atan2(wrist.y, wrist.x) - fph::atan2(p.d3, reach);

        // Planar two-link from the shoulder, measured from vertical.
        let x_p = reach - p.a1;
        let z_p = wrist.z - p.d1;
        let l2 = fph::hypot(p.a3, p.d4);
        let phi = fph::atan2(p.a3, p.d4);
        let c = (x_p * x_p + z_p * z_p - p.a2 * p.a2 - l2 * l2) / (2.0 * p.a2 * l2);
        if c.abs() > 1.0 + 1e-12 {
            return Err(SolveError::Unreachable);
        }
        let gamma = elbow * c.clamp(-1.0, 1.0).acos();
        let q3 = gamma - phi;
        let q2 = fph::atan2(x_p, z_p)
            - fph::atan2(l2 * gamma.sin(), p.a2 + l2 * gamma.cos());

        // Wrist z-y-z from the residual rotation.
        let r03 = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), q1)
            * UnitQuaternion::from_axis_angle(&Vector3::y_axis(), q2 + q3);
        let r36 = r03.inverse() * x6.rotation;
        let [mut q4, mut q5, mut q6] = rotation_to_euler(&r36, EulerOrder::parse("323"));
        if wrist_flip < 0.0 {
            q4 += std::f64::consts::PI;
            q5 = -q5;
            q6 += std::f64::consts::PI;
        }

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

impl Solver for SphericalWristIkSolver {
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
    use nalgebra::vector;

    #[test]
    fn should_reach_flange_pose_in_zero_configuration() {
        let param = SphericalWristParam::default();
        let flange = param.flange();
        assert_abs_diff_eq!(
            flange.translation.vector,
            vector![
                param.a1 + param.a3,
                param.d3,
                param.d1 + param.a2 + param.d4 + 0.1
            ],
            epsilon = 1e-12
        );
    }

    #[test]
    fn should_return_zero_branch_for_zero_target() {
        let param = SphericalWristParam::default();
        let solver = SphericalWristIkSolver::new(param.clone());
        let q = solver.branch_positions(&param.flange(), 0).unwrap();
        for value in q {
            assert_abs_diff_eq!(value, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn should_reject_target_inside_lateral_offset() {
        let mut param = SphericalWristParam::default();
        param.d3 = 0.2;
        let solver = SphericalWristIkSolver::new(param.clone());
        // A target directly above the base axis leaves the wrist center
        // with less lateral clearance than d3 requires.
        let interior = Pose::from_parts(
            Translation3::new(0.0, 0.0, param.d1 + param.a2 + param.d4 + 0.1),
            UnitQuaternion::identity(),
        );
        assert_eq!(
            solver.branch_positions(&interior, 0),
            Err(SolveError::Unreachable)
        );
    }

    #[test]
    #[should_panic]
    fn should_reject_branch_out_of_range() {
        let solver = SphericalWristIkSolver::new(SphericalWristParam::default());
        solver.branch_positions(&Pose::identity(), 8).unwrap();
    }
}
