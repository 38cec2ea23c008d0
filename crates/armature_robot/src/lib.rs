//! Serial-arm model templates and their analytic inverse-kinematics
//! solvers.
//!
//! Each template builds a ready [`Model`] (links, joints, motions and an
//! end-effector general motion, all from the arm's zero configuration) and
//! pairs it with the matching analytic solver. The analytic solvers compute
//! every closed-form branch, seed the mechanism with the selected one and
//! finish with a Newton refinement against the end-effector target.

mod seven_axis;
mod spherical_wrist;
mod ur;

pub use seven_axis::{SevenAxisIkSolver, SevenAxisParam, seven_axis};
pub use spherical_wrist::{SphericalWristIkSolver, SphericalWristParam, rokae_xb4, spherical_wrist_arm};
pub use ur::{UrIkSolver, UrParam, ur_arm};

use armature_math::{Pose, fph};
use armature_model::{GeneralMotionId, Model};
use armature_solver::{
    CombinedSolver, DriveMode, ForwardKinematicSolver, SolveError, SolveReport, Solver,
    SolverConfig,
};

/// A serial robot: a mechanism model bundled with its solver family.
///
/// The solver set mirrors the caller-facing operations: inverse kinematics
/// (target-driven, analytic where available), forward kinematics
/// (motion-driven tree sweep), inverse dynamics (motion-driven KKT) and
/// forward dynamics (force-driven KKT).
#[derive(Debug)]
pub struct SerialRobot<IK> {
    model: Model,
    pub inverse_solver: IK,
    pub forward_solver: ForwardKinematicSolver,
    pub dynamics_solver: CombinedSolver,
    pub forward_dynamics_solver: CombinedSolver,
    end_effector: GeneralMotionId,
}

impl<IK: Solver> SerialRobot<IK> {
    pub fn new(model: Model, inverse_solver: IK, end_effector: GeneralMotionId) -> Self {
        let config = SolverConfig::default();
        let mut robot = Self {
            model,
            inverse_solver,
            forward_solver: ForwardKinematicSolver::new(config),
            dynamics_solver: CombinedSolver::new(DriveMode::Motions, config),
            forward_dynamics_solver: CombinedSolver::new(DriveMode::Forces, config),
            end_effector,
        };
        robot.allocate();
        robot
    }

    /// Sizes every solver's scratch from the model topology. Call again
    /// after structural model edits.
    pub fn allocate(&mut self) {
        self.inverse_solver.allocate_buffers(&self.model);
        self.forward_solver.allocate_buffers(&self.model);
        self.dynamics_solver.allocate_buffers(&self.model);
        self.forward_dynamics_solver.allocate_buffers(&self.model);
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    /// The end-effector general motion.
    pub fn end_effector(&self) -> GeneralMotionId {
        self.end_effector
    }

    /// The end-effector target pose (in the reference part's frame).
    pub fn end_effector_pose(&self) -> &Pose {
        self.model.general_motion(self.end_effector).target_pose()
    }

    pub fn set_end_effector_pose(&mut self, pose: &Pose) {
        self.model.set_end_effector_pose(pose, self.end_effector);
    }

    /// Solves joint positions for the current end-effector target and
    /// writes them onto the motions.
    pub fn inverse_kinematics(&mut self) -> Result<SolveReport, SolveError> {
        self.inverse_solver.kin_pos(&mut self.model)
    }

    /// Solves part poses for the current motion positions and measures the
    /// end-effector pose.
    pub fn forward_kinematics(&mut self) -> Result<SolveReport, SolveError> {
        self.forward_solver.kin_pos(&mut self.model)
    }

    /// Velocity-level inverse kinematics from the end-effector target
    /// velocity.
    pub fn inverse_kinematics_vel(&mut self) -> Result<SolveReport, SolveError> {
        self.inverse_solver.kin_vel(&mut self.model)
    }

    /// Velocity-level forward kinematics from the motion velocities.
    pub fn forward_kinematics_vel(&mut self) -> Result<SolveReport, SolveError> {
        self.forward_solver.kin_vel(&mut self.model)
    }

    /// Inverse dynamics: from motion position/velocity/acceleration
    /// setpoints to motor forces (and part states).
    pub fn inverse_dynamics(&mut self) -> Result<SolveReport, SolveError> {
        self.forward_solver.kin_pos(&mut self.model)?;
        self.forward_solver.kin_vel(&mut self.model)?;
        self.dynamics_solver.dyn_acc_and_fce(&mut self.model)
    }

    /// Forward dynamics: from motion positions/velocities and motor forces
    /// to accelerations.
    pub fn forward_dynamics(&mut self) -> Result<SolveReport, SolveError> {
        self.forward_solver.kin_pos(&mut self.model)?;
        self.forward_solver.kin_vel(&mut self.model)?;
        self.forward_dynamics_solver.dyn_acc_and_fce(&mut self.model)
    }

    /// Motion positions, in pool order.
    pub fn motion_positions(&self) -> Vec<fph> {
        self.model.motion_positions()
    }

    pub fn set_motion_positions(&mut self, mp: &[fph]) {
        self.model.set_motion_positions(mp);
    }
}
