//! Prescribed motions: scalar joint drives and full 6-DOF end-effector
//! targets.

use crate::part::MarkerId;
use armature_math::{EulerOrder, Pose, SpatialMatrix, Twist, Wrench, euler, fph};

/// Friction coefficients `[coulomb, viscous, inertial]` of a motion, giving
/// the friction force `sign(mv)·c₀ + mv·c₁ + ma·c₂`.
pub type FrictionCoefficients = [fph; 3];

/// Steepness of the `tanh` regularization used where a Newton iteration
/// must differentiate through the Coulomb term. At |mv| ≥ 1e-3 the
/// regularization error is below 4e-9 times the Coulomb coefficient.
pub const FRICTION_SMOOTHING: fph = 1e4;

/// A 1-DOF prescribed constraint along one spatial axis of a joint.
///
/// The axis index is ω-first: 0..3 are rotations about x, y, z and 3..6 are
/// translations along x, y, z of the `mak_i` frame. A motion on a revolute
/// joint drives axis 2, on a prismatic joint axis 5.
#[derive(Clone, Debug)]
pub struct Motion {
    name: String,
    mak_i: MarkerId,
    mak_j: MarkerId,
    axis: usize,
    mp: fph,
    mv: fph,
    ma: fph,
    mf_dyn: fph,
    frc_coe: FrictionCoefficients,
    active: bool,
}

impl Motion {
    pub(crate) fn new(name: String, mak_i: MarkerId, mak_j: MarkerId, axis: usize) -> Self {
        assert!(axis < 6, "motion axis must be in 0..6");
        Self {
            name,
            mak_i,
            mak_j,
            axis,
            mp: 0.0,
            mv: 0.0,
            ma: 0.0,
            mf_dyn: 0.0,
            frc_coe: [0.0; 3],
            active: true,
        }
    }

    /// The name of the motion, unique within the model's motion pool.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mak_i(&self) -> MarkerId {
        self.mak_i
    }

    pub fn mak_j(&self) -> MarkerId {
        self.mak_j
    }

    /// The driven spatial axis in the `mak_i` frame (ω-first indexing).
    pub fn axis(&self) -> usize {
        self.axis
    }

    /// Whether the driven axis is rotational.
    pub fn is_rotational(&self) -> bool {
        self.axis < 3
    }

    /// The commanded (or measured) position.
    pub fn mp(&self) -> fph {
        self.mp
    }

    pub fn set_mp(&mut self, mp: fph) {
        self.mp = mp;
    }

    /// The commanded (or measured) velocity.
    pub fn mv(&self) -> fph {
        self.mv
    }

    pub fn set_mv(&mut self, mv: fph) {
        self.mv = mv;
    }

    /// The commanded (or measured) acceleration.
    pub fn ma(&self) -> fph {
        self.ma
    }

    pub fn set_ma(&mut self, ma: fph) {
        self.ma = ma;
    }

    /// The dynamic part of the motor force (the constraint force of this
    /// motion, excluding friction).
    pub fn mf_dyn(&self) -> fph {
        self.mf_dyn
    }

    pub fn set_mf_dyn(&mut self, mf_dyn: fph) {
        self.mf_dyn = mf_dyn;
    }

    /// The total motor force: dynamic force plus friction.
    pub fn mf(&self) -> fph {
        self.mf_dyn + self.friction_force()
    }

    /// Sets the total motor force by storing `mf` minus the current
    /// friction force as the dynamic part.
    pub fn set_mf(&mut self, mf: fph) {
        self.mf_dyn = mf - self.friction_force();
    }

    /// The friction force at the current velocity and acceleration, with an
    /// exact Coulomb sign (zero at zero velocity).
    pub fn friction_force(&self) -> fph {
        let sign = if self.mv == 0.0 { 0.0 } else { self.mv.signum() };
        sign * self.frc_coe[0] + self.mv * self.frc_coe[1] + self.ma * self.frc_coe[2]
    }

    /// The friction force with the Coulomb term regularized by
    /// `tanh(FRICTION_SMOOTHING·mv)`, differentiable for Newton iterations.
    pub fn smooth_friction_force(&self) -> fph {
        (FRICTION_SMOOTHING * self.mv).tanh() * self.frc_coe[0]
            + self.mv * self.frc_coe[1]
            + self.ma * self.frc_coe[2]
    }

    /// The friction coefficients `[coulomb, viscous, inertial]`.
    pub fn frc_coe(&self) -> &FrictionCoefficients {
        &self.frc_coe
    }

    pub fn set_frc_coe(&mut self, frc_coe: FrictionCoefficients) {
        self.frc_coe = frc_coe;
    }

    /// Whether the motion participates in solves.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// The 6×1 constraint matrix in the `mak_i` frame: the unit wrench dual
    /// to the driven axis. Only the leading column is meaningful.
    pub fn local_cm(&self) -> SpatialMatrix {
        let mut cm = SpatialMatrix::zeros();
        cm[(self.axis, 0)] = 1.0;
        cm
    }
}

/// A 6-DOF prescribed relative pose, velocity, acceleration and force
/// between an end-effector marker `mak_i` and a reference marker `mak_j`.
///
/// The target pose is the pose of `mak_i` in `mak_j` coordinates; target
/// velocity and acceleration are relative twists expressed in the `mak_j`
/// frame about its origin.
#[derive(Clone, Debug)]
pub struct GeneralMotion {
    name: String,
    mak_i: MarkerId,
    mak_j: MarkerId,
    target_pose: Pose,
    target_velocity: Twist,
    target_acceleration: Twist,
    target_force: Wrench,
    constraint_force: [fph; 6],
    active: bool,
}

impl GeneralMotion {
    pub(crate) fn new(name: String, mak_i: MarkerId, mak_j: MarkerId, target_pose: Pose) -> Self {
        Self {
            name,
            mak_i,
            mak_j,
            target_pose,
            target_velocity: Twist::zeros(),
            target_acceleration: Twist::zeros(),
            target_force: Wrench::zeros(),
            constraint_force: [0.0; 6],
            active: true,
        }
    }

    /// The name of the general motion, unique within its pool.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mak_i(&self) -> MarkerId {
        self.mak_i
    }

    pub fn mak_j(&self) -> MarkerId {
        self.mak_j
    }

    /// The constraint dimension (always 6).
    pub fn dim(&self) -> usize {
        6
    }

    /// The target pose of `mak_i` in `mak_j` coordinates.
    pub fn target_pose(&self) -> &Pose {
        &self.target_pose
    }

    pub fn set_target_pose(&mut self, target_pose: Pose) {
        self.target_pose = target_pose;
    }

    /// The target pose as `[x, y, z]` plus Euler angles of the given
    /// convention.
    pub fn target_pe(&self, order: EulerOrder) -> [fph; 6] {
        euler::pose_to_pe(&self.target_pose, order)
    }

    pub fn set_target_pe(&mut self, pe: &[fph; 6], order: EulerOrder) {
        self.target_pose = euler::pe_to_pose(pe, order);
    }

    /// The target pose as `[x, y, z, qx, qy, qz, qw]`.
    pub fn target_pq(&self) -> [fph; 7] {
        euler::pose_to_pq(&self.target_pose)
    }

    pub fn set_target_pq(&mut self, pq: &[fph; 7]) {
        self.target_pose = euler::pq_to_pose(pq);
    }

    /// The target relative twist in the `mak_j` frame.
    pub fn target_velocity(&self) -> &Twist {
        &self.target_velocity
    }

    pub fn set_target_velocity(&mut self, target_velocity: Twist) {
        self.target_velocity = target_velocity;
    }

    /// The target relative spatial acceleration in the `mak_j` frame.
    pub fn target_acceleration(&self) -> &Twist {
        &self.target_acceleration
    }

    pub fn set_target_acceleration(&mut self, target_acceleration: Twist) {
        self.target_acceleration = target_acceleration;
    }

    /// The prescribed constraint wrench for force-driven use.
    pub fn target_force(&self) -> &Wrench {
        &self.target_force
    }

    pub fn set_target_force(&mut self, target_force: Wrench) {
        self.target_force = target_force;
    }

    /// The constraint force written back by the last dynamics solve.
    pub fn constraint_force(&self) -> &[fph] {
        &self.constraint_force
    }

    pub fn set_constraint_force(&mut self, cf: &[fph]) {
        assert_eq!(cf.len(), 6, "constraint force dimension mismatch");
        self.constraint_force.copy_from_slice(cf);
    }

    /// Whether the general motion participates in solves.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// The 6×6 constraint matrix in the `mak_i` frame (the identity: every
    /// relative degree of freedom is prescribed).
    pub fn local_cm(&self) -> SpatialMatrix {
        SpatialMatrix::identity()
    }
}

/// Identifier of a motion within a model.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MotionId(pub(crate) usize);

impl MotionId {
    /// The position of the motion in the model's motion pool.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Identifier of a general motion within a model.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GeneralMotionId(pub(crate) usize);

impl GeneralMotionId {
    /// The position of the general motion in its pool.
    pub fn index(&self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::part::PartId;
    use approx::assert_abs_diff_eq;

    fn dummy_motion() -> Motion {
        let mak = MarkerId {
            part: PartId(0),
            index: 0,
        };
        Motion::new("m".into(), mak, mak, 2)
    }

    #[test]
    fn should_combine_dynamic_and_friction_force() {
        let mut motion = dummy_motion();
        motion.set_frc_coe([2.0, 0.5, 0.1]);
        motion.set_mv(3.0);
        motion.set_ma(-1.0);
        motion.set_mf_dyn(10.0);
        assert_abs_diff_eq!(motion.mf(), 10.0 + 2.0 + 1.5 - 0.1);
    }

    #[test]
    fn should_zero_coulomb_term_at_rest() {
        let mut motion = dummy_motion();
        motion.set_frc_coe([2.0, 0.5, 0.1]);
        assert_abs_diff_eq!(motion.friction_force(), 0.0);
    }

    #[test]
    fn should_flip_coulomb_term_with_velocity_sign() {
        let mut motion = dummy_motion();
        motion.set_frc_coe([2.0, 0.0, 0.0]);
        motion.set_mv(-0.5);
        assert_abs_diff_eq!(motion.friction_force(), -2.0);
    }

    #[test]
    fn should_keep_smoothed_friction_close_to_exact_one() {
        let mut motion = dummy_motion();
        motion.set_frc_coe([2.0, 0.5, 0.0]);
        motion.set_mv(0.01);
        assert_abs_diff_eq!(
            motion.smooth_friction_force(),
            motion.friction_force(),
            epsilon = 1e-8
        );
    }

    #[test]
    fn should_recover_total_force_after_setting_it() {
        let mut motion = dummy_motion();
        motion.set_frc_coe([1.0, 1.0, 0.0]);
        motion.set_mv(2.0);
        motion.set_mf(5.0);
        assert_abs_diff_eq!(motion.mf(), 5.0);
        assert_abs_diff_eq!(motion.mf_dyn(), 5.0 - 3.0);
    }
}
