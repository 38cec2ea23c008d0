//! The constraint assembly contract: per-constraint constraint matrices and
//! position/velocity/acceleration residuals, and their stacking into the
//! global system blocks.
//!
//! Every constraint of dimension d exposes, through [`ConstraintEval`]:
//! a 6×d world-frame constraint matrix for part M (part N's block is its
//! negation), the d position residuals to drive to zero, and the velocity
//! and acceleration right-hand sides including velocity-product terms.

use crate::DriveMode;
use armature_math::{
    Pose, SpatialMatrix, Twist, fph, put_into_period,
    screw::{angular, cross_twist, cross_wrench, screw_log, tf_twist, tf_wrench},
};
use armature_model::{JointKind, Model};
use nalgebra::{DMatrix, DVector, Vector3};

/// Reference to one constraint of the model.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConstraintRef {
    Joint(usize),
    Motion(usize),
    GeneralMotion(usize),
}

/// One evaluated constraint: world-frame constraint matrix and residuals.
/// Only the leading `dim` columns/entries are meaningful.
#[derive(Clone, Debug)]
pub struct ConstraintEval {
    pub dim: usize,
    /// World-frame 6×d constraint matrix of part M; part N's is `-cm_i`.
    pub cm_i: SpatialMatrix,
    /// Position residuals.
    pub cp: [fph; 6],
    /// Velocity right-hand side.
    pub cv: [fph; 6],
    /// Acceleration right-hand side (velocity-product terms included).
    pub ca: [fph; 6],
}

/// One constraint placed in the global system.
#[derive(Copy, Clone, Debug)]
pub struct ConstraintSlot {
    pub reference: ConstraintRef,
    pub dim: usize,
    /// Part M's model index, or `None` for the ground.
    pub part_m: Option<usize>,
    /// Part N's model index, or `None` for the ground.
    pub part_n: Option<usize>,
    /// First column of this constraint in the global constraint matrix.
    pub col: usize,
}

/// Index of the active parts and constraints of a model under a given drive
/// mode, fixing the global matrix layout.
#[derive(Clone, Debug)]
pub struct Assembly {
    mode: DriveMode,
    slots: Vec<ConstraintSlot>,
    /// Model part index -> row block, `None` for ground.
    part_blocks: Vec<Option<usize>>,
    /// Row block -> model part index.
    block_parts: Vec<usize>,
    n_cols: usize,
}

impl Assembly {
    /// Indexes the model's active constraints for the given drive mode.
    pub fn analyze(model: &Model, mode: DriveMode) -> Self {
        let mut part_blocks = vec![None; model.n_parts()];
        let mut block_parts = Vec::with_capacity(model.n_parts().saturating_sub(1));
        for index in 1..model.n_parts() {
            part_blocks[index] = Some(block_parts.len());
            block_parts.push(index);
        }

        let mut slots = Vec::new();
        let mut col = 0;
        let part_of = |model: &Model, part: armature_model::PartId| {
            if part == Model::GROUND {
                None
            } else {
                Some(part.index())
            }
        };

        for (index, joint) in model.joints().iter().enumerate() {
            if !joint.is_active() {
                continue;
            }
            slots.push(ConstraintSlot {
                reference: ConstraintRef::Joint(index),
                dim: joint.dim(),
                part_m: part_of(model, joint.mak_i().part()),
                part_n: part_of(model, joint.mak_j().part()),
                col,
            });
            col += joint.dim();
        }
        if mode == DriveMode::Motions {
            for (index, motion) in model.motions().iter().enumerate() {
                if !motion.is_active() {
                    continue;
                }
                slots.push(ConstraintSlot {
                    reference: ConstraintRef::Motion(index),
                    dim: 1,
                    part_m: part_of(model, motion.mak_i().part()),
                    part_n: part_of(model, motion.mak_j().part()),
                    col,
                });
                col += 1;
            }
        }
        if mode == DriveMode::GeneralMotions {
            for (index, gm) in model.general_motions().iter().enumerate() {
                if !gm.is_active() {
                    continue;
                }
                slots.push(ConstraintSlot {
                    reference: ConstraintRef::GeneralMotion(index),
                    dim: 6,
                    part_m: part_of(model, gm.mak_i().part()),
                    part_n: part_of(model, gm.mak_j().part()),
                    col,
                });
                col += 6;
            }
        }

        Self {
            mode,
            slots,
            part_blocks,
            block_parts,
            n_cols: col,
        }
    }

    pub fn mode(&self) -> DriveMode {
        self.mode
    }

    /// Total constraint dimension (columns of the global constraint matrix).
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    /// Rows of the global constraint matrix (6 per non-ground part).
    pub fn n_rows(&self) -> usize {
        6 * self.block_parts.len()
    }

    /// The indexed constraints.
    pub fn slots(&self) -> &[ConstraintSlot] {
        &self.slots
    }

    /// Model part indices of the non-ground parts, in row-block order.
    pub fn block_parts(&self) -> &[usize] {
        &self.block_parts
    }

    /// The row block of a model part, `None` for the ground.
    pub fn part_block(&self, part_index: usize) -> Option<usize> {
        self.part_blocks[part_index]
    }

    /// Writes the global constraint matrix into `cm` (`n_rows` × `n_cols`).
    ///
    /// # Panics
    /// If `cm` has the wrong shape.
    pub fn eval_cm_into(&self, model: &Model, cm: &mut DMatrix<fph>) {
        assert_eq!(cm.shape(), (self.n_rows(), self.n_cols), "cm shape mismatch");
        cm.fill(0.0);
        for slot in &self.slots {
            let eval = eval_constraint(model, slot.reference);
            for col in 0..slot.dim {
                let column = eval.cm_i.column(col);
                if let Some(part) = slot.part_m {
                    let block = self.part_blocks[part].unwrap();
                    for row in 0..6 {
                        cm[(6 * block + row, slot.col + col)] += column[row];
                    }
                }
                if let Some(part) = slot.part_n {
                    let block = self.part_blocks[part].unwrap();
                    for row in 0..6 {
                        cm[(6 * block + row, slot.col + col)] -= column[row];
                    }
                }
            }
        }
    }

    /// Writes the stacked position residuals into `cp` (`n_cols` long).
    pub fn eval_cp_into(&self, model: &Model, cp: &mut DVector<fph>) {
        assert_eq!(cp.len(), self.n_cols, "cp length mismatch");
        for slot in &self.slots {
            let eval = eval_constraint(model, slot.reference);
            for k in 0..slot.dim {
                cp[slot.col + k] = eval.cp[k];
            }
        }
    }

    /// Writes the stacked velocity right-hand side into `cv`.
    pub fn eval_cv_into(&self, model: &Model, cv: &mut DVector<fph>) {
        assert_eq!(cv.len(), self.n_cols, "cv length mismatch");
        for slot in &self.slots {
            let eval = eval_constraint(model, slot.reference);
            for k in 0..slot.dim {
                cv[slot.col + k] = eval.cv[k];
            }
        }
    }

    /// Writes the stacked acceleration right-hand side into `ca`.
    pub fn eval_ca_into(&self, model: &Model, ca: &mut DVector<fph>) {
        assert_eq!(ca.len(), self.n_cols, "ca length mismatch");
        for slot in &self.slots {
            let eval = eval_constraint(model, slot.reference);
            for k in 0..slot.dim {
                ca[slot.col + k] = eval.ca[k];
            }
        }
    }

    /// Distributes a solved constraint-force vector back onto the model's
    /// constraints: joint and general-motion Lagrange forces, and the
    /// dynamic part of motor forces.
    pub fn write_constraint_forces(&self, model: &mut Model, cf: &DVector<fph>) {
        assert_eq!(cf.len(), self.n_cols, "cf length mismatch");
        for slot in &self.slots {
            match slot.reference {
                ConstraintRef::Joint(index) => {
                    let mut forces = [0.0; 6];
                    forces[..slot.dim].copy_from_slice(cf.as_slice().get(slot.col..slot.col + slot.dim).unwrap());
                    model.joints_mut()[index].set_constraint_force(&forces[..slot.dim]);
                }
                ConstraintRef::Motion(index) => {
                    model.motions_mut()[index].set_mf_dyn(cf[slot.col]);
                }
                ConstraintRef::GeneralMotion(index) => {
                    let mut forces = [0.0; 6];
                    forces.copy_from_slice(cf.as_slice().get(slot.col..slot.col + 6).unwrap());
                    model.general_motions_mut()[index].set_constraint_force(&forces);
                }
            }
        }
    }
}

/// Evaluates one constraint against the current model state.
pub fn eval_constraint(model: &Model, reference: ConstraintRef) -> ConstraintEval {
    match reference {
        ConstraintRef::Joint(index) => eval_joint(model, index),
        ConstraintRef::Motion(index) => eval_motion(model, index),
        ConstraintRef::GeneralMotion(index) => eval_general_motion(model, index),
    }
}

fn eval_joint(model: &Model, index: usize) -> ConstraintEval {
    let joint = &model.joints()[index];
    let w_i = model.marker_world_pose(joint.mak_i());
    let w_j = model.marker_world_pose(joint.mak_j());
    let vs_m = *model.part(joint.mak_i().part()).velocity();
    let vs_n = *model.part(joint.mak_j().part()).velocity();

    let x_ij = w_i.inverse() * w_j;
    let local = joint.local_cm(&x_ij);
    let dim = joint.dim();

    let mut cm_i = SpatialMatrix::zeros();
    for k in 0..dim {
        let column = tf_wrench(&w_i, &local.column(k).into_owned());
        cm_i.column_mut(k).copy_from(&column);
    }

    let xi = screw_log(&(w_j.inverse() * w_i));
    let cross = cross_twist(&vs_m, &vs_n);

    let mut eval = ConstraintEval {
        dim,
        cm_i,
        cp: [0.0; 6],
        cv: [0.0; 6],
        ca: [0.0; 6],
    };
    for k in 0..dim {
        eval.cp[k] = local.column(k).dot(&xi);
        eval.ca[k] = -eval.cm_i.column(k).dot(&cross);
    }

    if joint.kind() == JointKind::Universal {
        // The orthogonality constraint's direction moves with both parts;
        // its residual and acceleration term need the exact derivative of
        // the normalized normal z_i × z_j.
        let z_i = w_i.rotation * Vector3::z();
        let z_j = w_j.rotation * Vector3::z();
        eval.cp[3] = z_i.dot(&z_j).clamp(-1.0, 1.0).asin();

        let normal = z_i.cross(&z_j);
        let norm = normal.norm();
        if norm > 1e-9 {
            let unit = normal / norm;
            let omega_m = angular(&vs_m);
            let omega_n = angular(&vs_n);
            let normal_dot =
                omega_m.cross(&z_i).cross(&z_j) + z_i.cross(&omega_n.cross(&z_j));
            let unit_dot = (normal_dot - unit * unit.dot(&normal_dot)) / norm;
            eval.ca[3] = -(omega_m - omega_n).dot(&unit_dot);
        }
    }

    eval
}

fn eval_motion(model: &Model, index: usize) -> ConstraintEval {
    let motion = &model.motions()[index];
    let w_i = model.marker_world_pose(motion.mak_i());
    let w_j = model.marker_world_pose(motion.mak_j());
    let vs_m = *model.part(motion.mak_i().part()).velocity();
    let vs_n = *model.part(motion.mak_j().part()).velocity();

    let mut local = Twist::zeros();
    local[motion.axis()] = 1.0;
    let mut cm_i = SpatialMatrix::zeros();
    cm_i.column_mut(0).copy_from(&tf_wrench(&w_i, &local));

    let xi = screw_log(&(w_j.inverse() * w_i));
    let current = if motion.is_rotational() {
        put_into_period(xi[motion.axis()], motion.mp())
    } else {
        xi[motion.axis()]
    };

    let cross = cross_twist(&vs_m, &vs_n);
    let mut eval = ConstraintEval {
        dim: 1,
        cm_i,
        cp: [0.0; 6],
        cv: [0.0; 6],
        ca: [0.0; 6],
    };
    eval.cp[0] = current - motion.mp();
    eval.cv[0] = motion.mv();
    eval.ca[0] = motion.ma() - eval.cm_i.column(0).dot(&cross);
    eval
}

fn eval_general_motion(model: &Model, index: usize) -> ConstraintEval {
    let gm = &model.general_motions()[index];
    let w_i = model.marker_world_pose(gm.mak_i());
    let w_j = model.marker_world_pose(gm.mak_j());
    let vs_m = *model.part(gm.mak_i().part()).velocity();
    let vs_n = *model.part(gm.mak_j().part()).velocity();

    let x_ij = w_i.inverse() * w_j;
    let w_i_inv = w_i.inverse();

    let mut cm_i = SpatialMatrix::zeros();
    for k in 0..6 {
        let mut local = Twist::zeros();
        local[k] = 1.0;
        cm_i.column_mut(k).copy_from(&tf_wrench(&w_i, &local));
    }

    let relative = w_j.inverse() * w_i;
    let cp = screw_log(&(gm.target_pose().inverse() * relative));

    // Prescribed relative twist and its derivative are given in the mak_j
    // frame; the constraint rows live in the mak_i frame.
    let eta = tf_twist(&w_j.inverse(), &(vs_n - vs_m));
    let cv = tf_twist(&x_ij, gm.target_velocity());
    let ca = tf_twist(
        &x_ij,
        &(gm.target_acceleration() + cross_twist(&eta, gm.target_velocity())),
    ) - tf_twist(&w_i_inv, &cross_twist(&vs_m, &vs_n));

    let mut eval = ConstraintEval {
        dim: 6,
        cm_i,
        cp: [0.0; 6],
        cv: [0.0; 6],
        ca: [0.0; 6],
    };
    for k in 0..6 {
        eval.cp[k] = cp[k];
        eval.cv[k] = cv[k];
        eval.ca[k] = ca[k];
    }
    eval
}

/// The 6×d constraint blocks of a constraint in part M and part N
/// coordinates (`cm_j = -tf_wrench(pm_N←M)·cm_i` column by column). Used by
/// part-frame assemblies and tests.
pub fn part_cm(model: &Model, reference: ConstraintRef) -> (SpatialMatrix, SpatialMatrix) {
    let (mak_i, mak_j, local, dim) = match reference {
        ConstraintRef::Joint(index) => {
            let joint = &model.joints()[index];
            let w_i = model.marker_world_pose(joint.mak_i());
            let w_j = model.marker_world_pose(joint.mak_j());
            let x_ij = w_i.inverse() * w_j;
            (joint.mak_i(), joint.mak_j(), joint.local_cm(&x_ij), joint.dim())
        }
        ConstraintRef::Motion(index) => {
            let motion = &model.motions()[index];
            (motion.mak_i(), motion.mak_j(), motion.local_cm(), 1)
        }
        ConstraintRef::GeneralMotion(index) => {
            let gm = &model.general_motions()[index];
            (gm.mak_i(), gm.mak_j(), gm.local_cm(), 6)
        }
    };

    let part_m = model.part(mak_i.part());
    let part_n = model.part(mak_j.part());
    let marker_local = *model.marker(mak_i).local_pose();
    let m_to_n = part_n.pose().inverse() * part_m.pose();

    let mut cm_m = SpatialMatrix::zeros();
    let mut cm_n = SpatialMatrix::zeros();
    for k in 0..dim {
        let in_part_m = tf_wrench(&marker_local, &local.column(k).into_owned());
        cm_m.column_mut(k).copy_from(&in_part_m);
        cm_n.column_mut(k).copy_from(&-tf_wrench(&m_to_n, &in_part_m));
    }
    (cm_m, cm_n)
}

/// The joint coordinate implied by the current marker poses, continuous
/// with the motion's previous position for rotational axes.
pub fn measured_motion_position(model: &Model, index: usize) -> fph {
    let motion = &model.motions()[index];
    let w_i = model.marker_world_pose(motion.mak_i());
    let w_j = model.marker_world_pose(motion.mak_j());
    let xi = screw_log(&(w_j.inverse() * w_i));
    if motion.is_rotational() {
        put_into_period(xi[motion.axis()], motion.mp())
    } else {
        xi[motion.axis()]
    }
}

/// The joint rate implied by the current part velocities.
pub fn measured_motion_velocity(model: &Model, index: usize) -> fph {
    let eval = eval_motion(model, index);
    let vs_m = *model.part(model.motions()[index].mak_i().part()).velocity();
    let vs_n = *model.part(model.motions()[index].mak_j().part()).velocity();
    eval.cm_i.column(0).dot(&(vs_m - vs_n))
}

/// The joint acceleration implied by the current part accelerations.
pub fn measured_motion_acceleration(model: &Model, index: usize) -> fph {
    let motion = &model.motions()[index];
    let eval = eval_motion(model, index);
    let as_m = *model.part(motion.mak_i().part()).acceleration();
    let as_n = *model.part(motion.mak_j().part()).acceleration();
    let vs_m = *model.part(motion.mak_i().part()).velocity();
    let vs_n = *model.part(motion.mak_j().part()).velocity();
    eval.cm_i.column(0).dot(&(as_m - as_n))
        + eval.cm_i.column(0).dot(&cross_twist(&vs_m, &vs_n))
}

/// Stacks the generalized applied force of every non-ground part (gravity,
/// velocity-product term, applied forces and, in force-driven mode, motor
/// loads) into `pf`, refreshing `world_inertias` alongside.
pub(crate) fn assemble_part_forces(
    model: &mut Model,
    assembly: &Assembly,
    mode: DriveMode,
    pf: &mut DVector<fph>,
    world_inertias: &mut [SpatialMatrix],
) {
    assert_eq!(pf.len(), assembly.n_rows(), "pf length mismatch");
    model.update_force_wrenches();
    let gravity = *model.environment().gravity();

    for (block, &part_index) in assembly.block_parts().iter().enumerate() {
        let part = model.part(model.part_id(part_index));
        let inertia = part.world_inertia();
        let velocity = *part.velocity();
        let gravity_force = inertia * gravity;
        let velocity_force = cross_wrench(&velocity, &(inertia * velocity));
        let net = gravity_force - velocity_force;
        for row in 0..6 {
            pf[6 * block + row] = net[row];
        }
        world_inertias[block] = inertia;
    }

    for force in model.forces() {
        if !force.is_active() {
            continue;
        }
        for (marker, wrench) in [(force.mak_i(), force.fs_i()), (force.mak_j(), force.fs_j())] {
            if let Some(block) = assembly.part_block(marker.part().index()) {
                for row in 0..6 {
                    pf[6 * block + row] += wrench[row];
                }
            }
        }
    }

    if mode == DriveMode::Forces {
        for index in 0..model.motions().len() {
            if !model.motions()[index].is_active() {
                continue;
            }
            let eval = eval_constraint(model, ConstraintRef::Motion(index));
            let wrench = eval.cm_i.column(0) * model.motions()[index].mf_dyn();
            let motion = &model.motions()[index];
            if let Some(block) = assembly.part_block(motion.mak_i().part().index()) {
                for row in 0..6 {
                    pf[6 * block + row] += wrench[row];
                }
            }
            if let Some(block) = assembly.part_block(motion.mak_j().part().index()) {
                for row in 0..6 {
                    pf[6 * block + row] -= wrench[row];
                }
            }
        }
    }
}

/// Writes measured joint positions (inverse kinematics) or end-effector
/// poses (forward kinematics) back onto the constraints that were not part
/// of the solve.
pub(crate) fn update_measured_positions(model: &mut Model, mode: DriveMode) {
    match mode {
        DriveMode::GeneralMotions => {
            for index in 0..model.motions().len() {
                let mp = measured_motion_position(model, index);
                model.motions_mut()[index].set_mp(mp);
            }
        }
        DriveMode::Motions => {
            for index in 0..model.general_motions().len() {
                let (pose, _, _) = measured_general_motion(model, index);
                model.general_motions_mut()[index].set_target_pose(pose);
            }
        }
        DriveMode::Forces => {}
    }
}

/// Velocity counterpart of [`update_measured_positions`].
pub(crate) fn update_measured_velocities(model: &mut Model, mode: DriveMode) {
    match mode {
        DriveMode::GeneralMotions => {
            for index in 0..model.motions().len() {
                let mv = measured_motion_velocity(model, index);
                model.motions_mut()[index].set_mv(mv);
            }
        }
        DriveMode::Motions => {
            for index in 0..model.general_motions().len() {
                let (_, velocity, _) = measured_general_motion(model, index);
                model.general_motions_mut()[index].set_target_velocity(velocity);
            }
        }
        DriveMode::Forces => {}
    }
}

/// Acceleration counterpart of [`update_measured_positions`]. In force-driven
/// mode the motions' accelerations are measured as well.
pub(crate) fn update_measured_accelerations(model: &mut Model, mode: DriveMode) {
    match mode {
        DriveMode::GeneralMotions => {
            for index in 0..model.motions().len() {
                let ma = measured_motion_acceleration(model, index);
                model.motions_mut()[index].set_ma(ma);
            }
        }
        DriveMode::Motions | DriveMode::Forces => {
            if mode == DriveMode::Forces {
                for index in 0..model.motions().len() {
                    let ma = measured_motion_acceleration(model, index);
                    model.motions_mut()[index].set_ma(ma);
                }
            }
            for index in 0..model.general_motions().len() {
                let (_, _, acceleration) = measured_general_motion(model, index);
                model.general_motions_mut()[index].set_target_acceleration(acceleration);
            }
        }
    }
}

/// The relative pose, velocity and acceleration of a general motion's
/// end-effector marker implied by the current part states, in the frames
/// its targets use.
pub fn measured_general_motion(model: &Model, index: usize) -> (Pose, Twist, Twist) {
    let gm = &model.general_motions()[index];
    let w_i = model.marker_world_pose(gm.mak_i());
    let w_j = model.marker_world_pose(gm.mak_j());
    let vs_m = *model.part(gm.mak_i().part()).velocity();
    let vs_n = *model.part(gm.mak_j().part()).velocity();
    let as_m = *model.part(gm.mak_i().part()).acceleration();
    let as_n = *model.part(gm.mak_j().part()).acceleration();

    let pose = w_j.inverse() * w_i;
    let w_j_inv = w_j.inverse();
    let velocity = tf_twist(&w_j_inv, &(vs_m - vs_n));
    // Differentiates velocity's defining relation: the frame-J projection
    // picks up a convective term from part N's motion.
    let acceleration = tf_twist(&w_j_inv, &(as_m - as_n))
        - tf_twist(&w_j_inv, &cross_twist(&vs_n, &(vs_m - vs_n)));
    (pose, velocity, acceleration)
}
