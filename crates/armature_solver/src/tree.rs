//! Tree-exploiting solvers.
//!
//! The constraint graph is partitioned into a spanning structure rooted at
//! the ground (one "diagonal" relation per part, solved block by block in
//! topological order) and the loop-closing "remainder" constraints, which
//! couple through a small reduced system on the spanning structure's free
//! axes. Dynamics recovers the joint constraint forces with a backward
//! sweep over the tree after the remainder forces are known.

use crate::{
    DriveMode, SolveError, SolveReport, Solver, SolverConfig,
    assembly::{
        ConstraintRef, eval_constraint, update_measured_accelerations,
        update_measured_positions, update_measured_velocities,
    },
};
use armature_math::{
    PivotedQr, Pose, SpatialMatrix, Twist, Wrench, fph,
    screw::{angular, cross_twist, cross_wrench, linear, screw_log, spatial, tf_wrench},
};
use armature_model::{JointKind, MarkerId, Model};
use log::trace;
use nalgebra::{DMatrix, DVector, Translation3, UnitQuaternion, Vector3};
use petgraph::graphmap::UnGraphMap;

/// Joint transform state of one spanning-tree relation.
#[derive(Clone, Debug)]
enum EdgeState {
    /// Revolute or prismatic: one absolute coordinate along the marker
    /// z-axis.
    Scalar { q: fph },
    /// Universal: two relative angles about the second and first marker
    /// z-axes, measured from the relative marker pose captured at sync.
    Universal { base: Pose, alpha: fph, beta: fph },
    /// Spherical: the relative marker pose itself, updated incrementally.
    Spherical { base: Pose },
}

/// One spanning-tree relation: a joint placing `child` relative to
/// `parent`, possibly driven by a motion.
#[derive(Clone, Debug)]
struct TreeEdge {
    joint: usize,
    child: usize,
    parent: usize,
    /// Whether the joint's `mak_i` sits on the child part.
    i_on_child: bool,
    kind: JointKind,
    /// Motion index driving the scalar axis, in motion-driven mode.
    driven: Option<usize>,
    state: EdgeState,
}

/// One scalar freedom of the spanning structure.
#[derive(Copy, Clone, Debug)]
enum DofAxis {
    ScalarZ,
    UniversalAlpha,
    UniversalBeta,
    /// Rotation about a world basis vector through the joint point.
    Spherical(usize),
}

#[derive(Copy, Clone, Debug)]
struct Dof {
    edge: usize,
    axis: DofAxis,
    driven: Option<usize>,
}

#[derive(Clone, Debug, Default)]
struct TreeIndex {
    edges: Vec<TreeEdge>,
    dofs: Vec<Dof>,
    /// Model part index -> dof indices on the path from the ground.
    part_paths: Vec<Vec<usize>>,
    remainder: Vec<ConstraintRef>,
    remainder_dim: usize,
    free_dofs: Vec<usize>,
    disconnected: bool,
}

/// The diagonal solver: spanning-tree elimination with a reduced dense
/// system for loop-closing constraints.
///
/// Supports motion-driven and target-driven solves; force-driven (forward
/// dynamics) mechanisms should use [`crate::CombinedSolver`].
#[derive(Debug)]
pub struct DiagonalSolver {
    mode: DriveMode,
    config: SolverConfig,
    tree: TreeIndex,
    jacobian: DMatrix<fph>,
    residuals: DVector<fph>,
    step: DVector<fph>,
    rates: Vec<fph>,
    accels: Vec<fph>,
    qr: PivotedQr,
    /// Per-part affine wrench accumulators for the backward force sweep.
    wrench_affine: Vec<DMatrix<fph>>,
    balance: DMatrix<fph>,
    balance_rhs: DVector<fph>,
    balance_qr: PivotedQr,
    remainder_forces: DVector<fph>,
}

impl DiagonalSolver {
    /// # Panics
    /// If `mode` is [`DriveMode::Forces`]; the tree elimination solves
    /// position/velocity/acceleration problems and inverse dynamics only.
    pub fn new(mode: DriveMode, config: SolverConfig) -> Self {
        assert!(
            mode != DriveMode::Forces,
            "the diagonal solver does not support force-driven mode"
        );
        Self {
            mode,
            config,
            tree: TreeIndex::default(),
            jacobian: DMatrix::zeros(0, 0),
            residuals: DVector::zeros(0),
            step: DVector::zeros(0),
            rates: Vec::new(),
            accels: Vec::new(),
            qr: PivotedQr::new(0, 0),
            wrench_affine: Vec::new(),
            balance: DMatrix::zeros(0, 0),
            balance_rhs: DVector::zeros(0),
            balance_qr: PivotedQr::new(0, 0),
            remainder_forces: DVector::zeros(0),
        }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn mode(&self) -> DriveMode {
        self.mode
    }

    fn ensure_connected(&self) -> Result<(), SolveError> {
        if self.tree.disconnected {
            Err(SolveError::Disconnected)
        } else {
            Ok(())
        }
    }

    /// Re-measures every edge coordinate from the current marker poses.
    fn sync(&mut self, model: &Model) {
        for edge in &mut self.tree.edges {
            let joint = &model.joints()[edge.joint];
            let w_i = model.marker_world_pose(joint.mak_i());
            let w_j = model.marker_world_pose(joint.mak_j());
            let relative = w_j.inverse() * w_i;
            match &mut edge.state {
                EdgeState::Scalar { q } => {
                    *q = if edge.kind == JointKind::Revolute {
                        screw_log(&relative)[2]
                    } else {
                        screw_log(&relative)[5]
                    };
                }
                EdgeState::Universal { base, alpha, beta } => {
                    *base = relative;
                    *alpha = 0.0;
                    *beta = 0.0;
                }
                EdgeState::Spherical { base } => {
                    *base = relative;
                }
            }
        }
    }

    /// Copies motion setpoints onto the driven edge coordinates.
    fn apply_driven_positions(&mut self, model: &Model) {
        for edge in &mut self.tree.edges {
            if let (Some(motion), EdgeState::Scalar { q }) = (edge.driven, &mut edge.state) {
                *q = model.motions()[motion].mp();
            }
        }
    }

    /// The relative marker pose `mak_i`-in-`mak_j` implied by an edge state.
    fn edge_transform(state: &EdgeState, kind: JointKind) -> Pose {
        match state {
            EdgeState::Scalar { q } => match kind {
                JointKind::Revolute => Pose::from_parts(
                    Translation3::identity(),
                    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), *q),
                ),
                _ => Pose::from_parts(
                    Translation3::new(0.0, 0.0, *q),
                    UnitQuaternion::identity(),
                ),
            },
            EdgeState::Universal { base, alpha, beta } => {
                let rot_alpha = Pose::from_parts(
                    Translation3::identity(),
                    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), *alpha),
                );
                let rot_beta = Pose::from_parts(
                    Translation3::identity(),
                    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), *beta),
                );
                rot_beta * base * rot_alpha
            }
            EdgeState::Spherical { base } => *base,
        }
    }

    /// Writes part poses down the tree from the edge coordinates.
    fn reconstruct(&self, model: &mut Model) {
        for edge in &self.tree.edges {
            let joint = &model.joints()[edge.joint];
            let transform = Self::edge_transform(&edge.state, edge.kind);
            let (child_marker, parent_marker, i_to_j) = if edge.i_on_child {
                (joint.mak_i(), joint.mak_j(), transform)
            } else {
                (joint.mak_j(), joint.mak_i(), transform.inverse())
            };
            let parent_pose = *model.part(model.part_id(edge.parent)).pose();
            let parent_local = *model.marker(parent_marker).local_pose();
            let child_local = *model.marker(child_marker).local_pose();
            let child_pose = parent_pose * parent_local * i_to_j * child_local.inverse();
            let id = model.part_id(edge.child);
            model.part_mut(id).set_pose(child_pose);
        }
    }

    /// The world twist of one freedom (motion of the child relative to the
    /// parent per unit rate).
    fn dof_twist(&self, model: &Model, dof: &Dof) -> Twist {
        let edge = &self.tree.edges[dof.edge];
        let joint = &model.joints()[edge.joint];
        let sign = if edge.i_on_child { 1.0 } else { -1.0 };
        let w_i = model.marker_world_pose(joint.mak_i());
        let w_j = model.marker_world_pose(joint.mak_j());
        let point = w_j.translation.vector;
        let twist = match dof.axis {
            DofAxis::ScalarZ => {
                let axis = w_i.rotation * Vector3::z();
                if edge.kind == JointKind::Prismatic {
                    spatial(Vector3::zeros(), axis)
                } else {
                    spatial(axis, point.cross(&axis))
                }
            }
            DofAxis::UniversalAlpha => {
                let axis = w_i.rotation * Vector3::z();
                spatial(axis, point.cross(&axis))
            }
            DofAxis::UniversalBeta => {
                let axis = w_j.rotation * Vector3::z();
                spatial(axis, point.cross(&axis))
            }
            DofAxis::Spherical(k) => {
                let mut axis = Vector3::zeros();
                axis[k] = 1.0;
                spatial(axis, point.cross(&axis))
            }
        };
        twist * sign
    }

    /// The rate of change of a freedom's twist, from the velocity of the
    /// body carrying its axis.
    fn dof_twist_rate(&self, model: &Model, dof: &Dof) -> Twist {
        let edge = &self.tree.edges[dof.edge];
        let joint = &model.joints()[edge.joint];
        let twist = self.dof_twist(model, dof);
        let carrier = match dof.axis {
            // The scalar axis is common to both markers; the parent carries
            // it. The universal axes are fixed to their own markers.
            DofAxis::ScalarZ => edge.parent,
            DofAxis::UniversalAlpha => joint.mak_i().part().index(),
            DofAxis::UniversalBeta => joint.mak_j().part().index(),
            DofAxis::Spherical(_) => {
                // The basis direction is world-fixed; only the joint point
                // moves, with the parent part.
                let parent_velocity = *model.part(model.part_id(edge.parent)).velocity();
                let w_j = model.marker_world_pose(joint.mak_j());
                let point = w_j.translation.vector;
                let point_velocity =
                    linear(&parent_velocity) + angular(&parent_velocity).cross(&point);
                let axis = angular(&twist);
                return spatial(Vector3::zeros(), point_velocity.cross(&axis));
            }
        };
        let carrier_velocity = *model.part(model.part_id(carrier)).velocity();
        cross_twist(&carrier_velocity, &twist)
    }

    fn path_contains(&self, part: Option<usize>, dof_index: usize) -> fph {
        match part {
            Some(part) => {
                if self.tree.part_paths[part].contains(&dof_index) {
                    1.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    fn slot_parts(&self, model: &Model, reference: ConstraintRef) -> (Option<usize>, Option<usize>) {
        let (mak_i, mak_j) = constraint_markers(model, reference);
        let to_index = |mak: MarkerId| {
            if mak.part() == Model::GROUND {
                None
            } else {
                Some(mak.part().index())
            }
        };
        (to_index(mak_i), to_index(mak_j))
    }

    /// Builds the reduced Jacobian of the remainder residuals with respect
    /// to the free dofs.
    fn fill_reduced_jacobian(&mut self, model: &Model) {
        let free = std::mem::take(&mut self.tree.free_dofs);
        let mut row = 0;
        for &reference in &self.tree.remainder {
            let eval = eval_constraint(model, reference);
            let (part_m, part_n) = self.slot_parts(model, reference);
            for k in 0..eval.dim {
                for (col, &dof_index) in free.iter().enumerate() {
                    let factor = self.path_contains(part_m, dof_index)
                        - self.path_contains(part_n, dof_index);
                    let value = if factor == 0.0 {
                        0.0
                    } else {
                        let twist = self.dof_twist(model, &self.tree.dofs[dof_index]);
                        factor * eval.cm_i.column(k).dot(&twist)
                    };
                    self.jacobian[(row, col)] = value;
                }
                row += 1;
            }
        }
        self.tree.free_dofs = free;
    }

    /// Writes the accumulated `Σ s·value (+ extra)` of each part's path as
    /// its spatial velocity or acceleration.
    fn accumulate_paths(
        &self,
        model: &mut Model,
        values: &[fph],
        extra: Option<&[Twist]>,
        write: impl Fn(&mut armature_model::Part, Twist),
    ) {
        for part_index in 1..model.n_parts() {
            let mut total = Twist::zeros();
            for &dof_index in &self.tree.part_paths[part_index] {
                let twist = self.dof_twist(model, &self.tree.dofs[dof_index]);
                total += twist * values[dof_index];
                if let Some(extra) = extra {
                    total += extra[dof_index];
                }
            }
            let id = model.part_id(part_index);
            write(model.part_mut(id), total);
        }
    }
}

fn constraint_markers(model: &Model, reference: ConstraintRef) -> (MarkerId, MarkerId) {
    match reference {
        ConstraintRef::Joint(index) => {
            let joint = &model.joints()[index];
            (joint.mak_i(), joint.mak_j())
        }
        ConstraintRef::Motion(index) => {
            let motion = &model.motions()[index];
            (motion.mak_i(), motion.mak_j())
        }
        ConstraintRef::GeneralMotion(index) => {
            let gm = &model.general_motions()[index];
            (gm.mak_i(), gm.mak_j())
        }
    }
}

fn constraint_dim(model: &Model, reference: ConstraintRef) -> usize {
    match reference {
        ConstraintRef::Joint(index) => model.joints()[index].dim(),
        ConstraintRef::Motion(_) => 1,
        ConstraintRef::GeneralMotion(_) => 6,
    }
}

fn initial_state(kind: JointKind) -> EdgeState {
    match kind {
        JointKind::Revolute | JointKind::Prismatic => EdgeState::Scalar { q: 0.0 },
        JointKind::Universal => EdgeState::Universal {
            base: Pose::identity(),
            alpha: 0.0,
            beta: 0.0,
        },
        JointKind::Spherical => EdgeState::Spherical {
            base: Pose::identity(),
        },
    }
}

fn build_tree(model: &Model, mode: DriveMode) -> TreeIndex {
    let mut graph: UnGraphMap<usize, usize> = UnGraphMap::new();
    for part in 0..model.n_parts() {
        graph.add_node(part);
    }
    let mut remainder = Vec::new();
    for (index, joint) in model.joints().iter().enumerate() {
        if !joint.is_active() {
            continue;
        }
        let a = joint.mak_i().part().index();
        let b = joint.mak_j().part().index();
        if graph.contains_edge(a, b) {
            remainder.push(ConstraintRef::Joint(index));
        } else {
            graph.add_edge(a, b, index);
        }
    }

    // Breadth-first spanning structure rooted at the ground.
    let mut visited = vec![false; model.n_parts()];
    let mut queue = std::collections::VecDeque::new();
    visited[0] = true;
    queue.push_back(0usize);
    let mut edges = Vec::new();
    while let Some(parent) = queue.pop_front() {
        for child in graph.neighbors(parent) {
            if visited[child] {
                continue;
            }
            visited[child] = true;
            let joint_index = *graph.edge_weight(parent, child).unwrap();
            let joint = &model.joints()[joint_index];
            edges.push(TreeEdge {
                joint: joint_index,
                child,
                parent,
                i_on_child: joint.mak_i().part().index() == child,
                kind: joint.kind(),
                driven: None,
                state: initial_state(joint.kind()),
            });
            queue.push_back(child);
        }
    }
    let disconnected = visited.iter().any(|&v| !v);

    // Graph edges that were not traversed close loops.
    let tree_joints: Vec<usize> = edges.iter().map(|edge| edge.joint).collect();
    for (index, joint) in model.joints().iter().enumerate() {
        if joint.is_active()
            && !tree_joints.contains(&index)
            && !remainder.contains(&ConstraintRef::Joint(index))
        {
            remainder.push(ConstraintRef::Joint(index));
        }
    }

    // Attach driving motions to their edges; the rest close as remainder.
    if mode == DriveMode::Motions {
        for (index, motion) in model.motions().iter().enumerate() {
            if !motion.is_active() {
                continue;
            }
            let expected_axis = |kind: JointKind| match kind {
                JointKind::Revolute => 2,
                JointKind::Prismatic => 5,
                _ => usize::MAX,
            };
            let attached = edges.iter_mut().find(|edge| {
                let joint = &model.joints()[edge.joint];
                joint.mak_i() == motion.mak_i()
                    && joint.mak_j() == motion.mak_j()
                    && motion.axis() == expected_axis(edge.kind)
            });
            if let Some(edge) = attached {
                edge.driven = Some(index);
            } else {
                remainder.push(ConstraintRef::Motion(index));
            }
        }
    }
    if mode == DriveMode::GeneralMotions {
        for (index, gm) in model.general_motions().iter().enumerate() {
            if gm.is_active() {
                remainder.push(ConstraintRef::GeneralMotion(index));
            }
        }
    }

    // Enumerate the scalar freedoms of the spanning structure.
    let mut dofs = Vec::new();
    for (edge_index, edge) in edges.iter().enumerate() {
        match edge.kind {
            JointKind::Revolute | JointKind::Prismatic => dofs.push(Dof {
                edge: edge_index,
                axis: DofAxis::ScalarZ,
                driven: edge.driven,
            }),
            JointKind::Universal => {
                dofs.push(Dof {
                    edge: edge_index,
                    axis: DofAxis::UniversalAlpha,
                    driven: None,
                });
                dofs.push(Dof {
                    edge: edge_index,
                    axis: DofAxis::UniversalBeta,
                    driven: None,
                });
            }
            JointKind::Spherical => {
                for k in 0..3 {
                    dofs.push(Dof {
                        edge: edge_index,
                        axis: DofAxis::Spherical(k),
                        driven: None,
                    });
                }
            }
        }
    }
    let free_dofs: Vec<usize> = dofs
        .iter()
        .enumerate()
        .filter(|(_, dof)| dof.driven.is_none())
        .map(|(index, _)| index)
        .collect();

    // Path of dof indices from the ground to each part.
    let mut part_paths: Vec<Vec<usize>> = vec![Vec::new(); model.n_parts()];
    for (edge_index, edge) in edges.iter().enumerate() {
        let mut path = part_paths[edge.parent].clone();
        for (dof_index, dof) in dofs.iter().enumerate() {
            if dof.edge == edge_index {
                path.push(dof_index);
            }
        }
        part_paths[edge.child] = path;
    }

    let remainder_dim = remainder
        .iter()
        .map(|&reference| constraint_dim(model, reference))
        .sum();

    TreeIndex {
        edges,
        dofs,
        part_paths,
        remainder,
        remainder_dim,
        free_dofs,
        disconnected,
    }
}

/// Two disjoint mutable elements of a slice.
fn two_mutable_elements<T>(values: &mut [T], idx_a: usize, idx_b: usize) -> (&mut T, &mut T) {
    assert_ne!(idx_a, idx_b);
    if idx_b > idx_a {
        let (left, right) = values.split_at_mut(idx_b);
        (&mut left[idx_a], &mut right[0])
    } else {
        let (left, right) = values.split_at_mut(idx_a);
        (&mut right[0], &mut left[idx_b])
    }
}

impl Solver for DiagonalSolver {
    fn allocate_buffers(&mut self, model: &Model) {
        self.tree = build_tree(model, self.mode);
        let n_free = self.tree.free_dofs.len();
        let n_rem = self.tree.remainder_dim;
        let n_eq = self
            .tree
            .dofs
            .iter()
            .filter(|dof| dof.driven.is_none())
            .count();
        self.jacobian = DMatrix::zeros(n_rem, n_free);
        self.residuals = DVector::zeros(n_rem);
        self.step = DVector::zeros(n_free);
        self.rates = vec![0.0; self.tree.dofs.len()];
        self.accels = vec![0.0; self.tree.dofs.len()];
        self.qr = PivotedQr::new(n_rem, n_free);
        self.wrench_affine = (0..model.n_parts())
            .map(|_| DMatrix::zeros(6, 1 + n_rem))
            .collect();
        self.balance = DMatrix::zeros(n_eq, n_rem);
        self.balance_rhs = DVector::zeros(n_eq);
        self.balance_qr = PivotedQr::new(n_eq, n_rem);
        self.remainder_forces = DVector::zeros(n_rem);
    }

    fn kin_pos(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        self.ensure_connected()?;
        let mode = self.mode;
        self.sync(model);

        let n_rem = self.tree.remainder_dim;
        let n_free = self.tree.free_dofs.len();
        let mut iterations = 0;
        loop {
            if mode == DriveMode::Motions {
                self.apply_driven_positions(model);
            }
            self.reconstruct(model);

            let mut row = 0;
            for &reference in &self.tree.remainder {
                let eval = eval_constraint(model, reference);
                for k in 0..eval.dim {
                    self.residuals[row] = eval.cp[k];
                    row += 1;
                }
            }
            let error = if n_rem == 0 { 0.0 } else { self.residuals.amax() };
            trace!("diagonal kin_pos iteration {iterations}: error {error:.3e}");
            if error < self.config.max_error {
                update_measured_positions(model, mode);
                return Ok(SolveReport { iterations, error });
            }
            if iterations >= self.config.max_iter_count || n_free == 0 {
                return Err(SolveError::NotConverged { iterations, error });
            }

            self.fill_reduced_jacobian(model);
            self.residuals.neg_mut();
            self.qr.recompute(&self.jacobian, self.config.max_error);
            self.qr.solve_least_squares(&self.residuals, &mut self.step);

            let free = std::mem::take(&mut self.tree.free_dofs);
            for (position, &dof_index) in free.iter().enumerate() {
                apply_dof_step(&mut self.tree, model, dof_index, self.step[position]);
            }
            self.tree.free_dofs = free;
            iterations += 1;
        }
    }

    fn kin_vel(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        self.ensure_connected()?;
        let mode = self.mode;
        let n_rem = self.tree.remainder_dim;
        let n_free = self.tree.free_dofs.len();

        // Driven rates come straight from the motions.
        for (dof_index, dof) in self.tree.dofs.iter().enumerate() {
            self.rates[dof_index] = match dof.driven {
                Some(motion) if mode == DriveMode::Motions => model.motions()[motion].mv(),
                _ => 0.0,
            };
        }

        if n_rem > 0 && n_free > 0 {
            // Remainder rows minus the contribution of the driven rates.
            let mut row = 0;
            for &reference in &self.tree.remainder {
                let eval = eval_constraint(model, reference);
                let (part_m, part_n) = self.slot_parts(model, reference);
                for k in 0..eval.dim {
                    let mut value = eval.cv[k];
                    for (dof_index, dof) in self.tree.dofs.iter().enumerate() {
                        if dof.driven.is_none() {
                            continue;
                        }
                        let factor = self.path_contains(part_m, dof_index)
                            - self.path_contains(part_n, dof_index);
                        if factor != 0.0 {
                            let twist = self.dof_twist(model, dof);
                            value -=
                                factor * eval.cm_i.column(k).dot(&twist) * self.rates[dof_index];
                        }
                    }
                    self.residuals[row] = value;
                    row += 1;
                }
            }
            self.fill_reduced_jacobian(model);
            self.qr.recompute(&self.jacobian, self.config.max_error);
            self.qr.solve_least_squares(&self.residuals, &mut self.step);
            let free = std::mem::take(&mut self.tree.free_dofs);
            for (position, &dof_index) in free.iter().enumerate() {
                self.rates[dof_index] = self.step[position];
            }
            self.tree.free_dofs = free;
        }

        let rates = std::mem::take(&mut self.rates);
        self.accumulate_paths(model, &rates, None, |part, twist| part.set_velocity(twist));
        self.rates = rates;

        let mut error: fph = 0.0;
        for &reference in &self.tree.remainder {
            let eval = eval_constraint(model, reference);
            let (mak_i, mak_j) = constraint_markers(model, reference);
            let vs_m = *model.part(mak_i.part()).velocity();
            let vs_n = *model.part(mak_j.part()).velocity();
            for k in 0..eval.dim {
                let value = eval.cm_i.column(k).dot(&(vs_m - vs_n)) - eval.cv[k];
                error = error.max(value.abs());
            }
        }

        update_measured_velocities(model, mode);
        Ok(SolveReport {
            iterations: 1,
            error,
        })
    }

    fn kin_acc(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        self.ensure_connected()?;
        let mode = self.mode;
        let n_rem = self.tree.remainder_dim;
        let n_free = self.tree.free_dofs.len();

        for (dof_index, dof) in self.tree.dofs.iter().enumerate() {
            self.accels[dof_index] = match dof.driven {
                Some(motion) if mode == DriveMode::Motions => model.motions()[motion].ma(),
                _ => 0.0,
            };
        }

        // Velocity-product bias of each dof.
        let bias: Vec<Twist> = self
            .tree
            .dofs
            .iter()
            .enumerate()
            .map(|(dof_index, dof)| self.dof_twist_rate(model, dof) * self.rates[dof_index])
            .collect();

        if n_rem > 0 && n_free > 0 {
            let mut row = 0;
            for &reference in &self.tree.remainder {
                let eval = eval_constraint(model, reference);
                let (part_m, part_n) = self.slot_parts(model, reference);
                for k in 0..eval.dim {
                    let mut value = eval.ca[k];
                    for (dof_index, dof) in self.tree.dofs.iter().enumerate() {
                        let factor = self.path_contains(part_m, dof_index)
                            - self.path_contains(part_n, dof_index);
                        if factor == 0.0 {
                            continue;
                        }
                        value -= factor * eval.cm_i.column(k).dot(&bias[dof_index]);
                        if dof.driven.is_some() {
                            let twist = self.dof_twist(model, dof);
                            value -=
                                factor * eval.cm_i.column(k).dot(&twist) * self.accels[dof_index];
                        }
                    }
                    self.residuals[row] = value;
                    row += 1;
                }
            }
            self.fill_reduced_jacobian(model);
            self.qr.recompute(&self.jacobian, self.config.max_error);
            self.qr.solve_least_squares(&self.residuals, &mut self.step);
            let free = std::mem::take(&mut self.tree.free_dofs);
            for (position, &dof_index) in free.iter().enumerate() {
                self.accels[dof_index] = self.step[position];
            }
            self.tree.free_dofs = free;
        }

        let accels = std::mem::take(&mut self.accels);
        self.accumulate_paths(model, &accels, Some(&bias), |part, twist| {
            part.set_acceleration(twist);
        });
        self.accels = accels;

        let mut error: fph = 0.0;
        for &reference in &self.tree.remainder {
            let eval = eval_constraint(model, reference);
            let (mak_i, mak_j) = constraint_markers(model, reference);
            let as_m = *model.part(mak_i.part()).acceleration();
            let as_n = *model.part(mak_j.part()).acceleration();
            for k in 0..eval.dim {
                let value = eval.cm_i.column(k).dot(&(as_m - as_n)) - eval.ca[k];
                error = error.max(value.abs());
            }
        }

        update_measured_accelerations(model, mode);
        Ok(SolveReport {
            iterations: 1,
            error,
        })
    }

    fn dyn_fce(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        self.ensure_connected()?;
        let n_rem = self.tree.remainder_dim;
        model.update_force_wrenches();
        let gravity = *model.environment().gravity();

        // Required constraint wrench of every non-ground part.
        for part_index in 1..model.n_parts() {
            let part = model.part(model.part_id(part_index));
            let inertia = part.world_inertia();
            let velocity = *part.velocity();
            let required: Wrench = inertia * part.acceleration()
                + cross_wrench(&velocity, &(inertia * velocity))
                - inertia * gravity;
            self.wrench_affine[part_index].fill(0.0);
            for row in 0..6 {
                self.wrench_affine[part_index][(row, 0)] = required[row];
            }
        }
        for force in model.forces() {
            if !force.is_active() {
                continue;
            }
            for (marker, wrench) in [(force.mak_i(), force.fs_i()), (force.mak_j(), force.fs_j())] {
                let part = marker.part().index();
                if part != 0 {
                    for row in 0..6 {
                        self.wrench_affine[part][(row, 0)] -= wrench[row];
                    }
                }
            }
        }

        // Remainder wrench columns: -cm on part M, +cm on part N (moved to
        // the transmitted side of the balance).
        let mut col = 1;
        for &reference in &self.tree.remainder {
            let eval = eval_constraint(model, reference);
            let (part_m, part_n) = self.slot_parts(model, reference);
            for k in 0..eval.dim {
                if let Some(part) = part_m {
                    for row in 0..6 {
                        self.wrench_affine[part][(row, col)] -= eval.cm_i[(row, k)];
                    }
                }
                if let Some(part) = part_n {
                    for row in 0..6 {
                        self.wrench_affine[part][(row, col)] += eval.cm_i[(row, k)];
                    }
                }
                col += 1;
            }
        }

        // Backward sweep: each edge's transmitted wrench, affine in the
        // remainder forces, accumulates into its parent's balance.
        for edge_index in (0..self.tree.edges.len()).rev() {
            let (parent, child) = {
                let edge = &self.tree.edges[edge_index];
                (edge.parent, edge.child)
            };
            if parent != 0 {
                let (parent_acc, child_acc) =
                    two_mutable_elements(&mut self.wrench_affine, parent, child);
                *parent_acc += &*child_acc;
            }
        }

        // The transmitted wrench must have no component along undriven free
        // axes; that determines the remainder forces.
        if n_rem > 0 {
            let mut row = 0;
            for dof in &self.tree.dofs {
                if dof.driven.is_some() {
                    continue;
                }
                let twist = self.dof_twist(model, dof);
                let affine = &self.wrench_affine[self.tree.edges[dof.edge].child];
                let mut constant = 0.0;
                for i in 0..6 {
                    constant += twist[i] * affine[(i, 0)];
                }
                self.balance_rhs[row] = -constant;
                for r in 0..n_rem {
                    let mut value = 0.0;
                    for i in 0..6 {
                        value += twist[i] * affine[(i, 1 + r)];
                    }
                    self.balance[(row, r)] = value;
                }
                row += 1;
            }
            self.balance_qr
                .recompute(&self.balance, self.config.max_error);
            self.balance_qr
                .solve_least_squares(&self.balance_rhs, &mut self.remainder_forces);
        }

        // Decompose each edge's transmitted wrench into joint constraint
        // force and motor force.
        let mut error: fph = 0.0;
        for edge_index in 0..self.tree.edges.len() {
            let (joint_index, child, i_on_child) = {
                let edge = &self.tree.edges[edge_index];
                (edge.joint, edge.child, edge.i_on_child)
            };
            let joint = &model.joints()[joint_index];
            let dim = joint.dim();
            let w_i = model.marker_world_pose(joint.mak_i());
            let x_ij = w_i.inverse() * model.marker_world_pose(joint.mak_j());
            let local = joint.local_cm(&x_ij);

            let mut transmitted = Wrench::zeros();
            let affine = &self.wrench_affine[child];
            for i in 0..6 {
                let mut value = affine[(i, 0)];
                for r in 0..n_rem {
                    value += affine[(i, 1 + r)] * self.remainder_forces[r];
                }
                transmitted[i] = value;
            }
            if !i_on_child {
                transmitted.neg_mut();
            }

            // Basis: joint wrench columns, then the dual wrench of every
            // freedom of this edge.
            let mut basis = SpatialMatrix::zeros();
            for k in 0..dim {
                let column = tf_wrench(&w_i, &local.column(k).into_owned());
                basis.column_mut(k).copy_from(&column);
            }
            let mut dof_slots = Vec::new();
            for (dof_index, dof) in self.tree.dofs.iter().enumerate() {
                if dof.edge != edge_index {
                    continue;
                }
                let column = dof_wrench(model, &self.tree.edges[dof.edge], dof);
                basis.column_mut(dim + dof_slots.len()).copy_from(&column);
                dof_slots.push(dof_index);
            }

            let decomposition = basis
                .lu()
                .solve(&transmitted)
                .ok_or(SolveError::RankDeficient)?;

            let mut forces = [0.0; 6];
            for k in 0..dim {
                forces[k] = decomposition[k];
            }
            model.joints_mut()[joint_index].set_constraint_force(&forces[..dim]);
            for (slot, &dof_index) in dof_slots.iter().enumerate() {
                let value = decomposition[dim + slot];
                match self.tree.dofs[dof_index].driven {
                    Some(motion) => model.motions_mut()[motion].set_mf_dyn(value),
                    None => error = error.max(value.abs()),
                }
            }
        }

        // Remainder constraint forces write back to their own entities.
        let mut offset = 0;
        for &reference in &self.tree.remainder {
            let dim = constraint_dim(model, reference);
            match reference {
                ConstraintRef::Joint(index) => {
                    let mut forces = [0.0; 6];
                    for k in 0..dim {
                        forces[k] = self.remainder_forces[offset + k];
                    }
                    model.joints_mut()[index].set_constraint_force(&forces[..dim]);
                }
                ConstraintRef::Motion(index) => {
                    model.motions_mut()[index].set_mf_dyn(self.remainder_forces[offset]);
                }
                ConstraintRef::GeneralMotion(index) => {
                    let mut forces = [0.0; 6];
                    forces.copy_from_slice(&self.remainder_forces.as_slice()[offset..offset + 6]);
                    model.general_motions_mut()[index].set_constraint_force(&forces);
                }
            }
            offset += dim;
        }

        Ok(SolveReport {
            iterations: 1,
            error,
        })
    }
}

/// The wrench direction dual to a freedom: unit torque (or force) along its
/// axis, producing unit power against the freedom's unit twist.
fn dof_wrench(model: &Model, edge: &TreeEdge, dof: &Dof) -> Wrench {
    let joint = &model.joints()[edge.joint];
    let w_i = model.marker_world_pose(joint.mak_i());
    let w_j = model.marker_world_pose(joint.mak_j());
    match dof.axis {
        DofAxis::ScalarZ => {
            let axis = w_i.rotation * Vector3::z();
            if edge.kind == JointKind::Prismatic {
                spatial(w_i.translation.vector.cross(&axis), axis)
            } else {
                spatial(axis, Vector3::zeros())
            }
        }
        DofAxis::UniversalAlpha => spatial(w_i.rotation * Vector3::z(), Vector3::zeros()),
        DofAxis::UniversalBeta => spatial(w_j.rotation * Vector3::z(), Vector3::zeros()),
        DofAxis::Spherical(k) => {
            let mut axis = Vector3::zeros();
            axis[k] = 1.0;
            spatial(axis, Vector3::zeros())
        }
    }
}

fn apply_dof_step(tree: &mut TreeIndex, model: &Model, dof_index: usize, step: fph) {
    let dof = tree.dofs[dof_index];
    let edge = &mut tree.edges[dof.edge];
    let sign = if edge.i_on_child { 1.0 } else { -1.0 };
    match (&mut edge.state, dof.axis) {
        (EdgeState::Scalar { q }, DofAxis::ScalarZ) => *q += sign * step,
        (EdgeState::Universal { alpha, .. }, DofAxis::UniversalAlpha) => *alpha += sign * step,
        (EdgeState::Universal { beta, .. }, DofAxis::UniversalBeta) => *beta += sign * step,
        (EdgeState::Spherical { base }, DofAxis::Spherical(k)) => {
            let joint = &model.joints()[edge.joint];
            let w_j = model.marker_world_pose(joint.mak_j());
            let mut axis = Vector3::zeros();
            axis[k] = sign * step;
            let delta_j = w_j.rotation.inverse() * axis;
            let rotation = UnitQuaternion::from_scaled_axis(delta_j) * base.rotation;
            *base = Pose::from_parts(base.translation, rotation);
        }
        _ => unreachable!("dof axis matches the edge state"),
    }
}

/// Forward kinematics: applies relative joint transforms down the tree from
/// the motion positions, then corrects loop residuals with the velocity
/// Jacobian. A thin motion-driven configuration of the tree machinery.
#[derive(Debug)]
pub struct ForwardKinematicSolver {
    inner: DiagonalSolver,
}

impl ForwardKinematicSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self {
            inner: DiagonalSolver::new(DriveMode::Motions, config),
        }
    }

    pub fn config(&self) -> &SolverConfig {
        self.inner.config()
    }
}

impl Solver for ForwardKinematicSolver {
    fn allocate_buffers(&mut self, model: &Model) {
        self.inner.allocate_buffers(model);
    }

    fn kin_pos(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        self.inner.kin_pos(model)
    }

    fn kin_vel(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        self.inner.kin_vel(model)
    }

    fn kin_acc(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        self.inner.kin_acc(model)
    }

    fn dyn_fce(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        self.inner.dyn_fce(model)
    }
}
