//! The combined dense solver: full KKT assembly with rank-revealing QR.

use crate::{
    DriveMode, SolveError, SolveReport, Solver, SolverConfig,
    assembly::{
        self, Assembly, update_measured_accelerations, update_measured_positions,
        update_measured_velocities,
    },
};
use armature_math::{PivotedQr, SpatialMatrix, fph, screw::screw_exp};
use armature_model::Model;
use log::{debug, trace};
use nalgebra::{DMatrix, DVector};

/// Assembles the full KKT system
/// `[[I, -C], [Cᵀ, 0]]·[pa; cf] = [pf; ca]`
/// and the position/velocity linearizations `Cᵀ·δ = rhs`, and solves them
/// densely with a column-pivoted Householder QR.
///
/// Robust to redundant and rank-deficient constraints: least-squares on
/// overdetermined kinematics, minimum-norm constraint forces on redundant
/// actuation.
#[derive(Debug)]
pub struct CombinedSolver {
    mode: DriveMode,
    config: SolverConfig,
    assembly: Option<Assembly>,
    cm: DMatrix<fph>,
    cmt: DMatrix<fph>,
    kin_qr: PivotedQr,
    kkt: DMatrix<fph>,
    kkt_qr: PivotedQr,
    residuals: DVector<fph>,
    delta: DVector<fph>,
    rhs: DVector<fph>,
    unknowns: DVector<fph>,
    part_forces: DVector<fph>,
    constraint_forces: DVector<fph>,
    world_inertias: Vec<SpatialMatrix>,
}

impl CombinedSolver {
    pub fn new(mode: DriveMode, config: SolverConfig) -> Self {
        Self {
            mode,
            config,
            assembly: None,
            cm: DMatrix::zeros(0, 0),
            cmt: DMatrix::zeros(0, 0),
            kin_qr: PivotedQr::new(0, 0),
            kkt: DMatrix::zeros(0, 0),
            kkt_qr: PivotedQr::new(0, 0),
            residuals: DVector::zeros(0),
            delta: DVector::zeros(0),
            rhs: DVector::zeros(0),
            unknowns: DVector::zeros(0),
            part_forces: DVector::zeros(0),
            constraint_forces: DVector::zeros(0),
            world_inertias: Vec::new(),
        }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn mode(&self) -> DriveMode {
        self.mode
    }

    fn assembly(&self) -> &Assembly {
        self.assembly
            .as_ref()
            .expect("allocate_buffers must be called before solving")
    }

    /// Solves `Cᵀ·x = rhs` in the least-squares sense with the current
    /// constraint matrix, leaving the solution in `self.delta`. Returns the
    /// residual norm of the solved system.
    fn solve_kinematic(&mut self, model: &Model) -> fph {
        let assembly = self.assembly.as_ref().unwrap();
        assembly.eval_cm_into(model, &mut self.cm);
        self.cmt.tr_copy_from(&self.cm);
        self.kin_qr.recompute(&self.cmt, self.config.max_error);
        self.kin_qr.solve_least_squares(&self.residuals, &mut self.delta);

        let mut error: fph = 0.0;
        for row in 0..self.cmt.nrows() {
            let mut value = -self.residuals[row];
            for col in 0..self.cmt.ncols() {
                value += self.cmt[(row, col)] * self.delta[col];
            }
            error = error.max(value.abs());
        }
        error
    }

    fn write_part_poses(&self, model: &mut Model) {
        let assembly = self.assembly.as_ref().unwrap();
        for (block, &part_index) in assembly.block_parts().iter().enumerate() {
            let id = model.part_id(part_index);
            let twist = self.delta.fixed_rows::<6>(6 * block).into_owned();
            let pose = screw_exp(&twist) * model.part(id).pose();
            model.part_mut(id).set_pose(pose);
        }
    }

    fn write_part_velocities(&self, model: &mut Model) {
        let assembly = self.assembly.as_ref().unwrap();
        for (block, &part_index) in assembly.block_parts().iter().enumerate() {
            let id = model.part_id(part_index);
            let twist = self.delta.fixed_rows::<6>(6 * block).into_owned();
            model.part_mut(id).set_velocity(twist);
        }
    }

    fn write_part_accelerations_from_delta(&self, model: &mut Model) {
        let assembly = self.assembly.as_ref().unwrap();
        for (block, &part_index) in assembly.block_parts().iter().enumerate() {
            let id = model.part_id(part_index);
            let twist = self.delta.fixed_rows::<6>(6 * block).into_owned();
            model.part_mut(id).set_acceleration(twist);
        }
    }

}

impl Solver for CombinedSolver {
    fn allocate_buffers(&mut self, model: &Model) {
        let assembly = Assembly::analyze(model, self.mode);
        let rows = assembly.n_rows();
        let cols = assembly.n_cols();
        let total = rows + cols;

        self.cm = DMatrix::zeros(rows, cols);
        self.cmt = DMatrix::zeros(cols, rows);
        self.kin_qr = PivotedQr::new(cols, rows);
        self.kkt = DMatrix::zeros(total, total);
        self.kkt_qr = PivotedQr::new(total, total);
        self.residuals = DVector::zeros(cols);
        self.delta = DVector::zeros(rows);
        self.rhs = DVector::zeros(total);
        self.unknowns = DVector::zeros(total);
        self.part_forces = DVector::zeros(rows);
        self.constraint_forces = DVector::zeros(cols);
        self.world_inertias = vec![SpatialMatrix::zeros(); assembly.block_parts().len()];
        self.assembly = Some(assembly);
    }

    fn kin_pos(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        let mode = self.mode;
        let mut iterations = 0;
        loop {
            self.assembly
                .as_ref()
                .expect("allocate_buffers must be called before solving")
                .eval_cp_into(model, &mut self.residuals);
            let error = if self.residuals.is_empty() {
                0.0
            } else {
                self.residuals.amax()
            };
            trace!("kin_pos iteration {iterations}: error {error:.3e}");
            if error < self.config.max_error {
                update_measured_positions(model, mode);
                debug!("kin_pos converged after {iterations} iterations");
                return Ok(SolveReport { iterations, error });
            }
            if iterations >= self.config.max_iter_count {
                return Err(SolveError::NotConverged { iterations, error });
            }
            self.residuals.neg_mut();
            self.solve_kinematic(model);
            self.write_part_poses(model);
            iterations += 1;
        }
    }

    fn kin_vel(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        let mode = self.mode;
        self.assembly
            .as_ref()
            .expect("allocate_buffers must be called before solving")
            .eval_cv_into(model, &mut self.residuals);
        let error = self.solve_kinematic(model);
        if error > self.config.max_error.max(1e-9) {
            return Err(SolveError::NotConverged {
                iterations: 1,
                error,
            });
        }
        self.write_part_velocities(model);
        update_measured_velocities(model, mode);
        Ok(SolveReport {
            iterations: 1,
            error,
        })
    }

    fn kin_acc(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        let mode = self.mode;
        self.assembly
            .as_ref()
            .expect("allocate_buffers must be called before solving")
            .eval_ca_into(model, &mut self.residuals);
        let error = self.solve_kinematic(model);
        if error > self.config.max_error.max(1e-9) {
            return Err(SolveError::NotConverged {
                iterations: 1,
                error,
            });
        }
        self.write_part_accelerations_from_delta(model);
        update_measured_accelerations(model, mode);
        Ok(SolveReport {
            iterations: 1,
            error,
        })
    }

    fn dyn_fce(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        let mode = self.mode;
        let rows = self.assembly().n_rows();
        let cols = self.assembly().n_cols();

        {
            let assembly = self.assembly.as_ref().unwrap();
            assembly::assemble_part_forces(
                model,
                assembly,
                mode,
                &mut self.part_forces,
                &mut self.world_inertias,
            );
            assembly.eval_cm_into(model, &mut self.cm);
            assembly.eval_ca_into(model, &mut self.constraint_forces);
        }
        for row in 0..rows {
            self.rhs[row] = self.part_forces[row];
        }
        for row in 0..cols {
            self.rhs[rows + row] = self.constraint_forces[row];
        }

        self.kkt.fill(0.0);
        for block in 0..rows / 6 {
            let inertia = &self.world_inertias[block];
            for i in 0..6 {
                for j in 0..6 {
                    self.kkt[(6 * block + i, 6 * block + j)] = inertia[(i, j)];
                }
            }
        }
        for row in 0..rows {
            for col in 0..cols {
                self.kkt[(row, rows + col)] = -self.cm[(row, col)];
                self.kkt[(rows + col, row)] = self.cm[(row, col)];
            }
        }

        self.kkt_qr.recompute(&self.kkt, self.config.max_error);
        self.kkt_qr
            .solve_least_squares(&self.rhs, &mut self.unknowns);

        let mut error: fph = 0.0;
        for row in 0..rows + cols {
            let mut value = -self.rhs[row];
            for col in 0..rows + cols {
                value += self.kkt[(row, col)] * self.unknowns[col];
            }
            error = error.max(value.abs());
        }
        if error > self.config.max_error.max(1e-8) {
            return Err(SolveError::RankDeficient);
        }

        for i in 0..rows {
            self.delta[i] = self.unknowns[i];
        }
        self.write_part_accelerations_from_delta(model);
        for i in 0..cols {
            self.constraint_forces[i] = self.unknowns[rows + i];
        }
        self.assembly
            .as_ref()
            .unwrap()
            .write_constraint_forces(model, &self.constraint_forces);
        update_measured_accelerations(model, mode);

        Ok(SolveReport {
            iterations: 1,
            error,
        })
    }

    fn dyn_acc_and_fce(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        // One KKT solve yields both accelerations and constraint forces.
        self.dyn_fce(model)
    }
}

/// Part-frame constraint blocks of every indexed constraint. Exposed for
/// cross-checking assemblies in tests.
pub fn part_frame_blocks(
    model: &Model,
    solver_assembly: &Assembly,
) -> Vec<(SpatialMatrix, SpatialMatrix)> {
    solver_assembly
        .slots()
        .iter()
        .map(|slot| assembly::part_cm(model, slot.reference))
        .collect()
}
