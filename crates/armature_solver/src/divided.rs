//! The divided solver: block-diagonal inertia elimination with an LLT on
//! the reduced normal equations.

use crate::{
    DriveMode, SolveError, SolveReport, Solver, SolverConfig,
    assembly::{
        self, Assembly, update_measured_accelerations, update_measured_positions,
        update_measured_velocities,
    },
};
use armature_math::{Llt, SpatialMatrix, fph};
use armature_model::Model;
use log::trace;
use nalgebra::{DMatrix, DVector};

/// Eliminates the part unknowns through the block-diagonal inertia and
/// solves `CᵀI⁻¹C·cf = ca - CᵀI⁻¹·pf` (dynamics) or the `CᵀC` normal
/// equations (kinematics) by Cholesky.
///
/// Requires the global constraint matrix to have full column rank; a
/// redundantly constrained mechanism makes the reduced matrix semidefinite
/// and the solve fails with [`SolveError::RankDeficient`].
#[derive(Debug)]
pub struct LltSolver {
    mode: DriveMode,
    config: SolverConfig,
    assembly: Option<Assembly>,
    cm: DMatrix<fph>,
    normal: DMatrix<fph>,
    llt: Llt,
    residuals: DVector<fph>,
    reduced: DVector<fph>,
    delta: DVector<fph>,
    weighted: DMatrix<fph>,
    part_forces: DVector<fph>,
    world_inertias: Vec<SpatialMatrix>,
    inverse_inertias: Vec<SpatialMatrix>,
}

impl LltSolver {
    pub fn new(mode: DriveMode, config: SolverConfig) -> Self {
        Self {
            mode,
            config,
            assembly: None,
            cm: DMatrix::zeros(0, 0),
            normal: DMatrix::zeros(0, 0),
            llt: Llt::new(0),
            residuals: DVector::zeros(0),
            reduced: DVector::zeros(0),
            delta: DVector::zeros(0),
            weighted: DMatrix::zeros(0, 0),
            part_forces: DVector::zeros(0),
            world_inertias: Vec::new(),
            inverse_inertias: Vec::new(),
        }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn mode(&self) -> DriveMode {
        self.mode
    }

    /// Solves `Cᵀ·δ = residuals` through the `CᵀC` normal equations,
    /// leaving the (minimum-norm) solution in `self.delta`.
    fn solve_kinematic(&mut self, model: &Model) -> Result<(), SolveError> {
        let assembly = self.assembly.as_ref().unwrap();
        assembly.eval_cm_into(model, &mut self.cm);
        self.normal.gemm_tr(1.0, &self.cm, &self.cm, 0.0);
        self.llt
            .recompute(&self.normal)
            .map_err(|_| SolveError::RankDeficient)?;
        self.reduced.copy_from(&self.residuals);
        self.llt.solve_in_place(&mut self.reduced);
        self.delta.gemv(1.0, &self.cm, &self.reduced, 0.0);
        Ok(())
    }

    fn write_parts(&self, model: &mut Model, write: impl Fn(&mut armature_model::Part, nalgebra::Vector6<fph>)) {
        let assembly = self.assembly.as_ref().unwrap();
        for (block, &part_index) in assembly.block_parts().iter().enumerate() {
            let id = model.part_id(part_index);
            let twist = self.delta.fixed_rows::<6>(6 * block).into_owned();
            write(model.part_mut(id), twist);
        }
    }
}

impl Solver for LltSolver {
    fn allocate_buffers(&mut self, model: &Model) {
        let assembly = Assembly::analyze(model, self.mode);
        let rows = assembly.n_rows();
        let cols = assembly.n_cols();

        self.cm = DMatrix::zeros(rows, cols);
        self.normal = DMatrix::zeros(cols, cols);
        self.llt = Llt::new(cols);
        self.residuals = DVector::zeros(cols);
        self.reduced = DVector::zeros(cols);
        self.delta = DVector::zeros(rows);
        self.weighted = DMatrix::zeros(rows, cols);
        self.part_forces = DVector::zeros(rows);
        self.world_inertias = vec![SpatialMatrix::zeros(); assembly.block_parts().len()];
        self.inverse_inertias = vec![SpatialMatrix::zeros(); assembly.block_parts().len()];
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
                return Ok(SolveReport { iterations, error });
            }
            if iterations >= self.config.max_iter_count {
                return Err(SolveError::NotConverged { iterations, error });
            }
            self.residuals.neg_mut();
            self.solve_kinematic(model)?;
            self.write_parts(model, |part, twist| {
                let pose = armature_math::screw::screw_exp(&twist) * part.pose();
                part.set_pose(pose);
            });
            iterations += 1;
        }
    }

    fn kin_vel(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        let mode = self.mode;
        self.assembly
            .as_ref()
            .expect("allocate_buffers must be called before solving")
            .eval_cv_into(model, &mut self.residuals);
        self.solve_kinematic(model)?;

        let mut error: fph = 0.0;
        for col in 0..self.cm.ncols() {
            let mut value = -self.residuals[col];
            for row in 0..self.cm.nrows() {
                value += self.cm[(row, col)] * self.delta[row];
            }
            error = error.max(value.abs());
        }
        self.write_parts(model, |part, twist| part.set_velocity(twist));
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
        self.solve_kinematic(model)?;

        let mut error: fph = 0.0;
        for col in 0..self.cm.ncols() {
            let mut value = -self.residuals[col];
            for row in 0..self.cm.nrows() {
                value += self.cm[(row, col)] * self.delta[row];
            }
            error = error.max(value.abs());
        }
        self.write_parts(model, |part, twist| part.set_acceleration(twist));
        update_measured_accelerations(model, mode);
        Ok(SolveReport {
            iterations: 1,
            error,
        })
    }

    fn dyn_fce(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        let mode = self.mode;
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
            assembly.eval_ca_into(model, &mut self.residuals);
        }

        let blocks = self.world_inertias.len();
        for block in 0..blocks {
            self.inverse_inertias[block] = self.world_inertias[block]
                .try_inverse()
                .ok_or(SolveError::RankDeficient)?;
        }

        // weighted = I⁻¹·C, block row by block row.
        let cols = self.cm.ncols();
        for block in 0..blocks {
            let inverse = &self.inverse_inertias[block];
            for col in 0..cols {
                for i in 0..6 {
                    let mut value = 0.0;
                    for j in 0..6 {
                        value += inverse[(i, j)] * self.cm[(6 * block + j, col)];
                    }
                    self.weighted[(6 * block + i, col)] = value;
                }
            }
        }

        // Reduced system: (CᵀI⁻¹C)·cf = ca - Cᵀ·I⁻¹·pf.
        self.normal.gemm_tr(1.0, &self.cm, &self.weighted, 0.0);
        self.reduced.copy_from(&self.residuals);
        self.reduced.gemv_tr(-1.0, &self.weighted, &self.part_forces, 1.0);
        self.llt
            .recompute(&self.normal)
            .map_err(|_| SolveError::RankDeficient)?;
        self.llt.solve_in_place(&mut self.reduced);

        // pa = I⁻¹·(pf + C·cf).
        for block in 0..blocks {
            let inverse = &self.inverse_inertias[block];
            for i in 0..6 {
                let mut value = 0.0;
                for j in 0..6 {
                    value += inverse[(i, j)] * self.part_forces[6 * block + j];
                }
                self.delta[6 * block + i] = value;
            }
        }
        self.delta.gemv(1.0, &self.weighted, &self.reduced, 1.0);

        let mut error: fph = 0.0;
        for col in 0..cols {
            let mut value = -self.residuals[col];
            for row in 0..self.cm.nrows() {
                value += self.cm[(row, col)] * self.delta[row];
            }
            error = error.max(value.abs());
        }

        self.write_parts(model, |part, twist| part.set_acceleration(twist));
        self.assembly
            .as_ref()
            .unwrap()
            .write_constraint_forces(model, &self.reduced);
        update_measured_accelerations(model, mode);

        Ok(SolveReport {
            iterations: 1,
            error,
        })
    }

    fn dyn_acc_and_fce(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        self.dyn_fce(model)
    }
}
