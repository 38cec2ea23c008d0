//! Kinematics and dynamics solvers for the Armature multibody core.
//!
//! Three solver variants satisfy the same contract, chosen by mechanism
//! topology:
//!
//! - [`CombinedSolver`] assembles the full dense KKT system and solves it
//!   with a rank-revealing pivoted QR; it tolerates redundant constraints
//!   and reports minimum-norm constraint forces.
//! - [`LltSolver`] eliminates part accelerations through the block-diagonal
//!   inertia and solves the reduced normal equations by Cholesky; it
//!   requires a full-column-rank constraint matrix.
//! - [`DiagonalSolver`] exploits the mechanism tree: the spanning structure
//!   is solved block by block, loop-closing remainder constraints through a
//!   small reduced system, and constraint forces by a backward sweep.
//!
//! All solvers pull their inputs from the model (motion setpoints or
//! end-effector targets, selected by [`DriveMode`]), assemble, solve, and
//! write results back onto the model's parts and constraints. Scratch
//! buffers are sized once in [`Solver::allocate_buffers`]; the solve calls
//! themselves do not allocate.

pub mod assembly;
mod combined;
mod divided;
mod tree;

pub use combined::CombinedSolver;
pub use divided::LltSolver;
pub use tree::{DiagonalSolver, ForwardKinematicSolver};

use armature_model::Model;
use armature_math::fph;
use thiserror::Error;

/// Which prescribed inputs drive a solve.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DriveMode {
    /// Motions prescribe their joint axes; general motions are measured.
    /// Forward kinematics and inverse dynamics.
    Motions,
    /// General motions prescribe the end effector; motions are measured.
    /// Inverse kinematics.
    GeneralMotions,
    /// No motion constraint rows; motor forces are applied as loads and the
    /// accelerations they produce are measured. Forward dynamics.
    Forces,
}

/// Iteration cap and convergence tolerance shared by all solvers.
#[derive(Copy, Clone, Debug)]
pub struct SolverConfig {
    pub max_iter_count: usize,
    pub max_error: fph,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iter_count: 100,
            max_error: 1e-10,
        }
    }
}

/// Outcome of a successful solve.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SolveReport {
    /// Newton iterations taken (1 for the linear solves).
    pub iterations: usize,
    /// Final residual (infinity norm).
    pub error: fph,
}

/// Numerical or convergence failure of a solve. Precondition violations
/// (mismatched buffer sizes, invalid branch indices) panic instead.
#[derive(Copy, Clone, Debug, PartialEq, Error)]
pub enum SolveError {
    /// The constraint matrix lost rank for the chosen solver variant (or an
    /// inertia block was singular).
    #[error("constraint matrix is rank deficient for this solver")]
    RankDeficient,
    /// The iteration budget was exhausted; the model holds the best state
    /// reached so far.
    #[error("no convergence after {iterations} iterations (error {error:.3e})")]
    NotConverged { iterations: usize, error: fph },
    /// The prescribed target cannot be reached by the mechanism.
    #[error("target is outside the reachable workspace")]
    Unreachable,
    /// A singular configuration (wrist or Euler singularity) prevented the
    /// requested conversion or branch.
    #[error("singular configuration")]
    Singular,
    /// The mechanism graph is not connected to the ground.
    #[error("mechanism is not connected to the ground")]
    Disconnected,
}

impl SolveError {
    /// The negative status code conventionally reported to callers (0 is
    /// success).
    pub fn status(&self) -> i32 {
        match self {
            Self::RankDeficient => -1,
            Self::NotConverged { .. } => -2,
            Self::Unreachable => -3,
            Self::Singular => -4,
            Self::Disconnected => -5,
        }
    }
}

/// The solver contract shared by every variant.
///
/// `kin_acc` requires part velocities consistent with the current drive
/// (run `kin_vel` first); `dyn_fce` additionally requires accelerations.
pub trait Solver {
    /// Sizes all scratch buffers from the model topology. Idempotent; must
    /// be called again after entities are added, removed or re-activated.
    fn allocate_buffers(&mut self, model: &Model);

    /// Position solve: drives all constraint position residuals to zero by
    /// Newton iteration and writes part poses back.
    fn kin_pos(&mut self, model: &mut Model) -> Result<SolveReport, SolveError>;

    /// Velocity solve: writes part spatial velocities consistent with the
    /// prescribed rates.
    fn kin_vel(&mut self, model: &mut Model) -> Result<SolveReport, SolveError>;

    /// Acceleration solve: writes part spatial accelerations consistent
    /// with the prescribed accelerations.
    fn kin_acc(&mut self, model: &mut Model) -> Result<SolveReport, SolveError>;

    /// Force solve: writes constraint forces (and motor forces) balancing
    /// the current accelerations, external forces and gravity.
    fn dyn_fce(&mut self, model: &mut Model) -> Result<SolveReport, SolveError>;

    /// Combined acceleration and force solve.
    fn dyn_acc_and_fce(&mut self, model: &mut Model) -> Result<SolveReport, SolveError> {
        self.kin_acc(model)?;
        self.dyn_fce(model)
    }
}
