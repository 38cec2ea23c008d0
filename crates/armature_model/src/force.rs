//! Applied forces between two markers.

use crate::part::MarkerId;
use armature_math::{Pose, Wrench, fph, screw};

/// A force acting along (or about) a single axis of its `mak_i` frame,
/// applying equal-and-opposite spatial wrenches to the two markers' parts.
///
/// Axis indices are ω-first: 0..3 are torques about x, y, z and 3..6 are
/// forces along x, y, z.
#[derive(Clone, Debug)]
pub struct SingleComponentForce {
    name: String,
    mak_i: MarkerId,
    mak_j: MarkerId,
    component_axis: usize,
    fce: fph,
    fs_i: Wrench,
    fs_j: Wrench,
    active: bool,
}

impl SingleComponentForce {
    pub(crate) fn new(
        name: String,
        mak_i: MarkerId,
        mak_j: MarkerId,
        component_axis: usize,
    ) -> Self {
        assert!(component_axis < 6, "force axis must be in 0..6");
        Self {
            name,
            mak_i,
            mak_j,
            component_axis,
            fce: 0.0,
            fs_i: Wrench::zeros(),
            fs_j: Wrench::zeros(),
            active: true,
        }
    }

    /// The name of the force, unique within the model's force pool.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mak_i(&self) -> MarkerId {
        self.mak_i
    }

    pub fn mak_j(&self) -> MarkerId {
        self.mak_j
    }

    /// The driven axis of the `mak_i` frame.
    pub fn component_axis(&self) -> usize {
        self.component_axis
    }

    /// The scalar force value.
    pub fn fce(&self) -> fph {
        self.fce
    }

    pub fn set_fce(&mut self, fce: fph) {
        self.fce = fce;
    }

    /// The wrench applied to part M, in the world frame about the world
    /// origin, as of the last [`Self::update_wrenches`].
    pub fn fs_i(&self) -> &Wrench {
        &self.fs_i
    }

    /// The wrench applied to part N; always the negation of [`Self::fs_i`].
    pub fn fs_j(&self) -> &Wrench {
        &self.fs_j
    }

    /// Whether the force participates in dynamics solves.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Recomputes the two wrenches from the current world pose of `mak_i`.
    pub fn update_wrenches(&mut self, mak_i_world: &Pose) {
        let mut local = Wrench::zeros();
        local[self.component_axis] = self.fce;
        self.fs_i = screw::tf_wrench(mak_i_world, &local);
        self.fs_j = -self.fs_i;
    }
}

/// Identifier of a force within a model.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ForceId(pub(crate) usize);

impl ForceId {
    /// The position of the force in the model's force pool.
    pub fn index(&self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::part::PartId;
    use approx::assert_abs_diff_eq;
    use nalgebra::{Translation3, UnitQuaternion};

    #[test]
    fn should_apply_equal_and_opposite_wrenches() {
        let mak = MarkerId {
            part: PartId(0),
            index: 0,
        };
        let mut force = SingleComponentForce::new("f".into(), mak, mak, 5);
        force.set_fce(2.0);
        let pose = Pose::from_parts(
            Translation3::new(1.0, 0.0, 0.0),
            UnitQuaternion::identity(),
        );
        force.update_wrenches(&pose);
        assert_abs_diff_eq!(force.fs_i(), &-force.fs_j());
        // A force of 2 N along z applied at x = 1 m produces a moment of
        // -2 N·m about y at the world origin.
        assert_abs_diff_eq!(force.fs_i()[5], 2.0);
        assert_abs_diff_eq!(force.fs_i()[1], -2.0);
    }
}
