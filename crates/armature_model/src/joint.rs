//! Joints: binary kinematic constraints between two markers.

use crate::part::MarkerId;
use armature_math::{Pose, SpatialMatrix, fph};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// The kind of a joint, fixing its constraint dimension.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JointKind {
    /// Relative rotation about the common z-axis of the two markers (d = 5).
    Revolute,
    /// Relative translation along the common z-axis (d = 5).
    Prismatic,
    /// Two orthogonal intersecting revolute axes: z of the first marker and
    /// z of the second (d = 4).
    Universal,
    /// Ball and socket: translations constrained, rotations free (d = 3).
    Spherical,
}

impl JointKind {
    /// The number of constrained degrees of freedom.
    pub fn dim(&self) -> usize {
        match self {
            Self::Revolute | Self::Prismatic => 5,
            Self::Universal => 4,
            Self::Spherical => 3,
        }
    }
}

/// A joint between marker `mak_i` (on part M) and marker `mak_j` (on part N).
#[derive(Clone, Debug)]
pub struct Joint {
    name: String,
    kind: JointKind,
    mak_i: MarkerId,
    mak_j: MarkerId,
    constraint_force: [fph; 6],
    active: bool,
}

impl Joint {
    pub(crate) fn new(name: String, kind: JointKind, mak_i: MarkerId, mak_j: MarkerId) -> Self {
        Self {
            name,
            kind,
            mak_i,
            mak_j,
            constraint_force: [0.0; 6],
            active: true,
        }
    }

    /// The name of the joint, unique within the model's joint pool.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> JointKind {
        self.kind
    }

    /// The number of constrained degrees of freedom.
    pub fn dim(&self) -> usize {
        self.kind.dim()
    }

    /// The constrained marker on part M.
    pub fn mak_i(&self) -> MarkerId {
        self.mak_i
    }

    /// The reference marker on part N.
    pub fn mak_j(&self) -> MarkerId {
        self.mak_j
    }

    /// The constraint (Lagrange) force written back by the last dynamics
    /// solve, one entry per constrained degree of freedom.
    pub fn constraint_force(&self) -> &[fph] {
        &self.constraint_force[..self.dim()]
    }

    pub fn set_constraint_force(&mut self, cf: &[fph]) {
        assert_eq!(cf.len(), self.dim(), "constraint force dimension mismatch");
        self.constraint_force[..cf.len()].copy_from_slice(cf);
    }

    /// Whether the joint participates in solves.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// The 6×d constraint matrix in the `mak_i` frame. Columns are the unit
    /// wrenches `(m; f)` the joint can transmit. The universal joint's
    /// orthogonality column depends on the current pose `x_ij` of `mak_j`
    /// expressed in `mak_i` coordinates; the other kinds are constant.
    ///
    /// Only the leading `dim()` columns of the returned matrix are
    /// meaningful.
    pub fn local_cm(&self, x_ij: &Pose) -> SpatialMatrix {
        let mut cm = SpatialMatrix::zeros();
        match self.kind {
            JointKind::Revolute => {
                // Forces along x, y, z and torques about x, y.
                cm[(3, 0)] = 1.0;
                cm[(4, 1)] = 1.0;
                cm[(5, 2)] = 1.0;
                cm[(0, 3)] = 1.0;
                cm[(1, 4)] = 1.0;
            }
            JointKind::Prismatic => {
                // Forces along x, y and torques about x, y, z.
                cm[(3, 0)] = 1.0;
                cm[(4, 1)] = 1.0;
                cm[(0, 2)] = 1.0;
                cm[(1, 3)] = 1.0;
                cm[(2, 4)] = 1.0;
            }
            JointKind::Universal => {
                cm[(3, 0)] = 1.0;
                cm[(4, 1)] = 1.0;
                cm[(5, 2)] = 1.0;
                // Torque about the direction orthogonal to both rotation
                // axes: z_i × z_j, expressed in the mak_i frame.
                let z_j = x_ij.rotation * Vector3::z();
                let normal = Vector3::z().cross(&z_j);
                let normal = normal
                    .try_normalize(1e-12)
                    .unwrap_or_else(Vector3::x);
                cm[(0, 3)] = normal.x;
                cm[(1, 3)] = normal.y;
                cm[(2, 3)] = normal.z;
            }
            JointKind::Spherical => {
                cm[(3, 0)] = 1.0;
                cm[(4, 1)] = 1.0;
                cm[(5, 2)] = 1.0;
            }
        }
        cm
    }
}

/// Identifier of a joint within a model.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct JointId(pub(crate) usize);

impl JointId {
    /// The position of the joint in the model's joint pool.
    pub fn index(&self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::{Translation3, UnitQuaternion};

    fn dummy_marker(part: usize, index: usize) -> MarkerId {
        MarkerId {
            part: crate::part::PartId(part),
            index,
        }
    }

    #[test]
    fn should_expose_expected_dimensions() {
        assert_eq!(JointKind::Revolute.dim(), 5);
        assert_eq!(JointKind::Prismatic.dim(), 5);
        assert_eq!(JointKind::Universal.dim(), 4);
        assert_eq!(JointKind::Spherical.dim(), 3);
    }

    #[test]
    fn should_leave_rotation_about_z_unconstrained_for_revolute() {
        let joint = Joint::new(
            "j".into(),
            JointKind::Revolute,
            dummy_marker(0, 0),
            dummy_marker(1, 0),
        );
        let cm = joint.local_cm(&Pose::identity());
        // No column may transmit torque about z.
        for col in 0..joint.dim() {
            assert_abs_diff_eq!(cm[(2, col)], 0.0);
        }
    }

    #[test]
    fn should_orient_universal_normal_against_both_axes() {
        let joint = Joint::new(
            "u".into(),
            JointKind::Universal,
            dummy_marker(0, 0),
            dummy_marker(1, 0),
        );
        // mak_j rotated so its z-axis points along mak_i's x-axis, tilted a
        // little about z.
        let x_ij = Pose::from_parts(
            Translation3::identity(),
            UnitQuaternion::from_euler_angles(0.0, 1.2, 0.3),
        );
        let cm = joint.local_cm(&x_ij);
        let normal = Vector3::new(cm[(0, 3)], cm[(1, 3)], cm[(2, 3)]);
        let z_j = x_ij.rotation * Vector3::z();
        assert_abs_diff_eq!(normal.dot(&Vector3::z()), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(normal.dot(&z_j), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(normal.norm(), 1.0, epsilon = 1e-12);
    }
}
