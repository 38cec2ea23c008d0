//! Rigid parts and the coordinate markers attached to them.

use armature_math::{EulerOrder, Pose, SpatialMatrix, Twist, euler, fph};

/// A rigid body. Its pose, spatial velocity and spatial acceleration are
/// expressed in the world frame (about the world origin); the spatial
/// inertia is expressed in the part's own frame about the part origin.
#[derive(Clone, Debug)]
pub struct Part {
    name: String,
    pose: Pose,
    velocity: Twist,
    acceleration: Twist,
    inertia: SpatialMatrix,
    markers: Vec<Marker>,
}

/// A coordinate frame rigidly attached to a part, stored as a pose in part
/// coordinates.
#[derive(Clone, Debug)]
pub struct Marker {
    name: String,
    local_pose: Pose,
}

impl Part {
    pub(crate) fn new(name: String, pose: Pose, inertia: SpatialMatrix) -> Self {
        Self {
            name,
            pose,
            velocity: Twist::zeros(),
            acceleration: Twist::zeros(),
            inertia,
            markers: Vec::new(),
        }
    }

    /// The name of the part, unique within the model's part pool.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pose of the part in the world frame.
    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    pub fn set_pose(&mut self, pose: Pose) {
        self.pose = pose;
    }

    /// The pose as `[x, y, z]` plus Euler angles of the given convention.
    pub fn pose_pe(&self, order: EulerOrder) -> [fph; 6] {
        euler::pose_to_pe(&self.pose, order)
    }

    pub fn set_pose_pe(&mut self, pe: &[fph; 6], order: EulerOrder) {
        self.pose = euler::pe_to_pose(pe, order);
    }

    /// The pose as `[x, y, z, qx, qy, qz, qw]`.
    pub fn pose_pq(&self) -> [fph; 7] {
        euler::pose_to_pq(&self.pose)
    }

    pub fn set_pose_pq(&mut self, pq: &[fph; 7]) {
        self.pose = euler::pq_to_pose(pq);
    }

    /// The spatial velocity `(ω; v)` of the part in the world frame, about
    /// the world origin.
    pub fn velocity(&self) -> &Twist {
        &self.velocity
    }

    pub fn set_velocity(&mut self, velocity: Twist) {
        self.velocity = velocity;
    }

    /// The spatial acceleration of the part in the world frame, about the
    /// world origin (the time derivative of [`Self::velocity`]).
    pub fn acceleration(&self) -> &Twist {
        &self.acceleration
    }

    pub fn set_acceleration(&mut self, acceleration: Twist) {
        self.acceleration = acceleration;
    }

    /// The 6×6 spatial inertia of the part in its own frame.
    pub fn inertia(&self) -> &SpatialMatrix {
        &self.inertia
    }

    pub fn set_inertia(&mut self, inertia: SpatialMatrix) {
        self.inertia = inertia;
    }

    /// The spatial inertia of the part expressed in the world frame.
    pub fn world_inertia(&self) -> SpatialMatrix {
        armature_math::screw::tf_inertia(&self.pose, &self.inertia)
    }

    /// The markers attached to this part, in insertion order.
    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub(crate) fn markers_mut(&mut self) -> &mut Vec<Marker> {
        &mut self.markers
    }

    /// Looks up a marker by name.
    pub fn find_marker(&self, name: &str) -> Option<usize> {
        self.markers.iter().position(|marker| marker.name == name)
    }
}

impl Marker {
    pub(crate) fn new(name: String, local_pose: Pose) -> Self {
        Self { name, local_pose }
    }

    /// The name of the marker, unique within its part's marker pool.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pose of the marker in part coordinates.
    pub fn local_pose(&self) -> &Pose {
        &self.local_pose
    }

    pub fn set_local_pose(&mut self, local_pose: Pose) {
        self.local_pose = local_pose;
    }

    /// The pose of the marker in the world frame, given its part's pose.
    pub fn world_pose(&self, part_pose: &Pose) -> Pose {
        part_pose * self.local_pose
    }
}

/// Identifier of a part within a model.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartId(pub(crate) usize);

/// Identifier of a marker within a model.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MarkerId {
    pub(crate) part: PartId,
    pub(crate) index: usize,
}

impl PartId {
    /// The position of the part in the model's part pool.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl MarkerId {
    /// The part the marker is attached to.
    pub fn part(&self) -> PartId {
        self.part
    }

    /// The position of the marker in its part's marker pool.
    pub fn index(&self) -> usize {
        self.index
    }
}
