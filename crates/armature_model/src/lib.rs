//! The mechanism model container of the Armature multibody core.
//!
//! A [`Model`] owns insertion-ordered, name-unique pools of parts (each with
//! its own marker pool), joints, motions, general motions and forces,
//! together with the simulation time and the physical environment. Entities
//! refer to each other by stable typed indices; solvers live in
//! `armature_solver` and operate on the accessors exposed here.

pub mod adams;
pub mod environment;
pub mod force;
pub mod joint;
pub mod motion;
pub mod part;
pub mod snapshot;

pub use environment::Environment;
pub use force::{ForceId, SingleComponentForce};
pub use joint::{Joint, JointId, JointKind};
pub use motion::{FrictionCoefficients, GeneralMotion, GeneralMotionId, Motion, MotionId};
pub use part::{Marker, MarkerId, Part, PartId};

use anyhow::{Result, bail};
use armature_math::{Pose, Position, SpatialMatrix, Twist, fph, screw};
use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

/// A mechanism: a tree/graph of rigid parts connected by kinematic
/// constraints, plus applied forces and the environment.
#[derive(Clone, Debug)]
pub struct Model {
    time: fph,
    environment: Environment,
    parts: Vec<Part>,
    pub(crate) joints: Vec<Joint>,
    motions: Vec<Motion>,
    pub(crate) general_motions: Vec<GeneralMotion>,
    forces: Vec<SingleComponentForce>,
}

impl Model {
    /// The distinguished ground part present in every model.
    pub const GROUND: PartId = PartId(0);

    /// Creates an empty model containing only the ground part.
    pub fn new() -> Self {
        let ground = Part::new("ground".to_string(), Pose::identity(), SpatialMatrix::zeros());
        Self {
            time: 0.0,
            environment: Environment::new(),
            parts: vec![ground],
            joints: Vec::new(),
            motions: Vec::new(),
            general_motions: Vec::new(),
            forces: Vec::new(),
        }
    }

    /// The simulation time.
    pub fn time(&self) -> fph {
        self.time
    }

    pub fn set_time(&mut self, time: fph) {
        self.time = time;
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn environment_mut(&mut self) -> &mut Environment {
        &mut self.environment
    }

    /// The ground part.
    pub fn ground(&self) -> &Part {
        &self.parts[0]
    }

    // --- part pool ------------------------------------------------------

    /// Adds a rigid part with the given world pose and spatial inertia.
    ///
    /// # Errors
    /// If a part with the same name exists.
    pub fn add_part(&mut self, name: &str, pose: Pose, inertia: SpatialMatrix) -> Result<PartId> {
        if self.find_part(name).is_some() {
            bail!("a part named {name:?} already exists");
        }
        self.parts.push(Part::new(name.to_string(), pose, inertia));
        Ok(PartId(self.parts.len() - 1))
    }

    pub fn n_parts(&self) -> usize {
        self.parts.len()
    }

    pub fn part(&self, id: PartId) -> &Part {
        &self.parts[id.0]
    }

    /// The id of the part at the given pool position.
    ///
    /// # Panics
    /// If the position is out of range.
    pub fn part_id(&self, index: usize) -> PartId {
        assert!(index < self.parts.len(), "part index out of range");
        PartId(index)
    }

    pub fn part_mut(&mut self, id: PartId) -> &mut Part {
        &mut self.parts[id.0]
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Looks up a part by name.
    pub fn find_part(&self, name: &str) -> Option<PartId> {
        self.parts
            .iter()
            .position(|part| part.name() == name)
            .map(PartId)
    }

    // --- marker pool ----------------------------------------------------

    /// Adds a marker to a part, with its pose given in part coordinates.
    ///
    /// # Errors
    /// If the part already has a marker with the same name.
    pub fn add_marker(&mut self, part: PartId, name: &str, local_pose: Pose) -> Result<MarkerId> {
        let part_ref = &mut self.parts[part.0];
        if part_ref.find_marker(name).is_some() {
            bail!(
                "part {:?} already has a marker named {name:?}",
                part_ref.name()
            );
        }
        part_ref
            .markers_mut()
            .push(Marker::new(name.to_string(), local_pose));
        Ok(MarkerId {
            part,
            index: part_ref.markers().len() - 1,
        })
    }

    /// Adds a marker at the given world pose, converting to part
    /// coordinates.
    pub fn add_marker_at(&mut self, part: PartId, name: &str, world_pose: Pose) -> Result<MarkerId> {
        let local = self.parts[part.0].pose().inverse() * world_pose;
        self.add_marker(part, name, local)
    }

    pub fn marker(&self, id: MarkerId) -> &Marker {
        &self.parts[id.part.0].markers()[id.index]
    }

    /// The world pose of a marker.
    pub fn marker_world_pose(&self, id: MarkerId) -> Pose {
        let part = &self.parts[id.part.0];
        part.markers()[id.index].world_pose(part.pose())
    }

    /// Looks up a marker by part and marker name.
    pub fn find_marker(&self, part_name: &str, marker_name: &str) -> Option<MarkerId> {
        let part = self.find_part(part_name)?;
        let index = self.parts[part.0].find_marker(marker_name)?;
        Some(MarkerId { part, index })
    }

    // --- joint pool -----------------------------------------------------

    /// Adds a revolute joint between two parts, rotating about `axis`
    /// through `point` (both in world coordinates).
    pub fn add_revolute_joint(
        &mut self,
        name: &str,
        first_part: PartId,
        second_part: PartId,
        point: &Position,
        axis: &Vector3<fph>,
    ) -> Result<JointId> {
        let frame = frame_from_z_axis(point, axis, axis);
        self.add_joint_at_frames(name, JointKind::Revolute, first_part, second_part, &frame, &frame)
    }

    /// Adds a prismatic joint between two parts, translating along `axis`
    /// through `point` (both in world coordinates).
    pub fn add_prismatic_joint(
        &mut self,
        name: &str,
        first_part: PartId,
        second_part: PartId,
        point: &Position,
        axis: &Vector3<fph>,
    ) -> Result<JointId> {
        let frame = frame_from_z_axis(point, axis, axis);
        self.add_joint_at_frames(
            name,
            JointKind::Prismatic,
            first_part,
            second_part,
            &frame,
            &frame,
        )
    }

    /// Adds a universal joint between two parts. `first_axis` (fixed to the
    /// first part) and `second_axis` (fixed to the second part) must be
    /// orthogonal and intersect at `point`, all in world coordinates.
    pub fn add_universal_joint(
        &mut self,
        name: &str,
        first_part: PartId,
        second_part: PartId,
        point: &Position,
        first_axis: &Vector3<fph>,
        second_axis: &Vector3<fph>,
    ) -> Result<JointId> {
        let frame_i = frame_from_z_axis(point, first_axis, second_axis);
        let frame_j = frame_from_z_axis(point, second_axis, first_axis);
        self.add_joint_at_frames(
            name,
            JointKind::Universal,
            first_part,
            second_part,
            &frame_i,
            &frame_j,
        )
    }

    /// Adds a spherical joint between two parts, centered at `point` in
    /// world coordinates.
    pub fn add_spherical_joint(
        &mut self,
        name: &str,
        first_part: PartId,
        second_part: PartId,
        point: &Position,
    ) -> Result<JointId> {
        let frame = Pose::from_parts(point.coords.into(), UnitQuaternion::identity());
        self.add_joint_at_frames(
            name,
            JointKind::Spherical,
            first_part,
            second_part,
            &frame,
            &frame,
        )
    }

    fn add_joint_at_frames(
        &mut self,
        name: &str,
        kind: JointKind,
        first_part: PartId,
        second_part: PartId,
        frame_i: &Pose,
        frame_j: &Pose,
    ) -> Result<JointId> {
        if self.find_joint(name).is_some() {
            bail!("a joint named {name:?} already exists");
        }
        if first_part == second_part {
            bail!("joint {name:?} must connect two distinct parts");
        }
        let mak_i = self.add_marker_at(first_part, &format!("{name}_i"), *frame_i)?;
        let mak_j = self.add_marker_at(second_part, &format!("{name}_j"), *frame_j)?;
        self.joints
            .push(Joint::new(name.to_string(), kind, mak_i, mak_j));
        Ok(JointId(self.joints.len() - 1))
    }

    pub fn n_joints(&self) -> usize {
        self.joints.len()
    }

    pub fn joint(&self, id: JointId) -> &Joint {
        &self.joints[id.0]
    }

    pub fn joint_mut(&mut self, id: JointId) -> &mut Joint {
        &mut self.joints[id.0]
    }

    pub fn joints(&self) -> &[Joint] {
        &self.joints
    }

    pub fn joints_mut(&mut self) -> &mut [Joint] {
        &mut self.joints
    }

    /// Looks up a joint by name.
    pub fn find_joint(&self, name: &str) -> Option<JointId> {
        self.joints
            .iter()
            .position(|joint| joint.name() == name)
            .map(JointId)
    }

    // --- motion pool ----------------------------------------------------

    /// Adds a motion driving the given joint's free axis.
    ///
    /// # Errors
    /// If the joint kind does not support a scalar drive (universal and
    /// spherical joints do not), or the name is taken.
    pub fn add_motion(&mut self, name: &str, joint: JointId) -> Result<MotionId> {
        let joint = &self.joints[joint.0];
        let axis = match joint.kind() {
            JointKind::Revolute => 2,
            JointKind::Prismatic => 5,
            kind => bail!("cannot drive a {kind:?} joint with a scalar motion"),
        };
        self.add_motion_on_markers(name, joint.mak_i(), joint.mak_j(), axis)
    }

    /// Adds a motion constraining one spatial axis between two markers.
    pub fn add_motion_on_markers(
        &mut self,
        name: &str,
        mak_i: MarkerId,
        mak_j: MarkerId,
        axis: usize,
    ) -> Result<MotionId> {
        if self.find_motion(name).is_some() {
            bail!("a motion named {name:?} already exists");
        }
        self.motions
            .push(Motion::new(name.to_string(), mak_i, mak_j, axis));
        Ok(MotionId(self.motions.len() - 1))
    }

    pub fn n_motions(&self) -> usize {
        self.motions.len()
    }

    pub fn motion(&self, id: MotionId) -> &Motion {
        &self.motions[id.0]
    }

    pub fn motion_mut(&mut self, id: MotionId) -> &mut Motion {
        &mut self.motions[id.0]
    }

    pub fn motions(&self) -> &[Motion] {
        &self.motions
    }

    pub fn motions_mut(&mut self) -> &mut [Motion] {
        &mut self.motions
    }

    /// Looks up a motion by name.
    pub fn find_motion(&self, name: &str) -> Option<MotionId> {
        self.motions
            .iter()
            .position(|motion| motion.name() == name)
            .map(MotionId)
    }

    // --- general motion pool --------------------------------------------

    /// Adds a 6-DOF prescribed motion of `end_effector` relative to
    /// `reference`, with the target pose given in the reference part's
    /// coordinates. Markers are inserted on both parts so that the residual
    /// vanishes at the current configuration.
    pub fn add_general_motion(
        &mut self,
        name: &str,
        end_effector: PartId,
        reference: PartId,
        target_pose: &Pose,
    ) -> Result<GeneralMotionId> {
        if self.find_general_motion(name).is_some() {
            bail!("a general motion named {name:?} already exists");
        }
        let target_in_world = self.parts[reference.0].pose() * target_pose;
        let mak_i = self.add_marker_at(end_effector, &format!("{name}_i"), target_in_world)?;
        let mak_j = self.add_marker(reference, &format!("{name}_j"), Pose::identity())?;
        self.general_motions.push(GeneralMotion::new(
            name.to_string(),
            mak_i,
            mak_j,
            *target_pose,
        ));
        Ok(GeneralMotionId(self.general_motions.len() - 1))
    }

    pub fn n_general_motions(&self) -> usize {
        self.general_motions.len()
    }

    pub fn general_motion(&self, id: GeneralMotionId) -> &GeneralMotion {
        &self.general_motions[id.0]
    }

    pub fn general_motion_mut(&mut self, id: GeneralMotionId) -> &mut GeneralMotion {
        &mut self.general_motions[id.0]
    }

    pub fn general_motions(&self) -> &[GeneralMotion] {
        &self.general_motions
    }

    pub fn general_motions_mut(&mut self) -> &mut [GeneralMotion] {
        &mut self.general_motions
    }

    /// Looks up a general motion by name.
    pub fn find_general_motion(&self, name: &str) -> Option<GeneralMotionId> {
        self.general_motions
            .iter()
            .position(|gm| gm.name() == name)
            .map(GeneralMotionId)
    }

    // --- force pool -----------------------------------------------------

    /// Adds a single-component force between two markers.
    pub fn add_single_component_force(
        &mut self,
        name: &str,
        mak_i: MarkerId,
        mak_j: MarkerId,
        component_axis: usize,
    ) -> Result<ForceId> {
        if self.find_force(name).is_some() {
            bail!("a force named {name:?} already exists");
        }
        self.forces.push(SingleComponentForce::new(
            name.to_string(),
            mak_i,
            mak_j,
            component_axis,
        ));
        Ok(ForceId(self.forces.len() - 1))
    }

    pub fn n_forces(&self) -> usize {
        self.forces.len()
    }

    pub fn force(&self, id: ForceId) -> &SingleComponentForce {
        &self.forces[id.0]
    }

    pub fn force_mut(&mut self, id: ForceId) -> &mut SingleComponentForce {
        &mut self.forces[id.0]
    }

    pub fn forces(&self) -> &[SingleComponentForce] {
        &self.forces
    }

    /// Looks up a force by name.
    pub fn find_force(&self, name: &str) -> Option<ForceId> {
        self.forces
            .iter()
            .position(|force| force.name() == name)
            .map(ForceId)
    }

    /// Recomputes every force's world wrenches from the current model state.
    pub fn update_force_wrenches(&mut self) {
        for i in 0..self.forces.len() {
            let pose = self.marker_world_pose(self.forces[i].mak_i());
            self.forces[i].update_wrenches(&pose);
        }
    }

    // --- state dispatchers ----------------------------------------------

    /// Sets all motion positions from a slice ordered like the motion pool.
    ///
    /// # Panics
    /// If the slice length differs from the number of motions.
    pub fn set_motion_positions(&mut self, mp: &[fph]) {
        assert_eq!(mp.len(), self.motions.len(), "motion count mismatch");
        for (motion, &value) in self.motions.iter_mut().zip(mp) {
            motion.set_mp(value);
        }
    }

    /// All motion positions, ordered like the motion pool.
    pub fn motion_positions(&self) -> Vec<fph> {
        self.motions.iter().map(Motion::mp).collect()
    }

    /// Sets all motion velocities.
    ///
    /// # Panics
    /// If the slice length differs from the number of motions.
    pub fn set_motion_velocities(&mut self, mv: &[fph]) {
        assert_eq!(mv.len(), self.motions.len(), "motion count mismatch");
        for (motion, &value) in self.motions.iter_mut().zip(mv) {
            motion.set_mv(value);
        }
    }

    /// All motion velocities, ordered like the motion pool.
    pub fn motion_velocities(&self) -> Vec<fph> {
        self.motions.iter().map(Motion::mv).collect()
    }

    /// Sets all motion accelerations.
    ///
    /// # Panics
    /// If the slice length differs from the number of motions.
    pub fn set_motion_accelerations(&mut self, ma: &[fph]) {
        assert_eq!(ma.len(), self.motions.len(), "motion count mismatch");
        for (motion, &value) in self.motions.iter_mut().zip(ma) {
            motion.set_ma(value);
        }
    }

    /// All motion accelerations, ordered like the motion pool.
    pub fn motion_accelerations(&self) -> Vec<fph> {
        self.motions.iter().map(Motion::ma).collect()
    }

    /// Sets all total motor forces.
    ///
    /// # Panics
    /// If the slice length differs from the number of motions.
    pub fn set_motion_forces(&mut self, mf: &[fph]) {
        assert_eq!(mf.len(), self.motions.len(), "motion count mismatch");
        for (motion, &value) in self.motions.iter_mut().zip(mf) {
            motion.set_mf(value);
        }
    }

    /// All total motor forces, ordered like the motion pool.
    pub fn motion_forces(&self) -> Vec<fph> {
        self.motions.iter().map(Motion::mf).collect()
    }

    /// Sets the target pose of the end effector addressed by `which`.
    pub fn set_end_effector_pose(&mut self, pose: &Pose, which: GeneralMotionId) {
        self.general_motions[which.0].set_target_pose(*pose);
    }

    /// The target pose of the end effector addressed by `which`.
    pub fn end_effector_pose(&self, which: GeneralMotionId) -> &Pose {
        self.general_motions[which.0].target_pose()
    }

    /// The pose of one marker expressed in another marker's frame.
    pub fn relative_pose(&self, of: MarkerId, relative_to: MarkerId) -> Pose {
        self.marker_world_pose(relative_to).inverse() * self.marker_world_pose(of)
    }

    /// The spatial velocity of one marker's part relative to another's,
    /// expressed in the reference marker's frame about its origin.
    pub fn relative_velocity(&self, of: MarkerId, relative_to: MarkerId) -> Twist {
        let reference = self.marker_world_pose(relative_to).inverse();
        let vs_m = *self.part(of.part()).velocity();
        let vs_n = *self.part(relative_to.part()).velocity();
        screw::tf_twist(&reference, &(vs_m - vs_n))
    }

    /// The spatial acceleration of one marker's part relative to another's,
    /// expressed in the reference marker's frame about its origin. The time
    /// derivative of [`Self::relative_velocity`]: the reference frame's own
    /// motion contributes a convective term.
    pub fn relative_acceleration(&self, of: MarkerId, relative_to: MarkerId) -> Twist {
        let reference = self.marker_world_pose(relative_to).inverse();
        let vs_m = *self.part(of.part()).velocity();
        let vs_n = *self.part(relative_to.part()).velocity();
        let as_m = *self.part(of.part()).acceleration();
        let as_n = *self.part(relative_to.part()).acceleration();
        screw::tf_twist(&reference, &(as_m - as_n))
            - screw::tf_twist(&reference, &screw::cross_twist(&vs_n, &(vs_m - vs_n)))
    }

    // --- lifecycle ------------------------------------------------------

    /// Removes every joint, motion, general motion and force; parts and
    /// their markers stay. Only permitted between solver runs, and every
    /// solver must re-allocate its buffers afterwards.
    pub fn clear_constraints(&mut self) {
        self.joints.clear();
        self.motions.clear();
        self.general_motions.clear();
        self.forces.clear();
    }

    /// Removes every entity, leaving only a pristine ground part.
    pub fn clear(&mut self) {
        self.clear_constraints();
        self.parts.truncate(1);
        self.parts[0] = Part::new("ground".to_string(), Pose::identity(), SpatialMatrix::zeros());
    }


    /// Validates the model's referential invariants: every constraint and
    /// force references two distinct, existing markers.
    ///
    /// # Errors
    /// On the first violated invariant.
    pub fn init(&self) -> Result<()> {
        let check = |what: &str, name: &str, mak_i: MarkerId, mak_j: MarkerId| -> Result<()> {
            for mak in [mak_i, mak_j] {
                if mak.part.0 >= self.parts.len() {
                    bail!("{what} {name:?} references a part outside the pool");
                }
                if mak.index >= self.parts[mak.part.0].markers().len() {
                    bail!("{what} {name:?} references a marker outside its part's pool");
                }
            }
            if mak_i == mak_j {
                bail!("{what} {name:?} must reference two distinct markers");
            }
            Ok(())
        };
        for joint in &self.joints {
            check("joint", joint.name(), joint.mak_i(), joint.mak_j())?;
        }
        for motion in &self.motions {
            check("motion", motion.name(), motion.mak_i(), motion.mak_j())?;
        }
        for gm in &self.general_motions {
            check("general motion", gm.name(), gm.mak_i(), gm.mak_j())?;
        }
        for force in &self.forces {
            check("force", force.name(), force.mak_i(), force.mak_j())?;
        }
        Ok(())
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a world frame at `origin` whose z-axis is `z` and whose x-axis is
/// the component of `x_hint` orthogonal to `z`. Falls back to an arbitrary
/// perpendicular when the hint is parallel to `z`.
///
/// # Panics
/// If `z` has zero length.
pub fn frame_from_z_axis(origin: &Position, z: &Vector3<fph>, x_hint: &Vector3<fph>) -> Pose {
    let z = z
        .try_normalize(1e-12)
        .expect("joint axis must have nonzero length");
    let mut x = x_hint - z * z.dot(x_hint);
    if x.norm() < 1e-9 {
        let fallback = if z.x.abs() < 0.9 {
            Vector3::x()
        } else {
            Vector3::y()
        };
        x = fallback - z * z.dot(&fallback);
    }
    let x = x.normalize();
    let y = z.cross(&x);
    let rotation = Rotation3::from_matrix_unchecked(Matrix3::from_columns(&[x, y, z]));
    Pose::from_parts(
        origin.coords.into(),
        UnitQuaternion::from_rotation_matrix(&rotation),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use armature_math::screw::spatial_inertia;
    use nalgebra::{point, vector};

    fn unit_inertia() -> SpatialMatrix {
        spatial_inertia(1.0, &Position::origin(), &Matrix3::identity())
    }

    #[test]
    fn should_contain_ground_in_new_model() {
        let model = Model::new();
        assert_eq!(model.n_parts(), 1);
        assert_eq!(model.ground().name(), "ground");
        assert_abs_diff_eq!(model.ground().pose(), &Pose::identity());
    }

    #[test]
    fn should_reject_duplicate_part_names() {
        let mut model = Model::new();
        model
            .add_part("link", Pose::identity(), unit_inertia())
            .unwrap();
        assert!(model.add_part("link", Pose::identity(), unit_inertia()).is_err());
    }

    #[test]
    fn should_reject_duplicate_marker_names_within_a_part() {
        let mut model = Model::new();
        let part = model
            .add_part("link", Pose::identity(), unit_inertia())
            .unwrap();
        model.add_marker(part, "tip", Pose::identity()).unwrap();
        assert!(model.add_marker(part, "tip", Pose::identity()).is_err());
        // The same name on another part is fine.
        assert!(model
            .add_marker(Model::GROUND, "tip", Pose::identity())
            .is_ok());
    }

    #[test]
    fn should_reject_motion_on_spherical_joint() {
        let mut model = Model::new();
        let part = model
            .add_part("link", Pose::identity(), unit_inertia())
            .unwrap();
        let joint = model
            .add_spherical_joint("ball", Model::GROUND, part, &point![0.0, 0.0, 0.0])
            .unwrap();
        assert!(model.add_motion("drive", joint).is_err());
    }

    #[test]
    fn should_place_joint_markers_coincident_in_world() {
        let mut model = Model::new();
        let part = model
            .add_part(
                "link",
                Pose::from_parts(vector![0.0, 0.5, 0.0].into(), UnitQuaternion::identity()),
                unit_inertia(),
            )
            .unwrap();
        let joint = model
            .add_revolute_joint(
                "hinge",
                Model::GROUND,
                part,
                &point![0.1, 0.2, 0.3],
                &vector![0.0, 0.0, 1.0],
            )
            .unwrap();
        let joint = model.joint(joint);
        let w_i = model.marker_world_pose(joint.mak_i());
        let w_j = model.marker_world_pose(joint.mak_j());
        assert_abs_diff_eq!(w_i, w_j, epsilon = 1e-13);
        assert_abs_diff_eq!(
            w_i.translation.vector,
            vector![0.1, 0.2, 0.3],
            epsilon = 1e-13
        );
        // The marker z-axis is the joint axis.
        assert_abs_diff_eq!(
            w_i.rotation * Vector3::z(),
            vector![0.0, 0.0, 1.0],
            epsilon = 1e-13
        );
    }

    #[test]
    fn should_orient_universal_markers_along_their_axes() {
        let mut model = Model::new();
        let part = model
            .add_part("link", Pose::identity(), unit_inertia())
            .unwrap();
        let joint = model
            .add_universal_joint(
                "u",
                Model::GROUND,
                part,
                &point![0.0, 0.0, 1.0],
                &vector![1.0, 0.0, 0.0],
                &vector![0.0, 1.0, 0.0],
            )
            .unwrap();
        let joint = model.joint(joint);
        let w_i = model.marker_world_pose(joint.mak_i());
        let w_j = model.marker_world_pose(joint.mak_j());
        assert_abs_diff_eq!(w_i.rotation * Vector3::z(), vector![1.0, 0.0, 0.0], epsilon = 1e-13);
        assert_abs_diff_eq!(w_j.rotation * Vector3::z(), vector![0.0, 1.0, 0.0], epsilon = 1e-13);
    }

    #[test]
    fn should_start_general_motion_with_zero_residual_target() {
        let mut model = Model::new();
        let pose = Pose::from_parts(vector![0.3, 0.0, 0.8].into(), UnitQuaternion::identity());
        let part = model.add_part("ee", pose, unit_inertia()).unwrap();
        let target = pose;
        let gm = model
            .add_general_motion("tcp", part, Model::GROUND, &target)
            .unwrap();
        let gm = model.general_motion(gm);
        let w_i = model.marker_world_pose(gm.mak_i());
        let w_j = model.marker_world_pose(gm.mak_j());
        assert_abs_diff_eq!(w_j.inverse() * w_i, target, epsilon = 1e-13);
    }

    #[test]
    fn should_dispatch_motion_state() {
        let mut model = Model::new();
        let part = model
            .add_part("link", Pose::identity(), unit_inertia())
            .unwrap();
        let joint = model
            .add_revolute_joint(
                "hinge",
                Model::GROUND,
                part,
                &point![0.0, 0.0, 0.0],
                &vector![0.0, 0.0, 1.0],
            )
            .unwrap();
        model.add_motion("drive", joint).unwrap();
        model.set_motion_positions(&[0.7]);
        model.set_motion_velocities(&[-0.2]);
        assert_abs_diff_eq!(model.motion_positions()[0], 0.7);
        assert_abs_diff_eq!(model.motion_velocities()[0], -0.2);
    }

    #[test]
    fn should_measure_relative_velocity_in_reference_marker_frame() {
        let mut model = Model::new();
        let part = model
            .add_part("link", Pose::identity(), unit_inertia())
            .unwrap();
        model
            .part_mut(part)
            .set_velocity(Twist::new(0.0, 0.0, 1.0, 0.0, 0.0, 0.0));
        let tip = model.add_marker(part, "tip", Pose::identity()).unwrap();

        // A reference at the world origin sees the raw part velocity.
        let origin = model
            .add_marker(Model::GROUND, "origin", Pose::identity())
            .unwrap();
        assert_abs_diff_eq!(
            model.relative_velocity(tip, origin),
            *model.part(part).velocity(),
            epsilon = 1e-13
        );

        // A translated reference picks up the moment-arm term.
        let offset = model
            .add_marker(
                Model::GROUND,
                "offset",
                Pose::from_parts(vector![1.0, 0.0, 0.0].into(), UnitQuaternion::identity()),
            )
            .unwrap();
        assert_abs_diff_eq!(
            model.relative_velocity(tip, offset),
            Twist::new(0.0, 0.0, 1.0, 0.0, 1.0, 0.0),
            epsilon = 1e-13
        );
    }

    #[test]
    fn should_vanish_relative_state_between_markers_on_one_part() {
        let mut model = Model::new();
        let part = model
            .add_part("link", Pose::identity(), unit_inertia())
            .unwrap();
        model
            .part_mut(part)
            .set_velocity(Twist::new(0.1, -0.2, 0.3, 0.4, -0.5, 0.6));
        model
            .part_mut(part)
            .set_acceleration(Twist::new(-0.3, 0.2, 0.1, 0.5, 0.4, -0.6));
        let a = model.add_marker(part, "a", Pose::identity()).unwrap();
        let b = model
            .add_marker(
                part,
                "b",
                Pose::from_parts(vector![0.2, -0.1, 0.3].into(), UnitQuaternion::identity()),
            )
            .unwrap();
        assert_abs_diff_eq!(model.relative_velocity(a, b), Twist::zeros(), epsilon = 1e-13);
        assert_abs_diff_eq!(
            model.relative_acceleration(a, b),
            Twist::zeros(),
            epsilon = 1e-13
        );
    }

    #[test]
    fn should_measure_relative_acceleration_against_stationary_reference() {
        let mut model = Model::new();
        let part = model
            .add_part("link", Pose::identity(), unit_inertia())
            .unwrap();
        let acceleration = Twist::new(0.0, 0.5, 0.0, 0.0, 0.0, -0.7);
        model.part_mut(part).set_acceleration(acceleration);
        let tip = model.add_marker(part, "tip", Pose::identity()).unwrap();
        let origin = model
            .add_marker(Model::GROUND, "origin", Pose::identity())
            .unwrap();
        assert_abs_diff_eq!(
            model.relative_acceleration(tip, origin),
            acceleration,
            epsilon = 1e-13
        );
    }

    proptest::proptest! {
        #[test]
        fn should_compose_marker_world_pose_from_part_pose(
            px in -2.0..2.0f64,
            py in -2.0..2.0f64,
            pz in -2.0..2.0f64,
            axis in -1.5..1.5f64,
            mx in -1.0..1.0f64,
        ) {
            let mut model = Model::new();
            let pose = Pose::from_parts(
                vector![px, py, pz].into(),
                UnitQuaternion::from_scaled_axis(vector![0.3 * axis, axis, -0.2 * axis]),
            );
            let part = model.add_part("link", pose, unit_inertia()).unwrap();
            let local = Pose::from_parts(
                vector![mx, 0.1, -0.4].into(),
                UnitQuaternion::from_scaled_axis(vector![0.0, mx, 0.5]),
            );
            let marker = model.add_marker(part, "frame", local).unwrap();
            let world = model.marker_world_pose(marker);
            let expected = pose * local;
            let defect = (world.to_homogeneous() - expected.to_homogeneous()).norm();
            proptest::prop_assert!(defect < 1e-12);
        }
    }

    #[test]
    fn should_validate_marker_references_on_init() {
        let mut model = Model::new();
        let part = model
            .add_part("link", Pose::identity(), unit_inertia())
            .unwrap();
        model
            .add_revolute_joint(
                "hinge",
                Model::GROUND,
                part,
                &point![0.0, 0.0, 0.0],
                &vector![0.0, 0.0, 1.0],
            )
            .unwrap();
        assert!(model.init().is_ok());
    }
}
