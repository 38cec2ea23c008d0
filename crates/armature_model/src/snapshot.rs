//! Saving and loading model state as a self-describing text snapshot.
//!
//! The snapshot carries the full numeric state (time, gravity, part poses
//! and inertias, marker frames, constraint setpoints) with constraints
//! referencing markers by name, resolved back to indices on load. Saving a
//! loaded snapshot reproduces the original text byte for byte.

use crate::{Model, joint::JointKind};
use anyhow::{Context, Result, bail};
use armature_math::{Pose, SpatialMatrix, Twist, Wrench, fph};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MarkerRef {
    part: String,
    marker: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MarkerSnapshot {
    name: String,
    local_pose: Pose,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PartSnapshot {
    name: String,
    pose: Pose,
    velocity: Twist,
    acceleration: Twist,
    inertia: SpatialMatrix,
    markers: Vec<MarkerSnapshot>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct JointSnapshot {
    name: String,
    kind: JointKind,
    mak_i: MarkerRef,
    mak_j: MarkerRef,
    active: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MotionSnapshot {
    name: String,
    mak_i: MarkerRef,
    mak_j: MarkerRef,
    axis: usize,
    mp: fph,
    mv: fph,
    ma: fph,
    mf_dyn: fph,
    frc_coe: [fph; 3],
    active: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct GeneralMotionSnapshot {
    name: String,
    mak_i: MarkerRef,
    mak_j: MarkerRef,
    target_pose: Pose,
    target_velocity: Twist,
    target_acceleration: Twist,
    target_force: Wrench,
    active: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ForceSnapshot {
    name: String,
    mak_i: MarkerRef,
    mak_j: MarkerRef,
    component_axis: usize,
    fce: fph,
    active: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ModelSnapshot {
    time: fph,
    gravity: Twist,
    parts: Vec<PartSnapshot>,
    joints: Vec<JointSnapshot>,
    motions: Vec<MotionSnapshot>,
    general_motions: Vec<GeneralMotionSnapshot>,
    forces: Vec<ForceSnapshot>,
}

impl Model {
    /// Serializes the full model state to self-describing JSON text.
    pub fn save_snapshot(&self) -> String {
        let marker_ref = |id: crate::MarkerId| MarkerRef {
            part: self.part(id.part()).name().to_string(),
            marker: self.marker(id).name().to_string(),
        };

        let snapshot = ModelSnapshot {
            time: self.time(),
            gravity: *self.environment().gravity(),
            parts: self
                .parts()
                .iter()
                .map(|part| PartSnapshot {
                    name: part.name().to_string(),
                    pose: *part.pose(),
                    velocity: *part.velocity(),
                    acceleration: *part.acceleration(),
                    inertia: *part.inertia(),
                    markers: part
                        .markers()
                        .iter()
                        .map(|marker| MarkerSnapshot {
                            name: marker.name().to_string(),
                            local_pose: *marker.local_pose(),
                        })
                        .collect(),
                })
                .collect(),
            joints: self
                .joints()
                .iter()
                .map(|joint| JointSnapshot {
                    name: joint.name().to_string(),
                    kind: joint.kind(),
                    mak_i: marker_ref(joint.mak_i()),
                    mak_j: marker_ref(joint.mak_j()),
                    active: joint.is_active(),
                })
                .collect(),
            motions: self
                .motions()
                .iter()
                .map(|motion| MotionSnapshot {
                    name: motion.name().to_string(),
                    mak_i: marker_ref(motion.mak_i()),
                    mak_j: marker_ref(motion.mak_j()),
                    axis: motion.axis(),
                    mp: motion.mp(),
                    mv: motion.mv(),
                    ma: motion.ma(),
                    mf_dyn: motion.mf_dyn(),
                    frc_coe: *motion.frc_coe(),
                    active: motion.is_active(),
                })
                .collect(),
            general_motions: self
                .general_motions()
                .iter()
                .map(|gm| GeneralMotionSnapshot {
                    name: gm.name().to_string(),
                    mak_i: marker_ref(gm.mak_i()),
                    mak_j: marker_ref(gm.mak_j()),
                    target_pose: *gm.target_pose(),
                    target_velocity: *gm.target_velocity(),
                    target_acceleration: *gm.target_acceleration(),
                    target_force: *gm.target_force(),
                    active: gm.is_active(),
                })
                .collect(),
            forces: self
                .forces()
                .iter()
                .map(|force| ForceSnapshot {
                    name: force.name().to_string(),
                    mak_i: marker_ref(force.mak_i()),
                    mak_j: marker_ref(force.mak_j()),
                    component_axis: force.component_axis(),
                    fce: force.fce(),
                    active: force.is_active(),
                })
                .collect(),
        };

        serde_json::to_string_pretty(&snapshot).expect("model state is always serializable")
    }

    /// Reconstructs a model from snapshot text, resolving marker references
    /// by name.
    ///
    /// # Errors
    /// If the text cannot be parsed, the first part is not the ground, or a
    /// constraint references an unknown part or marker.
    pub fn load_snapshot(text: &str) -> Result<Self> {
        let snapshot: ModelSnapshot =
            serde_json::from_str(text).context("failed to parse model snapshot")?;

        if snapshot.parts.first().map(|p| p.name.as_str()) != Some("ground") {
            bail!("snapshot must list the ground part first");
        }

        let mut model = Model::new();
        model.set_time(snapshot.time);
        model.environment_mut().set_gravity(snapshot.gravity);

        for (index, part) in snapshot.parts.iter().enumerate() {
            let id = if index == 0 {
                Model::GROUND
            } else {
                model.add_part(&part.name, part.pose, part.inertia)?
            };
            {
                let part_ref = model.part_mut(id);
                part_ref.set_pose(part.pose);
                part_ref.set_velocity(part.velocity);
                part_ref.set_acceleration(part.acceleration);
                part_ref.set_inertia(part.inertia);
            }
            for marker in &part.markers {
                model.add_marker(id, &marker.name, marker.local_pose)?;
            }
        }

        let resolve = |model: &Model, reference: &MarkerRef| {
            model
                .find_marker(&reference.part, &reference.marker)
                .with_context(|| {
                    format!(
                        "unknown marker {:?} on part {:?}",
                        reference.marker, reference.part
                    )
                })
        };

        for joint in &snapshot.joints {
            let mak_i = resolve(&model, &joint.mak_i)?;
            let mak_j = resolve(&model, &joint.mak_j)?;
            model
                .joints
                .push(crate::Joint::new(joint.name.clone(), joint.kind, mak_i, mak_j));
            model.joints.last_mut().unwrap().set_active(joint.active);
        }

        for motion in &snapshot.motions {
            let mak_i = resolve(&model, &motion.mak_i)?;
            let mak_j = resolve(&model, &motion.mak_j)?;
            let id = model.add_motion_on_markers(&motion.name, mak_i, mak_j, motion.axis)?;
            let motion_ref = model.motion_mut(id);
            motion_ref.set_mp(motion.mp);
            motion_ref.set_mv(motion.mv);
            motion_ref.set_ma(motion.ma);
            motion_ref.set_mf_dyn(motion.mf_dyn);
            motion_ref.set_frc_coe(motion.frc_coe);
            motion_ref.set_active(motion.active);
        }

        for gm in &snapshot.general_motions {
            let mak_i = resolve(&model, &gm.mak_i)?;
            let mak_j = resolve(&model, &gm.mak_j)?;
            model.general_motions.push(crate::GeneralMotion::new(
                gm.name.clone(),
                mak_i,
                mak_j,
                gm.target_pose,
            ));
            let gm_ref = model.general_motions.last_mut().unwrap();
            gm_ref.set_target_velocity(gm.target_velocity);
            gm_ref.set_target_acceleration(gm.target_acceleration);
            gm_ref.set_target_force(gm.target_force);
            gm_ref.set_active(gm.active);
        }

        for force in &snapshot.forces {
            let mak_i = resolve(&model, &force.mak_i)?;
            let mak_j = resolve(&model, &force.mak_j)?;
            let id =
                model.add_single_component_force(&force.name, mak_i, mak_j, force.component_axis)?;
            let force_ref = model.force_mut(id);
            force_ref.set_fce(force.fce);
            force_ref.set_active(force.active);
        }

        model.init()?;
        Ok(model)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use armature_math::{Position, screw::spatial_inertia};
    use nalgebra::{Matrix3, UnitQuaternion, point, vector};

    fn sample_model() -> Model {
        let mut model = Model::new();
        let inertia = spatial_inertia(2.0, &Position::origin(), &Matrix3::identity());
        let link = model
            .add_part(
                "link",
                Pose::from_parts(
                    vector![0.0, 0.0, 0.2].into(),
                    UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
                ),
                inertia,
            )
            .unwrap();
        let joint = model
            .add_revolute_joint(
                "hinge",
                Model::GROUND,
                link,
                &point![0.0, 0.0, 0.0],
                &vector![0.0, 0.0, 1.0],
            )
            .unwrap();
        let motion = model.add_motion("drive", joint).unwrap();
        model.motion_mut(motion).set_mp(0.45);
        model.motion_mut(motion).set_frc_coe([0.1, 0.2, 0.3]);
        let pose = *model.part(link).pose();
        model
            .add_general_motion("tcp", link, Model::GROUND, &pose)
            .unwrap();
        model
    }

    #[test]
    fn should_round_trip_snapshot_text_bitwise() {
        let model = sample_model();
        let saved = model.save_snapshot();
        let loaded = Model::load_snapshot(&saved).unwrap();
        assert_eq!(loaded.save_snapshot(), saved);
    }

    #[test]
    fn should_preserve_numeric_state_across_round_trip() {
        let model = sample_model();
        let loaded = Model::load_snapshot(&model.save_snapshot()).unwrap();
        assert_eq!(loaded.n_parts(), model.n_parts());
        for (a, b) in loaded.parts().iter().zip(model.parts()) {
            assert_eq!(a.name(), b.name());
            assert_abs_diff_eq!(a.pose(), b.pose());
            assert_eq!(a.inertia(), b.inertia());
        }
        assert_eq!(loaded.motion_positions(), model.motion_positions());
    }

    #[test]
    fn should_reject_snapshot_with_unknown_marker() {
        let model = sample_model();
        // Rename the marker definition but not the joint's reference to it.
        let text = model.save_snapshot().replacen("hinge_j", "nonexistent", 1);
        assert!(Model::load_snapshot(&text).is_err());
    }

    #[test]
    fn should_reject_snapshot_without_leading_ground() {
        let model = sample_model();
        let text = model.save_snapshot().replacen("ground", "floor", 1);
        assert!(Model::load_snapshot(&text).is_err());
    }
}
