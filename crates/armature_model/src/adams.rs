//! Export of a model to an Adams/View command script.
//!
//! Only a structural dump is produced: parts with their mass properties,
//! markers, the constraints and the applied forces, enough for the Adams
//! side to rebuild and cross-check the mechanism. Solver state is not
//! exported.

use crate::{JointKind, Model};
use anyhow::Result;
use armature_math::{EulerOrder, Pose, euler};
use std::io::Write;

fn location(pose: &Pose) -> String {
    let pe = euler::pose_to_pe(pose, EulerOrder::ZXZ);
    format!(
        "location = {}, {}, {} &\n    orientation = {}d, {}d, {}d",
        pe[0],
        pe[1],
        pe[2],
        pe[3].to_degrees(),
        pe[4].to_degrees(),
        pe[5].to_degrees()
    )
}

impl Model {
    /// Writes the model as an Adams/View command script.
    pub fn write_adams_cmd(&self, out: &mut impl Write) -> Result<()> {
        writeln!(out, "!----- model: exported by armature -----")?;
        writeln!(out, "model create &\n    model_name = .model")?;
        writeln!(out)?;

        for (part_index, part) in self.parts().iter().enumerate().skip(1) {
            writeln!(
                out,
                "part create rigid_body name_and_position &\n    part_name = .model.{} &\n    adams_id = {} &\n    {}",
                part.name(),
                part_index + 1,
                location(part.pose())
            )?;
            for marker in part.markers() {
                writeln!(
                    out,
                    "marker create &\n    marker_name = .model.{}.{} &\n    {}",
                    part.name(),
                    marker.name(),
                    location(marker.local_pose())
                )?;
            }
            writeln!(out)?;
        }
        for marker in self.ground().markers() {
            writeln!(
                out,
                "marker create &\n    marker_name = .model.ground.{} &\n    {}",
                marker.name(),
                location(marker.local_pose())
            )?;
        }
        writeln!(out)?;

        for joint in self.joints() {
            let kind = match joint.kind() {
                JointKind::Revolute => "revolute",
                JointKind::Prismatic => "translational",
                JointKind::Universal => "universal",
                JointKind::Spherical => "spherical",
            };
            writeln!(
                out,
                "constraint create joint {kind} &\n    joint_name = .model.{} &\n    i_marker_name = .model.{}.{} &\n    j_marker_name = .model.{}.{}",
                joint.name(),
                self.part(joint.mak_i().part()).name(),
                self.marker(joint.mak_i()).name(),
                self.part(joint.mak_j().part()).name(),
                self.marker(joint.mak_j()).name(),
            )?;
        }
        writeln!(out)?;

        for (index, motion) in self.motions().iter().enumerate() {
            writeln!(
                out,
                "constraint create motion_generator &\n    motion_name = .model.{} &\n    adams_id = {} &\n    function = \"{}\"",
                motion.name(),
                index + 1,
                motion.mp(),
            )?;
        }
        writeln!(out)?;

        for force in self.forces() {
            writeln!(
                out,
                "force create direct single_component_force &\n    sforce_name = .model.{} &\n    i_marker_name = .model.{}.{} &\n    j_marker_name = .model.{}.{} &\n    function = \"{}\"",
                force.name(),
                self.part(force.mak_i().part()).name(),
                self.marker(force.mak_i()).name(),
                self.part(force.mak_j().part()).name(),
                self.marker(force.mak_j()).name(),
                force.fce(),
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use armature_math::SpatialMatrix;
    use nalgebra::{point, vector};

    #[test]
    fn should_emit_parts_and_constraints() {
        let mut model = Model::new();
        let link = model
            .add_part("link", Pose::identity(), SpatialMatrix::identity())
            .unwrap();
        model
            .add_revolute_joint(
                "hinge",
                Model::GROUND,
                link,
                &point![0.0, 0.0, 0.0],
                &vector![0.0, 0.0, 1.0],
            )
            .unwrap();

        let mut buffer = Vec::new();
        model.write_adams_cmd(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("part create rigid_body"));
        assert!(text.contains("constraint create joint revolute"));
        assert!(text.contains(".model.link.hinge_j"));
    }
}
