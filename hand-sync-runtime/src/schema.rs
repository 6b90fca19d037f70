use anyhow::{ensure, Result};
use glam::{Quat, Vec3};

use crate::types::SkeletonState;

/// Flat wire record: every component of every field, in schema order.
pub type PoseFrame = Vec<f32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Vec3,
    /// x, y, z, w
    Quat,
}

impl FieldKind {
    pub fn width(self) -> usize {
        match self {
            FieldKind::Vec3 => 3,
            FieldKind::Quat => 4,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            FieldKind::Vec3 => "vec3",
            FieldKind::Quat => "quat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub count: usize,
}

/// Ordered description of a pose frame. There is no header on the wire,
/// so two peers can only talk if their schemas are equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoseSchema {
    fields: Vec<FieldSpec>,
}

impl PoseSchema {
    /// Wrist position, `joint_count` joint rotations, scale.
    pub fn hand(joint_count: usize) -> Self {
        Self {
            fields: vec![
                FieldSpec {
                    name: "wrist_position",
                    kind: FieldKind::Vec3,
                    count: 1,
                },
                FieldSpec {
                    name: "joint_rotations",
                    kind: FieldKind::Quat,
                    count: joint_count,
                },
                FieldSpec {
                    name: "scale",
                    kind: FieldKind::Vec3,
                    count: 1,
                },
            ],
        }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn joint_count(&self) -> usize {
        self.fields[1].count
    }

    pub fn frame_len(&self) -> usize {
        self.fields.iter().map(|f| f.kind.width() * f.count).sum()
    }

    /// Stable text form, suitable for comparing schemas out-of-band.
    pub fn fingerprint(&self) -> String {
        self.fields
            .iter()
            .map(|f| format!("{}:{}x{}", f.name, f.kind.tag(), f.count))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn encode(&self, state: &SkeletonState) -> Result<PoseFrame> {
        ensure!(
            state.joint_count() == self.joint_count(),
            "skeleton has {} joints, schema expects {}",
            state.joint_count(),
            self.joint_count()
        );

        let mut frame = Vec::with_capacity(self.frame_len());
        frame.extend_from_slice(&state.wrist_position.to_array());
        for rotation in &state.joint_rotations {
            frame.extend_from_slice(&rotation.to_array());
        }
        frame.extend_from_slice(&state.scale.to_array());

        Ok(frame)
    }

    /// Values are taken verbatim; only the length is checked.
    pub fn decode(&self, frame: &[f32]) -> Result<SkeletonState> {
        ensure!(
            frame.len() == self.frame_len(),
            "frame has {} values, schema {} expects {}",
            frame.len(),
            self.fingerprint(),
            self.frame_len()
        );

        let (wrist, rest) = frame.split_at(3);
        let (joints, scale) = rest.split_at(4 * self.joint_count());

        Ok(SkeletonState {
            wrist_position: Vec3::from_slice(wrist),
            joint_rotations: joints.chunks_exact(4).map(Quat::from_slice).collect(),
            scale: Vec3::from_slice(scale),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state(joints: usize) -> SkeletonState {
        SkeletonState {
            wrist_position: Vec3::new(0.1, -0.2, 0.35),
            joint_rotations: (0..joints)
                .map(|i| Quat::from_rotation_z(i as f32 * 0.1))
                .collect(),
            scale: Vec3::new(1.0, 1.0, 0.9),
        }
    }

    #[test]
    fn frame_length_for_fifteen_joints() {
        let schema = PoseSchema::hand(15);
        assert_eq!(schema.frame_len(), 3 + 15 * 4 + 3);
        assert_eq!(
            schema.fingerprint(),
            "wrist_position:vec3x1,joint_rotations:quatx15,scale:vec3x1"
        );
    }

    #[test]
    fn encode_then_decode_is_identity() {
        let schema = PoseSchema::hand(15);
        let state = sample_state(15);

        let frame = schema.encode(&state).unwrap();
        assert_eq!(schema.decode(&frame).unwrap(), state);
    }

    #[test]
    fn frame_layout_is_wrist_joints_scale() {
        let schema = PoseSchema::hand(2);
        let state = sample_state(2);
        let frame = schema.encode(&state).unwrap();

        assert_eq!(&frame[..3], &[0.1, -0.2, 0.35]);
        assert_eq!(&frame[3..7], &state.joint_rotations[0].to_array());
        assert_eq!(&frame[7..11], &state.joint_rotations[1].to_array());
        assert_eq!(&frame[11..], &[1.0, 1.0, 0.9]);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let schema = PoseSchema::hand(15);
        let frame = PoseSchema::hand(14).encode(&sample_state(14)).unwrap();
        assert!(schema.decode(&frame).is_err());
    }

    #[test]
    fn encode_rejects_wrong_joint_count() {
        let schema = PoseSchema::hand(3);
        assert!(schema.encode(&sample_state(4)).is_err());
    }

    #[test]
    fn decode_keeps_unnormalized_rotation() {
        let schema = PoseSchema::hand(1);
        let frame = vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 2.0, 1.0, 1.0, 1.0];
        let state = schema.decode(&frame).unwrap();
        assert_eq!(state.joint_rotations[0].w, 2.0);
    }
}
