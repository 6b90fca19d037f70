use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// One replicated snapshot of a hand skeleton.
///
/// Joint rotations are matched by position only; both peers must agree on
/// the joint count and order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkeletonState {
    pub wrist_position: Vec3,
    pub joint_rotations: Vec<Quat>,
    pub scale: Vec3,
}

impl SkeletonState {
    /// Rest pose: wrist at the origin, identity joints, unit scale.
    pub fn identity(joint_count: usize) -> Self {
        Self {
            wrist_position: Vec3::ZERO,
            joint_rotations: vec![Quat::IDENTITY; joint_count],
            scale: Vec3::ONE,
        }
    }

    pub fn joint_count(&self) -> usize {
        self.joint_rotations.len()
    }
}

/// Read access to the live, locally driven skeleton.
///
/// The engine adapter implements this over its own transforms so the
/// writer never has to know how joints are found.
pub trait PoseSource {
    fn wrist_position(&self) -> Vec3;
    fn joint_count(&self) -> usize;
    fn joint_rotation(&self, index: usize) -> Quat;
    fn scale(&self) -> Vec3;
}

impl PoseSource for SkeletonState {
    fn wrist_position(&self) -> Vec3 {
        self.wrist_position
    }

    fn joint_count(&self) -> usize {
        self.joint_rotations.len()
    }

    fn joint_rotation(&self, index: usize) -> Quat {
        self.joint_rotations[index]
    }

    fn scale(&self) -> Vec3 {
        self.scale
    }
}

/// Latest frame heard from one remote peer.
#[derive(Debug, Clone)]
pub struct RemotePose {
    pub sender_id: String,
    pub frame: Vec<f32>,
    pub last_update: std::time::Instant,
}
