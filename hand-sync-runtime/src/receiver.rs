use anyhow::{ensure, Result};

use crate::config::SyncConfig;
use crate::schema::PoseSchema;
use crate::types::SkeletonState;

/// Eases a rendered skeleton toward the most recent remote snapshot.
///
/// Arrivals only replace the target; the rendered pose moves in
/// [`advance`](Self::advance) and never jumps on receipt. With a factor
/// below one the target is approached but not reached exactly.
pub struct PoseReceiver {
    schema: PoseSchema,
    config: SyncConfig,
    rendered: SkeletonState,
    target: SkeletonState,
}

impl PoseReceiver {
    /// `initial` is both the first rendered pose and the first target, so
    /// nothing moves until a snapshot arrives.
    pub fn new(config: SyncConfig, initial: SkeletonState) -> Result<Self> {
        ensure!(
            initial.joint_count() == config.joint_count,
            "initial skeleton has {} joints, config expects {}",
            initial.joint_count(),
            config.joint_count
        );

        Ok(Self {
            schema: PoseSchema::hand(config.joint_count),
            config,
            target: initial.clone(),
            rendered: initial,
        })
    }

    pub fn schema(&self) -> &PoseSchema {
        &self.schema
    }

    pub fn rendered(&self) -> &SkeletonState {
        &self.rendered
    }

    pub fn target(&self) -> &SkeletonState {
        &self.target
    }

    /// Store `state` verbatim as the new target. Values are not clamped or
    /// renormalized; only the joint count is checked.
    pub fn receive(&mut self, state: SkeletonState) -> Result<()> {
        ensure!(
            state.joint_count() == self.schema.joint_count(),
            "snapshot has {} joints, expected {}",
            state.joint_count(),
            self.schema.joint_count()
        );
        self.target = state;
        Ok(())
    }

    /// Decode and store a wire frame. On error the previous target is kept.
    pub fn receive_frame(&mut self, frame: &[f32]) -> Result<()> {
        let state = self.schema.decode(frame)?;
        self.target = state;
        Ok(())
    }

    pub fn advance(&mut self, delta_seconds: f32) -> &SkeletonState {
        if delta_seconds <= 0.0 || !delta_seconds.is_finite() {
            return &self.rendered;
        }

        let t = self.config.factor(delta_seconds);
        let rendered = &mut self.rendered;
        let target = &self.target;

        rendered.wrist_position = rendered.wrist_position.lerp(target.wrist_position, t);
        for (joint, goal) in rendered
            .joint_rotations
            .iter_mut()
            .zip(&target.joint_rotations)
        {
            *joint = joint.slerp(*goal, t);
        }
        rendered.scale = rendered.scale.lerp(target.scale, t);

        &self.rendered
    }
}
