use anyhow::{ensure, Result};

use crate::schema::{PoseFrame, PoseSchema};
use crate::types::{PoseSource, SkeletonState};

/// Samples the locally driven skeleton once per replication tick.
pub struct PoseWriter {
    schema: PoseSchema,
}

impl PoseWriter {
    pub fn new(schema: PoseSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &PoseSchema {
        &self.schema
    }

    /// Fresh snapshot of `source`. Nothing on the source is mutated.
    pub fn sample(&self, source: &dyn PoseSource) -> Result<SkeletonState> {
        let joint_count = self.schema.joint_count();
        ensure!(
            source.joint_count() == joint_count,
            "pose source has {} joints, schema expects {}",
            source.joint_count(),
            joint_count
        );

        Ok(SkeletonState {
            wrist_position: source.wrist_position(),
            joint_rotations: (0..joint_count).map(|i| source.joint_rotation(i)).collect(),
            scale: source.scale(),
        })
    }

    pub fn write(&self, source: &dyn PoseSource) -> Result<PoseFrame> {
        let snapshot = self.sample(source)?;
        self.schema.encode(&snapshot)
    }
}
