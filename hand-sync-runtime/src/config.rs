use anyhow::Result;
use serde::{Deserialize, Serialize};

/// How `gain * delta` is turned into an interpolation factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorPolicy {
    /// `min(1, gain * delta)`; never overshoots on long frames.
    Clamped,
    /// `gain * delta` as is. Overshoots once `delta > 1 / gain`.
    Unclamped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub joint_count: usize,
    pub gain: f32,
    pub factor_policy: FactorPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            joint_count: 15,
            gain: 10.0,
            factor_policy: FactorPolicy::Clamped,
        }
    }
}

impl SyncConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config = serde_json::from_str(json)?;
        Ok(config)
    }

    pub fn factor(&self, delta_seconds: f32) -> f32 {
        let factor = self.gain * delta_seconds;
        match self.factor_policy {
            FactorPolicy::Clamped => factor.min(1.0),
            FactorPolicy::Unclamped => factor,
        }
    }
}
