// config.rs — Convolution configuration and device limit profiles.
//
// The access strategy is chosen here, at configuration time, and stays
// fixed for the pass. The same goes for the workgroup shape, whether the
// kernel tiles through workgroup memory, and the border pre-fill the result
// collector relies on.
//
// DEVICE PROFILES:
// `DeviceLimits` is the subset of device limits the planner checks before
// touching the device. `DeviceProfile::RaspberryPi` caps limits to what the
// V3DV Vulkan driver reports, so a plan that would fail on a Pi fails on a
// development machine too. The host device uses the same limits, which keeps
// host and GPU runs rejecting the same geometries.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConvolveError, Result};
use crate::geometry::{AccessStrategy, WorkgroupShape};

/// Hardware profile selecting default limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceProfile {
    /// wgpu's default limits, which every conformant adapter meets.
    #[default]
    Native,
    /// Raspberry Pi 4/5 (VideoCore VI/VII): 256 invocations, 128 MiB buffers.
    RaspberryPi,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::RaspberryPi => write!(f, "RaspberryPi (simulated limits)"),
        }
    }
}

/// Limits a plan is validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLimits {
    pub max_workgroup_invocations: u32,
    pub max_workgroup_width: u32,
    pub max_workgroup_height: u32,
    /// Workgroup (shared) memory per workgroup, in bytes.
    pub max_shared_bytes: u32,
    /// Largest single buffer, in bytes.
    pub max_buffer_bytes: u64,
}

impl DeviceLimits {
    pub fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => DeviceLimits {
                max_workgroup_invocations: 256,
                max_workgroup_width: 256,
                max_workgroup_height: 256,
                max_shared_bytes: 16 << 10,
                max_buffer_bytes: 256 << 20,
            },
            DeviceProfile::RaspberryPi => DeviceLimits {
                max_workgroup_invocations: 256,
                max_workgroup_width: 256,
                max_workgroup_height: 256,
                max_shared_bytes: 16 << 10,
                max_buffer_bytes: 128 << 20,
            },
        }
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self::for_profile(DeviceProfile::Native)
    }
}

/// What the host output plane holds before the collector copies the
/// interior in. The kernel never writes the border, so this is what the
/// border pixels end up as.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum BorderFill {
    /// Copy the source pixels.
    Source,
    /// Fill with a constant.
    Constant(f32),
}

impl Default for BorderFill {
    fn default() -> Self {
        BorderFill::Source
    }
}

/// Where the kernel reads its windows from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelMemory {
    /// Cache a padded tile in workgroup memory, then sum from the tile.
    #[default]
    Tiled,
    /// Read every window straight from the device buffer.
    Global,
}

impl fmt::Display for KernelMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelMemory::Tiled => f.write_str("tiled"),
            KernelMemory::Global => f.write_str("global"),
        }
    }
}

/// Configuration for a [`Convolver`](crate::pipeline::Convolver).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvolveConfig {
    pub workgroup: WorkgroupShape,
    pub strategy: AccessStrategy,
    pub memory: KernelMemory,
    pub border: BorderFill,
}

impl Default for ConvolveConfig {
    fn default() -> Self {
        ConvolveConfig {
            workgroup: WorkgroupShape::default(),
            strategy: AccessStrategy::default(),
            memory: KernelMemory::default(),
            border: BorderFill::default(),
        }
    }
}

impl ConvolveConfig {
    pub fn with_workgroup(mut self, width: u32, height: u32) -> Self {
        self.workgroup = WorkgroupShape::new(width, height);
        self
    }

    pub fn with_strategy(mut self, strategy: AccessStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_memory(mut self, memory: KernelMemory) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_border(mut self, border: BorderFill) -> Self {
        self.border = border;
        self
    }

    /// Parse a JSON configuration; missing fields take their defaults.
    ///
    /// ```
    /// use tiled_conv::config::ConvolveConfig;
    /// use tiled_conv::geometry::AccessStrategy;
    ///
    /// let cfg = ConvolveConfig::from_json(r#"{ "strategy": "vectorized" }"#).unwrap();
    /// assert_eq!(cfg.strategy, AccessStrategy::Vectorized);
    /// assert_eq!(cfg.workgroup.width, 16);
    /// ```
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Reject shapes no device can run, before planning.
    pub fn validate(&self) -> Result<()> {
        if self.workgroup.width == 0 || self.workgroup.height == 0 {
            return Err(ConvolveError::InvalidWorkgroup {
                width: self.workgroup.width,
                height: self.workgroup.height,
                reason: "dimensions must be non-zero",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ConvolveConfig::default();
        assert_eq!(cfg.workgroup, WorkgroupShape::new(16, 16));
        assert_eq!(cfg.strategy, AccessStrategy::Naive);
        assert_eq!(cfg.memory, KernelMemory::Tiled);
        assert_eq!(cfg.border, BorderFill::Source);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_json_round_trip() {
        let cfg = ConvolveConfig::default()
            .with_workgroup(8, 4)
            .with_strategy(AccessStrategy::Aligned)
            .with_memory(KernelMemory::Global)
            .with_border(BorderFill::Constant(255.0));
        let text = cfg.to_json().unwrap();
        assert_eq!(ConvolveConfig::from_json(&text).unwrap(), cfg);
    }

    #[test]
    fn test_json_partial() {
        let cfg = ConvolveConfig::from_json(
            r#"{ "workgroup": { "width": 8, "height": 8 }, "border": { "kind": "constant", "value": 1.5 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.workgroup, WorkgroupShape::new(8, 8));
        assert_eq!(cfg.strategy, AccessStrategy::Naive);
        assert_eq!(cfg.border, BorderFill::Constant(1.5));
    }

    #[test]
    fn test_json_memory() {
        let cfg = ConvolveConfig::from_json(r#"{ "memory": "global" }"#).unwrap();
        assert_eq!(cfg.memory, KernelMemory::Global);
        assert_eq!(cfg.strategy, AccessStrategy::Naive);
        assert!(ConvolveConfig::from_json(r#"{ "memory": "constant" }"#).is_err());
    }

    #[test]
    fn test_json_unknown_strategy_rejected() {
        assert!(ConvolveConfig::from_json(r#"{ "strategy": "tiled" }"#).is_err());
    }

    #[test]
    fn test_zero_workgroup_invalid() {
        let cfg = ConvolveConfig::default().with_workgroup(0, 16);
        assert!(matches!(cfg.validate(), Err(ConvolveError::InvalidWorkgroup { .. })));
    }

    #[test]
    fn test_profiles() {
        let native = DeviceLimits::for_profile(DeviceProfile::Native);
        assert_eq!(native.max_workgroup_invocations, 256);
        assert_eq!(native.max_shared_bytes, 16384);
        assert_eq!(DeviceLimits::default(), native);
        let pi = DeviceLimits::for_profile(DeviceProfile::RaspberryPi);
        assert_eq!(pi.max_buffer_bytes, 128 << 20);
        assert!(pi.max_buffer_bytes < native.max_buffer_bytes);
    }
}
