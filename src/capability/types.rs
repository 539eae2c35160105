//! Capability snapshot types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::tier::{constraints_for, derive_tier};

/// Coarse ordinal classification of a device's inference capacity.
///
/// Variants are declared from weakest to strongest so that the derived ordering
/// matches the constraint envelope (`Micro < Low < Medium < High < Ultra`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    Micro,
    Low,
    Medium,
    High,
    Ultra,
}

impl PerformanceTier {
    pub const ALL: [PerformanceTier; 5] = [
        PerformanceTier::Micro,
        PerformanceTier::Low,
        PerformanceTier::Medium,
        PerformanceTier::High,
        PerformanceTier::Ultra,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PerformanceTier::Micro => "micro",
            PerformanceTier::Low => "low",
            PerformanceTier::Medium => "medium",
            PerformanceTier::High => "high",
            PerformanceTier::Ultra => "ultra",
        }
    }
}

impl fmt::Display for PerformanceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PerformanceTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PerformanceTier::ALL
            .into_iter()
            .find(|tier| tier.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("Invalid performance tier: {}", s))
    }
}

/// Device class a model can be deployed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Server,
    Desktop,
    Laptop,
    Mobile,
    SingleBoard,
    Microcontroller,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceType::Server => "server",
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Mobile => "mobile",
            DeviceType::SingleBoard => "single_board",
            DeviceType::Microcontroller => "microcontroller",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareInfo {
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    pub cpu_cores: usize,
    /// Architecture tag (`x86_64`, `aarch64`, `xtensa`, ...)
    pub architecture: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformInfo {
    /// OS tag (`linux`, `macos`, `windows`, `freertos`, `none`)
    pub os: String,
    pub device_type: DeviceType,
    pub is_raspberry_pi: bool,
    pub is_microcontroller: bool,
    /// Board identification string when the host is an embedded board
    #[serde(skip_serializing_if = "Option::is_none")]
    pub board_model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccelerationInfo {
    pub has_gpu: bool,
    pub has_neural_engine: bool,
    pub has_avx2: bool,
    pub has_neon: bool,
}

impl AccelerationInfo {
    /// GPU or dedicated neural accelerator; SIMD extensions do not count
    pub fn has_accelerator(&self) -> bool {
        self.has_gpu || self.has_neural_engine
    }
}

/// Limits derived from the performance tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    pub max_model_size_mb: u64,
    pub max_context_length: u32,
    pub recommended_threads: usize,
    pub use_memory_mapping: bool,
}

/// Raw host measurements produced by a platform probe, before tier derivation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSnapshot {
    pub hardware: HardwareInfo,
    pub platform: PlatformInfo,
    pub acceleration: AccelerationInfo,
}

/// Complete capability snapshot for one detection cycle.
///
/// Built wholesale from a [`HostSnapshot`]; never patched field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemCapabilities {
    pub hardware: HardwareInfo,
    pub platform: PlatformInfo,
    pub acceleration: AccelerationInfo,
    pub performance_tier: PerformanceTier,
    pub constraints: Constraints,
}

impl SystemCapabilities {
    pub fn from_snapshot(snapshot: HostSnapshot) -> Self {
        let performance_tier = derive_tier(
            snapshot.hardware.available_memory_mb,
            snapshot.hardware.cpu_cores,
            &snapshot.acceleration,
        );
        let constraints = constraints_for(performance_tier, &snapshot.hardware, &snapshot.platform);

        Self {
            hardware: snapshot.hardware,
            platform: snapshot.platform,
            acceleration: snapshot.acceleration,
            performance_tier,
            constraints,
        }
    }

    pub fn available_memory_gb(&self) -> f64 {
        self.hardware.available_memory_mb as f64 / 1024.0
    }

    pub fn total_memory_gb(&self) -> f64 {
        self.hardware.total_memory_mb as f64 / 1024.0
    }

    /// Human readable list of acceleration features
    pub fn acceleration_features(&self) -> Vec<&'static str> {
        let mut features = Vec::new();
        if self.acceleration.has_gpu {
            features.push("GPU");
        }
        if self.acceleration.has_neural_engine {
            features.push("Neural Engine");
        }
        if self.acceleration.has_avx2 {
            features.push("AVX2");
        }
        if self.acceleration.has_neon {
            features.push("NEON");
        }
        features
    }
}
