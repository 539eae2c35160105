//! Per-model compatibility report

use serde::Serialize;

use super::descriptor::ModelDescriptor;
use crate::capability::{DeviceType, SystemCapabilities};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityReport {
    pub compatible: bool,
    /// Hard failures that make the model unusable on this device
    pub reasons: Vec<String>,
    pub warnings: Vec<String>,
    /// Loader optimizations available on this device
    pub optimizations: Vec<String>,
}

/// Explains whether, and how well, a model fits the device
pub fn check_compatibility(
    descriptor: &ModelDescriptor,
    capabilities: &SystemCapabilities,
) -> CompatibilityReport {
    let mut report = CompatibilityReport::default();
    let available = capabilities.hardware.available_memory_mb;

    if !descriptor.supports_device(capabilities.platform.device_type) {
        report.reasons.push(format!(
            "Device type {} is not supported",
            capabilities.platform.device_type
        ));
    }
    if descriptor.min_performance_tier > capabilities.performance_tier {
        report.reasons.push(format!(
            "Requires {} tier, device is {}",
            descriptor.min_performance_tier, capabilities.performance_tier
        ));
    }
    if descriptor.required_memory_mb > available {
        report.reasons.push(format!(
            "Requires {} MB memory, {} MB available",
            descriptor.required_memory_mb, available
        ));
    }
    if descriptor.size_mb() > capabilities.constraints.max_model_size_mb {
        report.reasons.push(format!(
            "Model size {} MB exceeds the {} MB limit",
            descriptor.size_mb(),
            capabilities.constraints.max_model_size_mb
        ));
    }

    if descriptor.required_memory_mb * 10 > available * 8 {
        report
            .warnings
            .push("High memory usage: model needs more than 80% of available memory".to_string());
    }
    if capabilities.platform.device_type == DeviceType::SingleBoard && descriptor.size_mb() > 1024 {
        report
            .warnings
            .push("Large model on a single-board computer may be slow".to_string());
    }
    if available < 2048 {
        report
            .warnings
            .push("Limited memory available".to_string());
    }

    if capabilities.acceleration.has_avx2 {
        report.optimizations.push("AVX2".to_string());
    }
    if capabilities.acceleration.has_neon {
        report.optimizations.push("NEON".to_string());
    }
    if capabilities.constraints.use_memory_mapping {
        report.optimizations.push("MMAP".to_string());
    }

    report.compatible = report.reasons.is_empty();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{
        AccelerationInfo, HardwareInfo, HostSnapshot, PerformanceTier, PlatformInfo,
    };
    use crate::catalog::descriptor::fixtures::descriptor;

    fn raspberry_pi(available_mb: u64) -> SystemCapabilities {
        SystemCapabilities::from_snapshot(HostSnapshot {
            hardware: HardwareInfo {
                total_memory_mb: 8192,
                available_memory_mb: available_mb,
                cpu_cores: 4,
                architecture: "aarch64".to_string(),
            },
            platform: PlatformInfo {
                os: "linux".to_string(),
                device_type: DeviceType::SingleBoard,
                is_raspberry_pi: true,
                is_microcontroller: false,
                board_model: Some("Raspberry Pi 5".to_string()),
            },
            acceleration: AccelerationInfo {
                has_neon: true,
                ..Default::default()
            },
        })
    }

    #[test]
    fn test_unsupported_device_is_incompatible() {
        let report = check_compatibility(
            &descriptor("tinyllama", 1024, PerformanceTier::Low),
            &raspberry_pi(6000),
        );
        assert!(!report.compatible);
        assert!(report.reasons[0].contains("single_board"));
        assert_eq!(report.optimizations, vec!["NEON".to_string()]);
    }

    #[test]
    fn test_warnings_on_pressure() {
        let mut model = descriptor("phi-2", 2800, PerformanceTier::Low);
        model.supported_devices.push(DeviceType::SingleBoard);
        let caps = raspberry_pi(3000);

        let report = check_compatibility(&model, &caps);
        assert!(report.compatible, "{:?}", report.reasons);
        assert!(report.warnings.iter().any(|w| w.starts_with("High memory usage")));
        assert!(report.warnings.iter().any(|w| w.contains("single-board")));
        assert!(!report.optimizations.contains(&"MMAP".to_string()));
    }
}
