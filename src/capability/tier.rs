//! Performance tier derivation and the per-tier constraint table

use super::types::{AccelerationInfo, Constraints, HardwareInfo, PerformanceTier, PlatformInfo};

/// Memory at or below which an unaccelerated host is a microcontroller-class device
const MICRO_MEMORY_CEILING_MB: u64 = 512;

/// Derives the performance tier from available memory, core count and acceleration.
///
/// Pure function of its inputs. Where the score and the memory ceiling disagree the
/// lower tier wins.
pub fn derive_tier(
    available_memory_mb: u64,
    cpu_cores: usize,
    acceleration: &AccelerationInfo,
) -> PerformanceTier {
    let accelerated = acceleration.has_accelerator();

    if available_memory_mb <= MICRO_MEMORY_CEILING_MB {
        return if accelerated {
            PerformanceTier::Low
        } else {
            PerformanceTier::Micro
        };
    }

    if accelerated && cpu_cores >= 8 && available_memory_mb >= 8192 {
        return PerformanceTier::Ultra;
    }

    let memory_score = match available_memory_mb {
        m if m >= 16384 => 4,
        m if m >= 8192 => 3,
        m if m >= 4096 => 2,
        _ => 1,
    };
    let core_score = match cpu_cores {
        c if c >= 8 => 4,
        c if c >= 4 => 3,
        c if c >= 2 => 2,
        _ => 1,
    };
    let acceleration_score = if accelerated {
        4
    } else if acceleration.has_avx2 {
        3
    } else if acceleration.has_neon {
        2
    } else {
        1
    };

    let scored = match memory_score + core_score + acceleration_score {
        s if s >= 8 => PerformanceTier::High,
        s if s >= 6 => PerformanceTier::Medium,
        _ => PerformanceTier::Low,
    };

    scored.min(memory_ceiling(available_memory_mb))
}

fn memory_ceiling(available_memory_mb: u64) -> PerformanceTier {
    match available_memory_mb {
        m if m < 2048 => PerformanceTier::Low,
        m if m < 4096 => PerformanceTier::Medium,
        _ => PerformanceTier::High,
    }
}

/// Fixed per-tier envelope: (max model size MB, max context, thread cap, mmap)
fn envelope(tier: PerformanceTier) -> (u64, u32, usize, bool) {
    match tier {
        PerformanceTier::Micro => (64, 512, 1, false),
        PerformanceTier::Low => (1024, 2048, 2, false),
        PerformanceTier::Medium => (4096, 4096, 4, true),
        PerformanceTier::High => (8192, 8192, 8, true),
        PerformanceTier::Ultra => (32768, 32768, 16, true),
    }
}

/// Looks up the constraints for a tier, adjusted for thread count and board type
pub fn constraints_for(
    tier: PerformanceTier,
    hardware: &HardwareInfo,
    platform: &PlatformInfo,
) -> Constraints {
    let (max_model_size_mb, max_context_length, thread_cap, mmap) = envelope(tier);

    let recommended_threads = (hardware.cpu_cores * 3 / 4).clamp(1, thread_cap);

    // SD-card backed boards page in weights too slowly for mmap to pay off
    let use_memory_mapping = mmap && !platform.is_raspberry_pi && !platform.is_microcontroller;

    Constraints {
        max_model_size_mb,
        max_context_length,
        recommended_threads,
        use_memory_mapping,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::types::DeviceType;
    use yare::parameterized;

    fn accel(gpu: bool, avx2: bool, neon: bool) -> AccelerationInfo {
        AccelerationInfo {
            has_gpu: gpu,
            has_neural_engine: false,
            has_avx2: avx2,
            has_neon: neon,
        }
    }

    fn desktop(cores: usize) -> (HardwareInfo, PlatformInfo) {
        (
            HardwareInfo {
                total_memory_mb: 16384,
                available_memory_mb: 8192,
                cpu_cores: cores,
                architecture: "x86_64".to_string(),
            },
            PlatformInfo {
                os: "linux".to_string(),
                device_type: DeviceType::Desktop,
                is_raspberry_pi: false,
                is_microcontroller: false,
                board_model: None,
            },
        )
    }

    #[parameterized(
        gpu_workstation = { 32768, 16, accel(true, true, false), PerformanceTier::Ultra },
        gpu_exactly_8gb_8_cores = { 8192, 8, accel(true, false, false), PerformanceTier::Ultra },
        gpu_but_few_cores = { 16384, 4, accel(true, false, false), PerformanceTier::High },
        avx2_desktop = { 16384, 8, accel(false, true, false), PerformanceTier::High },
        avx2_laptop = { 6144, 4, accel(false, true, false), PerformanceTier::Medium },
        raspberry_pi_4 = { 3500, 4, accel(false, false, true), PerformanceTier::Medium },
        pi_zero = { 400, 1, accel(false, false, true), PerformanceTier::Micro },
        tiny_with_npu = { 256, 2, AccelerationInfo { has_neural_engine: true, ..Default::default() }, PerformanceTier::Low },
        boundary_512 = { 512, 4, accel(false, true, false), PerformanceTier::Micro },
        just_above_micro = { 513, 1, accel(false, false, false), PerformanceTier::Low },
        memory_caps_score = { 1536, 16, accel(false, true, false), PerformanceTier::Low },
    )]
    fn test_derive_tier(memory: u64, cores: usize, acceleration: AccelerationInfo, expected: PerformanceTier) {
        assert_eq!(derive_tier(memory, cores, &acceleration), expected);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let acceleration = accel(false, true, false);
        let first = derive_tier(6000, 6, &acceleration);
        for _ in 0..100 {
            assert_eq!(derive_tier(6000, 6, &acceleration), first);
        }
    }

    #[test]
    fn test_envelope_strictly_ordered() {
        let (hardware, platform) = desktop(32);
        let constraints: Vec<Constraints> = PerformanceTier::ALL
            .iter()
            .map(|tier| constraints_for(*tier, &hardware, &platform))
            .collect();

        for pair in constraints.windows(2) {
            assert!(pair[0].max_model_size_mb < pair[1].max_model_size_mb);
            assert!(pair[0].max_context_length < pair[1].max_context_length);
        }
    }

    #[test]
    fn test_micro_envelope() {
        let (hardware, platform) = desktop(2);
        let constraints = constraints_for(PerformanceTier::Micro, &hardware, &platform);
        assert_eq!(constraints.max_model_size_mb, 64);
        assert_eq!(constraints.max_context_length, 512);
        assert_eq!(constraints.recommended_threads, 1);
        assert!(!constraints.use_memory_mapping);
    }

    #[test]
    fn test_threads_and_mmap() {
        let (hardware, mut platform) = desktop(12);
        let constraints = constraints_for(PerformanceTier::High, &hardware, &platform);
        assert_eq!(constraints.recommended_threads, 8);
        assert!(constraints.use_memory_mapping);

        platform.is_raspberry_pi = true;
        let constraints = constraints_for(PerformanceTier::High, &hardware, &platform);
        assert!(!constraints.use_memory_mapping);
    }
}
