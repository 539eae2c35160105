//! Capability detection

use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use super::platform::{PlatformKind, PlatformProbe};
use super::types::SystemCapabilities;
use crate::error::Result;

/// Runs a platform probe and derives the capability snapshot from it.
///
/// The most recent snapshot is kept so callers that only need a stable view
/// (catalog filtering, session validation) do not re-probe the host.
pub struct CapabilityDetector {
    probe: Box<dyn PlatformProbe>,
    latest: RwLock<Option<Arc<SystemCapabilities>>>,
}

impl CapabilityDetector {
    pub fn new(kind: PlatformKind) -> Self {
        Self::with_probe(kind.probe())
    }

    pub fn with_probe(probe: Box<dyn PlatformProbe>) -> Self {
        Self {
            probe,
            latest: RwLock::new(None),
        }
    }

    /// Probes the host and publishes a fresh snapshot
    pub fn detect(&self) -> Result<Arc<SystemCapabilities>> {
        let snapshot = self.probe.probe()?;
        let capabilities = Arc::new(SystemCapabilities::from_snapshot(snapshot));

        info!(
            "Capabilities detected via {}: {:.1}GB RAM available ({:.1}GB total), {} cores, tier: {}",
            self.probe.name(),
            capabilities.available_memory_gb(),
            capabilities.total_memory_gb(),
            capabilities.hardware.cpu_cores,
            capabilities.performance_tier
        );
        debug!("System capabilities: {:?}", capabilities);

        if let Ok(mut latest) = self.latest.write() {
            *latest = Some(Arc::clone(&capabilities));
        }

        Ok(capabilities)
    }

    /// Last published snapshot, detecting on first use
    pub fn current(&self) -> Result<Arc<SystemCapabilities>> {
        if let Some(existing) = self.latest.read().ok().and_then(|latest| latest.clone()) {
            return Ok(existing);
        }
        self.detect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::platform::BoardProfile;
    use crate::capability::types::{
        AccelerationInfo, DeviceType, HardwareInfo, HostSnapshot, PerformanceTier, PlatformInfo,
    };
    use crate::error::{ErrorKind, RuntimeError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProbe {
        snapshot: HostSnapshot,
        calls: AtomicUsize,
    }

    impl PlatformProbe for FixedProbe {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn probe(&self) -> Result<HostSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.snapshot.clone())
        }
    }

    struct BrokenProbe;

    impl PlatformProbe for BrokenProbe {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn probe(&self) -> Result<HostSnapshot> {
            Err(RuntimeError::platform("no /proc"))
        }
    }

    fn workstation() -> HostSnapshot {
        HostSnapshot {
            hardware: HardwareInfo {
                total_memory_mb: 65536,
                available_memory_mb: 32768,
                cpu_cores: 16,
                architecture: "x86_64".to_string(),
            },
            platform: PlatformInfo {
                os: "linux".to_string(),
                device_type: DeviceType::Desktop,
                is_raspberry_pi: false,
                is_microcontroller: false,
                board_model: None,
            },
            acceleration: AccelerationInfo {
                has_gpu: true,
                has_avx2: true,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_detect_derives_tier_and_constraints() {
        let detector = CapabilityDetector::with_probe(Box::new(FixedProbe {
            snapshot: workstation(),
            calls: AtomicUsize::new(0),
        }));

        let caps = detector.detect().unwrap();
        assert_eq!(caps.performance_tier, PerformanceTier::Ultra);
        assert_eq!(caps.constraints.max_model_size_mb, 32768);
        assert_eq!(caps.constraints.recommended_threads, 12);
        assert!(caps.constraints.use_memory_mapping);
    }

    #[test]
    fn test_current_reuses_snapshot() {
        let probe = FixedProbe {
            snapshot: workstation(),
            calls: AtomicUsize::new(0),
        };
        let detector = CapabilityDetector::with_probe(Box::new(probe));

        let first = detector.current().unwrap();
        let second = detector.current().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let fresh = detector.detect().unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert_eq!(*first, *fresh);
    }

    #[test]
    fn test_probe_failure_is_platform_error() {
        let detector = CapabilityDetector::with_probe(Box::new(BrokenProbe));
        let err = detector.detect().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Platform);
    }

    #[test]
    fn test_esp32_is_micro() {
        let detector = CapabilityDetector::with_probe(Box::new(BoardProfile::esp32()));
        let caps = detector.detect().unwrap();
        assert_eq!(caps.performance_tier, PerformanceTier::Micro);
        assert_eq!(caps.constraints.max_context_length, 512);
        assert!(!caps.constraints.use_memory_mapping);
    }
}
