//! Host capability detection and performance tiering

mod detector;
mod platform;
mod tier;
mod types;

pub use detector::CapabilityDetector;
pub use platform::{
    read_board_model, BoardProfile, DesktopProbe, PlatformKind, PlatformProbe, RaspberryPiProbe,
    SnapshotProbe,
};
pub use tier::{constraints_for, derive_tier};
pub use types::{
    AccelerationInfo, Constraints, DeviceType, HardwareInfo, HostSnapshot, PerformanceTier,
    PlatformInfo, SystemCapabilities,
};
