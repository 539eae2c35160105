//! Platform probes
//!
//! Each supported platform family contributes one [`PlatformProbe`]. Desktop-class
//! hosts and Raspberry Pi boards are measured through `sysinfo`; microcontroller
//! targets cannot be introspected at runtime and report a fixed [`BoardProfile`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use sysinfo::System;
use tracing::debug;

use super::types::{AccelerationInfo, DeviceType, HardwareInfo, HostSnapshot, PlatformInfo};
use crate::error::{Result, RuntimeError};

const DEVICE_TREE_MODEL: &str = "/proc/device-tree/model";

/// Source of raw host measurements for one platform family
pub trait PlatformProbe: Send + Sync {
    fn name(&self) -> &'static str;

    fn probe(&self) -> Result<HostSnapshot>;
}

/// Which probe to use. `Auto` picks one from the build target and the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlatformKind {
    #[default]
    Auto,
    Desktop,
    RaspberryPi,
    Esp32,
    Pico,
}

impl PlatformKind {
    /// Resolves `Auto` to a concrete platform
    pub fn resolve(self) -> PlatformKind {
        if self != PlatformKind::Auto {
            return self;
        }
        if cfg!(target_os = "espidf") {
            return PlatformKind::Esp32;
        }
        if cfg!(all(target_arch = "arm", target_os = "none")) {
            return PlatformKind::Pico;
        }
        match read_board_model(Path::new(DEVICE_TREE_MODEL)) {
            Some(model) if is_raspberry_pi_model(&model) => PlatformKind::RaspberryPi,
            _ => PlatformKind::Desktop,
        }
    }

    pub fn probe(self) -> Box<dyn PlatformProbe> {
        match self.resolve() {
            PlatformKind::RaspberryPi => Box::new(RaspberryPiProbe::default()),
            PlatformKind::Esp32 => Box::new(BoardProfile::esp32()),
            PlatformKind::Pico => Box::new(BoardProfile::pico()),
            PlatformKind::Desktop | PlatformKind::Auto => Box::new(DesktopProbe),
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformKind::Auto => write!(f, "auto"),
            PlatformKind::Desktop => write!(f, "desktop"),
            PlatformKind::RaspberryPi => write!(f, "raspberry-pi"),
            PlatformKind::Esp32 => write!(f, "esp32"),
            PlatformKind::Pico => write!(f, "pico"),
        }
    }
}

impl FromStr for PlatformKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(PlatformKind::Auto),
            "desktop" => Ok(PlatformKind::Desktop),
            "raspberry-pi" | "raspberrypi" | "rpi" => Ok(PlatformKind::RaspberryPi),
            "esp32" => Ok(PlatformKind::Esp32),
            "pico" | "rp2040" => Ok(PlatformKind::Pico),
            _ => Err(format!(
                "Invalid platform: {}. Must be one of: auto, desktop, raspberry-pi, esp32, pico",
                s
            )),
        }
    }
}

/// Reads the board identification string from a device-tree model file
pub fn read_board_model(path: &Path) -> Option<String> {
    let raw = std::fs::read(path).ok()?;
    let model = String::from_utf8_lossy(&raw)
        .trim_end_matches('\0')
        .trim()
        .to_string();
    (!model.is_empty()).then_some(model)
}

fn is_raspberry_pi_model(model: &str) -> bool {
    model.to_lowercase().contains("raspberry pi")
}

struct MemoryReading {
    total_mb: u64,
    available_mb: u64,
    cpu_cores: usize,
}

fn read_system() -> Result<MemoryReading> {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu_all();

    let total_mb = sys.total_memory() / (1024 * 1024);
    let available_mb = sys.available_memory() / (1024 * 1024);
    let cpu_cores = sys.cpus().len();

    if total_mb == 0 || cpu_cores == 0 {
        return Err(RuntimeError::platform(
            "Host memory or CPU information is unavailable",
        )
        .with_context("total_memory_mb", total_mb)
        .with_context("cpu_cores", cpu_cores));
    }

    Ok(MemoryReading {
        total_mb,
        available_mb: available_mb.min(total_mb),
        cpu_cores,
    })
}

fn detect_simd() -> (bool, bool) {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        (std::is_x86_feature_detected!("avx2"), false)
    }
    #[cfg(target_arch = "aarch64")]
    {
        (false, std::arch::is_aarch64_feature_detected!("neon"))
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
    {
        (false, false)
    }
}

/// Desktop, laptop and server hosts
#[derive(Debug, Clone, Copy, Default)]
pub struct DesktopProbe;

impl DesktopProbe {
    #[cfg(target_os = "linux")]
    fn detect_gpu() -> bool {
        let nvidia = Path::new("/dev/nvidia0").exists();
        let render_node = Path::new("/dev/dri/renderD128").exists();
        debug!("GPU probe: nvidia={}, render_node={}", nvidia, render_node);
        nvidia || render_node
    }

    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    fn detect_gpu() -> bool {
        debug!("Apple Silicon: Metal GPU assumed present");
        true
    }

    #[cfg(not(any(target_os = "linux", all(target_os = "macos", target_arch = "aarch64"))))]
    fn detect_gpu() -> bool {
        debug!("GPU probe not supported on this platform");
        false
    }

    fn detect_neural_engine() -> bool {
        cfg!(all(target_os = "macos", target_arch = "aarch64"))
    }
}

impl PlatformProbe for DesktopProbe {
    fn name(&self) -> &'static str {
        "desktop"
    }

    fn probe(&self) -> Result<HostSnapshot> {
        let reading = read_system()?;
        let (has_avx2, has_neon) = detect_simd();

        Ok(HostSnapshot {
            hardware: HardwareInfo {
                total_memory_mb: reading.total_mb,
                available_memory_mb: reading.available_mb,
                cpu_cores: reading.cpu_cores,
                architecture: std::env::consts::ARCH.to_string(),
            },
            platform: PlatformInfo {
                os: std::env::consts::OS.to_string(),
                device_type: DeviceType::Desktop,
                is_raspberry_pi: false,
                is_microcontroller: false,
                board_model: None,
            },
            acceleration: AccelerationInfo {
                has_gpu: Self::detect_gpu(),
                has_neural_engine: Self::detect_neural_engine(),
                has_avx2,
                has_neon,
            },
        })
    }
}

/// Raspberry Pi boards, identified through the device tree
#[derive(Debug, Clone)]
pub struct RaspberryPiProbe {
    model_path: PathBuf,
}

impl Default for RaspberryPiProbe {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEVICE_TREE_MODEL),
        }
    }
}

impl RaspberryPiProbe {
    pub fn with_model_path(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
        }
    }
}

impl PlatformProbe for RaspberryPiProbe {
    fn name(&self) -> &'static str {
        "raspberry-pi"
    }

    fn probe(&self) -> Result<HostSnapshot> {
        let reading = read_system()?;
        let (_, has_neon) = detect_simd();
        let board_model = read_board_model(&self.model_path);

        debug!("Raspberry Pi board model: {:?}", board_model);

        Ok(HostSnapshot {
            hardware: HardwareInfo {
                total_memory_mb: reading.total_mb,
                available_memory_mb: reading.available_mb,
                cpu_cores: reading.cpu_cores,
                architecture: std::env::consts::ARCH.to_string(),
            },
            platform: PlatformInfo {
                os: std::env::consts::OS.to_string(),
                device_type: DeviceType::SingleBoard,
                is_raspberry_pi: true,
                is_microcontroller: false,
                board_model,
            },
            // The VideoCore GPU has no usable compute path for inference
            acceleration: AccelerationInfo {
                has_gpu: false,
                has_neural_engine: false,
                has_avx2: false,
                has_neon,
            },
        })
    }
}

/// Fixed description of a microcontroller board
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardProfile {
    pub board_model: &'static str,
    pub architecture: &'static str,
    pub os: &'static str,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    pub cpu_cores: usize,
}

impl BoardProfile {
    /// ESP32-S3 with 8 MB PSRAM
    pub fn esp32() -> Self {
        Self {
            board_model: "ESP32-S3",
            architecture: "xtensa",
            os: "freertos",
            total_memory_mb: 8,
            available_memory_mb: 6,
            cpu_cores: 2,
        }
    }

    /// RP2040 (Raspberry Pi Pico); 264 KB SRAM rounds down to zero MB
    pub fn pico() -> Self {
        Self {
            board_model: "RP2040",
            architecture: "armv6m",
            os: "none",
            total_memory_mb: 0,
            available_memory_mb: 0,
            cpu_cores: 2,
        }
    }
}

impl PlatformProbe for BoardProfile {
    fn name(&self) -> &'static str {
        self.board_model
    }

    fn probe(&self) -> Result<HostSnapshot> {
        Ok(HostSnapshot {
            hardware: HardwareInfo {
                total_memory_mb: self.total_memory_mb,
                available_memory_mb: self.available_memory_mb,
                cpu_cores: self.cpu_cores,
                architecture: self.architecture.to_string(),
            },
            platform: PlatformInfo {
                os: self.os.to_string(),
                device_type: DeviceType::Microcontroller,
                is_raspberry_pi: false,
                is_microcontroller: true,
                board_model: Some(self.board_model.to_string()),
            },
            acceleration: AccelerationInfo::default(),
        })
    }
}

/// Replays a fixed snapshot. Used for hosts described by configuration and in tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotProbe {
    snapshot: HostSnapshot,
}

impl SnapshotProbe {
    pub fn new(snapshot: HostSnapshot) -> Self {
        Self { snapshot }
    }
}

impl PlatformProbe for SnapshotProbe {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn probe(&self) -> Result<HostSnapshot> {
        Ok(self.snapshot.clone())
    }
}
