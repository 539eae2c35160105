//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use edgellm::capability::{
    AccelerationInfo, DeviceType, HardwareInfo, HostSnapshot, PerformanceTier, PlatformInfo,
    SnapshotProbe,
};
use edgellm::catalog::{ModelCatalog, ModelDescriptor, ModelMetadata};
use edgellm::download::{DownloadStatus, MemorySource};
use edgellm::{Runtime, RuntimeBuilder, RuntimeConfig};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

pub const MODEL_ID: &str = "tinyllama-1.1b-q4";

/// Artifact bytes served for [`MODEL_ID`]
pub fn payload() -> Vec<u8> {
    (0..200u8).map(|i| i.wrapping_mul(37)).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn primary_url(model_id: &str) -> String {
    format!("https://models.example.org/{}.gguf", model_id)
}

pub fn mirror_url(model_id: &str) -> String {
    format!("https://mirror.example.net/{}.gguf", model_id)
}

/// Descriptor for a 1 GB class model whose artifact is [`payload`]
pub fn tinyllama() -> ModelDescriptor {
    let data = payload();
    ModelDescriptor {
        id: MODEL_ID.to_string(),
        name: "TinyLlama 1.1B Chat".to_string(),
        architecture: "llama".to_string(),
        quantization: "q4_0".to_string(),
        size_bytes: data.len() as u64,
        required_memory_mb: 1024,
        context_length: 2048,
        supported_devices: vec![
            DeviceType::Desktop,
            DeviceType::Laptop,
            DeviceType::Server,
            DeviceType::SingleBoard,
        ],
        min_performance_tier: PerformanceTier::Low,
        download_urls: vec![primary_url(MODEL_ID), mirror_url(MODEL_ID)],
        checksum: sha256_hex(&data),
        legacy_md5: Some(format!("{:x}", md5::compute(&data))),
        metadata: ModelMetadata {
            license: Some("apache-2.0".to_string()),
            tags: vec!["chat".to_string()],
            ..Default::default()
        },
    }
}

pub fn desktop() -> HostSnapshot {
    HostSnapshot {
        hardware: HardwareInfo {
            total_memory_mb: 16384,
            available_memory_mb: 8192,
            cpu_cores: 8,
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
            has_avx2: true,
            ..Default::default()
        },
    }
}

/// A small board with 512 MB free and no accelerator
pub fn small_board() -> HostSnapshot {
    HostSnapshot {
        hardware: HardwareInfo {
            total_memory_mb: 1024,
            available_memory_mb: 512,
            cpu_cores: 4,
            architecture: "aarch64".to_string(),
        },
        platform: PlatformInfo {
            os: "linux".to_string(),
            device_type: DeviceType::SingleBoard,
            is_raspberry_pi: true,
            is_microcontroller: false,
            board_model: Some("Raspberry Pi Zero 2 W Rev 1.0".to_string()),
        },
        acceleration: AccelerationInfo {
            has_neon: true,
            ..Default::default()
        },
    }
}

pub fn test_config(home: &TempDir) -> RuntimeConfig {
    let mut config = RuntimeConfig::with_home(home.path());
    config.device_id = "edge-it".to_string();
    config.download_backoff_ms = 1;
    config
}

/// In-memory source serving [`payload`] on the primary URL, in 16 byte chunks
pub fn memory_source() -> MemorySource {
    MemorySource::new()
        .with_payload(&primary_url(MODEL_ID), payload())
        .with_chunk_size(16)
}

pub fn runtime_builder(home: &TempDir, source: Arc<MemorySource>) -> RuntimeBuilder {
    runtime_builder_on(home, source, desktop())
}

pub fn runtime_builder_on(
    home: &TempDir,
    source: Arc<MemorySource>,
    snapshot: HostSnapshot,
) -> RuntimeBuilder {
    Runtime::builder(test_config(home))
        .probe(Box::new(SnapshotProbe::new(snapshot)))
        .catalog(ModelCatalog::from_descriptors(vec![tinyllama()]).expect("valid catalog"))
        .artifact_source(source)
}

pub async fn download(runtime: &Runtime) {
    let state = runtime
        .start_download(MODEL_ID)
        .expect("model in catalog")
        .wait()
        .await;
    assert_eq!(state.status, DownloadStatus::Complete, "{:?}", state.error);
}

/// Runtime on a desktop snapshot with [`MODEL_ID`] already downloaded
pub async fn runtime_with_model(home: &TempDir) -> Runtime {
    let runtime = runtime_builder(home, Arc::new(memory_source()))
        .build()
        .expect("runtime builds");
    download(&runtime).await;
    runtime
}

/// Writes a catalog file containing [`tinyllama`] under `home`
pub fn write_catalog(home: &TempDir) -> PathBuf {
    let path = home.path().join("catalog.json");
    let document = serde_json::json!({ "models": [tinyllama()] });
    std::fs::write(&path, serde_json::to_string_pretty(&document).expect("serializable"))
        .expect("catalog written");
    path
}

pub fn get_edgellm_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_edgellm"))
}
