//! The model catalog

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::descriptor::ModelDescriptor;
use crate::capability::{PerformanceTier, SystemCapabilities};
use crate::error::{Result, RuntimeError};

/// On-disk catalog document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDocument {
    pub models: Vec<ModelDescriptor>,
}

/// Read-only mapping from model id to descriptor, loaded once
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: Vec<ModelDescriptor>,
    index: HashMap<String, usize>,
}

impl ModelCatalog {
    pub fn from_descriptors(descriptors: Vec<ModelDescriptor>) -> Result<Self> {
        let mut models = Vec::with_capacity(descriptors.len());
        let mut index = HashMap::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let descriptor = descriptor.validate()?;
            if index.contains_key(&descriptor.id) {
                return Err(RuntimeError::model(format!(
                    "Duplicate model id '{}' in catalog",
                    descriptor.id
                ))
                .with_context("model_id", &descriptor.id));
            }
            index.insert(descriptor.id.clone(), models.len());
            models.push(descriptor);
        }

        Ok(Self { models, index })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let document: CatalogDocument = serde_json::from_str(json)
            .map_err(|e| RuntimeError::model(format!("Failed to parse model catalog: {}", e)))?;
        Self::from_descriptors(document.models)
    }

    /// Loads the catalog file. A missing file yields an empty catalog
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(
                "Model catalog not found at {}, starting with an empty catalog",
                path.display()
            );
            return Ok(Self::default());
        }

        let json = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::model(format!("Failed to read model catalog: {}", e))
                .with_context("path", path.display())
        })?;
        let catalog = Self::from_json(&json)?;

        info!("Loaded {} models from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn all(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.index.contains_key(model_id)
    }

    pub fn get(&self, model_id: &str) -> Result<&ModelDescriptor> {
        self.index
            .get(model_id)
            .map(|&i| &self.models[i])
            .ok_or_else(|| RuntimeError::model_not_found(model_id))
    }

    /// Models that support the device type and whose minimum tier the device meets,
    /// smallest memory requirement first
    pub fn list_compatible(&self, capabilities: &SystemCapabilities) -> Vec<&ModelDescriptor> {
        let mut compatible: Vec<&ModelDescriptor> = self
            .models
            .iter()
            .filter(|m| m.supports_device(capabilities.platform.device_type))
            .filter(|m| m.min_performance_tier <= capabilities.performance_tier)
            .collect();

        compatible.sort_by(|a, b| {
            a.required_memory_mb
                .cmp(&b.required_memory_mb)
                .then_with(|| a.id.cmp(&b.id))
        });

        debug!(
            "{} of {} models compatible with {} tier {}",
            compatible.len(),
            self.models.len(),
            capabilities.platform.device_type,
            capabilities.performance_tier
        );
        compatible
    }

    /// Compatible models that also fit in available memory and the tier's size limit.
    ///
    /// Ultra devices get the largest models first; every other tier gets the smallest.
    pub fn recommend(&self, capabilities: &SystemCapabilities) -> Vec<&ModelDescriptor> {
        let mut fitting: Vec<&ModelDescriptor> = self
            .list_compatible(capabilities)
            .into_iter()
            .filter(|m| m.required_memory_mb <= capabilities.hardware.available_memory_mb)
            .filter(|m| m.size_mb() <= capabilities.constraints.max_model_size_mb)
            .collect();

        if capabilities.performance_tier == PerformanceTier::Ultra {
            fitting.reverse();
        }

        if let Some(top) = fitting.first() {
            info!(
                "Recommended model: {} ({} MB required, {} MB available)",
                top.name, top.required_memory_mb, capabilities.hardware.available_memory_mb
            );
        } else {
            info!(
                "No model fits {} MB available memory at tier {}",
                capabilities.hardware.available_memory_mb, capabilities.performance_tier
            );
        }

        fitting
    }
}
