//! Model catalog: descriptors, compatibility filtering and recommendations

mod compat;
mod descriptor;
mod model_catalog;

pub use compat::{check_compatibility, CompatibilityReport};
pub use descriptor::{ModelDescriptor, ModelMetadata};
pub use model_catalog::{CatalogDocument, ModelCatalog};

#[cfg(test)]
pub(crate) use descriptor::fixtures;
