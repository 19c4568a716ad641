//! Catalog abstraction.
//!
//! The [`Catalog`] trait is everything the provider needs from the central
//! registry: dataset identity, keyword definitions, existence checks and the
//! create/update calls. [`rest::RestCatalog`] talks to the registry's REST
//! API; [`memory::InMemoryCatalog`] keeps everything in process for tests
//! and offline runs.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod rest;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{KeywordDefinition, Resource};

#[derive(Debug, Error)]
pub enum CatalogError {
    /// Transport failure or an error response. Carries the HTTP status and
    /// response body when there was one.
    #[error("{0}")]
    Communication(String),
    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: &'static str, name: String },
    #[error("invalid authentication file {path}: {reason}")]
    Auth { path: String, reason: String },
}

/// Reference to the metadata resource of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataResourceRef {
    pub resource_uri: String,
}

/// Dataset identity as returned by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub name: String,
    pub resource_uri: String,
    pub metadata: MetadataResourceRef,
}

/// An existing data location record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLocationRecord {
    pub resource_uri: String,
    pub file_url: String,
}

/// An existing metadata record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub resource_uri: String,
    pub oid: String,
}

/// Abstract registry backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_dataset`](Catalog::get_dataset) | Dataset identity and metadata resource |
/// | [`get_keywords`](Catalog::get_keywords) | Keyword definitions of a dataset |
/// | [`find_data_location`](Catalog::find_data_location) | Existing location for a file URL |
/// | [`find_metadata`](Catalog::find_metadata) | Existing metadata for an oid |
/// | [`create_metadata`](Catalog::create_metadata) | Create metadata (and a nested location) |
/// | [`update_metadata`](Catalog::update_metadata) | Patch existing metadata |
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get_dataset(&self, name: &str) -> Result<DatasetInfo, CatalogError>;

    async fn get_keywords(&self, dataset_name: &str)
        -> Result<Vec<KeywordDefinition>, CatalogError>;

    /// The location already registered for `(dataset, file_url)`, if any.
    async fn find_data_location(
        &self,
        dataset: &DatasetInfo,
        file_url: &str,
    ) -> Result<Option<DataLocationRecord>, CatalogError>;

    async fn find_metadata(
        &self,
        dataset: &DatasetInfo,
        oid: &str,
    ) -> Result<Option<MetadataRecord>, CatalogError>;

    /// Create a metadata record. Returns its resource URI, when the catalog
    /// reports one.
    async fn create_metadata(
        &self,
        dataset: &DatasetInfo,
        resource: &Resource,
    ) -> Result<Option<String>, CatalogError>;

    /// Patch the metadata record `oid`. Returns its resource URI.
    async fn update_metadata(
        &self,
        dataset: &DatasetInfo,
        oid: &str,
        resource: &Resource,
    ) -> Result<String, CatalogError>;
}
