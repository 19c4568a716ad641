//! In-memory [`Catalog`] implementation for tests and offline runs.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Behaves like the registry
//! for the operations the provider uses: a nested new data location is
//! created with its metadata, a nested resource URI links to an existing
//! one, and metadata oids are unique per dataset.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use super::{
    Catalog, CatalogError, DataLocationRecord, DatasetInfo, MetadataRecord, MetadataResourceRef,
};
use crate::models::{DataLocationPayload, KeywordDefinition, Resource};

#[derive(Default)]
struct State {
    datasets: HashMap<String, (DatasetInfo, Vec<KeywordDefinition>)>,
    /// (dataset name, file_url) -> record
    locations: HashMap<(String, String), DataLocationRecord>,
    /// (dataset name, oid) -> (record, payload)
    metadata: HashMap<(String, String), (MetadataRecord, serde_json::Value)>,
    next_id: u64,
}

/// In-memory registry.
#[derive(Default)]
pub struct InMemoryCatalog {
    state: RwLock<State>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a dataset and its keywords. Returns its identity.
    pub fn add_dataset(&self, name: &str, keywords: Vec<KeywordDefinition>) -> DatasetInfo {
        let slug = slug(name);
        let info = DatasetInfo {
            name: name.to_string(),
            resource_uri: format!("/service/api/svo/dataset/{}/", slug),
            metadata: MetadataResourceRef {
                resource_uri: format!("/service/api/svo/{}/", slug),
            },
        };
        self.write()
            .datasets
            .insert(name.to_string(), (info.clone(), keywords));
        info
    }

    pub fn data_location_count(&self) -> usize {
        self.read().locations.len()
    }

    pub fn metadata_count(&self) -> usize {
        self.read().metadata.len()
    }

    /// Stored payload of a metadata record.
    pub fn metadata_payload(&self, dataset: &str, oid: &str) -> Option<serde_json::Value> {
        self.read()
            .metadata
            .get(&(dataset.to_string(), oid.to_string()))
            .map(|(_, payload)| payload.clone())
    }

    fn link_location(
        state: &mut State,
        dataset: &DatasetInfo,
        payload: &DataLocationPayload,
    ) -> Result<(), CatalogError> {
        match payload {
            DataLocationPayload::New { location, .. } => {
                let key = (dataset.name.clone(), location.file_url.clone());
                if state.locations.contains_key(&key) {
                    return Err(CatalogError::Communication(format!(
                        "HTTP 400 Bad Request\ndata location with file_url {} already exists",
                        location.file_url
                    )));
                }
                state.next_id += 1;
                let record = DataLocationRecord {
                    resource_uri: format!("/service/api/svo/data_location/{}/", state.next_id),
                    file_url: location.file_url.clone(),
                };
                state.locations.insert(key, record);
                Ok(())
            }
            DataLocationPayload::Existing(uri) => {
                if state.locations.values().any(|r| &r.resource_uri == uri) {
                    Ok(())
                } else {
                    Err(CatalogError::NotFound {
                        kind: "data location",
                        name: uri.clone(),
                    })
                }
            }
        }
    }
}

fn slug(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn get_dataset(&self, name: &str) -> Result<DatasetInfo, CatalogError> {
        self.read()
            .datasets
            .get(name)
            .map(|(info, _)| info.clone())
            .ok_or_else(|| CatalogError::NotFound {
                kind: "dataset",
                name: name.to_string(),
            })
    }

    async fn get_keywords(
        &self,
        dataset_name: &str,
    ) -> Result<Vec<KeywordDefinition>, CatalogError> {
        self.read()
            .datasets
            .get(dataset_name)
            .map(|(_, keywords)| keywords.clone())
            .ok_or_else(|| CatalogError::NotFound {
                kind: "dataset",
                name: dataset_name.to_string(),
            })
    }

    async fn find_data_location(
        &self,
        dataset: &DatasetInfo,
        file_url: &str,
    ) -> Result<Option<DataLocationRecord>, CatalogError> {
        Ok(self
            .read()
            .locations
            .get(&(dataset.name.clone(), file_url.to_string()))
            .cloned())
    }

    async fn find_metadata(
        &self,
        dataset: &DatasetInfo,
        oid: &str,
    ) -> Result<Option<MetadataRecord>, CatalogError> {
        Ok(self
            .read()
            .metadata
            .get(&(dataset.name.clone(), oid.to_string()))
            .map(|(record, _)| record.clone()))
    }

    async fn create_metadata(
        &self,
        dataset: &DatasetInfo,
        resource: &Resource,
    ) -> Result<Option<String>, CatalogError> {
        let oid = resource
            .oid()
            .ok_or_else(|| CatalogError::Communication("HTTP 400 Bad Request\noid is required".into()))?
            .to_string();
        let mut state = self.write();
        let key = (dataset.name.clone(), oid.clone());
        if state.metadata.contains_key(&key) {
            return Err(CatalogError::Communication(format!(
                "HTTP 400 Bad Request\nmetadata with oid {} already exists",
                oid
            )));
        }
        Self::link_location(&mut state, dataset, &resource.data_location)?;
        let record = MetadataRecord {
            resource_uri: format!("{}{}/", dataset.metadata.resource_uri, oid),
            oid,
        };
        let uri = record.resource_uri.clone();
        state.metadata.insert(key, (record, resource.to_json()));
        Ok(Some(uri))
    }

    async fn update_metadata(
        &self,
        dataset: &DatasetInfo,
        oid: &str,
        resource: &Resource,
    ) -> Result<String, CatalogError> {
        let mut state = self.write();
        let key = (dataset.name.clone(), oid.to_string());
        if !state.metadata.contains_key(&key) {
            return Err(CatalogError::NotFound {
                kind: "metadata",
                name: oid.to_string(),
            });
        }
        Self::link_location(&mut state, dataset, &resource.data_location)?;
        let payload = resource.to_json();
        match state.metadata.get_mut(&key) {
            Some((record, stored)) => {
                *stored = payload;
                Ok(record.resource_uri.clone())
            }
            None => Err(CatalogError::NotFound {
                kind: "metadata",
                name: oid.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataLocation, FieldValue, ResourceData};

    fn resource(oid: &str, location: DataLocationPayload) -> Resource {
        let mut metadata = ResourceData::new();
        metadata.insert("oid".into(), FieldValue::Text(oid.into()));
        Resource {
            metadata,
            data_location: location,
        }
    }

    fn new_location(dataset: &DatasetInfo, url: &str) -> DataLocationPayload {
        DataLocationPayload::New {
            dataset: dataset.resource_uri.clone(),
            location: DataLocation {
                file_url: url.into(),
                file_size: 1,
                file_path: "a.fits".into(),
                thumbnail_url: None,
                offline: false,
            },
        }
    }

    #[tokio::test]
    async fn dataset_lookup() {
        let catalog = InMemoryCatalog::new();
        let info = catalog.add_dataset("SWAP level 1", Vec::new());
        assert_eq!(info.metadata.resource_uri, "/service/api/svo/swap_level_1/");
        assert_eq!(catalog.get_dataset("SWAP level 1").await.unwrap(), info);
        assert!(matches!(
            catalog.get_keywords("AIA").await,
            Err(CatalogError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn create_links_or_creates_locations() {
        let catalog = InMemoryCatalog::new();
        let ds = catalog.add_dataset("SWAP level 1", Vec::new());
        let url = "https://example.org/a.fits";

        catalog
            .create_metadata(&ds, &resource("1", new_location(&ds, url)))
            .await
            .unwrap();
        let existing = catalog.find_data_location(&ds, url).await.unwrap().unwrap();

        catalog
            .create_metadata(
                &ds,
                &resource("2", DataLocationPayload::Existing(existing.resource_uri.clone())),
            )
            .await
            .unwrap();
        assert_eq!(catalog.data_location_count(), 1);
        assert_eq!(catalog.metadata_count(), 2);

        assert!(catalog
            .create_metadata(&ds, &resource("3", new_location(&ds, url)))
            .await
            .is_err());
        assert!(catalog
            .create_metadata(&ds, &resource("1", DataLocationPayload::Existing(existing.resource_uri)))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn update_replaces_payload() {
        let catalog = InMemoryCatalog::new();
        let ds = catalog.add_dataset("EIT level 0", Vec::new());
        let url = "https://example.org/eit.fits";
        catalog
            .create_metadata(&ds, &resource("42", new_location(&ds, url)))
            .await
            .unwrap();
        let existing = catalog.find_data_location(&ds, url).await.unwrap().unwrap();
        let mut updated = resource("42", DataLocationPayload::Existing(existing.resource_uri));
        updated
            .metadata
            .insert("wavemin".into(), FieldValue::Real(19.5));
        let uri = catalog.update_metadata(&ds, "42", &updated).await.unwrap();
        assert_eq!(uri, "/service/api/svo/eit_level_0/42/");
        assert_eq!(
            catalog.metadata_payload("EIT level 0", "42").unwrap()["wavemin"],
            19.5
        );
        assert!(catalog.update_metadata(&ds, "43", &updated).await.is_err());
    }
}
