//! REST client for the registry API.
//!
//! Resources follow the Tastypie conventions of the registry: list endpoints
//! answer `{"meta": ..., "objects": [...]}`, filters are query parameters,
//! and records are addressed by their `resource_uri`.

use std::path::Path;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Catalog, CatalogError, DataLocationRecord, DatasetInfo, MetadataRecord};
use crate::models::{KeywordDefinition, Resource};

/// Default registry API location.
pub const DEFAULT_API_URL: &str = "https://solarnet.oma.be/service/api/svo";

/// Username and API key of the owner of submitted metadata.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub username: String,
    pub key: String,
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("username", &self.username)
            .field("key", &"***")
            .finish()
    }
}

impl ApiKey {
    /// Parse `username:api_key`.
    pub fn parse(text: &str) -> Option<Self> {
        let (username, key) = text.trim().split_once(':')?;
        Some(Self {
            username: username.to_string(),
            key: key.to_string(),
        })
    }

    /// Read credentials from a file containing `username:api_key`.
    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path).map_err(|e| CatalogError::Auth {
            path: path.display().to_string(),
            reason: format!("could not read username and API key: {}", e),
        })?;
        Self::parse(&text).ok_or_else(|| CatalogError::Auth {
            path: path.display().to_string(),
            reason: "expected the format username:api_key".to_string(),
        })
    }

    pub fn header_value(&self) -> String {
        format!("ApiKey {}:{}", self.username, self.key)
    }
}

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    objects: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct CreatedResource {
    resource_uri: String,
}

/// Catalog backed by the registry REST API.
#[derive(Debug, Clone)]
pub struct RestCatalog {
    client: reqwest::Client,
    base_url: Url,
    auth: Option<ApiKey>,
}

impl RestCatalog {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        auth: Option<ApiKey>,
    ) -> Result<Self, CatalogError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| CatalogError::Communication(format!("invalid API URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(CatalogError::Communication(format!(
                "invalid API URL {}",
                base_url
            )));
        }
        Ok(Self {
            client,
            base_url,
            auth,
        })
    }

    /// `{base}/{segments...}/`
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments).push("");
        }
        url
    }

    /// Absolute URL for a resource URI returned by the API.
    fn resource(&self, resource_uri: &str) -> Result<Url, CatalogError> {
        self.base_url
            .join(resource_uri)
            .map_err(|e| CatalogError::Communication(format!("invalid resource URI {}: {}", resource_uri, e)))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        debug!("{} {}", method, url);
        let request = self.client.request(method, url);
        match &self.auth {
            Some(auth) => request.header(reqwest::header::AUTHORIZATION, auth.header_value()),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, CatalogError> {
        let response = request
            .send()
            .await
            .map_err(|e| CatalogError::Communication(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CatalogError::Communication(if body.trim().is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}\n{}", status, body.trim())
        }))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, &str)],
    ) -> Result<T, CatalogError> {
        let response = self
            .send(self.request(Method::GET, url).query(query))
            .await?;
        response
            .json::<T>()
            .await
            .map_err(|e| CatalogError::Communication(format!("invalid response: {}", e)))
    }

    /// Resource URI of a create/update response. An unreadable body falls
    /// back to the `Location` header.
    async fn created_uri(response: reqwest::Response) -> Option<String> {
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                warn!("Could not read catalog response body: {}", e);
                Default::default()
            }
        };
        resource_uri(&body, location)
    }
}

#[async_trait]
impl Catalog for RestCatalog {
    async fn get_dataset(&self, name: &str) -> Result<DatasetInfo, CatalogError> {
        self.get_json(self.endpoint(&["dataset", name]), &[])
            .await
            .map_err(|e| CatalogError::Communication(format!(
                "could not retrieve info for dataset \"{}\": {}",
                name, e
            )))
    }

    async fn get_keywords(
        &self,
        dataset_name: &str,
    ) -> Result<Vec<KeywordDefinition>, CatalogError> {
        let list: ObjectList<KeywordDefinition> = self
            .get_json(
                self.endpoint(&["keyword"]),
                &[("dataset__name", dataset_name), ("limit", "0")],
            )
            .await
            .map_err(|e| CatalogError::Communication(format!(
                "could not retrieve keywords for dataset \"{}\": {}",
                dataset_name, e
            )))?;
        Ok(list.objects)
    }

    async fn find_data_location(
        &self,
        dataset: &DatasetInfo,
        file_url: &str,
    ) -> Result<Option<DataLocationRecord>, CatalogError> {
        let list: ObjectList<DataLocationRecord> = self
            .get_json(
                self.endpoint(&["data_location"]),
                &[
                    ("dataset__name", dataset.name.as_str()),
                    ("file_url", file_url),
                    ("limit", "1"),
                ],
            )
            .await
            .map_err(|e| CatalogError::Communication(format!(
                "could not retrieve data location for dataset \"{}\": {}",
                dataset.name, e
            )))?;
        Ok(list.objects.into_iter().next())
    }

    async fn find_metadata(
        &self,
        dataset: &DatasetInfo,
        oid: &str,
    ) -> Result<Option<MetadataRecord>, CatalogError> {
        let url = self.resource(&dataset.metadata.resource_uri)?;
        let list: ObjectList<MetadataRecord> = self
            .get_json(url, &[("oid", oid), ("limit", "1")])
            .await
            .map_err(|e| CatalogError::Communication(format!(
                "could not retrieve metadata for dataset \"{}\": {}",
                dataset.name, e
            )))?;
        Ok(list.objects.into_iter().next())
    }

    async fn create_metadata(
        &self,
        dataset: &DatasetInfo,
        resource: &Resource,
    ) -> Result<Option<String>, CatalogError> {
        let url = self.resource(&dataset.metadata.resource_uri)?;
        let response = self
            .send(self.request(Method::POST, url).json(&resource.to_json()))
            .await
            .map_err(|e| CatalogError::Communication(format!(
                "could not create metadata for dataset \"{}\": {}",
                dataset.name, e
            )))?;
        let uri = Self::created_uri(response).await;
        if uri.is_none() {
            warn!(
                "Catalog returned no resource URI for new metadata of dataset \"{}\"",
                dataset.name
            );
        }
        Ok(uri)
    }

    async fn update_metadata(
        &self,
        dataset: &DatasetInfo,
        oid: &str,
        resource: &Resource,
    ) -> Result<String, CatalogError> {
        let mut url = self.resource(&dataset.metadata.resource_uri)?;
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push(oid).push("");
        }
        let mut payload = resource.to_json();
        if let Some(object) = payload.as_object_mut() {
            object.remove("oid");
        }
        let response = self
            .send(self.request(Method::PATCH, url.clone()).json(&payload))
            .await
            .map_err(|e| CatalogError::Communication(format!(
                "could not update metadata {} for dataset \"{}\": {}",
                oid, dataset.name, e
            )))?;
        Ok(Self::created_uri(response)
            .await
            .unwrap_or_else(|| url.path().to_string()))
    }
}

/// `resource_uri` from a response body, else the `Location` header.
fn resource_uri(body: &[u8], location: Option<String>) -> Option<String> {
    serde_json::from_slice::<CreatedResource>(body)
        .ok()
        .map(|r| r.resource_uri)
        .filter(|uri| !uri.is_empty())
        .or(location.filter(|uri| !uri.is_empty()))
}
