//! Data location extraction.
//!
//! Works out where the data file of an input item lives: its URL, size,
//! relative path, thumbnail and offline flag. Every accessor follows the
//! same policy: an explicitly supplied value wins, then a value derived
//! from the source, and otherwise [`LocationError::MissingInput`] names
//! what was needed.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::Url;
use thiserror::Error;
use tracing::warn;

use crate::models::{DataLocation, RawValue, ResourceData};
use crate::rules::render_template;
use crate::votable::TapRecord;

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("either an explicit {field} or {fallback} is required")]
    MissingInput {
        field: &'static str,
        fallback: String,
    },
    #[error("could not read size of {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not probe size of {url}: {reason}")]
    Probe { url: String, reason: String },
    #[error("column {column} has invalid value \"{value}\"")]
    InvalidColumn { column: &'static str, value: String },
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("{field} template: {reason}")]
    Template { field: &'static str, reason: String },
}

/// Values supplied by the caller, which always win over derived ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExplicitLocation {
    pub file_url: Option<String>,
    pub file_size: Option<u64>,
    pub file_path: Option<String>,
    pub thumbnail_url: Option<String>,
    pub offline: bool,
}

/// Dataset-level defaults and recovery policies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationSettings {
    /// Local directory stripped from file paths.
    pub base_file_path: Option<PathBuf>,
    /// URL file paths are joined to, and stripped from remote URLs.
    pub base_file_url: Option<String>,
    /// Thumbnail URL template, rendered after extraction.
    pub thumbnail_template: Option<String>,
    /// Probe the file URL for its size instead of using the source.
    pub size_from_head: bool,
    /// Size used when a probe fails. Without it, probe failures are errors.
    pub size_probe_fallback: Option<u64>,
    /// Size used when a TAP record has no size column.
    pub missing_file_size: Option<u64>,
    /// File path template used when a TAP record has no file name column.
    pub missing_file_path: Option<String>,
    pub offline: bool,
}

/// Where the data location is derived from.
#[derive(Debug, Clone, Copy)]
pub enum LocationSource<'a> {
    LocalFile(&'a Path),
    Url(&'a str),
    TapRecord(&'a TapRecord),
}

/// Finds the size of a remote file without downloading it.
#[async_trait]
pub trait SizeProbe: Send + Sync {
    async fn content_length(&self, url: &str) -> Result<u64, String>;
}

/// Size probe issuing an HTTP HEAD request.
#[derive(Debug, Clone)]
pub struct HttpSizeProbe {
    client: reqwest::Client,
}

impl HttpSizeProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SizeProbe for HttpSizeProbe {
    async fn content_length(&self, url: &str) -> Result<u64, String> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| "no Content-Length header".to_string())
    }
}

/// Strip every leading `.` and `/` character so the path is always relative.
pub fn normalize_file_path(path: &str) -> String {
    path.trim_start_matches(['.', '/']).to_string()
}

/// Resolves the data location of one input item.
pub struct DataLocationExtractor<'a> {
    source: LocationSource<'a>,
    explicit: ExplicitLocation,
    settings: &'a LocationSettings,
    probe: &'a dyn SizeProbe,
}

impl<'a> DataLocationExtractor<'a> {
    pub fn new(
        source: LocationSource<'a>,
        settings: &'a LocationSettings,
        probe: &'a dyn SizeProbe,
    ) -> Self {
        Self {
            source,
            explicit: ExplicitLocation::default(),
            settings,
            probe,
        }
    }

    pub fn with_explicit(mut self, explicit: ExplicitLocation) -> Self {
        self.explicit = explicit;
        self
    }

    pub fn resolve_file_path(&self) -> Result<String, LocationError> {
        if let Some(path) = &self.explicit.file_path {
            return Ok(normalize_file_path(path));
        }
        let path = match self.source {
            LocationSource::LocalFile(local) => {
                let mut path = local.to_string_lossy().to_string();
                if let Some(base) = &self.settings.base_file_path {
                    let absolute = std::path::absolute(local)
                        .map(|p| p.to_string_lossy().to_string())
                        .unwrap_or_else(|_| path.clone());
                    let base = base.to_string_lossy();
                    if let Some(stripped) = absolute.strip_prefix(base.as_ref()) {
                        path = stripped.to_string();
                    }
                }
                path
            }
            LocationSource::Url(url) => {
                let stripped = self
                    .settings
                    .base_file_url
                    .as_deref()
                    .and_then(|base| url.strip_prefix(base));
                match stripped {
                    Some(stripped) => stripped.to_string(),
                    None => {
                        return Err(LocationError::MissingInput {
                            field: "file_path",
                            fallback: format!("a base_file_url that prefixes \"{}\"", url),
                        })
                    }
                }
            }
            LocationSource::TapRecord(record) => match record.get("file_name") {
                Some(RawValue::Text(name)) if !name.is_empty() => name.clone(),
                _ => match &self.settings.missing_file_path {
                    Some(template) => {
                        let path = render_template(template, |name, _| {
                            record
                                .get(name)
                                .filter(|v| !v.is_null())
                                .map(|v| v.to_string())
                                .ok_or_else(|| format!("column {} missing from record", name))
                        })
                        .map_err(|reason| LocationError::Template {
                            field: "missing_file_path",
                            reason,
                        })?;
                        warn!("Setting file path to arbitrary value {}", path);
                        path
                    }
                    None => {
                        return Err(LocationError::MissingInput {
                            field: "file_path",
                            fallback: "a file_name column".to_string(),
                        })
                    }
                },
            },
        };
        Ok(normalize_file_path(&path))
    }

    pub fn resolve_file_url(&self) -> Result<String, LocationError> {
        if let Some(url) = &self.explicit.file_url {
            return Ok(url.clone());
        }
        match self.source {
            LocationSource::LocalFile(_) => {
                let base = self.settings.base_file_url.as_deref().ok_or_else(|| {
                    LocationError::MissingInput {
                        field: "file_url",
                        fallback: "base_file_url".to_string(),
                    }
                })?;
                let base = Url::parse(base).map_err(|e| LocationError::InvalidUrl(e.to_string()))?;
                let joined = base
                    .join(&self.resolve_file_path()?)
                    .map_err(|e| LocationError::InvalidUrl(e.to_string()))?;
                Ok(joined.to_string())
            }
            LocationSource::Url(url) => Ok(url.to_string()),
            LocationSource::TapRecord(record) => match record.get("access_url") {
                Some(RawValue::Text(url)) if !url.is_empty() => Ok(url.clone()),
                _ => Err(LocationError::MissingInput {
                    field: "file_url",
                    fallback: "an access_url column".to_string(),
                }),
            },
        }
    }

    pub async fn resolve_file_size(&self) -> Result<u64, LocationError> {
        if let Some(size) = self.explicit.file_size {
            return Ok(size);
        }
        if self.settings.size_from_head {
            return self.probe_size(&self.resolve_file_url()?).await;
        }
        match self.source {
            LocationSource::LocalFile(path) => std::fs::metadata(path)
                .map(|m| m.len())
                .map_err(|source| LocationError::Io {
                    path: path.to_path_buf(),
                    source,
                }),
            LocationSource::Url(url) => self.probe_size(url).await,
            LocationSource::TapRecord(record) => {
                let size = match record.get("access_estsize") {
                    None | Some(RawValue::Null) => None,
                    Some(value) => Some(size_from_raw(value).ok_or_else(|| {
                        LocationError::InvalidColumn {
                            column: "access_estsize",
                            value: value.to_string(),
                        }
                    })?),
                };
                match (size, self.settings.missing_file_size) {
                    (Some(size), _) => Ok(size),
                    (None, Some(sentinel)) => {
                        warn!("File size is unknown, setting to {}", sentinel);
                        Ok(sentinel)
                    }
                    (None, None) => Err(LocationError::MissingInput {
                        field: "file_size",
                        fallback: "an access_estsize column".to_string(),
                    }),
                }
            }
        }
    }

    async fn probe_size(&self, url: &str) -> Result<u64, LocationError> {
        match self.probe.content_length(url).await {
            Ok(size) => Ok(size),
            Err(reason) => match self.settings.size_probe_fallback {
                Some(fallback) => {
                    warn!(
                        "Could not get size of {} ({}), setting to {}",
                        url, reason, fallback
                    );
                    Ok(fallback)
                }
                None => Err(LocationError::Probe {
                    url: url.to_string(),
                    reason,
                }),
            },
        }
    }

    /// Thumbnail URL supplied explicitly or by the source, before any
    /// template is applied.
    pub fn resolve_thumbnail_url(&self) -> Result<Option<String>, LocationError> {
        if let Some(url) = &self.explicit.thumbnail_url {
            return Ok(Some(url.clone()));
        }
        match self.source {
            LocationSource::LocalFile(_) | LocationSource::Url(_) => Ok(None),
            LocationSource::TapRecord(record) => match record.get("thumbnail_url") {
                Some(RawValue::Text(url)) if !url.is_empty() => Ok(Some(url.clone())),
                Some(_) => Ok(None),
                None if self.settings.thumbnail_template.is_some() => Ok(None),
                None => Err(LocationError::MissingInput {
                    field: "thumbnail_url",
                    fallback: "a thumbnail_url column".to_string(),
                }),
            },
        }
    }

    pub fn resolve_offline(&self) -> bool {
        self.explicit.offline || self.settings.offline
    }

    /// Resolve the full data location. `metadata` feeds the thumbnail
    /// template with the fields of the metadata resource.
    pub async fn resource_data(
        &self,
        metadata: Option<&ResourceData>,
    ) -> Result<DataLocation, LocationError> {
        let file_url = self.resolve_file_url()?;
        let file_path = self.resolve_file_path()?;
        let file_size = self.resolve_file_size().await?;
        let mut thumbnail_url = self.resolve_thumbnail_url()?;

        if self.explicit.thumbnail_url.is_none() {
            if let Some(template) = &self.settings.thumbnail_template {
                let rendered = self
                    .render_thumbnail(template, &file_url, &file_path, thumbnail_url.as_deref(), metadata)
                    .map_err(|reason| LocationError::Template {
                        field: "thumbnail_url",
                        reason,
                    })?;
                thumbnail_url = Some(rendered);
            }
        }

        Ok(DataLocation {
            file_url,
            file_size,
            file_path,
            thumbnail_url,
            offline: self.resolve_offline(),
        })
    }

    fn render_thumbnail(
        &self,
        template: &str,
        file_url: &str,
        file_path: &str,
        source_thumbnail: Option<&str>,
        metadata: Option<&ResourceData>,
    ) -> Result<String, String> {
        let file_name = file_path.rsplit('/').next().unwrap_or(file_path);
        render_template(template, |name, format| {
            let value = match name {
                "file_url" => file_url.to_string(),
                "file_url_stem" => strip_extension(file_url).to_string(),
                "file_path" => file_path.to_string(),
                "file_name" => file_name.to_string(),
                "file_stem" => strip_extension(file_name).to_string(),
                "thumbnail_url" => source_thumbnail.unwrap_or_default().to_string(),
                _ => {
                    if let Some(value) = metadata.and_then(|m| m.get(name)) {
                        value.render(format)?
                    } else if let LocationSource::TapRecord(record) = self.source {
                        record
                            .get(name)
                            .map(|v| v.to_string())
                            .ok_or_else(|| format!("unknown placeholder {}", name))?
                    } else {
                        return Err(format!("unknown placeholder {}", name));
                    }
                }
            };
            Ok(value)
        })
    }
}

/// Drop the final `.ext` of the last path segment, if any.
fn strip_extension(path: &str) -> &str {
    let segment_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
    match path[segment_start..].rfind('.') {
        Some(dot) if dot > 0 => &path[..segment_start + dot],
        _ => path,
    }
}

fn size_from_raw(value: &RawValue) -> Option<u64> {
    match value {
        RawValue::Integer(n) => u64::try_from(*n).ok(),
        RawValue::Real(x) if x.is_finite() && *x >= 0.0 && x.fract() == 0.0 => Some(*x as u64),
        RawValue::Text(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}
