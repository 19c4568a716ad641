use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::catalog::rest::DEFAULT_API_URL;
use crate::fits::{BasicAuth, HduSelector, UrlHeaderOptions, BLOCK_SIZE};
use crate::rules::{compile_rules, validate_template, RuleSpec};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub datasets: IndexMap<String, DatasetConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_url")]
    pub url: String,
    /// File containing `username:api_key`.
    #[serde(default = "default_auth_file")]
    pub auth_file: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: default_catalog_url(),
            auth_file: default_auth_file(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_catalog_url() -> String {
    DEFAULT_API_URL.to_string()
}
fn default_auth_file() -> PathBuf {
    PathBuf::from("./.svo_auth")
}
fn default_timeout_secs() -> u64 {
    30
}

/// Where the items of a dataset come from.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    FitsFile,
    FitsUrl,
    Tap,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::FitsFile => "fits_file",
            SourceKind::FitsUrl => "fits_url",
            SourceKind::Tap => "tap",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasetConfig {
    /// Dataset name in the catalog.
    pub name: String,
    pub source: SourceKind,
    #[serde(default)]
    pub hdu: HduSelector,
    #[serde(default)]
    pub base_file_path: Option<PathBuf>,
    #[serde(default)]
    pub base_file_url: Option<String>,
    /// Thumbnail URL template.
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    /// Local keyword definitions used instead of the catalog's.
    #[serde(default)]
    pub keywords_file: Option<PathBuf>,
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub fits: FitsConfig,
    #[serde(default)]
    pub tap: Option<TapConfig>,
    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub fields: IndexMap<String, RuleSpec>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FitsConfig {
    #[serde(default = "default_header_size")]
    pub header_size: usize,
    #[serde(default)]
    pub header_offset: usize,
    #[serde(default)]
    pub zipped: bool,
    #[serde(default)]
    pub promote_comment_keywords: bool,
    #[serde(default)]
    pub auth: Option<BasicAuth>,
}

impl Default for FitsConfig {
    fn default() -> Self {
        Self {
            header_size: default_header_size(),
            header_offset: 0,
            zipped: false,
            promote_comment_keywords: false,
            auth: None,
        }
    }
}

impl FitsConfig {
    pub fn url_options(&self) -> UrlHeaderOptions {
        UrlHeaderOptions {
            header_size: self.header_size,
            header_offset: self.header_offset,
            zipped: self.zipped,
            auth: self.auth.clone(),
        }
    }
}

fn default_header_size() -> usize {
    BLOCK_SIZE
}

#[derive(Debug, Deserialize, Clone)]
pub struct TapConfig {
    pub service_url: String,
    pub table: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

fn default_page_size() -> usize {
    1000
}
fn default_retry_delay_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LocationConfig {
    #[serde(default)]
    pub size_from_head: bool,
    #[serde(default)]
    pub size_probe_fallback: Option<u64>,
    #[serde(default)]
    pub missing_file_size: Option<u64>,
    #[serde(default)]
    pub missing_file_path: Option<String>,
}

impl Config {
    /// Look up a dataset by its config key or its catalog name.
    pub fn dataset(&self, key: &str) -> Result<&DatasetConfig> {
        self.datasets
            .get(key)
            .or_else(|| self.datasets.values().find(|d| d.name == key))
            .ok_or_else(|| {
                let known: Vec<&str> = self.datasets.keys().map(String::as_str).collect();
                anyhow::anyhow!(
                    "Unknown dataset: '{}'. Configured: {}",
                    key,
                    if known.is_empty() {
                        "none".to_string()
                    } else {
                        known.join(", ")
                    }
                )
            })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.catalog.timeout_secs == 0 {
        bail!("catalog.timeout_secs must be > 0");
    }

    for (key, dataset) in &config.datasets {
        if dataset.name.trim().is_empty() {
            bail!("datasets.{}.name must not be empty", key);
        }

        let fits = &dataset.fits;
        if fits.header_size == 0 || fits.header_size % BLOCK_SIZE != 0 {
            bail!(
                "datasets.{}.fits.header_size must be a positive multiple of {}",
                key,
                BLOCK_SIZE
            );
        }

        match (&dataset.source, &dataset.tap) {
            (SourceKind::Tap, None) => {
                bail!("datasets.{} has source 'tap' but no [datasets.{}.tap] table", key, key)
            }
            (_, Some(tap)) => {
                if tap.page_size == 0 {
                    bail!("datasets.{}.tap.page_size must be > 0", key);
                }
                if tap.table.trim().is_empty() {
                    bail!("datasets.{}.tap.table must not be empty", key);
                }
            }
            _ => {}
        }

        if let Some(template) = &dataset.thumbnail_url {
            validate_template(template)
                .map_err(|reason| anyhow::anyhow!("datasets.{}.thumbnail_url: {}", key, reason))?;
        }
        if let Some(template) = &dataset.location.missing_file_path {
            validate_template(template).map_err(|reason| {
                anyhow::anyhow!("datasets.{}.location.missing_file_path: {}", key, reason)
            })?;
        }

        compile_rules(&dataset.fields)
            .map_err(|reason| anyhow::anyhow!("datasets.{}.fields: {}", key, reason))?;
    }

    Ok(())
}
