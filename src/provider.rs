//! Submission pipeline orchestration.
//!
//! Coordinates the full flow for one dataset: catalog setup → source read →
//! metadata and data location extraction → deduplication → create, update
//! or dry-run report. Items are processed strictly one after the other and
//! a failing item never aborts the batch; only the one-time setup
//! (dataset info and keyword definitions) is fatal.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::catalog::rest::{ApiKey, RestCatalog};
use crate::catalog::{Catalog, CatalogError, DatasetInfo};
use crate::config::{CatalogConfig, Config, DatasetConfig, SourceKind};
use crate::data_location::{
    DataLocationExtractor, ExplicitLocation, HttpSizeProbe, LocationError, LocationSettings,
    LocationSource, SizeProbe,
};
use crate::files::FileScan;
use crate::fits::{self, FitsError, FitsHeader, HduSelector, UrlHeaderOptions};
use crate::metadata::{FieldError, FieldRules, MetadataExtractor, RawSource};
use crate::models::{DataLocationPayload, InputItem, KeywordDefinition, KeywordSet, Resource};
use crate::progress::{SubmitProgressEvent, SubmitProgressReporter};
use crate::rules::compile_rules;
use crate::tap::{TapClient, TapRecordStream};
use crate::votable::TapRecord;

/// Setup failures. These abort the batch before any item is processed.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Failure of a single item. Logged, counted, and the batch moves on.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("could not read FITS header: {0}")]
    Fits(#[from] FitsError),
    #[error("could not extract metadata: {0}")]
    Field(#[from] FieldError),
    #[error("could not extract data location: {0}")]
    Location(#[from] LocationError),
    #[error("could not check for an existing data location: {0}")]
    Lookup(#[source] CatalogError),
    #[error("could not submit resource: {0}")]
    Submit(#[source] CatalogError),
    #[error("{item} cannot be used with a {kind} dataset")]
    UnsupportedInput { item: String, kind: SourceKind },
    #[error("resource has no oid")]
    MissingOid,
}

/// Everything needed to extract resources for one dataset, resolved from
/// configuration.
#[derive(Debug, Clone)]
pub struct DatasetProfile {
    /// Dataset name in the catalog.
    pub name: String,
    pub source: SourceKind,
    pub hdu: HduSelector,
    pub url_options: UrlHeaderOptions,
    pub promote_comment_keywords: bool,
    pub location: LocationSettings,
    pub rules: FieldRules,
    pub keywords_file: Option<PathBuf>,
}

impl DatasetProfile {
    pub fn from_config(config: &DatasetConfig) -> Result<Self, ProviderError> {
        let rules = compile_rules(&config.fields).map_err(|reason| {
            ProviderError::Configuration(format!("dataset \"{}\": {}", config.name, reason))
        })?;
        let base_file_path = config
            .base_file_path
            .as_ref()
            .map(|base| std::path::absolute(base).unwrap_or_else(|_| base.clone()));
        Ok(Self {
            name: config.name.clone(),
            source: config.source,
            hdu: config.hdu.clone(),
            url_options: config.fits.url_options(),
            promote_comment_keywords: config.fits.promote_comment_keywords,
            location: LocationSettings {
                base_file_path,
                base_file_url: config.base_file_url.clone(),
                thumbnail_template: config.thumbnail_url.clone(),
                size_from_head: config.location.size_from_head,
                size_probe_fallback: config.location.size_probe_fallback,
                missing_file_size: config.location.missing_file_size,
                missing_file_path: config.location.missing_file_path.clone(),
                offline: config.offline,
            },
            rules,
            keywords_file: config.keywords_file.clone(),
        })
    }

    /// A profile with default rules, for library users and tests.
    pub fn new(name: impl Into<String>, source: SourceKind) -> Self {
        Self {
            name: name.into(),
            source,
            hdu: HduSelector::default(),
            url_options: UrlHeaderOptions::default(),
            promote_comment_keywords: false,
            location: LocationSettings::default(),
            rules: FieldRules::with_defaults(),
            keywords_file: None,
        }
    }
}

/// Read keyword definitions from a JSON file, as written by `svo inspect`.
pub fn load_keywords_file(path: &Path) -> Result<Vec<KeywordDefinition>, ProviderError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ProviderError::Configuration(format!(
            "could not read keywords file {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&text).map_err(|e| {
        ProviderError::Configuration(format!(
            "invalid keywords file {}: {}",
            path.display(),
            e
        ))
    })
}

/// Keyword definitions of a dataset: the local file when configured, the
/// catalog otherwise.
pub async fn fetch_keywords(
    catalog: &dyn Catalog,
    profile: &DatasetProfile,
) -> Result<Vec<KeywordDefinition>, ProviderError> {
    match &profile.keywords_file {
        Some(path) => load_keywords_file(path),
        None => Ok(catalog.get_keywords(&profile.name).await?),
    }
}

/// Caller-supplied values for one item. They win over extracted ones.
#[derive(Debug, Clone, Default)]
pub struct ItemOverrides {
    pub oid: Option<String>,
    pub location: ExplicitLocation,
}

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Build and print payloads without any mutating catalog call.
    pub dry_run: bool,
    /// Patch metadata that already exists for the same oid instead of
    /// creating a duplicate.
    pub update_existing: bool,
    /// Fail items on optional field errors instead of omitting the field.
    pub strict: bool,
}

/// Final state of one item.
#[derive(Debug)]
pub enum ItemOutcome {
    /// New metadata and a new data location.
    Created { uri: Option<String> },
    /// New metadata linked to a data location the catalog already had.
    Reused { uri: Option<String> },
    /// Existing metadata patched.
    Updated { uri: String },
    /// Nothing submitted; the assembled resource.
    DryRunReported(Box<Resource>),
    Failed(ItemError),
}

/// Counts for a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitSummary {
    pub processed: u64,
    pub created: u64,
    pub reused: u64,
    pub updated: u64,
    pub dry_run: u64,
    pub failed: u64,
}

impl SubmitSummary {
    pub fn record(&mut self, outcome: &ItemOutcome) {
        self.processed += 1;
        match outcome {
            ItemOutcome::Created { .. } => self.created += 1,
            ItemOutcome::Reused { .. } => self.reused += 1,
            ItemOutcome::Updated { .. } => self.updated += 1,
            ItemOutcome::DryRunReported(_) => self.dry_run += 1,
            ItemOutcome::Failed(_) => self.failed += 1,
        }
    }

    pub fn print(&self, dataset: &str, dry_run: bool) {
        if dry_run {
            println!("submit {} (dry-run)", dataset);
        } else {
            println!("submit {}", dataset);
        }
        println!("  processed: {} items", self.processed);
        if dry_run {
            println!("  reported: {}", self.dry_run);
        } else {
            println!("  created: {}", self.created);
            println!("  created with existing data location: {}", self.reused);
            println!("  updated: {}", self.updated);
        }
        println!("  failed: {}", self.failed);
        println!("{}", if self.failed == 0 { "ok" } else { "completed with failures" });
    }
}

/// A lazy sequence of input items.
#[async_trait(?Send)]
pub trait ItemSource {
    async fn next_item(&mut self) -> Option<InputItem>;

    /// Number of items, when known upfront.
    fn size_hint(&self) -> Option<u64> {
        None
    }
}

/// Local files from a [`FileScan`].
pub struct FileItems<'a> {
    paths: Box<dyn Iterator<Item = PathBuf> + 'a>,
}

impl<'a> FileItems<'a> {
    pub fn new(scan: &'a FileScan) -> Self {
        Self {
            paths: Box::new(scan.paths()),
        }
    }

    pub fn from_paths(paths: Vec<PathBuf>) -> Self {
        Self {
            paths: Box::new(paths.into_iter()),
        }
    }
}

#[async_trait(?Send)]
impl ItemSource for FileItems<'_> {
    async fn next_item(&mut self) -> Option<InputItem> {
        self.paths.next().map(InputItem::LocalFile)
    }
}

/// Remote FITS file URLs.
pub struct UrlItems {
    urls: VecDeque<String>,
}

impl UrlItems {
    pub fn new(urls: Vec<String>) -> Self {
        Self { urls: urls.into() }
    }
}

#[async_trait(?Send)]
impl ItemSource for UrlItems {
    async fn next_item(&mut self) -> Option<InputItem> {
        self.urls.pop_front().map(InputItem::Url)
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.urls.len() as u64)
    }
}

/// Records from a paginated TAP table.
pub struct TapItems<'a> {
    stream: TapRecordStream<'a>,
}

impl<'a> TapItems<'a> {
    pub fn new(stream: TapRecordStream<'a>) -> Self {
        Self { stream }
    }
}

#[async_trait(?Send)]
impl ItemSource for TapItems<'_> {
    async fn next_item(&mut self) -> Option<InputItem> {
        self.stream.next().await.map(InputItem::Record)
    }
}

/// Raw source of one item once read.
enum Loaded<'i> {
    Header(FitsHeader, LocationSource<'i>),
    Record(&'i TapRecord),
}

/// Extracts and submits the resources of one dataset.
pub struct Provider {
    catalog: Arc<dyn Catalog>,
    probe: Arc<dyn SizeProbe>,
    http: reqwest::Client,
    profile: DatasetProfile,
    dataset: DatasetInfo,
    keywords: KeywordSet,
}

impl Provider {
    /// Fetch the dataset identity and keyword definitions. Any failure here
    /// is fatal for the batch.
    pub async fn connect(
        catalog: Arc<dyn Catalog>,
        probe: Arc<dyn SizeProbe>,
        http: reqwest::Client,
        profile: DatasetProfile,
    ) -> Result<Self, ProviderError> {
        let dataset = catalog.get_dataset(&profile.name).await?;
        let definitions = fetch_keywords(catalog.as_ref(), &profile).await?;
        if definitions.is_empty() {
            warn!("Dataset \"{}\" has no keyword definitions", profile.name);
        }
        let keywords = KeywordSet::new(definitions);
        info!(
            "Dataset \"{}\" ({}) with {} keywords",
            dataset.name,
            dataset.resource_uri,
            keywords.len()
        );
        Ok(Self {
            catalog,
            probe,
            http,
            profile,
            dataset,
            keywords,
        })
    }

    pub fn dataset(&self) -> &DatasetInfo {
        &self.dataset
    }

    pub fn keywords(&self) -> &KeywordSet {
        &self.keywords
    }

    pub fn profile(&self) -> &DatasetProfile {
        &self.profile
    }

    async fn load<'i>(&self, item: &'i InputItem) -> Result<Loaded<'i>, ItemError> {
        let kind = self.profile.source;
        let loaded = match (item, kind) {
            (InputItem::LocalFile(path), SourceKind::FitsFile) => {
                let header = fits::read_header(path, &self.profile.hdu)?;
                Loaded::Header(header, LocationSource::LocalFile(path))
            }
            (InputItem::Url(url), SourceKind::FitsUrl) => {
                let header = fits::fetch_header(&self.http, url, &self.profile.url_options).await?;
                Loaded::Header(header, LocationSource::Url(url))
            }
            (InputItem::Record(record), SourceKind::Tap) => Loaded::Record(record),
            _ => {
                return Err(ItemError::UnsupportedInput {
                    item: item.to_string(),
                    kind,
                })
            }
        };
        Ok(match loaded {
            Loaded::Header(mut header, location) if self.profile.promote_comment_keywords => {
                let promoted = header.promote_comment_keywords();
                debug!("Promoted {} COMMENT cards to keywords", promoted);
                Loaded::Header(header, location)
            }
            other => other,
        })
    }

    /// Extract the merged metadata + data location resource of one item.
    pub async fn build_resource(
        &self,
        item: &InputItem,
        overrides: &ItemOverrides,
        strict: bool,
    ) -> Result<Resource, ItemError> {
        let loaded = self.load(item).await?;

        let (metadata, location_source) = {
            let (source, location_source): (&dyn RawSource, LocationSource<'_>) = match &loaded {
                Loaded::Header(header, location) => (header as &dyn RawSource, *location),
                Loaded::Record(record) => {
                    (*record as &dyn RawSource, LocationSource::TapRecord(record))
                }
            };
            let extractor = MetadataExtractor::new(source, &self.keywords, &self.profile.rules)
                .with_explicit_oid(overrides.oid.clone())
                .strict(strict);
            (extractor.resource_data()?, location_source)
        };

        let location = DataLocationExtractor::new(
            location_source,
            &self.profile.location,
            self.probe.as_ref(),
        )
        .with_explicit(overrides.location.clone())
        .resource_data(Some(&metadata))
        .await?;

        Ok(Resource {
            metadata,
            data_location: DataLocationPayload::New {
                dataset: self.dataset.resource_uri.clone(),
                location,
            },
        })
    }

    /// Replace a new data location by a reference to the one the catalog
    /// already has for the same file URL. Returns whether it did.
    pub async fn deduplicate(&self, resource: &mut Resource) -> Result<bool, CatalogError> {
        let file_url = match resource.data_location.file_url() {
            Some(url) => url.to_string(),
            None => return Ok(true),
        };
        match self
            .catalog
            .find_data_location(&self.dataset, &file_url)
            .await?
        {
            Some(existing) => {
                resource.data_location = DataLocationPayload::Existing(existing.resource_uri);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Process one item. Never fails: errors are logged and returned as
    /// [`ItemOutcome::Failed`].
    pub async fn submit_item(&self, item: &InputItem, options: &SubmitOptions) -> ItemOutcome {
        info!("Creating metadata and data_location resource for {}", item);
        match self.process_item(item, options).await {
            Ok(outcome) => outcome,
            Err(e) => {
                match &e {
                    ItemError::Submit(_) => error!(
                        "Could not create new metadata or data_location resource for {}: {}",
                        item, e
                    ),
                    _ => error!("Could not extract resource data for {}: {}", item, e),
                }
                ItemOutcome::Failed(e)
            }
        }
    }

    async fn process_item(
        &self,
        item: &InputItem,
        options: &SubmitOptions,
    ) -> Result<ItemOutcome, ItemError> {
        let mut resource = self
            .build_resource(item, &ItemOverrides::default(), options.strict)
            .await?;
        debug!(
            "{}",
            serde_json::to_string_pretty(&resource.to_json()).unwrap_or_default()
        );

        let reused = self
            .deduplicate(&mut resource)
            .await
            .map_err(ItemError::Lookup)?;
        if reused {
            info!("Data location for {} already exists, reusing!", item);
        }

        if options.dry_run {
            info!("Called with dry-run option, not submitting anything");
            return Ok(ItemOutcome::DryRunReported(Box::new(resource)));
        }

        if options.update_existing {
            let oid = resource.oid().ok_or(ItemError::MissingOid)?.to_string();
            let existing = self
                .catalog
                .find_metadata(&self.dataset, &oid)
                .await
                .map_err(ItemError::Lookup)?;
            if existing.is_some() {
                let uri = self
                    .catalog
                    .update_metadata(&self.dataset, &oid, &resource)
                    .await
                    .map_err(ItemError::Submit)?;
                info!("Updated metadata resource \"{}\" for {}", uri, item);
                return Ok(ItemOutcome::Updated { uri });
            }
        }

        let uri = self
            .catalog
            .create_metadata(&self.dataset, &resource)
            .await
            .map_err(ItemError::Submit)?;
        match &uri {
            Some(uri) => info!("Created new metadata resource \"{}\" for {}", uri, item),
            None => warn!("Created new metadata for {} without a resource URI", item),
        }
        Ok(if reused {
            ItemOutcome::Reused { uri }
        } else {
            ItemOutcome::Created { uri }
        })
    }

    /// Process every item in order. Dry-run payloads are printed to stdout.
    pub async fn submit_all(
        &self,
        items: &mut dyn ItemSource,
        options: &SubmitOptions,
        progress: &dyn SubmitProgressReporter,
    ) -> SubmitSummary {
        let mut summary = SubmitSummary::default();
        let total = items.size_hint();
        while let Some(item) = items.next_item().await {
            let outcome = self.submit_item(&item, options).await;
            if let ItemOutcome::DryRunReported(resource) = &outcome {
                match serde_json::to_string_pretty(&resource.to_json()) {
                    Ok(json) => println!("{}", json),
                    Err(e) => warn!("Could not serialize resource for {}: {}", item, e),
                }
            }
            summary.record(&outcome);
            progress.report(SubmitProgressEvent::Processing {
                dataset: self.dataset.name.clone(),
                n: summary.processed,
                failed: summary.failed,
                total,
            });
        }
        summary
    }
}

/// HTTP client shared by the catalog, size probes and source readers.
pub fn http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("svo-provider/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

/// REST catalog for the configured API. Credentials are required unless
/// `require_auth` is false, in which case a missing auth file only warns.
pub fn rest_catalog(
    config: &CatalogConfig,
    http: reqwest::Client,
    require_auth: bool,
) -> anyhow::Result<RestCatalog> {
    let auth = match ApiKey::from_file(&config.auth_file) {
        Ok(key) => Some(key),
        Err(e) if !require_auth => {
            warn!("{}, continuing without authentication", e);
            None
        }
        Err(e) => return Err(e.into()),
    };
    Ok(RestCatalog::new(http, &config.url, auth)?)
}

/// Command-line options of `svo submit`.
#[derive(Debug, Clone, Default)]
pub struct SubmitArgs {
    pub inputs: Vec<String>,
    pub options: SubmitOptions,
    pub min_modification_time: Option<NaiveDateTime>,
    pub batch_size: Option<usize>,
}

/// Run a submission batch for a configured dataset against the REST catalog.
pub async fn run_submit(
    config: &Config,
    dataset_key: &str,
    args: SubmitArgs,
    progress: &dyn SubmitProgressReporter,
) -> anyhow::Result<SubmitSummary> {
    let dataset_config = config.dataset(dataset_key)?;
    let profile = DatasetProfile::from_config(dataset_config)?;
    progress.report(SubmitProgressEvent::Preparing {
        dataset: profile.name.clone(),
    });

    let http = http_client(config.catalog.timeout_secs)?;
    let catalog = rest_catalog(&config.catalog, http.clone(), !args.options.dry_run)?;
    let probe = HttpSizeProbe::new(http.clone());
    let provider = Provider::connect(Arc::new(catalog), Arc::new(probe), http.clone(), profile)
        .await
        .with_context(|| format!("Could not create provider for dataset \"{}\"", dataset_key))?;

    let summary = match dataset_config.source {
        SourceKind::FitsFile => {
            if args.inputs.is_empty() {
                bail!("No input files given for dataset '{}'", dataset_key);
            }
            let scan = FileScan::new(&args.inputs)?
                .with_min_modification_time(args.min_modification_time);
            let mut items = FileItems::new(&scan);
            provider.submit_all(&mut items, &args.options, progress).await
        }
        SourceKind::FitsUrl => {
            if args.inputs.is_empty() {
                bail!("No input URLs given for dataset '{}'", dataset_key);
            }
            if args.min_modification_time.is_some() {
                warn!("--min-modif-time is ignored for URL inputs");
            }
            let mut items = UrlItems::new(args.inputs.clone());
            provider.submit_all(&mut items, &args.options, progress).await
        }
        SourceKind::Tap => {
            let tap = dataset_config
                .tap
                .as_ref()
                .with_context(|| format!("Dataset '{}' has no TAP configuration", dataset_key))?;
            if !args.inputs.is_empty() {
                warn!("Inputs are ignored for TAP datasets, records come from {}", tap.table);
            }
            let client = TapClient::new(http.clone(), &tap.service_url)?;
            let stream = TapRecordStream::new(
                &client,
                tap.table.clone(),
                args.batch_size.unwrap_or(tap.page_size),
                args.min_modification_time,
                Duration::from_secs(tap.retry_delay_secs),
            );
            let mut items = TapItems::new(stream);
            provider.submit_all(&mut items, &args.options, progress).await
        }
    };

    summary.print(&provider.dataset().name, args.options.dry_run);
    Ok(summary)
}
