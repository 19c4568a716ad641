//! Metadata field extraction.
//!
//! A [`MetadataExtractor`] turns one raw source (a FITS header or a TAP
//! record) into [`ResourceData`]. Each field is resolved in a fixed order:
//!
//! 1. an override registered for the field in [`FieldRules`] is invoked;
//! 2. otherwise the field's [`KeywordDefinition`](crate::models::KeywordDefinition)
//!    gives the raw name to read from the source;
//! 3. the raw value is converted to the declared type.
//!
//! Overrides may resolve other fields, so derived fields (`date_end` from
//! `date_beg` and an exposure time) compose naturally. Results are memoized
//! per field for the lifetime of one extractor, which covers exactly one
//! resource build.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::convert::{compact_timestamp, convert, ConversionError};
use crate::fits::FitsHeader;
use crate::models::{FieldValue, KeywordSet, KeywordType, RawValue, ResourceData};
use crate::votable::TapRecord;

/// Fields every metadata resource carries. A failure on any of them aborts
/// the extraction.
pub const REQUIRED_FIELDS: [&str; 6] = [
    "oid",
    "fits_header",
    "date_beg",
    "date_end",
    "wavemin",
    "wavemax",
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldError {
    #[error("keyword definition missing for field {field}")]
    DefinitionMissing { field: String },
    #[error("keyword {verbose_name} missing from {source_kind} (field {field})")]
    SourceValueMissing {
        field: String,
        verbose_name: String,
        source_kind: &'static str,
    },
    #[error("field {field}: {source}")]
    Conversion {
        field: String,
        #[source]
        source: ConversionError,
    },
    #[error("circular field dependency: {}", .chain.join(" -> "))]
    CircularDependency { chain: Vec<String> },
    #[error("field {field}: {reason}")]
    Rule { field: String, reason: String },
}

impl FieldError {
    pub fn rule(field: &str, reason: impl Into<String>) -> Self {
        FieldError::Rule {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Adapter over the raw metadata of one input item.
pub trait RawSource {
    /// Raw value stored under `verbose_name`, if present.
    fn raw_value(&self, verbose_name: &str) -> Option<&RawValue>;

    /// Serialized header text, for sources that have one.
    fn header_text(&self) -> Option<String>;

    /// Name used in diagnostics.
    fn kind(&self) -> &'static str;
}

impl RawSource for FitsHeader {
    fn raw_value(&self, verbose_name: &str) -> Option<&RawValue> {
        self.get(verbose_name)
    }

    fn header_text(&self) -> Option<String> {
        Some(self.to_header_string())
    }

    fn kind(&self) -> &'static str {
        "FITS header"
    }
}

impl RawSource for TapRecord {
    fn raw_value(&self, verbose_name: &str) -> Option<&RawValue> {
        self.get(verbose_name)
    }

    fn header_text(&self) -> Option<String> {
        None
    }

    fn kind(&self) -> &'static str {
        "TAP record"
    }
}

/// A computed field value. Receives the extractor so it can resolve other
/// fields or read raw keywords.
pub type FieldOverride =
    Arc<dyn Fn(&MetadataExtractor<'_>) -> Result<FieldValue, FieldError> + Send + Sync>;

/// Wrap a closure as a [`FieldOverride`].
pub fn field_override<F>(f: F) -> FieldOverride
where
    F: Fn(&MetadataExtractor<'_>) -> Result<FieldValue, FieldError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Registry of per-field overrides for one dataset.
#[derive(Clone, Default)]
pub struct FieldRules {
    overrides: HashMap<String, FieldOverride>,
}

impl std::fmt::Debug for FieldRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.overrides.keys().collect();
        names.sort();
        f.debug_struct("FieldRules").field("overrides", &names).finish()
    }
}

impl FieldRules {
    /// An empty registry: every field goes through keyword lookup.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry every dataset starts from: `oid` derived from
    /// `date_beg`, and `fits_header` from the source header text.
    pub fn with_defaults() -> Self {
        let mut rules = Self::new();
        rules.insert("oid", field_override(default_oid));
        rules.insert("fits_header", field_override(default_fits_header));
        rules
    }

    pub fn insert(&mut self, field: impl Into<String>, rule: FieldOverride) {
        self.overrides.insert(field.into(), rule);
    }

    pub fn get(&self, field: &str) -> Option<&FieldOverride> {
        self.overrides.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.overrides.contains_key(field)
    }
}

fn default_oid(extractor: &MetadataExtractor<'_>) -> Result<FieldValue, FieldError> {
    if let Some(oid) = extractor.explicit_oid() {
        return Ok(FieldValue::Text(oid.to_string()));
    }
    match extractor.resolve_field("date_beg")? {
        FieldValue::Time(t) => Ok(FieldValue::Text(compact_timestamp(&t))),
        other => Err(FieldError::rule(
            "oid",
            format!("date_beg is not a time value: {}", other),
        )),
    }
}

fn default_fits_header(extractor: &MetadataExtractor<'_>) -> Result<FieldValue, FieldError> {
    Ok(extractor
        .header_text()
        .map(FieldValue::Text)
        .unwrap_or(FieldValue::Null))
}

/// Resolves the fields of one metadata resource from one raw source.
pub struct MetadataExtractor<'a> {
    source: &'a dyn RawSource,
    keywords: &'a KeywordSet,
    rules: &'a FieldRules,
    explicit_oid: Option<String>,
    strict: bool,
    cache: RefCell<HashMap<String, FieldValue>>,
    resolving: RefCell<Vec<String>>,
}

impl<'a> MetadataExtractor<'a> {
    pub fn new(source: &'a dyn RawSource, keywords: &'a KeywordSet, rules: &'a FieldRules) -> Self {
        Self {
            source,
            keywords,
            rules,
            explicit_oid: None,
            strict: false,
            cache: RefCell::new(HashMap::new()),
            resolving: RefCell::new(Vec::new()),
        }
    }

    /// Use this observation id instead of deriving one.
    pub fn with_explicit_oid(mut self, oid: Option<String>) -> Self {
        self.explicit_oid = oid.filter(|o| !o.is_empty());
        self
    }

    /// Make failures on optional fields fatal.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn explicit_oid(&self) -> Option<&str> {
        self.explicit_oid.as_deref()
    }

    pub fn header_text(&self) -> Option<String> {
        self.source.header_text()
    }

    /// Raw value from the source, bypassing keyword definitions.
    pub fn raw_value(&self, verbose_name: &str) -> Option<&'a RawValue> {
        self.source.raw_value(verbose_name)
    }

    pub fn source_kind(&self) -> &'static str {
        self.source.kind()
    }

    /// Resolve a field: override first, keyword lookup otherwise.
    pub fn resolve_field(&self, field: &str) -> Result<FieldValue, FieldError> {
        if let Some(value) = self.cache.borrow().get(field) {
            return Ok(value.clone());
        }

        {
            let mut resolving = self.resolving.borrow_mut();
            if resolving.iter().any(|f| f == field) {
                let mut chain = resolving.clone();
                chain.push(field.to_string());
                return Err(FieldError::CircularDependency { chain });
            }
            resolving.push(field.to_string());
        }

        let result = match self.rules.get(field) {
            Some(rule) => rule(self),
            None => self.keyword_value(field),
        };

        self.resolving.borrow_mut().pop();

        let value = result?;
        self.cache
            .borrow_mut()
            .insert(field.to_string(), value.clone());
        Ok(value)
    }

    /// Resolve a field through its keyword definition only.
    pub fn keyword_value(&self, field: &str) -> Result<FieldValue, FieldError> {
        let definition = self
            .keywords
            .get(field)
            .ok_or_else(|| FieldError::DefinitionMissing {
                field: field.to_string(),
            })?;
        let raw = self
            .source
            .raw_value(&definition.verbose_name)
            .ok_or_else(|| FieldError::SourceValueMissing {
                field: field.to_string(),
                verbose_name: definition.verbose_name.clone(),
                source_kind: self.source.kind(),
            })?;
        self.convert_raw(field, raw, definition.keyword_type)
    }

    /// Convert a raw value, attributing failures to `field`.
    pub fn convert_raw(
        &self,
        field: &str,
        raw: &RawValue,
        keyword_type: KeywordType,
    ) -> Result<FieldValue, FieldError> {
        convert(raw, keyword_type).map_err(|source| FieldError::Conversion {
            field: field.to_string(),
            source,
        })
    }

    /// Build the metadata resource: required fields first, then every
    /// dataset keyword.
    ///
    /// A failed required field aborts. A failed optional field is logged
    /// and omitted, unless the extractor is strict.
    pub fn resource_data(&self) -> Result<ResourceData, FieldError> {
        let mut data = ResourceData::new();
        for field in REQUIRED_FIELDS {
            let value = self.resolve_field(field)?;
            data.insert(field.to_string(), value);
        }

        for field in self.keywords.names() {
            if data.contains_key(field) {
                continue;
            }
            match self.resolve_field(field) {
                Ok(value) => {
                    debug!("Field {} has value \"{}\"", field, value);
                    data.insert(field.to_string(), value);
                }
                Err(e) if self.strict => return Err(e),
                Err(e) => warn!("Could not extract value for field {}: {}", field, e),
            }
        }
        Ok(data)
    }
}
