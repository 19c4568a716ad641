//! Core data models used throughout the provider.
//!
//! These types represent the keyword definitions, raw source values, and
//! resource payloads that flow through the extraction and submission
//! pipeline.

use std::fmt;
use std::fmt::Write as _;
use std::path::PathBuf;

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::votable::TapRecord;

/// Serialization format for time values sent to the catalog.
pub const ISO_8601_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// The five value types a catalog keyword can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeywordType {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "integer")]
    Integer,
    #[serde(rename = "real")]
    Real,
    #[serde(rename = "time (ISO 8601)", alias = "time")]
    Time,
}

impl KeywordType {
    pub const ALL: [KeywordType; 5] = [
        KeywordType::Text,
        KeywordType::Boolean,
        KeywordType::Integer,
        KeywordType::Real,
        KeywordType::Time,
    ];

    /// The name the catalog uses for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeywordType::Text => "text",
            KeywordType::Boolean => "boolean",
            KeywordType::Integer => "integer",
            KeywordType::Real => "real",
            KeywordType::Time => "time (ISO 8601)",
        }
    }
}

impl fmt::Display for KeywordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KeywordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "text" => Ok(KeywordType::Text),
            "boolean" => Ok(KeywordType::Boolean),
            "integer" => Ok(KeywordType::Integer),
            "real" => Ok(KeywordType::Real),
            "time" | "time (ISO 8601)" => Ok(KeywordType::Time),
            other => Err(format!("unknown keyword type '{}'", other)),
        }
    }
}

/// Dataset-scoped schema entry mapping a canonical field name to its raw
/// name in the source.
///
/// Catalog responses carry more attributes (`resource_uri`, `dataset`, ...);
/// only the ones needed for extraction are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordDefinition {
    pub name: String,
    pub verbose_name: String,
    #[serde(rename = "type")]
    pub keyword_type: KeywordType,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// The keyword definitions of one dataset, keyed by canonical name.
///
/// Fetched once per batch and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct KeywordSet {
    definitions: IndexMap<String, KeywordDefinition>,
}

impl KeywordSet {
    pub fn new(definitions: Vec<KeywordDefinition>) -> Self {
        Self {
            definitions: definitions
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&KeywordDefinition> {
        self.definitions.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeywordDefinition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// A scalar as it appears in a FITS card or a VOTable cell, before any
/// keyword-driven conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Null => f.write_str("None"),
            RawValue::Boolean(true) => f.write_str("True"),
            RawValue::Boolean(false) => f.write_str("False"),
            RawValue::Integer(n) => write!(f, "{}", n),
            RawValue::Real(x) => write!(f, "{:?}", x),
            RawValue::Text(s) => f.write_str(s),
        }
    }
}

/// A canonical value of one of the five catalog types, or null.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Time(NaiveDateTime),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_time(&self) -> Option<NaiveDateTime> {
        match self {
            FieldValue::Time(t) => Some(*t),
            _ => None,
        }
    }

    /// Numeric view of integer and real values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(n) => Some(*n as f64),
            FieldValue::Real(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Render the value for templates. Times accept a strftime format.
    pub fn render(&self, format: Option<&str>) -> Result<String, String> {
        match (self, format) {
            (FieldValue::Time(t), Some(fmt)) => {
                let mut out = String::new();
                write!(out, "{}", t.format(fmt))
                    .map_err(|_| format!("invalid time format \"{}\"", fmt))?;
                Ok(out)
            }
            _ => Ok(self.to_string()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Boolean(b) => write!(f, "{}", b),
            FieldValue::Integer(n) => write!(f, "{}", n),
            FieldValue::Real(x) => write!(f, "{}", x),
            FieldValue::Time(t) => write!(f, "{}", t.format(ISO_8601_FORMAT)),
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Null => serializer.serialize_none(),
            FieldValue::Text(s) => serializer.serialize_str(s),
            FieldValue::Boolean(b) => serializer.serialize_bool(*b),
            FieldValue::Integer(n) => serializer.serialize_i64(*n),
            FieldValue::Real(x) if x.is_finite() => serializer.serialize_f64(*x),
            FieldValue::Real(_) => serializer.serialize_none(),
            FieldValue::Time(t) => {
                serializer.serialize_str(&t.format(ISO_8601_FORMAT).to_string())
            }
        }
    }
}

/// Field name to value mapping for a metadata resource, in extraction order.
pub type ResourceData = IndexMap<String, FieldValue>;

/// Where a data file lives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataLocation {
    pub file_url: String,
    pub file_size: u64,
    pub file_path: String,
    pub thumbnail_url: Option<String>,
    pub offline: bool,
}

/// The `data_location` member of a metadata payload: either a full new
/// record, or the resource URI of a record the catalog already has.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DataLocationPayload {
    New {
        dataset: String,
        #[serde(flatten)]
        location: DataLocation,
    },
    Existing(String),
}

impl DataLocationPayload {
    pub fn file_url(&self) -> Option<&str> {
        match self {
            DataLocationPayload::New { location, .. } => Some(&location.file_url),
            DataLocationPayload::Existing(_) => None,
        }
    }
}

/// A merged metadata + data location resource ready for submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    #[serde(flatten)]
    pub metadata: ResourceData,
    pub data_location: DataLocationPayload,
}

impl Resource {
    pub fn oid(&self) -> Option<&str> {
        self.metadata.get("oid").and_then(FieldValue::as_text)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// One unit of batch input.
#[derive(Debug, Clone)]
pub enum InputItem {
    LocalFile(PathBuf),
    Url(String),
    Record(TapRecord),
}

impl fmt::Display for InputItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputItem::LocalFile(path) => write!(f, "file \"{}\"", path.display()),
            InputItem::Url(url) => write!(f, "URL \"{}\"", url),
            InputItem::Record(record) => write!(f, "record \"{}\"", record.label()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn keyword_type_catalog_names() {
        let def: KeywordDefinition = serde_json::from_str(
            r#"{"name": "date_obs", "verbose_name": "DATE-OBS", "type": "time (ISO 8601)",
                "unit": null, "description": "Observation date", "resource_uri": "/x/1/"}"#,
        )
        .unwrap();
        assert_eq!(def.keyword_type, KeywordType::Time);
        assert_eq!(def.unit, None);
        assert_eq!("time".parse::<KeywordType>().unwrap(), KeywordType::Time);
        assert!("complex".parse::<KeywordType>().is_err());
    }

    #[test]
    fn field_value_serialization() {
        let t = NaiveDate::from_ymd_opt(2020, 5, 12)
            .unwrap()
            .and_hms_opt(1, 2, 3)
            .unwrap();
        assert_eq!(
            serde_json::to_value(FieldValue::Time(t)).unwrap(),
            serde_json::json!("2020-05-12T01:02:03")
        );
        assert_eq!(
            serde_json::to_value(FieldValue::Real(f64::NAN)).unwrap(),
            serde_json::Value::Null
        );
        assert_eq!(
            serde_json::to_value(FieldValue::Real(17.1)).unwrap(),
            serde_json::json!(17.1)
        );
    }

    #[test]
    fn time_rendering() {
        let t = NaiveDate::from_ymd_opt(2020, 5, 12)
            .unwrap()
            .and_hms_opt(1, 2, 3)
            .unwrap();
        let value = FieldValue::Time(t);
        assert_eq!(value.render(Some("%Y/%m/%d")).unwrap(), "2020/05/12");
        assert_eq!(value.render(None).unwrap(), "2020-05-12T01:02:03");
        assert!(value.render(Some("%Q")).is_err());
        assert_eq!(FieldValue::Integer(3).render(Some("%Q")).unwrap(), "3");
    }

    #[test]
    fn resource_flattens_metadata() {
        let mut metadata = ResourceData::new();
        metadata.insert("oid".into(), FieldValue::Text("20000101000000".into()));
        let resource = Resource {
            metadata,
            data_location: DataLocationPayload::Existing("/api/svo/data_location/1/".into()),
        };
        let json = resource.to_json();
        assert_eq!(json["oid"], "20000101000000");
        assert_eq!(json["data_location"], "/api/svo/data_location/1/");
        assert_eq!(resource.oid(), Some("20000101000000"));
    }

    #[test]
    fn new_data_location_payload_shape() {
        let payload = DataLocationPayload::New {
            dataset: "/api/svo/dataset/swap/".into(),
            location: DataLocation {
                file_url: "https://example.org/a.fits".into(),
                file_size: 10,
                file_path: "a.fits".into(),
                thumbnail_url: None,
                offline: false,
            },
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["dataset"], "/api/svo/dataset/swap/");
        assert_eq!(json["file_size"], 10);
        assert!(json["thumbnail_url"].is_null());
        assert_eq!(payload.file_url(), Some("https://example.org/a.fits"));
    }
}
