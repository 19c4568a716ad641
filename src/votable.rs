//! VOTable decoding for TAP query results.
//!
//! Only the TABLEDATA serialization is supported. Cells are decoded into
//! [`RawValue`]s according to the declared FIELD datatype.

use indexmap::IndexMap;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use crate::models::RawValue;

#[derive(Debug, Error)]
pub enum VoTableError {
    #[error("XML error: {0}")]
    Xml(String),
    #[error("query failed: {0}")]
    QueryStatus(String),
    #[error("unsupported VOTable serialization: {0}")]
    UnsupportedSerialization(String),
}

/// Column metadata from a FIELD element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoField {
    pub name: String,
    pub datatype: String,
    pub arraysize: Option<String>,
    pub unit: Option<String>,
    pub ucd: Option<String>,
    pub xtype: Option<String>,
    pub description: Option<String>,
    /// Cell text that represents a missing value.
    pub null: Option<String>,
}

impl VoField {
    /// True when each cell holds more than one element. Character columns
    /// are strings whatever their size.
    pub fn is_array(&self) -> bool {
        match self.arraysize.as_deref() {
            None | Some("1") => false,
            Some(_) => !self.is_character(),
        }
    }

    pub fn is_character(&self) -> bool {
        matches!(self.datatype.as_str(), "char" | "unicodeChar")
    }

    /// Decode one TABLEDATA cell.
    pub fn decode(&self, text: &str) -> RawValue {
        if self.null.as_deref() == Some(text) {
            return RawValue::Null;
        }
        if self.is_character() || self.is_array() {
            return if text.is_empty() {
                RawValue::Null
            } else {
                RawValue::Text(text.to_string())
            };
        }
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return RawValue::Null;
        }
        match self.datatype.as_str() {
            "boolean" => match trimmed {
                "T" | "t" | "1" | "true" | "TRUE" | "True" => RawValue::Boolean(true),
                "F" | "f" | "0" | "false" | "FALSE" | "False" => RawValue::Boolean(false),
                _ => RawValue::Null,
            },
            "bit" | "unsignedByte" | "short" | "int" | "long" => trimmed
                .parse::<i64>()
                .map(RawValue::Integer)
                .unwrap_or_else(|_| RawValue::Text(trimmed.to_string())),
            "float" | "double" => trimmed
                .parse::<f64>()
                .map(RawValue::Real)
                .unwrap_or_else(|_| RawValue::Text(trimmed.to_string())),
            _ => RawValue::Text(text.to_string()),
        }
    }
}

/// One row of a TAP result, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TapRecord {
    values: IndexMap<String, RawValue>,
}

impl TapRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K: Into<String>>(pairs: impl IntoIterator<Item = (K, RawValue)>) -> Self {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn insert(&mut self, column: impl Into<String>, value: RawValue) {
        self.values.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&RawValue> {
        self.values.get(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RawValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Short identifier for log messages.
    pub fn label(&self) -> String {
        self.values
            .get("granule_uid")
            .or_else(|| self.values.values().next())
            .map(|v| v.to_string())
            .unwrap_or_default()
    }
}

/// A decoded VOTable: column metadata and rows.
#[derive(Debug, Clone, Default)]
pub struct VoTable {
    pub fields: Vec<VoField>,
    pub rows: Vec<TapRecord>,
}

fn attributes(e: &BytesStart<'_>) -> Result<IndexMap<String, String>, VoTableError> {
    let mut out = IndexMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| VoTableError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| VoTableError::Xml(e.to_string()))?
            .to_string();
        out.insert(key, value);
    }
    Ok(out)
}

fn field_from(attrs: &IndexMap<String, String>) -> VoField {
    VoField {
        name: attrs.get("name").cloned().unwrap_or_default(),
        datatype: attrs.get("datatype").cloned().unwrap_or_default(),
        arraysize: attrs.get("arraysize").cloned(),
        unit: attrs.get("unit").cloned(),
        ucd: attrs.get("ucd").cloned(),
        xtype: attrs.get("xtype").cloned(),
        description: None,
        null: None,
    }
}

/// Parse a VOTable document.
pub fn parse_votable(xml: &[u8]) -> Result<VoTable, VoTableError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);

    let mut table = VoTable::default();
    let mut buf = Vec::new();
    let mut text = String::new();
    let mut in_field = false;
    let mut error_info: Option<String> = None;
    let mut in_error_info = false;
    let mut row: Option<Vec<String>> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                text.clear();
                match e.local_name().as_ref() {
                    b"FIELD" => {
                        table.fields.push(field_from(&attributes(&e)?));
                        in_field = true;
                    }
                    b"VALUES" if in_field => set_null(&mut table, &attributes(&e)?),
                    b"INFO" => {
                        let attrs = attributes(&e)?;
                        if is_error_status(&attrs) {
                            in_error_info = true;
                            error_info = attrs.get("value").cloned();
                        }
                    }
                    b"TR" => row = Some(Vec::with_capacity(table.fields.len())),
                    name @ (b"BINARY" | b"BINARY2" | b"FITS") => {
                        return Err(VoTableError::UnsupportedSerialization(
                            String::from_utf8_lossy(name).to_string(),
                        ))
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"FIELD" => table.fields.push(field_from(&attributes(&e)?)),
                b"VALUES" if in_field => set_null(&mut table, &attributes(&e)?),
                b"TD" => {
                    if let Some(cells) = row.as_mut() {
                        cells.push(String::new());
                    }
                }
                b"INFO" => {
                    let attrs = attributes(&e)?;
                    if is_error_status(&attrs) {
                        return Err(VoTableError::QueryStatus(
                            attrs.get("value").cloned().unwrap_or_default(),
                        ));
                    }
                }
                _ => {}
            },
            Ok(Event::Text(te)) => {
                let unescaped = te.unescape().map_err(|e| VoTableError::Xml(e.to_string()))?;
                text.push_str(&unescaped);
            }
            Ok(Event::CData(cd)) => {
                text.push_str(&String::from_utf8_lossy(&cd.into_inner()));
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"FIELD" => in_field = false,
                    b"DESCRIPTION" if in_field => {
                        if let Some(field) = table.fields.last_mut() {
                            field.description = Some(text.trim().to_string());
                        }
                    }
                    b"TD" => {
                        if let Some(cells) = row.as_mut() {
                            cells.push(std::mem::take(&mut text));
                        }
                    }
                    b"TR" => {
                        if let Some(cells) = row.take() {
                            table.rows.push(decode_row(&table.fields, cells));
                        }
                    }
                    b"INFO" if in_error_info => {
                        let message = text.trim();
                        let message = if message.is_empty() {
                            error_info.take().unwrap_or_default()
                        } else {
                            message.to_string()
                        };
                        return Err(VoTableError::QueryStatus(message));
                    }
                    _ => {}
                }
                text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(VoTableError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(table)
}

fn is_error_status(attrs: &IndexMap<String, String>) -> bool {
    attrs.get("name").map(String::as_str) == Some("QUERY_STATUS")
        && attrs.get("value").map(String::as_str) == Some("ERROR")
}

fn set_null(table: &mut VoTable, attrs: &IndexMap<String, String>) {
    if let (Some(field), Some(null)) = (table.fields.last_mut(), attrs.get("null")) {
        field.null = Some(null.clone());
    }
}

fn decode_row(fields: &[VoField], cells: Vec<String>) -> TapRecord {
    let mut record = TapRecord::new();
    for (index, cell) in cells.into_iter().enumerate() {
        match fields.get(index) {
            Some(field) => record.insert(field.name.clone(), field.decode(&cell)),
            None => record.insert(format!("col{}", index), RawValue::Text(cell)),
        }
    }
    record
}
