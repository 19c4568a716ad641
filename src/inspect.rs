//! Keyword definition inspection.
//!
//! Builds the keyword definitions of a new dataset from sample data:
//!
//! - **FITS**: the headers of many files are read and every value and
//!   comment seen for a keyword is counted. Types are inferred from the
//!   values, units and descriptions from the comments (`[unit] text`).
//! - **TAP**: the FIELD metadata of a table gives names, units and
//!   descriptions, the VOTable datatype gives the type.
//!
//! When the samples disagree a [`Resolver`] picks the answer, either by
//! asking on the terminal or by taking the most common option.

use std::collections::HashSet;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::convert::parse_date_time;
use crate::fits::{self, FitsHeader, HduSelector, UrlHeaderOptions};
use crate::models::{KeywordDefinition, KeywordType, RawValue};
use crate::tap::TapClient;
use crate::votable::{TapRecord, VoField};

/// Keywords never worth a definition.
pub const DEFAULT_EXCLUDE_KEYWORDS: [&str; 6] =
    ["DATASUM", "CHECKSUM", "SIMPLE", "BITPIX", "COMMENT", "HISTORY"];

/// Default output file of `svo inspect fits`.
pub const DEFAULT_FITS_OUTPUT: &str = "keywords_definitions.json";

/// Answer to an ambiguity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Index into the offered choices.
    Choice(usize),
    /// Free text typed by the user.
    Manual(String),
}

/// Picks one option when the samples are ambiguous.
pub trait Resolver {
    /// `choices` is never empty. With `manual`, free text is accepted too.
    fn resolve(&mut self, title: &str, choices: &[String], manual: bool) -> Result<Resolution>;
}

/// Always takes the first (most common) option.
pub struct FirstChoiceResolver;

impl Resolver for FirstChoiceResolver {
    fn resolve(&mut self, title: &str, choices: &[String], _manual: bool) -> Result<Resolution> {
        debug!("{}: selecting {}", title, choices[0]);
        Ok(Resolution::Choice(0))
    }
}

/// Asks on a terminal. Enter selects the first option; end of input too.
pub struct InteractiveResolver<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> InteractiveResolver<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

impl<R: BufRead, W: Write> Resolver for InteractiveResolver<R, W> {
    fn resolve(&mut self, title: &str, choices: &[String], manual: bool) -> Result<Resolution> {
        writeln!(self.output, "{}", title)?;
        for (i, choice) in choices.iter().enumerate() {
            writeln!(self.output, "[{}] {}", i, choice)?;
        }
        if manual {
            writeln!(self.output, "[M] manual input")?;
        }

        loop {
            write!(
                self.output,
                "Please enter one of the options between [] or enter for first one: "
            )?;
            self.output.flush()?;
            let selection = match self.read_line()? {
                None => return Ok(Resolution::Choice(0)),
                Some(s) if s.is_empty() => return Ok(Resolution::Choice(0)),
                Some(s) => s,
            };
            if let Ok(i) = selection.parse::<usize>() {
                if i < choices.len() {
                    return Ok(Resolution::Choice(i));
                }
            } else if manual && selection == "M" {
                write!(self.output, "Please enter the value: ")?;
                self.output.flush()?;
                return Ok(Resolution::Manual(self.read_line()?.unwrap_or_default()));
            }
            writeln!(self.output, "Invalid selection {}", selection)?;
        }
    }
}

/// Canonical keyword name: lower case, unusual characters replaced by
/// underscores, no repeated or surrounding underscores.
pub fn keyword_name(raw: &str) -> String {
    let replaced: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    let mut name = String::with_capacity(replaced.len());
    for c in replaced.chars() {
        if c == '_' && name.ends_with('_') {
            continue;
        }
        name.push(c);
    }
    name.trim_matches('_').to_string()
}

/// Type a raw header value suggests. Text that parses as a date is a time.
pub fn infer_type(value: &RawValue) -> KeywordType {
    match value {
        RawValue::Boolean(_) => KeywordType::Boolean,
        RawValue::Integer(_) => KeywordType::Integer,
        RawValue::Real(_) => KeywordType::Real,
        RawValue::Text(text) => {
            if parse_date_time(text).is_ok() {
                debug!("Value \"{}\" parses as a date, assume it is a time keyword", text);
                KeywordType::Time
            } else {
                KeywordType::Text
            }
        }
        RawValue::Null => {
            warn!("Could not infer the type for an undefined value, assume it is a text keyword");
            KeywordType::Text
        }
    }
}

fn unit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*\[\s*(?P<unit>[^\]]+)\s*\](?P<comment>.*)\s*$")
            .unwrap_or_else(|e| panic!("invalid unit pattern: {}", e))
    })
}

/// Split a card comment into its `[unit]` prefix and the description.
pub fn unit_and_description(comment: &str) -> (Option<String>, String) {
    match unit_pattern().captures(comment) {
        Some(captures) => (
            Some(captures["unit"].trim().to_string()),
            captures["comment"].trim().to_string(),
        ),
        None => (None, comment.trim().to_string()),
    }
}

/// Counted values and comments of every keyword seen so far. Serialized to
/// the backup file so an interrupted inspection can resume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InspectionState {
    pub processed: Vec<String>,
    pub values: IndexMap<String, Vec<(RawValue, u64)>>,
    pub comments: IndexMap<String, IndexMap<String, u64>>,
}

/// One option of an ambiguity, with how often it was seen and examples.
struct Candidate<T> {
    value: T,
    count: u64,
    examples: Vec<(String, u64)>,
}

impl<T> Candidate<T> {
    fn describe(&self, label: &str) -> String {
        let examples: Vec<String> = self
            .examples
            .iter()
            .take(3)
            .map(|(example, count)| format!("{:?} ({})", example, count))
            .collect();
        format!(
            "{} ({} occurences) e.g. [{}]",
            label,
            self.count,
            examples.join(", ")
        )
    }
}

fn sorted<T>(mut candidates: Vec<Candidate<T>>) -> Vec<Candidate<T>> {
    for candidate in &mut candidates {
        candidate.examples.sort_by(|a, b| b.1.cmp(&a.1));
    }
    candidates.sort_by(|a, b| b.count.cmp(&a.count));
    candidates
}

/// Inspects the headers of FITS files.
pub struct FitsInspector {
    hdu: HduSelector,
    exclude: HashSet<String>,
    backup: Option<PathBuf>,
    force_interactive: bool,
    state: InspectionState,
}

impl FitsInspector {
    pub fn new(
        hdu: HduSelector,
        exclude: &[String],
        backup: Option<PathBuf>,
        force_interactive: bool,
    ) -> Self {
        let exclude = DEFAULT_EXCLUDE_KEYWORDS
            .iter()
            .map(|k| k.to_string())
            .chain(exclude.iter().map(|k| k.trim().to_uppercase()))
            .collect();
        Self {
            hdu,
            exclude,
            backup,
            force_interactive,
            state: InspectionState::default(),
        }
    }

    pub fn state(&self) -> &InspectionState {
        &self.state
    }

    /// Load the backup file, if one is configured and exists.
    pub fn restore_backup(&mut self) -> Result<()> {
        let Some(path) = &self.backup else {
            return Ok(());
        };
        if !path.is_file() {
            return Ok(());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Could not open backup file {} for reading", path.display()))?;
        self.state = serde_json::from_str(&text)
            .with_context(|| format!("Could not restore state from backup file {}", path.display()))?;
        info!(
            "Restored {} processed files from {}",
            self.state.processed.len(),
            path.display()
        );
        Ok(())
    }

    pub fn save_backup(&self) -> Result<()> {
        let Some(path) = &self.backup else {
            return Ok(());
        };
        debug!("Saving state to backup file {}", path.display());
        let text = serde_json::to_string(&self.state)?;
        std::fs::write(path, text)
            .with_context(|| format!("Could not open backup file {} for writing", path.display()))
    }

    /// Inspect local files or URLs. Unreadable inputs are logged and skipped;
    /// backup failures are fatal.
    pub async fn process(&mut self, inputs: &[String], http: &reqwest::Client) -> Result<()> {
        self.restore_backup()?;

        for input in inputs {
            if self.state.processed.contains(input) {
                info!("File {} was already processed. Skipping!", input);
                continue;
            }
            info!("Processing file {}", input);
            let header = if input.starts_with("http://") || input.starts_with("https://") {
                fits::fetch_header(http, input, &UrlHeaderOptions::default()).await
            } else {
                fits::read_header(Path::new(input), &self.hdu)
            };
            match header {
                Ok(header) => {
                    self.inspect_header(&header);
                    self.state.processed.push(input.clone());
                    self.save_backup()?;
                }
                Err(e) => error!("Could not read header of {}: {}. Skipping!", input, e),
            }
        }
        Ok(())
    }

    /// Count the values and comments of one header.
    pub fn inspect_header(&mut self, header: &FitsHeader) {
        for card in header.cards() {
            if card.keyword.is_empty() {
                continue;
            }
            if self.exclude.contains(&card.keyword.to_uppercase()) {
                debug!("Keyword {} in exclude list. Skipping!", card.keyword);
                continue;
            }

            let values = self.state.values.entry(card.keyword.clone()).or_default();
            match values.iter_mut().find(|(value, _)| *value == card.value) {
                Some((_, count)) => *count += 1,
                None => values.push((card.value.clone(), 1)),
            }

            let comment = card.comment.clone().unwrap_or_default();
            *self
                .state
                .comments
                .entry(card.keyword.clone())
                .or_default()
                .entry(comment)
                .or_insert(0) += 1;
        }
    }

    /// Keyword definitions for every keyword seen, in order of appearance.
    pub fn keyword_definitions(&self, resolver: &mut dyn Resolver) -> Result<Vec<KeywordDefinition>> {
        let mut definitions = Vec::with_capacity(self.state.values.len());
        for keyword in self.state.values.keys() {
            let keyword_type = self.resolve_type(keyword, resolver)?;
            let (unit, description) = self.resolve_unit_description(keyword, resolver)?;
            definitions.push(KeywordDefinition {
                name: keyword_name(keyword),
                verbose_name: keyword.clone(),
                keyword_type,
                unit,
                description,
            });
        }
        Ok(definitions)
    }

    fn resolve_type(&self, keyword: &str, resolver: &mut dyn Resolver) -> Result<KeywordType> {
        let mut by_type: IndexMap<KeywordType, Candidate<KeywordType>> = IndexMap::new();
        for (value, count) in self.state.values.get(keyword).into_iter().flatten() {
            let keyword_type = infer_type(value);
            let candidate = by_type.entry(keyword_type).or_insert_with(|| Candidate {
                value: keyword_type,
                count: 0,
                examples: Vec::new(),
            });
            candidate.count += count;
            candidate.examples.push((value.to_string(), *count));
        }

        if by_type.len() == 1 && !self.force_interactive {
            if let Some((keyword_type, _)) = by_type.pop() {
                return Ok(keyword_type);
            }
        }

        for keyword_type in KeywordType::ALL {
            by_type.entry(keyword_type).or_insert_with(|| Candidate {
                value: keyword_type,
                count: 0,
                examples: Vec::new(),
            });
        }
        let options = sorted(by_type.into_values().collect());
        let labels: Vec<String> = options
            .iter()
            .map(|c| c.describe(c.value.as_str()))
            .collect();
        let title = format!("Multiple type found for keyword {}", keyword);
        match resolver.resolve(&title, &labels, false)? {
            Resolution::Choice(i) => Ok(options.get(i).map(|c| c.value).unwrap_or(KeywordType::Text)),
            Resolution::Manual(text) => text.parse().map_err(anyhow::Error::msg),
        }
    }

    fn resolve_unit_description(
        &self,
        keyword: &str,
        resolver: &mut dyn Resolver,
    ) -> Result<(Option<String>, Option<String>)> {
        let mut units: IndexMap<Option<String>, Candidate<Option<String>>> = IndexMap::new();
        let mut descriptions: IndexMap<String, Candidate<String>> = IndexMap::new();
        for (comment, count) in self.state.comments.get(keyword).into_iter().flatten() {
            let (unit, description) = unit_and_description(comment);
            let candidate = units.entry(unit.clone()).or_insert_with(|| Candidate {
                value: unit,
                count: 0,
                examples: Vec::new(),
            });
            candidate.count += count;
            candidate.examples.push((comment.clone(), *count));

            let candidate = descriptions
                .entry(description.clone())
                .or_insert_with(|| Candidate {
                    value: description,
                    count: 0,
                    examples: Vec::new(),
                });
            candidate.count += count;
            candidate.examples.push((comment.clone(), *count));
        }

        let unit = if units.len() > 1 || self.force_interactive {
            units.entry(None).or_insert_with(|| Candidate {
                value: None,
                count: 0,
                examples: Vec::new(),
            });
            let options = sorted(units.into_values().collect());
            let labels: Vec<String> = options
                .iter()
                .map(|c| c.describe(c.value.as_deref().unwrap_or("None")))
                .collect();
            let title = format!("Multiple unit found for keyword {}", keyword);
            match resolver.resolve(&title, &labels, true)? {
                Resolution::Choice(i) => options.into_iter().nth(i).and_then(|c| c.value),
                Resolution::Manual(text) => Some(text),
            }
        } else {
            units.pop().and_then(|(unit, _)| unit)
        };

        let description = if descriptions.len() > 1 || self.force_interactive {
            let options = sorted(descriptions.into_values().collect());
            let labels: Vec<String> = options.iter().map(|c| c.describe(&c.value)).collect();
            let title = format!("Multiple description found for keyword {}", keyword);
            if labels.is_empty() {
                None
            } else {
                match resolver.resolve(&title, &labels, true)? {
                    Resolution::Choice(i) => options.into_iter().nth(i).map(|c| c.value),
                    Resolution::Manual(text) => Some(text),
                }
            }
        } else {
            descriptions.pop().map(|(description, _)| description)
        };

        Ok((
            unit.filter(|u| !u.trim().is_empty()),
            description.filter(|d| !d.trim().is_empty()),
        ))
    }
}

/// Keyword type of a VOTable datatype. Complex types have none.
pub fn datatype_keyword_type(datatype: &str) -> Option<KeywordType> {
    match datatype {
        "boolean" => Some(KeywordType::Boolean),
        "bit" | "unsignedByte" | "short" | "int" | "long" => Some(KeywordType::Integer),
        "char" | "unicodeChar" => Some(KeywordType::Text),
        "float" | "double" => Some(KeywordType::Real),
        _ => None,
    }
}

/// Default output file of `svo inspect tap`.
pub fn default_tap_output(table: &str) -> PathBuf {
    PathBuf::from(format!("{}_keywords_definition.json", table))
}

fn choose_type(
    resolver: &mut dyn Resolver,
    title: &str,
    choices: &[KeywordType],
) -> Result<KeywordType> {
    let labels: Vec<String> = choices.iter().map(|t| t.as_str().to_string()).collect();
    match resolver.resolve(title, &labels, false)? {
        Resolution::Choice(i) => Ok(choices.get(i).copied().unwrap_or(choices[0])),
        Resolution::Manual(text) => text.parse().map_err(anyhow::Error::msg),
    }
}

/// Keyword type of a TAP column, asking when the datatype is not
/// supported, the UCD mentions time, or the column is an array.
fn tap_column_type(
    field: &VoField,
    sample: Option<&RawValue>,
    resolver: &mut dyn Resolver,
) -> Result<KeywordType> {
    let context = format!(
        "Unit: {}\nSample value: {}",
        field.unit.as_deref().unwrap_or("None"),
        sample.map(|v| v.to_string()).unwrap_or_else(|| "None".into())
    );
    let mut keyword_type = match datatype_keyword_type(&field.datatype) {
        Some(t) => t,
        None => choose_type(
            resolver,
            &format!(
                "Column \"{}\" datatype \"{}\" is not supported, select appropriate SVO keyword type\n{}",
                field.name, field.datatype, context
            ),
            &KeywordType::ALL,
        )?,
    };

    let ucd = field.ucd.as_deref().unwrap_or_default();
    if keyword_type != KeywordType::Time && ucd.contains("time") {
        keyword_type = choose_type(
            resolver,
            &format!(
                "Column \"{}\" has ucd \"{}\", select appropriate SVO keyword type\n{}",
                field.name, ucd, context
            ),
            &[KeywordType::Time, keyword_type],
        )?;
    }

    let arraysize = field.arraysize.as_deref().unwrap_or("1");
    let multi_dimensional = arraysize.contains('x');
    let plain_array =
        arraysize != "1" && !matches!(keyword_type, KeywordType::Text | KeywordType::Time);
    if multi_dimensional || plain_array {
        keyword_type = choose_type(
            resolver,
            &format!(
                "Column \"{}\" datatype \"{}\" with arraysize {} is not supported, select appropriate SVO keyword type\n{}",
                field.name, field.datatype, arraysize, context
            ),
            &KeywordType::ALL,
        )?;
    }
    Ok(keyword_type)
}

/// Keyword definitions for the columns of a TAP table.
pub fn tap_keyword_definitions(
    fields: &[VoField],
    sample: Option<&TapRecord>,
    exclude: &[String],
    resolver: &mut dyn Resolver,
) -> Result<Vec<KeywordDefinition>> {
    let mut definitions = Vec::with_capacity(fields.len());
    for field in fields {
        if exclude.iter().any(|e| e == &field.name) {
            info!("Skipping excluded column \"{}\"", field.name);
            continue;
        }
        let keyword_type = tap_column_type(field, sample.and_then(|r| r.get(&field.name)), resolver)?;
        definitions.push(KeywordDefinition {
            name: keyword_name(&field.name),
            verbose_name: field.name.clone(),
            keyword_type,
            unit: field.unit.clone(),
            description: field.description.clone(),
        });
    }
    Ok(definitions)
}

/// Pick the table to inspect among those the service publishes.
pub async fn select_table(client: &TapClient, resolver: &mut dyn Resolver) -> Result<String> {
    let tables = client.list_tables().await.context("Could not list TAP tables")?;
    if tables.is_empty() {
        anyhow::bail!("The TAP service does not publish any table");
    }
    let names: Vec<String> = tables.iter().map(|(name, _)| name.clone()).collect();
    let index = match resolver.resolve("Select the table to inspect", &names, false)? {
        Resolution::Choice(i) if i < names.len() => i,
        _ => 0,
    };
    let (name, description) = &tables[index];
    info!(
        "Table description:\n{}\n",
        description.as_deref().unwrap_or("(none)")
    );
    Ok(name.clone())
}

/// Inspect one table of a TAP service.
pub async fn inspect_tap(
    client: &TapClient,
    table: &str,
    exclude: &[String],
    resolver: &mut dyn Resolver,
) -> Result<Vec<KeywordDefinition>> {
    let (votable, sample) = client
        .sample(table)
        .await
        .with_context(|| format!("TAP query on table {} failed", table))?;
    if sample.is_none() {
        warn!("Table {} is empty, no sample values available", table);
    }
    tap_keyword_definitions(&votable.fields, sample.as_ref(), exclude, resolver)
}

/// Write definitions as tab-indented JSON.
pub fn write_definitions(path: &Path, definitions: &[KeywordDefinition]) -> Result<()> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    definitions.serialize(&mut serializer)?;
    std::fs::write(path, out)
        .with_context(|| format!("Could not open file {} for writing", path.display()))?;
    info!("Wrote keywords description file {}", path.display());
    Ok(())
}
