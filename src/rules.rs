//! Declarative per-dataset field rules.
//!
//! Datasets describe computed fields in configuration instead of code:
//!
//! ```toml
//! [datasets.swap.fields]
//! date_beg = { rule = "alias", field = "date_obs" }
//! date_end = { rule = "add_seconds", field = "date_beg", seconds = "exptime" }
//! wavemin = { rule = "divide", field = "wavelnth", by = 10 }
//! wavemax = 17.4
//! ```
//!
//! Each rule compiles to a [`FieldOverride`] registered in [`FieldRules`],
//! on top of the default `oid` and `fits_header` rules.

use chrono::format::{Item, StrftimeItems};
use chrono::Duration;
use indexmap::IndexMap;
use serde::Deserialize;
use tracing::info;

use crate::metadata::{field_override, FieldError, FieldOverride, FieldRules, MetadataExtractor};
use crate::models::{FieldValue, KeywordType, RawValue};

/// A literal field value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Literal {
    fn to_field_value(&self) -> FieldValue {
        match self {
            Literal::Boolean(b) => FieldValue::Boolean(*b),
            Literal::Integer(n) => FieldValue::Integer(*n),
            Literal::Real(x) => FieldValue::Real(*x),
            Literal::Text(s) => FieldValue::Text(s.clone()),
        }
    }
}

/// How to compute one field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum FieldRule {
    /// The value of another field.
    Alias { field: String },
    Constant { value: Literal },
    Divide { field: String, by: f64 },
    Multiply { field: String, by: f64 },
    /// A time field shifted by a number of seconds read from another field.
    AddSeconds { field: String, seconds: String },
    /// Numeric sum; null if any operand is null.
    Sum { fields: Vec<String> },
    /// One piece of a text field. Negative indexes count from the end.
    Split {
        field: String,
        separator: String,
        index: i64,
    },
    /// Text from a `{field}` / `{field:%strftime}` template.
    Format { template: String },
    /// A raw source keyword converted to a type, ignoring keyword
    /// definitions.
    Keyword {
        keyword: String,
        #[serde(rename = "type")]
        keyword_type: KeywordType,
        #[serde(default)]
        optional: bool,
    },
    /// The first whitespace-separated token of a raw keyword, as a real
    /// (`"0.111 s"`). Null when absent or not numeric.
    LeadingNumber { keyword: String },
}

/// A rule as written in configuration: a bare literal or a rule table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RuleSpec {
    Literal(Literal),
    Rule(FieldRule),
}

impl RuleSpec {
    pub fn rule(&self) -> FieldRule {
        match self {
            RuleSpec::Literal(value) => FieldRule::Constant {
                value: value.clone(),
            },
            RuleSpec::Rule(rule) => rule.clone(),
        }
    }
}

impl FieldRule {
    /// Check the rule can be compiled, without a source.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            FieldRule::Divide { by, .. } if *by == 0.0 => Err("division by zero".to_string()),
            FieldRule::Split { separator, .. } if separator.is_empty() => {
                Err("split separator must not be empty".to_string())
            }
            FieldRule::Sum { fields } if fields.is_empty() => {
                Err("sum needs at least one field".to_string())
            }
            FieldRule::Format { template } => validate_template(template),
            _ => Ok(()),
        }
    }

    /// Compile into an override for `field`.
    pub fn compile(&self, field: &str) -> FieldOverride {
        let name = field.to_string();
        let compiled: FieldOverride = match self.clone() {
            FieldRule::Alias { field: source } => field_override(move |ex| ex.resolve_field(&source)),
            FieldRule::Constant { value } => {
                let value = value.to_field_value();
                field_override(move |_| Ok(value.clone()))
            }
            FieldRule::Divide { field: source, by } => {
                field_override(move |ex| scale(ex, &name, &source, |x| x / by))
            }
            FieldRule::Multiply { field: source, by } => {
                field_override(move |ex| scale(ex, &name, &source, |x| x * by))
            }
            FieldRule::AddSeconds { field: source, seconds } => field_override(move |ex| {
                let start = ex.resolve_field(&source)?.as_time().ok_or_else(|| {
                    FieldError::rule(&name, format!("{} is not a time value", source))
                })?;
                let offset = ex.resolve_field(&seconds)?.as_f64().ok_or_else(|| {
                    FieldError::rule(&name, format!("{} is not a number", seconds))
                })?;
                if !offset.is_finite() {
                    return Err(FieldError::rule(&name, format!("{} is not finite", seconds)));
                }
                let micros = (offset * 1_000_000.0).round() as i64;
                start
                    .checked_add_signed(Duration::microseconds(micros))
                    .map(FieldValue::Time)
                    .ok_or_else(|| {
                        FieldError::rule(&name, format!("{} + {} s is out of range", source, offset))
                    })
            }),
            FieldRule::Sum { fields } => field_override(move |ex| {
                let mut total = 0.0;
                for source in &fields {
                    let value = ex.resolve_field(source)?;
                    if value.is_null() {
                        return Ok(FieldValue::Null);
                    }
                    total += value.as_f64().ok_or_else(|| {
                        FieldError::rule(&name, format!("{} is not a number", source))
                    })?;
                }
                Ok(FieldValue::Real(total))
            }),
            FieldRule::Split {
                field: source,
                separator,
                index,
            } => field_override(move |ex| {
                let value = ex.resolve_field(&source)?;
                if value.is_null() {
                    return Err(FieldError::rule(&name, format!("{} is null", source)));
                }
                let text = value.to_string();
                let pieces: Vec<&str> = text.split(separator.as_str()).collect();
                let position = if index < 0 {
                    pieces.len() as i64 + index
                } else {
                    index
                };
                usize::try_from(position)
                    .ok()
                    .and_then(|p| pieces.get(p))
                    .map(|piece| FieldValue::Text(piece.to_string()))
                    .ok_or_else(|| {
                        FieldError::rule(
                            &name,
                            format!("\"{}\" has no piece {} when split on \"{}\"", text, index, separator),
                        )
                    })
            }),
            FieldRule::Format { template } => field_override(move |ex| {
                let rendered = render_template(&template, |placeholder, format| {
                    ex.resolve_field(placeholder)
                        .map_err(|e| e.to_string())?
                        .render(format)
                })
                .map_err(|reason| FieldError::rule(&name, reason))?;
                Ok(FieldValue::Text(rendered))
            }),
            FieldRule::Keyword {
                keyword,
                keyword_type,
                optional,
            } => field_override(move |ex| match ex.raw_value(&keyword) {
                Some(raw) => ex.convert_raw(&name, raw, keyword_type),
                None if optional => Ok(FieldValue::Null),
                None => Err(FieldError::SourceValueMissing {
                    field: name.clone(),
                    verbose_name: keyword.clone(),
                    source_kind: ex.source_kind(),
                }),
            }),
            FieldRule::LeadingNumber { keyword } => field_override(move |ex| {
                Ok(match ex.raw_value(&keyword) {
                    Some(RawValue::Integer(n)) => FieldValue::Real(*n as f64),
                    Some(RawValue::Real(x)) => FieldValue::Real(*x),
                    Some(RawValue::Text(text)) => match text
                        .split_whitespace()
                        .next()
                        .and_then(|token| token.parse::<f64>().ok())
                    {
                        Some(x) => FieldValue::Real(x),
                        None => {
                            info!("Value of keyword {} is not a number", keyword);
                            FieldValue::Null
                        }
                    },
                    _ => {
                        info!("Keyword {} missing from {}", keyword, ex.source_kind());
                        FieldValue::Null
                    }
                })
            }),
        };
        compiled
    }
}

fn scale(
    ex: &MetadataExtractor<'_>,
    name: &str,
    source: &str,
    op: impl Fn(f64) -> f64,
) -> Result<FieldValue, FieldError> {
    let value = ex.resolve_field(source)?;
    if value.is_null() {
        return Ok(FieldValue::Null);
    }
    let x = value
        .as_f64()
        .ok_or_else(|| FieldError::rule(name, format!("{} is not a number", source)))?;
    Ok(FieldValue::Real(op(x)))
}

/// Compile configured rules on top of the defaults.
///
/// A configured `oid` rule still yields to an explicit oid.
pub fn compile_rules(specs: &IndexMap<String, RuleSpec>) -> Result<FieldRules, String> {
    let mut rules = FieldRules::with_defaults();
    for (field, spec) in specs {
        let rule = spec.rule();
        rule.validate()
            .map_err(|reason| format!("rule for field {}: {}", field, reason))?;
        let compiled = rule.compile(field);
        let compiled = if field == "oid" {
            field_override(move |ex| match ex.explicit_oid() {
                Some(oid) => Ok(FieldValue::Text(oid.to_string())),
                None => compiled(ex),
            })
        } else {
            compiled
        };
        rules.insert(field.clone(), compiled);
    }
    Ok(rules)
}

/// A piece of a parsed template.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Placeholder {
        name: String,
        format: Option<String>,
    },
}

/// Split a template into literal text and `{name}` / `{name:format}`
/// placeholders. `{{` and `}}` are literal braces.
pub fn parse_template(template: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut inner = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some('{') | None => {
                            return Err(format!("unbalanced braces in template \"{}\"", template))
                        }
                        Some(c) => inner.push(c),
                    }
                }
                let (name, format) = match inner.split_once(':') {
                    Some((name, format)) => (name.trim(), Some(format.to_string())),
                    None => (inner.trim(), None),
                };
                if name.is_empty() {
                    return Err(format!("empty placeholder in template \"{}\"", template));
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Placeholder {
                    name: name.to_string(),
                    format,
                });
            }
            '}' => return Err(format!("unbalanced braces in template \"{}\"", template)),
            c => literal.push(c),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Parse a template and check the time formats of its placeholders.
pub fn validate_template(template: &str) -> Result<(), String> {
    for segment in parse_template(template)? {
        if let Segment::Placeholder {
            name,
            format: Some(format),
        } = segment
        {
            if StrftimeItems::new(&format).any(|item| matches!(item, Item::Error)) {
                return Err(format!(
                    "invalid time format \"{}\" for {} in template \"{}\"",
                    format, name, template
                ));
            }
        }
    }
    Ok(())
}

/// Render a template, looking placeholders up with `lookup(name, format)`.
pub fn render_template(
    template: &str,
    mut lookup: impl FnMut(&str, Option<&str>) -> Result<String, String>,
) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    for segment in parse_template(template)? {
        match segment {
            Segment::Literal(text) => out.push_str(&text),
            Segment::Placeholder { name, format } => {
                out.push_str(&lookup(&name, format.as_deref())?)
            }
        }
    }
    Ok(out)
}
