//! # Structured output parsing
//!
//! Schema-driven extraction of records from model replies. A [`Schema`] is
//! an ordered list of named, described fields; the same schema produces the
//! format instructions placed in the prompt and the key set the parser
//! expects back.
//!
//! Parsing never throws at this layer: [`StructuredParser`] returns a
//! [`ParsedResult`], and a failure keeps the raw text so callers can retry,
//! surface the error, or fall back. [`StrictParser`] is the opt-in variant
//! that turns a failed parse into [`PipelineError::SchemaViolation`].
//!
//! ## Extraction order
//!
//! | Step | Source |
//! |------|--------|
//! | 1 | reasoning markup (`<think>...</think>`) stripped |
//! | 2 | ```` ```json ```` fenced blocks |
//! | 3 | any other fenced block |
//! | 4 | the last balanced `{...}` region (or an unterminated trailing one) |
//! | 5 | the whole reply |
//!
//! Each candidate is decoded as-is, then again after [`repair::repair_json`].

pub mod error;
pub mod extract;
pub mod repair;

pub use error::ParseError;
pub use repair::repair_json;

use std::collections::{BTreeMap, HashSet};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    clean::strip_tagged,
    error::Result,
    exec_ctx::ExecCtx,
    stage::{BoxFut, Stage},
    PipelineError,
};

/// One named, described field of a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub description: String,
}

/// Ordered set of uniquely named fields.
///
/// # Example
///
/// ```
/// use llm_runnables::output_parser::Schema;
///
/// let schema = Schema::builder()
///     .field("names", "names of the people")
///     .field("county", "county they live in")
///     .build()
///     .unwrap();
/// assert_eq!(schema.names(), vec!["names", "county"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder { fields: Vec::new() }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}

/// Builder for [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    fields: Vec<Field>,
}

impl SchemaBuilder {
    pub fn field(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.fields.push(Field {
            name: name.into(),
            description: description.into(),
        });
        self
    }

    /// Rejects empty schemas, empty field names, and duplicates.
    pub fn build(self) -> Result<Schema> {
        if self.fields.is_empty() {
            return Err(PipelineError::InvalidConfig("schema has no fields".into()));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(PipelineError::InvalidConfig(
                    "schema field name is empty".into(),
                ));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "duplicate schema field '{}'",
                    field.name
                )));
            }
        }
        Ok(Schema {
            fields: self.fields,
        })
    }
}

/// Format instructions for `schema`, one line per field.
///
/// A pure function of the schema: the same schema always yields the same text.
pub fn build_instructions(schema: &Schema) -> String {
    let lines: Vec<String> = schema
        .fields
        .iter()
        .map(|f| format!("\t\"{}\": string  // {}", f.name, f.description))
        .collect();
    format!(
        "The output should be a markdown code snippet formatted in the following schema, \
         including the leading and trailing \"```json\" and \"```\":\n\n```json\n{{\n{}\n}}\n```",
        lines.join("\n")
    )
}

/// A decoded reply restricted to schema keys.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// The field as a string slice, if it holds a JSON string.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Deserialize the record into a typed struct.
    pub fn parse_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_value())?)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone().into_iter().collect())
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Outcome of a structured parse.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResult {
    Parsed(Record),
    /// The raw model text is always kept.
    Unparsed { raw: String, reason: ParseError },
}

impl ParsedResult {
    pub fn is_parsed(&self) -> bool {
        matches!(self, ParsedResult::Parsed(_))
    }

    pub fn record(&self) -> Option<&Record> {
        match self {
            ParsedResult::Parsed(record) => Some(record),
            ParsedResult::Unparsed { .. } => None,
        }
    }

    /// The parsed object, or `{"raw_content": <raw text>}` when parsing failed.
    pub fn to_value(&self) -> Value {
        match self {
            ParsedResult::Parsed(record) => record.to_value(),
            ParsedResult::Unparsed { raw, .. } => {
                serde_json::json!({ "raw_content": raw })
            }
        }
    }

    /// Convert into a strict result.
    pub fn into_result(self) -> Result<Record> {
        match self {
            ParsedResult::Parsed(record) => Ok(record),
            ParsedResult::Unparsed { raw, reason } => {
                Err(PipelineError::SchemaViolation { reason, raw })
            }
        }
    }
}

pub(crate) fn decode(candidate: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        return Some(value);
    }
    let trimmed = candidate.trim_start();
    if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
        return None;
    }
    serde_json::from_str(&repair_json(trimmed)).ok()
}

fn project(mut map: Map<String, Value>, schema: &Schema) -> std::result::Result<Record, Vec<String>> {
    let mut record = BTreeMap::new();
    let mut missing = Vec::new();
    for field in &schema.fields {
        match map.remove(&field.name) {
            Some(value) => {
                record.insert(field.name.clone(), value);
            }
            None => missing.push(field.name.clone()),
        }
    }
    if missing.is_empty() {
        Ok(Record(record))
    } else {
        Err(missing)
    }
}

/// Locate and decode a schema-conforming object inside `raw`.
///
/// The first candidate object carrying every schema field wins. Keys match
/// exactly and case-sensitively; keys outside the schema are dropped.
pub fn parse(raw: &str, schema: &Schema) -> ParsedResult {
    let unparsed = |reason| ParsedResult::Unparsed {
        raw: raw.to_string(),
        reason,
    };

    let cleaned = strip_tagged(raw, "<think>", "</think>");
    if cleaned.is_empty() {
        return unparsed(ParseError::EmptyResponse);
    }

    let mut violation: Option<Vec<String>> = None;
    let mut saw_non_object = false;
    for candidate in extract::candidates(&cleaned) {
        match decode(candidate) {
            Some(Value::Object(map)) => match project(map, schema) {
                Ok(record) => return ParsedResult::Parsed(record),
                Err(missing) => {
                    violation.get_or_insert(missing);
                }
            },
            Some(_) => saw_non_object = true,
            None => {}
        }
    }

    let reason = match violation {
        Some(missing) => ParseError::SchemaViolation { missing },
        None if saw_non_object => ParseError::NotAnObject,
        None => ParseError::NoPayload {
            excerpt: error::truncate(&cleaned, 120),
        },
    };
    debug!(%reason, "Structured parse failed");
    unparsed(reason)
}

/// Lenient schema parser stage: `String -> ParsedResult`.
///
/// # Example
///
/// ```
/// use llm_runnables::output_parser::{Schema, StructuredParser};
///
/// let schema = Schema::builder()
///     .field("names", "names of the people")
///     .field("county", "county they live in")
///     .build()
///     .unwrap();
/// let parser = StructuredParser::new(schema);
///
/// let reply = "Here you go:\n```json\n{\"county\": \"Kent\", \"names\": \"Ann, Bo\"}\n```";
/// let record = parser.parse(reply).into_result().unwrap();
/// assert_eq!(record.get_str("county"), Some("Kent"));
/// ```
#[derive(Debug, Clone)]
pub struct StructuredParser {
    name: String,
    schema: Schema,
}

impl StructuredParser {
    pub fn new(schema: Schema) -> Self {
        Self {
            name: "structured-parser".to_string(),
            schema,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Instructions to place in the prompt (usually as a partial variable).
    pub fn format_instructions(&self) -> String {
        build_instructions(&self.schema)
    }

    pub fn parse(&self, raw: &str) -> ParsedResult {
        parse(raw, &self.schema)
    }

    /// Switch to strict mode.
    pub fn strict(self) -> StrictParser {
        StrictParser { inner: self }
    }
}

impl Stage<String> for StructuredParser {
    type Output = ParsedResult;

    fn name(&self) -> &str {
        &self.name
    }

    fn invoke<'a>(&'a self, _ctx: &'a ExecCtx, input: String) -> BoxFut<'a, Result<ParsedResult>>
    where
        String: 'a,
    {
        let result = self.parse(&input);
        Box::pin(async move { Ok(result) })
    }
}

/// Strict schema parser stage: `String -> Record`, failing with
/// [`PipelineError::SchemaViolation`] when no conforming record is found.
#[derive(Debug, Clone)]
pub struct StrictParser {
    inner: StructuredParser,
}

impl StrictParser {
    pub fn format_instructions(&self) -> String {
        self.inner.format_instructions()
    }
}

impl Stage<String> for StrictParser {
    type Output = Record;

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn invoke<'a>(&'a self, _ctx: &'a ExecCtx, input: String) -> BoxFut<'a, Result<Record>>
    where
        String: 'a,
    {
        let result = self.inner.parse(&input).into_result();
        Box::pin(async move { result })
    }
}
