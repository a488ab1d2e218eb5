//! Attribute record ("tags") and the section schema it is validated against.
//!
//! Generated output is untrusted: [`validate_value`] re-checks every field and
//! produces a typed [`AttributeRecord`] or the full list of violations, which the
//! extractor echoes back to the model on retry.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum nesting depth of mapping values inside a section.
pub const MAX_NESTING_DEPTH: usize = 4;

/// Key under which an optional image reference is carried.
pub const IMAGE_KEY: &str = "image";

/// Fixed section names, in canonical order. All are required.
pub const SECTION_NAMES: [&str; 10] = [
    "identity_signals",
    "professional_profile",
    "inferred_attributes",
    "online_presence",
    "financial_indicators",
    "personal_interests",
    "network_influence",
    "life_stage",
    "values_beliefs",
    "metadata",
];

/// Keys declared as lists. A scalar returned for one of these is wrapped into a
/// one-element list instead of being rejected.
const LIST_FIELDS: [(&str, &[&str]); 10] = [
    ("identity_signals", &["aliases", "locations"]),
    (
        "professional_profile",
        &["previous_roles", "skills", "education", "certifications"],
    ),
    ("inferred_attributes", &["interests", "affiliations", "likely_issues"]),
    ("online_presence", &["social_profiles", "websites", "publications"]),
    (
        "financial_indicators",
        &["property_records", "political_contributions"],
    ),
    ("personal_interests", &["hobbies", "sports", "causes"]),
    (
        "network_influence",
        &["board_memberships", "organizations", "notable_connections"],
    ),
    ("life_stage", &["milestones"]),
    ("values_beliefs", &["causes_supported", "religious_affiliations"]),
    ("metadata", &[]),
];

fn list_fields(section: &str) -> &'static [&'static str] {
    LIST_FIELDS
        .iter()
        .find(|(name, _)| *name == section)
        .map(|(_, fields)| *fields)
        .unwrap_or(&[])
}

/// A single attribute value: free text, a list of strings, or a nested mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Text(String),
    List(Vec<String>),
    Map(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            AttributeValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, AttributeValue>> {
        match self {
            AttributeValue::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(value: Vec<String>) -> Self {
        AttributeValue::List(value)
    }
}

/// Open-ended mapping from attribute name to value.
pub type Section = BTreeMap<String, AttributeValue>;

/// The structured output of research synthesis.
///
/// Section names are fixed; keys inside a section are not. Every section is
/// always serialized, even when empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeRecord {
    pub identity_signals: Section,
    pub professional_profile: Section,
    pub inferred_attributes: Section,
    pub online_presence: Section,
    pub financial_indicators: Section,
    pub personal_interests: Section,
    pub network_influence: Section,
    pub life_stage: Section,
    pub values_beliefs: Section,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub metadata: Section,
}

impl AttributeRecord {
    /// A record with every section present and empty.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        match name {
            "identity_signals" => Some(&self.identity_signals),
            "professional_profile" => Some(&self.professional_profile),
            "inferred_attributes" => Some(&self.inferred_attributes),
            "online_presence" => Some(&self.online_presence),
            "financial_indicators" => Some(&self.financial_indicators),
            "personal_interests" => Some(&self.personal_interests),
            "network_influence" => Some(&self.network_influence),
            "life_stage" => Some(&self.life_stage),
            "values_beliefs" => Some(&self.values_beliefs),
            "metadata" => Some(&self.metadata),
            _ => None,
        }
    }

    pub fn section_mut(&mut self, name: &str) -> Option<&mut Section> {
        match name {
            "identity_signals" => Some(&mut self.identity_signals),
            "professional_profile" => Some(&mut self.professional_profile),
            "inferred_attributes" => Some(&mut self.inferred_attributes),
            "online_presence" => Some(&mut self.online_presence),
            "financial_indicators" => Some(&mut self.financial_indicators),
            "personal_interests" => Some(&mut self.personal_interests),
            "network_influence" => Some(&mut self.network_influence),
            "life_stage" => Some(&mut self.life_stage),
            "values_beliefs" => Some(&mut self.values_beliefs),
            "metadata" => Some(&mut self.metadata),
            _ => None,
        }
    }

    /// True when no section other than metadata holds any attribute.
    pub fn has_no_findings(&self) -> bool {
        SECTION_NAMES
            .iter()
            .filter(|name| **name != "metadata")
            .filter_map(|name| self.section(name))
            .all(|section| section.is_empty())
    }

    /// Re-runs the untrusted-input validator over this record's serialized form.
    ///
    /// Passing records are fixed points: validation yields the same record back.
    pub fn revalidate(&self) -> Result<(), SchemaViolations> {
        let value = serde_json::to_value(self).map_err(|e| {
            SchemaViolations(vec![SchemaViolation::new("$", e.to_string())])
        })?;
        let reparsed = validate_value(&value)?;
        if &reparsed != self {
            return Err(SchemaViolations(vec![SchemaViolation::new(
                "$",
                "record is not in canonical form",
            )]));
        }
        Ok(())
    }
}

/// One conformance failure, located by a JSON-path-like string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

impl SchemaViolation {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// All violations found in one candidate value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolations(pub Vec<SchemaViolation>);

impl fmt::Display for SchemaViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|v| v.to_string()).collect();
        write!(f, "{}", parts.join("; "))
    }
}

impl std::error::Error for SchemaViolations {}

/// Validates an untrusted JSON value against the section schema.
///
/// Coercions applied: `null` attributes are dropped, numbers and booleans in
/// free-text positions become their textual form, and scalars in declared list
/// fields become one-element lists. A `null` section counts as present and empty.
pub fn validate_value(value: &Value) -> Result<AttributeRecord, SchemaViolations> {
    let mut violations = Vec::new();

    let Some(object) = value.as_object() else {
        return Err(SchemaViolations(vec![SchemaViolation::new(
            "$",
            format!("expected a JSON object, got {}", type_name(value)),
        )]));
    };

    for key in object.keys() {
        if key != IMAGE_KEY && !SECTION_NAMES.contains(&key.as_str()) {
            violations.push(SchemaViolation::new(
                format!("$.{}", key),
                "unknown section",
            ));
        }
    }

    let mut record = AttributeRecord::empty();
    for name in SECTION_NAMES {
        let path = format!("$.{}", name);
        match object.get(name) {
            None => violations.push(SchemaViolation::new(path, "missing required section")),
            Some(Value::Null) => {}
            Some(Value::Object(entries)) => {
                let declared_lists = list_fields(name);
                let mut section = Section::new();
                for (key, raw) in entries {
                    let attr_path = format!("{}.{}", path, key);
                    if key.trim().is_empty() {
                        violations.push(SchemaViolation::new(attr_path, "empty attribute name"));
                        continue;
                    }
                    let coerced = if declared_lists.contains(&key.as_str()) {
                        coerce_list(&attr_path, raw, &mut violations)
                    } else {
                        coerce_value(&attr_path, raw, 1, &mut violations)
                    };
                    if let Some(v) = coerced {
                        section.insert(key.clone(), v);
                    }
                }
                if let Some(slot) = record.section_mut(name) {
                    *slot = section;
                }
            }
            Some(other) => violations.push(SchemaViolation::new(
                path,
                format!("expected an object, got {}", type_name(other)),
            )),
        }
    }

    match object.get(IMAGE_KEY) {
        None | Some(Value::Null) => {}
        Some(Value::String(reference)) => {
            let trimmed = reference.trim();
            if url::Url::parse(trimmed).is_ok() {
                record.image = Some(trimmed.to_string());
            } else if !trimmed.is_empty() {
                tracing::debug!("Dropping unparseable image reference: {}", trimmed);
            }
        }
        Some(other) => violations.push(SchemaViolation::new(
            format!("$.{}", IMAGE_KEY),
            format!("expected a string or null, got {}", type_name(other)),
        )),
    }

    if violations.is_empty() {
        Ok(record)
    } else {
        Err(SchemaViolations(violations))
    }
}

fn coerce_scalar(value: &Value) -> Option<Option<String>> {
    match value {
        Value::Null => Some(None),
        Value::String(s) => Some(Some(s.clone())),
        Value::Number(n) => Some(Some(n.to_string())),
        Value::Bool(b) => Some(Some(b.to_string())),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn coerce_list(path: &str, value: &Value, violations: &mut Vec<SchemaViolation>) -> Option<AttributeValue> {
    match value {
        Value::Null => None,
        Value::Array(items) => Some(AttributeValue::List(collect_strings(path, items, violations))),
        Value::Object(_) => {
            violations.push(SchemaViolation::new(path, "expected a list of strings, got object"));
            None
        }
        scalar => coerce_scalar(scalar)
            .flatten()
            .map(|s| AttributeValue::List(vec![s])),
    }
}

fn coerce_value(
    path: &str,
    value: &Value,
    depth: usize,
    violations: &mut Vec<SchemaViolation>,
) -> Option<AttributeValue> {
    match value {
        Value::Array(items) => Some(AttributeValue::List(collect_strings(path, items, violations))),
        Value::Object(entries) => {
            if depth >= MAX_NESTING_DEPTH {
                violations.push(SchemaViolation::new(
                    path,
                    format!("nesting deeper than {} levels", MAX_NESTING_DEPTH),
                ));
                return None;
            }
            Some(AttributeValue::Map(coerce_map(path, entries, depth, violations)))
        }
        scalar => coerce_scalar(scalar).flatten().map(AttributeValue::Text),
    }
}

fn coerce_map(
    path: &str,
    entries: &Map<String, Value>,
    depth: usize,
    violations: &mut Vec<SchemaViolation>,
) -> BTreeMap<String, AttributeValue> {
    let mut map = BTreeMap::new();
    for (key, raw) in entries {
        let child = format!("{}.{}", path, key);
        if let Some(v) = coerce_value(&child, raw, depth + 1, violations) {
            map.insert(key.clone(), v);
        }
    }
    map
}

fn collect_strings(path: &str, items: &[Value], violations: &mut Vec<SchemaViolation>) -> Vec<String> {
    let mut out = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        match coerce_scalar(item) {
            Some(Some(s)) => out.push(s),
            Some(None) => {}
            None => violations.push(SchemaViolation::new(
                format!("{}[{}]", path, idx),
                format!("expected a string, got {}", type_name(item)),
            )),
        }
    }
    out
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Schema description handed to the structured-generation capability.
pub fn schema_description() -> Value {
    let sections: Map<String, Value> = SECTION_NAMES
        .iter()
        .map(|name| {
            (
                name.to_string(),
                json!({
                    "type": "object",
                    "list_fields": list_fields(name),
                }),
            )
        })
        .collect();

    json!({
        "type": "object",
        "required": SECTION_NAMES,
        "sections": sections,
        "optional": { "image": "absolute URL of a photo of the person, or null" },
        "value_types": [
            "string",
            "array of strings",
            format!("object of the same value types, at most {} levels deep", MAX_NESTING_DEPTH)
        ],
        "additional_sections": false
    })
}
