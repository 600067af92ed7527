use jsonschema::Validator;
use serde_json::{Value, json};

use crate::config::RESERVED_PREFIXES;
use crate::error::{Error, Result};
use crate::stage::{Pipeline, Stage};

const IDENTIFIER: &str = "^[A-Za-z_][A-Za-z0-9_]*$";
const FIELD_PATH: &str = "^[A-Za-z_][A-Za-z0-9_]*(\\.[A-Za-z_][A-Za-z0-9_]*)*$";
const COLLECTION: &str = "^[A-Za-z][A-Za-z0-9_-]*$";

/// AQL keywords and pseudo-variables. Matched case-insensitively.
const KEYWORDS: &[&str] = &[
    "AGGREGATE", "ALL", "AND", "ANY", "ASC", "AT", "COLLECT", "CURRENT", "DESC", "DISTINCT",
    "FALSE", "FILTER", "FOR", "GRAPH", "IN", "INBOUND", "INSERT", "INTO", "KEEP", "LEAST",
    "LET", "LIKE", "LIMIT", "NEW", "NONE", "NOT", "NULL", "OLD", "OR", "OUTBOUND", "PRUNE",
    "REMOVE", "REPLACE", "RETURN", "SEARCH", "SORT", "TRUE", "UPDATE", "UPSERT", "WINDOW",
    "WITH",
];

/// Shared `$defs` for the stage and pipeline schemas.
fn definitions() -> Value {
    json!({
        "identifier": {"type": "string", "pattern": IDENTIFIER},
        "fieldPath": {"type": "string", "pattern": FIELD_PATH},
        "collection": {"type": "string", "pattern": COLLECTION},
        "fragment": {
            "anyOf": [
                {"type": "string"},
                {"type": "integer", "minimum": 0}
            ]
        },
        "stage": {
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "$match": {
                    "type": "object",
                    "propertyNames": {"$ref": "#/$defs/fieldPath"}
                },
                "$filter": {"type": "string"},
                "$sort": {"type": "string"},
                "$limit": {"$ref": "#/$defs/fragment"},
                "$skip": {"$ref": "#/$defs/fragment"},
                "$groupBy": {"type": "string"},
                "$project": {
                    "type": "object",
                    "propertyNames": {"$ref": "#/$defs/identifier"},
                    "additionalProperties": {"type": ["string", "number", "boolean", "null"]}
                },
                "$lookup": {"$ref": "#/$defs/lookup"},
                "$unwind": {"$ref": "#/$defs/identifier"},
                "$count": {"$ref": "#/$defs/identifier"},
                "$sample": {"$ref": "#/$defs/sample"}
            }
        },
        "lookup": {
            "type": "object",
            "additionalProperties": false,
            "required": ["from", "as", "pipeline"],
            "properties": {
                "from": {"$ref": "#/$defs/collection"},
                "localField": {"$ref": "#/$defs/fieldPath"},
                "foreignField": {"$ref": "#/$defs/fieldPath"},
                "let": {
                    "type": "object",
                    "propertyNames": {"$ref": "#/$defs/identifier"},
                    "additionalProperties": {"$ref": "#/$defs/fieldPath"}
                },
                "as": {"$ref": "#/$defs/identifier"},
                "pipeline": {"type": "array", "items": {"$ref": "#/$defs/stage"}}
            },
            "dependentRequired": {
                "localField": ["foreignField"],
                "foreignField": ["localField"]
            }
        },
        "sample": {
            "type": "object",
            "additionalProperties": false,
            "required": ["size"],
            "properties": {
                "size": {"type": "integer", "minimum": 0},
                "skip": {"type": "integer", "minimum": 0},
                "chance": {"type": "number", "minimum": 0, "maximum": 1}
            }
        }
    })
}

fn stage_schema() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "$ref": "#/$defs/stage",
        "$defs": definitions()
    })
}

fn pipeline_schema() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "array",
        "items": {"$ref": "#/$defs/stage"},
        "$defs": definitions()
    })
}

/// Gate between caller-supplied JSON and the compiler.
///
/// Every failure is reported as [`Error::Injection`] with no detail.
pub struct StageValidator {
    stage: Validator,
    pipeline: Validator,
}

impl StageValidator {
    pub fn new() -> Result<Self> {
        let stage = jsonschema::validator_for(&stage_schema())
            .map_err(|e| Error::InvalidConfig(format!("stage schema: {e}")))?;
        let pipeline = jsonschema::validator_for(&pipeline_schema())
            .map_err(|e| Error::InvalidConfig(format!("pipeline schema: {e}")))?;
        Ok(Self { stage, pipeline })
    }

    /// Validate a single stage object.
    pub fn stage(&self, raw: &Value) -> Result<Stage> {
        if !self.stage.is_valid(raw) {
            return Err(Error::Injection);
        }
        serde_json::from_value(raw.clone()).map_err(|_| Error::Injection)
    }

    /// Validate an array of stages.
    pub fn pipeline(&self, raw: &Value) -> Result<Pipeline> {
        if !self.pipeline.is_valid(raw) {
            return Err(Error::Injection);
        }
        let stages: Vec<Stage> =
            serde_json::from_value(raw.clone()).map_err(|_| Error::Injection)?;
        Ok(Pipeline::new(stages))
    }

    /// Validate a single stage and wrap it as a one-stage pipeline.
    pub fn single(&self, raw: &Value) -> Result<Pipeline> {
        self.stage(raw).map(Pipeline::single)
    }
}

/// Collection names are interpolated into query text, so they get the same
/// treatment as stage content.
pub fn collection_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid { Ok(()) } else { Err(Error::Injection) }
}

pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `name` followed by one or more `_<digits>` groups, e.g. `stage_0_1`.
fn has_coordinate_suffix(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|suffix| {
            suffix
                .split('_')
                .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
        })
}

/// A `$lookup.let` name becomes `LET <name> = ...` in the nested query. It
/// may not be a keyword, the placeholder, or a name the compiler generates.
pub(crate) fn binding_name(name: &str, placeholder: &str) -> Result<()> {
    let keyword = KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(name));
    let generated = name == placeholder
        || has_coordinate_suffix(name, placeholder)
        || RESERVED_PREFIXES
            .iter()
            .any(|prefix| has_coordinate_suffix(name, prefix));
    if !is_identifier(name) || keyword || generated {
        return Err(Error::Injection);
    }
    Ok(())
}

/// Dotted attribute path such as `address.city`.
pub(crate) fn is_field_path(s: &str) -> bool {
    s.split('.').all(is_identifier)
}
