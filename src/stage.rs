use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// One operator-bearing unit of a pipeline.
///
/// Several orthogonal operators may share a stage (`$match` + `$sort` +
/// `$limit`, for instance). A stage is a plain value: compiling it never
/// mutates it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Stage {
    #[serde(rename = "$match", default, skip_serializing_if = "Option::is_none")]
    pub(crate) match_fields: Option<Map<String, Value>>,

    #[serde(rename = "$filter", default, skip_serializing_if = "Option::is_none")]
    pub(crate) filter: Option<String>,

    #[serde(rename = "$sort", default, skip_serializing_if = "Option::is_none")]
    pub(crate) sort: Option<String>,

    #[serde(rename = "$limit", default, skip_serializing_if = "Option::is_none")]
    pub(crate) limit: Option<Fragment>,

    #[serde(rename = "$skip", default, skip_serializing_if = "Option::is_none")]
    pub(crate) skip: Option<Fragment>,

    #[serde(rename = "$groupBy", default, skip_serializing_if = "Option::is_none")]
    pub(crate) group_by: Option<String>,

    #[serde(rename = "$project", default, skip_serializing_if = "Option::is_none")]
    pub(crate) project: Option<Map<String, Value>>,

    #[serde(rename = "$lookup", default, skip_serializing_if = "Option::is_none")]
    pub(crate) lookup: Option<Lookup>,

    #[serde(rename = "$unwind", default, skip_serializing_if = "Option::is_none")]
    pub(crate) unwind: Option<String>,

    #[serde(rename = "$count", default, skip_serializing_if = "Option::is_none")]
    pub(crate) count: Option<String>,

    #[serde(rename = "$sample", default, skip_serializing_if = "Option::is_none")]
    pub(crate) sample: Option<Sample>,
}

impl Stage {
    pub fn match_fields(&self) -> Option<&Map<String, Value>> {
        self.match_fields.as_ref()
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub fn lookup(&self) -> Option<&Lookup> {
        self.lookup.as_ref()
    }

    pub fn sample(&self) -> Option<&Sample> {
        self.sample.as_ref()
    }

    /// A stage carrying only a raw filter. Used for the implicit join filter
    /// and the facade's `count`.
    pub(crate) fn with_filter(filter: impl Into<String>) -> Self {
        Self {
            filter: Some(filter.into()),
            ..Default::default()
        }
    }

    /// Copy of this stage with `$limit` replaced.
    pub(crate) fn with_limit(&self, limit: u64) -> Self {
        Self {
            limit: Some(Fragment::Int(limit)),
            ..self.clone()
        }
    }
}

/// A `$limit`/`$skip` value: either a number or raw text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Fragment {
    Int(u64),
    Text(String),
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fragment::Int(n) => write!(f, "{n}"),
            Fragment::Text(s) => f.write_str(s),
        }
    }
}

/// `$lookup` join descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Lookup {
    pub from: String,

    #[serde(rename = "localField", default, skip_serializing_if = "Option::is_none")]
    pub local_field: Option<String>,

    #[serde(rename = "foreignField", default, skip_serializing_if = "Option::is_none")]
    pub foreign_field: Option<String>,

    /// bound name -> source field on the parent document
    #[serde(rename = "let", default, skip_serializing_if = "Option::is_none")]
    pub let_bindings: Option<BTreeMap<String, String>>,

    #[serde(rename = "as")]
    pub alias: String,

    pub pipeline: Vec<Stage>,
}

/// `$sample` descriptor as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Sample {
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chance: Option<f64>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// An ordered, validated sequence of stages.
///
/// There is no public constructor: a `Pipeline` only comes out of
/// [`StageValidator`](crate::validate::StageValidator), so the compiler can
/// never see caller input that skipped validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub(crate) fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub(crate) fn single(stage: Stage) -> Self {
        Self {
            stages: vec![stage],
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Coordinate
// ---------------------------------------------------------------------------

/// Lexical position of a stage: `depth` grows by one per `$lookup` level,
/// `index` is the position inside its own pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Coordinate {
    pub depth: usize,
    pub index: usize,
}

impl Coordinate {
    pub fn new(depth: usize, index: usize) -> Self {
        Self { depth, index }
    }

    /// Loop variable bound to the current document of this stage.
    pub fn document(&self, placeholder: &str) -> String {
        format!("{placeholder}_{self}")
    }

    /// Name of the row set this stage produces.
    pub fn binding(&self) -> String {
        format!("stage_{self}")
    }

    pub fn join(&self) -> String {
        format!("join_{self}")
    }

    pub fn local(&self) -> String {
        format!("local_{self}")
    }

    pub fn counter(&self) -> String {
        format!("count_{self}")
    }

    pub fn unwound(&self) -> String {
        format!("unwind_{self}")
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.depth, self.index)
    }
}
