use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::CompilerOptions;
use crate::error::Result;
use crate::placeholder::PlaceholderRewriter;
use crate::random::{RandomSource, ThreadRandom};
use crate::serializer::{self, GroupNames, indent};
use crate::stage::{Coordinate, Pipeline, Stage};
use crate::validate;

/// A `LET name = source` binding prepended to a nested pipeline. Produced by
/// `$lookup.let` and by the local side of a `localField`/`foreignField` join;
/// callers can never supply one.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ContextBinding {
    name: String,
    source: String,
}

impl ContextBinding {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Where a compiled pipeline leaves its rows.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Output {
    /// The text ends with a `FOR ... RETURN` that yields the rows.
    Rows,
    /// The text is a run of `LET` bindings; the rows live in the named one.
    Binding(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Compiled {
    pub text: String,
    pub output: Output,
}

/// Turns a validated [`Pipeline`] into AQL text.
///
/// Compilation is synchronous and does no I/O. The only state consulted
/// across calls is the injected [`RandomSource`], used for `$sample`
/// defaults.
pub struct PipelineCompiler {
    options: CompilerOptions,
    rewriter: PlaceholderRewriter,
    groups: GroupNames,
    random: Arc<dyn RandomSource>,
}

impl PipelineCompiler {
    pub fn new(options: CompilerOptions, random: Arc<dyn RandomSource>) -> Result<Self> {
        options.validate()?;
        let rewriter = PlaceholderRewriter::new(&options.placeholder)?;
        Ok(Self {
            options,
            rewriter,
            groups: GroupNames::new()?,
            random,
        })
    }

    /// Default options with a thread-local random source.
    pub fn with_defaults() -> Result<Self> {
        Self::new(CompilerOptions::default(), Arc::new(ThreadRandom))
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub(crate) fn rewriter(&self) -> &PlaceholderRewriter {
        &self.rewriter
    }

    pub(crate) fn group_names(&self) -> &GroupNames {
        &self.groups
    }

    pub(crate) fn random(&self) -> &dyn RandomSource {
        self.random.as_ref()
    }

    /// Compile `pipeline` against `collection` into a complete query.
    pub fn compile(&self, collection: &str, pipeline: &Pipeline) -> Result<String> {
        self.compile_stages(collection, pipeline.stages())
    }

    /// Compile stages built inside the crate (already trusted) at the root.
    pub(crate) fn compile_stages(&self, collection: &str, stages: &[Stage]) -> Result<String> {
        let compiled = self.compile_at(collection, stages, 0, &[])?;
        debug!(collection, stages = stages.len(), "compiled pipeline");
        trace!(query = %compiled.text, "query text");
        Ok(compiled.text)
    }

    /// Compile `stages` at `depth`, prepending `context` bindings.
    ///
    /// At the root, and for pipelines of at most one stage, a final
    /// `FOR ... RETURN` materializes the last binding. Deeper multi-stage
    /// pipelines stop at their last binding so the parent can reference it.
    pub(crate) fn compile_at(
        &self,
        collection: &str,
        stages: &[Stage],
        depth: usize,
        context: &[ContextBinding],
    ) -> Result<Compiled> {
        validate::collection_name(collection)?;

        let mut parts: Vec<String> = context
            .iter()
            .map(|b| format!("LET {} = {}", b.name, b.source))
            .collect();

        let mut source = format!("`{collection}`");
        for (index, stage) in stages.iter().enumerate() {
            let coord = Coordinate::new(depth, index);
            let clauses = serializer::serialize(self, stage, coord)?;
            let binding = coord.binding();

            let mut lines = Vec::with_capacity(clauses.body.len() + 4);
            lines.push(format!("LET {binding} = ("));
            lines.push(format!("  FOR {} IN {source}", self.rewriter.variable(coord)));
            for clause in &clauses.body {
                lines.push(indent(clause));
            }
            lines.push(indent(&clauses.ret));
            lines.push(")".to_string());
            parts.push(lines.join("\n"));

            source = binding;
        }

        let output = if depth == 0 || stages.len() <= 1 {
            let row = format!("row_{depth}");
            parts.push(format!("FOR {row} IN {source} RETURN {row}"));
            Output::Rows
        } else {
            Output::Binding(source)
        };

        Ok(Compiled {
            text: parts.join("\n"),
            output,
        })
    }
}
