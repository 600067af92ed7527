use serde_json::Value;
use tracing::debug;

use crate::compiler::PipelineCompiler;
use crate::error::{Error, Result};
use crate::executor::{Database, QueryResult, execute};
use crate::stage::{Coordinate, Stage};
use crate::validate::{self, StageValidator};

/// What [`Repository::remove`] deletes.
#[derive(Debug, Clone, PartialEq)]
pub enum Removal {
    /// The document with this `_key`.
    Key(String),
    /// Every document the filter expression accepts. The expression is
    /// written against the placeholder like a `$filter`.
    Matching(String),
}

/// Collection-level operations on top of the compiler and a database handle.
///
/// Every operation that takes caller stages runs them through the
/// [`StageValidator`] first, and every operation costs exactly one round trip.
pub struct Repository<D> {
    db: D,
    compiler: PipelineCompiler,
    validator: StageValidator,
}

impl<D: Database> Repository<D> {
    pub fn new(db: D) -> Result<Self> {
        Self::with_compiler(db, PipelineCompiler::with_defaults()?)
    }

    pub fn with_compiler(db: D, compiler: PipelineCompiler) -> Result<Self> {
        Ok(Self {
            db,
            compiler,
            validator: StageValidator::new()?,
        })
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    pub fn compiler(&self) -> &PipelineCompiler {
        &self.compiler
    }

    /// Number of documents in `collection`, optionally restricted by a raw
    /// filter expression.
    pub async fn count(&self, collection: &str, filter: Option<&str>) -> Result<u64> {
        let mut stage = filter.map(Stage::with_filter).unwrap_or_default();
        stage.count = Some("count".to_string());
        let query = self
            .compiler
            .compile_stages(collection, std::slice::from_ref(&stage))?;

        let rows = execute(&self.db, query).await?;
        rows.first()
            .and_then(|row| row.get("count"))
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::InvalidQuery("count query returned no count row".into()))
    }

    /// Run a single caller-supplied stage.
    pub async fn find_many(&self, collection: &str, stage: &Value) -> Result<QueryResult<'_>> {
        let pipeline = self.validator.single(stage)?;
        let query = self.compiler.compile(collection, &pipeline)?;
        Ok(execute(&self.db, query))
    }

    /// Like [`find_many`](Self::find_many) with `$limit` forced to 1.
    pub async fn find_one(&self, collection: &str, stage: &Value) -> Result<Option<Value>> {
        let stage = self.validator.stage(stage)?.with_limit(1);
        let query = self
            .compiler
            .compile_stages(collection, std::slice::from_ref(&stage))?;
        let rows = execute(&self.db, query).await?;
        Ok(rows.into_iter().next())
    }

    pub async fn aggregate(&self, collection: &str, pipeline: &Value) -> Result<QueryResult<'_>> {
        let pipeline = self.validator.pipeline(pipeline)?;
        let query = self.compiler.compile(collection, &pipeline)?;
        Ok(execute(&self.db, query))
    }

    /// Insert `docs` in one query and return them as stored.
    pub async fn insert_many(&self, collection: &str, docs: &[Value]) -> Result<Vec<Value>> {
        validate::collection_name(collection)?;
        if docs.iter().any(|d| !d.is_object()) {
            return Err(Error::NotAnObject);
        }
        let literal = serde_json::to_string(docs)?;
        let query = format!("FOR row_0 IN {literal} INSERT row_0 INTO `{collection}` RETURN NEW");
        debug!(collection, count = docs.len(), "inserting documents");
        execute(&self.db, query).await
    }

    /// Remove by key or by filter and return the removed documents.
    pub async fn remove(&self, collection: &str, removal: &Removal) -> Result<Vec<Value>> {
        validate::collection_name(collection)?;
        let query = match removal {
            Removal::Key(key) => {
                let key = Value::String(key.clone());
                format!("REMOVE {key} IN `{collection}` RETURN OLD")
            }
            Removal::Matching(filter) => {
                let coord = Coordinate::new(0, 0);
                let rw = self.compiler.rewriter();
                let var = rw.variable(coord);
                format!(
                    "FOR {var} IN `{collection}` FILTER ({}) REMOVE {var} IN `{collection}` RETURN OLD",
                    rw.rewrite(filter, coord)
                )
            }
        };
        debug!(collection, ?removal, "removing documents");
        execute(&self.db, query).await
    }
}
