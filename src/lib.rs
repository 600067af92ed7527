//! Compiles MongoDB-style aggregation pipelines into AQL query text and runs
//! them through a pluggable database handle.
//!
//! ```no_run
//! # async fn demo() -> aqlpipe::Result<()> {
//! use aqlpipe::{MemoryDatabase, Repository};
//! use serde_json::json;
//!
//! let repo = Repository::new(MemoryDatabase::new())?;
//! repo.insert_many("users", &[json!({"name": "Ada", "role": "admin"})]).await?;
//! let admins = repo
//!     .aggregate("users", &json!([{"$match": {"role": "admin"}}, {"$count": "n"}]))
//!     .await?
//!     .await?;
//! assert_eq!(admins, vec![json!({"n": 1})]);
//! # Ok(())
//! # }
//! ```

pub mod compiler;
pub mod config;
pub mod error;
pub mod executor;
pub mod memory;
pub mod placeholder;
pub mod random;
pub mod repository;
mod serializer;
pub mod stage;
pub mod validate;

pub use compiler::PipelineCompiler;
pub use config::CompilerOptions;
pub use error::{Error, Result};
pub use executor::{Cursor, Database, QueryResult, VecCursor, execute};
pub use memory::MemoryDatabase;
pub use random::{FixedSequence, RandomSource, SeededRandom, ThreadRandom};
pub use repository::{Removal, Repository};
pub use stage::{Coordinate, Lookup, Pipeline, Sample, Stage};
pub use validate::StageValidator;
