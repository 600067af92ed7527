use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Raised by the stage validator. The message is fixed so a caller never
    /// learns which part of the stage was refused.
    #[error("stage rejected")]
    Injection,

    #[error("unsupported value type for {operator}: {value}")]
    UnsupportedValue { operator: &'static str, value: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("unique constraint violated: field '{field}' value already exists")]
    UniqueViolation { field: String },

    #[error("document must be a JSON object")]
    NotAnObject,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("query cursor already consumed")]
    CursorConsumed,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
