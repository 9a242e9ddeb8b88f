use thiserror::Error;

/// Error taxonomy for the storage and query engine.
///
/// `Fatal` covers device I/O and broken on-disk invariants; callers are
/// expected to treat it as unrecoverable. Every other variant is a named,
/// user-surfaceable condition that a caller (the REPL, in this crate) can
/// print and move on from.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no such table: {0}")]
    TableNotFound(String),

    #[error("no such index: {0}")]
    IndexNotFound(String),

    #[error("no such column: {0}")]
    ColumnNotFound(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("index already exists: {0}")]
    IndexExists(String),

    #[error("value does not fit or parse for its column type: {0}")]
    TypeMismatch(String),

    #[error("primary column must be present for this operation")]
    SchemaMisuse,

    #[error("syntax error: {0}")]
    Parse(String),

    #[error("quit")]
    Quit,

    #[error("fatal storage error: {0}")]
    Fatal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Fatal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
