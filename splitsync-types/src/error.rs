use thiserror::Error;

/// Errors raised while parsing persisted type tags and identifiers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypesError {
    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("invalid entity id: {0}")]
    InvalidEntityId(String),

    #[error("invalid operation id: {0}")]
    InvalidOperationId(String),
}
