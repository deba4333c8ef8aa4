use thiserror::Error;

pub type OmnidexResult<T, E = OmnidexError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum OmnidexError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Unsupported predicate: {0}")]
    UnsupportedPredicate(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Build error: {0}")]
    Build(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OmnidexError {
    /// Stable kind tag surfaced to callers alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            OmnidexError::Parse(_) => "ParseError",
            OmnidexError::UnknownTable(_) => "UnknownTable",
            OmnidexError::UnknownField(_) => "UnknownField",
            OmnidexError::UnsupportedPredicate(_) => "UnsupportedPredicate",
            OmnidexError::DuplicateKey(_) => "DuplicateKey",
            OmnidexError::NotFound(_) => "NotFound",
            OmnidexError::Io(_) | OmnidexError::Bincode(_) | OmnidexError::Json(_) => "IOError",
            OmnidexError::Build(_) => "BuildError",
            OmnidexError::Internal(_) => "InternalError",
        }
    }
}
