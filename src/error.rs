use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("duplicate key: _id {0} already exists")]
    DuplicateKey(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("invalid projection: {0}")]
    InvalidProjection(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("aggregation failed at stage {stage} ({name}): {source}")]
    Aggregation {
        stage: usize,
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("field '{0}' is immutable")]
    ImmutableField(String),

    #[error("document must be a JSON object")]
    NotADocument,

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("collection already exists: {0}")]
    CollectionAlreadyExists(String),

    #[error("collection '{name}' is full ({limit} documents)")]
    CollectionFull { name: String, limit: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// The stage index of an aggregation failure, if this is one.
    pub fn stage(&self) -> Option<usize> {
        match self {
            Error::Aggregation { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
