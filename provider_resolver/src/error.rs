//! Error types for the resolver components.

use thiserror::Error;

/// Failures talking to the NPI registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Network failure or retryable status after all attempts.
    #[error("NPI registry unavailable: {0}")]
    Unavailable(String),

    /// The registry answered but refused the query (its `Errors` payload).
    #[error("NPI registry rejected query: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocoding service unavailable: {0}")]
    Unavailable(String),

    #[error("geocoding request rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM configuration error: {0}")]
    Config(String),

    #[error("LLM network error: {0}")]
    Network(String),

    #[error("LLM API error: {0}")]
    Api(String),

    #[error("LLM response parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("stored data could not be decoded: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("invalid provider record: {0}")]
    InvalidRecord(String),

    #[error("invalid proximity search: {0}")]
    InvalidSearch(String),
}

/// A classifier answer that is not part of the specialty vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("specialty {token:?} is not in the vocabulary")]
pub struct VocabularyViolation {
    pub token: String,
}

/// I/O failures that leave a resolution retryable.
#[derive(Debug, Error)]
pub enum TransientCause {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Geocode(#[from] GeocodeError),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid resolution query: {0}")]
    InvalidQuery(String),

    #[error(
        "{} directory records match {first_name} {last_name} ({specialty})",
        .candidates.len()
    )]
    AmbiguousMatch {
        first_name: String,
        last_name: String,
        specialty: String,
        candidates: Vec<String>,
    },

    #[error("transient resolution failure: {0}")]
    Transient(#[source] TransientCause),
}

impl ResolveError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResolveError::Transient(_))
    }
}

impl From<RegistryError> for ResolveError {
    fn from(err: RegistryError) -> Self {
        ResolveError::Transient(err.into())
    }
}

impl From<DirectoryError> for ResolveError {
    fn from(err: DirectoryError) -> Self {
        ResolveError::Transient(err.into())
    }
}

impl From<GeocodeError> for ResolveError {
    fn from(err: GeocodeError) -> Self {
        ResolveError::Transient(err.into())
    }
}

#[derive(Debug, Error)]
pub enum FollowUpError {
    #[error("specialty classification failed: {0}")]
    Classification(#[from] LlmError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}
