#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document not found")]
    NotFound,

    #[error("document already exists")]
    DocumentExists,

    #[error("cas mismatch")]
    CasMismatch,

    #[error("operation timed out with unknown outcome")]
    AmbiguousTimeout,

    #[error("store unavailable `{0}`")]
    Unavailable(String),

    #[error("serde_json `{0}`")]
    SerdeJson(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
