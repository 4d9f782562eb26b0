use std::path::Path;

/// imgshard error types
#[derive(Debug, thiserror::Error)]
pub enum ImgShardError {
    /// Store root directory does not exist
    #[error("Store not found: {0}")]
    StoreNotFound(String),

    /// Persisted shard failed to parse or violates the store invariants
    #[error("Corrupt shard '{category}': {reason}")]
    CorruptShard { category: String, reason: String },

    /// Query rejected before any shard I/O
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Ingestion input rejected
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Collaborator (classifier / embedder) failure
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// General error (anyhow integration)
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ImgShardError {
    /// Create store-not-found error for a root path
    pub fn store_not_found(root: &Path) -> Self {
        Self::StoreNotFound(root.display().to_string())
    }

    /// Create corrupt shard error
    pub fn corrupt_shard<C: Into<String>, R: Into<String>>(category: C, reason: R) -> Self {
        Self::CorruptShard {
            category: category.into(),
            reason: reason.into(),
        }
    }

    /// Create invalid query error
    pub fn invalid_query<S: Into<String>>(msg: S) -> Self {
        Self::InvalidQuery(msg.into())
    }

    /// Create invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create collaborator error
    pub fn collaborator<S: Into<String>>(msg: S) -> Self {
        Self::Collaborator(msg.into())
    }

    /// Whether a retrieval may record this error against one category and keep going.
    ///
    /// Only a missing store root aborts a whole query; every other failure
    /// raised while reading a single shard stays scoped to that shard.
    pub fn is_category_scoped(&self) -> bool {
        !matches!(
            self,
            Self::StoreNotFound(_) | Self::InvalidQuery(_) | Self::Config(_)
        )
    }
}
