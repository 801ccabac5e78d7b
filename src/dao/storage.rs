use std::error::Error;
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by storage backends regardless of the underlying database.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached.
    #[error("storage unavailable: {message}")]
    Unavailable {
        /// What was being attempted.
        message: String,
        /// Underlying failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// A stored document could not be converted to or from its model.
    #[error("malformed document `{key}` in collection `{collection}`")]
    Malformed {
        /// Collection of the document.
        collection: &'static str,
        /// Document key.
        key: String,
        /// Underlying failure.
        #[source]
        source: serde_json::Error,
    },
    /// Optimistic writes kept losing to concurrent writers.
    #[error("too many concurrent writes to `{key}` in collection `{collection}`")]
    Contention {
        /// Contended collection.
        collection: &'static str,
        /// Contended document key.
        key: String,
    },
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Construct a decoding error for a document.
    pub fn malformed(
        collection: &'static str,
        key: impl Into<String>,
        source: serde_json::Error,
    ) -> Self {
        StorageError::Malformed {
            collection,
            key: key.into(),
            source,
        }
    }
}
