use reqwest::{Method, StatusCode};
use thiserror::Error;

/// Result alias for CouchDB operations.
pub type CouchResult<T> = Result<T, CouchDaoError>;

/// Failures of the CouchDB document store.
#[derive(Debug, Error)]
pub enum CouchDaoError {
    /// A required environment variable is absent.
    #[error("CouchDB setting `{0}` is not set")]
    MissingSetting(&'static str),
    /// The configured base URL is unusable.
    #[error("`{0}` cannot be used as a CouchDB base URL")]
    BaseUrl(String),
    /// The HTTP client could not be built.
    #[error("could not build the CouchDB HTTP client")]
    Client(#[source] reqwest::Error),
    /// The request never got an answer.
    #[error("{method} {target} did not reach CouchDB")]
    Transport {
        /// HTTP method.
        method: Method,
        /// Request path.
        target: String,
        /// Underlying failure.
        #[source]
        source: reqwest::Error,
    },
    /// CouchDB answered with an unexpected status.
    #[error("{method} {target} answered {status}")]
    Status {
        /// HTTP method.
        method: Method,
        /// Request path.
        target: String,
        /// Status received.
        status: StatusCode,
    },
    /// The response body did not decode.
    #[error("{target} returned a body that could not be decoded")]
    Body {
        /// Request path.
        target: String,
        /// Underlying failure.
        #[source]
        source: reqwest::Error,
    },
    /// Every attempt lost against a concurrent writer.
    #[error("gave up on `{doc_id}` after {attempts} revision conflicts")]
    Conflict {
        /// Contended document.
        doc_id: String,
        /// Writes attempted.
        attempts: usize,
    },
}
