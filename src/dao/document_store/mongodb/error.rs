use mongodb::error::Error as MongoError;
use thiserror::Error;

/// Result alias for MongoDB operations.
pub type MongoResult<T> = Result<T, MongoDaoError>;

/// Failures of the MongoDB document store.
#[derive(Debug, Error)]
pub enum MongoDaoError {
    /// A required environment variable is absent.
    #[error("MongoDB setting `{0}` is not set")]
    MissingSetting(&'static str),
    /// The connection string did not parse.
    #[error("`{uri}` is not a usable MongoDB URI")]
    Uri {
        /// Connection string as configured.
        uri: String,
        /// Underlying failure.
        #[source]
        source: MongoError,
    },
    /// The client could not be created.
    #[error("could not build the MongoDB client")]
    Client(#[source] MongoError),
    /// The server never answered a ping.
    #[error("MongoDB stayed unreachable after {attempts} ping(s)")]
    Unreachable {
        /// Pings attempted.
        attempts: u32,
        /// Last ping failure.
        #[source]
        source: MongoError,
    },
    /// A ping on an open connection failed.
    #[error("MongoDB ping failed")]
    Ping(#[source] MongoError),
    /// A command against one collection failed.
    #[error("MongoDB {operation} on `{collection}` failed")]
    Command {
        /// Driver operation.
        operation: &'static str,
        /// Target collection.
        collection: &'static str,
        /// Underlying failure.
        #[source]
        source: MongoError,
    },
}

impl MongoDaoError {
    /// Wrap a driver error raised by `operation` on `collection`.
    pub fn command(
        operation: &'static str,
        collection: &'static str,
    ) -> impl FnOnce(MongoError) -> Self {
        move |source| Self::Command {
            operation,
            collection,
            source,
        }
    }
}
