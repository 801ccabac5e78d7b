use std::env;

use mongodb::options::ClientOptions;

use super::error::{MongoDaoError, MongoResult};

const DEFAULT_DATABASE: &str = "disc_hold";

/// Parsed driver options plus the database holding every collection.
#[derive(Clone)]
pub struct MongoConfig {
    /// Parsed client options.
    pub options: ClientOptions,
    /// Database holding every collection.
    pub database_name: String,
}

impl MongoConfig {
    /// Read `MONGO_URI` (required) and `MONGO_DB` (defaults to `disc_hold`).
    pub async fn from_env() -> MongoResult<Self> {
        let uri = env::var("MONGO_URI").map_err(|_| MongoDaoError::MissingSetting("MONGO_URI"))?;
        let options = ClientOptions::parse(&uri)
            .await
            .map_err(|source| MongoDaoError::Uri {
                uri: uri.clone(),
                source,
            })?;

        Ok(Self {
            options,
            database_name: env::var("MONGO_DB").unwrap_or_else(|_| DEFAULT_DATABASE.to_owned()),
        })
    }
}
