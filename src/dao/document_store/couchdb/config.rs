use std::{env, time::Duration};

use super::error::{CouchDaoError, CouchResult};

const DEFAULT_DATABASE: &str = "disc_hold";
const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Basic-auth pair sent with every request.
#[derive(Debug, Clone)]
pub struct CouchCredentials {
    /// CouchDB user name.
    pub username: String,
    /// CouchDB password.
    pub password: String,
}

/// Where the CouchDB document store lives and how it is polled.
#[derive(Debug, Clone)]
pub struct CouchConfig {
    /// Server URL, e.g. `http://localhost:5984`.
    pub base_url: String,
    /// Database holding every collection.
    pub database: String,
    /// Basic-auth credentials, when the server requires them.
    pub credentials: Option<CouchCredentials>,
    /// How often a watched document is re-read.
    pub watch_interval: Duration,
}

impl CouchConfig {
    /// Read the `COUCH_*` variables.
    ///
    /// `COUCH_BASE_URL` is required; the database defaults to `disc_hold` and
    /// credentials are only used when both `COUCH_USERNAME` and `COUCH_PASSWORD` are set.
    pub fn from_env() -> CouchResult<Self> {
        let base_url =
            env::var("COUCH_BASE_URL").map_err(|_| CouchDaoError::MissingSetting("COUCH_BASE_URL"))?;

        let credentials = match (env::var("COUCH_USERNAME"), env::var("COUCH_PASSWORD")) {
            (Ok(username), Ok(password)) => Some(CouchCredentials { username, password }),
            _ => None,
        };

        let watch_interval = env::var("COUCH_WATCH_INTERVAL_MS")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_WATCH_INTERVAL);

        Ok(Self {
            base_url,
            database: env::var("COUCH_DB").unwrap_or_else(|_| DEFAULT_DATABASE.to_owned()),
            credentials,
            watch_interval,
        })
    }
}
