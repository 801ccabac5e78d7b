use std::time::Duration;

use mongodb::{Client, Database, bson::doc, error::Error as MongoError};
use tokio::time::sleep;
use tracing::warn;

use super::{
    config::MongoConfig,
    error::{MongoDaoError, MongoResult},
};

const CONNECT_ATTEMPTS: u32 = 10;
const FIRST_RETRY: Duration = Duration::from_millis(250);
const MAX_RETRY: Duration = Duration::from_secs(5);

/// Build a client and wait until the server answers a ping.
pub async fn open_database(config: &MongoConfig) -> MongoResult<Database> {
    let database = Client::with_options(config.options.clone())
        .map_err(MongoDaoError::Client)?
        .database(&config.database_name);

    let mut attempt = 0;
    let mut wait = FIRST_RETRY;
    loop {
        attempt += 1;
        match ping(&database).await {
            Ok(()) => return Ok(database),
            Err(source) if attempt >= CONNECT_ATTEMPTS => {
                return Err(MongoDaoError::Unreachable {
                    attempts: attempt,
                    source,
                });
            }
            Err(err) => {
                warn!(
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "MongoDB not reachable yet"
                );
                sleep(wait).await;
                wait = (wait * 2).min(MAX_RETRY);
            }
        }
    }
}

/// Round-trip a `ping` command.
pub async fn ping(database: &Database) -> Result<(), MongoError> {
    database.run_command(doc! { "ping": 1 }).await.map(drop)
}
