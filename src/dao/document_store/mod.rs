/// CouchDB backend.
#[cfg(feature = "couch-store")]
pub mod couchdb;
pub mod memory;
/// MongoDB backend.
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use std::{future::Future, time::Duration};

use futures::{future::BoxFuture, stream::BoxStream};
use serde_json::Value;
use tokio::time::{MissedTickBehavior, interval};

use crate::dao::storage::StorageResult;

/// Collection names shared by every backend.
pub mod collections {
    /// Ownership records keyed by disc uid.
    pub const DISCS: &str = "discs";
    /// Printed QR codes.
    pub const QR_CODES: &str = "qr_codes";
    /// Hold records keyed by `{store_id}::{disc_uid}`.
    pub const STORE_INTAKE: &str = "store_intake";
    /// Per-disc hold claims keyed by disc uid.
    pub const DISC_HOLDS: &str = "disc_holds";
    /// Mailboxes keyed by user id.
    pub const NOTIFICATIONS: &str = "notifications";
    /// Player profiles keyed by user id.
    pub const PLAYERS: &str = "players";
}

/// Stream of successive values of a watched document; `None` means it is absent.
pub type ChangeStream = BoxStream<'static, StorageResult<Option<Value>>>;

/// Whether `set` replaces the stored document or merges top-level fields into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Overwrite the whole document.
    Replace,
    /// Merge top-level fields into the existing document.
    Merge,
}

/// Scalar compared against a top-level document field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// String value.
    Text(String),
    /// Integer value.
    Integer(i64),
}

/// Equality test on a top-level field, used both as a write precondition and a list filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldEquals {
    /// Top-level field name.
    pub field: &'static str,
    /// Expected value.
    pub value: FieldValue,
}

impl FieldEquals {
    /// Test a string field.
    pub fn text(field: &'static str, value: impl Into<String>) -> Self {
        Self {
            field,
            value: FieldValue::Text(value.into()),
        }
    }

    /// Test an integer field.
    pub fn integer(field: &'static str, value: i64) -> Self {
        Self {
            field,
            value: FieldValue::Integer(value),
        }
    }

    /// Evaluate the test against a document body.
    pub fn matches(&self, document: &Value) -> bool {
        let Some(actual) = document.get(self.field) else {
            return false;
        };
        match &self.value {
            FieldValue::Text(expected) => actual.as_str() == Some(expected.as_str()),
            FieldValue::Integer(expected) => actual.as_i64() == Some(*expected),
        }
    }
}

/// Result of a conditional partial update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The write landed.
    Applied,
    /// No document exists under the key.
    Missing,
    /// The document exists but the precondition did not hold.
    PreconditionFailed,
}

/// Backend-agnostic document storage addressed by collection and key.
///
/// Documents are JSON objects. Every conditional write is atomic with respect
/// to its precondition.
pub trait DocumentStore: Send + Sync {
    /// Fetch a document, `None` when absent.
    fn get(&self, collection: &'static str, key: &str)
    -> BoxFuture<'static, StorageResult<Option<Value>>>;
    /// Insert `value` only when nothing exists under `key`; returns whether it was inserted.
    fn create(
        &self,
        collection: &'static str,
        key: &str,
        value: Value,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    /// Write a document, creating it if needed.
    fn set(
        &self,
        collection: &'static str,
        key: &str,
        value: Value,
        mode: WriteMode,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Merge the top-level fields of `partial` into an existing document.
    fn update(
        &self,
        collection: &'static str,
        key: &str,
        partial: Value,
        precondition: Option<FieldEquals>,
    ) -> BoxFuture<'static, StorageResult<UpdateOutcome>>;
    /// Remove a document; returns whether this call removed it.
    fn delete(
        &self,
        collection: &'static str,
        key: &str,
        precondition: Option<FieldEquals>,
    ) -> BoxFuture<'static, StorageResult<bool>>;
    /// Documents of a collection, optionally filtered on one field.
    fn list(
        &self,
        collection: &'static str,
        filter: Option<FieldEquals>,
    ) -> BoxFuture<'static, StorageResult<Vec<Value>>>;
    /// Current value of the document followed by every subsequent change.
    fn watch(&self, collection: &'static str, key: &str) -> ChangeStream;
    /// Check that the backend answers.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    /// Re-establish the backend connection.
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}

/// Shallow merge of `partial` into `target`; non-object inputs replace the target.
pub fn merge_fields(target: &mut Value, partial: Value) {
    match (target, partial) {
        (Value::Object(existing), Value::Object(fields)) => {
            for (field, value) in fields {
                existing.insert(field, value);
            }
        }
        (target, partial) => *target = partial,
    }
}

/// Drop backend bookkeeping fields (`_id`, `_rev`) from a stored body.
pub fn strip_internal_fields(mut value: Value) -> Value {
    if let Value::Object(ref mut fields) = value {
        fields.retain(|name, _| !name.starts_with('_'));
    }
    value
}

/// Build a [`ChangeStream`] for backends without push notifications by re-reading
/// the document every `every` and yielding only when it changed.
pub fn poll_changes<F, Fut>(mut fetch: F, every: Duration) -> ChangeStream
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = StorageResult<Option<Value>>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<Option<Value>> = None;

        loop {
            ticker.tick().await;
            match fetch().await {
                Ok(current) => {
                    if last.as_ref() != Some(&current) {
                        last = Some(current.clone());
                        yield Ok(current);
                    }
                }
                Err(err) => {
                    yield Err(err);
                    break;
                }
            }
        }
    })
}
