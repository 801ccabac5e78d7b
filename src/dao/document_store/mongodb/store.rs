use std::{sync::Arc, time::Duration};

use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{
    Collection, Database, IndexModel,
    bson::{Bson, Document, doc},
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::IndexOptions,
};
use serde_json::Value;
use tokio::sync::RwLock;

use super::{
    config::MongoConfig,
    connection::{open_database, ping},
    error::{MongoDaoError, MongoResult},
};
use crate::dao::{
    document_store::{
        ChangeStream, DocumentStore, FieldEquals, FieldValue, UpdateOutcome, WriteMode,
        collections, merge_fields, poll_changes, strip_internal_fields,
    },
    storage::{StorageError, StorageResult},
};

const DUPLICATE_KEY_CODE: i32 = 11000;
const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Secondary indexes on the intake collection: name, then the two indexed fields.
const INTAKE_INDEXES: [(&str, &str, &str); 2] = [
    ("intake_disc_status_idx", "disc_uid", "status"),
    ("intake_store_status_idx", "store_id", "status"),
];

fn field_bson(value: &FieldValue) -> Bson {
    match value {
        FieldValue::Text(text) => Bson::String(text.clone()),
        FieldValue::Integer(number) => Bson::Int64(*number),
    }
}

/// `_id` filter, narrowed by the precondition when there is one.
fn key_filter(key: &str, precondition: Option<&FieldEquals>) -> Document {
    let mut filter = doc! { "_id": key };
    if let Some(test) = precondition {
        filter.insert(test.field, field_bson(&test.value));
    }
    filter
}

fn with_id(key: &str, value: Value) -> Value {
    let mut body = strip_internal_fields(value);
    if let Value::Object(ref mut fields) = body {
        fields.insert("_id".to_owned(), Value::String(key.to_owned()));
    }
    body
}

fn is_duplicate_key(err: &MongoError) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY_CODE
    )
}

/// [`DocumentStore`] over MongoDB: one collection per logical collection, the
/// record key stored as `_id`.
#[derive(Clone)]
pub struct MongoDocumentStore {
    database: Arc<RwLock<Database>>,
    config: Arc<MongoConfig>,
}

impl MongoDocumentStore {
    /// Connect, waiting for the server, and create the intake indexes.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let database = open_database(&config).await?;
        let store = Self {
            database: Arc::new(RwLock::new(database)),
            config: Arc::new(config),
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let intake = self.collection(collections::STORE_INTAKE).await;
        for (name, first, second) in INTAKE_INDEXES {
            let mut keys = Document::new();
            keys.insert(first, 1);
            keys.insert(second, 1);
            let model = IndexModel::builder()
                .keys(keys)
                .options(IndexOptions::builder().name(Some(name.to_owned())).build())
                .build();
            intake
                .create_index(model)
                .await
                .map_err(MongoDaoError::command("create_index", collections::STORE_INTAKE))?;
        }
        Ok(())
    }

    async fn collection(&self, name: &'static str) -> Collection<Value> {
        self.database.read().await.collection::<Value>(name)
    }

    async fn ping(&self) -> MongoResult<()> {
        let database = self.database.read().await.clone();
        ping(&database).await.map_err(MongoDaoError::Ping)
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let database = open_database(&self.config).await?;
        *self.database.write().await = database;
        Ok(())
    }

    async fn find(&self, collection: &'static str, key: &str) -> MongoResult<Option<Value>> {
        let document = self
            .collection(collection)
            .await
            .find_one(key_filter(key, None))
            .await
            .map_err(MongoDaoError::command("find_one", collection))?;
        Ok(document.map(strip_internal_fields))
    }

    async fn insert(&self, collection: &'static str, key: &str, value: Value) -> MongoResult<bool> {
        let handle = self.collection(collection).await;
        match handle.insert_one(with_id(key, value)).await {
            Ok(_) => Ok(true),
            Err(err) if is_duplicate_key(&err) => Ok(false),
            Err(err) => Err(MongoDaoError::command("insert_one", collection)(err)),
        }
    }

    /// Replace the document matching `key` and the precondition; returns whether one matched.
    async fn replace(
        &self,
        collection: &'static str,
        key: &str,
        value: Value,
        precondition: Option<&FieldEquals>,
        upsert: bool,
    ) -> MongoResult<bool> {
        let result = self
            .collection(collection)
            .await
            .replace_one(key_filter(key, precondition), with_id(key, value))
            .upsert(upsert)
            .await
            .map_err(MongoDaoError::command("replace_one", collection))?;
        Ok(result.matched_count > 0 || result.upserted_id.is_some())
    }

    async fn save(
        &self,
        collection: &'static str,
        key: &str,
        value: Value,
        mode: WriteMode,
    ) -> MongoResult<()> {
        let body = match mode {
            WriteMode::Replace => value,
            WriteMode::Merge => match self.find(collection, key).await? {
                Some(mut existing) => {
                    merge_fields(&mut existing, value);
                    existing
                }
                None => value,
            },
        };
        self.replace(collection, key, body, None, true).await?;
        Ok(())
    }

    /// The write-back filters on the precondition too; a writer that changed the
    /// tested field in between leaves nothing to match.
    async fn update_fields(
        &self,
        collection: &'static str,
        key: &str,
        partial: Value,
        precondition: Option<FieldEquals>,
    ) -> MongoResult<UpdateOutcome> {
        let Some(mut existing) = self.find(collection, key).await? else {
            return Ok(UpdateOutcome::Missing);
        };
        if precondition
            .as_ref()
            .is_some_and(|test| !test.matches(&existing))
        {
            return Ok(UpdateOutcome::PreconditionFailed);
        }

        merge_fields(&mut existing, partial);
        let matched = self
            .replace(collection, key, existing, precondition.as_ref(), false)
            .await?;

        Ok(if matched {
            UpdateOutcome::Applied
        } else {
            UpdateOutcome::PreconditionFailed
        })
    }

    async fn remove(
        &self,
        collection: &'static str,
        key: &str,
        precondition: Option<FieldEquals>,
    ) -> MongoResult<bool> {
        let result = self
            .collection(collection)
            .await
            .delete_one(key_filter(key, precondition.as_ref()))
            .await
            .map_err(MongoDaoError::command("delete_one", collection))?;
        Ok(result.deleted_count > 0)
    }

    async fn list_documents(
        &self,
        collection: &'static str,
        filter: Option<FieldEquals>,
    ) -> MongoResult<Vec<Value>> {
        let mut query = Document::new();
        if let Some(test) = &filter {
            query.insert(test.field, field_bson(&test.value));
        }

        let documents: Vec<Value> = self
            .collection(collection)
            .await
            .find(query)
            .await
            .map_err(MongoDaoError::command("find", collection))?
            .try_collect()
            .await
            .map_err(MongoDaoError::command("find", collection))?;

        Ok(documents.into_iter().map(strip_internal_fields).collect())
    }
}

impl DocumentStore for MongoDocumentStore {
    fn get(
        &self,
        collection: &'static str,
        key: &str,
    ) -> BoxFuture<'static, StorageResult<Option<Value>>> {
        let store = self.clone();
        let key = key.to_owned();
        Box::pin(async move { Ok(store.find(collection, &key).await?) })
    }

    fn create(
        &self,
        collection: &'static str,
        key: &str,
        value: Value,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        let key = key.to_owned();
        Box::pin(async move { Ok(store.insert(collection, &key, value).await?) })
    }

    fn set(
        &self,
        collection: &'static str,
        key: &str,
        value: Value,
        mode: WriteMode,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let key = key.to_owned();
        Box::pin(async move { Ok(store.save(collection, &key, value, mode).await?) })
    }

    fn update(
        &self,
        collection: &'static str,
        key: &str,
        partial: Value,
        precondition: Option<FieldEquals>,
    ) -> BoxFuture<'static, StorageResult<UpdateOutcome>> {
        let store = self.clone();
        let key = key.to_owned();
        Box::pin(async move {
            Ok(store
                .update_fields(collection, &key, partial, precondition)
                .await?)
        })
    }

    fn delete(
        &self,
        collection: &'static str,
        key: &str,
        precondition: Option<FieldEquals>,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        let key = key.to_owned();
        Box::pin(async move { Ok(store.remove(collection, &key, precondition).await?) })
    }

    fn list(
        &self,
        collection: &'static str,
        filter: Option<FieldEquals>,
    ) -> BoxFuture<'static, StorageResult<Vec<Value>>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.list_documents(collection, filter).await?) })
    }

    fn watch(&self, collection: &'static str, key: &str) -> ChangeStream {
        let store = self.clone();
        let key = key.to_owned();
        poll_changes(
            move || {
                let store = store.clone();
                let key = key.clone();
                async move { store.find(collection, &key).await.map_err(StorageError::from) }
            },
            WATCH_POLL_INTERVAL,
        )
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.ping().await?) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.reconnect().await?) })
    }
}
