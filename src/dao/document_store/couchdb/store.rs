use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;

use crate::dao::{
    document_store::{
        ChangeStream, DocumentStore, FieldEquals, UpdateOutcome, WriteMode, merge_fields,
        poll_changes, strip_internal_fields,
    },
    storage::{StorageError, StorageResult},
};

use super::{
    config::{CouchConfig, CouchCredentials},
    error::{CouchDaoError, CouchResult},
};

/// Highest code point, closing the `_all_docs` key range of a collection.
const END_SUFFIX: &str = "\u{ffff}";
const MAX_CONFLICT_RETRIES: usize = 3;

#[derive(Debug, Deserialize)]
struct AllDocsResponse {
    rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    #[serde(default)]
    doc: Option<Value>,
}

/// Result of a revision-checked PUT.
enum PutOutcome {
    Written,
    Conflict,
}

/// Collections share one database; the collection name prefixes the document id.
fn doc_id(collection: &str, key: &str) -> String {
    format!("{collection}::{key}")
}

fn revision(document: &Value) -> Option<String> {
    document
        .get("_rev")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn with_revision(value: Value, rev: Option<String>) -> Value {
    let mut body = strip_internal_fields(value);
    if let (Value::Object(fields), Some(rev)) = (&mut body, rev) {
        fields.insert("_rev".to_owned(), Value::String(rev));
    }
    body
}

fn unexpected(method: Method, response: &Response) -> CouchDaoError {
    CouchDaoError::Status {
        method,
        target: response.url().path().to_owned(),
        status: response.status(),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> CouchResult<T> {
    let target = response.url().path().to_owned();
    response
        .json::<T>()
        .await
        .map_err(|source| CouchDaoError::Body { target, source })
}

/// [`DocumentStore`] over the CouchDB HTTP API.
///
/// Every write carries the revision it was computed from; CouchDB answers 409
/// when someone else wrote in between, and the write is recomputed from a fresh
/// read.
#[derive(Clone)]
pub struct CouchDocumentStore {
    client: Client,
    base_url: Url,
    database: Arc<str>,
    credentials: Option<Arc<CouchCredentials>>,
    watch_interval: Duration,
}

impl CouchDocumentStore {
    /// Build the client and make sure the database exists.
    pub async fn connect(config: CouchConfig) -> CouchResult<Self> {
        let base_url = Url::parse(&config.base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| CouchDaoError::BaseUrl(config.base_url.clone()))?;

        let store = Self {
            client: Client::builder().build().map_err(CouchDaoError::Client)?,
            base_url,
            database: Arc::from(config.database),
            credentials: config.credentials.map(Arc::new),
            watch_interval: config.watch_interval,
        };

        store.ensure_database().await?;
        Ok(store)
    }

    /// URL of the database, or of one document in it when `doc_id` is given.
    fn url(&self, doc_id: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(&self.database);
            if let Some(doc_id) = doc_id {
                segments.push(doc_id);
            }
        }
        url
    }

    async fn send(&self, method: Method, url: Url, body: Option<&Value>) -> CouchResult<Response> {
        let target = url.path().to_owned();
        let mut request = self.client.request(method.clone(), url);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|source| CouchDaoError::Transport {
                method,
                target,
                source,
            })
    }

    async fn ensure_database(&self) -> CouchResult<()> {
        let response = self.send(Method::GET, self.url(None), None).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                let created = self.send(Method::PUT, self.url(None), None).await?;
                // 412: created concurrently by another instance.
                if created.status().is_success()
                    || created.status() == StatusCode::PRECONDITION_FAILED
                {
                    Ok(())
                } else {
                    Err(unexpected(Method::PUT, &created))
                }
            }
            _ => Err(unexpected(Method::GET, &response)),
        }
    }

    /// Fetch a document with its `_id`/`_rev` still attached.
    async fn get_raw(&self, id: &str) -> CouchResult<Option<Value>> {
        let response = self.send(Method::GET, self.url(Some(id)), None).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => decode(response).await.map(Some),
            _ => Err(unexpected(Method::GET, &response)),
        }
    }

    async fn put_raw(&self, id: &str, body: &Value) -> CouchResult<PutOutcome> {
        let response = self
            .send(Method::PUT, self.url(Some(id)), Some(body))
            .await?;
        match response.status() {
            StatusCode::CONFLICT => Ok(PutOutcome::Conflict),
            status if status.is_success() => Ok(PutOutcome::Written),
            _ => Err(unexpected(Method::PUT, &response)),
        }
    }

    fn gave_up(id: String) -> CouchDaoError {
        CouchDaoError::Conflict {
            doc_id: id,
            attempts: MAX_CONFLICT_RETRIES,
        }
    }

    async fn find(&self, collection: &'static str, key: &str) -> CouchResult<Option<Value>> {
        let raw = self.get_raw(&doc_id(collection, key)).await?;
        Ok(raw.map(strip_internal_fields))
    }

    async fn insert(&self, collection: &'static str, key: &str, value: Value) -> CouchResult<bool> {
        let body = with_revision(value, None);
        Ok(matches!(
            self.put_raw(&doc_id(collection, key), &body).await?,
            PutOutcome::Written
        ))
    }

    async fn save(
        &self,
        collection: &'static str,
        key: &str,
        value: Value,
        mode: WriteMode,
    ) -> CouchResult<()> {
        let id = doc_id(collection, key);
        for _ in 0..MAX_CONFLICT_RETRIES {
            let existing = self.get_raw(&id).await?;
            let rev = existing.as_ref().and_then(revision);
            let body = match (mode, existing) {
                (WriteMode::Merge, Some(existing)) => {
                    let mut merged = strip_internal_fields(existing);
                    merge_fields(&mut merged, value.clone());
                    merged
                }
                _ => value.clone(),
            };

            if let PutOutcome::Written = self.put_raw(&id, &with_revision(body, rev)).await? {
                return Ok(());
            }
        }
        Err(Self::gave_up(id))
    }

    /// The precondition is checked again after every conflict, against the fresh read.
    async fn update_fields(
        &self,
        collection: &'static str,
        key: &str,
        partial: Value,
        precondition: Option<FieldEquals>,
    ) -> CouchResult<UpdateOutcome> {
        let id = doc_id(collection, key);
        for _ in 0..MAX_CONFLICT_RETRIES {
            let Some(existing) = self.get_raw(&id).await? else {
                return Ok(UpdateOutcome::Missing);
            };
            if precondition
                .as_ref()
                .is_some_and(|test| !test.matches(&existing))
            {
                return Ok(UpdateOutcome::PreconditionFailed);
            }

            let rev = revision(&existing);
            let mut merged = strip_internal_fields(existing);
            merge_fields(&mut merged, partial.clone());

            if let PutOutcome::Written = self.put_raw(&id, &with_revision(merged, rev)).await? {
                return Ok(UpdateOutcome::Applied);
            }
        }
        Err(Self::gave_up(id))
    }

    async fn remove(
        &self,
        collection: &'static str,
        key: &str,
        precondition: Option<FieldEquals>,
    ) -> CouchResult<bool> {
        let id = doc_id(collection, key);
        for _ in 0..MAX_CONFLICT_RETRIES {
            let Some(existing) = self.get_raw(&id).await? else {
                return Ok(false);
            };
            if precondition
                .as_ref()
                .is_some_and(|test| !test.matches(&existing))
            {
                return Ok(false);
            }

            let mut url = self.url(Some(&id));
            if let Some(rev) = revision(&existing) {
                url.query_pairs_mut().append_pair("rev", &rev);
            }

            let response = self.send(Method::DELETE, url, None).await?;
            match response.status() {
                StatusCode::NOT_FOUND => return Ok(false),
                StatusCode::CONFLICT => continue,
                status if status.is_success() => return Ok(true),
                _ => return Err(unexpected(Method::DELETE, &response)),
            }
        }
        Err(Self::gave_up(id))
    }

    /// Every document of `collection`, filtered client-side.
    async fn list_documents(
        &self,
        collection: &'static str,
        filter: Option<FieldEquals>,
    ) -> CouchResult<Vec<Value>> {
        let prefix = doc_id(collection, "");
        let mut url = self.url(Some("_all_docs"));
        url.query_pairs_mut()
            .append_pair("include_docs", "true")
            .append_pair("startkey", &Value::String(prefix.clone()).to_string())
            .append_pair(
                "endkey",
                &Value::String(format!("{prefix}{END_SUFFIX}")).to_string(),
            );

        let response = self.send(Method::GET, url, None).await?;
        if !response.status().is_success() {
            return Err(unexpected(Method::GET, &response));
        }
        let payload: AllDocsResponse = decode(response).await?;

        Ok(payload
            .rows
            .into_iter()
            .filter_map(|row| row.doc)
            .map(strip_internal_fields)
            .filter(|doc| filter.as_ref().is_none_or(|test| test.matches(doc)))
            .collect())
    }

    async fn ping(&self) -> CouchResult<()> {
        let response = self.send(Method::GET, self.url(None), None).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(unexpected(Method::GET, &response))
        }
    }
}

impl DocumentStore for CouchDocumentStore {
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
        let every = self.watch_interval;
        poll_changes(
            move || {
                let store = store.clone();
                let key = key.clone();
                async move { store.find(collection, &key).await.map_err(StorageError::from) }
            },
            every,
        )
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.ping().await?) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.ensure_database().await?) })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store(base_url: &str) -> CouchDocumentStore {
        CouchDocumentStore {
            client: Client::new(),
            base_url: Url::parse(base_url).unwrap(),
            database: Arc::from("disc_hold"),
            credentials: None,
            watch_interval: Duration::from_secs(1),
        }
    }

    #[test]
    fn revision_is_carried_over_to_the_new_body() {
        let body = with_revision(json!({"_id": "discs::d1", "owner_id": "p1"}), Some("2-b".into()));
        assert_eq!(body, json!({"owner_id": "p1", "_rev": "2-b"}));
        assert_eq!(revision(&body).as_deref(), Some("2-b"));
    }

    #[test]
    fn document_urls_escape_the_document_id() {
        let store = store("http://couch:5984/");

        assert_eq!(store.url(None).as_str(), "http://couch:5984/disc_hold");
        assert_eq!(
            store.url(Some(&doc_id("store_intake", "store A::d1"))).as_str(),
            "http://couch:5984/disc_hold/store_intake::store%20A::d1"
        );
    }
}
