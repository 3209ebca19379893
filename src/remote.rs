//! ==============================================================================
//! remote.rs - key/value document store (firebase realtime database)
//! ==============================================================================
//!
//! purpose:
//!     the bridge treats the cloud database as a tree of json documents
//!     addressed by slash-separated paths. `RemoteStore` is that contract;
//!     `FirebaseStore` implements it over the realtime database REST API.
//!
//! rest mapping:
//!     get(path)            -> GET   {url}/{path}.json
//!     set(path, doc)       -> PUT   {url}/{path}.json
//!     update(path, fields) -> PATCH {url}/{path}.json
//!     child(path, key)     -> "{path}/{key}" (then set() to append)
//!
//! authentication:
//!     a database secret is read from the credentials file and passed as the
//!     `auth` query parameter. nothing else about auth lives here.
//!
//! ==============================================================================

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Local;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: &'static str,
        path: String,
        status: u16,
        body: String,
    },
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// document interface the bridge needs from the cloud
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// `None` when nothing is stored at `path`
    async fn get(&self, path: &str) -> RemoteResult<Option<Value>>;
    /// replace the document at `path`
    async fn set(&self, path: &str, document: &Value) -> RemoteResult<()>;
    /// merge top-level fields into the document at `path`
    async fn update(&self, path: &str, fields: &Map<String, Value>) -> RemoteResult<()>;
}

/// path of `key` under `path`
pub fn child(path: &str, key: &str) -> String {
    format!("{}/{}", path.trim_end_matches('/'), key.trim_start_matches('/'))
}

/// `YYYY-MM-DD HH:MM:SS` in local time, the control document's format
pub fn now_string() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Deserialize)]
struct Credentials {
    #[serde(alias = "secret")]
    database_secret: String,
}

/// firebase realtime database over https
pub struct FirebaseStore {
    client: reqwest::Client,
    base_url: String,
    secret: String,
}

impl FirebaseStore {
    pub fn new(database_url: &str, secret: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            client,
            base_url: database_url.trim_end_matches('/').to_string(),
            secret,
        })
    }

    /// read the database secret from a json credentials file
    pub fn from_credentials_file(database_url: &str, path: &Path, timeout: Duration) -> anyhow::Result<Self> {
        if !path.exists() {
            return Err(anyhow!("firebase credentials file '{}' not found", path.display()));
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read credentials file {}", path.display()))?;
        let credentials: Credentials = serde_json::from_str(&content)
            .with_context(|| format!("credentials file {} has no database_secret", path.display()))?;

        Self::new(database_url, credentials.database_secret, timeout)
    }

    fn url(&self, path: &str) -> String {
        let path = path.trim_matches('/');
        if path.is_empty() {
            format!("{}/.json", self.base_url)
        } else {
            format!("{}/{}.json", self.base_url, path)
        }
    }

    async fn check(method: &'static str, path: &str, response: reqwest::Response) -> RemoteResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Status {
            method,
            path: path.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl RemoteStore for FirebaseStore {
    async fn get(&self, path: &str) -> RemoteResult<Option<Value>> {
        let response = self
            .client
            .get(self.url(path))
            .query(&[("auth", &self.secret)])
            .send()
            .await?;
        let value: Value = Self::check("GET", path, response).await?.json().await?;
        Ok(if value.is_null() { None } else { Some(value) })
    }

    async fn set(&self, path: &str, document: &Value) -> RemoteResult<()> {
        let response = self
            .client
            .put(self.url(path))
            .query(&[("auth", &self.secret)])
            .json(document)
            .send()
            .await?;
        Self::check("PUT", path, response).await?;
        Ok(())
    }

    async fn update(&self, path: &str, fields: &Map<String, Value>) -> RemoteResult<()> {
        let response = self
            .client
            .patch(self.url(path))
            .query(&[("auth", &self.secret)])
            .json(fields)
            .send()
            .await?;
        Self::check("PATCH", path, response).await?;
        Ok(())
    }
}

/// check that the database rules allow this bridge to read and write
///
/// only logs; a failing check does not stop startup.
pub async fn check_connectivity(store: &dyn RemoteStore) {
    tracing::info!("testing firebase connectivity...");
    match store.get("/test").await {
        Ok(data) => tracing::info!("read test successful, data: {:?}", data),
        Err(e) => tracing::warn!("read test failed: {}", e),
    }

    let marker = json!({ "test_value": "test", "timestamp": now_string() });
    match store.set("/test", &marker).await {
        Ok(()) => tracing::info!("write test successful"),
        Err(e) => {
            tracing::warn!("write test failed: {}", e);
            tracing::warn!("the database rules are probably restricting access; check them in the firebase console");
        }
    }
}

// ==============================================================================
// in-memory store for tests
// ==============================================================================
#[cfg(test)]
pub mod memory {
    use super::*;
    use std::sync::Mutex;

    /// a json tree with firebase path semantics, plus a call log
    #[derive(Default)]
    pub struct MemoryStore {
        root: Mutex<Value>,
        pub calls: Mutex<Vec<String>>,
        pub fail: Mutex<bool>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self { root: Mutex::new(Value::Object(Map::new())), ..Default::default() }
        }

        pub fn with(path: &str, value: Value) -> Self {
            let store = Self::new();
            store.put(path, value);
            store
        }

        pub fn put(&self, path: &str, value: Value) {
            let mut root = self.root.lock().unwrap();
            *node_mut(&mut root, path) = value;
        }

        pub fn read(&self, path: &str) -> Value {
            let root = self.root.lock().unwrap();
            segments(path)
                .try_fold(&*root, |node, key| node.get(key))
                .cloned()
                .unwrap_or(Value::Null)
        }

        pub fn set_failing(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) -> RemoteResult<()> {
            self.calls.lock().unwrap().push(call.clone());
            if *self.fail.lock().unwrap() {
                return Err(RemoteError::Status {
                    method: "TEST",
                    path: call,
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            Ok(())
        }
    }

    fn segments(path: &str) -> impl Iterator<Item = &str> {
        path.split('/').filter(|s| !s.is_empty())
    }

    fn node_mut<'a>(root: &'a mut Value, path: &str) -> &'a mut Value {
        segments(path).fold(root, |node, key| {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            match node {
                Value::Object(object) => object.entry(key.to_string()).or_insert(Value::Null),
                _ => unreachable!("replaced with an object above"),
            }
        })
    }

    #[async_trait]
    impl RemoteStore for MemoryStore {
        async fn get(&self, path: &str) -> RemoteResult<Option<Value>> {
            self.record(format!("get {path}"))?;
            let value = self.read(path);
            Ok(if value.is_null() { None } else { Some(value) })
        }

        async fn set(&self, path: &str, document: &Value) -> RemoteResult<()> {
            self.record(format!("set {path}"))?;
            self.put(path, document.clone());
            Ok(())
        }

        async fn update(&self, path: &str, fields: &Map<String, Value>) -> RemoteResult<()> {
            self.record(format!("update {path}"))?;
            let mut root = self.root.lock().unwrap();
            let node = node_mut(&mut root, path);
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Some(object) = node.as_object_mut() {
                for (k, v) in fields {
                    object.insert(k.clone(), v.clone());
                }
            }
            Ok(())
        }
    }
}
