//! Minimal JSON-over-HTTP transport used by the directory and aggregator clients.
//!
//! The clients only ever issue authenticated `GET`s and read JSON back, so the
//! seam is a single method. `HttpTransport` is the reqwest-backed implementation;
//! tests substitute an in-memory one.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::Value;
use tracing::debug;

use crate::errors::AdapterError;

#[async_trait]
pub trait RestTransport: Send + Sync {
    fn base_url(&self) -> &str;

    fn has_api_key(&self) -> bool;

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value, AdapterError>;
}

/// Maps non-success statuses onto the adapter error taxonomy.
pub(crate) async fn check_status(response: Response) -> Result<Response, AdapterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status.as_u16() {
        401 | 403 => AdapterError::Auth(body),
        404 => AdapterError::NotFound(body),
        code => AdapterError::Http { status: code, body },
    })
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AdapterError::Transport(format!("Cannot build HTTP client: {}", err)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl RestTransport for HttpTransport {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value, AdapterError> {
        let url = self.url(path);
        debug!("GET {}", url);
        let mut request = self.client.get(&url).query(query);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = check_status(request.send().await?).await?;
        Ok(response.json::<Value>().await?)
    }
}

/// In-memory transport for tests, here and in crates depending on this one
/// (through the `test-support` feature).
#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Serves canned responses keyed by path and records the calls made.
    #[derive(Default)]
    pub struct FakeTransport {
        responses: Mutex<HashMap<String, Value>>,
        calls: Mutex<Vec<String>>,
        failing: AtomicBool,
        api_key: bool,
    }

    impl FakeTransport {
        pub fn with(self, path: &str, value: Value) -> Self {
            self.set(path, value);
            self
        }

        pub fn with_api_key(self) -> Self {
            Self { api_key: true, ..self }
        }

        pub fn set(&self, path: &str, value: Value) {
            if let Ok(mut responses) = self.responses.lock() {
                responses.insert(path.to_string(), value);
            }
        }

        /// Makes every later call fail with a transport error, or stop failing.
        pub fn fail(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn total_hits(&self) -> usize {
            self.calls.lock().map(|calls| calls.len()).unwrap_or_default()
        }

        /// Calls made to `path`, query string included.
        pub fn hits_for(&self, path: &str) -> usize {
            self.calls
                .lock()
                .map(|calls| calls.iter().filter(|c| c.as_str() == path).count())
                .unwrap_or_default()
        }

        pub fn last_call(&self) -> Option<String> {
            self.calls.lock().ok().and_then(|calls| calls.last().cloned())
        }
    }

    #[async_trait]
    impl RestTransport for FakeTransport {
        fn base_url(&self) -> &str {
            "http://fake.invalid"
        }

        fn has_api_key(&self) -> bool {
            self.api_key
        }

        async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value, AdapterError> {
            let rendered = if query.is_empty() {
                path.to_string()
            } else {
                let pairs: Vec<String> = query.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                format!("{}?{}", path, pairs.join("&"))
            };
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(rendered);
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(AdapterError::Transport("connection refused".to_string()));
            }
            self.responses
                .lock()
                .ok()
                .and_then(|responses| responses.get(path).cloned())
                .ok_or_else(|| AdapterError::NotFound(path.to_string()))
        }
    }
}
