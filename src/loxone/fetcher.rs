use super::{FetchError, SourceConfig};
use crate::message::StateResolver;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Loads the structure file and resolves live state values.
///
/// Resolved values are cached for the lifetime of the fetcher and never
/// invalidated. Create one fetcher per poll cycle / request.
pub struct StateFetcher {
    source: SourceConfig,
    state_template: Option<String>,
    http_client: Client,
    state_cache: Mutex<HashMap<String, Option<String>>>,
}

impl StateFetcher {
    pub fn new(source: SourceConfig) -> Result<Self, FetchError> {
        let http_client = Client::builder()
            .user_agent("loxbridge/0.1")
            .timeout(source.timeout())
            .build()
            .map_err(|e| FetchError::Request {
                url: source.url.clone().unwrap_or_default(),
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            state_template: source.state_template(),
            source,
            http_client,
            state_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source
    }

    /// Load the structure file from the configured url, else from the local path.
    pub async fn load(&self) -> Result<Value, FetchError> {
        if let Some(url) = &self.source.url {
            debug!(url = %url, "Fetching structure file");
            let response = self
                .authorized(self.http_client.get(url))
                .send()
                .await
                .map_err(|e| FetchError::Request {
                    url: url.clone(),
                    message: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Http {
                    url: url.clone(),
                    status: status.as_u16(),
                });
            }

            let body = response.text().await.map_err(|e| FetchError::Request {
                url: url.clone(),
                message: e.to_string(),
            })?;
            return parse_document(&body);
        }

        let Some(path) = &self.source.json_path else {
            return Err(FetchError::NotConfigured);
        };

        debug!(path = %path.display(), "Reading structure file");
        let body = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| FetchError::Io {
                path: path.clone(),
                message: e.to_string(),
            })?;
        parse_document(&body)
    }

    /// Resolve a state reference to its current value.
    ///
    /// Returns `None` without any request when `candidate` is not a canonical
    /// uuid or no state endpoint is configured. Request failures are returned
    /// (and cached) as a descriptive string rather than an error.
    pub async fn resolve_state_value(&self, candidate: &str) -> Option<String> {
        if candidate.is_empty() {
            return None;
        }

        let cached = self.state_cache.lock().unwrap().get(candidate).cloned();
        if let Some(cached) = cached {
            return cached;
        }

        let template = match &self.state_template {
            Some(template) if is_state_reference(candidate) => template,
            _ => {
                self.cache(candidate, None);
                return None;
            }
        };

        let url = template.replace("{uuid}", &urlencoding::encode(candidate));
        let resolved = match self.request_state(&url).await {
            Ok(value) => value,
            Err(message) => {
                warn!(url = %url, error = %message, "State request failed");
                format!("state request failed ({}): {}", url, message)
            }
        };

        self.cache(candidate, Some(resolved.clone()));
        Some(resolved)
    }

    async fn request_state(&self, url: &str) -> Result<String, String> {
        let response = self
            .authorized(self.http_client.get(url))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP status {}", status));
        }

        let body = response.text().await.map_err(|e| e.to_string())?;
        let extracted = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|data| extract_state_payload(&data));

        Ok(match extracted {
            Some(Value::String(s)) => s,
            // Structured values are kept as compact JSON
            Some(value) => value.to_string(),
            None => body.trim().to_string(),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.source.auth() {
            Some((username, password)) => request.basic_auth(username, Some(password)),
            None => request,
        }
    }

    fn cache(&self, candidate: &str, value: Option<String>) {
        self.state_cache
            .lock()
            .unwrap()
            .insert(candidate.to_string(), value);
    }

    /// Number of cached resolutions (including negative ones)
    pub fn cached_count(&self) -> usize {
        self.state_cache.lock().unwrap().len()
    }
}

#[async_trait]
impl StateResolver for StateFetcher {
    async fn resolve(&self, candidate: &str) -> Option<String> {
        self.resolve_state_value(candidate).await
    }
}

/// Canonical hyphenated uuid (8-4-4-4-12 hex groups)
pub fn is_state_reference(candidate: &str) -> bool {
    candidate.len() == 36 && Uuid::try_parse(candidate).is_ok()
}

fn parse_document(body: &str) -> Result<Value, FetchError> {
    serde_json::from_str(body).map_err(|e| FetchError::Parse {
        message: e.to_string(),
    })
}

/// Pull the scalar out of a state response envelope.
///
/// Precedence: `value` / `val` / `state` key, then the `LL` wrapper, then the
/// first sub-value that yields something. `None` means nothing usable (null).
pub(crate) fn extract_state_payload(payload: &Value) -> Option<Value> {
    match payload {
        Value::Null => None,
        Value::Object(map) => {
            for key in ["value", "val", "state"] {
                if let Some(candidate) = map.get(key) {
                    return match candidate {
                        Value::Object(_) | Value::Array(_) => extract_state_payload(candidate),
                        Value::Null => None,
                        scalar => Some(scalar.clone()),
                    };
                }
            }

            if let Some(nested) = map.get("LL").filter(|v| !v.is_null()) {
                return extract_state_payload(nested);
            }

            map.values()
                .find_map(extract_state_payload)
                .or_else(|| Some(payload.clone()))
        }
        Value::Array(items) => items
            .iter()
            .find_map(extract_state_payload)
            .or_else(|| Some(payload.clone())),
        scalar => Some(scalar.clone()),
    }
}
