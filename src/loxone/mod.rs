// Miniserver structure file loading and control extraction

mod controls;
mod fetcher;


pub use controls::{extract_controls, snapshot_metadata, Control, SnapshotMetadata};
pub use fetcher::{is_state_reference, StateFetcher};

use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Where the structure file and live state values come from
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Structure file endpoint, e.g. `http://miniserver/data/LoxAPP3.json`
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Local copy of the structure file, used when no url is set
    #[serde(default)]
    pub json_path: Option<PathBuf>,
    /// Per-reference state endpoint containing a `{uuid}` placeholder
    #[serde(default)]
    pub state_url_template: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            json_path: None,
            state_url_template: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl SourceConfig {
    pub fn is_configured(&self) -> bool {
        self.url.is_some() || self.json_path.is_some()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Basic auth credentials, present when either half is set.
    pub fn auth(&self) -> Option<(String, String)> {
        if self.username.is_none() && self.password.is_none() {
            return None;
        }
        Some((
            self.username.clone().unwrap_or_default(),
            self.password.clone().unwrap_or_default(),
        ))
    }

    /// Configured state template, or one derived from the structure file url.
    ///
    /// `http://host:port/data/LoxAPP3.json` -> `http://host:port/dev/sps/io/{uuid}`
    pub fn state_template(&self) -> Option<String> {
        if let Some(template) = &self.state_url_template {
            return Some(template.clone());
        }
        let url = reqwest::Url::parse(self.url.as_deref()?).ok()?;
        let host = url.host_str()?;
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        Some(format!("{}://{}/dev/sps/io/{{uuid}}", url.scheme(), authority))
    }
}

/// Structure file could not be obtained
#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Neither a url nor a local path is configured
    NotConfigured,
    /// Endpoint answered with a non-success status
    Http { url: String, status: u16 },
    /// Transport failure (connect, timeout, body read)
    Request { url: String, message: String },
    /// Local file could not be read
    Io { path: PathBuf, message: String },
    /// Document is not valid JSON
    Parse { message: String },
}

impl FetchError {
    /// Failures caused by the remote endpoint rather than local setup
    pub fn is_upstream(&self) -> bool {
        matches!(self, FetchError::Http { .. } | FetchError::Request { .. })
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::NotConfigured => {
                write!(f, "no structure file url or local json path configured")
            }
            FetchError::Http { url, status } => {
                write!(f, "request to {} failed with status {}", url, status)
            }
            FetchError::Request { url, message } => {
                write!(f, "request to {} failed: {}", url, message)
            }
            FetchError::Io { path, message } => {
                write!(f, "failed to read {}: {}", path.display(), message)
            }
            FetchError::Parse { message } => write!(f, "invalid structure file: {}", message),
        }
    }
}

impl std::error::Error for FetchError {}
