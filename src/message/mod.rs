//! Outbound payloads for enabled controls.
//!
//! Wire format is the display-device envelope `{"text": "<name>: <values>"}`.
//! State values are joined with ", "; when a control has no states its details
//! are rendered as `key: value` pairs instead.

use crate::loxone::Control;
use async_trait::async_trait;
use serde_json::json;

/// Text used when a control has neither states nor details
pub const NO_DATA_TEXT: &str = "no data available";

/// Payload that tells a display to drop the entry for a control
pub const CLEAR_PAYLOAD: &str = "{}";

/// Resolves a raw state value (usually a state reference) to display text
#[async_trait]
pub trait StateResolver: Send + Sync {
    async fn resolve(&self, candidate: &str) -> Option<String>;
}

/// Human readable line, e.g. `Speichertemperatur: 59°`
pub async fn format_text(control: &Control, resolver: Option<&dyn StateResolver>) -> String {
    let body = if !control.states.is_empty() {
        let mut values = Vec::with_capacity(control.states.len());
        for (_, raw) in &control.states {
            let resolved = match resolver {
                Some(resolver) => resolver.resolve(raw).await.filter(|v| !v.is_empty()),
                None => None,
            };
            values.push(resolved.unwrap_or_else(|| raw.clone()));
        }
        values.join(", ")
    } else if !control.details.is_empty() {
        control
            .details
            .iter()
            .map(|(key, value)| format!("{}: {}", key, value))
            .collect::<Vec<_>>()
            .join(", ")
    } else {
        NO_DATA_TEXT.to_string()
    };

    let name = control.name.trim();
    if name.is_empty() {
        body
    } else {
        format!("{}: {}", name, body)
    }
}

/// JSON envelope published for a control
pub async fn format_message(control: &Control, resolver: Option<&dyn StateResolver>) -> String {
    json!({ "text": format_text(control, resolver).await }).to_string()
}
