use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

const UNKNOWN_ROOM: &str = "Raum unbekannt";
const UNKNOWN_CATEGORY: &str = "Kategorie unbekannt";

/// Flattened, read-only view of one entry of the `controls` map
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Control {
    pub uuid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub control_type: String,
    pub room: String,
    pub category: String,
    /// Static metadata, sorted by key
    pub details: Vec<(String, String)>,
    /// State name -> raw value (often a state reference), sorted by key
    pub states: Vec<(String, String)>,
    pub links: Vec<String>,
}

/// Summary counters of a structure file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotMetadata {
    pub last_modified: Option<String>,
    pub control_count: usize,
    pub room_count: usize,
    pub category_count: usize,
}

pub fn snapshot_metadata(snapshot: &Value) -> SnapshotMetadata {
    let count = |key: &str| snapshot.get(key).and_then(Value::as_object).map_or(0, Map::len);
    SnapshotMetadata {
        last_modified: snapshot.get("lastModified").map(stringify),
        control_count: count("controls"),
        room_count: count("rooms"),
        category_count: count("cats"),
    }
}

/// Flatten the `controls` map into rows sorted by (room, name, uuid).
///
/// Room and category ids are resolved against `rooms` / `cats`. An id missing
/// from its table yields an empty label; a table entry without a name yields
/// the "unknown" label.
pub fn extract_controls(snapshot: &Value) -> Vec<Control> {
    let rooms = build_lookup(snapshot.get("rooms"), UNKNOWN_ROOM);
    let categories = build_lookup(snapshot.get("cats"), UNKNOWN_CATEGORY);

    let Some(controls) = snapshot.get("controls").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut rows: Vec<Control> = controls
        .iter()
        .filter_map(|(uuid, control)| {
            let Some(control) = control.as_object() else {
                debug!(uuid = %uuid, "Skipping non-object control entry");
                return None;
            };
            Some(Control {
                uuid: uuid.clone(),
                name: text_field(control, "name"),
                control_type: text_field(control, "type"),
                room: lookup_label(&rooms, control.get("room")),
                category: lookup_label(&categories, control.get("cat")),
                details: flatten_mapping(control.get("details")),
                states: flatten_mapping(control.get("states")),
                links: control
                    .get("links")
                    .and_then(Value::as_array)
                    .map(|links| {
                        links
                            .iter()
                            .map(stringify)
                            .filter(|link| !link.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
            })
        })
        .collect();

    rows.sort_by(|a, b| {
        (a.room.to_lowercase(), a.name.to_lowercase(), &a.uuid).cmp(&(
            b.room.to_lowercase(),
            b.name.to_lowercase(),
            &b.uuid,
        ))
    });
    rows
}

fn build_lookup(entries: Option<&Value>, default_label: &str) -> HashMap<String, String> {
    let Some(entries) = entries.and_then(Value::as_object) else {
        return HashMap::new();
    };
    entries
        .iter()
        .map(|(key, payload)| {
            let label = match payload.get("name") {
                Some(name) if !name.is_null() => stringify(name),
                _ => default_label.to_string(),
            };
            (key.clone(), label)
        })
        .collect()
}

fn lookup_label(lookup: &HashMap<String, String>, id: Option<&Value>) -> String {
    id.and_then(Value::as_str)
        .and_then(|id| lookup.get(id))
        .cloned()
        .unwrap_or_default()
}

fn text_field(control: &Map<String, Value>, key: &str) -> String {
    control.get(key).map(stringify).unwrap_or_default()
}

fn flatten_mapping(mapping: Option<&Value>) -> Vec<(String, String)> {
    let Some(mapping) = mapping.and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut flattened: Vec<(String, String)> = mapping
        .iter()
        .map(|(key, value)| (key.clone(), stringify(value)))
        .collect();
    flattened.sort_by_key(|(key, _)| key.to_lowercase());
    flattened
}

/// Render a JSON value for display. Lists join with ", ", maps become `{k: v, ...}`.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items.iter().map(stringify).collect::<Vec<_>>().join(", "),
        Value::Object(map) => {
            let inner = map
                .iter()
                .map(|(k, v)| format!("{}: {}", k, stringify(v)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{{{}}}", inner)
        }
    }
}
