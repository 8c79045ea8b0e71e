/// Per-control topic for the poller.
///
/// - `{uuid}` in `base` is replaced by `uuid`
/// - a trailing `/` gets `uuid` appended
/// - otherwise `uuid` becomes a child level of `base`
pub fn resolve_target_topic(base: &str, uuid: &str) -> String {
    if base.contains("{uuid}") {
        return base.replace("{uuid}", uuid);
    }
    if base.is_empty() || base.ends_with('/') {
        return format!("{}{}", base, uuid);
    }
    format!("{}/{}", base, uuid)
}
