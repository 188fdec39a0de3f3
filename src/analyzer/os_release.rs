/// Locations of the os-release file, in lookup order.
pub const PATHS: &[&str] = &["etc/os-release", "usr/lib/os-release"];

/// Returns the `<id>:<version_id>` namespace described by an os-release
/// file, e.g. `debian:12`. Falls back to the bare id when there is no
/// version.
pub fn parse_namespace(contents: &str) -> Option<String> {
    let mut id = None;
    let mut version = None;

    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "ID" => id = Some(value.to_lowercase()),
            "VERSION_ID" => version = Some(value.to_string()),
            _ => {}
        }
    }

    let id = id?;
    Some(match version {
        Some(version) => format!("{}:{}", id, version),
        None => id,
    })
}
