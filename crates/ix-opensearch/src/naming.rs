//! Destination key to index name mapping

pub const DEFAULT_INDEX_PREFIX: &str = "attackframework-tool-burp";

/// The `tool` destination lives in the bare prefix index; every other key gets
/// its own `<prefix>-<key>` index.
pub fn index_name(prefix: &str, destination: &str) -> String {
    if destination == "tool" {
        prefix.to_string()
    } else {
        format!("{}-{}", prefix, destination)
    }
}
