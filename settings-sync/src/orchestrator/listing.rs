//! Presentation helpers for the backup list.

use crate::transfer::RemoteItem;
use percent_encoding::percent_decode_str;

/// Sort newest first by modification time
pub fn sort_newest_first(items: &mut [RemoteItem]) {
    items.sort_by(|a, b| b.last_modified_ms.cmp(&a.last_modified_ms));
}

/// Name shown for a store key: namespace prefix stripped, percent-decoded
/// when the result is valid UTF-8.
pub fn display_name(namespace: &str, key: &str) -> String {
    let name = key
        .strip_prefix(namespace)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(key);

    match percent_decode_str(name).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => name.to_string(),
    }
}
