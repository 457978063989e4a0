//! URL list files handed to whoever prints the codes.
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlFile<'a> {
    pub urls: &'a [String],
    pub last_generated: usize,
    pub max_downloads: u32,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
struct NewUrls<'a> {
    urls: &'a [String],
}

/// URLs from a previous run. Both a bare array and `{"urls": [...]}` are
/// accepted; anything unreadable counts as empty.
pub fn previous_urls(raw: &str) -> Vec<String> {
    let list = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items,
        Ok(Value::Object(mut map)) => match map.remove("urls").or_else(|| map.remove("url")) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    list.into_iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(s),
            _ => None,
        })
        .collect()
}

/// Append `new` to the list at `out` and write `new` alone to `new_out`.
/// Returns the combined count.
pub async fn save(
    out: &Path,
    new_out: &Path,
    new: &[String],
    last_generated: usize,
    max_downloads: u32,
) -> Result<usize> {
    let mut combined = match tokio::fs::read_to_string(out).await {
        Ok(raw) => previous_urls(&raw),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    combined.extend_from_slice(new);

    let file = UrlFile {
        urls: &combined,
        last_generated,
        max_downloads,
        updated_at: Utc::now().to_rfc3339(),
    };
    tokio::fs::write(out, serde_json::to_string_pretty(&file)?).await?;
    tokio::fs::write(new_out, serde_json::to_string_pretty(&NewUrls { urls: new })?).await?;

    Ok(combined.len())
}
