//! Shared formatting helpers for CLI tables.

use chrono::{DateTime, Utc};

/// Truncate to `max` characters, marking the cut with an ellipsis.
pub fn truncate(s: &str, max: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max {
        s.to_string()
    } else {
        format!("{}…", s.chars().take(max.saturating_sub(1)).collect::<String>())
    }
}

/// Render a unix timestamp as `YYYY-MM-DD HH:MM UTC`.
pub fn timestamp(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map_or_else(|| ts.to_string(), |t| t.format("%Y-%m-%d %H:%M UTC").to_string())
}

/// Comma-joined id list, `-` when empty.
pub fn id_list<T: ToString>(ids: impl IntoIterator<Item = T>) -> String {
    let joined: Vec<String> = ids.into_iter().map(|id| id.to_string()).collect();
    if joined.is_empty() {
        "-".to_string()
    } else {
        joined.join(",")
    }
}
