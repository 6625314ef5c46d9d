//! Common helper functions for Chips.

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    let millis = chrono::Utc::now().timestamp_millis();
    u64::try_from(millis).unwrap_or(0)
}

/// ISO-8601 timestamp for a millisecond epoch value.
pub fn iso_timestamp(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Returns at most `max_chars` characters of `text`, respecting char boundaries.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
