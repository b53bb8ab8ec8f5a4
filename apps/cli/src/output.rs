//! Output formatting helpers

/// Format a byte count; 0 means the size is unknown.
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "---".to_string();
    }
    human_bytes::human_bytes(bytes as f64)
}

/// Format a transfer speed; 0 shows as idle.
pub fn format_speed(bytes_per_sec: u64) -> String {
    if bytes_per_sec == 0 {
        return "---".to_string();
    }
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec as f64))
}

/// Progress column; an unknown total size has no meaningful percentage.
pub fn format_progress(size: u64, progress: f64) -> String {
    if size == 0 {
        "---".to_string()
    } else {
        format!("{progress}%")
    }
}
