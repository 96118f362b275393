//! Console formatting helpers.

use comfy_table::{ContentArrangement, Table};
use layerscan_core::message::ResultMessage;

/// Create a borderless table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a timestamp relative to now ("3 days ago").
pub fn format_ago(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let duration = chrono::Utc::now().signed_duration_since(*dt);

    let secs = duration.num_seconds();
    if secs < 0 {
        return "just now".to_string();
    }
    if secs < 60 {
        return format!("{secs} seconds ago");
    }

    let mins = duration.num_minutes();
    if mins < 60 {
        return format!("{mins} minutes ago");
    }

    let hours = duration.num_hours();
    if hours < 24 {
        return format!("{hours} hours ago");
    }

    let days = duration.num_days();
    if days < 30 {
        return format!("{days} days ago");
    }
    if days < 365 {
        return format!("{} months ago", days / 30);
    }
    format!("{} years ago", days / 365)
}

/// Format a unix timestamp relative to now.
pub fn format_unix_ago(secs: i64) -> String {
    match chrono::DateTime::from_timestamp(secs, 0) {
        Some(dt) => format_ago(&dt),
        None => "unknown".to_string(),
    }
}

/// Short form of an image id: digest algorithm dropped, 12 hex chars.
pub fn short_id(id: &str) -> &str {
    let hex = id.split_once(':').map(|(_, hex)| hex).unwrap_or(id);
    hex.get(..12).unwrap_or(hex)
}

/// One console line per scan result.
pub fn result_line(result: &ResultMessage) -> String {
    format!(
        "Result for scan '{}' type '{}' OID '{}' value '{}'",
        result.scan_id, result.result_type, result.oid, result.value
    )
}
