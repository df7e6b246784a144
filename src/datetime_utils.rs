use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

/// Common date/time formats used throughout the application
pub mod formats {
    /// Format of `created_at` in v1.1 API payloads: "Wed Oct 10 20:19:24 +0000 2018"
    pub const TWITTER_CREATED_AT: &str = "%a %b %d %H:%M:%S %z %Y";

    /// Human-readable format for display: "2024-01-20 15:30:00"
    pub const DISPLAY_FULL: &str = "%Y-%m-%d %H:%M:%S";
}

/// Parse a `created_at` value from the v1.1 API
pub fn parse_twitter_date(date_str: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_str(date_str, formats::TWITTER_CREATED_AT)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse Twitter date: {date_str}"))
}

/// Format a datetime for human-readable display
pub fn format_for_display(datetime: &DateTime<Utc>) -> String {
    datetime.format(formats::DISPLAY_FULL).to_string()
}

/// Reformat a tweet's `created_at` for display, keeping the raw value if it
/// does not parse
pub fn display_tweet_date(created_at: &str) -> String {
    parse_twitter_date(created_at)
        .map(|dt| format_for_display(&dt))
        .unwrap_or_else(|_| created_at.to_string())
}

/// Get current UTC timestamp
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}
