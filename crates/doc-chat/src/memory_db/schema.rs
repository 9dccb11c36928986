//! Database schema definitions for session storage

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};

pub const SCHEMA_SQL: &str = include_str!("migrations/001_initial.sql");

/// Fixed-width UTC timestamps so that text ordering matches time ordering.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Failed to parse timestamp {}", value))?
        .with_timezone(&Utc))
}
