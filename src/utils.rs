//! Utility functions for environment values, list parsing and title normalisation

use std::path::PathBuf;

/// Trim a raw environment value and strip one pair of surrounding quotes.
///
/// `.env` files written by hand often carry `KEY="value"`; the quotes are not
/// part of the value.
pub fn normalize_env_value(raw: &str) -> &str {
    let trimmed = raw.trim();
    let quoted = trimmed.len() >= 2
        && ((trimmed.starts_with('"') && trimmed.ends_with('"'))
            || (trimmed.starts_with('\'') && trimmed.ends_with('\'')));
    if quoted {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    }
}

/// Parse a boolean flag; anything other than a recognised spelling yields `default`.
pub fn parse_bool(raw: Option<&str>, default: bool) -> bool {
    let Some(raw) = raw else {
        return default;
    };
    match normalize_env_value(raw).to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => default,
    }
}

/// Parse a strictly positive integer, falling back to `default` for missing,
/// malformed, zero or negative values.
pub fn parse_positive_u64(raw: Option<&str>, default: u64) -> u64 {
    raw.map(normalize_env_value)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 1.0)
        .map(|v| v.floor() as u64)
        .unwrap_or(default)
}

/// Parse a non-negative integer (zero allowed), falling back to `default`.
pub fn parse_u64(raw: Option<&str>, default: u64) -> u64 {
    raw.map(normalize_env_value)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v.floor() as u64)
        .unwrap_or(default)
}

/// Split a comma separated list, trimming entries and dropping empty ones.
pub fn parse_comma_list(raw: Option<&str>) -> Vec<String> {
    raw.map(normalize_env_value)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Split a platform path list (`:` on Unix, `;` on Windows) into paths.
pub fn parse_path_list(raw: Option<&str>) -> Vec<PathBuf> {
    raw.map(normalize_env_value)
        .map(|v| {
            std::env::split_paths(v)
                .filter(|p| !p.as_os_str().is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Normalise a release title for duplicate detection.
///
/// Lowercases, trims, and collapses internal whitespace runs so that
/// `"Some  Movie "` and `"some movie"` compare equal. Returns `None` when
/// nothing remains, since empty titles never participate in deduplication.
pub fn normalize_title(title: Option<&str>) -> Option<String> {
    let title = title?;
    let normalized = title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Lowercased, trimmed indexer token; empty tokens are dropped.
pub fn normalize_indexer_token(token: &str) -> Option<String> {
    let token = token.trim().to_lowercase();
    if token.is_empty() { None } else { Some(token) }
}
