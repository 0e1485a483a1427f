//! Coercion helpers for the loosely typed string fields of input rows.
//!
//! Every optional field goes through [`is_nully_str`] first so that empty cells,
//! whitespace and spellings of `NULL` are all treated the same way.

use crate::AuditError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

static HTTP_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^https?://(?:(?:[A-Z0-9](?:[A-Z0-9-]{0,61}[A-Z0-9])?\.)+[A-Z]{2,6}\.?|localhost|\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})(?::\d+)?(?:/?|[/?]\S+)$",
    )
    .expect("static URL pattern compiles")
});

/// A boolean that may also be unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum TriState {
    True,
    False,
    #[default]
    Unknown,
}

impl TriState {
    pub fn as_bool(self) -> Option<bool> {
        match self {
            TriState::True => Some(true),
            TriState::False => Some(false),
            TriState::Unknown => None,
        }
    }
}

impl From<Option<bool>> for TriState {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => TriState::True,
            Some(false) => TriState::False,
            None => TriState::Unknown,
        }
    }
}

/// True for absent values, blank strings and any casing of "null".
pub fn is_nully_str(s: Option<&str>) -> bool {
    match s {
        None => true,
        Some(s) => {
            let trimmed = s.trim();
            trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null")
        }
    }
}

/// Returns the trimmed value, or `None` if it is a null sentinel.
pub fn non_nully(s: Option<&str>) -> Option<&str> {
    if is_nully_str(s) { None } else { s.map(str::trim) }
}

/// Parses spreadsheet-style booleans (`TRUE`/`FALSE`, any case).
pub fn parse_tri_state(s: Option<&str>) -> TriState {
    match non_nully(s) {
        Some(v) if v.eq_ignore_ascii_case("true") => TriState::True,
        Some(v) if v.eq_ignore_ascii_case("false") => TriState::False,
        _ => TriState::Unknown,
    }
}

/// Parses an ISO-8601 timestamp. Values without an offset (with or without a trailing
/// `Z`) are taken as UTC; a bare date means midnight UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, AuditError> {
    let trimmed = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }

    let naive = trimmed.strip_suffix('Z').unwrap_or(trimmed);
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, format) {
            return Ok(dt.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(naive, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc());
        }
    }

    Err(AuditError::malformed(format!("unparseable timestamp {:?}", s)))
}

/// Validates an HTTP(S) URL. Anything that fails validation is treated as absent.
pub fn parse_log_location(s: Option<&str>) -> Option<Url> {
    let candidate = non_nully(s)?;
    if !HTTP_URL.is_match(candidate) {
        return None;
    }
    Url::parse(candidate).ok()
}
