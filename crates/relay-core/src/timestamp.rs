//! Expiration timestamps as stored on actuator records.
//!
//! New values are written as RFC 3339 UTC. Records written by the earlier
//! producers use `2006-01-02 15:04:05.999999 +0000 UTC`; both are accepted on
//! read.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{RelayError, Result};

const LEGACY_LAYOUT: &str = "%Y-%m-%d %H:%M:%S%.f %z";

/// Raw expiration value as the store holds it. Parsed lazily so one bad
/// record does not poison a whole actuator listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpirationStamp(String);

impl ExpirationStamp {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parse(&self) -> Result<DateTime<Utc>> {
        parse_expiration(&self.0)
    }
}

impl fmt::Display for ExpirationStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn parse_expiration(raw: &str) -> Result<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(at.with_timezone(&Utc));
    }

    // Legacy layout ends with a zone abbreviation that chrono cannot parse;
    // the numeric offset before it carries the same information.
    let without_zone = match trimmed.rsplit_once(' ') {
        Some((head, tail)) if tail.chars().all(|c| c.is_ascii_alphabetic()) => head,
        _ => trimmed,
    };
    DateTime::parse_from_str(without_zone, LEGACY_LAYOUT)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|_| RelayError::InvalidTimestamp(raw.to_string()))
}
