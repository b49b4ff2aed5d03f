// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::model::Candidate;

/// Date/age rules a candidate must satisfy before it is queued.
///
/// Every constraint is optional and they are AND-combined. An unset
/// constraint imposes nothing; a filter with nothing set accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFilter {
    /// Reject items published longer ago than this
    #[serde(
        default,
        serialize_with = "serialize_age",
        deserialize_with = "deserialize_age",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_age: Option<TimeDelta>,

    /// Reject items published at or after this instant
    #[serde(
        default,
        deserialize_with = "deserialize_instant",
        skip_serializing_if = "Option::is_none"
    )]
    pub before: Option<DateTime<Utc>>,

    /// Reject items published at or before this instant
    #[serde(
        default,
        deserialize_with = "deserialize_instant",
        skip_serializing_if = "Option::is_none"
    )]
    pub after: Option<DateTime<Utc>>,
}

impl DownloadFilter {
    /// True when no constraint is configured
    pub fn is_empty(&self) -> bool {
        self.max_age.is_none() && self.before.is_none() && self.after.is_none()
    }

    /// Evaluate a candidate at time `now`.
    ///
    /// Items without a publish date are rejected as soon as any constraint
    /// is set, since there is nothing to compare against.
    pub fn accept(&self, candidate: &Candidate, now: DateTime<Utc>) -> bool {
        if self.is_empty() {
            return true;
        }

        let Some(published) = candidate.published_at else {
            return false;
        };

        if let Some(max_age) = self.max_age
            && now - published > max_age
        {
            return false;
        }
        if let Some(before) = self.before
            && published >= before
        {
            return false;
        }
        if let Some(after) = self.after
            && published <= after
        {
            return false;
        }
        true
    }
}

/// Filter an optional configuration; `None` accepts everything
pub fn accept(candidate: &Candidate, filter: Option<&DownloadFilter>, now: DateTime<Utc>) -> bool {
    filter.is_none_or(|f| f.accept(candidate, now))
}

/// Parse a `d/h/m/s` duration such as `"24h"`, `"1d12h"` or `"90m 30s"`.
///
/// A bare number is taken as seconds. Negative durations are rejected.
pub fn parse_dhms(input: &str) -> Result<TimeDelta, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(seconds) = trimmed.parse::<u64>() {
        return i64::try_from(seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| format!("duration out of range: {input}"));
    }

    let mut total: i64 = 0;
    let mut digits = String::new();
    for c in trimmed.chars() {
        match c {
            '0'..='9' => digits.push(c),
            'd' | 'h' | 'm' | 's' => {
                let n: i64 = digits
                    .parse()
                    .map_err(|_| format!("missing number before '{c}' in '{input}'"))?;
                digits.clear();
                let unit = match c {
                    'd' => 86_400,
                    'h' => 3_600,
                    'm' => 60,
                    _ => 1,
                };
                total = n
                    .checked_mul(unit)
                    .and_then(|v| total.checked_add(v))
                    .ok_or_else(|| format!("duration out of range: {input}"))?;
            }
            c if c.is_whitespace() => {}
            _ => return Err(format!("unexpected '{c}' in duration '{input}'")),
        }
    }
    if !digits.is_empty() {
        return Err(format!("trailing number without unit in '{input}'"));
    }

    TimeDelta::try_seconds(total).ok_or_else(|| format!("duration out of range: {input}"))
}

/// Format a duration in the compact `d/h/m/s` form accepted by [`parse_dhms`]
pub fn format_dhms(duration: TimeDelta) -> String {
    let total = duration.num_seconds().max(0);
    if total == 0 {
        return "0s".to_string();
    }

    let parts = [
        (total / 86_400, 'd'),
        (total % 86_400 / 3_600, 'h'),
        (total % 3_600 / 60, 'm'),
        (total % 60, 's'),
    ];
    parts
        .iter()
        .filter(|(n, _)| *n > 0)
        .map(|(n, unit)| format!("{n}{unit}"))
        .collect()
}

/// Parse an RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC)
pub fn parse_instant(input: &str) -> Result<DateTime<Utc>, String> {
    let trimmed = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("invalid timestamp '{input}'"))
}

fn serialize_age<S: Serializer>(age: &Option<TimeDelta>, serializer: S) -> Result<S::Ok, S::Error> {
    match age {
        Some(d) => serializer.serialize_str(&format_dhms(*d)),
        None => serializer.serialize_none(),
    }
}

fn deserialize_age<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<TimeDelta>, D::Error> {
    match Option::<String>::deserialize(deserializer)? {
        Some(s) if !s.trim().is_empty() => parse_dhms(&s).map(Some).map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

fn deserialize_instant<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    match Option::<String>::deserialize(deserializer)? {
        Some(s) if !s.trim().is_empty() => parse_instant(&s).map(Some).map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}
