//! Cron expression validation and next occurrence calculation.
//!
//! Only the plain 5-field form is accepted:
//!
//! ```text
//! minute hour day-of-month month day-of-week
//! ```
//!
//! where each field is `*`, a single integer inside the field's bounds, or a
//! `*/step` pattern. Ranges, lists, names and `@` shortcuts are rejected.
//! Day-of-week uses `0-6` with Sunday as `0`; `7` is also accepted for Sunday.
//!
//! When both day-of-month and day-of-week are restricted, an occurrence must
//! match both.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while validating a cron expression or timezone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    /// Wrong number of whitespace separated fields.
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),

    /// A field is not `*`, an in-range integer or `*/step`.
    #[error("invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },

    /// Unknown IANA timezone name.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// The expression passed validation but could not be evaluated.
    #[error("unable to evaluate cron expression: {0}")]
    Evaluation(String),
}

/// A single parsed cron field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    /// `*`
    Any,
    /// A single value.
    Value(u32),
    /// `*/step`
    Step(u32),
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const FIELD_SPECS: [FieldSpec; 5] = [
    FieldSpec {
        name: "minute",
        min: 0,
        max: 59,
    },
    FieldSpec {
        name: "hour",
        min: 0,
        max: 23,
    },
    FieldSpec {
        name: "day-of-month",
        min: 1,
        max: 31,
    },
    FieldSpec {
        name: "month",
        min: 1,
        max: 12,
    },
    FieldSpec {
        name: "day-of-week",
        min: 0,
        max: 7,
    },
];

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A validated 5-field cron expression.
#[derive(Clone)]
pub struct CronExpression {
    source: String,
    fields: [CronField; 5],
    schedule: Box<CronSchedule>,
}

impl fmt::Debug for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronExpression")
            .field("source", &self.source)
            .field("fields", &self.fields)
            .finish()
    }
}

impl PartialEq for CronExpression {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl CronExpression {
    /// Parse and validate an expression.
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != FIELD_SPECS.len() {
            return Err(CronError::FieldCount(parts.len()));
        }

        let mut fields = [CronField::Any; 5];
        for (i, (raw, spec)) in parts.iter().zip(FIELD_SPECS.iter()).enumerate() {
            fields[i] = parse_field(raw, spec)?;
        }

        let schedule = CronSchedule::from_str(&to_cron_crate_syntax(&fields))
            .map_err(|e| CronError::Evaluation(e.to_string()))?;

        Ok(Self {
            source: parts.join(" "),
            fields,
            schedule: Box::new(schedule),
        })
    }

    /// The normalized expression (single spaces between fields).
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The parsed fields in `minute hour dom month dow` order.
    pub fn fields(&self) -> &[CronField; 5] {
        &self.fields
    }

    /// First occurrence strictly after `after`, evaluated in `tz`.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz);
        self.schedule
            .after(&local)
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Next `n` occurrences strictly after `after`, evaluated in `tz`.
    pub fn next_n_after(&self, after: DateTime<Utc>, tz: Tz, n: usize) -> Vec<DateTime<Utc>> {
        let local = after.with_timezone(&tz);
        self.schedule
            .after(&local)
            .take(n)
            .map(|dt| dt.with_timezone(&Utc))
            .collect()
    }
}

impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Validate an expression without keeping the parsed form.
pub fn validate_cron(expression: &str) -> Result<(), CronError> {
    CronExpression::parse(expression).map(|_| ())
}

/// Parse an IANA timezone name.
pub fn parse_timezone(timezone: &str) -> Result<Tz, CronError> {
    timezone
        .parse::<Tz>()
        .map_err(|_| CronError::InvalidTimezone(timezone.to_string()))
}

fn parse_field(raw: &str, spec: &FieldSpec) -> Result<CronField, CronError> {
    let invalid = |reason: &str| CronError::InvalidField {
        field: spec.name,
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    if raw == "*" {
        return Ok(CronField::Any);
    }

    if let Some(step) = raw.strip_prefix("*/") {
        let step = parse_number(step).ok_or_else(|| invalid("step is not a number"))?;
        if step == 0 || step > spec.max {
            return Err(invalid(&format!("step must be between 1 and {}", spec.max)));
        }
        return Ok(CronField::Step(step));
    }

    let value = parse_number(raw).ok_or_else(|| invalid("expected '*', a number or '*/step'"))?;
    if value < spec.min || value > spec.max {
        return Err(invalid(&format!(
            "value must be between {} and {}",
            spec.min, spec.max
        )));
    }
    Ok(CronField::Value(value))
}

fn parse_number(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Render the fields in the 6-field (seconds first) syntax of the `cron` crate.
///
/// Day-of-week is emitted as names because the crate numbers weekdays 1-7.
fn to_cron_crate_syntax(fields: &[CronField; 5]) -> String {
    let mut out = vec!["0".to_string()];
    for field in &fields[..4] {
        out.push(match field {
            CronField::Any => "*".to_string(),
            CronField::Value(v) => v.to_string(),
            CronField::Step(s) => format!("*/{}", s),
        });
    }
    out.push(match fields[4] {
        CronField::Any => "*".to_string(),
        CronField::Value(v) => WEEKDAY_NAMES[(v % 7) as usize].to_string(),
        CronField::Step(s) => (0..7)
            .step_by(s as usize)
            .map(|d| WEEKDAY_NAMES[d])
            .collect::<Vec<_>>()
            .join(","),
    });
    out.join(" ")
}
