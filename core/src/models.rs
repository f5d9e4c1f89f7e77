use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Freeform record fields, kept as JSON so the application owns their shape.
pub type Fields = serde_json::Map<String, Value>;

/// A week's meals keyed by day slot (e.g. `"monday-dinner"`).
pub type Meals = BTreeMap<String, Value>;

/// Identifier assigned by whichever backend stored the record.
///
/// The local store hands out millisecond timestamps; the remote store returns
/// server-generated text ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Local(i64),
    Remote(String),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => write!(f, "{id}"),
            Self::Remote(id) => f.write_str(id),
        }
    }
}

impl FromStr for RecordId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.parse::<i64>()
            .map_or_else(|_| Self::Remote(s.to_string()), Self::Local))
    }
}

impl From<RecordId> for Value {
    fn from(id: RecordId) -> Self {
        match id {
            RecordId::Local(n) => Value::from(n),
            RecordId::Remote(s) => Value::String(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Recipe {
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.fields.get("name").and_then(Value::as_str)
    }

    /// The recipe's fields without its backend id, ready to insert elsewhere.
    #[must_use]
    pub fn into_fields(self) -> Fields {
        self.fields
    }
}

/// Monday of a calendar week; the partition key for weekly meal plans.
///
/// Every constructor normalizes, so a `WeekStart` is always a Monday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "NaiveDate", into = "NaiveDate")]
pub struct WeekStart(NaiveDate);

impl WeekStart {
    #[must_use]
    pub fn containing(date: NaiveDate) -> Self {
        Self(normalize_week_start(date))
    }

    /// The week containing today's local date.
    #[must_use]
    pub fn current() -> Self {
        Self::containing(Local::now().date_naive())
    }

    #[must_use]
    pub fn date(self) -> NaiveDate {
        self.0
    }
}

impl From<NaiveDate> for WeekStart {
    fn from(date: NaiveDate) -> Self {
        Self::containing(date)
    }
}

impl From<WeekStart> for NaiveDate {
    fn from(week: WeekStart) -> Self {
        week.0
    }
}

impl fmt::Display for WeekStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for WeekStart {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map(Self::containing)
    }
}

/// Shift a date back to the Monday of its week (Sunday belongs to the week
/// that started six days earlier).
#[must_use]
pub fn normalize_week_start(date: NaiveDate) -> NaiveDate {
    let weekday = date.weekday().num_days_from_sunday();
    let back = if weekday == 0 { 6 } else { weekday - 1 };
    date - Duration::days(i64::from(back))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealPlan {
    pub week_start: WeekStart,
    pub meals: Meals,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: RecordId,
    pub name: String,
    #[serde(default)]
    pub meals: Meals,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub fields: Fields,
}
