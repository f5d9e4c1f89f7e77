use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use serde_json::Value;
use tabled::{
    Table, Tabled,
    settings::{Style, Width},
};

use mealplan_core::models::{Fields, Meals, Recipe, RecordId, WeekStart};

/// Parse an id as given on the command line. Numbers are local ids.
pub(crate) fn parse_id(s: &str) -> RecordId {
    let Ok(id) = s.trim().parse::<RecordId>();
    id
}

/// Parse a week key. Any date works; it is moved back to its Monday.
/// Accepts YYYY-MM-DD or today/last/next.
pub(crate) fn parse_week(week: Option<&str>) -> Result<Option<WeekStart>> {
    let Some(s) = week else {
        return Ok(None);
    };
    let today = Local::now().date_naive();
    let date = match s {
        "today" | "this" => today,
        "last" => today - chrono::Duration::days(7),
        "next" => today + chrono::Duration::days(7),
        _ => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").with_context(|| {
            format!("Invalid week '{s}'. Use YYYY-MM-DD or this/last/next")
        })?,
    };
    Ok(Some(WeekStart::containing(date)))
}

/// Value of a `key=value` pair: JSON if it parses, otherwise the raw text.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn split_pair(pair: &str) -> Result<(&str, &str)> {
    let Some((key, value)) = pair.split_once('=') else {
        bail!("Invalid field '{pair}'. Use key=value");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("Invalid field '{pair}'. Key must not be empty");
    }
    Ok((key, value))
}

/// Build record fields from an optional JSON object plus `key=value` pairs.
/// Pairs win over keys in the JSON.
pub(crate) fn parse_fields(data: Option<&str>, pairs: &[String]) -> Result<Fields> {
    let mut fields = match data {
        Some(raw) => match serde_json::from_str::<Value>(raw).context("Invalid --data JSON")? {
            Value::Object(map) => map,
            _ => bail!("--data must be a JSON object"),
        },
        None => Fields::new(),
    };
    for pair in pairs {
        let (key, value) = split_pair(pair)?;
        fields.insert(key.to_string(), parse_value(value));
    }
    Ok(fields)
}

/// Build a meals mapping from an optional JSON object plus `slot=meal` pairs.
pub(crate) fn parse_meals(data: Option<&str>, pairs: &[String]) -> Result<Meals> {
    Ok(parse_fields(data, pairs)?.into_iter().collect())
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

/// One-line rendering of a JSON value for tables.
pub(crate) fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

pub(crate) fn print_recipe_table(recipes: &[Recipe]) {
    #[derive(Tabled)]
    struct RecipeRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Details")]
        details: String,
    }

    let rows: Vec<RecipeRow> = recipes
        .iter()
        .map(|r| RecipeRow {
            id: r.id.to_string(),
            name: truncate(r.name().unwrap_or("(unnamed)"), 35),
            details: truncate(
                &r.fields
                    .iter()
                    .filter(|(k, _)| {
                        !matches!(
                            k.as_str(),
                            "name" | "user_id" | "created_at" | "updated_at"
                        )
                    })
                    .map(|(k, v)| format!("{k}: {}", display_value(v)))
                    .collect::<Vec<_>>()
                    .join(", "),
                60,
            ),
        })
        .collect();

    let table = Table::new(&rows).with(Style::rounded()).to_string();
    println!("{table}");
}

pub(crate) fn print_meals_table(meals: &Meals) {
    #[derive(Tabled)]
    struct MealRow {
        #[tabled(rename = "Slot")]
        slot: String,
        #[tabled(rename = "Meal")]
        meal: String,
    }

    let rows: Vec<MealRow> = meals
        .iter()
        .map(|(slot, meal)| MealRow {
            slot: slot.clone(),
            meal: display_value(meal),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Width::truncate(100).suffix("..."))
        .to_string();
    println!("{table}");
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
