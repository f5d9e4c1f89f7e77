use std::path::Path;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, StoreError};
use crate::models::{Fields, MealPlan, Meals, Profile, Recipe, RecordId, Template, WeekStart};
use crate::store::RecordStore;

pub const RECIPES_KEY: &str = "recipes";
pub const MEAL_PLAN_KEY: &str = "mealPlan";
pub const TEMPLATES_KEY: &str = "savedTemplates";
pub const MIGRATED_USERS_KEY: &str = "migratedUsers";

/// Device-local key/value storage holding one JSON blob per collection.
///
/// Nothing here is partitioned by user: whoever uses the device sees the same
/// recipes, the same single "current" meal plan and the same templates.
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = LocalStore {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        tracing::debug!(path = %path.display(), "opened local store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = LocalStore {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

            if version < 1 {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS local_storage (
                        key TEXT PRIMARY KEY NOT NULL,
                        value TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    );

                    PRAGMA user_version = 1;",
                )?;
            }

            Ok(())
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }

    // --- Raw key/value access ---

    pub fn get_item(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| get_item(conn, key))
    }

    pub fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| set_item(conn, key, value))
    }

    pub fn remove_item(&self, key: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM local_storage WHERE key = ?1", params![key])?;
            Ok(n > 0)
        })
    }

    // --- Migration bookkeeping ---

    /// The meal-plan blob as stored, distinguishing "never saved" from "saved empty".
    pub fn stored_meal_plan(&self) -> Result<Option<Meals>> {
        self.with_conn(|conn| read_json(conn, MEAL_PLAN_KEY))
    }

    pub fn is_migrated(&self, user_id: &str) -> Result<bool> {
        let users: Vec<String> = self
            .with_conn(|conn| read_json(conn, MIGRATED_USERS_KEY))?
            .unwrap_or_default();
        Ok(users.iter().any(|u| u == user_id))
    }

    pub fn mark_migrated(&self, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            let mut users: Vec<String> = read_json(conn, MIGRATED_USERS_KEY)?.unwrap_or_default();
            if !users.iter().any(|u| u == user_id) {
                users.push(user_id.to_string());
                write_json(conn, MIGRATED_USERS_KEY, &users)?;
            }
            Ok(())
        })
    }
}

fn get_item(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM local_storage WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

fn set_item(conn: &Connection, key: &str, value: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO local_storage (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now],
    )?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>> {
    match get_item(conn, key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

fn write_json<T: Serialize + ?Sized>(conn: &Connection, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    set_item(conn, key, &raw)
}

/// A millisecond timestamp, bumped past `taken` so two saves in the same
/// millisecond still get distinct ids.
fn next_local_id<'a>(taken: impl Iterator<Item = &'a RecordId>) -> i64 {
    let now = Utc::now().timestamp_millis();
    let max = taken
        .filter_map(|id| match id {
            RecordId::Local(n) => Some(*n),
            RecordId::Remote(_) => None,
        })
        .max();
    match max {
        Some(m) if m >= now => m + 1,
        _ => now,
    }
}

#[async_trait]
impl RecordStore for LocalStore {
    async fn get_recipes(&self) -> Result<Vec<Recipe>> {
        self.with_conn(|conn| Ok(read_json(conn, RECIPES_KEY)?.unwrap_or_default()))
    }

    async fn save_recipe(&self, mut fields: Fields) -> Result<Recipe> {
        fields.remove("id");
        self.with_conn(|conn| {
            let mut recipes: Vec<Recipe> = read_json(conn, RECIPES_KEY)?.unwrap_or_default();
            let id = next_local_id(recipes.iter().map(|r| &r.id));
            let recipe = Recipe {
                id: RecordId::Local(id),
                fields,
            };
            recipes.push(recipe.clone());
            write_json(conn, RECIPES_KEY, &recipes)?;
            Ok(recipe)
        })
    }

    async fn update_recipe(&self, id: &RecordId, updates: Fields) -> Result<Recipe> {
        self.with_conn(|conn| {
            let mut recipes: Vec<Recipe> = read_json(conn, RECIPES_KEY)?.unwrap_or_default();
            let recipe = recipes
                .iter_mut()
                .find(|r| &r.id == id)
                .ok_or_else(|| StoreError::NotFound {
                    kind: "Recipe",
                    id: id.to_string(),
                })?;
            for (key, value) in updates {
                if key != "id" {
                    recipe.fields.insert(key, value);
                }
            }
            let updated = recipe.clone();
            write_json(conn, RECIPES_KEY, &recipes)?;
            Ok(updated)
        })
    }

    async fn delete_recipe(&self, id: &RecordId) -> Result<()> {
        self.with_conn(|conn| {
            let mut recipes: Vec<Recipe> = read_json(conn, RECIPES_KEY)?.unwrap_or_default();
            recipes.retain(|r| &r.id != id);
            write_json(conn, RECIPES_KEY, &recipes)
        })
    }

    async fn get_meal_plan(&self, _week: WeekStart) -> Result<Meals> {
        Ok(self.stored_meal_plan()?.unwrap_or_default())
    }

    async fn save_meal_plan(&self, meals: Meals, week: WeekStart) -> Result<MealPlan> {
        self.with_conn(|conn| write_json(conn, MEAL_PLAN_KEY, &meals))?;
        Ok(MealPlan {
            week_start: week,
            meals,
        })
    }

    async fn get_templates(&self) -> Result<Vec<Template>> {
        self.with_conn(|conn| Ok(read_json(conn, TEMPLATES_KEY)?.unwrap_or_default()))
    }

    async fn save_template(&self, name: &str, meals: Meals) -> Result<Template> {
        self.with_conn(|conn| {
            let mut templates: Vec<Template> = read_json(conn, TEMPLATES_KEY)?.unwrap_or_default();
            let template = Template {
                id: RecordId::Local(next_local_id(templates.iter().map(|t| &t.id))),
                name: name.to_string(),
                meals,
                created_at: Utc::now(),
            };
            templates.push(template.clone());
            write_json(conn, TEMPLATES_KEY, &templates)?;
            Ok(template)
        })
    }

    async fn delete_template(&self, id: &RecordId) -> Result<()> {
        self.with_conn(|conn| {
            let mut templates: Vec<Template> = read_json(conn, TEMPLATES_KEY)?.unwrap_or_default();
            templates.retain(|t| &t.id != id);
            write_json(conn, TEMPLATES_KEY, &templates)
        })
    }

    // Profiles only exist for signed-in users.
    async fn get_profile(&self) -> Result<Option<Profile>> {
        Ok(None)
    }

    async fn save_profile(&self, _fields: Fields) -> Result<Profile> {
        Err(StoreError::Unauthenticated)
    }
}
