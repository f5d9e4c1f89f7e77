//! Remote, multi-tenant record storage.
//!
//! [`RemoteStore`] is user-agnostic; [`RemoteStore::scoped`] binds it to one
//! identity and every row it reads or writes is filtered or stamped with that
//! identity's id.

mod client;
#[cfg(any(test, feature = "test-util"))]
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use client::{
    AuthChange, AuthClient, AuthEvent, AuthSession, Connector, Query, RemoteBackend,
    RemoteClient, SignUpResponse,
};
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryBackend;

use crate::error::{BackendError, Result};
use crate::models::{
    Fields, Identity, MealPlan, Meals, Profile, Recipe, RecordId, Template, WeekStart,
};
use crate::store::RecordStore;

pub const PROFILES_TABLE: &str = "user_profiles";
pub const RECIPES_TABLE: &str = "recipes";
pub const MEAL_PLANS_TABLE: &str = "meal_plans";
pub const TEMPLATES_TABLE: &str = "meal_templates";

#[derive(Clone)]
pub struct RemoteStore {
    client: Arc<dyn RemoteClient>,
}

impl RemoteStore {
    #[must_use]
    pub fn new(client: Arc<dyn RemoteClient>) -> Self {
        Self { client }
    }

    #[must_use]
    pub fn scoped(&self, user: Identity) -> UserScope {
        UserScope {
            client: Arc::clone(&self.client),
            user,
        }
    }
}

/// [`RemoteStore`] bound to a single user.
pub struct UserScope {
    client: Arc<dyn RemoteClient>,
    user: Identity,
}

impl UserScope {
    #[must_use]
    pub fn user(&self) -> &Identity {
        &self.user
    }

    fn owned(&self) -> Query {
        Query::new().eq("user_id", self.user.id.clone())
    }

    fn owned_row(&self, id: &RecordId) -> Query {
        self.owned().eq("id", id.clone())
    }

    fn stamp(&self, mut row: Fields) -> Fields {
        row.insert("user_id".to_string(), Value::String(self.user.id.clone()));
        row
    }
}

fn decode<T: DeserializeOwned>(row: Fields) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

fn decode_all<T: DeserializeOwned>(rows: Vec<Fields>) -> Result<Vec<T>> {
    rows.into_iter().map(decode).collect()
}

fn now() -> Value {
    Value::String(Utc::now().to_rfc3339())
}

#[async_trait]
impl RecordStore for UserScope {
    async fn get_recipes(&self) -> Result<Vec<Recipe>> {
        let query = self.owned().order_desc("created_at");
        let rows = self.client.select(RECIPES_TABLE, &query).await?;
        decode_all(rows)
    }

    async fn save_recipe(&self, mut fields: Fields) -> Result<Recipe> {
        fields.remove("id");
        let row = self.client.insert(RECIPES_TABLE, self.stamp(fields)).await?;
        decode(row)
    }

    async fn update_recipe(&self, id: &RecordId, mut updates: Fields) -> Result<Recipe> {
        updates.remove("id");
        updates.remove("user_id");
        updates.insert("updated_at".to_string(), now());
        let rows = self
            .client
            .update(RECIPES_TABLE, &self.owned_row(id), updates)
            .await?;
        let row = rows.into_iter().next().ok_or_else(BackendError::no_rows)?;
        decode(row)
    }

    async fn delete_recipe(&self, id: &RecordId) -> Result<()> {
        self.client
            .delete(RECIPES_TABLE, &self.owned_row(id))
            .await?;
        Ok(())
    }

    async fn get_meal_plan(&self, week: WeekStart) -> Result<Meals> {
        let query = self.owned().eq("week_start", week.to_string());
        let rows = self.client.select(MEAL_PLANS_TABLE, &query).await?;
        match rows.into_iter().next() {
            Some(row) => Ok(decode::<MealPlan>(row)?.meals),
            None => Ok(Meals::new()),
        }
    }

    async fn save_meal_plan(&self, meals: Meals, week: WeekStart) -> Result<MealPlan> {
        let mut row = Fields::new();
        row.insert("week_start".to_string(), Value::String(week.to_string()));
        row.insert("meals".to_string(), serde_json::to_value(meals)?);
        row.insert("updated_at".to_string(), now());
        let saved = self
            .client
            .upsert(MEAL_PLANS_TABLE, self.stamp(row), &["user_id", "week_start"])
            .await?;
        decode(saved)
    }

    async fn get_templates(&self) -> Result<Vec<Template>> {
        let query = self.owned().order_desc("created_at");
        let rows = self.client.select(TEMPLATES_TABLE, &query).await?;
        decode_all(rows)
    }

    async fn save_template(&self, name: &str, meals: Meals) -> Result<Template> {
        let mut row = Fields::new();
        row.insert("name".to_string(), Value::String(name.to_string()));
        row.insert("meals".to_string(), serde_json::to_value(meals)?);
        let saved = self
            .client
            .insert(TEMPLATES_TABLE, self.stamp(row))
            .await?;
        decode(saved)
    }

    async fn delete_template(&self, id: &RecordId) -> Result<()> {
        self.client
            .delete(TEMPLATES_TABLE, &self.owned_row(id))
            .await?;
        Ok(())
    }

    /// A missing profile surfaces as the backend's "no rows" error.
    async fn get_profile(&self) -> Result<Option<Profile>> {
        let query = Query::new().eq("id", self.user.id.clone());
        let row = self.client.select_single(PROFILES_TABLE, &query).await?;
        decode(row).map(Some)
    }

    async fn save_profile(&self, mut fields: Fields) -> Result<Profile> {
        fields.insert("id".to_string(), Value::String(self.user.id.clone()));
        fields.insert("updated_at".to_string(), now());
        let saved = self
            .client
            .upsert(PROFILES_TABLE, fields, &["id"])
            .await?;
        decode(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().unwrap().clone()
    }

    fn user(id: &str) -> Identity {
        Identity {
            id: id.to_string(),
            email: Some(format!("{id}@example.com")),
        }
    }

    fn setup() -> (Arc<MemoryBackend>, RemoteStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = RemoteStore::new(backend.clone());
        (backend, store)
    }

    #[tokio::test]
    async fn test_save_recipe_then_list_scoped_to_user() {
        let (backend, store) = setup();
        let alice = store.scoped(user("alice"));
        let bob = store.scoped(user("bob"));

        let saved = alice
            .save_recipe(fields(json!({ "name": "Soup" })))
            .await
            .unwrap();
        assert!(matches!(saved.id, RecordId::Remote(ref id) if !id.is_empty()));
        bob.save_recipe(fields(json!({ "name": "Curry" })))
            .await
            .unwrap();

        let recipes = alice.get_recipes().await.unwrap();
        assert_eq!(recipes.len(), 1);
        assert_eq!(recipes[0].name(), Some("Soup"));
        assert_eq!(recipes[0].fields["user_id"], json!("alice"));
        assert_eq!(backend.rows(RECIPES_TABLE).len(), 2);
    }

    #[tokio::test]
    async fn test_recipes_newest_first() {
        let (_backend, store) = setup();
        let alice = store.scoped(user("alice"));
        for name in ["first", "second", "third"] {
            alice
                .save_recipe(fields(json!({ "name": name })))
                .await
                .unwrap();
        }
        let names: Vec<_> = alice
            .get_recipes()
            .await
            .unwrap()
            .iter()
            .map(|r| r.name().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn test_save_recipe_cannot_claim_other_owner() {
        let (backend, store) = setup();
        let alice = store.scoped(user("alice"));
        alice
            .save_recipe(fields(json!({ "name": "Soup", "user_id": "bob", "id": 5 })))
            .await
            .unwrap();
        let rows = backend.rows(RECIPES_TABLE);
        assert_eq!(rows[0]["user_id"], json!("alice"));
        assert_ne!(rows[0]["id"], json!(5));
    }

    #[tokio::test]
    async fn test_update_recipe_only_touches_own_rows() {
        let (_backend, store) = setup();
        let alice = store.scoped(user("alice"));
        let bob = store.scoped(user("bob"));
        let soup = alice
            .save_recipe(fields(json!({ "name": "Soup" })))
            .await
            .unwrap();

        let err = bob
            .update_recipe(&soup.id, fields(json!({ "name": "Stolen" })))
            .await
            .unwrap_err();
        assert!(err.is_no_rows());

        let updated = alice
            .update_recipe(&soup.id, fields(json!({ "name": "Tomato soup" })))
            .await
            .unwrap();
        assert_eq!(updated.name(), Some("Tomato soup"));
        assert!(updated.fields.contains_key("updated_at"));
    }

    #[tokio::test]
    async fn test_delete_missing_recipe_leaves_other_users_rows() {
        let (backend, store) = setup();
        let alice = store.scoped(user("alice"));
        let bob = store.scoped(user("bob"));
        let soup = alice
            .save_recipe(fields(json!({ "name": "Soup" })))
            .await
            .unwrap();

        bob.delete_recipe(&RecordId::Remote("does-not-exist".to_string()))
            .await
            .unwrap();
        bob.delete_recipe(&soup.id).await.unwrap();
        assert_eq!(backend.rows(RECIPES_TABLE).len(), 1);

        alice.delete_recipe(&soup.id).await.unwrap();
        assert!(backend.rows(RECIPES_TABLE).is_empty());
    }

    #[tokio::test]
    async fn test_meal_plan_upserts_per_week() {
        let (backend, store) = setup();
        let alice = store.scoped(user("alice"));
        let week: WeekStart = "2024-06-12".parse().unwrap();
        let first: Meals = serde_json::from_value(json!({ "monday-dinner": "Soup" })).unwrap();
        let second: Meals = serde_json::from_value(json!({ "friday-dinner": "Pizza" })).unwrap();

        alice.save_meal_plan(first, week).await.unwrap();
        let saved = alice.save_meal_plan(second.clone(), week).await.unwrap();
        assert_eq!(saved.week_start.to_string(), "2024-06-10");

        assert_eq!(backend.rows(MEAL_PLANS_TABLE).len(), 1);
        assert_eq!(alice.get_meal_plan(week).await.unwrap(), second);

        let other_week: WeekStart = "2024-06-17".parse().unwrap();
        assert!(alice.get_meal_plan(other_week).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_meal_plans_partitioned_by_user() {
        let (backend, store) = setup();
        let week = WeekStart::current();
        let meals: Meals = serde_json::from_value(json!({ "monday-lunch": "Salad" })).unwrap();
        store
            .scoped(user("alice"))
            .save_meal_plan(meals.clone(), week)
            .await
            .unwrap();
        store
            .scoped(user("bob"))
            .save_meal_plan(Meals::new(), week)
            .await
            .unwrap();

        assert_eq!(backend.rows(MEAL_PLANS_TABLE).len(), 2);
        assert_eq!(
            store.scoped(user("alice")).get_meal_plan(week).await.unwrap(),
            meals
        );
    }

    #[tokio::test]
    async fn test_templates_live_apart_from_meal_plans() {
        let (backend, store) = setup();
        let alice = store.scoped(user("alice"));
        let meals: Meals = serde_json::from_value(json!({ "monday-dinner": "Pasta" })).unwrap();

        let template = alice.save_template("Busy week", meals).await.unwrap();
        assert_eq!(template.name, "Busy week");
        assert!(backend.rows(MEAL_PLANS_TABLE).is_empty());

        let templates = alice.get_templates().await.unwrap();
        assert_eq!(templates.len(), 1);
        assert!(
            store
                .scoped(user("bob"))
                .get_templates()
                .await
                .unwrap()
                .is_empty()
        );

        alice.delete_template(&template.id).await.unwrap();
        assert!(alice.get_templates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_profile_missing_is_no_rows() {
        let (_backend, store) = setup();
        let err = store
            .scoped(user("alice"))
            .get_profile()
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(ref e) if e.is_no_rows()));
    }

    #[tokio::test]
    async fn test_profile_upsert_keyed_by_user() {
        let (backend, store) = setup();
        let alice = store.scoped(user("alice"));
        alice
            .save_profile(fields(json!({ "display_name": "Al" })))
            .await
            .unwrap();
        let saved = alice
            .save_profile(fields(json!({ "display_name": "Alice", "id": "bob" })))
            .await
            .unwrap();
        assert_eq!(saved.id, "alice");
        assert!(saved.updated_at.is_some());
        assert_eq!(backend.rows(PROFILES_TABLE).len(), 1);

        let profile = alice.get_profile().await.unwrap().unwrap();
        assert_eq!(profile.fields["display_name"], json!("Alice"));
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let (backend, store) = setup();
        backend.fail_writes_to(RECIPES_TABLE);
        let err = store
            .scoped(user("alice"))
            .save_recipe(fields(json!({ "name": "Soup" })))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }
}
