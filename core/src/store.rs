use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Fields, MealPlan, Meals, Profile, Recipe, RecordId, Template, WeekStart};

/// The operation set every backend offers.
///
/// Implemented by [`LocalStore`](crate::local::LocalStore) and by a
/// user-scoped view of [`RemoteStore`](crate::remote::RemoteStore). Week keys
/// arrive already resolved; the facade fills in the current week.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_recipes(&self) -> Result<Vec<Recipe>>;

    /// Store a new recipe. Any `id` in `fields` is discarded; the backend assigns one.
    async fn save_recipe(&self, fields: Fields) -> Result<Recipe>;

    async fn update_recipe(&self, id: &RecordId, updates: Fields) -> Result<Recipe>;

    /// Deleting an id that does not exist is not an error.
    async fn delete_recipe(&self, id: &RecordId) -> Result<()>;

    /// Meals for `week`, or an empty map when nothing was saved.
    async fn get_meal_plan(&self, week: WeekStart) -> Result<Meals>;

    async fn save_meal_plan(&self, meals: Meals, week: WeekStart) -> Result<MealPlan>;

    async fn get_templates(&self) -> Result<Vec<Template>>;

    async fn save_template(&self, name: &str, meals: Meals) -> Result<Template>;

    async fn delete_template(&self, id: &RecordId) -> Result<()>;

    async fn get_profile(&self) -> Result<Option<Profile>>;

    async fn save_profile(&self, fields: Fields) -> Result<Profile>;
}
