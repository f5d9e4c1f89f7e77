//! One-shot copy of local data into the remote store after sign-in.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::error::{Result, StoreError};
use crate::local::LocalStore;
use crate::models::{Identity, WeekStart};
use crate::store::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStep {
    Recipes,
    MealPlan,
    Templates,
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Recipes => "recipes",
            Self::MealPlan => "meal plan",
            Self::Templates => "templates",
        })
    }
}

/// What has been copied so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub recipes: usize,
    pub meal_plan: bool,
    pub templates: usize,
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} recipes, {} meal plan, {} templates copied",
            self.recipes,
            if self.meal_plan { "1" } else { "no" },
            self.templates
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MigrationOutcome {
    Completed(MigrationReport),
    /// This user's local data was already copied.
    AlreadyMigrated,
    /// No authenticated remote session to migrate into.
    Skipped,
}

pub struct MigrationService {
    local: Arc<LocalStore>,
    running: Mutex<()>,
}

impl MigrationService {
    #[must_use]
    pub fn new(local: Arc<LocalStore>) -> Self {
        Self {
            local,
            running: Mutex::new(()),
        }
    }

    /// Copy recipes, then the meal plan, then templates into `remote`.
    ///
    /// Runs at most once per user: the marker is written only after every step
    /// succeeds. A failed step stops the run; rows already copied stay.
    #[instrument(skip(self, remote), fields(user = %user.id))]
    pub async fn run(&self, user: &Identity, remote: &dyn RecordStore) -> Result<MigrationOutcome> {
        let _guard = self.running.lock().await;
        if self.local.is_migrated(&user.id)? {
            info!("local data already migrated");
            return Ok(MigrationOutcome::AlreadyMigrated);
        }

        let mut report = MigrationReport::default();
        if let Err((step, source)) = self.copy_all(remote, &mut report).await {
            warn!(%step, %report, error = %source, "migration failed");
            return Err(StoreError::Migration {
                step,
                report,
                source: Box::new(source),
            });
        }

        self.local.mark_migrated(&user.id)?;
        info!(%report, "migration completed");
        Ok(MigrationOutcome::Completed(report))
    }

    async fn copy_all(
        &self,
        remote: &dyn RecordStore,
        report: &mut MigrationReport,
    ) -> std::result::Result<(), (MigrationStep, StoreError)> {
        let recipes = self
            .local
            .get_recipes()
            .await
            .map_err(at(MigrationStep::Recipes))?;
        for recipe in recipes {
            remote
                .save_recipe(recipe.into_fields())
                .await
                .map_err(at(MigrationStep::Recipes))?;
            report.recipes += 1;
        }

        let plan = self
            .local
            .stored_meal_plan()
            .map_err(at(MigrationStep::MealPlan))?;
        if let Some(meals) = plan {
            remote
                .save_meal_plan(meals, WeekStart::current())
                .await
                .map_err(at(MigrationStep::MealPlan))?;
            report.meal_plan = true;
        }

        let templates = self
            .local
            .get_templates()
            .await
            .map_err(at(MigrationStep::Templates))?;
        for template in templates {
            remote
                .save_template(&template.name, template.meals)
                .await
                .map_err(at(MigrationStep::Templates))?;
            report.templates += 1;
        }
        Ok(())
    }
}

fn at(step: MigrationStep) -> impl FnOnce(StoreError) -> (MigrationStep, StoreError) {
    move |e| (step, e)
}
