use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::error::Result;
use crate::local::LocalStore;
use crate::migration::{MigrationOutcome, MigrationService};
use crate::models::{
    Fields, Identity, MealPlan, Meals, Profile, Recipe, RecordId, Template, WeekStart,
};
use crate::remote::{AuthEvent, Connector, SignUpResponse, UserScope};
use crate::selector::{self, Route};
use crate::session::{AuthNotification, BackendConfig, SessionManager};
use crate::store::RecordStore;

/// The backend chosen for a single call.
enum Selected<'a> {
    Local(&'a LocalStore),
    Remote(UserScope),
}

impl Selected<'_> {
    fn store(&self) -> &dyn RecordStore {
        match self {
            Self::Local(local) => *local,
            Self::Remote(scope) => scope,
        }
    }
}

/// Single entry point for the application's data.
///
/// Every call reads the session once, routes to local or remote storage for
/// the whole call, and returns that backend's result. Nothing is retried.
pub struct StoreFacade {
    session: Arc<SessionManager>,
    local: Arc<LocalStore>,
    migration: MigrationService,
}

impl StoreFacade {
    #[must_use]
    pub fn new(local: LocalStore) -> Self {
        let local = Arc::new(local);
        Self {
            session: SessionManager::new(),
            migration: MigrationService::new(Arc::clone(&local)),
            local,
        }
    }

    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self::new(LocalStore::open(db_path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(LocalStore::open_in_memory()?))
    }

    /// Bring up the remote backend. See [`SessionManager::initialize`].
    pub async fn initialize(
        &self,
        config: &BackendConfig,
        connector: Option<&dyn Connector>,
    ) -> bool {
        self.session.initialize(config, connector).await
    }

    #[must_use]
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    fn select(&self) -> Selected<'_> {
        let session = self.session.snapshot();
        match (selector::route(&session), self.session.remote_store()) {
            (Route::Remote(user), Some(remote)) => Selected::Remote(remote.scoped(user)),
            _ => Selected::Local(&self.local),
        }
    }

    // --- Status ---

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    #[must_use]
    pub fn current_user(&self) -> Option<Identity> {
        self.session.current_user()
    }

    #[must_use]
    pub fn is_backend_ready(&self) -> bool {
        self.session.is_backend_ready()
    }

    /// Whether calls made right now go to the remote store.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        selector::use_remote(&self.session.snapshot())
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AuthNotification> {
        self.session.subscribe()
    }

    // --- Auth ---

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Fields,
    ) -> Result<SignUpResponse> {
        self.session.sign_up(email, password, metadata).await
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Identity> {
        self.session.sign_in(email, password).await
    }

    pub async fn sign_in_with_provider(
        &self,
        provider: &str,
        redirect_to: Option<&str>,
    ) -> Result<String> {
        self.session.sign_in_with_provider(provider, redirect_to).await
    }

    pub async fn complete_provider_sign_in(&self, callback_url: &str) -> Result<Identity> {
        self.session.complete_provider_sign_in(callback_url).await
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.session.sign_out().await
    }

    pub async fn reset_password(&self, email: &str) -> Result<()> {
        self.session.reset_password(email).await
    }

    // --- Recipes ---

    #[instrument(skip(self))]
    pub async fn get_recipes(&self) -> Result<Vec<Recipe>> {
        self.select().store().get_recipes().await
    }

    #[instrument(skip_all)]
    pub async fn save_recipe(&self, fields: Fields) -> Result<Recipe> {
        self.select().store().save_recipe(fields).await
    }

    #[instrument(skip(self, updates))]
    pub async fn update_recipe(&self, id: &RecordId, updates: Fields) -> Result<Recipe> {
        self.select().store().update_recipe(id, updates).await
    }

    #[instrument(skip(self))]
    pub async fn delete_recipe(&self, id: &RecordId) -> Result<()> {
        self.select().store().delete_recipe(id).await
    }

    // --- Meal plans ---

    /// Meals for `week`, defaulting to the current week.
    #[instrument(skip(self))]
    pub async fn get_meal_plan(&self, week: Option<WeekStart>) -> Result<Meals> {
        let week = week.unwrap_or_else(WeekStart::current);
        self.select().store().get_meal_plan(week).await
    }

    #[instrument(skip(self, meals))]
    pub async fn save_meal_plan(&self, meals: Meals, week: Option<WeekStart>) -> Result<MealPlan> {
        let week = week.unwrap_or_else(WeekStart::current);
        self.select().store().save_meal_plan(meals, week).await
    }

    // --- Templates ---

    #[instrument(skip(self))]
    pub async fn get_templates(&self) -> Result<Vec<Template>> {
        self.select().store().get_templates().await
    }

    #[instrument(skip(self, meals))]
    pub async fn save_template(&self, name: &str, meals: Meals) -> Result<Template> {
        self.select().store().save_template(name, meals).await
    }

    #[instrument(skip(self))]
    pub async fn delete_template(&self, id: &RecordId) -> Result<()> {
        self.select().store().delete_template(id).await
    }

    // --- Profile ---

    /// The signed-in user's profile. A missing row is `None`, not an error.
    #[instrument(skip(self))]
    pub async fn get_profile(&self) -> Result<Option<Profile>> {
        match self.select().store().get_profile().await {
            Err(e) if e.is_no_rows() => Ok(None),
            other => other,
        }
    }

    #[instrument(skip_all)]
    pub async fn save_profile(&self, fields: Fields) -> Result<Profile> {
        self.select().store().save_profile(fields).await
    }

    // --- Migration ---

    /// Copy local data into the signed-in user's remote store, once per user.
    pub async fn migrate_local_data(&self) -> Result<MigrationOutcome> {
        let Selected::Remote(scope) = self.select() else {
            info!("not signed in to a remote backend, skipping migration");
            return Ok(MigrationOutcome::Skipped);
        };
        let user = scope.user().clone();
        self.migration.run(&user, &scope).await
    }

    /// Run the migration whenever a user signs in. The task ends when the
    /// facade is dropped.
    pub fn spawn_migration_on_sign_in(self: &Arc<Self>) -> JoinHandle<()> {
        let mut notifications = self.session.subscribe();
        let facade = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(n) if n.event == AuthEvent::SignedIn => {
                        let Some(facade) = facade.upgrade() else { break };
                        match facade.migrate_local_data().await {
                            Ok(outcome) => info!(?outcome, "sign-in migration finished"),
                            Err(e) => error!(error = %e, "sign-in migration failed"),
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "auth notifications lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::error::StoreError;
    use crate::remote::{MEAL_PLANS_TABLE, MemoryBackend, PROFILES_TABLE, RECIPES_TABLE};

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().unwrap().clone()
    }

    fn meals(value: serde_json::Value) -> Meals {
        serde_json::from_value(value).unwrap()
    }

    fn config() -> BackendConfig {
        BackendConfig {
            url: Some("memory://".to_string()),
            key: Some("anon".to_string()),
        }
    }

    async fn remote_facade() -> (StoreFacade, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let facade = StoreFacade::open_in_memory().unwrap();
        assert!(facade.initialize(&config(), Some(&backend)).await);
        (facade, backend)
    }

    #[tokio::test]
    async fn test_local_recipe_migrates_on_sign_in() {
        let (facade, backend) = remote_facade().await;
        assert!(!facade.is_remote());

        let soup = facade.save_recipe(fields(json!({ "name": "Soup" }))).await.unwrap();
        let local_id = soup.id.clone();
        assert!(matches!(local_id, RecordId::Local(_)));
        let recipes = facade.get_recipes().await.unwrap();
        assert_eq!(recipes.len(), 1);
        assert_eq!(recipes[0].name(), Some("Soup"));

        facade.sign_up("sam@example.com", "pw", Fields::new()).await.unwrap();
        assert!(facade.is_remote());
        let outcome = facade.migrate_local_data().await.unwrap();
        assert!(matches!(outcome, MigrationOutcome::Completed(r) if r.recipes == 1));

        let recipes = facade.get_recipes().await.unwrap();
        assert_eq!(recipes.len(), 1);
        assert_eq!(recipes[0].name(), Some("Soup"));
        assert!(matches!(recipes[0].id, RecordId::Remote(_)));
        assert_ne!(recipes[0].id, local_id);
        assert_eq!(backend.rows(RECIPES_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn test_sign_in_task_runs_migration() {
        let (facade, backend) = remote_facade().await;
        let facade = Arc::new(facade);
        let task = facade.spawn_migration_on_sign_in();

        facade.save_recipe(fields(json!({ "name": "Soup" }))).await.unwrap();
        facade.sign_up("sam@example.com", "pw", Fields::new()).await.unwrap();

        let mut copied = false;
        for _ in 0..100 {
            if backend.rows(RECIPES_TABLE).len() == 1 {
                copied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(copied);

        // a second sign-in does not copy again
        facade.sign_out().await.unwrap();
        facade.sign_in("sam@example.com", "pw").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.rows(RECIPES_TABLE).len(), 1);
        task.abort();
    }

    #[tokio::test]
    async fn test_provider_sign_in_runs_migration() {
        let (facade, backend) = remote_facade().await;
        let facade = Arc::new(facade);
        let task = facade.spawn_migration_on_sign_in();

        facade.save_recipe(fields(json!({ "name": "Soup" }))).await.unwrap();
        let url = facade.sign_in_with_provider("github", None).await.unwrap();
        assert!(url.contains("provider=github"));
        assert!(!facade.is_remote());

        let callback = backend.oauth_redirect("kim@example.com");
        let user = facade.complete_provider_sign_in(&callback).await.unwrap();
        assert!(facade.is_remote());

        let mut copied = Vec::new();
        for _ in 0..100 {
            copied = backend.rows(RECIPES_TABLE);
            if !copied.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0]["user_id"], json!(user.id));
        task.abort();
    }

    #[tokio::test]
    async fn test_save_meal_plan_twice_keeps_latest() {
        let (facade, backend) = remote_facade().await;
        facade.sign_up("sam@example.com", "pw", Fields::new()).await.unwrap();

        facade
            .save_meal_plan(meals(json!({ "monday-dinner": "Soup" })), None)
            .await
            .unwrap();
        facade
            .save_meal_plan(meals(json!({ "monday-dinner": "Stew" })), None)
            .await
            .unwrap();

        assert_eq!(
            facade.get_meal_plan(None).await.unwrap(),
            meals(json!({ "monday-dinner": "Stew" }))
        );
        assert_eq!(backend.rows(MEAL_PLANS_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_week_is_normalized() {
        let (facade, _backend) = remote_facade().await;
        facade.sign_up("sam@example.com", "pw", Fields::new()).await.unwrap();

        let thursday: WeekStart = "2024-06-13".parse().unwrap();
        let plan = facade
            .save_meal_plan(meals(json!({ "thursday-lunch": "Tacos" })), Some(thursday))
            .await
            .unwrap();
        assert_eq!(plan.week_start.to_string(), "2024-06-10");

        let monday: WeekStart = "2024-06-10".parse().unwrap();
        assert_eq!(facade.get_meal_plan(Some(monday)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backend_unavailable_stays_local() {
        let facade = StoreFacade::open_in_memory().unwrap();
        assert!(!facade.initialize(&BackendConfig::default(), None).await);

        assert!(matches!(
            facade.sign_in("sam@example.com", "pw").await,
            Err(StoreError::Configuration)
        ));
        assert!(!facade.is_authenticated());
        assert!(!facade.is_backend_ready());

        facade.save_recipe(fields(json!({ "name": "Soup" }))).await.unwrap();
        assert_eq!(facade.get_recipes().await.unwrap().len(), 1);
        assert_eq!(
            facade.migrate_local_data().await.unwrap(),
            MigrationOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn test_missing_connector_is_not_rechecked() {
        let backend = Arc::new(MemoryBackend::new());
        let facade = StoreFacade::open_in_memory().unwrap();
        assert!(!facade.initialize(&config(), None).await);
        assert!(!facade.initialize(&config(), Some(&backend)).await);
        assert!(matches!(
            facade.sign_up("sam@example.com", "pw", Fields::new()).await,
            Err(StoreError::Configuration)
        ));
    }

    #[tokio::test]
    async fn test_profile_absence_is_empty() {
        let (facade, backend) = remote_facade().await;
        assert!(facade.get_profile().await.unwrap().is_none());
        assert!(matches!(
            facade.save_profile(fields(json!({ "display_name": "Sam" }))).await,
            Err(StoreError::Unauthenticated)
        ));

        let user = facade
            .sign_up("sam@example.com", "pw", Fields::new())
            .await
            .unwrap()
            .user
            .unwrap();
        assert!(facade.get_profile().await.unwrap().is_none());

        let saved = facade
            .save_profile(fields(json!({ "display_name": "Sam" })))
            .await
            .unwrap();
        assert_eq!(saved.id, user.id);
        facade.save_profile(fields(json!({ "display_name": "Sammy" }))).await.unwrap();
        let profile = facade.get_profile().await.unwrap().unwrap();
        assert_eq!(profile.fields["display_name"], json!("Sammy"));
        assert_eq!(backend.rows(PROFILES_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn test_remote_rows_scoped_to_user() {
        let (facade, backend) = remote_facade().await;
        facade.sign_up("a@example.com", "pw", Fields::new()).await.unwrap();
        let theirs = facade.save_recipe(fields(json!({ "name": "Soup" }))).await.unwrap();

        facade.sign_out().await.unwrap();
        facade.sign_up("b@example.com", "pw", Fields::new()).await.unwrap();
        assert!(facade.get_recipes().await.unwrap().is_empty());

        facade
            .delete_recipe(&RecordId::Remote("missing".to_string()))
            .await
            .unwrap();
        facade.delete_recipe(&theirs.id).await.unwrap();
        assert_eq!(backend.rows(RECIPES_TABLE).len(), 1);

        let err = facade
            .update_recipe(&theirs.id, fields(json!({ "name": "Stolen" })))
            .await
            .unwrap_err();
        assert!(err.is_no_rows());
    }

    #[tokio::test]
    async fn test_sign_out_routes_back_to_local() {
        let (facade, _backend) = remote_facade().await;
        facade
            .save_template("Local week", meals(json!({ "monday-dinner": "Soup" })))
            .await
            .unwrap();

        facade.sign_up("sam@example.com", "pw", Fields::new()).await.unwrap();
        assert!(facade.get_templates().await.unwrap().is_empty());
        let remote = facade.save_template("Remote week", Meals::new()).await.unwrap();
        facade.delete_template(&remote.id).await.unwrap();

        facade.sign_out().await.unwrap();
        let templates = facade.get_templates().await.unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].name, "Local week");
    }

    #[tokio::test]
    async fn test_local_update_missing_recipe_is_not_found() {
        let facade = StoreFacade::open_in_memory().unwrap();
        let err = facade
            .update_recipe(&RecordId::Local(1), fields(json!({ "name": "x" })))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        facade.delete_recipe(&RecordId::Local(1)).await.unwrap();
    }
}
