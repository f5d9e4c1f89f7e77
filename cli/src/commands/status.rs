use anyhow::Result;
use serde_json::json;

use mealplan_core::migration::MigrationOutcome;
use mealplan_core::service::StoreFacade;

use super::helpers::print_json;

pub(crate) fn describe_outcome(outcome: &MigrationOutcome) -> String {
    match outcome {
        MigrationOutcome::Completed(report) => {
            format!("Local data copied to your account: {report}")
        }
        MigrationOutcome::AlreadyMigrated => {
            "Local data was already copied to this account.".to_string()
        }
        MigrationOutcome::Skipped => "Not signed in to a backend; nothing to copy.".to_string(),
    }
}

pub(crate) fn cmd_status(store: &StoreFacade, json: bool) -> Result<()> {
    let user = store.current_user();
    let backend_ready = store.is_backend_ready();
    let storage = if store.is_remote() { "remote" } else { "local" };

    if json {
        return print_json(&json!({
            "backend_ready": backend_ready,
            "authenticated": store.is_authenticated(),
            "user": user,
            "storage": storage,
        }));
    }

    if backend_ready {
        println!("Backend: connected");
    } else {
        println!("Backend: not configured (set MEALPLAN_BACKEND_URL and MEALPLAN_BACKEND_KEY)");
    }
    match user {
        Some(user) => println!("Signed in: {}", user.email.as_deref().unwrap_or(&user.id)),
        None => println!("Signed in: no"),
    }
    println!("Storage: {storage}");
    Ok(())
}

pub(crate) async fn cmd_migrate(store: &StoreFacade, json: bool) -> Result<()> {
    let outcome = store.migrate_local_data().await?;
    if json {
        print_json(&outcome)
    } else {
        println!("{}", describe_outcome(&outcome));
        Ok(())
    }
}
