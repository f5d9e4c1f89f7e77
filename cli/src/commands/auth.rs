use anyhow::{Context, Result};
use serde_json::json;

use mealplan_core::migration::MigrationOutcome;
use mealplan_core::models::Fields;
use mealplan_core::service::StoreFacade;

use super::helpers::{parse_fields, print_json};
use super::status::describe_outcome;

/// Copy local data up right after authenticating. A failed copy does not undo
/// the sign-in.
async fn migrate_after_sign_in(store: &StoreFacade) -> Option<Result<MigrationOutcome, String>> {
    if !store.is_remote() {
        return None;
    }
    Some(store.migrate_local_data().await.map_err(|e| e.to_string()))
}

fn print_migration(result: Option<&Result<MigrationOutcome, String>>) {
    match result {
        Some(Ok(outcome)) => println!("{}", describe_outcome(outcome)),
        Some(Err(e)) => eprintln!("Warning: copying local data failed: {e}"),
        None => {}
    }
}

fn migration_json(result: Option<&Result<MigrationOutcome, String>>) -> serde_json::Value {
    match result {
        Some(Ok(outcome)) => json!(outcome),
        Some(Err(e)) => json!({ "status": "failed", "error": e }),
        None => serde_json::Value::Null,
    }
}

pub(crate) async fn cmd_auth_signup(
    store: &StoreFacade,
    email: &str,
    password: &str,
    data: Option<&str>,
    fields: &[String],
    json: bool,
) -> Result<()> {
    let metadata: Fields = parse_fields(data, fields)?;
    let response = store
        .sign_up(email, password, metadata)
        .await
        .context("Sign-up failed")?;
    let migration = migrate_after_sign_in(store).await;

    if json {
        return print_json(&json!({
            "user": response.user,
            "signed_in": response.session.is_some(),
            "migration": migration_json(migration.as_ref()),
        }));
    }
    if response.session.is_some() {
        println!("Signed up and signed in as {email}");
        print_migration(migration.as_ref());
    } else {
        println!("Signed up as {email}. Check your inbox to confirm, then run: mealplan auth signin {email}");
    }
    Ok(())
}

pub(crate) async fn cmd_auth_signin(
    store: &StoreFacade,
    email: &str,
    password: &str,
    json: bool,
) -> Result<()> {
    let user = store
        .sign_in(email, password)
        .await
        .context("Sign-in failed")?;
    let migration = migrate_after_sign_in(store).await;

    if json {
        return print_json(&json!({
            "user": user,
            "migration": migration_json(migration.as_ref()),
        }));
    }
    println!("Signed in as {}", user.email.as_deref().unwrap_or(&user.id));
    print_migration(migration.as_ref());
    Ok(())
}

pub(crate) async fn cmd_auth_oauth(
    store: &StoreFacade,
    provider: &str,
    redirect_to: Option<&str>,
    json: bool,
) -> Result<()> {
    let url = store.sign_in_with_provider(provider, redirect_to).await?;
    if json {
        println!("{}", json!({ "provider": provider, "url": url }));
    } else {
        println!("Open this URL to continue signing in with {provider}:");
        println!("  {url}");
        println!("Then run: mealplan auth oauth {provider} --callback '<redirect URL>'");
    }
    Ok(())
}

pub(crate) async fn cmd_auth_oauth_complete(
    store: &StoreFacade,
    provider: &str,
    callback: &str,
    json: bool,
) -> Result<()> {
    let user = store
        .complete_provider_sign_in(callback)
        .await
        .with_context(|| format!("Sign-in with {provider} failed"))?;
    let migration = migrate_after_sign_in(store).await;

    if json {
        return print_json(&json!({
            "provider": provider,
            "user": user,
            "migration": migration_json(migration.as_ref()),
        }));
    }
    println!(
        "Signed in with {provider} as {}",
        user.email.as_deref().unwrap_or(&user.id)
    );
    print_migration(migration.as_ref());
    Ok(())
}

pub(crate) async fn cmd_auth_signout(store: &StoreFacade, json: bool) -> Result<()> {
    store.sign_out().await?;
    if json {
        println!("{}", json!({ "signed_out": true }));
    } else {
        println!("Signed out. Data is stored locally until you sign in again.");
    }
    Ok(())
}

pub(crate) async fn cmd_auth_reset(store: &StoreFacade, email: &str, json: bool) -> Result<()> {
    store.reset_password(email).await?;
    if json {
        println!("{}", json!({ "reset_requested": email }));
    } else {
        println!("Password reset email sent to {email}");
    }
    Ok(())
}
