use anyhow::{Result, bail};
use std::process;

use mealplan_core::error::StoreError;
use mealplan_core::service::StoreFacade;

use super::helpers::{json_error, parse_fields, parse_id, print_json, print_recipe_table};

pub(crate) async fn cmd_recipe_list(store: &StoreFacade, json: bool) -> Result<()> {
    let recipes = store.get_recipes().await?;
    if json {
        return print_json(&recipes);
    }
    if recipes.is_empty() {
        println!("No recipes yet. Add one with: mealplan recipe add <name>");
        return Ok(());
    }
    print_recipe_table(&recipes);
    Ok(())
}

pub(crate) async fn cmd_recipe_add(
    store: &StoreFacade,
    name: &str,
    data: Option<&str>,
    fields: &[String],
    json: bool,
) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        bail!("Recipe name must not be empty");
    }
    let mut fields = parse_fields(data, fields)?;
    fields.insert("name".to_string(), name.into());

    let recipe = store.save_recipe(fields).await?;
    if json {
        print_json(&recipe)
    } else {
        println!("Added recipe: {name} (id: {})", recipe.id);
        Ok(())
    }
}

pub(crate) async fn cmd_recipe_update(
    store: &StoreFacade,
    id: &str,
    data: Option<&str>,
    fields: &[String],
    json: bool,
) -> Result<()> {
    let updates = parse_fields(data, fields)?;
    if updates.is_empty() {
        bail!("Nothing to update. Pass --field key=value or --data '{{...}}'");
    }
    let id = parse_id(id);

    match store.update_recipe(&id, updates).await {
        Ok(recipe) => {
            if json {
                print_json(&recipe)
            } else {
                println!("Updated recipe {id}");
                Ok(())
            }
        }
        Err(e @ StoreError::NotFound { .. }) => {
            if json {
                println!("{}", json_error(&e.to_string()));
            } else {
                eprintln!("{e}");
            }
            process::exit(2);
        }
        Err(e) if e.is_no_rows() => {
            let message = format!("Recipe not found: {id}");
            if json {
                println!("{}", json_error(&message));
            } else {
                eprintln!("{message}");
            }
            process::exit(2);
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn cmd_recipe_delete(store: &StoreFacade, id: &str, json: bool) -> Result<()> {
    let id = parse_id(id);
    store.delete_recipe(&id).await?;
    if json {
        println!("{}", serde_json::json!({ "deleted": id }));
    } else {
        println!("Deleted recipe {id}");
    }
    Ok(())
}
