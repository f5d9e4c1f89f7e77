use anyhow::{Result, bail};
use tabled::{Table, Tabled, settings::Style};

use mealplan_core::models::Meals;
use mealplan_core::service::StoreFacade;

use super::helpers::{parse_id, parse_meals, parse_week, print_json};

pub(crate) async fn cmd_template_list(store: &StoreFacade, json: bool) -> Result<()> {
    let templates = store.get_templates().await?;
    if json {
        return print_json(&templates);
    }
    if templates.is_empty() {
        println!("No saved templates.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct TemplateRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Meals")]
        meals: usize,
        #[tabled(rename = "Created")]
        created: String,
    }

    let rows: Vec<TemplateRow> = templates
        .iter()
        .map(|t| TemplateRow {
            id: t.id.to_string(),
            name: t.name.clone(),
            meals: t.meals.len(),
            created: t.created_at.format("%Y-%m-%d %H:%M").to_string(),
        })
        .collect();
    println!("{}", Table::new(&rows).with(Style::rounded()));
    Ok(())
}

/// Save a template from explicit meals, or from a week's plan with `--from-week`.
pub(crate) async fn cmd_template_save(
    store: &StoreFacade,
    name: &str,
    from_week: Option<&str>,
    data: Option<&str>,
    meals: &[String],
    json: bool,
) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        bail!("Template name must not be empty");
    }

    let mut plan = match from_week {
        Some(week) => store.get_meal_plan(parse_week(Some(week))?).await?,
        None => Meals::new(),
    };
    plan.extend(parse_meals(data, meals)?);
    if plan.is_empty() {
        bail!("Template has no meals. Pass --from-week, --meal slot=meal or --data '{{...}}'");
    }

    let template = store.save_template(name, plan).await?;
    if json {
        print_json(&template)
    } else {
        println!(
            "Saved template '{}' with {} meals (id: {})",
            template.name,
            template.meals.len(),
            template.id
        );
        Ok(())
    }
}

pub(crate) async fn cmd_template_delete(store: &StoreFacade, id: &str, json: bool) -> Result<()> {
    let id = parse_id(id);
    store.delete_template(&id).await?;
    if json {
        println!("{}", serde_json::json!({ "deleted": id }));
    } else {
        println!("Deleted template {id}");
    }
    Ok(())
}
