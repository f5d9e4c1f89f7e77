use anyhow::{Result, bail};

use mealplan_core::models::WeekStart;
use mealplan_core::service::StoreFacade;

use super::helpers::{parse_meals, parse_week, print_json, print_meals_table};

pub(crate) async fn cmd_plan_show(
    store: &StoreFacade,
    week: Option<&str>,
    json: bool,
) -> Result<()> {
    let week = parse_week(week)?;
    let meals = store.get_meal_plan(week).await?;
    let week = week.unwrap_or_else(WeekStart::current);

    if json {
        return print_json(&serde_json::json!({ "week_start": week, "meals": meals }));
    }
    println!("Week of {week}");
    if meals.is_empty() {
        println!("No meals planned.");
    } else {
        print_meals_table(&meals);
    }
    Ok(())
}

pub(crate) async fn cmd_plan_save(
    store: &StoreFacade,
    week: Option<&str>,
    data: Option<&str>,
    meals: &[String],
    json: bool,
) -> Result<()> {
    let meals = parse_meals(data, meals)?;
    if meals.is_empty() {
        bail!("No meals given. Pass --meal slot=meal or --data '{{...}}'");
    }
    let week = parse_week(week)?;

    let plan = store.save_meal_plan(meals, week).await?;
    if json {
        print_json(&plan)
    } else {
        let count = plan.meals.len();
        println!("Saved {count} meals for the week of {}", plan.week_start);
        Ok(())
    }
}
