use anyhow::{Result, bail};
use tabled::{Table, Tabled, settings::Style};

use mealplan_core::error::StoreError;
use mealplan_core::service::StoreFacade;

use super::helpers::{display_value, parse_fields, print_json};

pub(crate) async fn cmd_profile_show(store: &StoreFacade, json: bool) -> Result<()> {
    let profile = store.get_profile().await?;
    if json {
        return print_json(&profile);
    }
    let Some(profile) = profile else {
        println!("No profile saved.");
        return Ok(());
    };

    #[derive(Tabled)]
    struct FieldRow {
        #[tabled(rename = "Field")]
        field: String,
        #[tabled(rename = "Value")]
        value: String,
    }

    let mut rows = vec![FieldRow {
        field: "id".to_string(),
        value: profile.id.clone(),
    }];
    rows.extend(profile.fields.iter().map(|(k, v)| FieldRow {
        field: k.clone(),
        value: display_value(v),
    }));
    if let Some(updated) = profile.updated_at {
        rows.push(FieldRow {
            field: "updated_at".to_string(),
            value: updated.to_rfc3339(),
        });
    }
    println!("{}", Table::new(&rows).with(Style::rounded()));
    Ok(())
}

pub(crate) async fn cmd_profile_set(
    store: &StoreFacade,
    data: Option<&str>,
    fields: &[String],
    json: bool,
) -> Result<()> {
    let fields = parse_fields(data, fields)?;
    if fields.is_empty() {
        bail!("Nothing to save. Pass --field key=value or --data '{{...}}'");
    }
    let profile = match store.save_profile(fields).await {
        Ok(profile) => profile,
        Err(StoreError::Unauthenticated) => {
            bail!("Profiles are stored with your account. Sign in first: mealplan auth signin <email>")
        }
        Err(e) => return Err(e.into()),
    };
    if json {
        print_json(&profile)
    } else {
        println!("Profile saved.");
        Ok(())
    }
}
