mod auth;
mod helpers;
mod plan;
mod profile;
mod recipe;
mod status;
mod template;

pub(crate) use auth::{
    cmd_auth_oauth, cmd_auth_oauth_complete, cmd_auth_reset, cmd_auth_signin, cmd_auth_signout,
    cmd_auth_signup,
};
pub(crate) use plan::{cmd_plan_save, cmd_plan_show};
pub(crate) use profile::{cmd_profile_set, cmd_profile_show};
pub(crate) use recipe::{cmd_recipe_add, cmd_recipe_delete, cmd_recipe_list, cmd_recipe_update};
pub(crate) use status::{cmd_migrate, cmd_status};
pub(crate) use template::{cmd_template_delete, cmd_template_list, cmd_template_save};
