mod commands;
mod config;
mod rest;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process;

use crate::commands::{
    cmd_auth_oauth, cmd_auth_oauth_complete, cmd_auth_reset, cmd_auth_signin, cmd_auth_signout,
    cmd_auth_signup, cmd_migrate, cmd_plan_save, cmd_plan_show, cmd_profile_set,
    cmd_profile_show, cmd_recipe_add, cmd_recipe_delete, cmd_recipe_list, cmd_recipe_update,
    cmd_status, cmd_template_delete, cmd_template_list, cmd_template_save,
};
use crate::config::{AiSettings, Config};
use crate::rest::RestConnector;
use mealplan_core::service::StoreFacade;

#[derive(Parser)]
#[command(
    name = "mealplan",
    version,
    about = "Plan meals offline, sync them once you sign in"
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Hosted backend URL
    #[arg(long, global = true, env = "MEALPLAN_BACKEND_URL")]
    backend_url: Option<String>,

    /// Hosted backend public (anon) key
    #[arg(long, global = true, env = "MEALPLAN_BACKEND_KEY", hide_env_values = true)]
    backend_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show backend, sign-in, and storage status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage recipes
    Recipe {
        #[command(subcommand)]
        command: RecipeCommands,
    },
    /// Show or save a week's meal plan
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Manage reusable meal plan templates
    Template {
        #[command(subcommand)]
        command: TemplateCommands,
    },
    /// Show or update your profile (requires sign-in)
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    /// Sign up, sign in, and sign out
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// Copy local data into your account (runs automatically on sign-in)
    Migrate {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Serve runtime configuration to the web front end
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000", env = "PORT")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
    },
}

#[derive(Subcommand)]
enum RecipeCommands {
    /// List recipes, newest first
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a recipe
    Add {
        /// Recipe name
        name: String,
        /// Extra fields as key=value (value may be JSON)
        #[arg(short, long = "field", value_name = "KEY=VALUE")]
        fields: Vec<String>,
        /// Extra fields as a JSON object
        #[arg(long)]
        data: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Update fields on a recipe
    Update {
        /// Recipe ID
        id: String,
        /// Fields to set as key=value (value may be JSON)
        #[arg(short, long = "field", value_name = "KEY=VALUE")]
        fields: Vec<String>,
        /// Fields to set as a JSON object
        #[arg(long)]
        data: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a recipe
    Delete {
        /// Recipe ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum PlanCommands {
    /// Show the meals planned for a week
    Show {
        /// Any date in the week (YYYY-MM-DD or this/last/next, default: this week)
        #[arg(short, long)]
        week: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Save the meals for a week, replacing what was there
    Save {
        /// Any date in the week (YYYY-MM-DD or this/last/next, default: this week)
        #[arg(short, long)]
        week: Option<String>,
        /// Meal for a slot, e.g. monday-dinner=Soup (value may be JSON)
        #[arg(short, long = "meal", value_name = "SLOT=MEAL")]
        meals: Vec<String>,
        /// Meals as a JSON object keyed by slot
        #[arg(long)]
        data: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TemplateCommands {
    /// List saved templates
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Save a template
    Save {
        /// Template name
        name: String,
        /// Start from the plan for this week (YYYY-MM-DD or this/last/next)
        #[arg(long, value_name = "WEEK")]
        from_week: Option<String>,
        /// Meal for a slot, e.g. monday-dinner=Soup (value may be JSON)
        #[arg(short, long = "meal", value_name = "SLOT=MEAL")]
        meals: Vec<String>,
        /// Meals as a JSON object keyed by slot
        #[arg(long)]
        data: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a template
    Delete {
        /// Template ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Show your profile
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set profile fields
    Set {
        /// Field as key=value (value may be JSON)
        #[arg(short, long = "field", value_name = "KEY=VALUE")]
        fields: Vec<String>,
        /// Fields as a JSON object
        #[arg(long)]
        data: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Create an account
    Signup {
        /// Email address
        email: String,
        /// Password
        #[arg(long, env = "MEALPLAN_PASSWORD", hide_env_values = true)]
        password: String,
        /// Account metadata as key=value
        #[arg(short, long = "field", value_name = "KEY=VALUE")]
        fields: Vec<String>,
        /// Account metadata as a JSON object
        #[arg(long)]
        data: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Sign in with email and password
    Signin {
        /// Email address
        email: String,
        /// Password
        #[arg(long, env = "MEALPLAN_PASSWORD", hide_env_values = true)]
        password: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Sign in with an OAuth provider: prints the URL to open, then finish
    /// with --callback and the URL the provider sent you back to
    Oauth {
        /// Provider name, e.g. google or github
        provider: String,
        /// Where the provider should send you afterwards
        #[arg(long, conflicts_with = "callback")]
        redirect_to: Option<String>,
        /// Redirect URL carrying the provider's tokens
        #[arg(long, value_name = "URL")]
        callback: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Sign out
    Signout {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Send a password reset email
    Reset {
        /// Email address
        email: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    // RUST_LOG wins over -v
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug,hyper=info,reqwest=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> Result<()> {
    let command = match cli.command {
        Commands::Serve { port, bind } => {
            return server::start_server(AiSettings::from_env(), port, &bind).await;
        }
        command => command,
    };

    let config = Config::load(cli.backend_url, cli.backend_key)?;
    let store = StoreFacade::open(&config.db_path)?;
    let connector = RestConnector {
        session_path: Some(config.session_path.clone()),
    };
    store.initialize(&config.backend, Some(&connector)).await;

    match command {
        Commands::Status { json } => cmd_status(&store, json),
        Commands::Migrate { json } => cmd_migrate(&store, json).await,
        Commands::Serve { .. } => Ok(()),
        Commands::Recipe { command } => match command {
            RecipeCommands::List { json } => cmd_recipe_list(&store, json).await,
            RecipeCommands::Add {
                name,
                fields,
                data,
                json,
            } => cmd_recipe_add(&store, &name, data.as_deref(), &fields, json).await,
            RecipeCommands::Update {
                id,
                fields,
                data,
                json,
            } => cmd_recipe_update(&store, &id, data.as_deref(), &fields, json).await,
            RecipeCommands::Delete { id, json } => cmd_recipe_delete(&store, &id, json).await,
        },
        Commands::Plan { command } => match command {
            PlanCommands::Show { week, json } => {
                cmd_plan_show(&store, week.as_deref(), json).await
            }
            PlanCommands::Save {
                week,
                meals,
                data,
                json,
            } => cmd_plan_save(&store, week.as_deref(), data.as_deref(), &meals, json).await,
        },
        Commands::Template { command } => match command {
            TemplateCommands::List { json } => cmd_template_list(&store, json).await,
            TemplateCommands::Save {
                name,
                from_week,
                meals,
                data,
                json,
            } => {
                cmd_template_save(
                    &store,
                    &name,
                    from_week.as_deref(),
                    data.as_deref(),
                    &meals,
                    json,
                )
                .await
            }
            TemplateCommands::Delete { id, json } => cmd_template_delete(&store, &id, json).await,
        },
        Commands::Profile { command } => match command {
            ProfileCommands::Show { json } => cmd_profile_show(&store, json).await,
            ProfileCommands::Set { fields, data, json } => {
                cmd_profile_set(&store, data.as_deref(), &fields, json).await
            }
        },
        Commands::Auth { command } => match command {
            AuthCommands::Signup {
                email,
                password,
                fields,
                data,
                json,
            } => cmd_auth_signup(&store, &email, &password, data.as_deref(), &fields, json).await,
            AuthCommands::Signin {
                email,
                password,
                json,
            } => cmd_auth_signin(&store, &email, &password, json).await,
            AuthCommands::Oauth {
                provider,
                redirect_to,
                callback,
                json,
            } => match callback {
                Some(callback) => cmd_auth_oauth_complete(&store, &provider, &callback, json).await,
                None => cmd_auth_oauth(&store, &provider, redirect_to.as_deref(), json).await,
            },
            AuthCommands::Signout { json } => cmd_auth_signout(&store, json).await,
            AuthCommands::Reset { email, json } => cmd_auth_reset(&store, &email, json).await,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_plan_save() {
        let cli = Cli::try_parse_from([
            "mealplan",
            "plan",
            "save",
            "--week",
            "2024-06-13",
            "-m",
            "monday-dinner=Soup",
            "--meal",
            "tuesday-lunch=Salad",
        ])
        .unwrap();
        match cli.command {
            Commands::Plan {
                command: PlanCommands::Save { week, meals, .. },
            } => {
                assert_eq!(week.as_deref(), Some("2024-06-13"));
                assert_eq!(meals.len(), 2);
            }
            _ => panic!("expected plan save"),
        }
    }

    #[test]
    fn test_parse_oauth_callback() {
        let cli = Cli::try_parse_from([
            "mealplan",
            "auth",
            "oauth",
            "github",
            "--callback",
            "http://localhost:3000/#access_token=t",
        ])
        .unwrap();
        match cli.command {
            Commands::Auth {
                command: AuthCommands::Oauth { callback, .. },
            } => assert_eq!(callback.as_deref(), Some("http://localhost:3000/#access_token=t")),
            _ => panic!("expected auth oauth"),
        }

        let both = Cli::try_parse_from([
            "mealplan",
            "auth",
            "oauth",
            "github",
            "--redirect-to",
            "http://localhost:3000/",
            "--callback",
            "http://localhost:3000/#access_token=t",
        ]);
        assert!(both.is_err());
    }

    #[test]
    fn test_verbose_is_global() {
        let cli = Cli::try_parse_from(["mealplan", "recipe", "list", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }
}
