mod cache;
mod client;
mod commands;
mod config;
mod context;
mod error;
mod http;
mod model;
mod oauth;
mod settings;
mod store;
mod temperature;
#[cfg(test)]
mod test_support;
mod token;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::context::Context;
use crate::model::{HvacMode, Presence};
use crate::temperature::Scale;

#[derive(Parser)]
#[command(name = "nest-remote", about = "Control a Nest thermostat from the command line")]
struct Cli {
    /// Log requests and state changes to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage authorization
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
    /// Show the selected thermostat
    Status,
    /// Sync account data now
    Refresh,
    /// List all thermostats
    Devices,
    /// Show or set the target temperature
    Temp {
        /// Target in the preferred scale; omit to show the current target
        value: Option<f64>,
    },
    /// Set both ends of the heat-cool range at once
    Range { low: f64, high: f64 },
    /// Set the HVAC mode (heat, cool, heat-cool, eco, or off)
    Mode {
        #[arg(value_parser = parse::<HvacMode>)]
        mode: HvacMode,
    },
    /// Set home/away state (home, away, or auto-away)
    Presence {
        #[arg(value_parser = parse::<Presence>)]
        presence: Presence,
    },
    /// Change local preferences
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum AuthAction {
    /// Authorize through the browser and store the access token
    Login {
        /// Path to the OAuth client secret JSON file (copied into the data dir).
        /// It must be `{"installed": {...}}` with `client_id`, `client_secret`,
        /// `auth_uri`, `token_uri` and `redirect_uris`
        #[arg(long)]
        client_secret: Option<PathBuf>,
    },
    /// Show whether a valid token is stored
    Status,
    /// Remove the stored token
    Logout,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Select the thermostat to control, by ID or name
    Device { key: String },
    /// Choose celsius or fahrenheit
    Scale {
        #[arg(value_parser = parse::<Scale>)]
        scale: Scale,
    },
}

fn parse<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, String> {
    s.parse()
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let ctx = Context::from_env()?;

    match cli.command {
        Commands::Auth { action } => match action {
            AuthAction::Login { client_secret } => {
                commands::auth_login(&ctx, client_secret.as_deref()).await
            }
            AuthAction::Status => commands::auth_status(&ctx),
            AuthAction::Logout => commands::auth_logout(&ctx),
        },
        Commands::Status => commands::status(&ctx).await,
        Commands::Refresh => commands::refresh(&ctx).await,
        Commands::Devices => commands::list_devices(&ctx).await,
        Commands::Temp { value } => commands::temperature(&ctx, value).await,
        Commands::Range { low, high } => commands::set_range(&ctx, low, high).await,
        Commands::Mode { mode } => commands::set_mode(&ctx, mode).await,
        Commands::Presence { presence } => commands::set_presence(&ctx, presence).await,
        Commands::Config { action } => match action {
            ConfigAction::Device { key } => commands::config_device(&ctx, &key).await,
            ConfigAction::Scale { scale } => commands::config_scale(&ctx, scale),
        },
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
