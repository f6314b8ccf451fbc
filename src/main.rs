mod cli;
mod commands;
mod settings;
mod upgrade;

#[cfg(test)]
mod test_helpers;

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;

use cli::{Cli, Commands};
use settings::{SettingsManager, UpgraderSettings};
use upgrade::{SerialTransport, Upgrader};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_filter()))
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_settings(cli: &Cli) -> Result<UpgraderSettings, String> {
    let mut settings = match &cli.settings {
        Some(path) => SettingsManager::new(path).load()?,
        None => UpgraderSettings::default(),
    };
    cli.apply_overrides(&mut settings);

    if settings.has_non_default_settings() {
        log::info!("Using non-default settings: {:?}", settings);
    }
    Ok(settings)
}

async fn run(cli: Cli) -> Result<u8, String> {
    let settings = load_settings(&cli)?;

    match cli.command {
        Commands::Scan { json } => {
            let upgrader = Arc::new(Upgrader::new(
                SerialTransport::new(settings.baud_rate),
                settings,
            ));
            commands::scan::run(upgrader, json).await?;
        }
        Commands::Inspect {
            image,
            json,
            normalized,
        } => {
            commands::inspect::run(image, json, normalized).await?;
        }
        Commands::Upgrade {
            image, yes, json, ..
        } => {
            let upgrader = Arc::new(Upgrader::new(
                SerialTransport::new(settings.baud_rate),
                settings,
            ));
            return commands::upgrade::run(upgrader, image, yes, json).await;
        }
        Commands::Settings { write } => {
            commands::settings::run(&settings, cli.settings.as_deref(), write)?;
        }
    }

    Ok(0)
}
