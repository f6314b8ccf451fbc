//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::settings::UpgraderSettings;

#[derive(Parser)]
#[command(name = "thymio-upgrader")]
#[command(author, version, about = "Thymio II firmware upgrader", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Settings file (JSON). Defaults apply when it is missing
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Serial baud rate, overrides the settings file
    #[arg(long, global = true)]
    pub baud_rate: Option<u32>,

    /// Reply timeout for bootloader commands in milliseconds, overrides the settings file
    #[arg(long, global = true)]
    pub ack_timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List connected Thymio II robots
    Scan {
        /// Print one JSON array instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show what a hex image contains
    Inspect {
        /// Intel-HEX firmware image
        image: PathBuf,

        /// Print a JSON summary
        #[arg(long)]
        json: bool,

        /// Print the image re-serialized in canonical form
        #[arg(long, conflicts_with = "json")]
        normalized: bool,
    },

    /// Write a firmware image to the connected robot
    Upgrade {
        /// Intel-HEX firmware image, `-` to read it from stdin
        image: PathBuf,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Print progress as one JSON object per line
        #[arg(long)]
        json: bool,

        /// Skip page checksum verification
        #[arg(long)]
        no_verify: bool,
    },

    /// Show the effective settings
    Settings {
        /// Save the effective settings to the --settings file
        #[arg(long)]
        write: bool,
    },
}

impl Cli {
    /// Log filter matching the verbosity flags.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    /// Apply command-line overrides on top of loaded settings.
    pub fn apply_overrides(&self, settings: &mut UpgraderSettings) {
        if let Some(baud_rate) = self.baud_rate {
            settings.baud_rate = baud_rate;
        }
        if let Some(ack_timeout) = self.ack_timeout {
            settings.ack_timeout_ms = ack_timeout;
        }
        if let Commands::Upgrade {
            no_verify: true, ..
        } = self.command
        {
            settings.verify = false;
        }
    }
}
