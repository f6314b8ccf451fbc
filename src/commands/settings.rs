//! `settings` command: show and persist the effective settings.

use std::path::Path;

use crate::settings::{SettingsManager, UpgraderSettings};

/// Print the effective settings, saving them first when `write` is set.
pub fn run(settings: &UpgraderSettings, path: Option<&Path>, write: bool) -> Result<(), String> {
    if write {
        let path = path.ok_or("--write needs a --settings file")?;
        let manager = SettingsManager::new(path);
        manager.save(settings)?;
        log::info!("Saved settings to {}", manager.settings_path().display());
    }

    let text = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    println!("{}", text);
    Ok(())
}
