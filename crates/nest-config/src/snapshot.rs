// ABOUTME: Writes a JSON snapshot of the resolved settings at startup.
// ABOUTME: Kept alongside run artifacts so every run is reproducible.

use crate::Settings;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Write the resolved settings to `<out_dir>/settings.json` and return the path.
pub fn write_settings_snapshot(settings: &Settings, out_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create snapshot directory {}", out_dir.display()))?;

    let snapshot = serde_json::json!({
        "written_at": chrono::Utc::now().to_rfc3339(),
        "settings": settings,
    });

    let path = out_dir.join("settings.json");
    let content =
        serde_json::to_string_pretty(&snapshot).context("Failed to serialize settings snapshot")?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write snapshot to {}", path.display()))?;

    tracing::debug!(path = %path.display(), "Wrote settings snapshot");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::default();

        let path = write_settings_snapshot(&settings, dir.path()).unwrap();
        assert!(path.ends_with("settings.json"));

        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["settings"]["mode"], "udp");
        assert!(value["written_at"].is_string());
    }

    #[test]
    fn test_snapshot_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("runs").join("latest");

        let settings = Settings::default();
        write_settings_snapshot(&settings, &nested).unwrap();
        assert!(nested.join("settings.json").exists());
    }
}
