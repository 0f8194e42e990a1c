use crate::convert::{ConversionOptions, OutputFormat};
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_REVOKE_DELAY_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionSettings {
    /// Format preselected for new submissions.
    pub output_format: OutputFormat,
    pub options: ConversionOptions,
    /// How long a download link stays valid after delivery.
    pub download_url_revoke_delay_ms: u64,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::GeoParquet,
            options: ConversionOptions::default(),
            download_url_revoke_delay_ms: 1000,
        }
    }
}

impl ConversionSettings {
    pub fn revoke_delay(&self) -> Duration {
        Duration::from_millis(self.download_url_revoke_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.download_url_revoke_delay_ms > MAX_REVOKE_DELAY_MS {
            return Err(EngineError::InvalidSettings(format!(
                "download_url_revoke_delay_ms must be at most {MAX_REVOKE_DELAY_MS}, got {}",
                self.download_url_revoke_delay_ms
            )));
        }
        Ok(())
    }
}

pub fn load_settings(paths: &AppPaths) -> Result<ConversionSettings> {
    let path = paths.settings_path();
    if !path.exists() {
        return Ok(ConversionSettings::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: ConversionSettings = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::InvalidSettings(format!(
            "failed to parse settings at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn save_settings(paths: &AppPaths, settings: &ConversionSettings) -> Result<()> {
    settings.validate()?;
    let path = paths.settings_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}
