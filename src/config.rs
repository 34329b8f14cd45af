use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use crate::error_codes::{CodedError, INVALID_CONFIG};
use crate::schema::ConverterConfig;

pub fn load_and_validate_config(path: &Path) -> Result<ConverterConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let mut config: ConverterConfig = serde_yaml::from_str(&contents).map_err(|error| {
        let location = error
            .location()
            .map(|location| format!("line {}, column {}", location.line(), location.column()))
            .unwrap_or_else(|| "unknown location".to_owned());
        anyhow!(CodedError::config(
            INVALID_CONFIG,
            format!(
                "failed to parse yaml in {} at {}: {}",
                path.display(),
                location,
                error
            ),
        ))
    })?;

    resolve_relative_font(&mut config, path);
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

// Font paths in a config file are relative to the file, not the working directory.
fn resolve_relative_font(config: &mut ConverterConfig, config_path: &Path) {
    let Some(font) = config.font.as_ref() else {
        return;
    };
    if font.is_absolute() {
        return;
    }
    let config_dir = config_path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    config.font = Some(config_dir.join(font));
}
