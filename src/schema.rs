use std::path::PathBuf;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error_codes::{CodedError, INVALID_CONFIG};

pub const DEFAULT_CHARS: &str = "gS#%@";
pub const DEFAULT_WIDTH: u32 = 80;
pub const DEFAULT_FONT_SIZE: f32 = 11.0;
pub const DEFAULT_DARKEN: f32 = 0.5;

/// Run-level settings for a conversion. Loaded from YAML or built in code.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConverterConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default)]
    pub transparent: bool,
    #[serde(default = "default_chars")]
    pub chars: String,
    #[serde(default)]
    pub font: Option<PathBuf>,
    #[serde(default = "default_font_size")]
    pub font_size: f32,
    #[serde(default)]
    pub palette: Option<Vec<ColorRgb>>,
    /// Memoize palette matches for every 24-bit color (32 MiB, built on first use).
    #[serde(default)]
    pub palette_lookup: bool,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub background: BackgroundConfig,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            transparent: false,
            chars: DEFAULT_CHARS.to_owned(),
            font: None,
            font_size: DEFAULT_FONT_SIZE,
            palette: None,
            palette_lookup: false,
            workers: None,
            background: BackgroundConfig::default(),
        }
    }
}

impl ConverterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 {
            return Err(invalid_config("width must be > 0", json!({ "width": 0 })));
        }
        if !self.font_size.is_finite() || self.font_size <= 0.0 {
            return Err(invalid_config(
                format!("font_size must be a positive finite number, got {}", self.font_size),
                json!({ "font_size": self.font_size }),
            ));
        }
        if self.workers == Some(0) {
            return Err(invalid_config("workers must be >= 1", json!({ "workers": 0 })));
        }
        self.background.validate()
    }

    /// Palette as plain triples; an empty list means "no palette".
    pub fn palette_rgb(&self) -> Option<Vec<[u8; 3]>> {
        palette_triples(self.palette.as_deref())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1)
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BackgroundConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub color: Option<ColorRgb>,
    #[serde(default, alias = "alpha")]
    pub copy_alpha: bool,
    #[serde(default)]
    pub palette: Option<Vec<ColorRgb>>,
    #[serde(default)]
    pub back_layer_color: Option<ColorRgba>,
    #[serde(default)]
    pub back_threshold: i32,
    #[serde(default = "default_darken")]
    pub darken: f32,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            color: None,
            copy_alpha: false,
            palette: None,
            back_layer_color: None,
            back_threshold: 0,
            darken: DEFAULT_DARKEN,
        }
    }
}

impl BackgroundConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.darken.is_finite() || self.darken < 0.0 {
            return Err(invalid_config(
                format!("background.darken must be a non-negative finite number, got {}", self.darken),
                json!({ "darken": self.darken }),
            ));
        }
        Ok(())
    }

    pub fn palette_rgb(&self) -> Option<Vec<[u8; 3]>> {
        palette_triples(self.palette.as_deref())
    }

    /// Alpha strictly above the threshold paints; absent alpha always paints.
    pub fn passes_threshold(&self, alpha: Option<u8>) -> bool {
        alpha.map_or(true, |alpha| i32::from(alpha) > self.back_threshold)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ColorRgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl ColorRgb {
    pub fn as_array(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

impl From<[u8; 3]> for ColorRgb {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Self { r, g, b }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ColorRgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    #[serde(default = "default_alpha")]
    pub a: u8,
}

impl ColorRgba {
    pub fn as_array(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

fn palette_triples(palette: Option<&[ColorRgb]>) -> Option<Vec<[u8; 3]>> {
    palette
        .filter(|entries| !entries.is_empty())
        .map(|entries| entries.iter().map(|color| color.as_array()).collect())
}

fn invalid_config(message: impl Into<String>, details: serde_json::Value) -> anyhow::Error {
    anyhow!(CodedError::config(INVALID_CONFIG, message).with_details(details))
}

fn default_width() -> u32 {
    DEFAULT_WIDTH
}

fn default_chars() -> String {
    DEFAULT_CHARS.to_owned()
}

fn default_font_size() -> f32 {
    DEFAULT_FONT_SIZE
}

fn default_darken() -> f32 {
    DEFAULT_DARKEN
}

fn default_alpha() -> u8 {
    255
}
