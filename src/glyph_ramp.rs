use anyhow::{anyhow, Result};
use serde_json::json;

use crate::error_codes::{CodedError, EMPTY_GLYPH_RAMP, GLYPH_RAMP_TOO_SHORT};

/// Upper bound of an RGB channel sum.
pub const MAX_BRIGHTNESS: u32 = 765;

/// Ordered glyphs, darkest first. Always holds at least two characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlyphRamp {
    glyphs: Vec<char>,
}

impl GlyphRamp {
    pub fn new(chars: &str) -> Result<Self> {
        let glyphs = chars.chars().collect::<Vec<_>>();
        match glyphs.len() {
            0 => Err(anyhow!(CodedError::config(
                EMPTY_GLYPH_RAMP,
                "glyph ramp must not be empty"
            ))),
            1 => Err(anyhow!(CodedError::config(
                GLYPH_RAMP_TOO_SHORT,
                format!("glyph ramp needs at least 2 characters, got '{chars}'"),
            )
            .with_details(json!({ "chars": chars, "len": 1 })))),
            _ => Ok(Self { glyphs }),
        }
    }

    pub fn len(&self) -> usize {
        self.glyphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.glyphs.is_empty()
    }

    pub fn glyphs(&self) -> &[char] {
        &self.glyphs
    }

    /// The glyph cell sizing is taken from.
    pub fn last(&self) -> char {
        self.glyphs[self.glyphs.len() - 1]
    }

    pub fn index_for(&self, brightness: i64) -> usize {
        brightness_to_index(brightness, self.glyphs.len())
    }

    pub fn glyph_for(&self, brightness: i64) -> char {
        self.glyphs[self.index_for(brightness)]
    }

    pub fn glyph_for_rgb(&self, [r, g, b]: [u8; 3]) -> char {
        self.glyph_for(i64::from(r) + i64::from(g) + i64::from(b))
    }
}

/// Linear remap of `[0, 765]` onto `[0, ramp_len - 1]`, rounded to nearest,
/// then clamped into range.
pub fn brightness_to_index(brightness: i64, ramp_len: usize) -> usize {
    if ramp_len <= 1 {
        return 0;
    }
    let top = (ramp_len - 1) as f64;
    let scaled = remap(brightness as f64, 0.0, f64::from(MAX_BRIGHTNESS), 0.0, top);
    if scaled <= 0.0 {
        return 0;
    }
    (scaled as usize).min(ramp_len - 1)
}

fn remap(x: f64, in_min: f64, in_max: f64, out_min: f64, out_max: f64) -> f64 {
    ((x - in_min) * (out_max - out_min) / (in_max - in_min) + out_min).round_ties_even()
}
