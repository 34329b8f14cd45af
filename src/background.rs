//! Background fill resolution for glyph cells.
//!
//! The background of a cell is derived from the *original* source pixel,
//! never from the resolved foreground color. Resolution order is palette,
//! then fixed color, then a darkened copy of the pixel.

use crate::palette::{ColorResolver, PaletteResolver, Rgb};
use crate::schema::BackgroundConfig;

pub type Rgba = [u8; 4];

/// Strategy for a cell's background color.
pub trait BackgroundResolver: Send + Sync {
    fn background_color(&self, original: Rgb) -> Rgb;
}

#[derive(Debug)]
pub struct DefaultBackgroundResolver {
    palette: Option<PaletteResolver>,
    fixed: Option<Rgb>,
    darken: f32,
}

impl DefaultBackgroundResolver {
    pub fn new(palette: Option<Vec<Rgb>>, fixed: Option<Rgb>, darken: f32) -> Self {
        Self {
            palette: palette.and_then(PaletteResolver::new),
            fixed,
            darken,
        }
    }

    pub fn from_config(config: &BackgroundConfig) -> Self {
        Self::new(
            config.palette_rgb(),
            config.color.map(|color| color.as_array()),
            config.darken,
        )
    }
}

impl BackgroundResolver for DefaultBackgroundResolver {
    fn background_color(&self, original: Rgb) -> Rgb {
        if let Some(palette) = &self.palette {
            return palette.resolve(original);
        }
        if let Some(fixed) = self.fixed {
            return fixed;
        }
        darken_rgb(original, self.darken)
    }
}

/// What to paint underneath one glyph, in paint order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellBackground {
    pub base: Option<Rgba>,
    pub fill: Option<Rgba>,
}

/// Background plan for a cell whose source pixel is `original`.
///
/// `alpha` is the source alpha when the run preserves transparency. The fill
/// only carries it when `copy_alpha` is set; otherwise the fill is opaque and
/// always painted.
pub fn plan_cell_background(
    config: &BackgroundConfig,
    resolver: &dyn BackgroundResolver,
    original: Rgb,
    alpha: Option<u8>,
) -> CellBackground {
    let base = config.back_layer_color.map(|color| color.as_array());

    let [r, g, b] = resolver.background_color(original);
    let fill_alpha = if config.copy_alpha { alpha } else { None };
    let fill = config
        .passes_threshold(fill_alpha)
        .then_some([r, g, b, fill_alpha.unwrap_or(u8::MAX)]);

    CellBackground { base, fill }
}

/// Scale HLS lightness by `factor` and convert back. Lightness is clamped to `[0, 1]`.
pub fn darken_rgb(rgb: Rgb, factor: f32) -> Rgb {
    let [r, g, b] = rgb.map(|channel| f64::from(channel) / 255.0);
    let (h, l, s) = rgb_to_hls(r, g, b);
    let l = (l * f64::from(factor)).clamp(0.0, 1.0);
    let (r, g, b) = hls_to_rgb(h, l, s);
    [r, g, b].map(|channel| (channel * 255.0).round().clamp(0.0, 255.0) as u8)
}

pub fn rgb_to_hls(r: f64, g: f64, b: f64) -> (f64, f64, f64) {
    let maxc = r.max(g).max(b);
    let minc = r.min(g).min(b);
    let sumc = maxc + minc;
    let rangec = maxc - minc;
    let l = sumc / 2.0;
    if rangec == 0.0 {
        return (0.0, l, 0.0);
    }
    let s = if l <= 0.5 {
        rangec / sumc
    } else {
        rangec / (2.0 - maxc - minc)
    };
    let rc = (maxc - r) / rangec;
    let gc = (maxc - g) / rangec;
    let bc = (maxc - b) / rangec;
    let h = if r == maxc {
        bc - gc
    } else if g == maxc {
        2.0 + rc - bc
    } else {
        4.0 + gc - rc
    };
    ((h / 6.0).rem_euclid(1.0), l, s)
}

pub fn hls_to_rgb(h: f64, l: f64, s: f64) -> (f64, f64, f64) {
    if s == 0.0 {
        return (l, l, l);
    }
    let m2 = if l <= 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let m1 = 2.0 * l - m2;
    (
        hue_channel(m1, m2, h + 1.0 / 3.0),
        hue_channel(m1, m2, h),
        hue_channel(m1, m2, h - 1.0 / 3.0),
    )
}

fn hue_channel(m1: f64, m2: f64, hue: f64) -> f64 {
    let hue = hue.rem_euclid(1.0);
    if hue < 1.0 / 6.0 {
        m1 + (m2 - m1) * hue * 6.0
    } else if hue < 0.5 {
        m2
    } else if hue < 2.0 / 3.0 {
        m1 + (m2 - m1) * (2.0 / 3.0 - hue) * 6.0
    } else {
        m1
    }
}
