//! Glyph metrics and rasterization.
//!
//! A [`GlyphPainter`] answers two questions for the compositor: how large is
//! a cell, and which coverage mask does a glyph leave inside it. Painters are
//! built once per run with every ramp glyph pre-rasterized, so they are
//! immutable and can be shared by all frame workers.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use fontdue::{Font, FontSettings};

use crate::glyph_ramp::GlyphRamp;

/// Coverage mask for one glyph, positioned relative to its cell's top-left corner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlyphBitmap {
    pub width: usize,
    pub height: usize,
    pub offset_x: i32,
    pub offset_y: i32,
    pub coverage: Vec<u8>,
}

pub trait GlyphPainter: Send + Sync {
    fn cell_size(&self, glyph: char) -> (u32, u32);

    /// `None` for glyphs that leave the cell empty.
    fn glyph(&self, glyph: char) -> Option<&GlyphBitmap>;

    fn label(&self) -> String;
}

/// Font-backed painter, or the built-in bitmap font when `font` is absent or unusable.
pub fn load_painter(font: Option<&Path>, font_size: f32, ramp: &GlyphRamp) -> Box<dyn GlyphPainter> {
    let Some(path) = font else {
        return Box::new(BuiltinPainter::new(ramp));
    };
    match FontPainter::from_path(path, font_size, ramp) {
        Ok(painter) => Box::new(painter),
        Err(error) => {
            log::warn!("[glyphcast] falling back to built-in glyphs: {error:#}");
            Box::new(BuiltinPainter::new(ramp))
        }
    }
}

pub struct FontPainter {
    name: String,
    font_size: f32,
    line_height: u32,
    advances: HashMap<char, u32>,
    glyph_cache: HashMap<char, GlyphBitmap>,
}

impl FontPainter {
    pub fn from_path(font_path: &Path, font_size: f32, ramp: &GlyphRamp) -> Result<Self> {
        let font_bytes = std::fs::read(font_path)
            .with_context(|| format!("failed to read font file {}", font_path.display()))?;
        let name = font_path.display().to_string();
        Self::from_bytes(font_bytes, &name, font_size, ramp)
    }

    pub fn from_bytes(font_bytes: Vec<u8>, name: &str, font_size: f32, ramp: &GlyphRamp) -> Result<Self> {
        let font = Font::from_bytes(font_bytes, FontSettings::default())
            .map_err(|error| anyhow!("failed to parse font {name}: {error}"))?;
        ensure_supported_codepoints(&font, ramp, name)?;

        let (ascent, line_height) = match font.horizontal_line_metrics(font_size) {
            Some(line) => (line.ascent, (line.ascent - line.descent).ceil().max(1.0) as u32),
            None => (font_size, font_size.ceil().max(1.0) as u32),
        };

        let mut advances = HashMap::new();
        let mut glyph_cache = HashMap::new();
        for &ch in ramp.glyphs() {
            let (metrics, bitmap) = font.rasterize(ch, font_size);
            advances.insert(ch, metrics.advance_width.ceil().max(1.0) as u32);
            if metrics.width == 0 || metrics.height == 0 {
                continue;
            }
            glyph_cache.insert(
                ch,
                GlyphBitmap {
                    width: metrics.width,
                    height: metrics.height,
                    offset_x: metrics.xmin,
                    offset_y: ascent.round() as i32 - (metrics.ymin + metrics.height as i32),
                    coverage: bitmap,
                },
            );
        }

        Ok(Self {
            name: name.to_owned(),
            font_size,
            line_height,
            advances,
            glyph_cache,
        })
    }
}

impl GlyphPainter for FontPainter {
    fn cell_size(&self, glyph: char) -> (u32, u32) {
        let width = self.advances.get(&glyph).copied().unwrap_or(1);
        (width, self.line_height)
    }

    fn glyph(&self, glyph: char) -> Option<&GlyphBitmap> {
        self.glyph_cache.get(&glyph)
    }

    fn label(&self) -> String {
        format!("{} @ {}px", self.name, self.font_size)
    }
}

fn ensure_supported_codepoints(font: &Font, ramp: &GlyphRamp, font_name: &str) -> Result<()> {
    for &ch in ramp.glyphs() {
        if ch == ' ' {
            continue;
        }
        if font.lookup_glyph_index(ch) == 0 {
            return Err(anyhow!(
                "unsupported codepoint U+{:04X} ({}) in {}",
                ch as u32,
                ch.escape_default(),
                font_name
            ));
        }
    }
    Ok(())
}

/// Cell of the built-in 5x7 font: one column and two rows of spacing.
pub const BUILTIN_CELL_WIDTH: u32 = 6;
pub const BUILTIN_CELL_HEIGHT: u32 = 9;

/// Fixed-metric fallback used when no font is configured.
pub struct BuiltinPainter {
    glyph_cache: HashMap<char, GlyphBitmap>,
}

impl BuiltinPainter {
    pub fn new(ramp: &GlyphRamp) -> Self {
        let glyph_cache = ramp
            .glyphs()
            .iter()
            .filter_map(|&ch| builtin_bitmap(ch).map(|bitmap| (ch, bitmap)))
            .collect();
        Self { glyph_cache }
    }
}

impl GlyphPainter for BuiltinPainter {
    fn cell_size(&self, _glyph: char) -> (u32, u32) {
        (BUILTIN_CELL_WIDTH, BUILTIN_CELL_HEIGHT)
    }

    fn glyph(&self, glyph: char) -> Option<&GlyphBitmap> {
        self.glyph_cache.get(&glyph)
    }

    fn label(&self) -> String {
        "builtin 5x7".to_owned()
    }
}

fn builtin_bitmap(ch: char) -> Option<GlyphBitmap> {
    let (width, height) = (BUILTIN_CELL_WIDTH as usize, BUILTIN_CELL_HEIGHT as usize);
    let shade = |on: fn(usize, usize) -> bool| {
        let coverage = (0..height)
            .flat_map(|y| (0..width).map(move |x| if on(x, y) { u8::MAX } else { 0 }))
            .collect();
        Some(GlyphBitmap {
            width,
            height,
            offset_x: 0,
            offset_y: 0,
            coverage,
        })
    };

    match ch {
        '░' => shade(|x, y| x % 2 == 0 && y % 2 == 0),
        '▒' => shade(|x, y| (x + y) % 2 == 0),
        '▓' => shade(|x, y| !(x % 2 == 0 && y % 2 == 0)),
        '█' => shade(|_, _| true),
        ' '..='~' => {
            let rows = &FONT_5X7[(ch as u32 - 32) as usize];
            if rows.iter().all(|&bits| bits == 0) {
                return None;
            }
            let coverage = rows
                .iter()
                .flat_map(|&bits| {
                    (0..5_u32).map(move |col| if bits & (0x10 >> col) != 0 { u8::MAX } else { 0 })
                })
                .collect();
            Some(GlyphBitmap {
                width: 5,
                height: 7,
                offset_x: 0,
                offset_y: 1,
                coverage,
            })
        }
        _ => None,
    }
}

/// Each glyph: 7 rows, each row's lower 5 bits = pixels (MSB=left).
#[rustfmt::skip]
const FONT_5X7: [[u8; 7]; 95] = [
    [0x00,0x00,0x00,0x00,0x00,0x00,0x00], // 32 ' '
    [0x04,0x04,0x04,0x04,0x04,0x00,0x04], // 33 '!'
    [0x0A,0x0A,0x0A,0x00,0x00,0x00,0x00], // 34 '"'
    [0x0A,0x0A,0x1F,0x0A,0x1F,0x0A,0x0A], // 35 '#'
    [0x04,0x0F,0x14,0x0E,0x05,0x1E,0x04], // 36 '$'
    [0x18,0x19,0x02,0x04,0x08,0x13,0x03], // 37 '%'
    [0x0C,0x12,0x14,0x08,0x15,0x12,0x0D], // 38 '&'
    [0x04,0x04,0x08,0x00,0x00,0x00,0x00], // 39 '''
    [0x02,0x04,0x08,0x08,0x08,0x04,0x02], // 40 '('
    [0x08,0x04,0x02,0x02,0x02,0x04,0x08], // 41 ')'
    [0x00,0x04,0x15,0x0E,0x15,0x04,0x00], // 42 '*'
    [0x00,0x04,0x04,0x1F,0x04,0x04,0x00], // 43 '+'
    [0x00,0x00,0x00,0x00,0x00,0x04,0x08], // 44 ','
    [0x00,0x00,0x00,0x1F,0x00,0x00,0x00], // 45 '-'
    [0x00,0x00,0x00,0x00,0x00,0x00,0x04], // 46 '.'
    [0x00,0x01,0x02,0x04,0x08,0x10,0x00], // 47 '/'
    [0x0E,0x11,0x13,0x15,0x19,0x11,0x0E], // 48 '0'
    [0x04,0x0C,0x04,0x04,0x04,0x04,0x0E], // 49 '1'
    [0x0E,0x11,0x01,0x02,0x04,0x08,0x1F], // 50 '2'
    [0x1F,0x02,0x04,0x02,0x01,0x11,0x0E], // 51 '3'
    [0x02,0x06,0x0A,0x12,0x1F,0x02,0x02], // 52 '4'
    [0x1F,0x10,0x1E,0x01,0x01,0x11,0x0E], // 53 '5'
    [0x06,0x08,0x10,0x1E,0x11,0x11,0x0E], // 54 '6'
    [0x1F,0x01,0x02,0x04,0x08,0x08,0x08], // 55 '7'
    [0x0E,0x11,0x11,0x0E,0x11,0x11,0x0E], // 56 '8'
    [0x0E,0x11,0x11,0x0F,0x01,0x02,0x0C], // 57 '9'
    [0x00,0x00,0x04,0x00,0x00,0x04,0x00], // 58 ':'
    [0x00,0x00,0x04,0x00,0x00,0x04,0x08], // 59 ';'
    [0x02,0x04,0x08,0x10,0x08,0x04,0x02], // 60 '<'
    [0x00,0x00,0x1F,0x00,0x1F,0x00,0x00], // 61 '='
    [0x08,0x04,0x02,0x01,0x02,0x04,0x08], // 62 '>'
    [0x0E,0x11,0x01,0x02,0x04,0x00,0x04], // 63 '?'
    [0x0E,0x11,0x17,0x15,0x17,0x10,0x0E], // 64 '@'
    [0x0E,0x11,0x11,0x1F,0x11,0x11,0x11], // 65 'A'
    [0x1E,0x11,0x11,0x1E,0x11,0x11,0x1E], // 66 'B'
    [0x0E,0x11,0x10,0x10,0x10,0x11,0x0E], // 67 'C'
    [0x1C,0x12,0x11,0x11,0x11,0x12,0x1C], // 68 'D'
    [0x1F,0x10,0x10,0x1E,0x10,0x10,0x1F], // 69 'E'
    [0x1F,0x10,0x10,0x1E,0x10,0x10,0x10], // 70 'F'
    [0x0E,0x11,0x10,0x17,0x11,0x11,0x0F], // 71 'G'
    [0x11,0x11,0x11,0x1F,0x11,0x11,0x11], // 72 'H'
    [0x0E,0x04,0x04,0x04,0x04,0x04,0x0E], // 73 'I'
    [0x07,0x02,0x02,0x02,0x02,0x12,0x0C], // 74 'J'
    [0x11,0x12,0x14,0x18,0x14,0x12,0x11], // 75 'K'
    [0x10,0x10,0x10,0x10,0x10,0x10,0x1F], // 76 'L'
    [0x11,0x1B,0x15,0x15,0x11,0x11,0x11], // 77 'M'
    [0x11,0x11,0x19,0x15,0x13,0x11,0x11], // 78 'N'
    [0x0E,0x11,0x11,0x11,0x11,0x11,0x0E], // 79 'O'
    [0x1E,0x11,0x11,0x1E,0x10,0x10,0x10], // 80 'P'
    [0x0E,0x11,0x11,0x11,0x15,0x12,0x0D], // 81 'Q'
    [0x1E,0x11,0x11,0x1E,0x14,0x12,0x11], // 82 'R'
    [0x0F,0x10,0x10,0x0E,0x01,0x01,0x1E], // 83 'S'
    [0x1F,0x04,0x04,0x04,0x04,0x04,0x04], // 84 'T'
    [0x11,0x11,0x11,0x11,0x11,0x11,0x0E], // 85 'U'
    [0x11,0x11,0x11,0x11,0x11,0x0A,0x04], // 86 'V'
    [0x11,0x11,0x11,0x15,0x15,0x1B,0x11], // 87 'W'
    [0x11,0x11,0x0A,0x04,0x0A,0x11,0x11], // 88 'X'
    [0x11,0x11,0x0A,0x04,0x04,0x04,0x04], // 89 'Y'
    [0x1F,0x01,0x02,0x04,0x08,0x10,0x1F], // 90 'Z'
    [0x0E,0x08,0x08,0x08,0x08,0x08,0x0E], // 91 '['
    [0x00,0x10,0x08,0x04,0x02,0x01,0x00], // 92 '\'
    [0x0E,0x02,0x02,0x02,0x02,0x02,0x0E], // 93 ']'
    [0x04,0x0A,0x11,0x00,0x00,0x00,0x00], // 94 '^'
    [0x00,0x00,0x00,0x00,0x00,0x00,0x1F], // 95 '_'
    [0x08,0x04,0x02,0x00,0x00,0x00,0x00], // 96 '`'
    [0x00,0x00,0x0E,0x01,0x0F,0x11,0x0F], // 97 'a'
    [0x10,0x10,0x16,0x19,0x11,0x11,0x1E], // 98 'b'
    [0x00,0x00,0x0E,0x10,0x10,0x11,0x0E], // 99 'c'
    [0x01,0x01,0x0D,0x13,0x11,0x11,0x0F], // 100 'd'
    [0x00,0x00,0x0E,0x11,0x1F,0x10,0x0E], // 101 'e'
    [0x06,0x09,0x08,0x1C,0x08,0x08,0x08], // 102 'f'
    [0x00,0x00,0x0F,0x11,0x0F,0x01,0x0E], // 103 'g'
    [0x10,0x10,0x16,0x19,0x11,0x11,0x11], // 104 'h'
    [0x04,0x00,0x0C,0x04,0x04,0x04,0x0E], // 105 'i'
    [0x02,0x00,0x06,0x02,0x02,0x12,0x0C], // 106 'j'
    [0x10,0x10,0x12,0x14,0x18,0x14,0x12], // 107 'k'
    [0x0C,0x04,0x04,0x04,0x04,0x04,0x0E], // 108 'l'
    [0x00,0x00,0x1A,0x15,0x15,0x11,0x11], // 109 'm'
    [0x00,0x00,0x16,0x19,0x11,0x11,0x11], // 110 'n'
    [0x00,0x00,0x0E,0x11,0x11,0x11,0x0E], // 111 'o'
    [0x00,0x00,0x1E,0x11,0x1E,0x10,0x10], // 112 'p'
    [0x00,0x00,0x0D,0x13,0x0F,0x01,0x01], // 113 'q'
    [0x00,0x00,0x16,0x19,0x10,0x10,0x10], // 114 'r'
    [0x00,0x00,0x0E,0x10,0x0E,0x01,0x1E], // 115 's'
    [0x08,0x08,0x1C,0x08,0x08,0x09,0x06], // 116 't'
    [0x00,0x00,0x11,0x11,0x11,0x13,0x0D], // 117 'u'
    [0x00,0x00,0x11,0x11,0x11,0x0A,0x04], // 118 'v'
    [0x00,0x00,0x11,0x11,0x15,0x15,0x0A], // 119 'w'
    [0x00,0x00,0x11,0x0A,0x04,0x0A,0x11], // 120 'x'
    [0x00,0x00,0x11,0x11,0x0F,0x01,0x0E], // 121 'y'
    [0x00,0x00,0x1F,0x02,0x04,0x08,0x1F], // 122 'z'
    [0x02,0x04,0x04,0x08,0x04,0x04,0x02], // 123 '{'
    [0x04,0x04,0x04,0x04,0x04,0x04,0x04], // 124 '|'
    [0x08,0x04,0x04,0x02,0x04,0x04,0x08], // 125 '}'
    [0x00,0x00,0x08,0x15,0x02,0x00,0x00], // 126 '~'
];

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> GlyphRamp {
        GlyphRamp::new("gS#%@").unwrap()
    }

    #[test]
    fn builtin_cell_is_fixed_for_every_glyph() {
        let painter = BuiltinPainter::new(&ramp());
        assert_eq!(painter.cell_size('g'), (6, 9));
        assert_eq!(painter.cell_size('@'), (6, 9));
    }

    #[test]
    fn builtin_hash_sign_has_visible_pixels() {
        let painter = BuiltinPainter::new(&ramp());
        let bitmap = painter.glyph('#').expect("'#' should rasterize");
        assert_eq!((bitmap.width, bitmap.height), (5, 7));
        // 0x0A -> .#.#.
        assert_eq!(&bitmap.coverage[..5], &[0, 255, 0, 255, 0]);
    }

    #[test]
    fn space_has_no_bitmap() {
        let painter = BuiltinPainter::new(&GlyphRamp::new(" .@").unwrap());
        assert!(painter.glyph(' ').is_none());
        assert!(painter.glyph('.').is_some());
    }

    #[test]
    fn full_block_covers_whole_cell() {
        let painter = BuiltinPainter::new(&GlyphRamp::new(" █").unwrap());
        let bitmap = painter.glyph('█').unwrap();
        assert_eq!(bitmap.coverage.len(), 54);
        assert!(bitmap.coverage.iter().all(|&value| value == 255));
    }

    #[test]
    fn missing_font_falls_back_to_builtin() {
        let painter = load_painter(Some(Path::new("/nonexistent/font.ttf")), 11.0, &ramp());
        assert_eq!(painter.label(), "builtin 5x7");
        assert_eq!(painter.cell_size('@'), (6, 9));
    }

    #[test]
    fn garbage_font_bytes_are_rejected() {
        let result = FontPainter::from_bytes(b"not a font".to_vec(), "junk", 11.0, &ramp());
        assert!(result.is_err());
    }
}
