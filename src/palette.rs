//! Foreground color resolution.
//!
//! A [`ColorResolver`] maps a source RGB triple onto the color the glyph is
//! drawn with. Alpha never passes through a resolver; the converter carries
//! it alongside and re-pairs it afterwards.

use std::sync::OnceLock;

pub type Rgb = [u8; 3];

const LOOKUP_TABLE_LEN: usize = 1 << 24;

/// Strategy for turning a source pixel into a foreground color.
///
/// Implementations must be total and deterministic; the converter calls them
/// from several worker threads at once.
pub trait ColorResolver: Send + Sync {
    fn resolve(&self, rgb: Rgb) -> Rgb;
}

/// Returns the pixel unchanged. Used when no palette is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl ColorResolver for Passthrough {
    fn resolve(&self, rgb: Rgb) -> Rgb {
        rgb
    }
}

/// Channel-average gray.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrayscaleResolver;

impl ColorResolver for GrayscaleResolver {
    fn resolve(&self, [r, g, b]: Rgb) -> Rgb {
        let sum = u32::from(r) + u32::from(g) + u32::from(b);
        let gray = ((sum + 1) / 3) as u8;
        [gray, gray, gray]
    }
}

/// Nearest-match quantizer over a fixed, non-empty palette.
#[derive(Debug)]
pub struct PaletteResolver {
    entries: Vec<Rgb>,
    lookup: Option<OnceLock<Box<[u16]>>>,
}

impl PaletteResolver {
    /// Returns `None` for an empty palette, which callers treat as "no palette".
    pub fn new(entries: Vec<Rgb>) -> Option<Self> {
        if entries.is_empty() {
            return None;
        }
        Some(Self {
            entries,
            lookup: None,
        })
    }

    /// Memoize every 24-bit color on first use. The table costs 32 MiB and is
    /// only worth it for large frame counts. Palettes longer than `u16::MAX + 1`
    /// entries keep using the direct search.
    pub fn with_lookup_table(mut self) -> Self {
        if self.entries.len() <= usize::from(u16::MAX) + 1 {
            self.lookup = Some(OnceLock::new());
        }
        self
    }

    pub fn entries(&self) -> &[Rgb] {
        &self.entries
    }

    pub fn nearest_index(&self, rgb: Rgb) -> usize {
        match &self.lookup {
            Some(cell) => {
                let table = cell.get_or_init(|| build_lookup_table(&self.entries));
                usize::from(table[pack_rgb(rgb)])
            }
            None => nearest_palette_index(&self.entries, rgb),
        }
    }
}

impl ColorResolver for PaletteResolver {
    fn resolve(&self, rgb: Rgb) -> Rgb {
        self.entries[self.nearest_index(rgb)]
    }
}

/// Index of the closest palette entry by Euclidean RGB distance.
///
/// Squared distances are compared, which orders identically to the Euclidean
/// distance. Exact ties keep the earliest entry. `palette` must be non-empty.
pub fn nearest_palette_index(palette: &[Rgb], rgb: Rgb) -> usize {
    let mut best_index = 0;
    let mut best_distance = u32::MAX;
    for (index, entry) in palette.iter().enumerate() {
        let distance = squared_distance(*entry, rgb);
        if distance < best_distance {
            best_distance = distance;
            best_index = index;
        }
    }
    best_index
}

pub fn squared_distance(a: Rgb, b: Rgb) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let delta = i32::from(x) - i32::from(y);
            (delta * delta) as u32
        })
        .sum()
}

fn pack_rgb([r, g, b]: Rgb) -> usize {
    (usize::from(r) << 16) | (usize::from(g) << 8) | usize::from(b)
}

fn build_lookup_table(palette: &[Rgb]) -> Box<[u16]> {
    log::debug!(
        "[glyphcast] building palette lookup table for {} entries",
        palette.len()
    );
    let mut table = vec![0_u16; LOOKUP_TABLE_LEN];
    for (packed, slot) in table.iter_mut().enumerate() {
        let rgb = [(packed >> 16) as u8, (packed >> 8) as u8, packed as u8];
        *slot = nearest_palette_index(palette, rgb) as u16;
    }
    table.into_boxed_slice()
}
