//! Glyph-grid to raster compositing.
//!
//! One [`CellCompositor`] renders one frame. Cells are written left to right
//! at a cursor that advances by a fixed cell size. The size comes from the
//! last ramp glyph, so proportional fonts will not line up. Once all rows are
//! drawn the canvas is cropped to exactly `grid * cell` pixels.

use anyhow::{anyhow, Result};
use image::{Rgba, RgbaImage};
use tiny_skia::{BlendMode, Color, Paint, Pixmap, PremultipliedColorU8, Rect, Transform};

use crate::background::CellBackground;
use crate::glyph_painter::{GlyphBitmap, GlyphPainter};

/// Logical scratch bound in pixels. Anything drawn past it is lost.
pub const CANVAS_BOUND: u32 = 10_000;

/// One classified source pixel, ready to draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlyphCell {
    pub glyph: char,
    /// `None` when the glyph is gated off by the background threshold.
    pub foreground: Option<[u8; 4]>,
    pub background: CellBackground,
    pub grid_x: u32,
    pub grid_y: u32,
}

/// Scratch raster for a single frame.
///
/// Only the part of the logical bound a frame can reach is allocated.
pub struct Canvas {
    pixmap: Pixmap,
}

impl Canvas {
    pub fn new(required_width: u64, required_height: u64, transparent: bool) -> Result<Self> {
        Self::with_bound(required_width, required_height, CANVAS_BOUND, transparent)
    }

    pub fn with_bound(
        required_width: u64,
        required_height: u64,
        bound: u32,
        transparent: bool,
    ) -> Result<Self> {
        let width = required_width.clamp(1, u64::from(bound.max(1))) as u32;
        let height = required_height.clamp(1, u64::from(bound.max(1))) as u32;
        let mut pixmap = Pixmap::new(width, height)
            .ok_or_else(|| anyhow!("failed to allocate {width}x{height} canvas"))?;
        if !transparent {
            pixmap.fill(Color::BLACK);
        }
        Ok(Self { pixmap })
    }

    pub fn width(&self) -> u32 {
        self.pixmap.width()
    }

    pub fn height(&self) -> u32 {
        self.pixmap.height()
    }

    /// Overwrites the rectangle, alpha included.
    pub fn fill_rect(&mut self, x: u32, y: u32, width: u32, height: u32, color: [u8; 4]) {
        self.paint_rect(x, y, width, height, color, BlendMode::Source);
    }

    /// Composites the rectangle over what is already there.
    pub fn blend_rect(&mut self, x: u32, y: u32, width: u32, height: u32, color: [u8; 4]) {
        self.paint_rect(x, y, width, height, color, BlendMode::SourceOver);
    }

    fn paint_rect(&mut self, x: u32, y: u32, width: u32, height: u32, color: [u8; 4], blend_mode: BlendMode) {
        if x >= self.width() || y >= self.height() {
            return;
        }
        let Some(rect) = Rect::from_xywh(x as f32, y as f32, width as f32, height as f32) else {
            return;
        };
        let mut paint = Paint::default();
        paint.set_color_rgba8(color[0], color[1], color[2], color[3]);
        paint.blend_mode = blend_mode;
        paint.anti_alias = false;
        self.pixmap.fill_rect(rect, &paint, Transform::identity(), None);
    }

    /// Source-over blend of a coverage mask tinted with `color`.
    pub fn draw_glyph(&mut self, x: i64, y: i64, glyph: &GlyphBitmap, color: [u8; 4]) {
        let canvas_width = i64::from(self.width());
        let canvas_height = i64::from(self.height());
        let pixels = self.pixmap.pixels_mut();

        for row in 0..glyph.height {
            let py = y + i64::from(glyph.offset_y) + row as i64;
            if py < 0 || py >= canvas_height {
                continue;
            }
            for col in 0..glyph.width {
                let px = x + i64::from(glyph.offset_x) + col as i64;
                if px < 0 || px >= canvas_width {
                    continue;
                }
                let mask = glyph.coverage[row * glyph.width + col];
                if mask == 0 {
                    continue;
                }
                let idx = (py * canvas_width + px) as usize;
                pixels[idx] = blend_over(pixels[idx], color, mask);
            }
        }
    }

    /// Exactly `width` x `height`; area past the backing store stays transparent.
    pub fn crop(&self, width: u32, height: u32) -> RgbaImage {
        let mut out = RgbaImage::new(width, height);
        let copy_width = width.min(self.width());
        let copy_height = height.min(self.height());
        let pixels = self.pixmap.pixels();
        for y in 0..copy_height {
            for x in 0..copy_width {
                let color = pixels[(y * self.width() + x) as usize].demultiply();
                out.put_pixel(
                    x,
                    y,
                    Rgba([color.red(), color.green(), color.blue(), color.alpha()]),
                );
            }
        }
        out
    }
}

fn div255(value: u32) -> u32 {
    (value + 127) / 255
}

fn blend_over(dst: PremultipliedColorU8, color: [u8; 4], mask: u8) -> PremultipliedColorU8 {
    let src_alpha = div255(u32::from(color[3]) * u32::from(mask));
    if src_alpha == 0 {
        return dst;
    }
    let inv_alpha = 255 - src_alpha;
    let channel = |src: u8, dst: u8| -> u8 {
        (div255(u32::from(src) * src_alpha) + div255(u32::from(dst) * inv_alpha)).min(255) as u8
    };
    let alpha = (src_alpha + div255(u32::from(dst.alpha()) * inv_alpha)).min(255) as u8;
    PremultipliedColorU8::from_rgba(
        channel(color[0], dst.red()),
        channel(color[1], dst.green()),
        channel(color[2], dst.blue()),
        alpha,
    )
    .unwrap_or(dst)
}

pub struct CellCompositor<'a> {
    painter: &'a dyn GlyphPainter,
    canvas: Canvas,
    cell_width: u32,
    cell_height: u32,
    grid_width: u32,
    grid_height: u32,
    cursor_x: u32,
    cursor_y: u32,
}

impl<'a> CellCompositor<'a> {
    pub fn new(
        painter: &'a dyn GlyphPainter,
        sizing_glyph: char,
        grid_width: u32,
        grid_height: u32,
        transparent: bool,
    ) -> Result<Self> {
        Self::with_bound(
            painter,
            sizing_glyph,
            grid_width,
            grid_height,
            CANVAS_BOUND,
            transparent,
        )
    }

    pub fn with_bound(
        painter: &'a dyn GlyphPainter,
        sizing_glyph: char,
        grid_width: u32,
        grid_height: u32,
        bound: u32,
        transparent: bool,
    ) -> Result<Self> {
        let (cell_width, cell_height) = painter.cell_size(sizing_glyph);
        let canvas = Canvas::with_bound(
            u64::from(grid_width) * u64::from(cell_width),
            u64::from(grid_height) * u64::from(cell_height),
            bound,
            transparent,
        )?;
        Ok(Self {
            painter,
            canvas,
            cell_width,
            cell_height,
            grid_width,
            grid_height,
            cursor_x: 0,
            cursor_y: 0,
        })
    }

    pub fn cell_size(&self) -> (u32, u32) {
        (self.cell_width, self.cell_height)
    }

    /// Paints base layer, background fill, then glyph at the cursor and
    /// advances it by one cell.
    pub fn draw_cell(&mut self, cell: &GlyphCell) {
        debug_assert_eq!(
            (
                u64::from(cell.grid_x) * u64::from(self.cell_width),
                u64::from(cell.grid_y) * u64::from(self.cell_height)
            ),
            (u64::from(self.cursor_x), u64::from(self.cursor_y)),
            "cells must arrive in row-major order"
        );
        let (x, y) = (self.cursor_x, self.cursor_y);
        let (w, h) = (self.cell_width, self.cell_height);

        if let Some(base) = cell.background.base {
            self.canvas.fill_rect(x, y, w, h, base);
        }
        if let Some(fill) = cell.background.fill {
            self.canvas.blend_rect(x, y, w, h, fill);
        }
        if let Some(color) = cell.foreground {
            if let Some(bitmap) = self.painter.glyph(cell.glyph) {
                self.canvas.draw_glyph(i64::from(x), i64::from(y), bitmap, color);
            }
        }

        self.cursor_x = self.cursor_x.saturating_add(w);
    }

    pub fn end_row(&mut self) {
        self.cursor_x = 0;
        self.cursor_y = self.cursor_y.saturating_add(self.cell_height);
    }

    pub fn finish(self) -> RgbaImage {
        self.canvas.crop(
            self.grid_width.saturating_mul(self.cell_width),
            self.grid_height.saturating_mul(self.cell_height),
        )
    }
}
