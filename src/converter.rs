use anyhow::{anyhow, Result};
use image::{DynamicImage, RgbaImage};
use serde_json::json;

use crate::background::{plan_cell_background, BackgroundResolver, CellBackground, DefaultBackgroundResolver};
use crate::compositor::{CellCompositor, GlyphCell};
use crate::error_codes::{CodedError, INVALID_ASPECT_RATIO};
use crate::glyph_painter::{load_painter, GlyphPainter};
use crate::glyph_ramp::GlyphRamp;
use crate::palette::{ColorResolver, PaletteResolver, Passthrough};
use crate::pixel_grid::PixelGrid;
use crate::schema::ConverterConfig;

/// Immutable per-run renderer. Shared by reference across frame workers.
pub struct Converter {
    config: ConverterConfig,
    ramp: GlyphRamp,
    color_resolver: Box<dyn ColorResolver>,
    background_resolver: Box<dyn BackgroundResolver>,
    painter: Box<dyn GlyphPainter>,
}

impl Converter {
    /// Builds the default strategies from `config`: palette or passthrough for
    /// the foreground, palette/fixed/darken for the background.
    pub fn new(config: ConverterConfig) -> Result<Self> {
        let color_resolver: Box<dyn ColorResolver> =
            match config.palette_rgb().and_then(PaletteResolver::new) {
                Some(palette) if config.palette_lookup => Box::new(palette.with_lookup_table()),
                Some(palette) => Box::new(palette),
                None => Box::new(Passthrough),
            };
        let background_resolver = Box::new(DefaultBackgroundResolver::from_config(&config.background));
        Self::with_resolvers(config, color_resolver, background_resolver)
    }

    pub fn with_resolvers(
        config: ConverterConfig,
        color_resolver: Box<dyn ColorResolver>,
        background_resolver: Box<dyn BackgroundResolver>,
    ) -> Result<Self> {
        config.validate()?;
        let ramp = GlyphRamp::new(&config.chars)?;
        let painter = load_painter(config.font.as_deref(), config.font_size, &ramp);
        log::debug!(
            "[glyphcast] converter ready: ramp='{}' glyphs={} painter={}",
            config.chars,
            ramp.len(),
            painter.label()
        );
        Ok(Self {
            config,
            ramp,
            color_resolver,
            background_resolver,
            painter,
        })
    }

    pub fn with_painter(mut self, painter: Box<dyn GlyphPainter>) -> Self {
        self.painter = painter;
        self
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    pub fn ramp(&self) -> &GlyphRamp {
        &self.ramp
    }

    pub fn painter(&self) -> &dyn GlyphPainter {
        self.painter.as_ref()
    }

    /// Cell size for every frame of this run, taken from the brightest glyph.
    pub fn cell_size(&self) -> (u32, u32) {
        self.painter.cell_size(self.ramp.last())
    }

    /// Character grid for a source of `source_width` x `source_height` pixels.
    ///
    /// Glyphs are roughly twice as tall as wide, so the height is halved.
    pub fn grid_size(&self, source_width: u32, source_height: u32) -> Result<(u32, u32)> {
        grid_size_for(self.config.width, source_width, source_height)
    }

    /// Per-pixel classification: resolved color, glyph and background.
    pub fn classify(&self, pixel: [u8; 4], grid_x: u32, grid_y: u32) -> GlyphCell {
        let [r, g, b, a] = pixel;
        let alpha = self.config.transparent.then_some(a);
        let resolved = self.color_resolver.resolve([r, g, b]);
        let glyph = self.ramp.glyph_for_rgb(resolved);
        let foreground = [resolved[0], resolved[1], resolved[2], alpha.unwrap_or(u8::MAX)];

        let background_config = &self.config.background;
        let (background, foreground) = if background_config.enabled {
            let background = plan_cell_background(
                background_config,
                self.background_resolver.as_ref(),
                [r, g, b],
                alpha,
            );
            let foreground = background_config
                .passes_threshold(alpha)
                .then_some(foreground);
            (background, foreground)
        } else {
            (CellBackground::default(), Some(foreground))
        };

        GlyphCell {
            glyph,
            foreground,
            background,
            grid_x,
            grid_y,
        }
    }

    pub fn render_rgba(&self, grid: &PixelGrid) -> Result<RgbaImage> {
        let mut compositor = CellCompositor::new(
            self.painter.as_ref(),
            self.ramp.last(),
            grid.width(),
            grid.height(),
            self.config.transparent,
        )?;
        for (grid_y, row) in grid.rows().enumerate() {
            for (grid_x, pixel) in row.iter().enumerate() {
                let cell = self.classify(*pixel, grid_x as u32, grid_y as u32);
                compositor.draw_cell(&cell);
            }
            compositor.end_row();
        }
        Ok(compositor.finish())
    }

    /// One finished frame in the configured color mode.
    pub fn render_frame(&self, grid: &PixelGrid) -> Result<DynamicImage> {
        let rgba = self.render_rgba(grid)?;
        if self.config.transparent {
            Ok(DynamicImage::ImageRgba8(rgba))
        } else {
            Ok(DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(rgba).to_rgb8()))
        }
    }

    /// Resizes a decoded image to the grid and renders it.
    pub fn render_image(&self, image: &DynamicImage) -> Result<DynamicImage> {
        let (width, height) = self.grid_size(image.width(), image.height())?;
        let grid = PixelGrid::from_image_resized(image, width, height);
        self.render_frame(&grid)
    }
}

pub fn grid_size_for(width: u32, source_width: u32, source_height: u32) -> Result<(u32, u32)> {
    if source_width == 0 || source_height == 0 {
        return Err(anyhow!(CodedError::config(
            INVALID_ASPECT_RATIO,
            format!("source dimensions must be > 0, got {source_width}x{source_height}"),
        )
        .with_details(json!({ "source_width": source_width, "source_height": source_height }))));
    }
    let aspect_ratio = f64::from(source_width) / f64::from(source_height);
    let height = (f64::from(width) / (2.0 * aspect_ratio)) as u32;
    if height == 0 {
        return Err(anyhow!(CodedError::config(
            INVALID_ASPECT_RATIO,
            format!(
                "a {source_width}x{source_height} source at width {width} yields a zero-height grid"
            ),
        )
        .with_details(json!({
            "source_width": source_width,
            "source_height": source_height,
            "width": width
        }))));
    }
    Ok((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_codes::find_coded_error;
    use crate::palette::GrayscaleResolver;
    use crate::schema::{BackgroundConfig, ColorRgb};

    fn config() -> ConverterConfig {
        ConverterConfig::default()
    }

    #[test]
    fn grid_height_halves_aspect() {
        assert_eq!(grid_size_for(80, 640, 480).unwrap(), (80, 30));
        assert_eq!(grid_size_for(80, 100, 100).unwrap(), (80, 40));
    }

    #[test]
    fn zero_height_source_is_invalid_aspect_ratio() {
        let error = grid_size_for(80, 640, 0).unwrap_err();
        assert_eq!(find_coded_error(&error).unwrap().code, INVALID_ASPECT_RATIO);

        let error = grid_size_for(1, 1000, 10).unwrap_err();
        assert_eq!(find_coded_error(&error).unwrap().code, INVALID_ASPECT_RATIO);
    }

    #[test]
    fn palette_resolves_foreground_and_glyph() {
        let converter = Converter::new(ConverterConfig {
            palette: Some(vec![ColorRgb { r: 0, g: 0, b: 0 }, ColorRgb { r: 255, g: 255, b: 255 }]),
            ..config()
        })
        .unwrap();
        let cell = converter.classify([100, 100, 100, 255], 0, 0);
        assert_eq!(cell.foreground, Some([0, 0, 0, 255]));
        assert_eq!(cell.glyph, 'g');
    }

    #[test]
    fn alpha_is_reattached_only_when_transparent() {
        let opaque = Converter::new(config()).unwrap();
        assert_eq!(opaque.classify([9, 9, 9, 40], 0, 0).foreground, Some([9, 9, 9, 255]));

        let transparent = Converter::new(ConverterConfig {
            transparent: true,
            ..config()
        })
        .unwrap();
        assert_eq!(transparent.classify([9, 9, 9, 40], 0, 0).foreground, Some([9, 9, 9, 40]));
    }

    #[test]
    fn background_uses_original_pixel_not_resolved_color() {
        let converter = Converter::new(ConverterConfig {
            palette: Some(vec![ColorRgb { r: 0, g: 0, b: 0 }]),
            background: BackgroundConfig {
                enabled: true,
                darken: 1.0,
                ..BackgroundConfig::default()
            },
            ..config()
        })
        .unwrap();
        let cell = converter.classify([200, 200, 200, 255], 0, 0);
        assert_eq!(cell.foreground, Some([0, 0, 0, 255]));
        assert_eq!(cell.background.fill, Some([200, 200, 200, 255]));
    }

    #[test]
    fn foreground_is_gated_by_threshold() {
        let converter = Converter::new(ConverterConfig {
            transparent: true,
            background: BackgroundConfig {
                enabled: true,
                copy_alpha: true,
                back_threshold: 10,
                ..BackgroundConfig::default()
            },
            ..config()
        })
        .unwrap();
        let faint = converter.classify([200, 200, 200, 5], 0, 0);
        assert_eq!(faint.foreground, None);
        assert_eq!(faint.background.fill, None);

        let solid = converter.classify([200, 200, 200, 15], 0, 0);
        assert!(solid.foreground.is_some());
        assert!(solid.background.fill.is_some());
    }

    #[test]
    fn injected_resolver_replaces_palette_logic() {
        let converter = Converter::with_resolvers(
            config(),
            Box::new(GrayscaleResolver),
            Box::new(DefaultBackgroundResolver::new(None, None, 0.5)),
        )
        .unwrap();
        let cell = converter.classify([30, 60, 90, 255], 0, 0);
        assert_eq!(cell.foreground, Some([60, 60, 60, 255]));
    }

    #[test]
    fn empty_ramp_fails_at_construction() {
        let result = Converter::new(ConverterConfig {
            chars: String::new(),
            ..config()
        });
        assert!(result.is_err());
    }

    #[test]
    fn rendered_frame_dimensions_follow_cell_size() {
        let converter = Converter::new(config()).unwrap();
        let grid = PixelGrid::from_pixels(4, 3, vec![[255, 255, 255, 255]; 12]).unwrap();
        let frame = converter.render_frame(&grid).unwrap();
        let (cell_width, cell_height) = converter.cell_size();
        assert_eq!(frame.width(), 4 * cell_width);
        assert_eq!(frame.height(), 3 * cell_height);
        assert!(matches!(frame, DynamicImage::ImageRgb8(_)));
    }

    struct UnevenPainter;

    impl GlyphPainter for UnevenPainter {
        fn cell_size(&self, glyph: char) -> (u32, u32) {
            if glyph == '@' {
                (7, 11)
            } else {
                (3, 5)
            }
        }

        fn glyph(&self, _glyph: char) -> Option<&crate::glyph_painter::GlyphBitmap> {
            None
        }

        fn label(&self) -> String {
            "uneven".to_owned()
        }
    }

    #[test]
    fn cell_size_comes_from_last_ramp_glyph() {
        let converter = Converter::new(ConverterConfig {
            chars: " .@".to_owned(),
            ..config()
        })
        .unwrap()
        .with_painter(Box::new(UnevenPainter));
        assert_eq!(converter.ramp().last(), '@');
        assert_eq!(converter.cell_size(), (7, 11));

        // Dark pixels map to ' ' and '.', whose own cells would be 3x5.
        let grid = PixelGrid::from_pixels(3, 2, vec![[0, 0, 0, 255]; 6]).unwrap();
        assert_eq!(converter.classify([0, 0, 0, 255], 0, 0).glyph, ' ');
        let frame = converter.render_frame(&grid).unwrap();
        assert_eq!((frame.width(), frame.height()), (21, 22));

        let reversed = Converter::new(ConverterConfig {
            chars: "@. ".to_owned(),
            ..config()
        })
        .unwrap()
        .with_painter(Box::new(UnevenPainter));
        let frame = reversed.render_frame(&grid).unwrap();
        assert_eq!((frame.width(), frame.height()), (9, 10));
    }

    #[test]
    fn transparent_run_keeps_alpha_channel() {
        let converter = Converter::new(ConverterConfig {
            transparent: true,
            ..config()
        })
        .unwrap();
        let grid = PixelGrid::from_pixels(2, 1, vec![[0, 0, 0, 0]; 2]).unwrap();
        let frame = converter.render_frame(&grid).unwrap();
        assert!(matches!(frame, DynamicImage::ImageRgba8(_)));
    }

    #[test]
    fn converter_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Converter>();
    }
}
