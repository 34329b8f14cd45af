use anyhow::{bail, Result};
use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};

/// A decoded frame already sized to the character grid: one pixel per cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelGrid {
    width: u32,
    height: u32,
    pixels: Vec<[u8; 4]>,
}

impl PixelGrid {
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<[u8; 4]>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            bail!(
                "pixel grid length mismatch: expected {}x{}={}, got {}",
                width,
                height,
                expected,
                pixels.len()
            );
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Interleaved RGBA bytes, as produced by `ffmpeg -pix_fmt rgba`.
    pub fn from_raw_rgba(width: u32, height: u32, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            bail!("raw rgba buffer length {} is not a multiple of 4", bytes.len());
        }
        let pixels = bytes
            .chunks_exact(4)
            .map(|px| [px[0], px[1], px[2], px[3]])
            .collect();
        Self::from_pixels(width, height, pixels)
    }

    pub fn from_rgba_image(image: &RgbaImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            pixels: image.pixels().map(|pixel| pixel.0).collect(),
        }
    }

    /// Converts to RGBA and resamples to the grid with a bicubic filter.
    pub fn from_image_resized(image: &DynamicImage, width: u32, height: u32) -> Self {
        let rgba = image.to_rgba8();
        let resized = image::imageops::resize(&rgba, width, height, FilterType::CatmullRom);
        Self::from_rgba_image(&resized)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        self.pixels[(y * self.width + x) as usize]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[[u8; 4]]> {
        // chunks_exact panics on 0; an empty grid simply has no rows.
        self.pixels.chunks_exact(self.width.max(1) as usize)
    }
}
