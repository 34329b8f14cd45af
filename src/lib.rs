//! Renders images, GIFs and video frames as grids of colored text glyphs.
//!
//! Each source pixel becomes one glyph cell: its color is optionally snapped to a
//! palette, its brightness picks a glyph from the ramp, and an optional background
//! fill is derived from the original pixel. [`converter::Converter`] runs that
//! pipeline over one frame; [`dispatch::FrameDispatcher`] fans video frames out over
//! worker threads.

pub mod background;
pub mod compositor;
pub mod config;
pub mod converter;
pub mod decoding;
pub mod dispatch;
pub mod encoding;
pub mod error_codes;
pub mod glyph_painter;
pub mod glyph_ramp;
pub mod media;
pub mod palette;
pub mod pixel_grid;
pub mod schema;
