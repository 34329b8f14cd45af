use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::metadata::LoopCount;
use image::{AnimationDecoder, DynamicImage, Frame, ImageFormat, ImageReader};

use crate::converter::Converter;
use crate::decoding::{read_video_info, FfmpegInput};
use crate::dispatch::{CancelFlag, FrameDispatcher, RunContext};
use crate::encoding::{mux_frames, remux_audio, FfmpegMode, FfmpegTools};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Gif,
    Video,
}

/// GIF by extension, then any still format this build can decode, otherwise video.
pub fn detect_media_kind(path: &Path) -> Result<MediaKind> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if extension == "gif" {
        return Ok(MediaKind::Gif);
    }
    if ImageFormat::from_extension(&extension).is_some_and(|format| format.reading_enabled()) {
        return Ok(MediaKind::Image);
    }
    let guessed = ImageReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("failed to read {}", path.display()))?
        .format();
    Ok(match guessed {
        Some(ImageFormat::Gif) => MediaKind::Gif,
        Some(format) if format.reading_enabled() => MediaKind::Image,
        _ => MediaKind::Video,
    })
}

pub fn convert_image(converter: &Converter, input: &Path, output: &Path) -> Result<()> {
    let started = Instant::now();
    let image = image::open(input)
        .with_context(|| format!("failed to decode image {}", input.display()))?;
    let rendered = converter
        .render_image(&image)
        .with_context(|| format!("failed to convert {}", input.display()))?;
    save_frame(&rendered, output)?;
    log::info!(
        "[glyphcast] wrote {} ({}x{}) in {:.2?}",
        output.display(),
        rendered.width(),
        rendered.height(),
        started.elapsed()
    );
    Ok(())
}

/// Renders every GIF frame. With `animate`, the output keeps each frame's delay and
/// the source's loop count; otherwise only the first frame is written.
pub fn convert_gif(converter: &Converter, input: &Path, output: &Path, animate: bool) -> Result<()> {
    let started = Instant::now();
    let file = File::open(input).with_context(|| format!("failed to open {}", input.display()))?;
    let decoder = GifDecoder::new(BufReader::new(file))
        .with_context(|| format!("failed to decode GIF {}", input.display()))?;
    let repeat = gif_repeat(decoder.loop_count());
    let frames = decoder
        .into_frames()
        .collect_frames()
        .with_context(|| format!("failed to decode GIF frames of {}", input.display()))?;
    if frames.is_empty() {
        bail!("GIF {} has no frames", input.display());
    }

    if !animate {
        let first = frames
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("GIF {} has no frames", input.display()))?;
        let rendered = converter.render_image(&DynamicImage::ImageRgba8(first.into_buffer()))?;
        save_frame(&rendered, output)?;
        log::info!("[glyphcast] wrote first GIF frame to {}", output.display());
        return Ok(());
    }

    let total = frames.len();
    let mut rendered_frames = Vec::with_capacity(total);
    for (index, frame) in frames.into_iter().enumerate() {
        let delay = frame.delay();
        let rendered = converter
            .render_image(&DynamicImage::ImageRgba8(frame.into_buffer()))
            .with_context(|| format!("failed to convert GIF frame {index}"))?;
        rendered_frames.push(Frame::from_parts(rendered.to_rgba8(), 0, 0, delay));
        log::debug!("[glyphcast] GIF frame {}/{total}", index + 1);
    }

    let file = File::create(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let mut encoder = GifEncoder::new(BufWriter::new(file));
    encoder
        .set_repeat(repeat)
        .context("failed to set GIF loop count")?;
    encoder
        .encode_frames(rendered_frames)
        .with_context(|| format!("failed to encode GIF {}", output.display()))?;
    log::info!(
        "[glyphcast] wrote {total} GIF frames to {} in {:.2?}",
        output.display(),
        started.elapsed()
    );
    Ok(())
}

fn gif_repeat(loop_count: LoopCount) -> Repeat {
    match loop_count {
        LoopCount::Infinite => Repeat::Infinite,
        LoopCount::Finite(count) => Repeat::Finite(u16::try_from(count.get()).unwrap_or(u16::MAX)),
    }
}

#[derive(Debug, Clone)]
pub struct VideoOptions {
    /// Parent of the run directory. Defaults to the output's directory.
    pub work_dir: Option<PathBuf>,
    pub cancel: CancelFlag,
    pub ffmpeg_mode: FfmpegMode,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            work_dir: None,
            cancel: CancelFlag::new(),
            ffmpeg_mode: FfmpegMode::Auto,
        }
    }
}

pub fn convert_video(
    converter: &Converter,
    input: &Path,
    output: &Path,
    options: &VideoOptions,
) -> Result<()> {
    let started = Instant::now();
    let tools = FfmpegTools::resolve(options.ffmpeg_mode)?;
    let info = read_video_info(&tools, input)?;
    let (grid_width, grid_height) = converter.grid_size(info.width, info.height)?;
    log::info!(
        "[glyphcast] {} is {}x{} at {:.3} fps, grid {grid_width}x{grid_height}",
        input.display(),
        info.width,
        info.height,
        info.fps
    );

    let frames = FfmpegInput::spawn(&tools, input, grid_width, grid_height)?.read_all()?;
    if frames.is_empty() {
        bail!("no frames decoded from {}", input.display());
    }

    let work_dir = options
        .work_dir
        .clone()
        .or_else(|| output.parent().map(Path::to_path_buf))
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));
    let run_dir = RunContext::new(&work_dir).create()?;

    let dispatcher = FrameDispatcher::new(converter, converter.config().worker_count())
        .with_cancel(options.cancel.clone());
    let written = dispatcher.dispatch(&frames, run_dir.context())?;

    let temp_video = run_dir.path().join("temp.mp4");
    mux_frames(&tools, run_dir.context(), &info.frame_rate, &temp_video)?;
    remux_audio(&tools, &temp_video, input, output)?;

    log::info!(
        "[glyphcast] wrote {written} frames to {} in {:.2?}",
        output.display(),
        started.elapsed()
    );
    Ok(())
}

/// Saves by extension. Formats without alpha get an RGB copy.
pub fn save_frame(frame: &DynamicImage, output: &Path) -> Result<()> {
    let format = ImageFormat::from_path(output)
        .with_context(|| format!("unsupported output format for {}", output.display()))?;
    let result = if frame.color().has_alpha() && format == ImageFormat::Jpeg {
        DynamicImage::ImageRgb8(frame.to_rgb8()).save_with_format(output, format)
    } else {
        frame.save_with_format(output, format)
    };
    result.with_context(|| format!("failed to write {}", output.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_follows_extension() {
        assert_eq!(detect_media_kind(Path::new("clip.GIF")).unwrap(), MediaKind::Gif);
        assert_eq!(detect_media_kind(Path::new("photo.jpeg")).unwrap(), MediaKind::Image);
        assert_eq!(detect_media_kind(Path::new("still.png")).unwrap(), MediaKind::Image);
    }

    #[test]
    fn unknown_extension_is_sniffed() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("clip.mp4");
        std::fs::write(&video, b"\x00\x00\x00\x18ftypmp42").unwrap();
        assert_eq!(detect_media_kind(&video).unwrap(), MediaKind::Video);

        let disguised = dir.path().join("image.bin");
        DynamicImage::new_rgb8(2, 2)
            .save_with_format(&disguised, ImageFormat::Png)
            .unwrap();
        assert_eq!(detect_media_kind(&disguised).unwrap(), MediaKind::Image);
    }

    #[test]
    fn formats_without_a_decoder_are_not_images() {
        let dir = tempfile::tempdir().unwrap();
        let bitmap = dir.path().join("scan.bmp");
        std::fs::write(&bitmap, b"BM\x3a\x00\x00\x00\x00\x00\x00\x00\x36\x00\x00\x00").unwrap();
        assert!(!ImageFormat::Bmp.reading_enabled());
        assert_eq!(detect_media_kind(&bitmap).unwrap(), MediaKind::Video);

        let tiff = dir.path().join("scan.tiff");
        std::fs::write(&tiff, b"II*\x00\x08\x00\x00\x00").unwrap();
        assert_eq!(detect_media_kind(&tiff).unwrap(), MediaKind::Video);
    }

    #[test]
    fn loop_count_maps_onto_gif_repeat() {
        assert!(matches!(gif_repeat(LoopCount::Infinite), Repeat::Infinite));
        let three = std::num::NonZeroU32::new(3).unwrap();
        assert!(matches!(gif_repeat(LoopCount::Finite(three)), Repeat::Finite(3)));
        let huge = std::num::NonZeroU32::new(100_000).unwrap();
        assert!(matches!(gif_repeat(LoopCount::Finite(huge)), Repeat::Finite(u16::MAX)));
    }
}
