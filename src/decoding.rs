use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::encoding::{read_stderr_tail, FfmpegTools};
use crate::pixel_grid::PixelGrid;

/// Stream properties needed to size the grid and mux at the source rate.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    /// Rational rate as reported by ffprobe, e.g. `30000/1001`.
    pub frame_rate: String,
    pub fps: f64,
}

#[derive(Debug, Deserialize)]
struct StreamReport {
    #[serde(default)]
    streams: Vec<StreamEntry>,
}

#[derive(Debug, Deserialize)]
struct StreamEntry {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

pub fn read_video_info(tools: &FfmpegTools, input_path: &Path) -> Result<VideoInfo> {
    let output = Command::new(tools.ffprobe())
        .arg("-v")
        .arg("error")
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=width,height,r_frame_rate,avg_frame_rate")
        .arg("-of")
        .arg("json")
        .arg(input_path)
        .stdin(Stdio::null())
        .output()
        .with_context(|| {
            format!(
                "failed to run ffprobe (mode={}, resolved_path={})",
                tools.mode_label(),
                tools.ffprobe().display()
            )
        })?;
    if !output.status.success() {
        bail!(
            "ffprobe failed for {} with status {}: {}",
            input_path.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    parse_stream_info(&output.stdout)
        .with_context(|| format!("failed to read stream info of {}", input_path.display()))
}

fn parse_stream_info(json: &[u8]) -> Result<VideoInfo> {
    let report: StreamReport =
        serde_json::from_slice(json).context("ffprobe returned malformed JSON")?;
    let stream = report
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no video stream found"))?;
    let (Some(width), Some(height)) = (stream.width, stream.height) else {
        bail!("video stream has no dimensions");
    };

    // avg_frame_rate is 0/0 for some containers; fall back to the base rate.
    let (frame_rate, fps) = [stream.avg_frame_rate, stream.r_frame_rate]
        .into_iter()
        .flatten()
        .find_map(|rate| parse_rate(&rate).map(|fps| (rate, fps)))
        .ok_or_else(|| anyhow!("video stream has no usable frame rate"))?;

    Ok(VideoInfo {
        width,
        height,
        frame_rate,
        fps,
    })
}

fn parse_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => num.trim().parse::<f64>().ok()? / den.trim().parse::<f64>().ok()?,
        None => rate.trim().parse::<f64>().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

/// Raw RGBA frames decoded by an `ffmpeg` child, already scaled to the grid.
///
/// stdout and stderr are each drained on their own thread so a chatty decoder
/// never blocks on a full pipe.
pub struct FfmpegInput {
    receiver: mpsc::Receiver<Vec<u8>>,
    worker: Option<JoinHandle<Result<()>>>,
    stderr_reader: Option<JoinHandle<Result<String>>>,
    child: Child,
    width: u32,
    height: u32,
}

impl FfmpegInput {
    pub fn spawn(tools: &FfmpegTools, input_path: &Path, width: u32, height: u32) -> Result<Self> {
        let size = format!("{}x{}", width, height);
        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(4);

        let mut child = Command::new(tools.ffmpeg())
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(input_path)
            .arg("-an")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgba")
            .arg("-s")
            .arg(size)
            .arg("-sws_flags")
            .arg("bicubic")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn ffmpeg decoder (mode={}, resolved_path={})",
                    tools.mode_label(),
                    tools.ffmpeg().display()
                )
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg stdout"))?;
        let mut stderr = child.stderr.take();
        let frame_size = width as usize * height as usize * 4;

        let stderr_reader = match thread::Builder::new()
            .name("glyphcast-ffmpeg-stderr".to_owned())
            .spawn(move || read_stderr_tail(&mut stderr))
        {
            Ok(handle) => handle,
            Err(error) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(error).context("failed to spawn ffmpeg stderr thread");
            }
        };

        let worker = match thread::Builder::new()
            .name("glyphcast-ffmpeg-decoder".to_owned())
            .spawn(move || {
                loop {
                    let mut buffer = vec![0u8; frame_size];
                    match stdout.read_exact(&mut buffer) {
                        Ok(_) => {
                            if sender.send(buffer).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                        Err(e) => return Err(anyhow!("failed to read from ffmpeg: {e}")),
                    }
                }
                Ok(())
            }) {
            Ok(handle) => handle,
            Err(error) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stderr_reader.join();
                return Err(error).context("failed to spawn ffmpeg reader thread");
            }
        };

        Ok(Self {
            receiver,
            worker: Some(worker),
            stderr_reader: Some(stderr_reader),
            child,
            width,
            height,
        })
    }

    pub fn read_frame(&self) -> Option<Result<PixelGrid>> {
        self.receiver
            .recv()
            .ok()
            .map(|bytes| PixelGrid::from_raw_rgba(self.width, self.height, &bytes))
    }

    /// Drains every frame, then reaps the child and both reader threads.
    pub fn read_all(mut self) -> Result<Vec<PixelGrid>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.read_frame() {
            frames.push(frame?);
        }
        let status = self.child.wait().context("failed waiting for ffmpeg decoder")?;
        self.join_reader()?;
        let stderr_tail = self.join_stderr()?;
        if !status.success() {
            bail!("ffmpeg decoder failed with status {status} (stderr_tail='{stderr_tail}')");
        }
        log::debug!("[glyphcast] decoded {} frames", frames.len());
        Ok(frames)
    }

    fn join_reader(&mut self) -> Result<()> {
        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(result) => result,
                Err(_) => Err(anyhow!("ffmpeg reader thread panicked")),
            }
        } else {
            Ok(())
        }
    }

    fn join_stderr(&mut self) -> Result<String> {
        match self.stderr_reader.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("ffmpeg stderr thread panicked"))?,
            None => Ok(String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_info_prefers_average_rate() {
        let json = br#"{"streams":[{"width":640,"height":360,"r_frame_rate":"30/1","avg_frame_rate":"30000/1001"}]}"#;
        let info = parse_stream_info(json).unwrap();
        assert_eq!((info.width, info.height), (640, 360));
        assert_eq!(info.frame_rate, "30000/1001");
        assert!((info.fps - 29.97).abs() < 0.01, "fps={}", info.fps);
    }

    #[test]
    fn stream_info_falls_back_when_average_is_undefined() {
        let json = br#"{"streams":[{"width":8,"height":8,"r_frame_rate":"25/1","avg_frame_rate":"0/0"}]}"#;
        let info = parse_stream_info(json).unwrap();
        assert_eq!(info.frame_rate, "25/1");
        assert_eq!(info.fps, 25.0);
    }

    #[test]
    fn stream_info_without_video_stream_is_an_error() {
        let error = parse_stream_info(br#"{"streams":[]}"#).unwrap_err();
        assert!(error.to_string().contains("no video stream"));
    }
}
