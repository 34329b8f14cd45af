use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{anyhow, bail, Context, Result};

use crate::dispatch::RunContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfmpegMode {
    Auto,
    System,
    Sidecar,
}

/// Resolved `ffmpeg`/`ffprobe` executables for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegTools {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    mode_label: &'static str,
}

impl FfmpegTools {
    pub fn resolve(mode: FfmpegMode) -> Result<Self> {
        match mode {
            FfmpegMode::Auto | FfmpegMode::System => Ok(Self::system()),
            FfmpegMode::Sidecar => {
                #[cfg(feature = "sidecar_ffmpeg")]
                {
                    let ffmpeg = ffmpeg_sidecar::paths::ffmpeg_path();
                    if !ffmpeg.exists() {
                        ffmpeg_sidecar::download::auto_download()
                            .context("failed to auto-download ffmpeg sidecar binary")?;
                    }
                    Ok(Self {
                        ffmpeg,
                        ffprobe: ffmpeg_sidecar::ffprobe::ffprobe_path(),
                        mode_label: "sidecar",
                    })
                }
                #[cfg(not(feature = "sidecar_ffmpeg"))]
                {
                    Err(anyhow!(
                        "ffmpeg sidecar mode requested but glyphcast was built without `sidecar_ffmpeg`. Rebuild with `--features sidecar_ffmpeg`."
                    ))
                }
            }
        }
    }

    /// Explicit binaries, e.g. a pinned ffmpeg build outside `PATH`.
    pub fn from_paths(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            mode_label: "explicit",
        }
    }

    pub fn system() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            mode_label: "system",
        }
    }

    pub fn ffmpeg(&self) -> &Path {
        &self.ffmpeg
    }

    pub fn ffprobe(&self) -> &Path {
        &self.ffprobe
    }

    pub fn mode_label(&self) -> &'static str {
        self.mode_label
    }
}

/// Encodes the run's `img%d.png` sequence into `output` at `frame_rate`.
pub fn mux_frames(
    tools: &FfmpegTools,
    run: &RunContext,
    frame_rate: &str,
    output: &Path,
) -> Result<()> {
    let args = mux_args(&run.frame_pattern(), frame_rate, output);
    run_ffmpeg(tools, &args, "mux")
}

/// Copies the rendered video stream and attaches the source's audio, if it has any.
pub fn remux_audio(tools: &FfmpegTools, video: &Path, source: &Path, output: &Path) -> Result<()> {
    let args = remux_args(video, source, output);
    run_ffmpeg(tools, &args, "remux")
}

pub fn mux_args(frame_pattern: &Path, frame_rate: &str, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-framerate".to_owned(),
        frame_rate.to_owned(),
        "-start_number".to_owned(),
        "0".to_owned(),
        "-i".to_owned(),
        frame_pattern.to_string_lossy().into_owned(),
        // yuv420p needs even dimensions
        "-vf".to_owned(),
        "pad=ceil(iw/2)*2:ceil(ih/2)*2".to_owned(),
        "-c:v".to_owned(),
        "libx264".to_owned(),
        "-pix_fmt".to_owned(),
        "yuv420p".to_owned(),
        output.to_string_lossy().into_owned(),
    ]
}

pub fn remux_args(video: &Path, source: &Path, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-i".to_owned(),
        video.to_string_lossy().into_owned(),
        "-i".to_owned(),
        source.to_string_lossy().into_owned(),
        "-map".to_owned(),
        "0:v".to_owned(),
        "-map".to_owned(),
        "1:a?".to_owned(),
        "-c:v".to_owned(),
        "copy".to_owned(),
        "-shortest".to_owned(),
        output.to_string_lossy().into_owned(),
    ]
}

fn run_ffmpeg(tools: &FfmpegTools, args: &[String], stage: &str) -> Result<()> {
    let ffmpeg_path = tools.ffmpeg();
    let mode_label = tools.mode_label();
    if let Some(output) = args.last() {
        if output.chars().any(|c| c.is_control()) {
            bail!("output path contains invalid control characters");
        }
    }

    log::debug!("[glyphcast] ffmpeg {stage}: {}", args.join(" "));
    let mut child = Command::new(ffmpeg_path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                anyhow!(
                    "ffmpeg executable not found (mode={mode_label}, resolved_path={}). Install ffmpeg (system mode) or use sidecar mode with `--features sidecar_ffmpeg`.",
                    ffmpeg_path.display()
                )
            } else {
                anyhow!(
                    "failed to spawn ffmpeg {stage} (mode={mode_label}, resolved_path={}, args='{}'): {error}",
                    ffmpeg_path.display(),
                    args.join(" ")
                )
            }
        })?;

    let mut stderr_pipe = child.stderr.take();
    let stderr_tail = read_stderr_tail(&mut stderr_pipe)?;
    let status = child.wait().context("failed waiting for ffmpeg process")?;
    if !status.success() {
        return Err(anyhow!(
            "ffmpeg {stage} failed with status {status} (mode={mode_label}, resolved_path={}, args='{}', stderr_tail='{}')",
            ffmpeg_path.display(),
            args.join(" "),
            stderr_tail
        ));
    }
    Ok(())
}

const STDERR_TAIL_BYTES: usize = 4096;

/// Reads the pipe to EOF, keeping only its last few KiB.
pub(crate) fn read_stderr_tail<R: Read>(stderr: &mut Option<R>) -> Result<String> {
    let Some(mut pipe) = stderr.take() else {
        return Ok(String::new());
    };
    let mut tail = Vec::with_capacity(STDERR_TAIL_BYTES * 2);
    let mut chunk = [0_u8; 8192];
    loop {
        let read = match pipe.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => read,
            Err(error) if error.kind() == ErrorKind::Interrupted => continue,
            Err(error) => return Err(error).context("failed reading ffmpeg stderr"),
        };
        tail.extend_from_slice(&chunk[..read]);
        if tail.len() > STDERR_TAIL_BYTES * 2 {
            tail.drain(..tail.len() - STDERR_TAIL_BYTES);
        }
    }
    let text = String::from_utf8_lossy(&tail).to_string();
    Ok(last_n_chars(&text, 500))
}

fn last_n_chars(s: &str, max_chars: usize) -> String {
    let mut chars = s.chars().collect::<Vec<_>>();
    if chars.len() > max_chars {
        chars = chars[chars.len().saturating_sub(max_chars)..].to_vec();
    }
    chars.into_iter().collect::<String>().trim().to_owned()
}
