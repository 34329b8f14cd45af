#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use glyphcast::decoding::FfmpegInput;
use glyphcast::encoding::FfmpegTools;
use glyphcast::pixel_grid::PixelGrid;
use tempfile::tempdir;

// Held while a script is written and spawned, so no other test thread forks
// while the script still has an open write handle.
static SCRIPT_LOCK: Mutex<()> = Mutex::new(());

/// A stand-in decoder: floods stderr with `lines` messages, then writes two
/// 2x1 RGBA frames to stdout and exits with `status`.
fn write_fake_ffmpeg(dir: &Path, lines: u32, status: i32) -> PathBuf {
    let path = dir.join("ffmpeg");
    let script = format!(
        "#!/bin/sh\n\
         i=0\n\
         while [ $i -lt {lines} ]; do\n\
         \techo \"[h264 @ 0x55d0] error while decoding MB $i 17, bytestream -5\" >&2\n\
         \ti=$((i + 1))\n\
         done\n\
         printf 'AAAABBBBCCCCDDDD'\n\
         echo 'decoder gave up' >&2\n\
         exit {status}\n"
    );
    std::fs::write(&path, script).expect("script should write");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("script should be executable");
    path
}

fn decode_with_timeout(ffmpeg: PathBuf, input: PathBuf) -> Result<Vec<PixelGrid>> {
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let tools = FfmpegTools::from_paths(ffmpeg, "ffprobe");
        let result = FfmpegInput::spawn(&tools, &input, 2, 1).and_then(FfmpegInput::read_all);
        let _ = sender.send(result);
    });
    receiver
        .recv_timeout(Duration::from_secs(30))
        .expect("decoder should finish instead of blocking on stderr")
}

#[test]
fn noisy_decoder_does_not_block_frame_reads() {
    let dir = tempdir().expect("tempdir should create");
    let frames = {
        let _lock = SCRIPT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let ffmpeg = write_fake_ffmpeg(dir.path(), 3000, 0);
        decode_with_timeout(ffmpeg, dir.path().join("clip.mp4"))
    }
    .expect("decode should succeed");

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].pixel(0, 0), [b'A'; 4]);
    assert_eq!(frames[0].pixel(1, 0), [b'B'; 4]);
    assert_eq!(frames[1].pixel(1, 0), [b'D'; 4]);
}

#[test]
fn failed_decoder_reports_stderr_tail() {
    let dir = tempdir().expect("tempdir should create");
    let error = {
        let _lock = SCRIPT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let ffmpeg = write_fake_ffmpeg(dir.path(), 3000, 1);
        decode_with_timeout(ffmpeg, dir.path().join("clip.mp4"))
    }
    .expect_err("non-zero exit should fail");

    let message = format!("{error:#}");
    assert!(message.contains("ffmpeg decoder failed"), "{message}");
    assert!(message.contains("decoder gave up"), "{message}");
    assert!(message.len() < 2000, "stderr tail should be bounded: {}", message.len());
}
