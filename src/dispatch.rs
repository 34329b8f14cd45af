use std::any::Any;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use serde_json::json;

use crate::converter::Converter;
use crate::error_codes::{CodedError, CANCELLED, WORKER_FAILED};
use crate::pixel_grid::PixelGrid;

static RUN_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A contiguous run of frames owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameChunk {
    pub start: usize,
    pub len: usize,
}

impl FrameChunk {
    pub fn range(&self) -> Range<usize> {
        self.start..self.start + self.len
    }
}

/// Splits `total` frames into chunks of `ceil(total / workers)`. The last chunk may be
/// shorter and no empty chunk is produced.
pub fn partition(total: usize, workers: usize) -> Vec<FrameChunk> {
    let workers = workers.max(1);
    if total == 0 {
        return Vec::new();
    }
    let chunk_len = (total + workers - 1) / workers;
    (0..total)
        .step_by(chunk_len)
        .map(|start| FrameChunk {
            start,
            len: chunk_len.min(total - start),
        })
        .collect()
}

/// Shared interrupt flag, checked by workers between frames.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Routes Ctrl-C to this flag. Can only be installed once per process.
    pub fn install_ctrlc_handler(&self) -> Result<()> {
        let flag = self.clone();
        ctrlc::set_handler(move || {
            if !flag.is_cancelled() {
                eprintln!("[glyphcast] interrupt received, stopping after current frames");
            }
            flag.cancel();
        })
        .context("failed to install Ctrl-C handler")
    }
}

/// Identity and scratch location of one conversion run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    run_id: String,
    dir: PathBuf,
}

impl RunContext {
    pub fn new(work_dir: &Path) -> Self {
        let run_id = next_run_id();
        let dir = work_dir.join(format!(".glyphcast-{run_id}"));
        Self { run_id, dir }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn frame_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("img{index}.png"))
    }

    /// `ffmpeg` image2 pattern matching [`RunContext::frame_path`].
    pub fn frame_pattern(&self) -> PathBuf {
        self.dir.join("img%d.png")
    }

    /// Creates the run directory. It is removed again when the returned guard drops.
    pub fn create(self) -> Result<RunDir> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create run directory {}", self.dir.display()))?;
        log::debug!("[glyphcast] run {} using {}", self.run_id, self.dir.display());
        Ok(RunDir { context: self })
    }
}

/// Owns a created run directory and deletes it on drop, including on unwind.
#[derive(Debug)]
pub struct RunDir {
    context: RunContext,
}

impl RunDir {
    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn path(&self) -> &Path {
        self.context.dir()
    }
}

impl Drop for RunDir {
    fn drop(&mut self) {
        let dir = self.context.dir();
        if let Err(error) = fs::remove_dir_all(dir) {
            if dir.exists() {
                log::warn!(
                    "[glyphcast] failed to remove run directory {}: {error}",
                    dir.display()
                );
            }
        }
    }
}

fn next_run_id() -> String {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let count = RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("{timestamp}_{}_{count:03}", std::process::id())
}

/// Fans a frame sequence out over scoped worker threads.
pub struct FrameDispatcher<'a> {
    converter: &'a Converter,
    workers: usize,
    cancel: CancelFlag,
}

impl<'a> FrameDispatcher<'a> {
    pub fn new(converter: &'a Converter, workers: usize) -> Self {
        Self {
            converter,
            workers: workers.max(1),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Renders every frame and writes `img{index}.png` into the run directory.
    pub fn dispatch(&self, frames: &[PixelGrid], run: &RunContext) -> Result<usize> {
        let converter = self.converter;
        self.dispatch_with(frames, |index, grid| {
            let path = run.frame_path(index);
            converter
                .render_frame(grid)
                .with_context(|| format!("failed to render frame {index}"))?
                .save(&path)
                .with_context(|| format!("failed to write {}", path.display()))
        })
    }

    /// Runs `render(global_index, frame)` for every frame, one chunk per worker.
    ///
    /// The first failing worker stops the others at their next frame boundary.
    pub fn dispatch_with<F>(&self, frames: &[PixelGrid], render: F) -> Result<usize>
    where
        F: Fn(usize, &PixelGrid) -> Result<()> + Sync,
    {
        let total = frames.len();
        let chunks = partition(total, self.workers);
        log::info!(
            "[glyphcast] dispatching {total} frames to {} workers",
            chunks.len()
        );

        let progress = Progress::new(total);
        let abort = AtomicBool::new(false);
        let worker = ChunkWorker {
            frames,
            render: &render,
            progress: &progress,
            abort: &abort,
            cancel: &self.cancel,
        };

        let results = thread::scope(|scope| {
            let spawned = chunks
                .iter()
                .enumerate()
                .map(|(worker_index, chunk)| {
                    let worker = &worker;
                    let chunk = *chunk;
                    let handle = thread::Builder::new()
                        .name(format!("glyphcast-worker-{worker_index}"))
                        .spawn_scoped(scope, move || worker.run(chunk));
                    if handle.is_err() {
                        abort.store(true, Ordering::SeqCst);
                    }
                    (chunk, handle)
                })
                .collect::<Vec<_>>();

            spawned
                .into_iter()
                .map(|(chunk, handle)| match handle {
                    Ok(handle) => handle.join().unwrap_or_else(|payload| {
                        Err(anyhow!(
                            "worker for frames {:?} panicked: {}",
                            chunk.range(),
                            panic_message(payload.as_ref())
                        ))
                    }),
                    Err(error) => Err(anyhow!(error).context(format!(
                        "failed to spawn worker for frames {:?}",
                        chunk.range()
                    ))),
                })
                .collect::<Vec<_>>()
        });

        if self.cancel.is_cancelled() {
            return Err(anyhow!(CodedError::runtime(
                CANCELLED,
                format!(
                    "conversion cancelled after {} of {total} frames",
                    progress.done()
                ),
            )));
        }
        if let Some(error) = results.into_iter().find_map(Result::err) {
            return Err(anyhow!(CodedError::runtime(
                WORKER_FAILED,
                format!("frame worker failed: {error:#}"),
            )
            .with_details(json!({ "frames": total, "completed": progress.done() }))));
        }
        Ok(total)
    }
}

struct ChunkWorker<'s, F> {
    frames: &'s [PixelGrid],
    render: &'s F,
    progress: &'s Progress,
    abort: &'s AtomicBool,
    cancel: &'s CancelFlag,
}

impl<F> ChunkWorker<'_, F>
where
    F: Fn(usize, &PixelGrid) -> Result<()> + Sync,
{
    fn run(&self, chunk: FrameChunk) -> Result<()> {
        let _guard = AbortOnPanic(self.abort);
        for index in chunk.range() {
            if self.cancel.is_cancelled() || self.abort.load(Ordering::SeqCst) {
                return Ok(());
            }
            if let Err(error) = (self.render)(index, &self.frames[index]) {
                self.abort.store(true, Ordering::SeqCst);
                return Err(error);
            }
            self.progress.advance();
        }
        Ok(())
    }
}

struct AbortOnPanic<'s>(&'s AtomicBool);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.store(true, Ordering::SeqCst);
        }
    }
}

struct Progress {
    total: usize,
    step: usize,
    done: AtomicUsize,
}

impl Progress {
    fn new(total: usize) -> Self {
        Self {
            total,
            step: (total / 20).max(1),
            done: AtomicUsize::new(0),
        }
    }

    fn advance(&self) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        if done % self.step == 0 || done == self.total {
            log::info!(
                "[glyphcast] rendered {done}/{} frames ({}%)",
                self.total,
                done * 100 / self.total.max(1)
            );
        } else {
            log::debug!("[glyphcast] rendered {done}/{} frames", self.total);
        }
    }

    fn done(&self) -> usize {
        self.done.load(Ordering::Relaxed)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("non-string panic payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_codes::find_coded_error;
    use crate::schema::ConverterConfig;
    use std::sync::Mutex;

    fn frames(count: usize) -> Vec<PixelGrid> {
        (0..count)
            .map(|index| {
                let shade = (index * 10 % 256) as u8;
                PixelGrid::from_pixels(2, 1, vec![[shade, shade, shade, 255]; 2]).unwrap()
            })
            .collect()
    }

    #[test]
    fn partition_uses_ceiling_chunk_length() {
        let chunks = partition(10, 4);
        let lens = chunks.iter().map(|chunk| chunk.len).collect::<Vec<_>>();
        assert_eq!(lens, vec![3, 3, 3, 1]);
        assert_eq!(chunks[3].start, 9);
    }

    #[test]
    fn partition_skips_empty_trailing_chunks() {
        // ceil(4 / 3) = 2, so only two chunks carry frames.
        assert_eq!(
            partition(4, 3),
            vec![
                FrameChunk { start: 0, len: 2 },
                FrameChunk { start: 2, len: 2 }
            ]
        );
        assert!(partition(0, 8).is_empty());
        assert_eq!(partition(3, 0), vec![FrameChunk { start: 0, len: 3 }]);
    }

    #[test]
    fn dispatch_with_visits_every_index_once() {
        let converter = Converter::new(ConverterConfig::default()).unwrap();
        let seen = Mutex::new(Vec::new());
        let frames = frames(23);
        let count = FrameDispatcher::new(&converter, 4)
            .dispatch_with(&frames, |index, frame| {
                assert_eq!(frame, &frames[index]);
                seen.lock().unwrap().push(index);
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 23);
        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (0..23).collect::<Vec<_>>());
    }

    #[test]
    fn worker_error_fails_batch_with_code() {
        let converter = Converter::new(ConverterConfig::default()).unwrap();
        let error = FrameDispatcher::new(&converter, 3)
            .dispatch_with(&frames(9), |index, _| {
                if index == 4 {
                    anyhow::bail!("disk full at frame {index}");
                }
                Ok(())
            })
            .unwrap_err();
        let coded = find_coded_error(&error).unwrap();
        assert_eq!(coded.code, WORKER_FAILED);
        assert!(coded.message.contains("disk full at frame 4"), "{}", coded.message);
    }

    #[test]
    fn worker_panic_fails_batch() {
        let converter = Converter::new(ConverterConfig::default()).unwrap();
        let error = FrameDispatcher::new(&converter, 2)
            .dispatch_with(&frames(4), |index, _| {
                if index == 3 {
                    panic!("boom");
                }
                Ok(())
            })
            .unwrap_err();
        let coded = find_coded_error(&error).unwrap();
        assert_eq!(coded.code, WORKER_FAILED);
        assert!(coded.message.contains("boom"), "{}", coded.message);
    }

    #[test]
    fn cancelled_flag_stops_dispatch() {
        let converter = Converter::new(ConverterConfig::default()).unwrap();
        let cancel = CancelFlag::new();
        let dispatcher = FrameDispatcher::new(&converter, 1).with_cancel(cancel.clone());
        let error = dispatcher
            .dispatch_with(&frames(10), |index, _| {
                if index == 2 {
                    cancel.cancel();
                }
                Ok(())
            })
            .unwrap_err();
        assert_eq!(find_coded_error(&error).unwrap().code, CANCELLED);
    }

    #[test]
    fn run_ids_are_unique_within_process() {
        let work_dir = Path::new("/tmp");
        let first = RunContext::new(work_dir);
        let second = RunContext::new(work_dir);
        assert_ne!(first.run_id(), second.run_id());
        assert_eq!(
            first.frame_path(7),
            first.dir().join("img7.png"),
            "frame files are indexed by global position"
        );
    }
}
