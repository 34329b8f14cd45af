use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use glyphcast::converter::Converter;
use glyphcast::dispatch::{partition, CancelFlag, FrameDispatcher, RunContext};
use glyphcast::error_codes::{find_coded_error, CANCELLED, WORKER_FAILED};
use glyphcast::pixel_grid::PixelGrid;
use glyphcast::schema::ConverterConfig;
use tempfile::tempdir;

fn frames(count: usize) -> Vec<PixelGrid> {
    (0..count)
        .map(|index| {
            let shade = (index * 37 % 256) as u8;
            PixelGrid::from_pixels(2, 1, vec![[shade, 255 - shade, shade / 2, 255]; 2])
                .expect("grid should build")
        })
        .collect()
}

#[test]
fn partition_covers_every_frame_exactly_once_in_order() {
    for total in 0..40 {
        for workers in 1..9 {
            let chunks = partition(total, workers);
            let covered = chunks
                .iter()
                .flat_map(|chunk| chunk.range())
                .collect::<Vec<_>>();
            assert_eq!(
                covered,
                (0..total).collect::<Vec<_>>(),
                "total={total} workers={workers}"
            );
            assert!(chunks.len() <= workers, "total={total} workers={workers}");
            assert!(chunks.iter().all(|chunk| chunk.len > 0));
        }
    }
}

#[test]
fn dispatch_writes_indexed_frames_then_cleans_up() {
    let dir = tempdir().expect("tempdir should create");
    let converter = Converter::new(ConverterConfig::default()).expect("converter should build");
    let frames = frames(7);

    let run = RunContext::new(dir.path())
        .create()
        .expect("run directory should create");
    let run_path = run.path().to_path_buf();
    assert!(run_path.starts_with(dir.path()));
    assert!(run_path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(".glyphcast-")));

    let written = FrameDispatcher::new(&converter, 3)
        .dispatch(&frames, run.context())
        .expect("dispatch should succeed");
    assert_eq!(written, 7);

    let (cell_width, cell_height) = converter.cell_size();
    for index in 0..7 {
        let path = run.context().frame_path(index);
        let image = image::open(&path).expect("frame should decode");
        assert_eq!(image.width(), 2 * cell_width, "{}", path.display());
        assert_eq!(image.height(), cell_height, "{}", path.display());
    }
    assert!(!run.context().frame_path(7).exists());

    drop(run);
    assert!(!run_path.exists(), "run directory should be removed on drop");
}

fn failing_run(work_dir: &Path, run_path: &mut Option<PathBuf>) -> Result<usize> {
    let converter = Converter::new(ConverterConfig::default())?;
    let run = RunContext::new(work_dir).create()?;
    *run_path = Some(run.path().to_path_buf());
    FrameDispatcher::new(&converter, 2).dispatch_with(&frames(6), |index, _| {
        if index == 5 {
            bail!("encoder rejected frame {index}");
        }
        Ok(())
    })
}

#[test]
fn failed_dispatch_still_removes_run_directory() {
    let dir = tempdir().expect("tempdir should create");
    let mut run_path = None;

    let error = failing_run(dir.path(), &mut run_path).expect_err("dispatch should fail");
    assert_eq!(find_coded_error(&error).map(|coded| coded.code), Some(WORKER_FAILED));

    let run_path = run_path.expect("run directory should have been created");
    assert!(!run_path.exists(), "run directory should be removed after failure");
}

fn cancelled_run(work_dir: &Path, run_path: &mut Option<PathBuf>) -> Result<usize> {
    let converter = Converter::new(ConverterConfig::default())?;
    let run = RunContext::new(work_dir).create()?;
    *run_path = Some(run.path().to_path_buf());
    let cancel = CancelFlag::new();
    FrameDispatcher::new(&converter, 1)
        .with_cancel(cancel.clone())
        .dispatch_with(&frames(6), |index, grid| {
            let path = run.context().frame_path(index);
            converter
                .render_frame(grid)?
                .save(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            assert!(path.exists());
            if index == 1 {
                cancel.cancel();
            }
            Ok(())
        })
}

#[test]
fn cancelled_dispatch_still_removes_run_directory() {
    let dir = tempdir().expect("tempdir should create");
    let mut run_path = None;

    let error = cancelled_run(dir.path(), &mut run_path).expect_err("dispatch should be cancelled");
    let coded = find_coded_error(&error).expect("error should carry a code");
    assert_eq!(coded.code, CANCELLED);
    assert!(coded.message.contains("of 6 frames"), "{}", coded.message);

    let run_path = run_path.expect("run directory should have been created");
    assert!(!run_path.exists(), "run directory should be removed after cancellation");
    assert_eq!(
        std::fs::read_dir(dir.path()).expect("work dir should list").count(),
        0,
        "no frames should be left in the work dir"
    );
}

#[test]
fn concurrent_runs_get_distinct_directories() {
    let dir = tempdir().expect("tempdir should create");
    let first = RunContext::new(dir.path()).create().expect("first run");
    let second = RunContext::new(dir.path()).create().expect("second run");
    assert_ne!(first.path(), second.path());
    assert!(first.path().is_dir() && second.path().is_dir());
}
