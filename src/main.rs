use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use env_logger::Env;

use glyphcast::config::load_and_validate_config;
use glyphcast::converter::Converter;
use glyphcast::dispatch::CancelFlag;
use glyphcast::encoding::FfmpegMode;
use glyphcast::error_codes::{envelope_for, find_coded_error, CodedErrorKind};
use glyphcast::media::{
    convert_gif, convert_image, convert_video, detect_media_kind, MediaKind, VideoOptions,
};
use glyphcast::schema::ConverterConfig;

#[derive(Debug, Parser)]
#[command(name = "glyphcast", version)]
#[command(about = "Render images, GIFs and video as colored text-glyph mosaics")]
struct Cli {
    #[command(flatten)]
    options: GlobalOptions,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct GlobalOptions {
    /// YAML run configuration. Flags below override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Grid width in characters.
    #[arg(long, global = true)]
    width: Option<u32>,
    /// Glyph ramp, darkest first.
    #[arg(long, global = true)]
    chars: Option<String>,
    /// TTF/OTF font used to draw glyphs.
    #[arg(long, global = true)]
    font: Option<PathBuf>,
    #[arg(long, global = true)]
    font_size: Option<f32>,
    /// Keep the source alpha channel (RGBA output).
    #[arg(long, global = true)]
    transparent: bool,
    #[arg(long, global = true)]
    workers: Option<usize>,
    #[arg(long, global = true, value_enum, default_value_t = FfmpegArg::Auto)]
    ffmpeg: FfmpegArg,
    /// Print failures as a JSON envelope on stderr.
    #[arg(long, global = true)]
    json_errors: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FfmpegArg {
    Auto,
    System,
    Sidecar,
}

impl From<FfmpegArg> for FfmpegMode {
    fn from(value: FfmpegArg) -> Self {
        match value {
            FfmpegArg::Auto => FfmpegMode::Auto,
            FfmpegArg::System => FfmpegMode::System,
            FfmpegArg::Sidecar => FfmpegMode::Sidecar,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Convert a still image.
    Image { input: PathBuf, output: PathBuf },
    /// Convert an animated GIF.
    Gif {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        first_frame_only: bool,
    },
    /// Convert a video through ffmpeg, keeping its audio.
    Video {
        input: PathBuf,
        output: PathBuf,
        /// Where the temporary frame directory is created.
        #[arg(long)]
        work_dir: Option<PathBuf>,
    },
    /// Detect the input kind and convert it.
    Convert {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        work_dir: Option<PathBuf>,
    },
    /// Validate the configuration and print the resolved settings.
    Check,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let cli = Cli::parse();
    let json_errors = cli.options.json_errors;
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            report_error(&error, json_errors);
            exit_code_for(&error)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli.options)?;
    let ffmpeg_mode = FfmpegMode::from(cli.options.ffmpeg);

    match cli.command {
        Commands::Check => run_check(cli.options.config.as_deref(), &config),
        Commands::Image { input, output } => {
            let converter = Converter::new(config)?;
            convert_image(&converter, &input, &output)
        }
        Commands::Gif {
            input,
            output,
            first_frame_only,
        } => {
            let converter = Converter::new(config)?;
            convert_gif(&converter, &input, &output, !first_frame_only)
        }
        Commands::Video {
            input,
            output,
            work_dir,
        } => {
            let converter = Converter::new(config)?;
            let options = video_options(work_dir, ffmpeg_mode);
            convert_video(&converter, &input, &output, &options)
        }
        Commands::Convert {
            input,
            output,
            work_dir,
        } => {
            let converter = Converter::new(config)?;
            match detect_media_kind(&input)? {
                MediaKind::Image => convert_image(&converter, &input, &output),
                MediaKind::Gif => convert_gif(&converter, &input, &output, true),
                MediaKind::Video => {
                    let options = video_options(work_dir, ffmpeg_mode);
                    convert_video(&converter, &input, &output, &options)
                }
            }
        }
    }
}

fn resolve_config(options: &GlobalOptions) -> Result<ConverterConfig> {
    let mut config = match options.config.as_deref() {
        Some(path) => load_and_validate_config(path)?,
        None => ConverterConfig::default(),
    };
    if let Some(width) = options.width {
        config.width = width;
    }
    if let Some(chars) = &options.chars {
        config.chars = chars.clone();
    }
    if let Some(font) = &options.font {
        config.font = Some(font.clone());
    }
    if let Some(font_size) = options.font_size {
        config.font_size = font_size;
    }
    if options.transparent {
        config.transparent = true;
    }
    if let Some(workers) = options.workers {
        config.workers = Some(workers);
    }
    config.validate()?;
    Ok(config)
}

fn video_options(work_dir: Option<PathBuf>, ffmpeg_mode: FfmpegMode) -> VideoOptions {
    let cancel = CancelFlag::new();
    if let Err(error) = cancel.install_ctrlc_handler() {
        log::warn!("[glyphcast] {error:#}");
    }
    VideoOptions {
        work_dir,
        cancel,
        ffmpeg_mode,
    }
}

fn run_check(config_path: Option<&Path>, config: &ConverterConfig) -> Result<()> {
    let converter = Converter::new(config.clone())?;
    let (cell_width, cell_height) = converter.cell_size();
    println!(
        "OK: {} (width {}, ramp '{}', {} workers, {})",
        config_path.map_or_else(|| "defaults".to_owned(), |path| path.display().to_string()),
        config.width,
        config.chars,
        config.worker_count(),
        if config.transparent { "RGBA" } else { "RGB" }
    );
    println!(
        "Glyphs: {} ({cell_width}x{cell_height} cell)",
        converter.painter().label()
    );
    let resolved = serde_json::to_string_pretty(config).context("failed to serialize config")?;
    println!("{resolved}");
    Ok(())
}

/// Configuration problems exit with 2 so scripts can tell them from runtime failures.
fn exit_code_for(error: &anyhow::Error) -> ExitCode {
    match find_coded_error(error).map(|coded| coded.kind) {
        Some(CodedErrorKind::Config) => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

fn report_error(error: &anyhow::Error, json_errors: bool) {
    if json_errors {
        match serde_json::to_string(&envelope_for(error)) {
            Ok(json) => eprintln!("{json}"),
            Err(_) => eprintln!("error: {error:#}"),
        }
    } else {
        eprintln!("error: {error:#}");
    }
}
