use std::path::{Path, PathBuf};

use beat_montage_core::{
    assets::{discover_photos, load_primary_catalog},
    onset::{normalize_onsets, read_onsets},
    plan::{check_alignment, AlignmentReport},
    record::ensure_parent_dir,
    AppConfig, AssetLedger, AudioTrack, CompiledPlan, FailureMode, FfmpegConcatenator,
    FfmpegRenderer, ImageProbe, Recorder, RecordingSettings, RunWarning, TimingReport,
};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Beats closer than this to a cut count as aligned.
const DEFAULT_TOLERANCE_SECONDS: f64 = 0.05;

fn main() -> beat_montage_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { inputs, output } => run_plan(&inputs, &output),
        Commands::Build {
            inputs,
            audio,
            offset,
            output,
        } => run_build(&inputs, &audio, offset, &output),
        Commands::Verify { report, tolerance } => run_verify(&report, tolerance),
    }
}

fn run_plan(inputs: &PlanInputs, output: &PlanOutput) -> beat_montage_core::Result<()> {
    let config = inputs.load_config()?;
    let (compiled, beats) = compile(inputs, &config)?;
    print_warnings(&compiled.warnings);

    if let Some(path) = &output.json {
        ensure_parent_dir(path)?;
        std::fs::write(path, serde_json::to_string_pretty(&compiled.plan)?)?;
        tracing::info!(path = %path.display(), "wrote plan json");
    }
    if let Some(path) = &output.table {
        ensure_parent_dir(path)?;
        std::fs::write(path, compiled.plan.to_table())?;
        tracing::info!(path = %path.display(), "wrote plan table");
    }
    let report = TimingReport::from_plan(&compiled.plan, &beats);
    if let Some(path) = &output.timing {
        ensure_parent_dir(path)?;
        report.write(path)?;
        tracing::info!(path = %path.display(), "wrote timing report");
    }
    if output.json.is_none() && output.table.is_none() {
        print!("{}", compiled.plan.to_table());
    }

    let alignment = check_alignment(&report.boundaries(), &beats, DEFAULT_TOLERANCE_SECONDS);
    summarize_alignment(&alignment);
    Ok(())
}

fn run_build(
    inputs: &PlanInputs,
    audio: &Path,
    offset: f64,
    output: &Path,
) -> beat_montage_core::Result<()> {
    let config = inputs.load_config()?;
    let (compiled, _) = compile(inputs, &config)?;

    let renderer = FfmpegRenderer::new(config.render.clone(), config.compile.canvas)?;
    let concatenator = FfmpegConcatenator::new(config.render.clone());
    let track = AudioTrack {
        path: audio.to_path_buf(),
        offset_seconds: offset,
        duration_seconds: Some(compiled.plan.duration_seconds()),
    };

    let settings = RecordingSettings::from_config(&config);
    let report = Recorder::new(&renderer, &concatenator, settings).record(
        &compiled.plan,
        &track,
        output,
    )?;

    let mut warnings = compiled.warnings;
    warnings.extend(report.warnings);
    print_warnings(&warnings);
    tracing::info!(
        output = %report.output.display(),
        clips = report.clips,
        frames = report.total_frames,
        "build complete"
    );
    Ok(())
}

fn run_verify(report: &Path, tolerance: f64) -> beat_montage_core::Result<()> {
    let report = TimingReport::read(report)?;
    let alignment = check_alignment(&report.boundaries(), &report.beats, tolerance);
    summarize_alignment(&alignment);
    for miss in &alignment.misaligned {
        println!(
            "beat {:.3}s is {:.1}ms from the nearest cut",
            miss.beat,
            miss.distance * 1000.0
        );
    }
    Ok(())
}

fn compile(
    inputs: &PlanInputs,
    config: &AppConfig,
) -> beat_montage_core::Result<(CompiledPlan, Vec<f64>)> {
    let beats = normalize_onsets(&read_onsets(&inputs.onsets)?, inputs.duration);
    let primary = load_primary_catalog(&inputs.catalog)?;
    let photos = match &inputs.photos {
        Some(dir) => discover_photos(dir)?,
        None => Vec::new(),
    };
    tracing::info!(
        onsets = beats.len(),
        primary = primary.len(),
        photos = photos.len(),
        "loaded inputs"
    );

    let mut ledger = AssetLedger::new(primary, photos, Box::new(ImageProbe));
    let compiled =
        beat_montage_core::compile_plan(&beats, inputs.duration, &config.compile, &mut ledger)?;
    tracing::info!(
        segments = compiled.plan.len(),
        frames = compiled.plan.total_frames(),
        phase = ?compiled.final_phase,
        exhausted_at = ?compiled.primary_exhausted_at,
        "plan ready"
    );
    Ok((compiled, beats))
}

fn summarize_alignment(alignment: &AlignmentReport) {
    let aligned = alignment.beats_checked - alignment.misaligned.len();
    println!(
        "{aligned}/{} beats within {:.0}ms of a cut",
        alignment.beats_checked,
        alignment.tolerance * 1000.0
    );
    if !alignment.is_aligned() {
        tracing::warn!(misaligned = alignment.misaligned.len(), "beats off the cut grid");
    }
}

fn print_warnings(warnings: &[RunWarning]) {
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Beat-synced still image montage compiler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile a segment plan without rendering anything.
    Plan {
        #[command(flatten)]
        inputs: PlanInputs,
        #[command(flatten)]
        output: PlanOutput,
    },
    /// Compile, render and mux the final video.
    Build {
        #[command(flatten)]
        inputs: PlanInputs,
        /// Source audio laid under the picture.
        #[arg(long)]
        audio: PathBuf,
        /// Start of the compiled window within the audio, in seconds.
        #[arg(long, default_value_t = 0.0)]
        offset: f64,
        /// Final video file.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Check a timing report's beats against its cut points.
    Verify {
        report: PathBuf,
        /// Maximum distance from a cut, in seconds.
        #[arg(long, default_value_t = DEFAULT_TOLERANCE_SECONDS)]
        tolerance: f64,
    },
}

#[derive(Args, Debug)]
struct PlanInputs {
    /// Onset times, one float (seconds) per line.
    #[arg(long)]
    onsets: PathBuf,
    /// Length of the output timeline in seconds.
    #[arg(long)]
    duration: f64,
    /// JSON catalog of primary assets.
    #[arg(long)]
    catalog: PathBuf,
    /// Directory of fallback photos.
    #[arg(long)]
    photos: Option<PathBuf>,
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    fps: Option<u32>,
    /// Minimum intervals a fallback photo slice stays on screen.
    #[arg(long)]
    min_dwell: Option<usize>,
    /// Downgrade unreadable assets and failed renders to warnings.
    #[arg(long)]
    best_effort: bool,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    ffmpeg: Option<PathBuf>,
}

impl PlanInputs {
    /// File config (or defaults) with command line overrides applied.
    fn load_config(&self) -> beat_montage_core::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::from_json_file(path)?,
            None => AppConfig::default(),
        };
        if let Some(fps) = self.fps {
            config.compile.fps = fps;
        }
        if let Some(dwell) = self.min_dwell {
            config.compile.min_secondary_dwell = dwell;
        }
        if self.best_effort {
            config.compile.failure_mode = FailureMode::BestEffort;
        }
        if let Some(workers) = self.workers {
            config.render.workers = Some(workers);
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            config.render.ffmpeg = ffmpeg.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
struct PlanOutput {
    /// Write the plan as JSON.
    #[arg(long)]
    json: Option<PathBuf>,
    /// Write the flat `index|asset_id|kind|frame_count|start_frame` table.
    #[arg(long)]
    table: Option<PathBuf>,
    /// Write the timing report with beat times.
    #[arg(long)]
    timing: Option<PathBuf>,
}
