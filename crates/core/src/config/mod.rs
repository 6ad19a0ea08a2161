use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{MontageError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub compile: CompileConfig,
    pub render: RenderSettings,
}

impl AppConfig {
    /// Loads a JSON configuration file. Missing fields fall back to defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.compile.validate()?;
        self.render.validate()
    }
}

/// Output picture size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasSize {
    pub width: u32,
    pub height: u32,
}

impl Default for CanvasSize {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

impl std::fmt::Display for CanvasSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Fixed-length hold and dissolve inserted where primary assets run out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionConfig {
    pub hold_seconds: f64,
    pub crossfade_seconds: f64,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            hold_seconds: 0.75,
            crossfade_seconds: 0.5,
        }
    }
}

/// How recoverable asset and render failures are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureMode {
    /// Abort the run on the first unusable asset or failed render.
    #[default]
    Strict,
    /// Record a warning and extend the neighbouring segment over the gap.
    BestEffort,
}

/// Parameters of the planning stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    pub fps: u32,
    pub canvas: CanvasSize,
    /// Minimum number of beat intervals folded into one secondary segment.
    pub min_secondary_dwell: usize,
    pub transition: TransitionConfig,
    /// Cut spacing used when no onsets were detected.
    pub fallback_cadence_seconds: f64,
    pub failure_mode: FailureMode,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            fps: 60,
            canvas: CanvasSize::default(),
            min_secondary_dwell: 4,
            transition: TransitionConfig::default(),
            fallback_cadence_seconds: 2.0,
            failure_mode: FailureMode::Strict,
        }
    }
}

impl CompileConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 {
            return Err(MontageError::input("fps must be positive"));
        }
        if self.canvas.width == 0 || self.canvas.height == 0 {
            return Err(MontageError::input(format!(
                "canvas {} must have non-zero dimensions",
                self.canvas
            )));
        }
        if self.min_secondary_dwell == 0 {
            return Err(MontageError::input("min_secondary_dwell must be at least 1"));
        }
        check_seconds("transition.hold_seconds", self.transition.hold_seconds)?;
        check_seconds(
            "transition.crossfade_seconds",
            self.transition.crossfade_seconds,
        )?;
        if !self.fallback_cadence_seconds.is_finite() || self.fallback_cadence_seconds <= 0.0 {
            return Err(MontageError::input(
                "fallback_cadence_seconds must be a positive number",
            ));
        }
        let frame = 1.0 / self.fps as f64;
        if self.fallback_cadence_seconds < frame {
            return Err(MontageError::input(format!(
                "fallback_cadence_seconds {} is shorter than one frame ({frame:.6}s at {} fps)",
                self.fallback_cadence_seconds, self.fps
            )));
        }
        Ok(())
    }

    pub fn best_effort(&self) -> bool {
        self.failure_mode == FailureMode::BestEffort
    }
}

/// Configuration for the external render, concat and mux tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub ffmpeg: PathBuf,
    /// Parallel render workers. `None` uses the number of CPU cores.
    pub workers: Option<usize>,
    pub crf: u8,
    pub preset: String,
    pub audio_bitrate: String,
    /// Optional fade applied to the end of the muxed output.
    pub fade_out_seconds: Option<f64>,
    /// Parent for intermediate clip directories. Defaults to the system temp dir.
    pub work_dir: Option<PathBuf>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            workers: None,
            crf: 18,
            preset: "veryfast".to_string(),
            audio_bitrate: "192k".to_string(),
            fade_out_seconds: None,
            work_dir: None,
        }
    }
}

impl RenderSettings {
    pub fn validate(&self) -> Result<()> {
        if self.workers == Some(0) {
            return Err(MontageError::input("render.workers must be at least 1"));
        }
        if self.crf > 51 {
            return Err(MontageError::input("render.crf must be within 0..=51"));
        }
        if let Some(fade) = self.fade_out_seconds {
            check_seconds("render.fade_out_seconds", fade)?;
        }
        Ok(())
    }

    /// Worker count actually used for rendering.
    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

fn check_seconds(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(MontageError::input(format!(
            "{name} must be a non-negative number, got {value}"
        )))
    }
}
