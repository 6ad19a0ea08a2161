use std::{
    io::Write as _,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::{
    config::{AppConfig, CanvasSize, FailureMode, RenderSettings},
    plan::SegmentPlan,
    render::{ffmpeg::FfmpegCommand, ClipHandle, RenderDispatcher, Renderer},
    MontageError, Result, RunWarning,
};

/// Window of the source audio laid under the picture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrack {
    pub path: PathBuf,
    /// Where the compiled segment starts in the audio file.
    pub offset_seconds: f64,
    pub duration_seconds: Option<f64>,
}

impl AudioTrack {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset_seconds: 0.0,
            duration_seconds: None,
        }
    }
}

/// Fade applied to the end of the muxed output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FadeOut {
    pub start_seconds: f64,
    pub duration_seconds: f64,
}

impl FadeOut {
    /// Fade covering the last `duration` seconds of a `total` second output.
    pub fn at_end(total: f64, duration: f64) -> Self {
        let duration = duration.min(total).max(0.0);
        Self {
            start_seconds: total - duration,
            duration_seconds: duration,
        }
    }
}

/// Joins clips in order and lays audio under the result.
pub trait Concatenator: Send + Sync {
    fn concatenate(&self, clips: &[ClipHandle], out: &Path) -> Result<()>;

    fn mux(
        &self,
        video: &Path,
        audio: &AudioTrack,
        fade_out: Option<FadeOut>,
        out: &Path,
    ) -> Result<()>;
}

/// [`Concatenator`] built on the ffmpeg concat demuxer.
#[derive(Debug, Clone)]
pub struct FfmpegConcatenator {
    settings: RenderSettings,
}

impl FfmpegConcatenator {
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }
}

impl Concatenator for FfmpegConcatenator {
    fn concatenate(&self, clips: &[ClipHandle], out: &Path) -> Result<()> {
        if clips.is_empty() {
            return Err(MontageError::input("nothing to concatenate"));
        }
        let list_dir = out.parent().unwrap_or_else(|| Path::new("."));
        let mut list = tempfile::Builder::new()
            .prefix("concat-")
            .suffix(".txt")
            .tempfile_in(list_dir)?;
        list.write_all(concat_list(clips).as_bytes())?;
        list.flush()?;

        FfmpegCommand::new(&self.settings.ffmpeg, out)
            .input(["-f", "concat", "-safe", "0"], list.path())
            .output_args(["-c", "copy"])
            .run()?;
        tracing::info!(clips = clips.len(), out = %out.display(), "concatenated clips");
        Ok(())
    }

    fn mux(
        &self,
        video: &Path,
        audio: &AudioTrack,
        fade_out: Option<FadeOut>,
        out: &Path,
    ) -> Result<()> {
        let mut audio_options = vec!["-ss".to_string(), format!("{:.6}", audio.offset_seconds)];
        if let Some(duration) = audio.duration_seconds {
            audio_options.push("-t".to_string());
            audio_options.push(format!("{duration:.6}"));
        }

        let mut cmd = FfmpegCommand::new(&self.settings.ffmpeg, out)
            .input(Vec::<String>::new(), video)
            .input(audio_options, &audio.path)
            .output_args(["-map", "0:v:0", "-map", "1:a:0"]);

        cmd = match fade_out {
            Some(fade) => {
                let filter = format!(
                    "fade=t=out:st={:.6}:d={:.6}",
                    fade.start_seconds, fade.duration_seconds
                );
                cmd.video_filter(filter.clone())
                    .audio_filter(format!("a{filter}"))
                    .output_args([
                        "-c:v".to_string(),
                        "libx264".to_string(),
                        "-preset".to_string(),
                        self.settings.preset.clone(),
                        "-crf".to_string(),
                        self.settings.crf.to_string(),
                        "-pix_fmt".to_string(),
                        "yuv420p".to_string(),
                    ])
            }
            None => cmd.output_args(["-c:v", "copy"]),
        };

        cmd.output_args(["-c:a", "aac", "-b:a", self.settings.audio_bitrate.as_str()])
            .output_args(["-movflags", "+faststart"])
            .run()?;
        tracing::info!(out = %out.display(), "muxed audio");
        Ok(())
    }
}

/// Concat demuxer list, one `file '<path>'` line per clip.
fn concat_list(clips: &[ClipHandle]) -> String {
    clips
        .iter()
        .map(|clip| {
            let path = clip.path.to_string_lossy().replace('\'', r"'\''");
            format!("file '{path}'\n")
        })
        .collect()
}

/// Outcome of a full build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingReport {
    pub output: PathBuf,
    pub clips: usize,
    pub total_frames: u64,
    pub warnings: Vec<RunWarning>,
}

/// Options for [`Recorder::record`].
#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub canvas: CanvasSize,
    pub workers: usize,
    pub failure_mode: FailureMode,
    pub fade_out_seconds: Option<f64>,
    /// Parent directory for intermediates. Defaults to the system temp dir.
    pub work_dir: Option<PathBuf>,
}

impl RecordingSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            canvas: config.compile.canvas,
            workers: config.render.effective_workers(),
            failure_mode: config.compile.failure_mode,
            fade_out_seconds: config.render.fade_out_seconds,
            work_dir: config.render.work_dir.clone(),
        }
    }
}

/// Drives render, concatenation and muxing for a plan.
///
/// Each stage owns a temporary directory that is removed as soon as the
/// next stage has consumed its contents, and on any error.
pub struct Recorder<'a> {
    renderer: &'a dyn Renderer,
    concatenator: &'a dyn Concatenator,
    settings: RecordingSettings,
}

impl<'a> Recorder<'a> {
    pub fn new(
        renderer: &'a dyn Renderer,
        concatenator: &'a dyn Concatenator,
        settings: RecordingSettings,
    ) -> Self {
        Self {
            renderer,
            concatenator,
            settings,
        }
    }

    pub fn record(
        &self,
        plan: &SegmentPlan,
        audio: &AudioTrack,
        output: &Path,
    ) -> Result<RecordingReport> {
        if plan.is_empty() {
            return Err(MontageError::input("segment plan is empty"));
        }
        ensure_parent_dir(output)?;

        let clips_dir = self.stage_dir("beat-montage-clips-")?;
        let rendered = RenderDispatcher::new(
            self.renderer,
            self.settings.workers,
            self.settings.failure_mode,
        )
        .dispatch(plan, self.settings.canvas, clips_dir.path())?;

        let picture_dir = self.stage_dir("beat-montage-picture-")?;
        let picture = picture_dir.path().join("picture.mp4");
        self.concatenator.concatenate(&rendered.clips, &picture)?;
        drop(clips_dir);

        let fade_out = self
            .settings
            .fade_out_seconds
            .filter(|seconds| *seconds > 0.0)
            .map(|seconds| FadeOut::at_end(plan.duration_seconds(), seconds));
        self.concatenator.mux(&picture, audio, fade_out, output)?;
        drop(picture_dir);

        tracing::info!(
            output = %output.display(),
            clips = rendered.clips.len(),
            frames = rendered.total_frames(),
            warnings = rendered.warnings.len(),
            "recording finished"
        );
        Ok(RecordingReport {
            output: output.to_path_buf(),
            clips: rendered.clips.len(),
            total_frames: rendered.total_frames(),
            warnings: rendered.warnings,
        })
    }

    fn stage_dir(&self, prefix: &str) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        let dir = match &self.settings.work_dir {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        Ok(dir)
    }
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
