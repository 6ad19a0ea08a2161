//! Builder and runner for `ffmpeg` invocations.
//!
//! The system binary is used rather than linking libav, so nothing here
//! needs native FFmpeg headers.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use crate::{config::CanvasSize, MontageError, Result};

/// Collects arguments for one ffmpeg run.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    program: PathBuf,
    /// Per-input options followed by `-i <path>`.
    inputs: Vec<OsString>,
    output_args: Vec<OsString>,
    output: PathBuf,
}

impl FfmpegCommand {
    pub fn new(program: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            inputs: Vec::new(),
            output_args: Vec::new(),
            output: output.as_ref().to_path_buf(),
        }
    }

    /// Adds an input with its options (placed before its `-i`).
    pub fn input<I, S>(mut self, options: I, path: impl AsRef<Path>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.inputs.extend(options.into_iter().map(Into::into));
        self.inputs.push("-i".into());
        self.inputs.push(path.as_ref().as_os_str().to_os_string());
        self
    }

    /// Adds a looped still image lasting `seconds` at `fps`.
    pub fn still_input(self, fps: u32, seconds: f64, path: impl AsRef<Path>) -> Self {
        self.input(
            [
                "-loop".to_string(),
                "1".to_string(),
                "-framerate".to_string(),
                fps.to_string(),
                "-t".to_string(),
                format!("{seconds:.6}"),
            ],
            path,
        )
    }

    pub fn output_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn video_filter(self, filter: impl Into<OsString>) -> Self {
        self.output_arg("-vf").output_arg(filter)
    }

    pub fn audio_filter(self, filter: impl Into<OsString>) -> Self {
        self.output_arg("-af").output_arg(filter)
    }

    pub fn filter_complex(self, filter: impl Into<OsString>) -> Self {
        self.output_arg("-filter_complex").output_arg(filter)
    }

    /// Exact number of output video frames.
    pub fn frames(self, count: u64) -> Self {
        self.output_arg("-frames:v").output_arg(count.to_string())
    }

    /// H.264 in yuv420p at a constant frame rate.
    pub fn h264(self, fps: u32, crf: u8, preset: &str) -> Self {
        self.output_args([
            "-r".to_string(),
            fps.to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            preset.to_string(),
            "-crf".to_string(),
            crf.to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
        ])
    }

    /// Full argument list, without the program name.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-y".into(), "-loglevel".into(), "error".into()];
        args.extend(self.inputs.iter().cloned());
        args.extend(self.output_args.iter().cloned());
        args.push(self.output.as_os_str().to_os_string());
        args
    }

    /// Runs ffmpeg to completion, returning its stderr on failure.
    pub fn run(&self) -> Result<()> {
        tracing::trace!(program = %self.program.display(), args = ?self.args(), "running ffmpeg");
        let output = Command::new(&self.program)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| {
                MontageError::encoder(
                    self.program.display().to_string(),
                    format!("failed to spawn (is it installed and on PATH?): {e}"),
                )
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(MontageError::encoder(
            self.program.display().to_string(),
            format!("{} for {}: {}", output.status, self.output.display(), stderr.trim()),
        ))
    }
}

/// Scale up until the canvas is covered, then crop the overflow centred.
pub fn fill_filter(canvas: CanvasSize) -> String {
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h},setsar=1",
        w = canvas.width,
        h = canvas.height
    )
}

pub fn is_available(program: &Path) -> bool {
    Command::new(program)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
