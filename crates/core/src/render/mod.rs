//! Turns plan entries into fixed-length clips.
//!
//! Entries are independent, so they are rendered in parallel on a bounded
//! pool. Clips always come back in plan order.

use std::path::{Path, PathBuf};

use image::{imageops::FilterType, ImageFormat};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{
    assets::{Asset, SecondaryAsset},
    config::{CanvasSize, FailureMode, RenderSettings},
    plan::{SegmentKind, SegmentPlan},
    MontageError, Result, RunWarning,
};

pub mod ffmpeg;

use ffmpeg::{fill_filter, FfmpegCommand};

/// Everything a renderer needs for one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderJob {
    pub segment: usize,
    pub asset: Asset,
    pub kind: SegmentKind,
    pub frame_count: u64,
    pub fps: u32,
    pub canvas: CanvasSize,
}

impl RenderJob {
    pub fn duration_seconds(&self) -> f64 {
        self.frame_count as f64 / self.fps as f64
    }

    pub fn file_name(&self) -> String {
        format!("segment_{:06}.mp4", self.segment)
    }
}

/// A rendered clip on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipHandle {
    pub segment: usize,
    pub path: PathBuf,
    pub frame_count: u64,
}

pub trait Renderer: Send + Sync {
    /// Renders `job` into a clip inside `out_dir`.
    fn render(&self, job: &RenderJob, out_dir: &Path) -> Result<ClipHandle>;
}

/// [`Renderer`] that shells out to ffmpeg for every segment.
#[derive(Debug, Clone)]
pub struct FfmpegRenderer {
    settings: RenderSettings,
}

impl FfmpegRenderer {
    pub fn new(settings: RenderSettings, canvas: CanvasSize) -> Result<Self> {
        settings.validate()?;
        if canvas.width % 2 != 0 || canvas.height % 2 != 0 {
            return Err(MontageError::input(format!(
                "canvas {canvas} must have even dimensions for yuv420p output"
            )));
        }
        if !ffmpeg::is_available(&settings.ffmpeg) {
            return Err(MontageError::input(format!(
                "`{}` was not found; ffmpeg is required for rendering",
                settings.ffmpeg.display()
            )));
        }
        Ok(Self { settings })
    }

    /// Path of a still ready to feed ffmpeg. Secondary slices are cut out
    /// into a temporary PNG that lives as long as the returned guard.
    fn still(
        &self,
        asset: &Asset,
        canvas: CanvasSize,
        out_dir: &Path,
    ) -> Result<(PathBuf, Option<NamedTempFile>)> {
        match asset {
            Asset::Primary(chip) => {
                if !chip.image_path.is_file() {
                    return Err(MontageError::asset(
                        &chip.id,
                        &chip.image_path,
                        "image is missing",
                    ));
                }
                Ok((chip.image_path.clone(), None))
            }
            Asset::Secondary(slice) => {
                let file = tempfile::Builder::new()
                    .prefix("slice-")
                    .suffix(".png")
                    .tempfile_in(out_dir)?;
                materialize_slice(slice, canvas, file.path())?;
                Ok((file.path().to_path_buf(), Some(file)))
            }
        }
    }
}

impl Renderer for FfmpegRenderer {
    fn render(&self, job: &RenderJob, out_dir: &Path) -> Result<ClipHandle> {
        let out = out_dir.join(job.file_name());
        let seconds = job.duration_seconds();
        let fill = fill_filter(job.canvas);
        // Temporary slice PNGs must outlive the ffmpeg run.
        let (from, _from_guard) = self.still(&job.asset, job.canvas, out_dir)?;
        let mut _into_guard = None;

        let cmd = FfmpegCommand::new(&self.settings.ffmpeg, &out)
            .still_input(job.fps, seconds, &from);
        let cmd = match &job.kind {
            SegmentKind::Normal | SegmentKind::Hold => cmd.video_filter(fill),
            SegmentKind::Crossfade { into } => {
                let (to, guard) = self.still(into, job.canvas, out_dir)?;
                _into_guard = guard;
                let graph = format!(
                    "[0:v]{fill},format=yuva420p[a];\
                     [1:v]{fill},format=yuva420p,fade=t=in:st=0:d={seconds:.6}:alpha=1[b];\
                     [a][b]overlay=format=auto,format=yuv420p[v]"
                );
                cmd.still_input(job.fps, seconds, &to)
                    .filter_complex(graph)
                    .output_args(["-map", "[v]"])
            }
        };

        cmd.frames(job.frame_count)
            .h264(job.fps, self.settings.crf, &self.settings.preset)
            .output_arg("-an")
            .run()?;
        tracing::debug!(
            segment = job.segment,
            frames = job.frame_count,
            kind = job.kind.label(),
            "rendered clip"
        );
        Ok(ClipHandle {
            segment: job.segment,
            path: out,
            frame_count: job.frame_count,
        })
    }
}

/// Cuts a slice out of its photo and scales it to cover the canvas,
/// cropping the overflow around the centre.
pub fn materialize_slice(slice: &SecondaryAsset, canvas: CanvasSize, out: &Path) -> Result<()> {
    let photo = image::open(&slice.image_path).map_err(|err| {
        MontageError::asset(&slice.id, &slice.image_path, err.to_string())
    })?;
    let (x, y, width, height) = slice.crop_region(photo.width(), photo.height());
    let filled = photo
        .crop_imm(x, y, width, height)
        .resize_to_fill(canvas.width, canvas.height, FilterType::Lanczos3);
    filled.save_with_format(out, ImageFormat::Png)?;
    Ok(())
}

/// Clips of a plan, in plan order, plus what best-effort mode papered over.
#[derive(Debug, Clone, Default)]
pub struct RenderOutput {
    pub clips: Vec<ClipHandle>,
    pub warnings: Vec<RunWarning>,
}

impl RenderOutput {
    pub fn total_frames(&self) -> u64 {
        self.clips.iter().map(|clip| clip.frame_count).sum()
    }
}

pub struct RenderDispatcher<'r> {
    renderer: &'r dyn Renderer,
    workers: usize,
    failure_mode: FailureMode,
}

impl<'r> RenderDispatcher<'r> {
    pub fn new(renderer: &'r dyn Renderer, workers: usize, failure_mode: FailureMode) -> Self {
        Self {
            renderer,
            workers: workers.max(1),
            failure_mode,
        }
    }

    /// Renders every entry of `plan` into `out_dir`.
    ///
    /// A failed segment is retried once with identical parameters. If it
    /// still fails, strict mode aborts; best-effort mode records a warning
    /// and re-renders the preceding clip (or the following one for the first
    /// segment) with the failed frames added, so no duration is lost.
    pub fn dispatch(
        &self,
        plan: &SegmentPlan,
        canvas: CanvasSize,
        out_dir: &Path,
    ) -> Result<RenderOutput> {
        let mut jobs: Vec<RenderJob> = plan
            .entries
            .iter()
            .enumerate()
            .map(|(segment, entry)| RenderJob {
                segment,
                asset: entry.asset.clone(),
                kind: entry.kind.clone(),
                frame_count: entry.frame_count,
                fps: plan.fps,
                canvas,
            })
            .collect();

        tracing::info!(segments = jobs.len(), workers = self.workers, "rendering segments");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("render-{i}"))
            .build()
            .map_err(std::io::Error::other)?;
        let results: Vec<Result<ClipHandle>> = pool.install(|| {
            jobs.par_iter()
                .map(|job| self.render_with_retry(job, out_dir))
                .collect()
        });

        let mut slots: Vec<Option<ClipHandle>> = Vec::with_capacity(results.len());
        let mut failed = Vec::new();
        let mut warnings = Vec::new();
        for (segment, result) in results.into_iter().enumerate() {
            match result {
                Ok(clip) => slots.push(Some(clip)),
                Err(err)
                    if self.failure_mode == FailureMode::BestEffort && err.is_recoverable() =>
                {
                    tracing::warn!(
                        segment,
                        error = %err,
                        "segment failed, filling gap from neighbour"
                    );
                    warnings.push(RunWarning::from_error(&err, Some(segment)));
                    slots.push(None);
                    failed.push(segment);
                }
                Err(err) => return Err(err),
            }
        }

        for segment in failed {
            let target = (0..segment)
                .rev()
                .chain(segment + 1..slots.len())
                .find(|&i| slots[i].is_some())
                .ok_or_else(|| {
                    MontageError::render(segment, "no rendered neighbour to absorb its frames")
                })?;

            jobs[target].frame_count += jobs[segment].frame_count;
            jobs[segment].frame_count = 0;
            if let Some(old) = slots[target].take() {
                let _ = std::fs::remove_file(&old.path);
            }
            slots[target] = Some(self.render_with_retry(&jobs[target], out_dir)?);
        }

        let clips: Vec<ClipHandle> = slots.into_iter().flatten().collect();
        let output = RenderOutput { clips, warnings };
        if output.total_frames() != plan.total_frames() {
            return Err(MontageError::consistency(format!(
                "rendered {} frames for a plan of {}",
                output.total_frames(),
                plan.total_frames()
            )));
        }
        Ok(output)
    }

    fn render_with_retry(&self, job: &RenderJob, out_dir: &Path) -> Result<ClipHandle> {
        match self.renderer.render(job, out_dir) {
            Ok(clip) => Ok(clip),
            Err(first) => {
                tracing::warn!(
                    segment = job.segment,
                    error = %first,
                    "render failed, retrying once"
                );
                self.renderer
                    .render(job, out_dir)
                    .map_err(|err| match err {
                        MontageError::Asset { .. } | MontageError::Render { .. } => err,
                        other => MontageError::render(job.segment, other.to_string()),
                    })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use super::*;
    use crate::{
        assets::test_support::primary,
        plan::SegmentPlanEntry,
        WarningKind,
    };

    /// Writes a marker file per clip; fails the segments listed in
    /// `failures` that many times each.
    #[derive(Default)]
    struct FakeRenderer {
        failures: Mutex<HashMap<usize, usize>>,
        calls: AtomicUsize,
        rendered: Mutex<Vec<(usize, u64)>>,
    }

    impl FakeRenderer {
        fn failing(failures: &[(usize, usize)]) -> Self {
            Self {
                failures: Mutex::new(failures.iter().copied().collect()),
                ..Default::default()
            }
        }
    }

    impl Renderer for FakeRenderer {
        fn render(&self, job: &RenderJob, out_dir: &Path) -> Result<ClipHandle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut failures = self.failures.lock().unwrap();
                if let Some(left) = failures.get_mut(&job.segment) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(MontageError::encoder("ffmpeg", "exit status 1"));
                    }
                }
            }
            let path = out_dir.join(job.file_name());
            std::fs::write(&path, job.frame_count.to_string())?;
            self.rendered.lock().unwrap().push((job.segment, job.frame_count));
            Ok(ClipHandle {
                segment: job.segment,
                path,
                frame_count: job.frame_count,
            })
        }
    }

    fn plan(frames: &[u64]) -> SegmentPlan {
        let mut start = 0;
        let entries = frames
            .iter()
            .enumerate()
            .map(|(i, &f)| {
                let entry = SegmentPlanEntry::normal(
                    Asset::Primary(primary(&format!("c{i}"), i as i64)),
                    start..start + 1,
                    f,
                );
                start += 1;
                entry
            })
            .collect();
        SegmentPlan::new(10, frames.iter().sum(), entries)
    }

    fn canvas() -> CanvasSize {
        CanvasSize {
            width: 64,
            height: 36,
        }
    }

    #[test]
    fn clips_come_back_in_plan_order() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = FakeRenderer::default();
        let plan = plan(&[5, 7, 3, 9, 4, 6]);

        let output = RenderDispatcher::new(&renderer, 3, FailureMode::Strict)
            .dispatch(&plan, canvas(), dir.path())
            .unwrap();

        let segments: Vec<_> = output.clips.iter().map(|c| c.segment).collect();
        assert_eq!(segments, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(output.total_frames(), 34);
        assert!(output.warnings.is_empty());
    }

    #[test]
    fn retries_a_failed_segment_once() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = FakeRenderer::failing(&[(1, 1)]);

        let output = RenderDispatcher::new(&renderer, 2, FailureMode::Strict)
            .dispatch(&plan(&[5, 5, 5]), canvas(), dir.path())
            .unwrap();

        assert_eq!(output.clips.len(), 3);
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn strict_mode_surfaces_render_error_after_retry() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = FakeRenderer::failing(&[(2, 2)]);

        let err = RenderDispatcher::new(&renderer, 1, FailureMode::Strict)
            .dispatch(&plan(&[5, 5, 5]), canvas(), dir.path())
            .unwrap_err();
        assert!(matches!(err, MontageError::Render { segment: 2, .. }));
    }

    #[test]
    fn best_effort_extends_previous_clip() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = FakeRenderer::failing(&[(1, 2)]);

        let output = RenderDispatcher::new(&renderer, 2, FailureMode::BestEffort)
            .dispatch(&plan(&[5, 7, 3]), canvas(), dir.path())
            .unwrap();

        let frames: Vec<_> = output.clips.iter().map(|c| (c.segment, c.frame_count)).collect();
        assert_eq!(frames, vec![(0, 12), (2, 3)]);
        assert_eq!(output.warnings.len(), 1);
        assert_eq!(output.warnings[0].kind, WarningKind::Render);
        assert_eq!(output.warnings[0].index, Some(1));
    }

    #[test]
    fn best_effort_first_segment_merges_forward() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = FakeRenderer::failing(&[(0, 2)]);

        let output = RenderDispatcher::new(&renderer, 1, FailureMode::BestEffort)
            .dispatch(&plan(&[5, 7]), canvas(), dir.path())
            .unwrap();

        assert_eq!(output.clips.len(), 1);
        assert_eq!(output.clips[0].segment, 1);
        assert_eq!(output.clips[0].frame_count, 12);
    }

    #[test]
    fn slices_are_cropped_and_filled_to_canvas() {
        let dir = tempfile::tempdir().unwrap();
        let photo = dir.path().join("tall.png");
        let mut img = image::RgbImage::new(40, 120);
        for (_, y, px) in img.enumerate_pixels_mut() {
            *px = if y < 40 {
                image::Rgb([255, 0, 0])
            } else if y < 80 {
                image::Rgb([0, 255, 0])
            } else {
                image::Rgb([0, 0, 255])
            };
        }
        img.save(&photo).unwrap();

        let slice = SecondaryAsset {
            id: "tall#2of3".to_string(),
            image_path: photo,
            segment_index: 1,
            segment_count: 3,
        };
        let out = dir.path().join("slice.png");
        materialize_slice(&slice, canvas(), &out).unwrap();

        let result = image::open(&out).unwrap().to_rgb8();
        assert_eq!(result.dimensions(), (64, 36));
        let centre = result.get_pixel(32, 18);
        assert!(centre[1] > 200 && centre[0] < 50 && centre[2] < 50);
    }

    #[test]
    fn missing_slice_photo_is_an_asset_error() {
        let dir = tempfile::tempdir().unwrap();
        let slice = SecondaryAsset {
            id: "gone".to_string(),
            image_path: dir.path().join("gone.jpg"),
            segment_index: 0,
            segment_count: 1,
        };
        let err = materialize_slice(&slice, canvas(), &dir.path().join("x.png")).unwrap_err();
        assert!(matches!(err, MontageError::Asset { .. }));
    }
}
