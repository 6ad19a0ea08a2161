//! Beat-time quantization.
//!
//! Every timestamp is snapped to an integer frame index once, and everything
//! downstream works in frames. Seconds are only derived again for display.

use serde::{Deserialize, Serialize};

use crate::{config::CompileConfig, onset::normalize_onsets, MontageError, Result};

/// Half-open span `[start_frame, end_frame)` of output frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameInterval {
    pub start_frame: u64,
    pub end_frame: u64,
}

impl FrameInterval {
    pub fn new(start_frame: u64, end_frame: u64) -> Self {
        Self {
            start_frame,
            end_frame,
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.end_frame.saturating_sub(self.start_frame)
    }
}

/// Where the cut points of a timeline came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CutSource {
    Onsets,
    /// No usable onsets; cuts were synthesized at a fixed cadence.
    FallbackCadence,
}

/// Output of the [`Quantizer`]: a contiguous, gap-free interval list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedTimeline {
    pub fps: u32,
    pub total_frames: u64,
    pub source: CutSource,
    pub intervals: Vec<FrameInterval>,
}

impl QuantizedTimeline {
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Quantizer {
    fps: u32,
    fallback_cadence_seconds: f64,
}

impl Quantizer {
    pub fn new(fps: u32, fallback_cadence_seconds: f64) -> Self {
        Self {
            fps,
            fallback_cadence_seconds,
        }
    }

    pub fn from_config(config: &CompileConfig) -> Self {
        Self::new(config.fps, config.fallback_cadence_seconds)
    }

    /// Total frame count for a duration. This is the authoritative length of
    /// the output.
    pub fn total_frames(&self, target_duration: f64) -> u64 {
        seconds_to_frame(target_duration, self.fps)
    }

    pub fn quantize(&self, onsets: &[f64], target_duration: f64) -> Result<QuantizedTimeline> {
        if self.fps == 0 {
            return Err(MontageError::input("fps must be positive"));
        }
        if !target_duration.is_finite() || target_duration <= 0.0 {
            return Err(MontageError::input(format!(
                "target duration must be a positive number of seconds, got {target_duration}"
            )));
        }

        let total_frames = self.total_frames(target_duration);
        let onsets = normalize_onsets(onsets, target_duration);

        let mut cuts: Vec<u64> = onsets
            .iter()
            .map(|&t| seconds_to_frame(t, self.fps))
            .filter(|&frame| frame <= total_frames)
            .collect();
        cuts.dedup();

        let source = if cuts.iter().any(|&frame| frame < total_frames) {
            CutSource::Onsets
        } else {
            tracing::warn!(
                cadence = self.fallback_cadence_seconds,
                "no usable onsets, falling back to uniform cuts"
            );
            cuts = self.fallback_cuts(total_frames)?;
            CutSource::FallbackCadence
        };

        let intervals = build_intervals(&cuts, total_frames);
        if intervals.is_empty() {
            return Err(MontageError::input(format!(
                "target duration {target_duration}s yields no frames at {} fps",
                self.fps
            )));
        }
        validate_intervals(&intervals, total_frames)?;

        tracing::debug!(
            total_frames,
            intervals = intervals.len(),
            ?source,
            "quantized timeline"
        );

        Ok(QuantizedTimeline {
            fps: self.fps,
            total_frames,
            source,
            intervals,
        })
    }

    fn fallback_cuts(&self, total_frames: u64) -> Result<Vec<u64>> {
        let cadence = self.fallback_cadence_seconds;
        if !cadence.is_finite() || cadence <= 0.0 {
            return Err(MontageError::input(
                "fallback cadence must be a positive number of seconds",
            ));
        }

        // Never step below one frame; finer cadences only land on the same frames.
        let cadence = cadence.max(1.0 / self.fps as f64);
        let mut cuts = vec![0];
        let mut k = 1u64;
        loop {
            let frame = seconds_to_frame(k as f64 * cadence, self.fps);
            if frame >= total_frames {
                break;
            }
            if cuts.last() != Some(&frame) {
                cuts.push(frame);
            }
            k += 1;
        }
        Ok(cuts)
    }
}

pub fn seconds_to_frame(seconds: f64, fps: u32) -> u64 {
    (seconds * fps as f64).round().max(0.0) as u64
}

/// Turns sorted, unique cut frames into intervals, adding the pre-roll
/// before the first cut and the tail up to `total_frames`.
fn build_intervals(cuts: &[u64], total_frames: u64) -> Vec<FrameInterval> {
    let mut boundaries = Vec::with_capacity(cuts.len() + 2);
    boundaries.push(0);
    boundaries.extend(cuts.iter().copied().filter(|&f| f > 0 && f < total_frames));
    boundaries.push(total_frames);

    boundaries
        .windows(2)
        .filter(|pair| pair[1] > pair[0])
        .map(|pair| FrameInterval::new(pair[0], pair[1]))
        .collect()
}

/// Checks contiguity, monotonicity and exact coverage of `[0, total_frames)`.
pub fn validate_intervals(intervals: &[FrameInterval], total_frames: u64) -> Result<()> {
    let Some(first) = intervals.first() else {
        return Err(MontageError::consistency("interval list is empty"));
    };
    if first.start_frame != 0 {
        return Err(MontageError::consistency(format!(
            "first interval starts at frame {} instead of 0",
            first.start_frame
        )));
    }

    let mut covered = 0u64;
    for (index, interval) in intervals.iter().enumerate() {
        if interval.end_frame <= interval.start_frame {
            return Err(MontageError::consistency(format!(
                "interval {index} is empty or reversed: [{}, {})",
                interval.start_frame, interval.end_frame
            )));
        }
        if let Some(next) = intervals.get(index + 1) {
            if next.start_frame != interval.end_frame {
                return Err(MontageError::consistency(format!(
                    "interval {index} ends at {} but interval {} starts at {}",
                    interval.end_frame,
                    index + 1,
                    next.start_frame
                )));
            }
        }
        covered += interval.frame_count();
    }

    if covered != total_frames {
        return Err(MontageError::consistency(format!(
            "intervals cover {covered} frames, expected {total_frames}"
        )));
    }
    Ok(())
}
