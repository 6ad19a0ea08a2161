use std::{fmt::Write as _, path::Path};

use serde::{Deserialize, Serialize};

use super::SegmentPlan;
use crate::Result;

const TIMING_HEADER: &str =
    "# segment_index|asset_id|sort_key|start_time|end_time|duration|frame_count";
const BEATS_HEADER: &str = "# Beat times";

/// One line of a timing report, times in seconds on the output timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSegment {
    pub index: usize,
    pub asset_id: String,
    pub sort_key: Option<i64>,
    pub start_time: f64,
    pub end_time: f64,
    pub frame_count: u64,
}

impl TimingSegment {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Per-segment timing next to the beats it was cut to, written as text so
/// it can be inspected or plotted outside the compiler.
///
/// ```text
/// segment_index|asset_id|sort_key|start_time|end_time|duration|frame_count
/// ...
/// # Beat times
/// 0.500000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingReport {
    pub segments: Vec<TimingSegment>,
    pub beats: Vec<f64>,
}

impl TimingReport {
    pub fn from_plan(plan: &SegmentPlan, beats: &[f64]) -> Self {
        let fps = plan.fps as f64;
        let segments = plan
            .entries
            .iter()
            .zip(plan.start_frames())
            .enumerate()
            .map(|(index, (entry, start))| TimingSegment {
                index,
                asset_id: entry.asset.id().to_string(),
                sort_key: entry.asset.sort_key(),
                start_time: start as f64 / fps,
                end_time: (start + entry.frame_count) as f64 / fps,
                frame_count: entry.frame_count,
            })
            .collect();

        Self {
            segments,
            beats: beats.to_vec(),
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = String::from(TIMING_HEADER);
        out.push('\n');
        for segment in &self.segments {
            let sort_key = segment
                .sort_key
                .map(|key| key.to_string())
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "{}|{}|{}|{:.6}|{:.6}|{:.6}|{}",
                segment.index,
                segment.asset_id,
                sort_key,
                segment.start_time,
                segment.end_time,
                segment.duration(),
                segment.frame_count
            );
        }
        out.push_str(BEATS_HEADER);
        out.push('\n');
        for beat in &self.beats {
            let _ = writeln!(out, "{beat:.6}");
        }
        out
    }

    /// Parses the text form. Malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut report = Self::default();
        let mut in_beats = false;

        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                if line.starts_with(BEATS_HEADER) {
                    in_beats = true;
                }
                continue;
            }

            if in_beats {
                if let Ok(beat) = line.parse::<f64>() {
                    report.beats.push(beat);
                }
            } else if let Some(segment) = parse_segment_line(line) {
                report.segments.push(segment);
            }
        }
        report
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_text())?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Segment boundaries in seconds, both ends included.
    pub fn boundaries(&self) -> Vec<f64> {
        let mut boundaries: Vec<f64> = self.segments.iter().map(|s| s.start_time).collect();
        if let Some(last) = self.segments.last() {
            boundaries.push(last.end_time);
        }
        boundaries
    }
}

fn parse_segment_line(line: &str) -> Option<TimingSegment> {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() < 7 {
        return None;
    }
    let sort_key = match parts[2] {
        "" => None,
        key => Some(key.parse().ok()?),
    };
    Some(TimingSegment {
        index: parts[0].parse().ok()?,
        asset_id: parts[1].to_string(),
        sort_key,
        start_time: parts[3].parse().ok()?,
        end_time: parts[4].parse().ok()?,
        frame_count: parts[6].parse().ok()?,
    })
}

/// A beat that is not close enough to any cut.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Misalignment {
    pub beat: f64,
    pub distance: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlignmentReport {
    pub tolerance: f64,
    pub beats_checked: usize,
    pub misaligned: Vec<Misalignment>,
}

impl AlignmentReport {
    pub fn is_aligned(&self) -> bool {
        self.misaligned.is_empty()
    }
}

/// Compares every beat with its nearest boundary.
///
/// `boundaries` must be sorted ascending.
pub fn check_alignment(boundaries: &[f64], beats: &[f64], tolerance: f64) -> AlignmentReport {
    let misaligned = beats
        .iter()
        .filter_map(|&beat| {
            let distance = nearest_distance(boundaries, beat)?;
            (distance > tolerance).then_some(Misalignment { beat, distance })
        })
        .collect();

    AlignmentReport {
        tolerance,
        beats_checked: beats.len(),
        misaligned,
    }
}

fn nearest_distance(sorted: &[f64], value: f64) -> Option<f64> {
    let split = sorted.partition_point(|&b| b < value);
    let after = sorted.get(split).map(|b| (b - value).abs());
    let before = split
        .checked_sub(1)
        .and_then(|i| sorted.get(i))
        .map(|b| (value - b).abs());
    match (before, after) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
