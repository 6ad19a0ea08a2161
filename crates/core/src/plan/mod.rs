//! The segment plan handed to the renderer.

use std::{fmt::Write as _, ops::Range};

use serde::{Deserialize, Serialize};

use crate::{assets::Asset, quantize::QuantizedTimeline, MontageError, Result};

mod report;

pub use report::{check_alignment, AlignmentReport, Misalignment, TimingReport, TimingSegment};

/// How a plan entry is put on screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SegmentKind {
    /// Hard cut to a still image.
    Normal,
    /// Freeze on the entry's asset, independent of beats.
    Hold,
    /// Linear dissolve from the entry's asset into `into`.
    Crossfade { into: Asset },
}

impl SegmentKind {
    pub fn label(&self) -> &'static str {
        match self {
            SegmentKind::Normal => "normal",
            SegmentKind::Hold => "hold",
            SegmentKind::Crossfade { .. } => "crossfade",
        }
    }

    pub fn is_transition(&self) -> bool {
        !matches!(self, SegmentKind::Normal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentPlanEntry {
    pub asset: Asset,
    pub frame_count: u64,
    pub kind: SegmentKind,
    /// Quantized intervals this entry covers. Empty for transitions, which
    /// sit between two intervals.
    pub intervals: Range<usize>,
}

impl SegmentPlanEntry {
    pub fn normal(asset: Asset, intervals: Range<usize>, frame_count: u64) -> Self {
        Self {
            asset,
            frame_count,
            kind: SegmentKind::Normal,
            intervals,
        }
    }
}

/// One row of the flat plan table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRow {
    pub index: usize,
    pub asset_id: String,
    pub kind: String,
    pub frame_count: u64,
    pub start_frame: u64,
}

/// Ordered, fully determined list of segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPlan {
    pub fps: u32,
    /// Frames allotted by the quantizer.
    pub base_frames: u64,
    pub entries: Vec<SegmentPlanEntry>,
}

impl SegmentPlan {
    pub fn new(fps: u32, base_frames: u64, entries: Vec<SegmentPlanEntry>) -> Self {
        Self {
            fps,
            base_frames,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_frames(&self) -> u64 {
        self.entries.iter().map(|entry| entry.frame_count).sum()
    }

    /// Frames added on top of the base allotment by hold and crossfade.
    pub fn transition_frames(&self) -> u64 {
        self.entries
            .iter()
            .filter(|entry| entry.kind.is_transition())
            .map(|entry| entry.frame_count)
            .sum()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.total_frames() as f64 / self.fps as f64
    }

    /// First output frame of every entry.
    pub fn start_frames(&self) -> Vec<u64> {
        let mut start = 0;
        self.entries
            .iter()
            .map(|entry| {
                let current = start;
                start += entry.frame_count;
                current
            })
            .collect()
    }

    /// Cut positions in seconds on the output timeline, including `0` and
    /// the end of the last entry.
    pub fn boundaries_seconds(&self) -> Vec<f64> {
        let fps = self.fps as f64;
        let mut boundaries: Vec<f64> = self
            .start_frames()
            .into_iter()
            .map(|frame| frame as f64 / fps)
            .collect();
        boundaries.push(self.total_frames() as f64 / fps);
        boundaries
    }

    pub fn rows(&self) -> Vec<PlanRow> {
        self.entries
            .iter()
            .zip(self.start_frames())
            .enumerate()
            .map(|(index, (entry, start_frame))| PlanRow {
                index,
                asset_id: entry.asset.id().to_string(),
                kind: entry.kind.label().to_string(),
                frame_count: entry.frame_count,
                start_frame,
            })
            .collect()
    }

    /// Pipe separated table, one row per entry, with a header line.
    pub fn to_table(&self) -> String {
        let mut out = String::from("index|asset_id|kind|frame_count|start_frame\n");
        for row in self.rows() {
            let _ = writeln!(
                out,
                "{}|{}|{}|{}|{}",
                row.index, row.asset_id, row.kind, row.frame_count, row.start_frame
            );
        }
        out
    }

    /// Cross-checks the plan against the timeline it was built from.
    ///
    /// Normal entries must cover every interval exactly once, in order, with
    /// frame counts equal to the intervals they span. Transitions must not
    /// claim intervals.
    pub fn validate(&self, timeline: &QuantizedTimeline) -> Result<()> {
        if self.base_frames != timeline.total_frames {
            return Err(MontageError::consistency(format!(
                "plan base of {} frames does not match timeline total {}",
                self.base_frames, timeline.total_frames
            )));
        }

        let mut next_interval = 0usize;
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.frame_count == 0 {
                return Err(MontageError::consistency(format!(
                    "segment {index} has no frames"
                )));
            }
            if entry.kind.is_transition() {
                if !entry.intervals.is_empty() {
                    return Err(MontageError::consistency(format!(
                        "transition segment {index} claims intervals {:?}",
                        entry.intervals
                    )));
                }
                continue;
            }

            if entry.intervals.start != next_interval || entry.intervals.is_empty() {
                return Err(MontageError::consistency(format!(
                    "segment {index} covers intervals {:?}, expected to start at {next_interval}",
                    entry.intervals
                )));
            }
            let spanned = timeline
                .intervals
                .get(entry.intervals.clone())
                .ok_or_else(|| {
                    MontageError::consistency(format!(
                        "segment {index} covers intervals {:?} beyond the timeline",
                        entry.intervals
                    ))
                })?;
            let expected: u64 = spanned.iter().map(|interval| interval.frame_count()).sum();
            if expected != entry.frame_count {
                return Err(MontageError::consistency(format!(
                    "segment {index} has {} frames but its intervals span {expected}",
                    entry.frame_count
                )));
            }
            next_interval = entry.intervals.end;
        }

        if next_interval != timeline.len() {
            return Err(MontageError::consistency(format!(
                "plan covers {next_interval} of {} intervals",
                timeline.len()
            )));
        }
        if self.total_frames() != self.base_frames + self.transition_frames() {
            return Err(MontageError::consistency("plan frame total does not add up"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assets::test_support::primary, quantize::Quantizer};

    fn chip(id: &str) -> Asset {
        Asset::Primary(primary(id, 0))
    }

    fn sample_plan() -> (QuantizedTimeline, SegmentPlan) {
        let timeline = Quantizer::new(10, 2.0)
            .quantize(&[0.5, 1.0, 1.5], 2.0)
            .unwrap();
        let entries = vec![
            SegmentPlanEntry::normal(chip("a"), 0..1, 5),
            SegmentPlanEntry::normal(chip("b"), 1..2, 5),
            SegmentPlanEntry {
                asset: chip("b"),
                frame_count: 3,
                kind: SegmentKind::Hold,
                intervals: 2..2,
            },
            SegmentPlanEntry::normal(chip("b"), 2..4, 10),
        ];
        let plan = SegmentPlan::new(10, timeline.total_frames, entries);
        (timeline, plan)
    }

    #[test]
    fn table_lists_cumulative_start_frames() {
        let (_, plan) = sample_plan();
        let table = plan.to_table();
        let lines: Vec<_> = table.lines().collect();

        assert_eq!(lines[0], "index|asset_id|kind|frame_count|start_frame");
        assert_eq!(lines[3], "2|b|hold|3|10");
        assert_eq!(lines[4], "3|b|normal|10|13");
        assert_eq!(plan.total_frames(), 23);
        assert_eq!(plan.transition_frames(), 3);
    }

    #[test]
    fn boundaries_include_both_ends() {
        let (_, plan) = sample_plan();
        assert_eq!(plan.boundaries_seconds(), vec![0.0, 0.5, 1.0, 1.3, 2.3]);
    }

    #[test]
    fn validates_a_consistent_plan() {
        let (timeline, plan) = sample_plan();
        plan.validate(&timeline).unwrap();
    }

    #[test]
    fn rejects_uncovered_and_mismatched_intervals() {
        let (timeline, mut plan) = sample_plan();
        plan.entries[3].frame_count = 9;
        assert!(matches!(
            plan.validate(&timeline),
            Err(MontageError::Consistency(_))
        ));

        let (timeline, mut plan) = sample_plan();
        plan.entries.pop();
        assert!(matches!(
            plan.validate(&timeline),
            Err(MontageError::Consistency(_))
        ));
    }

    #[test]
    fn json_tags_kind_and_pool() {
        let (_, plan) = sample_plan();
        let json = serde_json::to_string(&plan).unwrap();
        assert!(json.contains(r#""type":"hold""#));
        assert!(json.contains(r#""pool":"primary""#));
    }
}
