//! Hold and crossfade inserted where the primary pool runs out.
//!
//! This is the only place two assets are blended instead of cut. The lengths
//! come from configuration and do not depend on beat timing; the frames are
//! added on top of the beat-quantized timeline.

use serde::{Deserialize, Serialize};

use crate::{
    assets::{Asset, PrimaryAsset, SecondaryAsset},
    config::TransitionConfig,
    plan::{SegmentKind, SegmentPlanEntry},
    quantize::seconds_to_frame,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionSpec {
    pub hold_frames: u64,
    pub crossfade_frames: u64,
}

impl TransitionSpec {
    pub fn from_config(config: &TransitionConfig, fps: u32) -> Self {
        Self {
            hold_frames: seconds_to_frame(config.hold_seconds, fps),
            crossfade_frames: seconds_to_frame(config.crossfade_seconds, fps),
        }
    }

    pub fn total_frames(&self) -> u64 {
        self.hold_frames + self.crossfade_frames
    }

    /// Builds the hold on `last_primary` followed by the dissolve into
    /// `first_secondary`, positioned before interval `at_interval`.
    /// A part that rounds to zero frames is left out.
    pub fn insert(
        &self,
        last_primary: &PrimaryAsset,
        first_secondary: &SecondaryAsset,
        at_interval: usize,
    ) -> Vec<SegmentPlanEntry> {
        let from: Asset = last_primary.clone().into();
        let mut entries = Vec::with_capacity(2);

        if self.hold_frames > 0 {
            entries.push(SegmentPlanEntry {
                asset: from.clone(),
                frame_count: self.hold_frames,
                kind: SegmentKind::Hold,
                intervals: at_interval..at_interval,
            });
        }
        if self.crossfade_frames > 0 {
            entries.push(SegmentPlanEntry {
                asset: from,
                frame_count: self.crossfade_frames,
                kind: SegmentKind::Crossfade {
                    into: first_secondary.clone().into(),
                },
                intervals: at_interval..at_interval,
            });
        }

        tracing::debug!(
            from = %last_primary.id,
            into = %first_secondary.id,
            hold = self.hold_frames,
            crossfade = self.crossfade_frames,
            "inserted transition"
        );
        entries
    }
}
