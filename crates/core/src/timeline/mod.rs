//! Timeline assembly: walks the quantized intervals and assigns assets.
//!
//! The assembler is an explicit state machine. It starts in
//! [`AssemblerState::Primary`], moves through `TransitionPending` exactly once
//! when the primary pool runs out, and ends up in `Secondary` (fallback
//! photos, several beats per photo) or `Frozen` (no photos, the last chip
//! stays on screen). It never goes back to `Primary`.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{
    assets::{Asset, AssetLedger, PrimaryAsset, SecondaryAsset},
    config::CompileConfig,
    plan::{SegmentPlan, SegmentPlanEntry},
    quantize::{FrameInterval, QuantizedTimeline, Quantizer},
    transition::TransitionSpec,
    MontageError, Result, RunWarning,
};

/// Frames collected while in the secondary phase, waiting for enough beats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accumulation {
    /// Slice already drawn for this segment. Set for the first secondary
    /// segment, which shows the crossfade target.
    pub asset: Option<SecondaryAsset>,
    pub first_interval: usize,
    pub folded: usize,
    pub frames: u64,
}

impl Accumulation {
    fn new(asset: Option<SecondaryAsset>, first_interval: usize) -> Self {
        Self {
            asset,
            first_interval,
            folded: 0,
            frames: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AssemblerState {
    #[default]
    Primary,
    /// Primary pool exhausted while intervals remain. `last_primary` is the
    /// last chip that was actually placed, if any.
    TransitionPending { last_primary: Option<PrimaryAsset> },
    Secondary(Accumulation),
    Frozen { asset: PrimaryAsset },
}

impl AssemblerState {
    pub fn phase(&self) -> Phase {
        match self {
            AssemblerState::Primary => Phase::Primary,
            AssemblerState::TransitionPending { .. } => Phase::TransitionPending,
            AssemblerState::Secondary(_) => Phase::Secondary,
            AssemblerState::Frozen { .. } => Phase::Frozen,
        }
    }
}

/// Data-free tag of an [`AssemblerState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    Primary,
    TransitionPending,
    Secondary,
    Frozen,
}

/// What a state handler did with the current interval.
enum Step {
    /// The interval is used up; continue with the next one in this state.
    Consumed(AssemblerState),
    /// The state changed without using the interval; handle it again.
    Reenter(AssemblerState),
}

/// Best-effort frames that had no earlier segment to attach to.
#[derive(Debug, Clone, Copy)]
struct Carry {
    first_interval: usize,
    frames: u64,
}

/// Result of planning a run.
#[derive(Debug, Clone)]
pub struct CompiledPlan {
    pub timeline: QuantizedTimeline,
    pub plan: SegmentPlan,
    /// Interval at which the primary pool ran out, if it did.
    pub primary_exhausted_at: Option<usize>,
    pub final_phase: Phase,
    pub warnings: Vec<RunWarning>,
}

pub struct TimelineAssembler<'a> {
    ledger: &'a mut AssetLedger,
    config: &'a CompileConfig,
    transition: TransitionSpec,
    state: AssemblerState,
    entries: Vec<SegmentPlanEntry>,
    warnings: Vec<RunWarning>,
    last_good_primary: Option<PrimaryAsset>,
    primary_exhausted_at: Option<usize>,
    carry: Option<Carry>,
    phases: Vec<Phase>,
}

impl<'a> TimelineAssembler<'a> {
    pub fn new(ledger: &'a mut AssetLedger, config: &'a CompileConfig) -> Self {
        Self {
            ledger,
            config,
            transition: TransitionSpec::from_config(&config.transition, config.fps),
            state: AssemblerState::Primary,
            entries: Vec::new(),
            warnings: Vec::new(),
            last_good_primary: None,
            primary_exhausted_at: None,
            carry: None,
            phases: vec![Phase::Primary],
        }
    }

    /// Every phase entered so far, in order.
    pub fn phase_history(&self) -> &[Phase] {
        &self.phases
    }

    pub fn assemble(mut self, timeline: QuantizedTimeline) -> Result<CompiledPlan> {
        for (index, interval) in timeline.intervals.iter().enumerate() {
            self.consume(index, interval)?;
        }
        self.finish()?;

        let plan = SegmentPlan::new(timeline.fps, timeline.total_frames, self.entries);
        plan.validate(&timeline)?;

        tracing::info!(
            segments = plan.len(),
            base_frames = plan.base_frames,
            transition_frames = plan.transition_frames(),
            warnings = self.warnings.len(),
            "assembled segment plan"
        );

        Ok(CompiledPlan {
            timeline,
            plan,
            primary_exhausted_at: self.primary_exhausted_at,
            final_phase: self.state.phase(),
            warnings: self.warnings,
        })
    }

    fn consume(&mut self, index: usize, interval: &FrameInterval) -> Result<()> {
        loop {
            let step = match std::mem::take(&mut self.state) {
                AssemblerState::Primary => self.on_primary(index, interval)?,
                AssemblerState::TransitionPending { last_primary } => {
                    self.on_transition(index, last_primary)?
                }
                AssemblerState::Secondary(acc) => self.on_secondary(index, interval, acc)?,
                AssemblerState::Frozen { asset } => self.on_frozen(index, interval, asset),
            };

            match step {
                Step::Consumed(next) => {
                    self.enter(next);
                    return Ok(());
                }
                Step::Reenter(next) => self.enter(next),
            }
        }
    }

    fn enter(&mut self, next: AssemblerState) {
        let phase = next.phase();
        if self.phases.last() != Some(&phase) {
            tracing::debug!(?phase, "assembler phase change");
            self.phases.push(phase);
        }
        self.state = next;
    }

    fn on_primary(&mut self, index: usize, interval: &FrameInterval) -> Result<Step> {
        let Some(chip) = self.ledger.next_primary().cloned() else {
            self.primary_exhausted_at = Some(index);
            tracing::info!(interval = index, "primary assets exhausted");
            return Ok(Step::Reenter(AssemblerState::TransitionPending {
                last_primary: self.last_good_primary.clone(),
            }));
        };

        let asset: Asset = chip.clone().into();
        match self.ledger.verify(&asset) {
            Ok(()) => {
                self.push_normal(asset, index..index + 1, interval.frame_count());
                self.last_good_primary = Some(chip);
            }
            Err(err) => self.recover(err, index, interval.frame_count())?,
        }
        Ok(Step::Consumed(AssemblerState::Primary))
    }

    fn on_transition(&mut self, index: usize, last_primary: Option<PrimaryAsset>) -> Result<Step> {
        let first = self.draw_secondary()?;
        match (last_primary, first) {
            (Some(last), Some(first)) => {
                let inserted = self.transition.insert(&last, &first, index);
                self.entries.extend(inserted);
                Ok(Step::Reenter(AssemblerState::Secondary(Accumulation::new(
                    Some(first),
                    index,
                ))))
            }
            (None, Some(first)) => {
                // Nothing was placed yet, so there is nothing to fade from.
                Ok(Step::Reenter(AssemblerState::Secondary(Accumulation::new(
                    Some(first),
                    index,
                ))))
            }
            (Some(last), None) => {
                tracing::info!(asset = %last.id, "no secondary pool, freezing on last primary");
                Ok(Step::Reenter(AssemblerState::Frozen { asset: last }))
            }
            (None, None) => Err(MontageError::input(
                "no usable primary or secondary asset to place",
            )),
        }
    }

    fn on_secondary(
        &mut self,
        index: usize,
        interval: &FrameInterval,
        mut acc: Accumulation,
    ) -> Result<Step> {
        acc.folded += 1;
        acc.frames += interval.frame_count();

        if acc.folded < self.config.min_secondary_dwell {
            return Ok(Step::Consumed(AssemblerState::Secondary(acc)));
        }

        self.flush_secondary(acc, index + 1)?;
        Ok(Step::Consumed(AssemblerState::Secondary(Accumulation::new(
            None,
            index + 1,
        ))))
    }

    fn on_frozen(&mut self, index: usize, interval: &FrameInterval, asset: PrimaryAsset) -> Step {
        self.push_normal(
            asset.clone().into(),
            index..index + 1,
            interval.frame_count(),
        );
        Step::Consumed(AssemblerState::Frozen { asset })
    }

    fn flush_secondary(&mut self, acc: Accumulation, end_interval: usize) -> Result<()> {
        let slice = match acc.asset {
            Some(slice) => slice,
            None => self.draw_secondary()?.ok_or_else(|| {
                MontageError::consistency("secondary pool went empty after issuing a slice")
            })?,
        };
        self.push_normal(
            slice.into(),
            acc.first_interval..end_interval,
            acc.frames,
        );
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let partial = match &mut self.state {
            AssemblerState::Secondary(acc) if acc.folded > 0 => {
                let end = acc.first_interval + acc.folded;
                Some((std::mem::replace(acc, Accumulation::new(None, end)), end))
            }
            _ => None,
        };
        if let Some((acc, end)) = partial {
            self.flush_secondary(acc, end)?;
        }

        if let Some(carry) = self.carry {
            return Err(MontageError::input(format!(
                "no usable asset for {} frames starting at interval {}",
                carry.frames, carry.first_interval
            )));
        }
        Ok(())
    }

    /// Draws the next slice. Unreadable photos are skipped in best-effort
    /// mode and abort the run otherwise.
    fn draw_secondary(&mut self) -> Result<Option<SecondaryAsset>> {
        loop {
            match self.ledger.next_secondary() {
                Ok(slice) => return Ok(slice.cloned()),
                Err(err) if err.is_recoverable() && self.config.best_effort() => {
                    tracing::warn!(error = %err, "skipping unreadable secondary photo");
                    self.warnings.push(RunWarning::from_error(&err, None));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Handles an interval whose asset could not be used. In best-effort
    /// mode the previous segment grows to cover it, or the frames wait for
    /// the next segment when nothing precedes them.
    fn recover(&mut self, err: MontageError, index: usize, frames: u64) -> Result<()> {
        if !(err.is_recoverable() && self.config.best_effort()) {
            return Err(err);
        }
        tracing::warn!(
            interval = index,
            error = %err,
            "extending previous segment over unusable asset"
        );
        self.warnings.push(RunWarning::from_error(&err, Some(index)));

        match self.entries.last_mut() {
            Some(previous) if !previous.kind.is_transition() => {
                previous.frame_count += frames;
                previous.intervals.end = index + 1;
            }
            _ => {
                let carry = self.carry.get_or_insert(Carry {
                    first_interval: index,
                    frames: 0,
                });
                carry.frames += frames;
            }
        }
        Ok(())
    }

    fn push_normal(&mut self, asset: Asset, mut intervals: Range<usize>, mut frames: u64) {
        if let Some(carry) = self.carry.take() {
            intervals.start = carry.first_interval;
            frames += carry.frames;
        }
        tracing::debug!(
            asset = asset.id(),
            ?intervals,
            frames,
            "placed segment"
        );
        self.entries
            .push(SegmentPlanEntry::normal(asset, intervals, frames));
    }
}

/// Quantizes `onsets` and assembles the segment plan for one run.
///
/// Pure with respect to its inputs: the same onsets, duration, config and
/// asset ordering always produce the same plan.
pub fn compile_plan(
    onsets: &[f64],
    target_duration: f64,
    config: &CompileConfig,
    ledger: &mut AssetLedger,
) -> Result<CompiledPlan> {
    config.validate()?;
    if ledger.primary_len() == 0 {
        return Err(MontageError::input("primary catalog is empty"));
    }

    let timeline = Quantizer::from_config(config).quantize(onsets, target_duration)?;
    tracing::info!(
        intervals = timeline.len(),
        total_frames = timeline.total_frames,
        fps = timeline.fps,
        primary = ledger.remaining_primary(),
        secondary_pool = ledger.has_secondary_pool(),
        "compiling timeline"
    );
    TimelineAssembler::new(ledger, config).assemble(timeline)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        assets::test_support::{primary, TableProbe},
        config::FailureMode,
        plan::SegmentKind,
        quantize::CutSource,
        WarningKind,
    };

    fn chips(n: usize) -> Vec<PrimaryAsset> {
        (0..n)
            .map(|i| primary(&format!("chip{i}"), 1970 + i as i64))
            .collect()
    }

    fn readable(chips: &[PrimaryAsset], photos: &[(&str, (u32, u32))]) -> TableProbe {
        let mut probe = TableProbe::with(photos);
        for chip in chips {
            probe.0.insert(chip.image_path.clone(), (640, 480));
        }
        probe
    }

    fn config(fps: u32) -> CompileConfig {
        CompileConfig {
            fps,
            ..Default::default()
        }
    }

    /// Onsets every second, giving `n` one-second intervals.
    fn beats(n: usize) -> (Vec<f64>, f64) {
        ((1..n).map(|i| i as f64).collect(), n as f64)
    }

    #[test]
    fn primaries_map_one_to_one() {
        let primary = chips(4);
        let probe = readable(&primary, &[]);
        let mut ledger = AssetLedger::new(primary, Vec::new(), Box::new(probe));

        let compiled = compile_plan(&[0.5, 1.0, 1.5], 2.0, &config(10), &mut ledger).unwrap();
        let ids: Vec<_> = compiled.plan.entries.iter().map(|e| e.asset.id()).collect();

        assert_eq!(ids, vec!["chip0", "chip1", "chip2", "chip3"]);
        assert!(compiled.plan.entries.iter().all(|e| e.frame_count == 5));
        assert_eq!(compiled.plan.total_frames(), 20);
        assert_eq!(compiled.primary_exhausted_at, None);
        assert_eq!(compiled.final_phase, Phase::Primary);
    }

    #[test]
    fn freezes_last_primary_without_secondary_pool() {
        let primary = chips(3);
        let probe = readable(&primary, &[]);
        let mut ledger = AssetLedger::new(primary, Vec::new(), Box::new(probe));
        let (onsets, duration) = beats(10);

        let compiled = compile_plan(&onsets, duration, &config(10), &mut ledger).unwrap();
        let plan = &compiled.plan;

        assert_eq!(plan.len(), 10);
        assert_eq!(plan.transition_frames(), 0);
        assert_eq!(plan.entries[0].asset.id(), "chip0");
        assert_eq!(plan.entries[2].asset.id(), "chip2");
        assert!(plan.entries[3..].iter().all(|e| e.asset.id() == "chip2"));
        assert_eq!(compiled.primary_exhausted_at, Some(3));
        assert_eq!(compiled.final_phase, Phase::Frozen);
        assert_eq!(plan.total_frames(), 100);
    }

    #[test]
    fn inserts_transition_and_folds_secondary_beats() {
        let primary = chips(2);
        let photos = [("/photos/a.jpg", (100, 300)), ("/photos/b.jpg", (400, 300))];
        let probe = readable(&primary, &photos);
        let mut ledger = AssetLedger::new(
            primary,
            vec![PathBuf::from("/photos/a.jpg"), PathBuf::from("/photos/b.jpg")],
            Box::new(probe),
        );
        let (onsets, duration) = beats(12);

        let compiled = compile_plan(&onsets, duration, &config(10), &mut ledger).unwrap();
        let plan = &compiled.plan;
        let kinds: Vec<_> = plan.entries.iter().map(|e| e.kind.label()).collect();
        let ids: Vec<_> = plan.entries.iter().map(|e| e.asset.id()).collect();

        // 2 chips, hold, crossfade, then 10 intervals folded 4 + 4 + 2.
        assert_eq!(
            kinds,
            vec!["normal", "normal", "hold", "crossfade", "normal", "normal", "normal"]
        );
        assert_eq!(
            ids,
            vec!["chip0", "chip1", "chip1", "chip1", "a#1of3", "a#2of3", "a#3of3"]
        );
        match &plan.entries[3].kind {
            SegmentKind::Crossfade { into } => assert_eq!(into.id(), "a#1of3"),
            other => panic!("expected crossfade, got {other:?}"),
        }
        assert_eq!(plan.entries[2].frame_count, 8); // round(0.75 * 10)
        assert_eq!(plan.entries[3].frame_count, 5);
        assert_eq!(plan.entries[4].intervals, 2..6);
        assert_eq!(plan.entries[4].frame_count, 40);
        assert_eq!(plan.entries[6].intervals, 10..12);
        assert_eq!(plan.total_frames(), 120 + 13);
        assert_eq!(compiled.final_phase, Phase::Secondary);
    }

    #[test]
    fn every_secondary_segment_but_the_last_meets_the_dwell() {
        let primary = chips(1);
        let probe = readable(&primary, &[("/p/x.jpg", (100, 100))]);
        let mut ledger =
            AssetLedger::new(primary, vec![PathBuf::from("/p/x.jpg")], Box::new(probe));
        let (onsets, duration) = beats(40);
        let config = CompileConfig {
            min_secondary_dwell: 3,
            ..config(30)
        };

        let compiled = compile_plan(&onsets, duration, &config, &mut ledger).unwrap();
        let secondary: Vec<_> = compiled
            .plan
            .entries
            .iter()
            .filter(|e| !e.kind.is_transition() && !e.asset.is_primary())
            .collect();

        let (last, rest) = secondary.split_last().unwrap();
        assert!(rest.iter().all(|e| e.intervals.len() >= 3));
        assert!(last.intervals.len() <= 3);
        // A single photo with one slice is frozen on after it is used.
        assert!(secondary.iter().all(|e| e.asset.id() == "x"));
    }

    #[test]
    fn never_returns_to_primary() {
        let primary = chips(5);
        let probe = readable(&primary, &[("/p/x.jpg", (100, 100))]);
        let mut ledger =
            AssetLedger::new(primary, vec![PathBuf::from("/p/x.jpg")], Box::new(probe));
        let config = config(10);
        let (onsets, duration) = beats(30);
        let timeline = Quantizer::from_config(&config)
            .quantize(&onsets, duration)
            .unwrap();

        let mut assembler = TimelineAssembler::new(&mut ledger, &config);
        for (index, interval) in timeline.intervals.iter().enumerate() {
            assembler.consume(index, interval).unwrap();
        }

        assert_eq!(
            assembler.phase_history(),
            &[Phase::Primary, Phase::TransitionPending, Phase::Secondary]
        );
    }

    #[test]
    fn identical_inputs_give_identical_plans() {
        let run = || {
            let primary = chips(6);
            let probe = readable(&primary, &[("/p/a.jpg", (100, 260)), ("/p/b.jpg", (100, 90))]);
            let mut ledger = AssetLedger::new(
                primary,
                vec![PathBuf::from("/p/a.jpg"), PathBuf::from("/p/b.jpg")],
                Box::new(probe),
            );
            let onsets: Vec<f64> = (1..200).map(|i| i as f64 * 0.377).collect();
            let compiled = compile_plan(&onsets, 80.0, &config(60), &mut ledger).unwrap();
            serde_json::to_vec(&compiled.plan).unwrap()
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn strict_mode_aborts_on_unreadable_primary() {
        let primary = chips(3);
        let mut probe = readable(&primary, &[]);
        probe.0.remove(&primary[1].image_path);
        let mut ledger = AssetLedger::new(primary, Vec::new(), Box::new(probe));

        let err = compile_plan(&[0.5, 1.0], 1.5, &config(10), &mut ledger).unwrap_err();
        assert!(matches!(err, MontageError::Asset { ref id, .. } if id == "chip1"));
    }

    #[test]
    fn best_effort_extends_previous_segment() {
        let primary = chips(3);
        let mut probe = readable(&primary, &[]);
        probe.0.remove(&primary[1].image_path);
        let mut ledger = AssetLedger::new(primary, Vec::new(), Box::new(probe));
        let config = CompileConfig {
            failure_mode: FailureMode::BestEffort,
            ..config(10)
        };

        let compiled = compile_plan(&[0.5, 1.0], 1.5, &config, &mut ledger).unwrap();
        let plan = &compiled.plan;

        assert_eq!(plan.len(), 2);
        assert_eq!(plan.entries[0].asset.id(), "chip0");
        assert_eq!(plan.entries[0].frame_count, 10);
        assert_eq!(plan.entries[0].intervals, 0..2);
        assert_eq!(plan.entries[1].asset.id(), "chip2");
        assert_eq!(plan.total_frames(), 15);
        assert_eq!(compiled.warnings.len(), 1);
        assert_eq!(compiled.warnings[0].kind, WarningKind::Asset);
        assert_eq!(compiled.warnings[0].index, Some(1));
    }

    #[test]
    fn best_effort_carries_leading_gap_into_first_good_segment() {
        let primary = chips(2);
        let mut probe = readable(&primary, &[]);
        probe.0.remove(&primary[0].image_path);
        let mut ledger = AssetLedger::new(primary, Vec::new(), Box::new(probe));
        let config = CompileConfig {
            failure_mode: FailureMode::BestEffort,
            ..config(10)
        };

        let compiled = compile_plan(&[0.5], 1.0, &config, &mut ledger).unwrap();
        assert_eq!(compiled.plan.len(), 1);
        assert_eq!(compiled.plan.entries[0].asset.id(), "chip1");
        assert_eq!(compiled.plan.entries[0].intervals, 0..2);
        assert_eq!(compiled.plan.entries[0].frame_count, 10);
    }

    #[test]
    fn best_effort_skips_unreadable_secondary_photo() {
        let primary = chips(1);
        let probe = readable(&primary, &[("/p/good.jpg", (100, 100))]);
        let mut ledger = AssetLedger::new(
            primary,
            vec![PathBuf::from("/p/bad.jpg"), PathBuf::from("/p/good.jpg")],
            Box::new(probe),
        );
        let config = CompileConfig {
            failure_mode: FailureMode::BestEffort,
            ..config(10)
        };
        let (onsets, duration) = beats(6);

        let compiled = compile_plan(&onsets, duration, &config, &mut ledger).unwrap();
        let plan = &compiled.plan;

        match &plan.entries[2].kind {
            SegmentKind::Crossfade { into } => assert_eq!(into.id(), "good"),
            other => panic!("expected crossfade, got {other:?}"),
        }
        assert!(plan.entries[3..].iter().all(|e| e.asset.id() == "good"));
        assert_eq!(plan.base_frames, 60);
        assert_eq!(compiled.warnings.len(), 1);
        assert_eq!(compiled.warnings[0].kind, WarningKind::Asset);
        assert_eq!(compiled.warnings[0].index, None);
    }

    #[test]
    fn strict_mode_aborts_on_unreadable_secondary_photo() {
        let primary = chips(1);
        let probe = readable(&primary, &[("/p/good.jpg", (100, 100))]);
        let mut ledger = AssetLedger::new(
            primary,
            vec![PathBuf::from("/p/bad.jpg"), PathBuf::from("/p/good.jpg")],
            Box::new(probe),
        );
        let (onsets, duration) = beats(6);

        let err = compile_plan(&onsets, duration, &config(10), &mut ledger).unwrap_err();
        assert!(matches!(err, MontageError::Asset { ref id, .. } if id == "bad"));
    }

    #[test]
    fn frames_left_without_any_usable_asset_are_an_input_error() {
        let primary = chips(2);
        let mut probe = readable(&primary, &[]);
        probe.0.clear();
        let mut ledger = AssetLedger::new(primary, Vec::new(), Box::new(probe));
        let config = CompileConfig {
            failure_mode: FailureMode::BestEffort,
            ..config(10)
        };

        let err = compile_plan(&[0.5], 1.0, &config, &mut ledger).unwrap_err();
        match err {
            MontageError::Input(message) => {
                assert!(message.contains("10 frames starting at interval 0"), "{message}");
            }
            other => panic!("expected input error, got {other:?}"),
        }
    }

    #[test]
    fn zero_onsets_use_the_fallback_cadence() {
        let primary = chips(10);
        let probe = readable(&primary, &[]);
        let mut ledger = AssetLedger::new(primary, Vec::new(), Box::new(probe));

        let compiled = compile_plan(&[], 12.0, &config(60), &mut ledger).unwrap();
        assert_eq!(compiled.timeline.source, CutSource::FallbackCadence);
        assert_eq!(compiled.plan.len(), 6);
    }

    #[test]
    fn empty_catalog_is_an_input_error() {
        let mut ledger = AssetLedger::new(Vec::new(), Vec::new(), Box::new(TableProbe::default()));
        let err = compile_plan(&[1.0], 2.0, &config(10), &mut ledger).unwrap_err();
        assert!(matches!(err, MontageError::Input(_)));
    }
}
