//! Core library for the beat-synced montage compiler.
//!
//! Onset times are quantized to a frame grid, the grid is filled from an
//! ordered primary catalog and a fallback photo pool, and the resulting
//! segment plan is rendered clip by clip with ffmpeg before being joined
//! and laid under the source audio.

pub mod assets;
pub mod config;
pub mod error;
pub mod onset;
pub mod plan;
pub mod quantize;
pub mod record;
pub mod render;
pub mod timeline;
pub mod transition;

pub use assets::{Asset, AssetLedger, AssetProbe, ImageProbe, PrimaryAsset, SecondaryAsset};
pub use config::{AppConfig, CanvasSize, CompileConfig, FailureMode, RenderSettings};
pub use error::{MontageError, Result, RunWarning, WarningKind};
pub use plan::{SegmentKind, SegmentPlan, SegmentPlanEntry, TimingReport};
pub use quantize::{FrameInterval, QuantizedTimeline, Quantizer};
pub use record::{
    AudioTrack, Concatenator, FfmpegConcatenator, Recorder, RecordingReport, RecordingSettings,
};
pub use render::{ClipHandle, FfmpegRenderer, RenderDispatcher, RenderJob, Renderer};
pub use timeline::{compile_plan, CompiledPlan, TimelineAssembler};
pub use transition::TransitionSpec;
