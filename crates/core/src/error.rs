use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Result alias that carries the custom [`MontageError`] type.
pub type Result<T> = std::result::Result<T, MontageError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum MontageError {
    /// Bad duration, zero fps, empty catalog and similar. Always fatal and
    /// raised before any rendering starts.
    #[error("invalid input: {0}")]
    Input(String),
    /// An asset image that cannot be read. Recoverable at segment level in
    /// best-effort mode.
    #[error("asset `{id}` at {} is unusable: {reason}", path.display())]
    Asset {
        id: String,
        path: PathBuf,
        reason: String,
    },
    /// A frame arithmetic invariant was broken. Indicates a bug, never bad
    /// input.
    #[error("internal consistency violated: {0}")]
    Consistency(String),
    /// An external render or encode call failed after its retry.
    #[error("render of segment {segment} failed: {message}")]
    Render { segment: usize, message: String },
    /// Concatenation or muxing failed in the external encoder.
    #[error("{tool} failed: {message}")]
    Encoder { tool: String, message: String },
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Image(#[from] image::ImageError),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl MontageError {
    pub fn input<T: Into<String>>(msg: T) -> Self {
        Self::Input(msg.into())
    }

    pub fn consistency<T: Into<String>>(msg: T) -> Self {
        Self::Consistency(msg.into())
    }

    pub fn asset(
        id: impl Into<String>,
        path: impl Into<PathBuf>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Asset {
            id: id.into(),
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn render(segment: usize, message: impl Into<String>) -> Self {
        Self::Render {
            segment,
            message: message.into(),
        }
    }

    pub fn encoder(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Encoder {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Returns `true` for errors that best-effort mode may downgrade to a
    /// warning.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Asset { .. } | Self::Render { .. })
    }
}

/// Which recoverable failure a [`RunWarning`] stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningKind {
    Asset,
    Render,
}

/// A recoverable failure that best-effort mode worked around. Collected per
/// run and always handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWarning {
    pub kind: WarningKind,
    /// Interval index for planning warnings, segment index for render
    /// warnings.
    pub index: Option<usize>,
    pub message: String,
}

impl RunWarning {
    pub fn from_error(err: &MontageError, index: Option<usize>) -> Self {
        let kind = match err {
            MontageError::Render { .. } => WarningKind::Render,
            _ => WarningKind::Asset,
        };
        Self {
            kind,
            index,
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for RunWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.index {
            Some(index) => write!(f, "[{:?} #{index}] {}", self.kind, self.message),
            None => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_keep_kind_and_message() {
        let warning = RunWarning::from_error(&MontageError::render(2, "exit 1"), Some(2));
        assert_eq!(warning.kind, WarningKind::Render);
        assert!(warning.to_string().contains("exit 1"));
    }

    #[test]
    fn only_asset_and_render_errors_are_recoverable() {
        assert!(MontageError::asset("a", "/x.png", "zero bytes").is_recoverable());
        assert!(MontageError::render(3, "ffmpeg exited 1").is_recoverable());
        assert!(!MontageError::input("fps must be positive").is_recoverable());
        assert!(!MontageError::consistency("gap at frame 10").is_recoverable());
    }

    #[test]
    fn asset_error_names_the_file() {
        let err = MontageError::asset("chip-7", "/tmp/chip7.png", "zero bytes");
        let text = err.to_string();
        assert!(text.contains("chip-7"));
        assert!(text.contains("/tmp/chip7.png"));
    }
}
