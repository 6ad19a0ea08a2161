//! Onset timestamps as produced by an external beat detector.

use std::path::Path;

use crate::Result;

/// Parses detector output with one timestamp in seconds per line.
///
/// Blank lines, `#` comments and lines that do not parse as a number are
/// skipped, which matches how `aubioonset` output is usually consumed.
pub fn parse_onsets(text: &str) -> Vec<f64> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.parse::<f64>().ok())
        .collect()
}

pub fn read_onsets(path: &Path) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path)?;
    let onsets = parse_onsets(&text);
    tracing::debug!(path = %path.display(), count = onsets.len(), "read onset list");
    Ok(onsets)
}

/// Sorts and deduplicates onsets, discarding anything non-finite or outside
/// `[0, target_duration]`.
pub fn normalize_onsets(onsets: &[f64], target_duration: f64) -> Vec<f64> {
    let mut kept: Vec<f64> = onsets
        .iter()
        .copied()
        .filter(|t| t.is_finite() && *t >= 0.0 && *t <= target_duration)
        .collect();
    kept.sort_by(f64::total_cmp);
    kept.dedup();
    kept
}
