use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{MontageError, Result};

mod ledger;

pub use ledger::AssetLedger;

/// Extensions picked up when scanning a photo directory.
const PHOTO_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp", "gif", "tif", "tiff"];

/// An entry of the ordered primary catalog (one chip image).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryAsset {
    pub id: String,
    /// External ordering key, for chips the year of introduction.
    pub sort_key: i64,
    pub image_path: PathBuf,
}

/// One vertical slice of a fallback photo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryAsset {
    pub id: String,
    pub image_path: PathBuf,
    pub segment_index: u32,
    pub segment_count: u32,
}

impl SecondaryAsset {
    /// Pixel rectangle `(x, y, width, height)` this slice covers in its
    /// source photo.
    pub fn crop_region(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        slice_region(width, height, self.segment_index, self.segment_count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "pool", rename_all = "lowercase")]
pub enum Asset {
    Primary(PrimaryAsset),
    Secondary(SecondaryAsset),
}

impl Asset {
    pub fn id(&self) -> &str {
        match self {
            Asset::Primary(asset) => &asset.id,
            Asset::Secondary(asset) => &asset.id,
        }
    }

    pub fn image_path(&self) -> &Path {
        match self {
            Asset::Primary(asset) => &asset.image_path,
            Asset::Secondary(asset) => &asset.image_path,
        }
    }

    pub fn sort_key(&self) -> Option<i64> {
        match self {
            Asset::Primary(asset) => Some(asset.sort_key),
            Asset::Secondary(_) => None,
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Asset::Primary(_))
    }
}

impl From<PrimaryAsset> for Asset {
    fn from(value: PrimaryAsset) -> Self {
        Asset::Primary(value)
    }
}

impl From<SecondaryAsset> for Asset {
    fn from(value: SecondaryAsset) -> Self {
        Asset::Secondary(value)
    }
}

/// Number of vertical slices a photo is cut into, from its height:width
/// ratio. Tall screenshots and scans get split so each slice fills a
/// landscape canvas without extreme zoom.
pub fn split_count(width: u32, height: u32) -> u32 {
    if width == 0 {
        return 1;
    }
    let ratio = height as f64 / width as f64;
    if ratio >= 3.5 {
        4
    } else if ratio >= 2.5 {
        3
    } else if ratio >= 1.8 {
        2
    } else {
        1
    }
}

fn slice_region(width: u32, height: u32, index: u32, count: u32) -> (u32, u32, u32, u32) {
    let count = count.max(1) as u64;
    let index = (index as u64).min(count - 1);
    let top = index * height as u64 / count;
    let bottom = (index + 1) * height as u64 / count;
    (0, top as u32, width, (bottom - top) as u32)
}

/// Splits a photo into its sub-assets, in top to bottom order.
pub fn decompose_photo(path: &Path, width: u32, height: u32) -> Vec<SecondaryAsset> {
    let count = split_count(width, height);
    let stem = photo_id(path);
    (0..count)
        .map(|index| SecondaryAsset {
            id: if count == 1 {
                stem.clone()
            } else {
                format!("{stem}#{}of{count}", index + 1)
            },
            image_path: path.to_path_buf(),
            segment_index: index,
            segment_count: count,
        })
        .collect()
}

fn photo_id(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Reads image dimensions, failing for files that cannot be used.
pub trait AssetProbe: Send + Sync {
    fn dimensions(&self, path: &Path) -> Result<(u32, u32)>;
}

/// [`AssetProbe`] backed by the `image` crate's header decoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageProbe;

impl AssetProbe for ImageProbe {
    fn dimensions(&self, path: &Path) -> Result<(u32, u32)> {
        let metadata = std::fs::metadata(path)?;
        if metadata.len() == 0 {
            return Err(MontageError::input(format!(
                "{} is a zero-byte file",
                path.display()
            )));
        }
        let (width, height) = image::image_dimensions(path)?;
        if width == 0 || height == 0 {
            return Err(MontageError::input(format!(
                "{} has an empty image",
                path.display()
            )));
        }
        Ok((width, height))
    }
}

/// Loads the primary catalog from a JSON array of
/// `{ "id", "sort_key", "image_path" }` objects.
///
/// Relative image paths resolve against the catalog's directory. The result
/// is ordered by `sort_key`, ties broken by `id`.
pub fn load_primary_catalog(path: &Path) -> Result<Vec<PrimaryAsset>> {
    let text = std::fs::read_to_string(path)?;
    let mut assets: Vec<PrimaryAsset> = serde_json::from_str(&text)?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    for asset in &mut assets {
        if asset.image_path.is_relative() {
            asset.image_path = base.join(&asset.image_path);
        }
    }
    assets.sort_by(|a, b| a.sort_key.cmp(&b.sort_key).then_with(|| a.id.cmp(&b.id)));
    tracing::info!(path = %path.display(), count = assets.len(), "loaded primary catalog");
    Ok(assets)
}

/// Lists image files in `dir`, sorted by file name.
pub fn discover_photos(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut photos = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| PHOTO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if path.is_file() && is_image {
            photos.push(path);
        }
    }
    photos.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    tracing::info!(dir = %dir.display(), count = photos.len(), "discovered secondary photos");
    Ok(photos)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;

    use super::*;

    /// Probe answering from a fixed table; unknown paths are unreadable.
    #[derive(Debug, Default, Clone)]
    pub(crate) struct TableProbe(pub HashMap<PathBuf, (u32, u32)>);

    impl TableProbe {
        pub(crate) fn with(entries: &[(&str, (u32, u32))]) -> Self {
            Self(
                entries
                    .iter()
                    .map(|(path, dims)| (PathBuf::from(path), *dims))
                    .collect(),
            )
        }
    }

    impl AssetProbe for TableProbe {
        fn dimensions(&self, path: &Path) -> Result<(u32, u32)> {
            self.0
                .get(path)
                .copied()
                .ok_or_else(|| MontageError::input(format!("cannot read {}", path.display())))
        }
    }

    /// Primary asset whose image lives at `/chips/<id>.png`.
    pub(crate) fn primary(id: &str, key: i64) -> PrimaryAsset {
        PrimaryAsset {
            id: id.to_string(),
            sort_key: key,
            image_path: PathBuf::from(format!("/chips/{id}.png")),
        }
    }
}
