use std::{collections::VecDeque, fmt, path::PathBuf};

use super::{decompose_photo, photo_id, Asset, AssetProbe, PrimaryAsset, SecondaryAsset};
use crate::{MontageError, Result};

/// Ordered asset pools for one compilation run plus the cursor into them.
///
/// Primary assets are issued exactly once in catalog order. Secondary
/// photos are split lazily when the cursor reaches them, and once the pool
/// runs dry the last issued slice keeps being returned.
pub struct AssetLedger {
    primary: Vec<PrimaryAsset>,
    primary_cursor: usize,
    photos: Vec<PathBuf>,
    photo_cursor: usize,
    pending: VecDeque<SecondaryAsset>,
    last_secondary: Option<SecondaryAsset>,
    frozen: bool,
    probe: Box<dyn AssetProbe>,
}

impl AssetLedger {
    pub fn new(
        primary: Vec<PrimaryAsset>,
        photos: Vec<PathBuf>,
        probe: Box<dyn AssetProbe>,
    ) -> Self {
        Self {
            primary,
            primary_cursor: 0,
            photos,
            photo_cursor: 0,
            pending: VecDeque::new(),
            last_secondary: None,
            frozen: false,
            probe,
        }
    }

    pub fn primary_len(&self) -> usize {
        self.primary.len()
    }

    pub fn remaining_primary(&self) -> usize {
        self.primary.len() - self.primary_cursor
    }

    pub fn has_secondary_pool(&self) -> bool {
        !self.photos.is_empty()
    }

    /// Issues the next primary asset, or `None` once the pool is exhausted.
    pub fn next_primary(&mut self) -> Option<&PrimaryAsset> {
        let index = self.primary_cursor;
        if index >= self.primary.len() {
            return None;
        }
        self.primary_cursor += 1;
        self.primary.get(index)
    }

    /// The most recently issued primary asset.
    pub fn last_primary(&self) -> Option<&PrimaryAsset> {
        self.primary_cursor
            .checked_sub(1)
            .and_then(|index| self.primary.get(index))
    }

    /// Issues the next secondary slice.
    ///
    /// A photo that cannot be probed yields an [`MontageError::Asset`]; the
    /// cursor has already moved past it, so calling again continues with the
    /// following photo. After the pool is exhausted the last issued slice is
    /// returned again on every call. `Ok(None)` means no slice was ever
    /// issued.
    pub fn next_secondary(&mut self) -> Result<Option<&SecondaryAsset>> {
        if self.pending.is_empty() {
            self.fill_pending()?;
        }

        match self.pending.pop_front() {
            Some(next) => {
                self.last_secondary = Some(next);
            }
            None if !self.frozen => {
                self.frozen = true;
                if let Some(last) = &self.last_secondary {
                    tracing::info!(
                        asset = %last.id,
                        "secondary pool exhausted, freezing on last slice"
                    );
                }
            }
            None => {}
        }
        Ok(self.last_secondary.as_ref())
    }

    /// Checks that an asset's image can be read.
    pub fn verify(&self, asset: &Asset) -> Result<()> {
        self.probe
            .dimensions(asset.image_path())
            .map(|_| ())
            .map_err(|err| MontageError::asset(asset.id(), asset.image_path(), err.to_string()))
    }

    fn fill_pending(&mut self) -> Result<()> {
        while self.pending.is_empty() {
            let Some(path) = self.photos.get(self.photo_cursor).cloned() else {
                return Ok(());
            };
            self.photo_cursor += 1;

            let (width, height) = self
                .probe
                .dimensions(&path)
                .map_err(|err| MontageError::asset(photo_id(&path), &path, err.to_string()))?;
            let parts = decompose_photo(&path, width, height);
            tracing::debug!(photo = %path.display(), parts = parts.len(), "split secondary photo");
            self.pending.extend(parts);
        }
        Ok(())
    }
}

impl fmt::Debug for AssetLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetLedger")
            .field("primary", &self.primary.len())
            .field("primary_cursor", &self.primary_cursor)
            .field("photos", &self.photos.len())
            .field("photo_cursor", &self.photo_cursor)
            .field("pending", &self.pending.len())
            .field("frozen", &self.frozen)
            .finish()
    }
}
