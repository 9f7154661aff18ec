// THEORY:
// Reference images are laid out as `<root>/<pet type>/<image>`. Picking one is a
// two-step random draw: first a pet-type folder, then an image inside it. Only a
// fixed set of extensions counts as an image. Either draw coming up empty is an
// `AssetNotFound`, which the orchestrator treats as a skipped cycle.

use crate::capabilities::AssetPicker;
use crate::error::{DiningError, DiningResult};
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};

pub const SUPPORTED_IMAGE_FORMATS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Picks uniformly at random among pet folders, then among their images.
#[derive(Debug, Clone, Default)]
pub struct RandomAssetPicker;

impl RandomAssetPicker {
    pub fn new() -> Self {
        Self
    }
}

impl AssetPicker for RandomAssetPicker {
    fn pick(&self, root: &Path) -> DiningResult<PathBuf> {
        let mut rng = rand::thread_rng();

        let folders = subfolders(root)?;
        let folder = folders
            .choose(&mut rng)
            .ok_or_else(|| DiningError::AssetNotFound(format!("No animal folders found in {}", root.display())))?;

        let images = images_in(folder)?;
        let image = images.choose(&mut rng).ok_or_else(|| {
            let name = folder.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            DiningError::AssetNotFound(format!("No images in folder: {}", name))
        })?;

        Ok(image.clone())
    }
}

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            SUPPORTED_IMAGE_FORMATS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn subfolders(root: &Path) -> DiningResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(root)
        .map_err(|e| DiningError::AssetNotFound(format!("{}: {}", root.display(), e)))?;

    let mut folders: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    folders.sort();
    Ok(folders)
}

fn images_in(folder: &Path) -> DiningResult<Vec<PathBuf>> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(folder)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_supported_image(path))
        .collect();
    images.sort();
    Ok(images)
}
