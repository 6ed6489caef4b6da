//! Image-folder datasets: `<root>/<digit>/<any image file>`.

use super::Sample;
use crate::error::{NetworkError, Result};
use crate::normalize::InputNormalizer;
use crate::topology::INPUT_SIZE;
use image::imageops::{self, FilterType};
use std::path::Path;

/// Width and height digit images are scaled to.
pub const DIGIT_SIDE: usize = 28;
const EXTENSIONS: [&str; 4] = ["png", "bmp", "jpg", "jpeg"];

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Decode the image at `path` into 28×28 gray bytes, one per pixel.
///
/// Any format the `image` crate can read is accepted. Color collapses to
/// luma and other sizes are resampled with a triangle filter.
pub fn read_digit_pixels(path: &Path) -> Result<Vec<u8>> {
    let decoded = image::open(path).map_err(|err| {
        NetworkError::UnsupportedFormat(format!("{}: {}", path.display(), err))
    })?;
    let side = DIGIT_SIDE as u32;
    let mut gray = decoded.to_luma8();
    if gray.dimensions() != (side, side) {
        gray = imageops::resize(&gray, side, side, FilterType::Triangle);
    }
    Ok(gray.into_raw())
}

fn read_digit_image(path: &Path, normalizer: &InputNormalizer) -> Result<Vec<f32>> {
    let pixels = read_digit_pixels(path)?;
    normalizer.normalize(&pixels, 1, DIGIT_SIDE, DIGIT_SIDE)
}

pub(super) fn load(root: &Path) -> Result<Vec<Sample>> {
    let normalizer = InputNormalizer::new(INPUT_SIZE);
    let mut samples = Vec::new();
    let mut digit_dirs = 0usize;

    for label in 0..=9u8 {
        let dir = root.join(label.to_string());
        if !dir.is_dir() {
            continue;
        }
        digit_dirs += 1;

        let mut files: Vec<_> = std::fs::read_dir(&dir)
            .map_err(|err| NetworkError::dataset(&dir, err.to_string()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        files.sort();

        for file in files {
            match read_digit_image(&file, &normalizer) {
                Ok(input) => samples.push(Sample { input, label }),
                Err(err) => log::warn!("skipping {}: {}", file.display(), err),
            }
        }
    }

    if digit_dirs == 0 {
        return Err(NetworkError::dataset(
            root,
            "neither IDX files nor digit folders 0-9 were found",
        ));
    }
    Ok(samples)
}
