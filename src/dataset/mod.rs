//! Labelled digit datasets
//!
//! A dataset location is a directory holding either MNIST IDX files or one
//! sub-directory of images per digit (`0` … `9`). Both are read fully into
//! memory as [`Sample`]s.

mod idx;
mod image_folder;

pub use idx::{IDX_IMAGE_FILES, IDX_LABEL_FILES};
pub use image_folder::{read_digit_pixels, DIGIT_SIDE};

use crate::error::{NetworkError, Result};
use std::path::Path;

/// One training example: normalized pixels and the digit they show.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub input: Vec<f32>,
    pub label: u8,
}

impl Sample {
    pub fn new(input: Vec<f32>, label: u8) -> Self {
        Self { input, label }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    samples: Vec<Sample>,
}

impl Dataset {
    pub fn from_samples(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Read every sample under `path`.
    ///
    /// Fails with [`NetworkError::DatasetUnavailable`] when the location is
    /// missing, malformed or holds no samples.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(NetworkError::dataset(path, "not a directory"));
        }

        let samples = match idx::find_files(path) {
            Some((images, labels)) => idx::load(&images, &labels)?,
            None => image_folder::load(path)?,
        };
        if samples.is_empty() {
            return Err(NetworkError::dataset(path, "no samples found"));
        }

        log::info!("loaded {} samples from {}", samples.len(), path.display());
        Ok(Self { samples })
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }
}

impl FromIterator<Sample> for Dataset {
    fn from_iter<I: IntoIterator<Item = Sample>>(iter: I) -> Self {
        Self::from_samples(iter.into_iter().collect())
    }
}
