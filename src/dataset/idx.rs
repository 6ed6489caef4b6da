//! MNIST IDX reader.
//!
//! Images: magic 0x00000803, count, rows, cols (big-endian u32), then one byte
//! per pixel. Labels: magic 0x00000801, count, then one byte per label.

use super::Sample;
use crate::error::{NetworkError, Result};
use crate::normalize::InputNormalizer;
use std::path::{Path, PathBuf};

const IMAGE_MAGIC: u32 = 0x0000_0803;
const LABEL_MAGIC: u32 = 0x0000_0801;

/// Accepted names of the training image file.
pub const IDX_IMAGE_FILES: [&str; 2] = ["train-images.idx3-ubyte", "train-images-idx3-ubyte"];
/// Accepted names of the training label file.
pub const IDX_LABEL_FILES: [&str; 2] = ["train-labels.idx1-ubyte", "train-labels-idx1-ubyte"];

fn first_existing(dir: &Path, names: &[&str]) -> Option<PathBuf> {
    names.iter().map(|n| dir.join(n)).find(|p| p.is_file())
}

pub(super) fn find_files(dir: &Path) -> Option<(PathBuf, PathBuf)> {
    Some((
        first_existing(dir, &IDX_IMAGE_FILES)?,
        first_existing(dir, &IDX_LABEL_FILES)?,
    ))
}

fn read_be_u32(data: &[u8], offset: &mut usize) -> Option<u32> {
    let bytes = data.get(*offset..*offset + 4)?;
    *offset += 4;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_header(path: &Path, data: &[u8], magic: u32, fields: usize) -> Result<(Vec<usize>, usize)> {
    let mut offset = 0usize;
    let found = read_be_u32(data, &mut offset)
        .ok_or_else(|| NetworkError::dataset(path, "truncated header"))?;
    if found != magic {
        return Err(NetworkError::dataset(
            path,
            format!("bad magic number {:#010x}", found),
        ));
    }
    let mut values = Vec::with_capacity(fields);
    for _ in 0..fields {
        let value = read_be_u32(data, &mut offset)
            .ok_or_else(|| NetworkError::dataset(path, "truncated header"))?;
        values.push(value as usize);
    }
    Ok((values, offset))
}

pub(super) fn load(images_path: &Path, labels_path: &Path) -> Result<Vec<Sample>> {
    let images = std::fs::read(images_path)
        .map_err(|err| NetworkError::dataset(images_path, err.to_string()))?;
    let labels = std::fs::read(labels_path)
        .map_err(|err| NetworkError::dataset(labels_path, err.to_string()))?;

    let (header, image_offset) = read_header(images_path, &images, IMAGE_MAGIC, 3)?;
    let (image_count, rows, cols) = (header[0], header[1], header[2]);
    let (header, label_offset) = read_header(labels_path, &labels, LABEL_MAGIC, 1)?;
    let label_count = header[0];

    let count = image_count.min(label_count);
    let (image_size, images_end) = rows
        .checked_mul(cols)
        .and_then(|size| Some((size, size.checked_mul(count)?.checked_add(image_offset)?)))
        .ok_or_else(|| NetworkError::dataset(images_path, "header sizes overflow"))?;
    let labels_end = label_offset
        .checked_add(count)
        .ok_or_else(|| NetworkError::dataset(labels_path, "header sizes overflow"))?;
    if images.len() < images_end {
        return Err(NetworkError::dataset(images_path, "image file is truncated"));
    }
    if labels.len() < labels_end {
        return Err(NetworkError::dataset(labels_path, "label file is truncated"));
    }

    let normalizer = InputNormalizer::new(image_size);
    let pixels = &images[image_offset..images_end];
    let labels = &labels[label_offset..labels_end];

    let mut samples = Vec::with_capacity(count);
    for (image, &label) in pixels.chunks_exact(image_size.max(1)).zip(labels) {
        if label > 9 {
            return Err(NetworkError::dataset(
                labels_path,
                format!("label {} is not a digit", label),
            ));
        }
        let input = normalizer
            .normalize(image, 1, cols, rows)
            .map_err(|err| NetworkError::dataset(images_path, err.to_string()))?;
        samples.push(Sample { input, label });
    }
    Ok(samples)
}
