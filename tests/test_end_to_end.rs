// End-to-end: train on ten canonical digit bitmaps written as an IDX dataset,
// then recognize each bitmap from a raw BGRA buffer.

use digit_recognition::backend::{CpuPlatform, Platform};
use digit_recognition::{Network, TrainingConfig};
use std::fs;
use std::path::Path;

// 5×7 glyphs, one string per row.
const GLYPHS: [[&str; 7]; 10] = [
    ["01110", "10001", "10011", "10101", "11001", "10001", "01110"],
    ["00100", "01100", "00100", "00100", "00100", "00100", "01110"],
    ["01110", "10001", "00001", "00010", "00100", "01000", "11111"],
    ["11111", "00010", "00100", "00010", "00001", "10001", "01110"],
    ["00010", "00110", "01010", "10010", "11111", "00010", "00010"],
    ["11111", "10000", "11110", "00001", "00001", "10001", "01110"],
    ["00110", "01000", "10000", "11110", "10001", "10001", "01110"],
    ["11111", "00001", "00010", "00100", "01000", "01000", "01000"],
    ["01110", "10001", "10001", "01110", "10001", "10001", "01110"],
    ["01110", "10001", "10001", "01111", "00001", "00010", "01100"],
];

const SCALE: usize = 4;
const OFFSET_X: usize = 4;

// 28×28 gray bitmap: the glyph scaled 4× (20×28) and centered horizontally.
fn bitmap(digit: usize) -> Vec<u8> {
    let mut pixels = vec![0u8; 28 * 28];
    for (y, row) in GLYPHS[digit].iter().enumerate() {
        for (x, cell) in row.bytes().enumerate() {
            if cell != b'1' {
                continue;
            }
            for dy in 0..SCALE {
                for dx in 0..SCALE {
                    pixels[(y * SCALE + dy) * 28 + OFFSET_X + x * SCALE + dx] = 255;
                }
            }
        }
    }
    pixels
}

fn to_bgra(gray: &[u8]) -> Vec<u8> {
    gray.iter().flat_map(|&v| [v, v, v, 255]).collect()
}

fn write_idx(dir: &Path) {
    let mut images = Vec::new();
    for v in [0x803u32, 10, 28, 28] {
        images.extend_from_slice(&v.to_be_bytes());
    }
    let mut labels = Vec::new();
    for v in [0x801u32, 10] {
        labels.extend_from_slice(&v.to_be_bytes());
    }
    for digit in 0..10 {
        images.extend(bitmap(digit));
        labels.push(digit as u8);
    }
    fs::write(dir.join("train-images.idx3-ubyte"), images).unwrap();
    fs::write(dir.join("train-labels.idx1-ubyte"), labels).unwrap();
}

#[test]
fn test_learns_and_recognizes_every_digit() {
    let data = tempfile::tempdir().unwrap();
    write_idx(data.path());

    let platform = CpuPlatform::new();
    let device = platform.devices().remove(0);
    let acc = platform.create_accelerator(&device).unwrap();
    let mut network = Network::with_seed(acc, &[784, 64, 10], 0.5, 2024).unwrap();

    let config = TrainingConfig::new(data.path(), 100, 1).with_shuffle(11);
    let report = network.train(&config).unwrap();
    assert_eq!(report.steps, 1000);

    for digit in 0..10 {
        let raw = to_bgra(&bitmap(digit));
        assert_eq!(network.recognize(&raw, 4, 28, 28).unwrap(), digit);
    }

    // The saved parameters recognize the same digits on a fresh network.
    let models = tempfile::tempdir().unwrap();
    network.save_to_dir(models.path()).unwrap();

    let acc = platform.create_accelerator(&device).unwrap();
    let mut restored = Network::with_seed(acc, &[784, 64, 10], 0.5, 1).unwrap();
    restored.load_from_dir(models.path()).unwrap();
    for digit in 0..10 {
        assert_eq!(restored.recognize(&bitmap(digit), 1, 28, 28).unwrap(), digit);
    }
}
