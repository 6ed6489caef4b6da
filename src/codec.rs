//! Persistence Codec for the Parameter Store.
//!
//! Layout, all little-endian:
//!
//! ```text
//! i32 layer_count
//! i32 layer_sizes[layer_count]
//! for each layer i in 1..layer_count:
//!     f32 weights[sizes[i] * sizes[i-1]]   (row-major, one row per neuron)
//!     f32 biases[sizes[i]]
//! ```
//!
//! The format carries no version tag or checksum. Any disagreement between the
//! declared sizes and the byte count is reported as [`NetworkError::CorruptFile`].

use crate::error::{NetworkError, Result};
use crate::layers::DenseLayer;
use crate::store::ParameterStore;
use crate::topology::Topology;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// File name used inside a parameter directory.
pub const PARAMETER_FILE_NAME: &str = "nn.bin";

/// Bytes a file for `topology` occupies.
pub fn encoded_len(topology: &Topology) -> usize {
    let header = 4 * (1 + topology.len());
    let params: usize = (0..topology.parameter_layers())
        .map(|i| {
            let (outputs, inputs) = topology.layer_shape(i);
            outputs * inputs + outputs
        })
        .sum();
    header + 4 * params
}

/// Serialize `store` into `writer`.
pub fn write_to<W: Write>(store: &ParameterStore, writer: &mut W) -> Result<()> {
    writer.write_all(&encode(store))?;
    Ok(())
}

pub fn encode(store: &ParameterStore) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(encoded_len(store.topology()));
    let sizes = store.topology().sizes();
    bytes.extend_from_slice(&(sizes.len() as i32).to_le_bytes());
    for &size in sizes {
        bytes.extend_from_slice(&(size as i32).to_le_bytes());
    }
    for layer in store.layers() {
        for &value in layer.weights().iter().chain(layer.biases()) {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    bytes
}

/// Write `store` to `path`, replacing any existing file.
pub fn save(store: &ParameterStore, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut writer = BufWriter::new(File::create(path)?);
    write_to(store, &mut writer)?;
    writer.flush()?;
    log::info!("saved {} parameters to {}", store.parameter_count(), path.display());
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                NetworkError::CorruptFile(format!(
                    "truncated while reading {} at byte {}",
                    what, self.offset
                ))
            })?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn i32(&mut self, what: &str) -> Result<i32> {
        let b = self.take(4, what)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32s(&mut self, count: usize, what: &str) -> Result<Vec<f32>> {
        let len = count
            .checked_mul(4)
            .ok_or_else(|| NetworkError::CorruptFile(format!("{} is too large", what)))?;
        Ok(self
            .take(len, what)?
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }
}

/// Decode parameters, insisting on the layer sizes of `expected`.
pub fn decode(bytes: &[u8], expected: &Topology) -> Result<ParameterStore> {
    let mut reader = Reader { bytes, offset: 0 };

    let count = reader.i32("layer count")?;
    if count < 0 {
        return Err(NetworkError::CorruptFile(format!(
            "negative layer count {}",
            count
        )));
    }
    // Every declared size needs four bytes; reject counts the file cannot hold.
    if count as usize > (bytes.len() - reader.offset) / 4 {
        return Err(NetworkError::CorruptFile(format!(
            "layer count {} exceeds file size",
            count
        )));
    }

    let mut stored = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let size = reader.i32("layer size")?;
        if size <= 0 {
            return Err(NetworkError::CorruptFile(format!(
                "non-positive layer size {}",
                size
            )));
        }
        stored.push(size as usize);
    }
    if stored != expected.sizes() {
        return Err(NetworkError::TopologyMismatch {
            stored,
            expected: expected.sizes().to_vec(),
        });
    }
    if bytes.len() != encoded_len(expected) {
        return Err(NetworkError::CorruptFile(format!(
            "file holds {} bytes, topology {} needs {}",
            bytes.len(),
            expected,
            encoded_len(expected)
        )));
    }

    let mut layers = Vec::with_capacity(expected.parameter_layers());
    for index in 0..expected.parameter_layers() {
        let (outputs, inputs) = expected.layer_shape(index);
        let weights = reader.f32s(outputs * inputs, "weights")?;
        let biases = reader.f32s(outputs, "biases")?;
        layers.push(DenseLayer::from_parts(inputs, outputs, weights, biases)?);
    }
    ParameterStore::from_layers(expected.clone(), layers)
}

/// Read a parameter file written by [`save`].
pub fn load(path: impl AsRef<Path>, expected: &Topology) -> Result<ParameterStore> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let store = decode(&bytes, expected)?;
    log::info!("loaded {} parameters from {}", store.parameter_count(), path.display());
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::SimpleRng;

    fn small_store() -> ParameterStore {
        ParameterStore::create(&[3, 2, 2], &mut SimpleRng::new(11)).unwrap()
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode(&small_store());
        assert_eq!(&bytes[0..4], &3i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &3i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &2i32.to_le_bytes());
        assert_eq!(&bytes[12..16], &2i32.to_le_bytes());
        assert_eq!(bytes.len(), 16 + 4 * (6 + 2 + 4 + 2));
    }

    #[test]
    fn test_writer_receives_the_encoded_bytes() {
        let store = small_store();
        let mut written = Vec::new();
        write_to(&store, &mut written).unwrap();
        assert_eq!(written, encode(&store));
        assert_eq!(written.len(), encoded_len(store.topology()));
    }

    #[test]
    fn test_weights_precede_biases() {
        let mut store = ParameterStore::zeroed(&[1, 1]).unwrap();
        store.update(0, &[2.5], &[-1.0]).unwrap();
        let bytes = encode(&store);
        assert_eq!(&bytes[12..16], &2.5f32.to_le_bytes());
        assert_eq!(&bytes[16..20], &(-1.0f32).to_le_bytes());
    }

    #[test]
    fn test_decode_round_trip() {
        let store = small_store();
        let decoded = decode(&encode(&store), store.topology()).unwrap();
        assert_eq!(decoded, store);
    }

    #[test]
    fn test_trailing_bytes_are_corrupt() {
        let store = small_store();
        let mut bytes = encode(&store);
        bytes.push(0);
        assert!(matches!(
            decode(&bytes, store.topology()),
            Err(NetworkError::CorruptFile(_))
        ));
    }

    #[test]
    fn test_huge_layer_count_is_corrupt() {
        let mut bytes = i32::MAX.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 8]);
        let topology = Topology::new(&[1, 1]).unwrap();
        assert!(matches!(
            decode(&bytes, &topology),
            Err(NetworkError::CorruptFile(_))
        ));
    }

    #[test]
    fn test_empty_input_is_corrupt() {
        let topology = Topology::new(&[1, 1]).unwrap();
        assert!(matches!(
            decode(&[], &topology),
            Err(NetworkError::CorruptFile(_))
        ));
    }
}
