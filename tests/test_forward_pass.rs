// Tests for forward propagation: output shape, probabilities, retained
// activations and agreement with a plain host computation.

use approx::assert_relative_eq;
use digit_recognition::backend::{CpuAccelerator, CpuPlatform, Platform};
use digit_recognition::utils::{sigmoid, softmax_into};
use digit_recognition::{ForwardMode, Network, NetworkError, ParameterStore, DIGIT_TOPOLOGY};

fn accelerator(lanes: usize) -> CpuAccelerator {
    let platform = CpuPlatform::with_lanes(&[lanes]);
    let device = platform.devices().remove(0);
    platform
        .create_accelerator(&device)
        .expect("Failed to create accelerator")
}

fn pattern(len: usize) -> Vec<f32> {
    (0..len).map(|i| ((i * 37) % 101) as f32 / 100.0).collect()
}

// Host forward pass: sigmoid hidden layers, softmax on the output pre-activation.
fn host_forward(store: &ParameterStore, input: &[f32]) -> Vec<f32> {
    let last = store.layers().len() - 1;
    let mut a = input.to_vec();
    for (index, layer) in store.layers().iter().enumerate() {
        let z: Vec<f32> = (0..layer.output_size())
            .map(|o| {
                let row = &layer.weights()[o * layer.input_size()..(o + 1) * layer.input_size()];
                row.iter().zip(&a).map(|(w, x)| w * x).sum::<f32>() + layer.biases()[o]
            })
            .collect();
        if index == last {
            let mut p = vec![0.0; z.len()];
            softmax_into(&z, &mut p);
            a = p;
        } else {
            a = z.into_iter().map(sigmoid).collect();
        }
    }
    a
}

// ============================================================================
// Determinism
// ============================================================================

#[test]
fn test_forward_is_deterministic() {
    let mut network = Network::with_seed(accelerator(4), &DIGIT_TOPOLOGY, 0.1, 42).unwrap();
    let input = pattern(784);

    let first = network.predict(&input).unwrap();
    let second = network.predict(&input).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_same_seed_same_output_across_lane_counts() {
    let input = pattern(784);
    let mut narrow = Network::with_seed(accelerator(1), &DIGIT_TOPOLOGY, 0.1, 7).unwrap();
    let mut wide = Network::with_seed(accelerator(8), &DIGIT_TOPOLOGY, 0.1, 7).unwrap();

    let a = narrow.predict(&input).unwrap();
    let b = wide.predict(&input).unwrap();
    for (x, y) in a.iter().zip(&b) {
        assert_relative_eq!(x, y, epsilon = 1e-6);
    }
}

// ============================================================================
// Output properties
// ============================================================================

#[test]
fn test_output_is_a_distribution() {
    let mut network = Network::with_seed(accelerator(2), &DIGIT_TOPOLOGY, 0.1, 3).unwrap();
    let output = network.predict(&pattern(784)).unwrap();

    assert_eq!(output.len(), 10);
    assert!(output.iter().all(|&p| (0.0..=1.0).contains(&p)));
    assert_relative_eq!(output.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
}

#[test]
fn test_zero_parameters_give_half_activations_and_uniform_output() {
    let store = ParameterStore::zeroed(&DIGIT_TOPOLOGY).unwrap();
    let mut network = Network::from_store(accelerator(2), store, 0.1).unwrap();

    let pass = network
        .forward(&pattern(784), ForwardMode::Training)
        .unwrap();
    assert_eq!(pass.layers.len(), 4);
    for hidden in &pass.layers[..3] {
        assert!(hidden.z.iter().all(|&z| z == 0.0));
        assert!(hidden.a.iter().all(|&a| a == 0.5));
    }
    for &p in &pass.output {
        assert_relative_eq!(p, 0.1, epsilon = 1e-6);
    }
}

#[test]
fn test_matches_host_computation() {
    let mut network = Network::with_seed(accelerator(3), &[784, 32, 16, 10], 0.1, 11).unwrap();
    let input = pattern(784);

    let expected = host_forward(network.store(), &input);
    let output = network.predict(&input).unwrap();
    for (got, want) in output.iter().zip(&expected) {
        assert_relative_eq!(got, want, epsilon = 1e-5);
    }
}

#[test]
fn test_classify_is_argmax_of_predict() {
    let mut network = Network::with_seed(accelerator(2), &[784, 16, 10], 0.1, 5).unwrap();
    let input = pattern(784);
    let output = network.predict(&input).unwrap();
    let best = output
        .iter()
        .enumerate()
        .fold(0, |best, (i, &p)| if p > output[best] { i } else { best });
    assert_eq!(network.classify(&input).unwrap(), best);
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_wrong_input_length_is_rejected() {
    let mut network = Network::with_seed(accelerator(1), &DIGIT_TOPOLOGY, 0.1, 1).unwrap();
    for len in [0, 783, 785] {
        let err = network.predict(&vec![0.0; len]).unwrap_err();
        assert!(
            matches!(
                err,
                NetworkError::DimensionMismatch {
                    expected: 784,
                    actual,
                    ..
                } if actual == len
            ),
            "unexpected error {:?}",
            err
        );
    }
}
