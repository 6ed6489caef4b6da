//! Host-side activation and loss helpers
//!
//! These scalar routines are shared by the CPU kernels and by the host code that
//! turns downloaded predictions into losses and class indices.

/// Logistic sigmoid: 1 / (1 + exp(-x)).
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Sigmoid derivative expressed through its output `a = sigmoid(z)`.
pub fn sigmoid_derivative(a: f32) -> f32 {
    a * (1.0 - a)
}

/// Softmax of `src` written into `dst`, using the max-subtraction trick.
pub fn softmax_into(src: &[f32], dst: &mut [f32]) {
    if src.is_empty() {
        return;
    }
    let max_value = src.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    let mut sum = 0.0f32;
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = (s - max_value).exp();
        sum += *d;
    }

    let inv_sum = 1.0 / sum;
    for d in dst.iter_mut() {
        *d *= inv_sum;
    }
}

/// Index of the largest value; the first one wins on ties.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0usize;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Cross-entropy of one probability row against its true class.
pub fn cross_entropy(probabilities: &[f32], label: usize) -> f32 {
    const EPSILON: f32 = 1e-9;
    -probabilities[label].max(EPSILON).ln()
}
