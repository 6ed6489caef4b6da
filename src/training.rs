//! Training Engine
//!
//! Mini-batch gradient descent with softmax/cross-entropy output and sigmoid
//! hidden layers. Every arithmetic step runs on the accelerator; per step the
//! host only stages batch inputs and one-hot targets and downloads predictions
//! for the loss.
//!
//! Within a run the device mirror is authoritative. A step is all-or-nothing:
//! all layer deltas (`-lr · ∂L/∂W`, `-lr · ∂L/∂b`, averaged over the batch) are
//! computed, the stepped parameters are written to spare buffers, and only
//! after the device synchronizes are the spares swapped in as the mirror.
//!
//! The host [`ParameterStore`] is refreshed from the mirror at the end of every
//! epoch, including a cancelled one. When a step fails the trainer downloads
//! the mirror, which still holds the last committed step. If the device itself
//! is gone, the store keeps the last epoch checkpoint.

use crate::backend::{Accelerator, GemmShape};
use crate::dataset::Sample;
use crate::error::{NetworkError, Result};
use crate::forward::{forward_batch, Activations, DeviceLayer, DeviceParameters, ForwardMode};
use crate::store::ParameterStore;
use crate::topology::Topology;
use crate::utils::{cross_entropy, SimpleRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative stop signal, checked by the trainer between batches.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Resolved hyper-parameters of one training run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingPlan {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Seed for the per-epoch shuffle; `None` keeps dataset order.
    pub shuffle_seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Mean cross-entropy over the samples seen in this epoch.
    pub average_loss: f32,
    pub steps: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingReport {
    /// Completed epochs; a cancelled run also lists its partial epoch.
    pub epochs: Vec<EpochSummary>,
    /// Gradient-descent steps committed to the device mirror.
    pub steps: usize,
    pub cancelled: bool,
}

impl TrainingReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.epochs.last().map(|e| e.average_loss)
    }
}

/// Device buffers for gradients and deltas, plus host staging areas.
struct Workspace<B> {
    acts: Activations<B>,
    targets: B,
    /// Error signal per layer (`rows × neurons`).
    deltas: Vec<B>,
    weight_steps: Vec<B>,
    bias_steps: Vec<B>,
    /// Next parameters of each layer; swapped with the mirror on commit.
    spare: Vec<DeviceLayer<B>>,
    host_inputs: Vec<f32>,
    host_targets: Vec<f32>,
    host_predictions: Vec<f32>,
}

impl<B> Workspace<B> {
    fn allocate<A>(acc: &mut A, topology: &Topology, capacity: usize) -> Result<Self>
    where
        A: Accelerator<Buffer = B>,
    {
        let acts = Activations::allocate(acc, topology, capacity, ForwardMode::Training)?;
        let targets = acc.alloc(capacity * topology.output_size())?;

        let mut deltas = Vec::new();
        let mut weight_steps = Vec::new();
        let mut bias_steps = Vec::new();
        let mut spare = Vec::new();
        for index in 0..topology.parameter_layers() {
            let (outputs, inputs) = topology.layer_shape(index);
            deltas.push(acc.alloc(capacity * outputs)?);
            weight_steps.push(acc.alloc(outputs * inputs)?);
            bias_steps.push(acc.alloc(outputs)?);
            spare.push(DeviceLayer {
                weights: acc.alloc(outputs * inputs)?,
                biases: acc.alloc(outputs)?,
            });
        }

        Ok(Self {
            acts,
            targets,
            deltas,
            weight_steps,
            bias_steps,
            spare,
            host_inputs: vec![0.0f32; capacity * topology.input_size()],
            host_targets: vec![0.0f32; capacity * topology.output_size()],
            host_predictions: vec![0.0f32; capacity * topology.output_size()],
        })
    }
}

/// Borrowed network state a training run mutates.
pub(crate) struct Trainer<'a, A: Accelerator> {
    pub(crate) acc: &'a mut A,
    pub(crate) params: &'a mut DeviceParameters<A::Buffer>,
    pub(crate) store: &'a mut ParameterStore,
}

impl<'a, A: Accelerator> Trainer<'a, A> {
    /// Run `plan.epochs` epochs over `samples`.
    ///
    /// The store is refreshed from the mirror after every epoch. On error it
    /// holds the last committed step if the device can still be read, and the
    /// last epoch checkpoint otherwise.
    pub(crate) fn run(
        &mut self,
        samples: &[Sample],
        plan: &TrainingPlan,
        cancel: &CancellationToken,
    ) -> Result<TrainingReport> {
        if plan.batch_size == 0 || plan.epochs == 0 {
            return Err(NetworkError::InvalidConfig(
                "epochs and batch size must be at least 1".into(),
            ));
        }
        let topology = self.store.topology().clone();
        check_samples(samples, &topology)?;

        let capacity = plan.batch_size.min(samples.len());
        let mut ws = Workspace::allocate(&mut *self.acc, &topology, capacity)?;
        let mut order: Vec<usize> = (0..samples.len()).collect();
        let mut rng = plan.shuffle_seed.map(SimpleRng::new);
        let mut report = TrainingReport::default();
        // Steps already reflected in the host store.
        let mut synced = 0usize;

        log::info!(
            "training {} on {} samples: {} epochs, batch {}, learning rate {}",
            topology,
            samples.len(),
            plan.epochs,
            plan.batch_size,
            plan.learning_rate
        );

        for epoch in 1..=plan.epochs {
            if let Some(rng) = rng.as_mut() {
                rng.shuffle(&mut order);
            }

            let start_time = Instant::now();
            let mut total_loss = 0.0f32;
            let mut seen = 0usize;
            let mut steps = 0usize;

            for batch in order.chunks(plan.batch_size) {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                match self.step(&mut ws, &topology, samples, batch, plan.learning_rate) {
                    Ok(loss) => total_loss += loss,
                    Err(err) => {
                        if report.steps > synced {
                            self.recover(&topology);
                        }
                        return Err(err);
                    }
                }
                seen += batch.len();
                steps += 1;
                report.steps += 1;
            }

            let summary = EpochSummary {
                epoch,
                average_loss: total_loss / seen.max(1) as f32,
                steps,
                duration: start_time.elapsed(),
            };
            log::info!(
                "Epoch {}, Loss: {:.6} Time: {:.6}",
                summary.epoch,
                summary.average_loss,
                summary.duration.as_secs_f32()
            );
            if seen > 0 || !report.cancelled {
                report.epochs.push(summary);
            }
            if report.steps > synced {
                *self.store = self.params.download(&mut *self.acc, &topology)?;
                synced = report.steps;
            }
            if report.cancelled {
                log::info!("training cancelled after {} steps", report.steps);
                break;
            }
        }

        Ok(report)
    }

    /// Bring the store up to the mirror after a failed step.
    fn recover(&mut self, topology: &Topology) {
        match self.params.download(&mut *self.acc, topology) {
            Ok(store) => *self.store = store,
            Err(err) => log::warn!("steps since the last epoch checkpoint are lost: {}", err),
        }
    }

    /// One gradient-descent step over the samples selected by `batch`.
    /// Returns the summed cross-entropy of the batch before the update.
    fn step(
        &mut self,
        ws: &mut Workspace<A::Buffer>,
        topology: &Topology,
        samples: &[Sample],
        batch: &[usize],
        learning_rate: f32,
    ) -> Result<f32> {
        let rows = batch.len();
        let (input_size, output_size) = (topology.input_size(), topology.output_size());

        ws.host_targets[..rows * output_size].fill(0.0);
        for (row, &index) in batch.iter().enumerate() {
            let sample = &samples[index];
            ws.host_inputs[row * input_size..(row + 1) * input_size].copy_from_slice(&sample.input);
            ws.host_targets[row * output_size + sample.label as usize] = 1.0;
        }

        let acc = &mut *self.acc;
        acc.upload(&mut ws.acts.input, &ws.host_inputs[..rows * input_size])?;
        acc.upload(&mut ws.targets, &ws.host_targets[..rows * output_size])?;
        forward_batch(acc, &*self.params, topology, &mut ws.acts, rows)?;

        let last = topology.parameter_layers() - 1;
        acc.sub(
            ws.acts.output(),
            &ws.targets,
            &mut ws.deltas[last],
            rows * output_size,
        )?;

        let scale = -learning_rate / rows as f32;
        for index in (0..=last).rev() {
            let (outputs, inputs) = topology.layer_shape(index);
            let prev = if index == 0 {
                &ws.acts.input
            } else {
                &ws.acts.outputs[index - 1]
            };

            // -lr/n · δᵀ·a_prev, laid out like W (one row per output neuron).
            let shape = GemmShape::new(outputs, inputs, rows)
                .transpose_a()
                .alpha(scale);
            acc.gemm(shape, &ws.deltas[index], prev, &mut ws.weight_steps[index])?;
            acc.column_sums(
                &ws.deltas[index],
                &mut ws.bias_steps[index],
                rows,
                outputs,
                scale,
            )?;

            if index > 0 {
                let (lower, upper) = ws.deltas.split_at_mut(index);
                acc.gemm(
                    GemmShape::new(rows, inputs, outputs),
                    &upper[0],
                    &self.params.layers[index].weights,
                    &mut lower[index - 1],
                )?;
                acc.sigmoid_backward(
                    &mut lower[index - 1],
                    &ws.acts.outputs[index - 1],
                    rows * inputs,
                )?;
            }
        }

        for (index, (layer, next)) in self.params.layers.iter().zip(&mut ws.spare).enumerate() {
            let (outputs, inputs) = topology.layer_shape(index);
            acc.add(
                &layer.weights,
                &ws.weight_steps[index],
                &mut next.weights,
                outputs * inputs,
            )?;
            acc.add(&layer.biases, &ws.bias_steps[index], &mut next.biases, outputs)?;
        }
        acc.synchronize()?;
        acc.download(ws.acts.output(), &mut ws.host_predictions[..rows * output_size])?;

        // Commit point: the stepped parameters become the mirror.
        std::mem::swap(&mut self.params.layers, &mut ws.spare);

        let loss: f32 = batch
            .iter()
            .zip(ws.host_predictions.chunks_exact(output_size))
            .map(|(&index, row)| cross_entropy(row, samples[index].label as usize))
            .sum();

        log::debug!("step over {} samples, loss {:.6}", rows, loss / rows as f32);
        Ok(loss)
    }
}

fn check_samples(samples: &[Sample], topology: &Topology) -> Result<()> {
    for sample in samples {
        if sample.input.len() != topology.input_size() {
            return Err(NetworkError::dimension(
                "sample input",
                topology.input_size(),
                sample.input.len(),
            ));
        }
        if sample.label as usize >= topology.output_size() {
            return Err(NetworkError::dimension(
                "label",
                topology.output_size(),
                sample.label as usize,
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CpuAccelerator, CpuBuffer, CpuPlatform, DeviceInfo, Platform};

    fn sample(input: Vec<f32>, label: u8) -> Sample {
        Sample { input, label }
    }

    // Host-side reference for one step of a 2-2-2 network.
    fn reference_step(store: &ParameterStore, x: &[f32], label: usize, lr: f32) -> ParameterStore {
        use crate::utils::{sigmoid, softmax_into};

        let (w0, b0) = store.get(0).unwrap();
        let (w1, b1) = store.get(1).unwrap();
        let h: Vec<f32> = (0..2)
            .map(|o| sigmoid(w0[o * 2] * x[0] + w0[o * 2 + 1] * x[1] + b0[o]))
            .collect();
        let z: Vec<f32> = (0..2)
            .map(|o| w1[o * 2] * h[0] + w1[o * 2 + 1] * h[1] + b1[o])
            .collect();
        let mut p = vec![0.0; 2];
        softmax_into(&z, &mut p);

        let d1: Vec<f32> = (0..2)
            .map(|o| p[o] - if o == label { 1.0 } else { 0.0 })
            .collect();
        let d0: Vec<f32> = (0..2)
            .map(|i| (d1[0] * w1[i] + d1[1] * w1[2 + i]) * h[i] * (1.0 - h[i]))
            .collect();

        let mut next = store.clone();
        let dw1: Vec<f32> = (0..4).map(|c| -lr * d1[c / 2] * h[c % 2]).collect();
        let db1: Vec<f32> = d1.iter().map(|d| -lr * d).collect();
        let dw0: Vec<f32> = (0..4).map(|c| -lr * d0[c / 2] * x[c % 2]).collect();
        let db0: Vec<f32> = d0.iter().map(|d| -lr * d).collect();
        next.update(1, &dw1, &db1).unwrap();
        next.update(0, &dw0, &db0).unwrap();
        next
    }

    fn assert_close(got: &ParameterStore, want: &ParameterStore) {
        for (got, want) in got.layers().iter().zip(want.layers()) {
            for (g, w) in got.weights().iter().zip(want.weights()) {
                assert!((g - w).abs() < 1e-5, "{} vs {}", g, w);
            }
            for (g, w) in got.biases().iter().zip(want.biases()) {
                assert!((g - w).abs() < 1e-5, "{} vs {}", g, w);
            }
        }
    }

    /// CPU backend whose `fail_at`-th `add` reports a bad output buffer.
    struct FailingAdd {
        inner: CpuAccelerator,
        adds: usize,
        fail_at: usize,
    }

    impl Accelerator for FailingAdd {
        type Buffer = CpuBuffer;

        fn device(&self) -> &DeviceInfo {
            self.inner.device()
        }

        fn alloc(&mut self, len: usize) -> Result<CpuBuffer> {
            self.inner.alloc(len)
        }

        fn upload(&mut self, dst: &mut CpuBuffer, src: &[f32]) -> Result<()> {
            self.inner.upload(dst, src)
        }

        fn download(&mut self, src: &CpuBuffer, dst: &mut [f32]) -> Result<()> {
            self.inner.download(src, dst)
        }

        fn gemm(
            &mut self,
            shape: GemmShape,
            a: &CpuBuffer,
            b: &CpuBuffer,
            c: &mut CpuBuffer,
        ) -> Result<()> {
            self.inner.gemm(shape, a, b, c)
        }

        fn add_row_bias(
            &mut self,
            out: &mut CpuBuffer,
            bias: &CpuBuffer,
            rows: usize,
            cols: usize,
        ) -> Result<()> {
            self.inner.add_row_bias(out, bias, rows, cols)
        }

        fn sigmoid(&mut self, src: &CpuBuffer, dst: &mut CpuBuffer, len: usize) -> Result<()> {
            self.inner.sigmoid(src, dst, len)
        }

        fn softmax_rows(
            &mut self,
            src: &CpuBuffer,
            dst: &mut CpuBuffer,
            rows: usize,
            cols: usize,
        ) -> Result<()> {
            self.inner.softmax_rows(src, dst, rows, cols)
        }

        fn sub(&mut self, a: &CpuBuffer, b: &CpuBuffer, dst: &mut CpuBuffer, len: usize) -> Result<()> {
            self.inner.sub(a, b, dst, len)
        }

        fn sigmoid_backward(
            &mut self,
            delta: &mut CpuBuffer,
            activation: &CpuBuffer,
            len: usize,
        ) -> Result<()> {
            self.inner.sigmoid_backward(delta, activation, len)
        }

        fn column_sums(
            &mut self,
            src: &CpuBuffer,
            dst: &mut CpuBuffer,
            rows: usize,
            cols: usize,
            alpha: f32,
        ) -> Result<()> {
            self.inner.column_sums(src, dst, rows, cols, alpha)
        }

        fn add(&mut self, a: &CpuBuffer, b: &CpuBuffer, dst: &mut CpuBuffer, len: usize) -> Result<()> {
            self.adds += 1;
            if self.adds == self.fail_at {
                return Err(NetworkError::dimension("add output", len, 0));
            }
            self.inner.add(a, b, dst, len)
        }

        fn synchronize(&mut self) -> Result<()> {
            self.inner.synchronize()
        }
    }

    #[test]
    fn test_single_step_matches_host_reference() {
        let platform = CpuPlatform::with_lanes(&[2]);
        let device = platform.devices().remove(0);
        let mut acc = platform.create_accelerator(&device).unwrap();

        let mut store = ParameterStore::create(&[2, 2, 2], &mut SimpleRng::new(5)).unwrap();
        let expected = reference_step(&store, &[0.3, -0.7], 1, 0.5);

        let mut params = DeviceParameters::upload(&mut acc, &store).unwrap();
        let plan = TrainingPlan {
            epochs: 1,
            batch_size: 1,
            learning_rate: 0.5,
            shuffle_seed: None,
        };
        let samples = vec![sample(vec![0.3, -0.7], 1)];
        let report = Trainer {
            acc: &mut acc,
            params: &mut params,
            store: &mut store,
        }
        .run(&samples, &plan, &CancellationToken::new())
        .unwrap();

        assert_eq!(report.steps, 1);
        assert_close(&store, &expected);
    }

    #[test]
    fn test_failed_step_leaves_previous_step_in_store() {
        let platform = CpuPlatform::with_lanes(&[2]);
        let device = platform.devices().remove(0);
        let mut acc = FailingAdd {
            inner: platform.create_accelerator(&device).unwrap(),
            adds: 0,
            // Second of the four parameter updates of step two.
            fail_at: 6,
        };

        let mut store = ParameterStore::create(&[2, 2, 2], &mut SimpleRng::new(8)).unwrap();
        let expected = reference_step(&store, &[0.3, -0.7], 1, 0.5);

        let mut params = DeviceParameters::upload(&mut acc, &store).unwrap();
        let plan = TrainingPlan {
            epochs: 1,
            batch_size: 1,
            learning_rate: 0.5,
            shuffle_seed: None,
        };
        let samples = vec![sample(vec![0.3, -0.7], 1), sample(vec![0.9, 0.1], 0)];
        let err = Trainer {
            acc: &mut acc,
            params: &mut params,
            store: &mut store,
        }
        .run(&samples, &plan, &CancellationToken::new())
        .unwrap_err();

        assert!(matches!(err, NetworkError::DimensionMismatch { .. }));
        assert_close(&store, &expected);
        // The mirror was never half-updated.
        let mirrored = params.download(&mut acc, store.topology()).unwrap();
        assert_eq!(mirrored, store);
    }

    #[test]
    fn test_step_count_includes_partial_batch() {
        let platform = CpuPlatform::with_lanes(&[1]);
        let device = platform.devices().remove(0);
        let mut acc = platform.create_accelerator(&device).unwrap();
        let mut store = ParameterStore::create(&[2, 3, 2], &mut SimpleRng::new(1)).unwrap();
        let mut params = DeviceParameters::upload(&mut acc, &store).unwrap();

        let samples: Vec<Sample> = (0..7)
            .map(|i| sample(vec![i as f32 / 7.0, 1.0], (i % 2) as u8))
            .collect();
        let plan = TrainingPlan {
            epochs: 3,
            batch_size: 3,
            learning_rate: 0.1,
            shuffle_seed: Some(9),
        };
        let report = Trainer {
            acc: &mut acc,
            params: &mut params,
            store: &mut store,
        }
        .run(&samples, &plan, &CancellationToken::new())
        .unwrap();

        assert_eq!(report.steps, 3 * 3);
        assert_eq!(report.epochs.len(), 3);
        assert!(report.epochs.iter().all(|e| e.steps == 3));
        assert!(!report.cancelled);
    }

    #[test]
    fn test_out_of_range_label_is_rejected() {
        let platform = CpuPlatform::with_lanes(&[1]);
        let device = platform.devices().remove(0);
        let mut acc = platform.create_accelerator(&device).unwrap();
        let mut store = ParameterStore::zeroed(&[2, 2]).unwrap();
        let mut params = DeviceParameters::upload(&mut acc, &store).unwrap();
        let plan = TrainingPlan {
            epochs: 1,
            batch_size: 1,
            learning_rate: 0.1,
            shuffle_seed: None,
        };

        let err = Trainer {
            acc: &mut acc,
            params: &mut params,
            store: &mut store,
        }
        .run(&[sample(vec![0.0, 0.0], 5)], &plan, &CancellationToken::new())
        .unwrap_err();
        assert!(matches!(err, NetworkError::DimensionMismatch { .. }));
    }
}
