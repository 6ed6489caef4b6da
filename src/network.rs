//! The network facade.
//!
//! A [`Network`] owns the [`ParameterStore`], the accelerator context it is bound
//! to, and the device mirror of the parameters. Every operation takes `&mut self`
//! (or `self`), so at most one operation is in flight per instance.

use crate::backend::{Accelerator, DeviceInfo, Platform};
use crate::codec::{self, PARAMETER_FILE_NAME};
use crate::config::TrainingConfig;
use crate::dataset::Dataset;
use crate::error::{NetworkError, Result};
use crate::forward::{
    self, forward_batch, Activations, DeviceParameters, Evaluation, ForwardMode, ForwardPass,
    LayerActivation,
};
use crate::normalize::InputNormalizer;
use crate::store::ParameterStore;
use crate::topology::Topology;
use crate::training::{CancellationToken, Trainer, TrainingPlan, TrainingReport};
use crate::utils::{argmax, SimpleRng};
use std::path::Path;
use std::thread::JoinHandle;

/// Samples per dispatch when evaluating a dataset.
const EVALUATION_BATCH: usize = 256;

/// A dense digit classifier bound to one accelerator.
///
/// # Example
///
/// ```
/// use digit_recognition::backend::{CpuPlatform, Platform};
/// use digit_recognition::Network;
///
/// let platform = CpuPlatform::new();
/// let device = platform.devices().remove(0);
/// let acc = platform.create_accelerator(&device).unwrap();
///
/// let mut network = Network::with_seed(acc, &[4, 3, 2], 0.1, 7).unwrap();
/// let probabilities = network.predict(&[0.0, 0.5, 1.0, 0.5]).unwrap();
/// assert_eq!(probabilities.len(), 2);
/// ```
pub struct Network<A: Accelerator> {
    // Declared before `accelerator`: buffers drop before their context.
    mirror: Option<DeviceParameters<A::Buffer>>,
    accelerator: Option<A>,
    /// The mirror may disagree with the store (after a failed step or a load).
    mirror_stale: bool,
    store: ParameterStore,
    learning_rate: f32,
}

fn check_learning_rate(learning_rate: f32) -> Result<()> {
    if learning_rate > 0.0 && learning_rate.is_finite() {
        Ok(())
    } else {
        Err(NetworkError::InvalidConfig(format!(
            "learning rate must be positive, got {}",
            learning_rate
        )))
    }
}

/// Ensure the device mirror matches the store and hand out the bound context.
fn bind<'a, A: Accelerator>(
    accelerator: &'a mut Option<A>,
    mirror: &'a mut Option<DeviceParameters<A::Buffer>>,
    stale: &mut bool,
    store: &ParameterStore,
) -> Result<(&'a mut A, &'a mut DeviceParameters<A::Buffer>)> {
    let acc = accelerator.as_mut().ok_or(NetworkError::NoAccelerator)?;
    if *stale || mirror.is_none() {
        *mirror = None;
        *mirror = Some(DeviceParameters::upload(acc, store)?);
        *stale = false;
        log::debug!("uploaded {} parameters to {}", store.parameter_count(), acc.device().name);
    }
    match mirror.as_mut() {
        Some(params) => Ok((acc, params)),
        None => Err(NetworkError::NoAccelerator),
    }
}

impl<A: Accelerator> Network<A> {
    /// Randomly initialized network over `layers`, seeded from the clock.
    pub fn new(accelerator: A, layers: &[usize], learning_rate: f32) -> Result<Self> {
        let store = ParameterStore::create(layers, &mut SimpleRng::from_time())?;
        Self::from_store(accelerator, store, learning_rate)
    }

    /// Deterministic initialization.
    pub fn with_seed(accelerator: A, layers: &[usize], learning_rate: f32, seed: u64) -> Result<Self> {
        let store = ParameterStore::create(layers, &mut SimpleRng::new(seed))?;
        Self::from_store(accelerator, store, learning_rate)
    }

    pub fn from_store(mut accelerator: A, store: ParameterStore, learning_rate: f32) -> Result<Self> {
        check_learning_rate(learning_rate)?;
        let mirror = DeviceParameters::upload(&mut accelerator, &store)?;
        log::info!(
            "network {} bound to {} ({} parameters)",
            store.topology(),
            accelerator.device().name,
            store.parameter_count()
        );
        Ok(Self {
            mirror: Some(mirror),
            accelerator: Some(accelerator),
            mirror_stale: false,
            store,
            learning_rate,
        })
    }

    pub fn topology(&self) -> &Topology {
        self.store.topology()
    }

    /// Host copy of the parameters, refreshed from the device by training.
    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f32) -> Result<()> {
        check_learning_rate(learning_rate)?;
        self.learning_rate = learning_rate;
        Ok(())
    }

    /// Device the network is currently bound to, if any.
    pub fn device(&self) -> Option<&DeviceInfo> {
        self.accelerator.as_ref().map(|acc| acc.device())
    }

    /// Move the network to `device`.
    ///
    /// The old device buffers and context are released before the new context
    /// is created. If creation or upload fails the network is left unbound and
    /// device operations report [`NetworkError::NoAccelerator`] until the next
    /// successful rebind; the parameter store is unaffected.
    pub fn rebind<P>(&mut self, platform: &P, device: &DeviceInfo) -> Result<()>
    where
        P: Platform<Accelerator = A>,
    {
        self.mirror = None;
        self.accelerator = None;

        let mut acc = platform.create_accelerator(device)?;
        let mirror = DeviceParameters::upload(&mut acc, &self.store)?;
        self.mirror = Some(mirror);
        self.accelerator = Some(acc);
        self.mirror_stale = false;
        log::info!("network {} rebound to {}", self.store.topology(), device.name);
        Ok(())
    }

    /// Single-input forward pass. Training mode also returns every layer's `z` and `a`.
    pub fn forward(&mut self, input: &[f32], mode: ForwardMode) -> Result<ForwardPass> {
        let topology = self.store.topology().clone();
        if input.len() != topology.input_size() {
            return Err(NetworkError::dimension(
                "network input",
                topology.input_size(),
                input.len(),
            ));
        }
        let (acc, params) = bind(
            &mut self.accelerator,
            &mut self.mirror,
            &mut self.mirror_stale,
            &self.store,
        )?;

        let mut acts = Activations::allocate(&mut *acc, &topology, 1, mode)?;
        acc.upload(&mut acts.input, input)?;
        forward_batch(&mut *acc, &*params, &topology, &mut acts, 1)?;
        acc.synchronize()?;

        let mut output = vec![0.0f32; topology.output_size()];
        acc.download(acts.output(), &mut output)?;

        let mut layers = Vec::new();
        if mode == ForwardMode::Training {
            for (index, &width) in topology.sizes()[1..].iter().enumerate() {
                let mut z = vec![0.0f32; width];
                let mut a = vec![0.0f32; width];
                acc.download(&acts.zs[index], &mut z)?;
                acc.download(&acts.outputs[index], &mut a)?;
                layers.push(LayerActivation { z, a });
            }
        }
        Ok(ForwardPass { output, layers })
    }

    /// Class probabilities for one normalized input.
    pub fn predict(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        Ok(self.forward(input, ForwardMode::Inference)?.output)
    }

    /// Index of the most probable class.
    pub fn classify(&mut self, input: &[f32]) -> Result<usize> {
        Ok(argmax(&self.predict(input)?))
    }

    /// Normalize a raw image and classify it.
    ///
    /// `pixel_stride` is the number of bytes per pixel (1, 2, 3 or 4); see
    /// [`InputNormalizer::normalize`].
    pub fn recognize(
        &mut self,
        raw: &[u8],
        pixel_stride: usize,
        width: usize,
        height: usize,
    ) -> Result<usize> {
        let input = InputNormalizer::new(self.topology().input_size())
            .normalize(raw, pixel_stride, width, height)?;
        self.classify(&input)
    }

    /// Average cross-entropy and accuracy over `dataset`.
    pub fn evaluate(&mut self, dataset: &Dataset) -> Result<Evaluation> {
        let (acc, params) = bind(
            &mut self.accelerator,
            &mut self.mirror,
            &mut self.mirror_stale,
            &self.store,
        )?;
        forward::evaluate(
            acc,
            params,
            self.store.topology(),
            dataset.samples(),
            EVALUATION_BATCH,
        )
    }

    /// Open `config.dataset` and train on it to completion.
    pub fn train(&mut self, config: &TrainingConfig) -> Result<TrainingReport> {
        self.train_until(config, &CancellationToken::new())
    }

    /// Like [`Network::train`], stopping between batches once `cancel` fires.
    pub fn train_until(
        &mut self,
        config: &TrainingConfig,
        cancel: &CancellationToken,
    ) -> Result<TrainingReport> {
        config.validate()?;
        let dataset = Dataset::open(&config.dataset)?;
        self.train_with_dataset(&dataset, config, cancel)
    }

    /// Train on an already loaded dataset. `config.dataset` is only used in messages.
    ///
    /// The store is refreshed from the device after every epoch and when the
    /// run ends. On failure it holds the last committed step when the device
    /// can still be read, and the last finished epoch when it cannot.
    pub fn train_with_dataset(
        &mut self,
        dataset: &Dataset,
        config: &TrainingConfig,
        cancel: &CancellationToken,
    ) -> Result<TrainingReport> {
        config.validate()?;
        if dataset.is_empty() {
            return Err(NetworkError::dataset(&config.dataset, "no samples found"));
        }

        let plan = TrainingPlan {
            epochs: config.epochs,
            batch_size: config.batch_size,
            learning_rate: config.learning_rate.unwrap_or(self.learning_rate),
            shuffle_seed: config
                .shuffle
                .then(|| config.seed.unwrap_or_else(|| SimpleRng::from_time().next_u32() as u64)),
        };

        let result = bind(
            &mut self.accelerator,
            &mut self.mirror,
            &mut self.mirror_stale,
            &self.store,
        )
        .and_then(|(acc, params)| {
            Trainer {
                acc,
                params,
                store: &mut self.store,
            }
            .run(dataset.samples(), &plan, cancel)
        });

        if let Err(err) = &result {
            self.mirror_stale = true;
            log::error!("training stopped: {}", err);
        }
        result
    }

    /// Write the parameter store to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        codec::save(&self.store, path)
    }

    /// Replace the parameter store with the contents of `path`.
    ///
    /// The file must hold this network's topology. The new parameters are
    /// uploaded before the store is replaced; on any failure the current
    /// parameters and device mirror are kept.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let store = codec::load(path, self.store.topology())?;
        match self.accelerator.as_mut() {
            Some(acc) => {
                self.mirror = Some(DeviceParameters::upload(acc, &store)?);
                self.mirror_stale = false;
            }
            None => self.mirror_stale = true,
        }
        self.store = store;
        Ok(())
    }

    /// Save to `<dir>/nn.bin`, creating `dir` when needed.
    pub fn save_to_dir(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.save(dir.join(PARAMETER_FILE_NAME))
    }

    /// Load from `<dir>/nn.bin`.
    pub fn load_from_dir(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        self.load(dir.as_ref().join(PARAMETER_FILE_NAME))
    }
}

impl<A: Accelerator + 'static> Network<A> {
    /// Move the network onto a worker thread and train there.
    ///
    /// The network comes back from [`TrainingJob::join`] whether or not training
    /// succeeded.
    pub fn train_in_background(
        self,
        config: TrainingConfig,
        cancel: CancellationToken,
    ) -> TrainingJob<A> {
        let token = cancel.clone();
        let handle = std::thread::spawn(move || {
            let mut network = self;
            let result = network.train_until(&config, &token);
            (network, result)
        });
        TrainingJob { handle, cancel }
    }
}

/// Handle to a training run on a worker thread.
pub struct TrainingJob<A: Accelerator> {
    handle: JoinHandle<(Network<A>, Result<TrainingReport>)>,
    cancel: CancellationToken,
}

impl<A: Accelerator> TrainingJob<A> {
    /// Ask the run to stop after the current batch.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the run and take the network back.
    pub fn join(self) -> (Network<A>, Result<TrainingReport>) {
        match self.handle.join() {
            Ok(outcome) => outcome,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CpuAccelerator, CpuPlatform};

    fn network(layers: &[usize]) -> (CpuPlatform, Network<CpuAccelerator>) {
        let platform = CpuPlatform::with_lanes(&[2, 1]);
        let device = platform.devices().remove(0);
        let acc = platform.create_accelerator(&device).unwrap();
        let network = Network::with_seed(acc, layers, 0.1, 3).unwrap();
        (platform, network)
    }

    #[test]
    fn test_rejects_bad_learning_rate() {
        let platform = CpuPlatform::new();
        let device = platform.devices().remove(0);
        let acc = platform.create_accelerator(&device).unwrap();
        let err = Network::with_seed(acc, &[2, 2], 0.0, 1).err().unwrap();
        assert!(matches!(err, NetworkError::InvalidConfig(_)));

        let (_platform, mut network) = network(&[2, 2]);
        assert!(network.set_learning_rate(f32::NAN).is_err());
        network.set_learning_rate(0.25).unwrap();
        assert_eq!(network.learning_rate(), 0.25);
    }

    #[test]
    fn test_training_mode_keeps_layer_activations() {
        let (_platform, mut network) = network(&[3, 4, 2]);
        let pass = network.forward(&[0.1, 0.2, 0.3], ForwardMode::Training).unwrap();
        assert_eq!(pass.layers.len(), 2);
        assert_eq!(pass.layers[0].z.len(), 4);
        assert_eq!(pass.layers[1].a, pass.output);

        let inference = network.forward(&[0.1, 0.2, 0.3], ForwardMode::Inference).unwrap();
        assert!(inference.layers.is_empty());
        assert_eq!(inference.output, pass.output);
    }

    #[test]
    fn test_rebind_moves_to_new_device() {
        let (platform, mut network) = network(&[3, 2]);
        let before = network.predict(&[1.0, 0.0, 1.0]).unwrap();

        let target = platform.devices().remove(1);
        network.rebind(&platform, &target).unwrap();
        assert_eq!(network.device(), Some(&target));
        assert_eq!(network.predict(&[1.0, 0.0, 1.0]).unwrap(), before);
    }

    #[test]
    fn test_failed_rebind_leaves_network_unbound() {
        let (platform, mut network) = network(&[3, 2]);
        let target = platform.devices().remove(1);
        platform.remove_device(&target);

        let err = network.rebind(&platform, &target).unwrap_err();
        assert!(matches!(err, NetworkError::AcceleratorLost { .. }));
        assert!(network.device().is_none());
        assert!(matches!(
            network.predict(&[0.0; 3]),
            Err(NetworkError::NoAccelerator)
        ));
    }

    #[test]
    fn test_empty_dataset_is_unavailable() {
        let (_platform, mut network) = network(&[2, 2]);
        let config = TrainingConfig::new("nowhere", 1, 1);
        let err = network
            .train_with_dataset(&Dataset::default(), &config, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, NetworkError::DatasetUnavailable { .. }));
    }
}
