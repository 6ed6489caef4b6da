use clap::{Parser, Subcommand};
use digit_recognition::backend::{CpuPlatform, DeviceInfo, Platform};
use digit_recognition::dataset::{read_digit_pixels, DIGIT_SIDE};
use digit_recognition::{load_config, Dataset, Network, TrainingConfig, DIGIT_TOPOLOGY};
use std::error::Error;
use std::path::PathBuf;
use std::time::Instant;

const DEFAULT_LEARNING_RATE: f32 = 0.1;

/// Train and run a dense digit classifier.
#[derive(Parser, Debug)]
#[command(name = "digit_recognition", version)]
struct Args {
    /// Device index as listed by `devices`
    #[arg(long, global = true, default_value_t = 0)]
    device: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the compute devices
    Devices,
    /// Train a fresh network or continue from saved parameters
    Train {
        /// JSON training configuration
        #[arg(long)]
        config: Option<PathBuf>,
        /// Dataset directory (IDX files or digit folders)
        #[arg(long)]
        dataset: Option<PathBuf>,
        #[arg(long, default_value_t = 10)]
        epochs: usize,
        #[arg(long, default_value_t = 64)]
        batch_size: usize,
        #[arg(long)]
        learning_rate: Option<f32>,
        /// Parameter file to start from
        #[arg(long)]
        init: Option<PathBuf>,
        /// Where to write the trained parameters
        #[arg(long, default_value = "nn.bin")]
        output: PathBuf,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Report loss and accuracy of saved parameters on a dataset
    Evaluate {
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        dataset: PathBuf,
    },
    /// Classify one image file
    Recognize {
        #[arg(long)]
        model: PathBuf,
        image: PathBuf,
    },
}

fn select_device(platform: &CpuPlatform, index: usize) -> Result<DeviceInfo, Box<dyn Error>> {
    platform
        .devices()
        .into_iter()
        .find(|d| d.id == index)
        .ok_or_else(|| format!("no device with index {}", index).into())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let platform = CpuPlatform::new();

    match args.command {
        Command::Devices => {
            for device in platform.devices() {
                println!("{}: {} ({} lanes)", device.id, device.name, device.lanes);
            }
        }
        Command::Train {
            config,
            dataset,
            epochs,
            batch_size,
            learning_rate,
            init,
            output,
            seed,
        } => {
            let config = match (config, dataset) {
                (Some(path), _) => load_config(path)?,
                (None, Some(dataset)) => {
                    let mut config = TrainingConfig::new(dataset, epochs, batch_size);
                    config.learning_rate = learning_rate;
                    if let Some(seed) = seed {
                        config = config.with_shuffle(seed);
                    }
                    config
                }
                (None, None) => return Err("either --config or --dataset is required".into()),
            };

            let device = select_device(&platform, args.device)?;
            let acc = platform.create_accelerator(&device)?;
            let mut network = match seed {
                Some(seed) => Network::with_seed(acc, &DIGIT_TOPOLOGY, DEFAULT_LEARNING_RATE, seed)?,
                None => Network::new(acc, &DIGIT_TOPOLOGY, DEFAULT_LEARNING_RATE)?,
            };
            if let Some(init) = init {
                network.load(init)?;
            }

            let train_start = Instant::now();
            let report = network.train(&config)?;
            println!(
                "Total training time: {:.2} seconds ({} steps)",
                train_start.elapsed().as_secs_f32(),
                report.steps
            );
            network.save(&output)?;
            println!("Model saved to {}", output.display());
        }
        Command::Evaluate { model, dataset } => {
            let device = select_device(&platform, args.device)?;
            let acc = platform.create_accelerator(&device)?;
            let mut network = Network::new(acc, &DIGIT_TOPOLOGY, DEFAULT_LEARNING_RATE)?;
            network.load(model)?;

            let dataset = Dataset::open(dataset)?;
            let evaluation = network.evaluate(&dataset)?;
            println!("Loss: {:.6}", evaluation.average_loss);
            println!("Test Accuracy: {:.2}%", evaluation.accuracy * 100.0);
        }
        Command::Recognize { model, image } => {
            let device = select_device(&platform, args.device)?;
            let acc = platform.create_accelerator(&device)?;
            let mut network = Network::new(acc, &DIGIT_TOPOLOGY, DEFAULT_LEARNING_RATE)?;
            network.load(model)?;

            let pixels = read_digit_pixels(&image)?;
            let digit = network.recognize(&pixels, 1, DIGIT_SIDE, DIGIT_SIDE)?;
            println!("{}", digit);
        }
    }
    Ok(())
}
