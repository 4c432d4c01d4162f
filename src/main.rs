use std::{fs, path::PathBuf};

use anyhow::{bail, ensure, Context, Result};
use burn::optim::AdamWConfig;
use clap::{Parser, ValueEnum};
use log::info;

use vgg_classifier::{
    checkpoint::{self, CheckpointManager},
    data::{self, ImageDataset},
    model::{VggConfig, SUPPORTED_DEPTH},
    schedule::PlateauConfig,
    training::{self, TrainingConfig},
};

#[cfg(not(any(feature = "wgpu", feature = "ndarray")))]
compile_error!("enable the wgpu or ndarray feature to select a backend");

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DatasetKind {
    Cifar10,
    Pets,
}

impl DatasetKind {
    fn name(self) -> &'static str {
        match self {
            DatasetKind::Cifar10 => "cifar10",
            DatasetKind::Pets => "pets",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "vgg-classifier", about = "VGG image-classification training")]
struct Args {
    /// Dataset to train on.
    #[arg(long, value_enum, default_value_t = DatasetKind::Pets)]
    dataset: DatasetKind,

    /// Dataset root directory.
    #[arg(long, default_value = "data")]
    dataset_root: PathBuf,

    /// Base model family.
    #[arg(long, default_value = "vgg")]
    basenet: String,

    /// Base network depth.
    #[arg(long, default_value_t = 16)]
    depth: usize,

    #[arg(long, default_value_t = 64)]
    batch_size: usize,

    /// Dataloader worker threads.
    #[arg(long, default_value_t = 4)]
    num_workers: usize,

    /// Initial learning rate.
    #[arg(long, default_value_t = 1.0e-3)]
    lr: f64,

    #[arg(long, default_value_t = 200)]
    epochs: usize,

    /// Expected class count, validated against the dataset.
    #[arg(long)]
    num_classes: Option<usize>,

    /// Side length images are resized to.
    #[arg(long, default_value_t = 64)]
    image_size: usize,

    /// Gradient accumulation steps.
    #[arg(long, default_value_t = 1)]
    accumulation_steps: usize,

    /// Directory for saving checkpoints.
    #[arg(long, default_value = "checkpoints")]
    save_folder: PathBuf,

    /// Checkpoint to resume model weights from, relative to the save folder.
    #[arg(long)]
    resume: Option<String>,

    /// Pretrained weight file to start a fresh run from.
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Fraction of the shuffled dataset held out for validation.
    #[arg(long, default_value_t = 0.0)]
    val_split: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Epoch interval for numbered checkpoint snapshots.
    #[arg(long, default_value_t = 5)]
    checkpoint_interval: usize,

    #[arg(long, default_value_t = 0.1)]
    plateau_factor: f64,

    #[arg(long, default_value_t = 3)]
    plateau_patience: usize,

    #[arg(long, default_value_t = 1.0e-4)]
    plateau_threshold: f64,

    #[arg(long, default_value_t = 0.0)]
    min_lr: f64,

    /// Classifier dropout probability.
    #[arg(long, default_value_t = 0.5)]
    dropout: f64,
}

fn validate(args: &Args) -> Result<()> {
    if args.basenet != "vgg" {
        bail!(
            "unsupported model type {:?}, only vgg is supported",
            args.basenet
        );
    }
    if args.depth != SUPPORTED_DEPTH {
        bail!(
            "unsupported model depth {}, only {} is supported",
            args.depth,
            SUPPORTED_DEPTH
        );
    }

    ensure!(args.batch_size > 0, "batch size must be positive");
    ensure!(args.epochs > 0, "epoch count must be positive");
    ensure!(args.num_workers > 0, "worker count must be positive");
    ensure!(
        args.accumulation_steps > 0,
        "accumulation steps must be positive"
    );
    ensure!(args.checkpoint_interval > 0, "checkpoint interval must be positive");
    ensure!(
        args.image_size >= 32,
        "image size must be at least 32 to survive five pooling stages"
    );
    ensure!(
        (0.0..1.0).contains(&args.val_split),
        "val split must be in [0, 1)"
    );
    ensure!(
        args.dataset_root.is_dir(),
        "dataset root {} does not exist",
        args.dataset_root.display()
    );

    Ok(())
}

fn check_class_count(dataset: DatasetKind, found: usize, expected: Option<usize>) -> Result<()> {
    if let Some(expected) = expected {
        if expected != found {
            bail!(
                "dataset {} has {found} classes, but --num-classes is {expected}",
                dataset.name()
            );
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    validate(&args)?;
    info!("args: {args:?}");

    let (classes, items) = match args.dataset {
        DatasetKind::Cifar10 => (
            data::CIFAR_CLASSES.iter().map(|s| s.to_string()).collect(),
            data::load_cifar10(&args.dataset_root, args.image_size)?,
        ),
        DatasetKind::Pets => data::load_image_folder(&args.dataset_root, args.image_size)?,
    };
    check_class_count(args.dataset, classes.len(), args.num_classes)?;
    ensure!(
        !items.is_empty(),
        "dataset root {} contains no readable images",
        args.dataset_root.display()
    );
    info!(
        "loaded {} images across {} classes",
        items.len(),
        classes.len()
    );

    let (train_items, valid_items) = data::shuffle_split(items, args.val_split, args.seed);
    let train_set = ImageDataset::new(train_items, args.image_size);
    let valid_set = (!valid_items.is_empty())
        .then(|| ImageDataset::new(valid_items, args.image_size));

    fs::create_dir_all(&args.save_folder).with_context(|| {
        format!("cannot create save folder {}", args.save_folder.display())
    })?;
    let checkpoints = CheckpointManager::new(
        &args.save_folder,
        args.dataset.name(),
        &args.basenet,
        args.depth,
    );

    let initial_weights = match (&args.resume, &args.weights) {
        (Some(resume), _) => Some(checkpoints.resolve_resume(resume)?),
        (None, Some(weights)) => {
            checkpoint::validate_extension(weights)?;
            Some(weights.clone())
        }
        (None, None) => None,
    };

    let config = TrainingConfig::new(
        VggConfig::new(classes.len()).with_dropout(args.dropout),
        AdamWConfig::new(),
        PlateauConfig::new()
            .with_factor(args.plateau_factor)
            .with_patience(args.plateau_patience)
            .with_threshold(args.plateau_threshold)
            .with_min_lr(args.min_lr),
    )
    .with_epoch_count(args.epochs)
    .with_batch_size(args.batch_size)
    .with_seed(args.seed)
    .with_learning_rate(args.lr)
    .with_worker_count(args.num_workers)
    .with_accumulation_steps(args.accumulation_steps)
    .with_checkpoint_interval(args.checkpoint_interval);

    #[cfg(feature = "wgpu")]
    let summary = {
        use burn::backend::{wgpu::WgpuDevice, Autodiff, Wgpu};

        training::train::<Autodiff<Wgpu<f32, i32>>>(
            &config,
            train_set,
            valid_set,
            &checkpoints,
            initial_weights.as_deref(),
            WgpuDevice::default(),
        )?
    };

    #[cfg(all(feature = "ndarray", not(feature = "wgpu")))]
    let summary = {
        use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};

        training::train::<Autodiff<NdArray<f32>>>(
            &config,
            train_set,
            valid_set,
            &checkpoints,
            initial_weights.as_deref(),
            NdArrayDevice::default(),
        )?
    };

    info!(
        "top1 acc: {:.2}%, loss: {:.3}",
        summary.top1, summary.loss
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_with_root(root: &str, extra: &[&str]) -> Args {
        let mut argv = vec!["vgg-classifier", "--dataset-root", root];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    fn args(extra: &[&str]) -> Args {
        let root = std::env::temp_dir().display().to_string();
        args_with_root(&root, extra)
    }

    #[test]
    fn default_arguments_validate() {
        assert!(validate(&args(&[])).is_ok());
    }

    #[test]
    fn unsupported_basenet_is_fatal() {
        let err = validate(&args(&["--basenet", "resnet"])).unwrap_err();
        assert!(err.to_string().contains("unsupported model type"));
    }

    #[test]
    fn unsupported_depth_is_fatal() {
        let err = validate(&args(&["--depth", "19"])).unwrap_err();
        assert!(err.to_string().contains("unsupported model depth"));
    }

    #[test]
    fn zero_batch_size_is_fatal() {
        let err = validate(&args(&["--batch-size", "0"])).unwrap_err();
        assert!(err.to_string().contains("batch size"));
    }

    #[test]
    fn zero_epochs_is_fatal() {
        let err = validate(&args(&["--epochs", "0"])).unwrap_err();
        assert!(err.to_string().contains("epoch count"));
    }

    #[test]
    fn zero_accumulation_steps_is_fatal() {
        let err = validate(&args(&["--accumulation-steps", "0"])).unwrap_err();
        assert!(err.to_string().contains("accumulation steps"));
    }

    #[test]
    fn out_of_range_val_split_is_fatal() {
        let err = validate(&args(&["--val-split", "1.0"])).unwrap_err();
        assert!(err.to_string().contains("val split"));
    }

    #[test]
    fn undersized_images_are_fatal() {
        let err = validate(&args(&["--image-size", "16"])).unwrap_err();
        assert!(err.to_string().contains("image size"));
    }

    #[test]
    fn missing_dataset_root_is_fatal() {
        let err = validate(&args_with_root("/no/such/dataset-root", &[])).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn class_count_mismatch_is_fatal() {
        let err = check_class_count(DatasetKind::Cifar10, 10, Some(2)).unwrap_err();
        assert!(err.to_string().contains("--num-classes"));
    }

    #[test]
    fn matching_or_absent_class_count_passes() {
        assert!(check_class_count(DatasetKind::Cifar10, 10, Some(10)).is_ok());
        assert!(check_class_count(DatasetKind::Pets, 2, None).is_ok());
    }
}
