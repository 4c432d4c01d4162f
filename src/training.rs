use std::{fs, path::Path, time::Instant};

use anyhow::{Context, Result};
use burn::{
    config::Config,
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    module::AutodiffModule,
    optim::{AdamWConfig, GradientsAccumulator, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use log::info;

use crate::{
    checkpoint::CheckpointManager,
    data::{ClassBatcher, ImageDataset},
    metric::{top1_accuracy, AverageMeter},
    model::VggConfig,
    schedule::PlateauConfig,
};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: VggConfig,

    pub optimizer: AdamWConfig,

    pub plateau: PlateauConfig,

    #[config(default = 200)]
    pub epoch_count: usize,

    #[config(default = 64)]
    pub batch_size: usize,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 1.0e-3)]
    pub learning_rate: f64,

    #[config(default = 4)]
    pub worker_count: usize,

    #[config(default = 1)]
    pub accumulation_steps: usize,

    #[config(default = 5)]
    pub checkpoint_interval: usize,
}

/// Run-level averages, reported once training ends.
pub struct TrainSummary {
    pub top1: f64,
    pub loss: f64,
}

/// Tracks how many batches have fed the gradient accumulator since the last
/// optimizer step.
struct Accumulation {
    steps: usize,
    pending: usize,
}

impl Accumulation {
    fn new(steps: usize) -> Self {
        Self { steps, pending: 0 }
    }

    /// Record one accumulated batch; true when the optimizer should step.
    fn ready(&mut self) -> bool {
        self.pending += 1;
        if self.pending == self.steps {
            self.pending = 0;
            true
        } else {
            false
        }
    }

    /// True when leftover gradients still need a step, then resets.
    fn flush(&mut self) -> bool {
        let pending = self.pending > 0;
        self.pending = 0;
        pending
    }
}

pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    train_set: ImageDataset,
    valid_set: Option<ImageDataset>,
    checkpoints: &CheckpointManager,
    initial_weights: Option<&Path>,
    device: B::Device,
) -> Result<TrainSummary> {
    fs::create_dir_all(checkpoints.save_dir()).with_context(|| {
        format!(
            "cannot create save folder {}",
            checkpoints.save_dir().display()
        )
    })?;
    config
        .save(checkpoints.save_dir().join("config.json"))
        .context("cannot write run config")?;

    B::seed(config.seed);

    let image_size = train_set.image_size;
    let iter_size = train_set.len() / config.batch_size.max(1);
    info!("dataset: {} images, iter_size: {}", train_set.len(), iter_size);

    let dataloader_train = DataLoaderBuilder::new(ClassBatcher::<B>::new(device.clone(), image_size))
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.worker_count)
        .build(train_set);

    let dataloader_valid = valid_set.map(|set| {
        DataLoaderBuilder::new(ClassBatcher::<B::InnerBackend>::new(
            device.clone(),
            image_size,
        ))
        .batch_size(config.batch_size)
        .num_workers(config.worker_count)
        .build(set)
    });

    let mut model = config.model.init::<B>(&device);
    match initial_weights {
        Some(path) => {
            model = checkpoints.load(model, path, &device)?;
            info!("loaded model weights from {}", path.display());
        }
        None => info!("initializing weights from scratch"),
    }

    let mut optim = config.optimizer.init();
    let mut schedule = config.plateau.init(config.learning_rate);
    let mut accumulator = GradientsAccumulator::new();
    let mut accumulation = Accumulation::new(config.accumulation_steps);

    // averages over the whole run, like the plateau metric
    let mut losses = AverageMeter::new();
    let mut top1 = AverageMeter::new();

    let run_start = Instant::now();
    let mut iteration = 0usize;

    for epoch in 0..config.epoch_count {
        let epoch_start = Instant::now();
        let lr = schedule.lr();

        for batch in dataloader_train.iter() {
            iteration += 1;
            let batch_size = batch.targets.dims()[0];

            let logits = model.forward(batch.images);
            let loss = model.loss(logits.clone(), batch.targets.clone());

            let loss_value = loss.clone().into_scalar().elem::<f64>();
            let acc = top1_accuracy(logits, batch.targets);

            let scaled = loss / config.accumulation_steps as f64;
            let grads = GradientsParams::from_grads(scaled.backward(), &model);
            accumulator.accumulate(&model, grads);
            if accumulation.ready() {
                model = optim.step(lr, model, accumulator.grads());
            }

            losses.update(loss_value, batch_size);
            top1.update(acc, batch_size);

            info!(
                "- epoch: {epoch}, iteration: {iteration}, lr: {lr:.3e}, \
                 top1 acc: {acc:.2}%, loss: {loss_value:.3}, avg loss: {:.3}",
                losses.avg()
            );
        }

        // a partial accumulation at epoch end must not bleed into the next epoch
        if accumulation.flush() {
            model = optim.step(lr, model, accumulator.grads());
        }

        schedule.step(losses.avg());

        if let Some(loader) = &dataloader_valid {
            let model_valid = model.valid();
            let mut val_losses = AverageMeter::new();
            let mut val_top1 = AverageMeter::new();

            for batch in loader.iter() {
                let batch_size = batch.targets.dims()[0];
                let logits = model_valid.forward(batch.images);
                let loss = model_valid.loss(logits.clone(), batch.targets.clone());

                val_losses.update(loss.into_scalar().elem::<f64>(), batch_size);
                val_top1.update(top1_accuracy(logits, batch.targets), batch_size);
            }

            info!(
                "- epoch: {epoch}, val top1 acc: {:.2}%, val loss: {:.3}",
                val_top1.avg(),
                val_losses.avg()
            );
        }

        let secs = epoch_start.elapsed().as_secs();
        info!(
            "epoch {epoch} finished in {}h{}m{}s",
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        );

        if epoch != 0 && epoch % config.checkpoint_interval == 0 {
            info!("saving state, epoch: {epoch}");
            checkpoints.save(model.clone(), checkpoints.epoch_path(epoch))?;
        }
        checkpoints.save(model.clone(), checkpoints.latest_path())?;
    }

    let secs = run_start.elapsed().as_secs();
    info!(
        "training finished in {}h{}m{}s",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    );

    Ok(TrainSummary {
        top1: top1.avg(),
        loss: losses.avg(),
    })
}
