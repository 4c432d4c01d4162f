use burn::prelude::*;

/// Reductions smaller than this are not worth applying.
const MIN_STEP: f64 = 1.0e-8;

#[derive(Config, Debug)]
pub struct PlateauConfig {
    #[config(default = 0.1)]
    pub factor: f64,

    #[config(default = 3)]
    pub patience: usize,

    #[config(default = 1.0e-4)]
    pub threshold: f64,

    #[config(default = 0.0)]
    pub min_lr: f64,
}

impl PlateauConfig {
    pub fn init(&self, lr: f64) -> ReduceOnPlateau {
        ReduceOnPlateau {
            factor: self.factor,
            patience: self.patience,
            threshold: self.threshold,
            min_lr: self.min_lr,
            lr,
            best: f64::INFINITY,
            bad_epochs: 0,
        }
    }
}

/// Learning-rate policy that cuts the rate when a monitored metric stops
/// improving.
///
/// Min mode with a relative improvement threshold: a metric below
/// `best * (1 - threshold)` counts as progress, anything else is a bad epoch,
/// and more than `patience` bad epochs in a row multiply the rate by `factor`,
/// clamped at `min_lr`.
#[derive(Debug, Clone)]
pub struct ReduceOnPlateau {
    factor: f64,
    patience: usize,
    threshold: f64,
    min_lr: f64,
    lr: f64,
    best: f64,
    bad_epochs: usize,
}

impl ReduceOnPlateau {
    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Feed the epoch metric; returns the rate to use from here on.
    pub fn step(&mut self, metric: f64) -> f64 {
        if metric < self.best * (1.0 - self.threshold) {
            self.best = metric;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }

        if self.bad_epochs > self.patience {
            let next = (self.lr * self.factor).max(self.min_lr);
            if self.lr - next > MIN_STEP {
                log::info!("plateau: reducing learning rate {:.3e} -> {:.3e}", self.lr, next);
                self.lr = next;
            }
            self.bad_epochs = 0;
        }

        self.lr
    }
}
