use burn::prelude::*;

/// Running average weighted by sample count, kept for the duration of a run.
#[derive(Debug, Default, Clone, Copy)]
pub struct AverageMeter {
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64, n: usize) {
        self.sum += value * n as f64;
        self.count += n;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Top-1 accuracy in percent over a batch of logits.
pub fn top1_accuracy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> f64 {
    let batch_size = targets.dims()[0];
    if batch_size == 0 {
        return 0.0;
    }

    // argmax(1) returns [batch, 1], flatten to [batch] before comparing
    let predicted = logits.argmax(1).flatten::<1>(0, 1);
    let correct = predicted
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>();

    correct as f64 * 100.0 / batch_size as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn meter_weights_by_sample_count() {
        let mut meter = AverageMeter::new();
        meter.update(2.0, 1);
        meter.update(5.0, 3);
        assert!((meter.avg() - 4.25).abs() < 1e-9);
    }

    #[test]
    fn empty_meter_reads_zero() {
        assert_eq!(AverageMeter::new().avg(), 0.0);
    }

    #[test]
    fn top1_counts_matching_argmax() {
        let device = Default::default();
        let logits = Tensor::<B, 2>::from_floats(
            [[0.1, 2.0, 0.3], [3.0, 0.5, 0.2], [0.2, 0.9, 0.1]],
            &device,
        );
        let targets = Tensor::<B, 1, Int>::from_ints([1, 0, 0], &device);

        let acc = top1_accuracy(logits, targets);
        assert!((acc - 200.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn top1_is_full_marks_on_perfect_batch() {
        let device = Default::default();
        let logits = Tensor::<B, 2>::from_floats([[5.0, 0.0], [0.0, 5.0]], &device);
        let targets = Tensor::<B, 1, Int>::from_ints([0, 1], &device);

        assert_eq!(top1_accuracy(logits, targets), 100.0);
    }
}
