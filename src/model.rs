use burn::{prelude::*, tensor::activation::relu};
use nn::{
    loss::CrossEntropyLossConfig,
    pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
    Dropout, DropoutConfig, Initializer, Linear, LinearConfig,
};

use crate::{
    data::CHANNEL_COUNT,
    module::conv_block::{ConvBlock, ConvBlockConfig},
};

/// The only base network depth with a layer table below.
pub const SUPPORTED_DEPTH: usize = 16;

const STAGES: [[usize; 2]; 5] = [
    // (c = channels; n = conv blocks per stage, maxpool after each stage)
    // c, n
    [64, 2],
    [128, 2],
    [256, 3],
    [512, 3],
    [512, 3],
];

const POOLED_SIDE: usize = 7;
const HIDDEN_WIDTH: usize = 4096;

#[derive(Module, Debug)]
struct Classifier<B: Backend> {
    hidden0: Linear<B>,
    hidden1: Linear<B>,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> Classifier<B> {
    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = relu(self.hidden0.forward(x));
        let x = self.dropout.forward(x);
        let x = relu(self.hidden1.forward(x));
        let x = self.dropout.forward(x);

        self.output.forward(x)
    }
}

#[derive(Module, Debug)]
enum VggLayer<B: Backend> {
    Conv(ConvBlock<B>),
    Pool(MaxPool2d),
}

impl<B: Backend> VggLayer<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            VggLayer::Conv(block) => block.forward(x),
            VggLayer::Pool(pool) => pool.forward(x),
        }
    }
}

#[derive(Module, Debug)]
pub struct Vgg<B: Backend> {
    features: Vec<VggLayer<B>>,

    avg_pool: AdaptiveAvgPool2d,
    classifier: Classifier<B>,
}

impl<B: Backend> Vgg<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.features.iter().fold(x, |x, layer| layer.forward(x));

        let x = self.avg_pool.forward(x);
        let x = x.flatten(1, 3);
        self.classifier.forward(x)
    }

    /// Cross-entropy over the logits of a labeled batch.
    pub fn loss(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits, targets)
    }
}

/// Kaiming-normal weights with biases held at zero.
fn linear<B: Backend>(d_input: usize, d_output: usize, device: &B::Device) -> Linear<B> {
    let mut linear = LinearConfig::new(d_input, d_output)
        .with_initializer(Initializer::KaimingNormal {
            gain: 2f64.sqrt(),
            fan_out_only: false,
        })
        .init(device);
    linear.bias = linear.bias.map(|bias| bias.map(|tensor| tensor.zeros_like()));

    linear
}

#[derive(Config, Debug)]
pub struct VggConfig {
    pub classes: usize,

    #[config(default = 0.5)]
    pub dropout: f64,
}

impl VggConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Vgg<B> {
        let mut input_channel = CHANNEL_COUNT;
        let mut features = vec![];

        for [c, n] in STAGES {
            for _ in 0..n {
                features.push(VggLayer::Conv(
                    ConvBlockConfig::new([input_channel, c]).init(device),
                ));
                input_channel = c;
            }

            features.push(VggLayer::Pool(
                MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            ));
        }

        let avg_pool = AdaptiveAvgPool2dConfig::new([POOLED_SIDE, POOLED_SIDE]).init();

        let classifier = Classifier {
            hidden0: linear(input_channel * POOLED_SIDE * POOLED_SIDE, HIDDEN_WIDTH, device),
            hidden1: linear(HIDDEN_WIDTH, HIDDEN_WIDTH, device),
            dropout: DropoutConfig::new(self.dropout).init(),
            output: linear(HIDDEN_WIDTH, self.classes, device),
        };

        Vgg {
            features,
            avg_pool,
            classifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn forward_maps_images_to_class_logits() {
        let device = Default::default();
        let model = VggConfig::new(3).init::<B>(&device);

        let images = Tensor::<B, 4>::zeros([2, CHANNEL_COUNT, 32, 32], &device);
        let logits = model.forward(images);

        assert_eq!(logits.dims(), [2, 3]);
    }

    #[test]
    fn classifier_biases_start_at_zero() {
        let device = Default::default();
        let model = VggConfig::new(4).init::<B>(&device);

        for layer in [
            &model.classifier.hidden0,
            &model.classifier.hidden1,
            &model.classifier.output,
        ] {
            let bias_norm = layer
                .bias
                .clone()
                .unwrap()
                .val()
                .abs()
                .sum()
                .into_scalar();
            assert_eq!(bias_norm, 0.0);
        }
    }

    #[test]
    fn loss_is_a_finite_scalar() {
        let device = Default::default();
        let model = VggConfig::new(2).init::<B>(&device);

        let images = Tensor::<B, 4>::ones([2, CHANNEL_COUNT, 32, 32], &device);
        let targets = Tensor::<B, 1, Int>::from_ints([0, 1], &device);

        let logits = model.forward(images);
        let loss = model.loss(logits, targets).into_scalar();

        assert!(loss.is_finite());
    }
}
