use burn::{
    module::Module,
    nn::conv::Conv2d,
    prelude::*,
    tensor::{activation::relu, Distribution},
};
use nn::{conv::Conv2dConfig, BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d};

/// conv 3x3 -> batchnorm -> relu, the unit every VGG stage is built from.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);

        relu(x)
    }
}

#[derive(Config, Debug)]
pub struct ConvBlockConfig {
    channels: [usize; 2],

    #[config(default = "[3, 3]")]
    kernel_size: [usize; 2],
}

impl ConvBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBlock<B> {
        let mut norm = BatchNormConfig::new(self.channels[1]).init(device);
        // scale starts near one, bias stays at zero
        norm.gamma = norm
            .gamma
            .map(|gamma| gamma.random_like(Distribution::Normal(1.0, 0.02)));

        ConvBlock {
            conv: Conv2dConfig::new(self.channels, self.kernel_size)
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .with_initializer(Initializer::Normal {
                    mean: 0.0,
                    std: 0.02,
                })
                .init(device),
            norm,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn norm_scale_is_drawn_near_one() {
        let device = Default::default();
        let block = ConvBlockConfig::new([3, 64]).init::<B>(&device);

        let gamma = block
            .norm
            .gamma
            .val()
            .into_data()
            .to_vec::<f32>()
            .unwrap();

        assert_eq!(gamma.len(), 64);
        assert!(gamma.iter().all(|g| (g - 1.0).abs() < 0.2));
        assert!(gamma.iter().any(|g| (g - 1.0).abs() > 1e-8));
    }

    #[test]
    fn norm_bias_stays_at_zero() {
        let device = Default::default();
        let block = ConvBlockConfig::new([3, 16]).init::<B>(&device);

        let beta_norm = block.norm.beta.val().abs().sum().into_scalar();
        assert_eq!(beta_norm, 0.0);
    }
}
