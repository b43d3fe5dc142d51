use burn::{
    module::Ignored,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::activation,
};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{join_key, NamedParams, StateDict, StateLoader};
use crate::error::Result as GlResult;

/// Pointwise activation applied at the end of a block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
    LeakyRelu { negative_slope: f64 },
    Sigmoid,
    Tanh,
    Identity,
}
impl Activation {
    pub fn forward<B: Backend, const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Relu => activation::relu(input),
            Activation::LeakyRelu { negative_slope } => {
                activation::leaky_relu(input, *negative_slope)
            }
            Activation::Sigmoid => activation::sigmoid(input),
            Activation::Tanh => activation::tanh(input),
            Activation::Identity => input,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormKind {
    BatchNorm,
}

// ////////////////////////////////////////////////////////////////////////////
// Conv -> Norm -> Act
#[derive(Module, Debug)]
pub struct ConvModule<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: Option<BatchNorm<B, 2>>,
    act: Ignored<Activation>,
}
impl<B: Backend> ConvModule<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let output = self.conv.forward(input);
        let output = match &self.norm {
            Some(norm) => norm.forward(output),
            None => output,
        };
        self.act.forward(output)
    }

    pub fn activation(&self) -> Activation {
        *self.act
    }
}

#[derive(Config, Debug)]
pub struct ConvModuleConfig {
    pub channels: [usize; 2],
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = 1)]
    pub stride: usize,
    pub norm: Option<NormKind>,
    #[config(default = "Activation::Relu")]
    pub act: Activation,
}
impl ConvModuleConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvModule<B> {
        let padding = self.kernel_size / 2;
        // the norm's shift makes a conv bias redundant
        let conv = Conv2dConfig::new(self.channels, [self.kernel_size, self.kernel_size])
            .with_stride([self.stride, self.stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_bias(self.norm.is_none())
            .init(device);
        let norm = self.norm.map(|kind| match kind {
            NormKind::BatchNorm => BatchNormConfig::new(self.channels[1]).init(device),
        });

        ConvModule {
            conv,
            norm,
            act: Ignored(self.act),
        }
    }
}

impl<B: Backend> NamedParams for ConvModule<B> {
    fn export(&self, prefix: &str, dict: &mut StateDict) -> GlResult<()> {
        self.conv.export(&join_key(prefix, "conv"), dict)?;
        if let Some(norm) = &self.norm {
            norm.export(&join_key(prefix, "norm"), dict)?;
        }
        Ok(())
    }

    fn import(mut self, prefix: &str, loader: &mut StateLoader) -> Self {
        self.conv = self.conv.import(&join_key(prefix, "conv"), loader);
        self.norm = self
            .norm
            .map(|norm| norm.import(&join_key(prefix, "norm"), loader));
        self
    }
}

// ////////////////////////////////////////////////////////////////////////////
// Linear -> Act
#[derive(Module, Debug)]
pub struct LinearModule<B: Backend> {
    pub linear: Linear<B>,
    act: Ignored<Activation>,
}
impl<B: Backend> LinearModule<B> {
    pub fn new(
        features: [usize; 2],
        init_std: f64,
        act: Activation,
        device: &B::Device,
    ) -> Self {
        let mut linear = LinearConfig::new(features[0], features[1])
            .with_initializer(Initializer::Normal {
                mean: 0.0,
                std: init_std,
            })
            .init(device);
        // the initializer draws the bias too; it starts at zero
        linear.bias = linear.bias.map(|bias| {
            bias.map(|bias| {
                let require_grad = bias.is_require_grad();
                bias.zeros_like().set_require_grad(require_grad)
            })
        });

        Self {
            linear,
            act: Ignored(act),
        }
    }

    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let output = self.linear.forward(input);
        self.act.forward(output)
    }
}

impl<B: Backend> NamedParams for LinearModule<B> {
    fn export(&self, prefix: &str, dict: &mut StateDict) -> GlResult<()> {
        self.linear.export(&join_key(prefix, "linear"), dict)
    }

    fn import(mut self, prefix: &str, loader: &mut StateLoader) -> Self {
        self.linear = self.linear.import(&join_key(prefix, "linear"), loader);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MyBackend;

    #[test]
    fn conv_module_halves_spatial_dims_with_stride_two() {
        let device = Default::default();
        let block = ConvModuleConfig::new([3, 8])
            .with_kernel_size(5)
            .with_stride(2)
            .with_norm(Some(NormKind::BatchNorm))
            .init::<MyBackend>(&device);

        let input = Tensor::<MyBackend, 4>::zeros([2, 3, 16, 12], &device);
        let output = block.forward(input);

        assert_eq!(output.dims(), [2, 8, 8, 6]);
    }

    #[test]
    fn conv_bias_is_dropped_when_norm_follows() {
        let device = Default::default();
        let with_norm = ConvModuleConfig::new([3, 4])
            .with_norm(Some(NormKind::BatchNorm))
            .init::<MyBackend>(&device);
        let without_norm = ConvModuleConfig::new([3, 4]).init::<MyBackend>(&device);

        assert!(with_norm.conv.bias.is_none());
        assert!(with_norm.norm.is_some());
        assert!(without_norm.conv.bias.is_some());
        assert!(without_norm.norm.is_none());
    }

    #[test]
    fn activations_match_their_definitions() {
        let device = Default::default();
        let input = Tensor::<MyBackend, 1>::from_floats([-2.0, 0.0, 3.0], &device);

        let relu = Activation::Relu.forward(input.clone()).into_data();
        assert_eq!(relu.to_vec::<f32>().unwrap(), vec![0.0, 0.0, 3.0]);

        let leaky = Activation::LeakyRelu {
            negative_slope: 0.5,
        }
        .forward(input.clone())
        .into_data();
        assert_eq!(leaky.to_vec::<f32>().unwrap(), vec![-1.0, 0.0, 3.0]);

        let identity = Activation::Identity.forward(input).into_data();
        assert_eq!(identity.to_vec::<f32>().unwrap(), vec![-2.0, 0.0, 3.0]);
    }

    #[test]
    fn linear_module_applies_activation() {
        let device = Default::default();
        let layer = LinearModule::<MyBackend>::new([4, 16], 0.02, Activation::Relu, &device);

        let input = Tensor::<MyBackend, 2>::ones([3, 4], &device);
        let output = layer.forward(input);

        assert_eq!(output.dims(), [3, 16]);
        let min = output.min().into_scalar();
        assert!(min >= 0.0);
    }

    #[test]
    fn linear_module_starts_with_zero_bias() {
        let device = Default::default();
        let layer = LinearModule::<MyBackend>::new([64, 1024], 0.02, Activation::Relu, &device);

        let bias = layer.linear.bias.as_ref().unwrap().val();
        let bias = bias.into_data().to_vec::<f32>().unwrap();
        assert_eq!(bias, vec![0.0; 1024]);

        let weight = layer.linear.weight.val().into_data().to_vec::<f32>().unwrap();
        assert!(weight.iter().any(|&w| w != 0.0));
    }
}
