use burn::{module::Module, prelude::*};

use crate::{
    checkpoint::{join_key, NamedParams, StateDict, StateLoader},
    error::{GlDiscError, Result as GlResult},
    model::layers::{Activation, ConvModule, ConvModuleConfig, LinearModule, NormKind},
};

/// Stack of stride-2 conv blocks with an optional fully connected head.
///
/// Block `i` outputs `min(64 * 2^i, max_channels)` channels. With
/// `with_out_convs`, two stride-1 convs follow (to `max_channels`, then to a
/// single channel). The conv output is flattened per batch item and, when
/// `fc_in_channels` is set, projected to `fc_out_channels`.
#[derive(Module, Debug)]
pub struct MultiLayerDiscriminator<B: Backend> {
    convs: Vec<ConvModule<B>>,
    fc: Option<LinearModule<B>>,
}
impl<B: Backend> MultiLayerDiscriminator<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let output = self.forward_features(input);
        let output: Tensor<B, 2> = output.flatten(1, 3);

        match &self.fc {
            Some(fc) => fc.forward(output),
            None => output,
        }
    }

    /// Output of the conv stack before flattening.
    pub fn forward_features(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.convs
            .iter()
            .fold(input, |output, conv| conv.forward(output))
    }

    pub fn convs(&self) -> &[ConvModule<B>] {
        &self.convs
    }

    pub fn fc(&self) -> Option<&LinearModule<B>> {
        self.fc.as_ref()
    }
}

impl<B: Backend> NamedParams for MultiLayerDiscriminator<B> {
    fn export(&self, prefix: &str, dict: &mut StateDict) -> GlResult<()> {
        for (index, conv) in self.convs.iter().enumerate() {
            conv.export(&join_key(prefix, &format!("conv{}", index + 1)), dict)?;
        }
        if let Some(fc) = &self.fc {
            fc.export(&join_key(prefix, "fc"), dict)?;
        }
        Ok(())
    }

    fn import(mut self, prefix: &str, loader: &mut StateLoader) -> Self {
        self.convs = self
            .convs
            .into_iter()
            .enumerate()
            .map(|(index, conv)| {
                conv.import(&join_key(prefix, &format!("conv{}", index + 1)), loader)
            })
            .collect();
        self.fc = self.fc.map(|fc| fc.import(&join_key(prefix, "fc"), loader));
        self
    }
}

#[derive(Config, Debug)]
pub struct MultiLayerDiscriminatorConfig {
    pub in_channels: usize,
    pub max_channels: usize,
    #[config(default = 5)]
    pub num_convs: usize,
    pub fc_in_channels: Option<usize>,
    #[config(default = 1024)]
    pub fc_out_channels: usize,
    #[config(default = 5)]
    pub kernel_size: usize,
    pub norm: Option<NormKind>,
    #[config(default = "Activation::Relu")]
    pub act: Activation,
    #[config(default = "Activation::Relu")]
    pub out_act: Activation,
    #[config(default = true)]
    pub with_input_norm: bool,
    #[config(default = false)]
    pub with_out_convs: bool,
    #[config(default = 0.02)]
    pub init_std: f64,
}
impl MultiLayerDiscriminatorConfig {
    pub fn validate(&self) -> GlResult<()> {
        if self.in_channels == 0 {
            return Err(GlDiscError::InvalidConfig(
                "in_channels must be positive".to_string(),
            ));
        }
        if self.max_channels == 0 {
            return Err(GlDiscError::InvalidConfig(
                "max_channels must be positive".to_string(),
            ));
        }
        if self.num_convs == 0 {
            return Err(GlDiscError::InvalidConfig(
                "num_convs must be at least 1".to_string(),
            ));
        }
        if self.kernel_size == 0 {
            return Err(GlDiscError::InvalidConfig(
                "kernel_size must be positive".to_string(),
            ));
        }
        if self.fc_in_channels == Some(0) {
            return Err(GlDiscError::InvalidConfig(
                "fc_in_channels must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    fn with_fc(&self) -> bool {
        self.fc_in_channels.is_some()
    }

    /// Output channels of conv block `index`.
    pub fn block_channels(&self, index: usize) -> usize {
        (0..index)
            .fold(64usize, |channels, _| channels.saturating_mul(2))
            .min(self.max_channels)
    }

    /// Width of the embedding when it does not depend on the input size.
    pub fn embedding_width(&self) -> Option<usize> {
        self.with_fc().then_some(self.fc_out_channels)
    }

    /// Width of the flattened conv output for an input of `height x width`.
    pub fn flattened_width(&self, height: usize, width: usize) -> usize {
        let padding = self.kernel_size / 2;
        let out_size = |size: usize, stride: usize| {
            (size + 2 * padding).saturating_sub(self.kernel_size) / stride + 1
        };

        let (mut height, mut width) = (height, width);
        for _ in 0..self.num_convs {
            height = out_size(height, 2);
            width = out_size(width, 2);
        }
        let channels = if self.with_out_convs {
            for _ in 0..2 {
                height = out_size(height, 1);
                width = out_size(width, 1);
            }
            1
        } else {
            // no conv blocks leave the input channels as they are
            match self.num_convs.checked_sub(1) {
                Some(last) => self.block_channels(last),
                None => self.in_channels,
            }
        };

        channels * height * width
    }

    /// Assumes [`Self::validate`] passed.
    pub fn init<B: Backend>(&self, device: &B::Device) -> MultiLayerDiscriminator<B> {
        let mut convs = Vec::with_capacity(self.num_convs + 2);
        let mut cur_channels = self.in_channels;

        for index in 0..self.num_convs {
            let out_channels = self.block_channels(index);
            let mut norm = self.norm;
            let mut act = self.act;
            if index == 0 && !self.with_input_norm {
                norm = None;
            } else if index == self.num_convs - 1 && !self.with_fc() && !self.with_out_convs {
                norm = None;
                act = self.out_act;
            }

            let conv = ConvModuleConfig::new([cur_channels, out_channels])
                .with_kernel_size(self.kernel_size)
                .with_stride(2)
                .with_norm(norm)
                .with_act(act)
                .init(device);
            convs.push(conv);
            cur_channels = out_channels;
        }

        if self.with_out_convs {
            let conv = ConvModuleConfig::new([cur_channels, self.max_channels])
                .with_kernel_size(self.kernel_size)
                .with_norm(self.norm)
                .with_act(self.act)
                .init(device);
            convs.push(conv);
            let conv = ConvModuleConfig::new([self.max_channels, 1])
                .with_kernel_size(self.kernel_size)
                .with_act(Activation::Identity)
                .init(device);
            convs.push(conv);
        }

        let fc = self.fc_in_channels.map(|fc_in_channels| {
            LinearModule::new(
                [fc_in_channels, self.fc_out_channels],
                self.init_std,
                self.out_act,
                device,
            )
        });

        MultiLayerDiscriminator { convs, fc }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MyBackend;

    fn small_config() -> MultiLayerDiscriminatorConfig {
        MultiLayerDiscriminatorConfig::new(3, 16)
            .with_num_convs(3)
            .with_norm(Some(NormKind::BatchNorm))
    }

    #[test]
    fn block_channels_double_until_capped() {
        let config = MultiLayerDiscriminatorConfig::new(3, 512).with_num_convs(6);

        let channels = (0..6).map(|i| config.block_channels(i)).collect::<Vec<_>>();

        assert_eq!(channels, vec![64, 128, 256, 512, 512, 512]);
    }

    #[test]
    fn flattened_width_matches_reference_setup() {
        let global = MultiLayerDiscriminatorConfig::new(3, 512).with_num_convs(6);
        let local = MultiLayerDiscriminatorConfig::new(3, 512).with_num_convs(5);

        assert_eq!(global.flattened_width(256, 256), 512 * 4 * 4);
        assert_eq!(local.flattened_width(128, 128), 512 * 4 * 4);
    }

    #[test]
    fn forward_without_fc_returns_flattened_features() {
        let device = Default::default();
        let config = small_config();
        let disc = config.init::<MyBackend>(&device);

        let input = Tensor::<MyBackend, 4>::zeros([2, 3, 16, 16], &device);
        let output = disc.forward(input);

        assert_eq!(output.dims(), [2, config.flattened_width(16, 16)]);
        assert_eq!(config.embedding_width(), None);
    }

    #[test]
    fn forward_with_fc_returns_embedding() {
        let device = Default::default();
        let features = small_config().flattened_width(16, 16);
        let config = small_config()
            .with_fc_in_channels(Some(features))
            .with_fc_out_channels(32);
        let disc = config.init::<MyBackend>(&device);

        let input = Tensor::<MyBackend, 4>::zeros([2, 3, 16, 16], &device);
        let output = disc.forward(input);

        assert_eq!(output.dims(), [2, 32]);
        assert_eq!(config.embedding_width(), Some(32));
    }

    #[test]
    fn last_block_uses_output_activation_without_fc() {
        let device = Default::default();
        let config = small_config().with_out_act(Activation::Identity);
        let disc = config.init::<MyBackend>(&device);

        let last = disc.convs().last().unwrap();
        assert!(last.norm.is_none());
        assert_eq!(last.activation(), Activation::Identity);
        assert!(disc.convs()[0].norm.is_some());
    }

    #[test]
    fn first_block_skips_norm_without_input_norm() {
        let device = Default::default();
        let config = small_config()
            .with_fc_in_channels(Some(64))
            .with_with_input_norm(false);
        let disc = config.init::<MyBackend>(&device);

        assert!(disc.convs()[0].norm.is_none());
        assert!(disc.convs()[2].norm.is_some());
        assert_eq!(disc.convs()[2].activation(), Activation::Relu);
    }

    #[test]
    fn out_convs_reduce_to_single_channel() {
        let device = Default::default();
        let config = small_config().with_with_out_convs(true);
        let disc = config.init::<MyBackend>(&device);

        assert_eq!(disc.convs().len(), 5);
        let input = Tensor::<MyBackend, 4>::zeros([1, 3, 16, 16], &device);
        let features = disc.forward_features(input);
        assert_eq!(features.dims(), [1, 1, 2, 2]);
        assert_eq!(config.flattened_width(16, 16), 4);
    }

    #[test]
    fn flattened_width_without_conv_blocks_is_the_input_size() {
        let config = MultiLayerDiscriminatorConfig::new(3, 16).with_num_convs(0);

        assert_eq!(config.flattened_width(8, 4), 3 * 8 * 4);
    }

    #[test]
    fn validate_rejects_degenerate_configs() {
        assert!(small_config().validate().is_ok());
        assert!(small_config().with_num_convs(0).validate().is_err());
        assert!(small_config()
            .with_fc_in_channels(Some(0))
            .validate()
            .is_err());
        assert!(MultiLayerDiscriminatorConfig::new(3, 0).validate().is_err());
    }

    #[test]
    fn exported_keys_follow_block_numbering() {
        let device = Default::default();
        let config = small_config().with_fc_in_channels(Some(64));
        let disc = config.init::<MyBackend>(&device);

        let dict = disc.state_dict().unwrap();

        assert!(dict.get("conv1.conv.weight").is_some());
        assert!(dict.get("conv1.conv.bias").is_none());
        assert!(dict.get("conv3.norm.running_var").is_some());
        assert_eq!(dict.get("fc.linear.weight").unwrap().shape, vec![64, 1024]);
    }
}
