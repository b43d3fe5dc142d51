use std::{
    fmt,
    path::{Path, PathBuf},
};

use burn::{
    module::Module,
    nn::{Linear, LinearConfig},
    prelude::*,
    tensor::Distribution,
};
use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};

use crate::{
    checkpoint::{self, join_key, LoadReport, NamedParams, StateDict, StateLoader},
    error::{GlDiscError, Result as GlResult},
    model::{
        discriminator::{MultiLayerDiscriminator, MultiLayerDiscriminatorConfig},
        layers::NormKind,
    },
};

/// Input width of the fusion layer: the concatenated global and local
/// embeddings.
pub const FUSION_IN_FEATURES: usize = 2048;
pub const FUSION_INIT_STD: f64 = 0.02;

/// Discriminators of "Globally and Locally Consistent Image Completion".
///
/// The global branch scores the whole image, the local branch a crop around
/// the completed region. Their embeddings are concatenated (global first)
/// and fused into one logit per pair.
#[derive(Module, Debug)]
pub struct GlDiscs<B: Backend> {
    pub global_disc: MultiLayerDiscriminator<B>,
    pub local_disc: MultiLayerDiscriminator<B>,
    pub fc: Linear<B>,
}
impl<B: Backend> GlDiscs<B> {
    /// `[batch, 1]` pre-activation logits.
    pub fn forward(&self, global_image: Tensor<B, 4>, local_image: Tensor<B, 4>) -> Tensor<B, 2> {
        let g_pred = self.global_disc.forward(global_image);
        let l_pred = self.local_disc.forward(local_image);

        let pred = Tensor::cat(vec![g_pred, l_pred], 1);

        self.fc.forward(pred)
    }

    pub fn init_weights(self, pretrained: &Pretrained) -> GlResult<Self> {
        match pretrained {
            Pretrained::FromCheckpoint(path) => {
                tracing::info!("Loading GLDiscs weights from '{}'", path.display());
                let (discs, report) = self.load_checkpoint(path)?;
                report.log(path);
                Ok(discs)
            }
            Pretrained::FreshInit => Ok(self.reset_fusion()),
        }
    }

    /// Conv and norm layers keep their construction-time init; only the
    /// fusion layer is redrawn.
    pub fn reset_fusion(mut self) -> Self {
        self.fc.weight = self.fc.weight.map(|weight| {
            let require_grad = weight.is_require_grad();
            Tensor::random(
                weight.shape(),
                Distribution::Normal(0.0, FUSION_INIT_STD),
                &weight.device(),
            )
            .set_require_grad(require_grad)
        });
        self.fc.bias = self.fc.bias.map(|bias| {
            bias.map(|bias| {
                let require_grad = bias.is_require_grad();
                bias.zeros_like().set_require_grad(require_grad)
            })
        });
        self
    }

    pub fn load_checkpoint<P: AsRef<Path>>(self, path: P) -> GlResult<(Self, LoadReport)> {
        checkpoint::load_checkpoint(self, path)
    }

    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> GlResult<()> {
        checkpoint::save_checkpoint(self, path)
    }
}

impl<B: Backend> NamedParams for GlDiscs<B> {
    fn export(&self, prefix: &str, dict: &mut StateDict) -> GlResult<()> {
        self.global_disc
            .export(&join_key(prefix, "global_disc"), dict)?;
        self.local_disc.export(&join_key(prefix, "local_disc"), dict)?;
        self.fc.export(&join_key(prefix, "fc"), dict)
    }

    fn import(mut self, prefix: &str, loader: &mut StateLoader) -> Self {
        self.global_disc = self
            .global_disc
            .import(&join_key(prefix, "global_disc"), loader);
        self.local_disc = self
            .local_disc
            .import(&join_key(prefix, "local_disc"), loader);
        self.fc = self.fc.import(&join_key(prefix, "fc"), loader);
        self
    }
}

#[derive(Config, Debug)]
pub struct GlDiscsConfig {
    pub global_disc_config: MultiLayerDiscriminatorConfig,
    pub local_disc_config: MultiLayerDiscriminatorConfig,
    /// Checkpoint path or `null`; any other value fails the config parse.
    #[config(default = "Pretrained::FreshInit")]
    pub pretrained: Pretrained,
}
impl GlDiscsConfig {
    /// 256x256 global images and 128x128 local crops, both reduced to
    /// 512x4x4 before a 1024-wide embedding.
    pub fn reference() -> Self {
        let global_disc_config = MultiLayerDiscriminatorConfig::new(3, 512)
            .with_num_convs(6)
            .with_fc_in_channels(Some(512 * 4 * 4))
            .with_fc_out_channels(1024)
            .with_norm(Some(NormKind::BatchNorm));
        let local_disc_config = MultiLayerDiscriminatorConfig::new(3, 512)
            .with_num_convs(5)
            .with_fc_in_channels(Some(512 * 4 * 4))
            .with_fc_out_channels(1024)
            .with_norm(Some(NormKind::BatchNorm));

        Self::new(global_disc_config, local_disc_config)
    }

    pub fn validate(&self) -> GlResult<()> {
        self.global_disc_config.validate()?;
        self.local_disc_config.validate()?;

        match (
            self.global_disc_config.embedding_width(),
            self.local_disc_config.embedding_width(),
        ) {
            (Some(global), Some(local)) if global + local != FUSION_IN_FEATURES => {
                Err(GlDiscError::EmbeddingWidth {
                    global,
                    local,
                    expected: FUSION_IN_FEATURES,
                })
            }
            (Some(_), Some(_)) => Ok(()),
            _ => {
                // widths depend on the input size, the fusion layer checks them
                tracing::debug!("Embedding width check deferred to the first forward pass");
                Ok(())
            }
        }
    }

    /// Builds the module and applies `pretrained`.
    pub fn init_pretrained<B: Backend>(&self, device: &B::Device) -> GlResult<GlDiscs<B>> {
        self.init(device)?.init_weights(&self.pretrained)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> GlResult<GlDiscs<B>> {
        self.validate()?;

        let global_disc = self.global_disc_config.init(device);
        let local_disc = self.local_disc_config.init(device);
        let fc = LinearConfig::new(FUSION_IN_FEATURES, 1)
            .with_bias(true)
            .init(device);

        Ok(GlDiscs {
            global_disc,
            local_disc,
            fc,
        })
    }
}

// ////////////////////////////////////////////////////////////////////////////
// Pretrained
/// Where initial weights come from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Pretrained {
    FromCheckpoint(PathBuf),
    #[default]
    FreshInit,
}

impl Serialize for Pretrained {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Pretrained::FromCheckpoint(path) => path.serialize(serializer),
            Pretrained::FreshInit => serializer.serialize_none(),
        }
    }
}

// A string selects a checkpoint, null selects fresh init; any other JSON
// type is rejected.
impl<'de> Deserialize<'de> for Pretrained {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(PretrainedVisitor)
    }
}

struct PretrainedVisitor;
impl<'de> Visitor<'de> for PretrainedVisitor {
    type Value = Pretrained;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a checkpoint path string or null")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<Pretrained, E> {
        Ok(Pretrained::FromCheckpoint(PathBuf::from(value)))
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Pretrained, E> {
        Ok(Pretrained::FreshInit)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Pretrained, E> {
        Ok(Pretrained::FreshInit)
    }

    fn visit_some<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<Pretrained, D::Error> {
        deserializer.deserialize_any(self)
    }
}
