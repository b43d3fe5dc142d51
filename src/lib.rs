pub mod checkpoint;
pub mod error;
pub mod model;
pub mod utils;

use burn::backend::NdArray;

pub use crate::{
    checkpoint::{LoadReport, NamedParams},
    error::{GlDiscError, Result},
    model::{
        discriminator::{MultiLayerDiscriminator, MultiLayerDiscriminatorConfig},
        gl_discs::{GlDiscs, GlDiscsConfig, Pretrained, FUSION_IN_FEATURES},
        Component, ComponentConfig,
    },
};

pub type MyBackend = NdArray<f32>;
