pub mod discriminator;
pub mod gl_discs;
pub mod layers;

use std::{fs, path::Path};

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    error::{GlDiscError, Result},
    model::{
        discriminator::{MultiLayerDiscriminator, MultiLayerDiscriminatorConfig},
        gl_discs::{GlDiscs, GlDiscsConfig},
    },
};

/// Discriminator components selectable by name from a config file through
/// the `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ComponentConfig {
    #[serde(rename = "GLDiscs")]
    GlDiscs(GlDiscsConfig),
    #[serde(rename = "MultiLayerDiscriminator")]
    MultiLayer(MultiLayerDiscriminatorConfig),
}

pub fn registered_types() -> &'static [&'static str] {
    &["GLDiscs", "MultiLayerDiscriminator"]
}

#[derive(Debug)]
pub enum Component<B: Backend> {
    GlDiscs(GlDiscs<B>),
    MultiLayer(MultiLayerDiscriminator<B>),
}

impl ComponentConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            ComponentConfig::GlDiscs(_) => "GLDiscs",
            ComponentConfig::MultiLayer(_) => "MultiLayerDiscriminator",
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| GlDiscError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn build<B: Backend>(&self, device: &B::Device) -> Result<Component<B>> {
        tracing::debug!("Building {} component", self.type_name());
        match self {
            ComponentConfig::GlDiscs(config) => {
                Ok(Component::GlDiscs(config.init_pretrained(device)?))
            }
            ComponentConfig::MultiLayer(config) => {
                config.validate()?;
                Ok(Component::MultiLayer(config.init(device)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{gl_discs::Pretrained, layers::NormKind},
        MyBackend,
    };

    const DEMO_JSON: &str = include_str!("../demos/gl_discs.json");

    const MULTI_LAYER_JSON: &str = r#"{
        "type": "MultiLayerDiscriminator",
        "in_channels": 3,
        "max_channels": 16,
        "num_convs": 2,
        "fc_in_channels": 64,
        "fc_out_channels": 8,
        "kernel_size": 5,
        "norm": "BatchNorm",
        "act": "Relu",
        "out_act": { "LeakyRelu": { "negative_slope": 0.2 } },
        "with_input_norm": true,
        "with_out_convs": false,
        "init_std": 0.02
    }"#;

    #[test]
    fn multi_layer_config_is_selected_by_type_name() {
        let config = ComponentConfig::from_json(MULTI_LAYER_JSON).unwrap();

        assert_eq!(config.type_name(), "MultiLayerDiscriminator");
        let ComponentConfig::MultiLayer(inner) = &config else {
            panic!("expected a multi layer config, got {config:?}");
        };
        assert_eq!(inner.num_convs, 2);
        assert_eq!(inner.norm, Some(NormKind::BatchNorm));

        let device = Default::default();
        let component = config.build::<MyBackend>(&device).unwrap();
        assert!(matches!(component, Component::MultiLayer(_)));
    }

    #[test]
    fn gl_discs_config_is_selected_by_type_name() {
        let config = ComponentConfig::GlDiscs(GlDiscsConfig::reference());
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"type\":\"GLDiscs\""));

        let parsed = ComponentConfig::from_json(&json).unwrap();
        let ComponentConfig::GlDiscs(inner) = parsed else {
            panic!("expected a GLDiscs config");
        };
        assert_eq!(inner.global_disc_config.num_convs, 6);
        assert_eq!(inner.local_disc_config.num_convs, 5);
    }

    #[test]
    fn shipped_demo_config_is_the_reference_setup() {
        let config = ComponentConfig::from_json(DEMO_JSON).unwrap();
        let ComponentConfig::GlDiscs(inner) = config else {
            panic!("expected a GLDiscs config");
        };

        let reference = GlDiscsConfig::reference();
        assert_eq!(inner.to_string(), reference.to_string());
    }

    #[test]
    fn pretrained_path_in_config_selects_a_checkpoint() {
        let json = DEMO_JSON.replace(
            "\"pretrained\": null",
            "\"pretrained\": \"work_dirs/gl_discs.safetensors\"",
        );

        let ComponentConfig::GlDiscs(inner) = ComponentConfig::from_json(&json).unwrap() else {
            panic!("expected a GLDiscs config");
        };
        assert_eq!(
            inner.pretrained,
            Pretrained::FromCheckpoint("work_dirs/gl_discs.safetensors".into())
        );
    }

    #[test]
    fn non_string_pretrained_is_a_type_error() {
        let json = DEMO_JSON.replace("\"pretrained\": null", "\"pretrained\": 42");
        assert_ne!(json, DEMO_JSON);

        let err = ComponentConfig::from_json(&json).unwrap_err();
        assert!(matches!(err, GlDiscError::Json(_)), "{err:?}");
        let message = err.to_string();
        assert!(
            message.contains("expected a checkpoint path string or null"),
            "{message}"
        );
    }

    #[test]
    fn non_string_pretrained_in_config_file_is_a_type_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gl_discs.json");
        let json = DEMO_JSON.replace("\"pretrained\": null", "\"pretrained\": [1, 2]");
        fs::write(&path, json).unwrap();

        let err = ComponentConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, GlDiscError::Json(_)), "{err:?}");
        assert!(err
            .to_string()
            .contains("expected a checkpoint path string or null"));
    }

    #[test]
    fn missing_config_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();

        let err = ComponentConfig::from_file(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, GlDiscError::Io { .. }), "{err:?}");
    }

    #[test]
    fn unknown_type_names_are_rejected() {
        let err = ComponentConfig::from_json(r#"{ "type": "PatchDiscriminator" }"#).unwrap_err();

        let message = err.to_string();
        assert!(message.contains("PatchDiscriminator"), "{message}");
        for name in registered_types() {
            assert!(message.contains(name), "{message}");
        }
    }

    #[test]
    fn invalid_component_config_fails_to_build() {
        let json = MULTI_LAYER_JSON.replace("\"num_convs\": 2", "\"num_convs\": 0");
        let config = ComponentConfig::from_json(&json).unwrap();

        let device = Default::default();
        let result = config.build::<MyBackend>(&device);
        assert!(matches!(result, Err(GlDiscError::InvalidConfig(_))));
    }
}
