use std::{collections::HashMap, convert::TryFrom, fmt::Display, str::FromStr, sync::OnceLock};

use super::{model_info::ModelInfo, ModelTrait};
use crate::EncoderError;

/// Lazy static list of all available models.
static MODEL_MAP: OnceLock<HashMap<ImageEncoderModel, ModelInfo<ImageEncoderModel>>> =
    OnceLock::new();

/// Variants published by kaiko.ai, in the order they are listed upstream.
pub const KAIKO_VARIANTS: [&str; 5] = ["vits16", "vits8", "vitb16", "vitb8", "vitl14"];

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageEncoderModel {
    /// MahmoodLab/UNI, ViT-L/16 pathology foundation model
    Uni,
    /// kaiko.ai ViT-S/16
    #[default]
    KaikoVitS16,
    /// kaiko.ai ViT-S/8
    KaikoVitS8,
    /// kaiko.ai ViT-B/16
    KaikoVitB16,
    /// kaiko.ai ViT-B/8
    KaikoVitB8,
    /// kaiko.ai ViT-L/14 with register tokens
    KaikoVitL14,
    /// torchvision ResNet-50, ImageNet1K V1 weights
    Resnet50,
    /// torchvision ResNet-18, ImageNet1K V1 weights
    Resnet18,
}

impl ImageEncoderModel {
    /// Canonical name, as accepted by [ImageEncoderModel::from_name]
    pub fn name(&self) -> &'static str {
        match self {
            ImageEncoderModel::Uni => "UNI",
            ImageEncoderModel::KaikoVitS16 => "kaiko-vits16",
            ImageEncoderModel::KaikoVitS8 => "kaiko-vits8",
            ImageEncoderModel::KaikoVitB16 => "kaiko-vitb16",
            ImageEncoderModel::KaikoVitB8 => "kaiko-vitb8",
            ImageEncoderModel::KaikoVitL14 => "kaiko-vitl14",
            ImageEncoderModel::Resnet50 => "resnet50",
            ImageEncoderModel::Resnet18 => "resnet18",
        }
    }

    /// Resolve an encoder name.
    ///
    /// The families are tried in order: exact `UNI`, the `kaiko` prefix, the `resnet`
    /// prefix. For kaiko names the variant is the text between the first and second `-`.
    pub fn from_name(name: &str) -> Result<Self, EncoderError> {
        if name == "UNI" {
            return Ok(ImageEncoderModel::Uni);
        }

        if name.starts_with("kaiko") {
            let variant = name.split('-').nth(1).unwrap_or_default();
            return match variant {
                "vits16" => Ok(ImageEncoderModel::KaikoVitS16),
                "vits8" => Ok(ImageEncoderModel::KaikoVitS8),
                "vitb16" => Ok(ImageEncoderModel::KaikoVitB16),
                "vitb8" => Ok(ImageEncoderModel::KaikoVitB8),
                "vitl14" => Ok(ImageEncoderModel::KaikoVitL14),
                unknown => Err(EncoderError::UnknownVariant(unknown.to_string())),
            };
        }

        if name.starts_with("resnet") {
            return match name {
                "resnet50" => Ok(ImageEncoderModel::Resnet50),
                "resnet18" => Ok(ImageEncoderModel::Resnet18),
                unknown => Err(EncoderError::NotImplemented(unknown.to_string())),
            };
        }

        Err(EncoderError::InvalidName(name.to_string()))
    }

    /// The kaiko variant string, e.g. `vitb8`
    pub fn kaiko_variant(&self) -> Option<&'static str> {
        self.name().strip_prefix("kaiko-")
    }
}

/// Embedding width of a kaiko variant, from its size prefix.
pub fn kaiko_dim(variant: &str) -> usize {
    if variant.starts_with("vits") {
        384
    } else if variant.starts_with("vitb") {
        768
    } else {
        1024
    }
}

fn init_models_map() -> HashMap<ImageEncoderModel, ModelInfo<ImageEncoderModel>> {
    let kaiko = |model: ImageEncoderModel, timm_name: &str, description: &str| {
        let variant = model.kaiko_variant().unwrap_or_default();
        ModelInfo {
            model,
            dim: kaiko_dim(variant),
            description: String::from(description),
            model_code: format!("1aurent/{timm_name}.kaiko_ai_towards_large_pathology_fms"),
            model_file: String::from("model.safetensors"),
        }
    };

    let models_list = vec![
        ModelInfo {
            model: ImageEncoderModel::Uni,
            dim: 1024,
            description: String::from(
                "UNI general-purpose self-supervised model for pathology, ViT-L/16",
            ),
            model_code: String::from("MahmoodLab/UNI"),
            model_file: String::from("pytorch_model.bin"),
        },
        kaiko(
            ImageEncoderModel::KaikoVitS16,
            "vit_small_patch16_224",
            "kaiko.ai pathology foundation model, ViT-S/16",
        ),
        kaiko(
            ImageEncoderModel::KaikoVitS8,
            "vit_small_patch8_224",
            "kaiko.ai pathology foundation model, ViT-S/8",
        ),
        kaiko(
            ImageEncoderModel::KaikoVitB16,
            "vit_base_patch16_224",
            "kaiko.ai pathology foundation model, ViT-B/16",
        ),
        kaiko(
            ImageEncoderModel::KaikoVitB8,
            "vit_base_patch8_224",
            "kaiko.ai pathology foundation model, ViT-B/8",
        ),
        kaiko(
            ImageEncoderModel::KaikoVitL14,
            "vit_large_patch14_reg4_224",
            "kaiko.ai pathology foundation model, ViT-L/14 with 4 register tokens",
        ),
        ModelInfo {
            model: ImageEncoderModel::Resnet50,
            dim: 2048,
            description: String::from("ResNet-50 from `Deep Residual Learning for Image Recognition <https://arxiv.org/abs/1512.03385>`__."),
            model_code: String::from("timm/resnet50.tv_in1k"),
            model_file: String::from("model.safetensors"),
        },
        ModelInfo {
            model: ImageEncoderModel::Resnet18,
            dim: 512,
            description: String::from("ResNet-18 from `Deep Residual Learning for Image Recognition <https://arxiv.org/abs/1512.03385>`__."),
            model_code: String::from("timm/resnet18.tv_in1k"),
            model_file: String::from("model.safetensors"),
        },
    ];

    models_list
        .into_iter()
        .fold(HashMap::new(), |mut map, model| {
            map.insert(model.model, model);
            map
        })
}

/// Get a map of all available models.
pub fn models_map() -> &'static HashMap<ImageEncoderModel, ModelInfo<ImageEncoderModel>> {
    MODEL_MAP.get_or_init(init_models_map)
}

/// Get a list of all available models.
pub fn models_list() -> Vec<ModelInfo<ImageEncoderModel>> {
    let mut models: Vec<_> = models_map().values().cloned().collect();
    models.sort_by_key(|info| info.model.name());
    models
}

impl ModelTrait for ImageEncoderModel {
    type Model = Self;

    fn get_model_info(model: &ImageEncoderModel) -> Option<&ModelInfo<ImageEncoderModel>> {
        models_map().get(model)
    }
}

impl Display for ImageEncoderModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ImageEncoderModel {
    type Err = EncoderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageEncoderModel::from_name(s)
    }
}

impl TryFrom<String> for ImageEncoderModel {
    type Error = EncoderError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_table_dims() {
        let expected = [
            ("UNI", 1024),
            ("kaiko-vits16", 384),
            ("kaiko-vits8", 384),
            ("kaiko-vitb16", 768),
            ("kaiko-vitb8", 768),
            ("kaiko-vitl14", 1024),
            ("resnet50", 2048),
            ("resnet18", 512),
        ];
        for (name, dim) in expected {
            let model = ImageEncoderModel::from_name(name).unwrap();
            let info = ImageEncoderModel::get_model_info(&model).unwrap();
            assert_eq!(info.dim, dim, "{name}");
        }
    }

    #[test]
    fn every_model_is_registered() {
        assert_eq!(models_list().len(), 8);
        for info in models_list() {
            assert!(info.dim > 0);
            let parsed: ImageEncoderModel = info.model.to_string().parse().unwrap();
            assert_eq!(parsed, info.model);
        }
    }

    #[test]
    fn kaiko_unknown_variant() {
        assert_eq!(
            ImageEncoderModel::from_name("kaiko-unknown"),
            Err(EncoderError::UnknownVariant("unknown".into()))
        );
        // only the segment after the first dash is the variant
        assert_eq!(
            ImageEncoderModel::from_name("kaiko-vits16-extra"),
            Ok(ImageEncoderModel::KaikoVitS16)
        );
        assert_eq!(
            ImageEncoderModel::from_name("kaiko"),
            Err(EncoderError::UnknownVariant(String::new()))
        );
    }

    #[test]
    fn resnet_not_implemented() {
        assert_eq!(
            ImageEncoderModel::from_name("resnet99"),
            Err(EncoderError::NotImplemented("resnet99".into()))
        );
    }

    #[test]
    fn invalid_name() {
        assert_eq!(
            ImageEncoderModel::from_name("bogus"),
            Err(EncoderError::InvalidName("bogus".into()))
        );
        // matching is case sensitive
        assert_eq!(
            ImageEncoderModel::from_name("uni"),
            Err(EncoderError::InvalidName("uni".into()))
        );
    }

    #[test]
    fn kaiko_dim_by_prefix() {
        let dims: Vec<_> = KAIKO_VARIANTS
            .iter()
            .map(|variant| (*variant, kaiko_dim(variant)))
            .collect();
        assert_eq!(
            dims,
            [
                ("vits16", 384),
                ("vits8", 384),
                ("vitb16", 768),
                ("vitb8", 768),
                ("vitl14", 1024),
            ]
        );
    }
}
