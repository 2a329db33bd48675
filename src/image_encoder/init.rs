use std::path::PathBuf;

use candle_core::{Device, Result, Tensor};
use candle_nn::Module;

use crate::{get_cache_dir, ImageEncoderModel, ResNet, VisionTransformer};

use super::{utils::Compose, DEFAULT_ENCODER_MODEL};

/// Options for initializing the ImageEncoder model
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ImageEncoderInitOptions {
    pub model_name: ImageEncoderModel,
    pub cache_dir: PathBuf,
    pub show_download_progress: bool,
    pub device: Device,
}

impl Default for ImageEncoderInitOptions {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_ENCODER_MODEL,
            cache_dir: get_cache_dir(),
            show_download_progress: true,
            device: Device::Cpu,
        }
    }
}

impl ImageEncoderInitOptions {
    /// Create a new ImageEncoderInitOptions with the given model name
    pub fn new(model_name: ImageEncoderModel) -> Self {
        Self {
            model_name,
            ..Default::default()
        }
    }

    /// Set the cache directory for the weight files
    pub fn with_cache_dir(mut self, cache_dir: PathBuf) -> Self {
        self.cache_dir = cache_dir;
        self
    }

    /// Set whether to show download progress
    pub fn with_show_download_progress(mut self, show_download_progress: bool) -> Self {
        self.show_download_progress = show_download_progress;
        self
    }

    /// Set the device the model runs on
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }
}

/// Options for initializing UserDefinedImageEncoderModel
///
/// The weight file is held by the UserDefinedImageEncoderModel struct
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ImageEncoderInitOptionsUserDefined {
    pub device: Device,
}

impl Default for ImageEncoderInitOptionsUserDefined {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
        }
    }
}

impl ImageEncoderInitOptionsUserDefined {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }
}

/// Convert ImageEncoderInitOptions to ImageEncoderInitOptionsUserDefined
///
/// This is useful for when the user wants to use the same options for both the default and user-defined models
impl From<ImageEncoderInitOptions> for ImageEncoderInitOptionsUserDefined {
    fn from(options: ImageEncoderInitOptions) -> Self {
        ImageEncoderInitOptionsUserDefined {
            device: options.device,
        }
    }
}

/// Struct for "bring your own weights"
///
/// `weights_file` is a local `.safetensors` file or a PyTorch state dict
/// (`.bin`/`.pth`) laid out like the hub checkpoint of `model`. Loading it
/// never touches the network.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct UserDefinedImageEncoderModel {
    pub model: ImageEncoderModel,
    pub weights_file: PathBuf,
}

impl UserDefinedImageEncoderModel {
    pub fn new(model: ImageEncoderModel, weights_file: impl Into<PathBuf>) -> Self {
        Self {
            model,
            weights_file: weights_file.into(),
        }
    }
}

/// The network behind an [ImageEncoder], mapping `[B, 3, H, W]` to `[B, dim]`
pub enum EncoderModel {
    Vit(VisionTransformer),
    ResNet(ResNet),
}

impl Module for EncoderModel {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            EncoderModel::Vit(model) => model.forward(xs),
            EncoderModel::ResNet(model) => model.forward(xs),
        }
    }
}

/// Rust representation of an encoder: the model, its embedding width and
/// the preprocessing it expects.
pub struct ImageEncoder {
    pub(crate) model_name: ImageEncoderModel,
    pub(crate) model: EncoderModel,
    pub(crate) dim: usize,
    pub(crate) preprocessor: Compose,
    pub(crate) device: Device,
}
