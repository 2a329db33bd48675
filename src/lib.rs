//! patchembed - pretrained image encoders for pathology patches, selected by name.
//!
//! The library provides the [ImageEncoder] struct: a pretrained network, the width of
//! the embeddings it produces, and the preprocessing its inputs need.
//!
//! ### Resolving an encoder by name
//! ```
//! use patchembed::{EncoderError, ImageEncoderModel};
//!
//! let model: ImageEncoderModel = "kaiko-vitb8".parse()?;
//! assert_eq!(model, ImageEncoderModel::KaikoVitB8);
//!
//! let err = "resnet99".parse::<ImageEncoderModel>().unwrap_err();
//! assert_eq!(err, EncoderError::NotImplemented("resnet99".into()));
//! # Ok::<(), EncoderError>(())
//! ```
//!
//! ### Loading an encoder
//! ```no_run
//! use patchembed::{ImageEncoder, ImageEncoderInitOptions, ImageEncoderModel, TransformData};
//!
//!# fn model_demo() -> anyhow::Result<()> {
//! // The (model, embedding dimension, preprocessing) triple
//! let (model, dim, preprocess) = patchembed::from_name("resnet50")?;
//! assert_eq!(dim, 2048);
//!
//! // With custom options
//! let encoder = ImageEncoder::try_new(
//!     ImageEncoderInitOptions::new(ImageEncoderModel::KaikoVitS16)
//!         .with_cache_dir("weights".into())
//!         .with_show_download_progress(false),
//! )?;
//!
//! let patch = image::open("patch_0.png")?;
//! let array = encoder.preprocess(TransformData::Image(patch))?;
//! let embedding = encoder.forward(&encoder.pixel_values(&array)?)?;
//! assert_eq!(embedding.dims(), &[1, encoder.dim()]);
//! # Ok(())
//! # }
//! ```
//!
//! Weights are fetched from the Hugging Face Hub into `cache_dir` (default
//! `$PATCHEMBED_CACHE_DIR`, else `.patchembed_cache`). Without the `hf-hub` feature,
//! or offline, use [ImageEncoder::try_new_from_user_defined] with a local checkpoint.

mod common;
mod image_encoder;
mod models;

pub use crate::common::{
    get_cache_dir, EncoderError, Error, CACHE_DIR_ENV, DEFAULT_CACHE_DIR,
};
pub use crate::image_encoder::utils::{
    CenterCrop, Compose, Identity, Normalize, ResizeShorter, ToDtype, ToImage, Transform,
    TransformData,
};
pub use crate::image_encoder::{
    EncoderModel, ImageEncoder, ImageEncoderInitOptions, ImageEncoderInitOptionsUserDefined,
    UserDefinedImageEncoderModel,
};
pub use crate::models::image_encoder::{kaiko_dim, ImageEncoderModel, KAIKO_VARIANTS};
pub use crate::models::model_info::ModelInfo;
pub use crate::models::resnet::{BlockKind, ClassifierHead, ResNet, ResNetConfig};
pub use crate::models::vit::{resample_pos_embed, VisionTransformer, VitConfig};
pub use crate::models::ModelTrait;

/// Load the encoder called `name` and return `(model, embedding dimension, preprocessing)`.
///
/// Fails with an [EncoderError] for names outside the supported families, before any
/// weights are fetched.
#[cfg(feature = "hf-hub")]
pub fn from_name(name: &str) -> anyhow::Result<(EncoderModel, usize, Compose)> {
    ImageEncoder::from_name(name).map(ImageEncoder::into_parts)
}
