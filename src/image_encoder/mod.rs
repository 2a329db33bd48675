use crate::models::image_encoder::ImageEncoderModel;
const DEFAULT_ENCODER_MODEL: ImageEncoderModel = ImageEncoderModel::KaikoVitS16;

pub mod utils;

mod init;
pub use init::*;

mod r#impl;
