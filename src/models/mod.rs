use crate::ModelInfo;

pub mod image_encoder;
pub mod model_info;
pub mod resnet;
pub mod vit;

pub trait ModelTrait {
    type Model;
    fn get_model_info(model: &Self::Model) -> Option<&ModelInfo<Self::Model>>;
}

#[cfg(test)]
pub(crate) mod fixtures;
