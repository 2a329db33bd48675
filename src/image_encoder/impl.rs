#[cfg(feature = "hf-hub")]
use hf_hub::{
    api::sync::{ApiBuilder, ApiRepo},
    Cache,
};
#[cfg(feature = "hf-hub")]
use std::path::PathBuf;
use std::path::Path;

use anyhow::{anyhow, Context};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Module, VarBuilder};
use image::imageops::FilterType;
use ndarray::Array3;

use crate::{
    models::{
        image_encoder::models_list,
        resnet::ResNetConfig,
        vit::VitConfig,
        ModelTrait,
    },
    EncoderError, ImageEncoderModel, ModelInfo, ResNet, VisionTransformer,
};

#[cfg(feature = "hf-hub")]
use super::ImageEncoderInitOptions;
use super::{
    init::{EncoderModel, ImageEncoderInitOptionsUserDefined, UserDefinedImageEncoderModel},
    utils::{
        CenterCrop, Compose, Identity, Normalize, ResizeShorter, ToDtype, ToImage, Transform,
        TransformData,
    },
    ImageEncoder,
};

const UNI_MEAN: [f32; 3] = [0.4850, 0.4560, 0.4060];
const UNI_STD: [f32; 3] = [0.2290, 0.2240, 0.2250];
const KAIKO_SIZE: u32 = 224;

enum Architecture {
    Vit(VitConfig),
    ResNet(ResNetConfig),
}

fn architecture(model: &ImageEncoderModel) -> Result<Architecture, EncoderError> {
    match model {
        ImageEncoderModel::Uni => Ok(Architecture::Vit(VitConfig::uni())),
        ImageEncoderModel::Resnet50 => Ok(Architecture::ResNet(ResNetConfig::resnet50())),
        ImageEncoderModel::Resnet18 => Ok(Architecture::ResNet(ResNetConfig::resnet18())),
        ImageEncoderModel::KaikoVitS16
        | ImageEncoderModel::KaikoVitS8
        | ImageEncoderModel::KaikoVitB16
        | ImageEncoderModel::KaikoVitB8
        | ImageEncoderModel::KaikoVitL14 => {
            let variant = model.kaiko_variant().unwrap_or_default();
            VitConfig::kaiko(variant)
                .map(Architecture::Vit)
                .ok_or_else(|| EncoderError::UnknownVariant(variant.to_string()))
        }
    }
}

impl ImageEncoder {
    /// Resolve `name` and load the encoder with default options.
    ///
    /// The name is validated before any download starts, so an unknown name
    /// fails with an [EncoderError] without network access.
    #[cfg(feature = "hf-hub")]
    pub fn from_name(name: &str) -> anyhow::Result<Self> {
        let model_name: ImageEncoderModel = name.parse()?;
        Self::try_new(ImageEncoderInitOptions::new(model_name))
    }

    /// Try to generate a new ImageEncoder Instance
    ///
    /// Downloads the weights into `cache_dir` on first use
    #[cfg(feature = "hf-hub")]
    pub fn try_new(options: ImageEncoderInitOptions) -> anyhow::Result<Self> {
        let ImageEncoderInitOptions {
            model_name,
            cache_dir,
            show_download_progress,
            device,
        } = options;

        let model_repo =
            ImageEncoder::retrieve_model(model_name, cache_dir, show_download_progress)?;

        let model_file_name = ImageEncoder::get_model_info(&model_name).model_file;
        let weights_file = model_repo
            .get(&model_file_name)
            .context(format!("Failed to retrieve {}", model_file_name))?;

        let vb = load_weights(&weights_file, &device)?;
        ImageEncoder::from_var_builder(model_name, vb, device)
    }

    /// Create an ImageEncoder from weights already on disk.
    ///
    /// This can be used for offline environments and 'bring your own' checkpoints
    pub fn try_new_from_user_defined(
        model: UserDefinedImageEncoderModel,
        options: ImageEncoderInitOptionsUserDefined,
    ) -> anyhow::Result<Self> {
        let ImageEncoderInitOptionsUserDefined { device } = options;
        let vb = load_weights(&model.weights_file, &device)?;
        ImageEncoder::from_var_builder(model.model, vb, device)
    }

    /// Build the encoder for `model_name` from an already constructed VarBuilder
    pub fn from_var_builder(
        model_name: ImageEncoderModel,
        vb: VarBuilder,
        device: Device,
    ) -> anyhow::Result<Self> {
        tracing::debug!(model = %model_name, "building image encoder");
        let (model, dim) = match architecture(&model_name)? {
            Architecture::Vit(config) => {
                let vit = VisionTransformer::new(&config, vb)
                    .with_context(|| format!("Failed to load {model_name} weights"))?;
                let dim = vit.num_features();
                (EncoderModel::Vit(vit), dim)
            }
            Architecture::ResNet(config) => {
                let mut resnet = ResNet::new(&config, vb)
                    .with_context(|| format!("Failed to load {model_name} weights"))?;
                // pooled features instead of class logits
                let dim = resnet.reset_classifier();
                (EncoderModel::ResNet(resnet), dim)
            }
        };

        tracing::info!(model = %model_name, dim, "image encoder loaded");
        Ok(Self {
            model_name,
            model,
            dim,
            preprocessor: ImageEncoder::preprocessor_for(&model_name),
            device,
        })
    }

    /// Return the model's repository from cache or remote retrieval
    #[cfg(feature = "hf-hub")]
    fn retrieve_model(
        model: ImageEncoderModel,
        cache_dir: PathBuf,
        show_download_progress: bool,
    ) -> anyhow::Result<ApiRepo> {
        let cache = Cache::new(cache_dir);
        let mut builder = ApiBuilder::from_cache(cache).with_progress(show_download_progress);
        // UNI is a gated repository
        if let Ok(token) = std::env::var("HF_TOKEN") {
            builder = builder.with_token(Some(token));
        }
        let api = builder.build()?;

        let repo = api.model(ImageEncoder::get_model_info(&model).model_code);
        Ok(repo)
    }

    /// The preprocessing an encoder expects, without loading the encoder
    pub fn preprocessor_for(model: &ImageEncoderModel) -> Compose {
        match model {
            // resize and crop happen upstream
            ImageEncoderModel::Uni => Compose::new(vec![Box::new(Normalize {
                mean: UNI_MEAN.to_vec(),
                std: UNI_STD.to_vec(),
            })]),
            ImageEncoderModel::Resnet50 | ImageEncoderModel::Resnet18 => {
                Compose::new(vec![Box::new(Identity)])
            }
            _ => Compose::new(vec![
                Box::new(ToImage),
                Box::new(ResizeShorter {
                    size: KAIKO_SIZE,
                    resample: FilterType::Triangle,
                }),
                Box::new(CenterCrop {
                    size: (KAIKO_SIZE, KAIKO_SIZE),
                }),
                Box::new(ToDtype { scale: true }),
                Box::new(Normalize {
                    mean: vec![0.5; 3],
                    std: vec![0.5; 3],
                }),
            ]),
        }
    }

    /// Retrieve a list of supported models
    pub fn list_supported_models() -> Vec<ModelInfo<ImageEncoderModel>> {
        models_list()
    }

    /// Get ModelInfo from ImageEncoderModel
    pub fn get_model_info(model: &ImageEncoderModel) -> ModelInfo<ImageEncoderModel> {
        ImageEncoderModel::get_model_info(model)
            .cloned()
            .expect("Model not found.")
    }

    pub fn model_name(&self) -> ImageEncoderModel {
        self.model_name
    }

    pub fn model(&self) -> &EncoderModel {
        &self.model
    }

    /// Width of the embeddings the model returns
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn preprocessor(&self) -> &Compose {
        &self.preprocessor
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Split into `(model, embedding dimension, preprocessing)`
    pub fn into_parts(self) -> (EncoderModel, usize, Compose) {
        (self.model, self.dim, self.preprocessor)
    }

    /// Apply the preprocessing to one input, returning the `[3, H, W]` model input
    pub fn preprocess(&self, data: TransformData) -> anyhow::Result<Array3<f32>> {
        match self.preprocessor.transform(data)? {
            TransformData::NdArray(array) => Ok(array),
            _ => Err(anyhow!("Preprocessor configuration error!")),
        }
    }

    /// Run the model on a `[B, 3, H, W]` tensor
    pub fn forward(&self, pixel_values: &Tensor) -> anyhow::Result<Tensor> {
        Ok(self.model.forward(pixel_values)?)
    }

    /// A preprocessed `[3, H, W]` array as a `[1, 3, H, W]` tensor on the encoder's device
    pub fn pixel_values(&self, array: &Array3<f32>) -> anyhow::Result<Tensor> {
        let (c, h, w) = array.dim();
        let data: Vec<f32> = array.iter().copied().collect();
        Ok(Tensor::from_vec(data, (1, c, h, w), &self.device)?)
    }
}

/// Open a weight file as a VarBuilder, by extension: safetensors or a PyTorch pickle
fn load_weights(path: &Path, device: &Device) -> anyhow::Result<VarBuilder<'static>> {
    let is_safetensors = path
        .extension()
        .is_some_and(|extension| extension == "safetensors");
    let vb = if is_safetensors {
        // SAFETY: the file is not modified while mapped
        unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device) }
    } else {
        VarBuilder::from_pth(path, DType::F32, device)
    };
    vb.with_context(|| format!("Failed to read weights from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};
    use ndarray::Array3;

    fn preprocessor(name: &str) -> Compose {
        ImageEncoder::preprocessor_for(&name.parse().unwrap())
    }

    #[test]
    fn uni_normalizes_channel_wise() {
        let input = Array3::from_shape_fn((3, 5, 7), |(c, y, x)| {
            ((c * 35 + y * 7 + x) % 17) as f32 / 16.0
        });
        let output = preprocessor("UNI")
            .transform(TransformData::NdArray(input.clone()))
            .unwrap()
            .array()
            .unwrap();
        assert_eq!(output.dim(), (3, 5, 7));

        for ((c, y, x), value) in output.indexed_iter() {
            let restored = value * UNI_STD[c] + UNI_MEAN[c];
            assert!((restored - input[[c, y, x]]).abs() < 1e-5);
        }
    }

    #[test]
    fn kaiko_output_is_224_square() {
        let compose = preprocessor("kaiko-vits16");
        for (width, height) in [(500, 300), (100, 900), (224, 224), (64, 64)] {
            let image: DynamicImage =
                RgbImage::from_pixel(width, height, image::Rgb([255, 0, 128])).into();
            let output = compose
                .transform(TransformData::Image(image))
                .unwrap()
                .array()
                .unwrap();
            assert_eq!(output.dim(), (3, 224, 224));
            // white -> 1, black -> -1 after mean/std 0.5
            assert!((output[[0, 112, 112]] - 1.0).abs() < 1e-5);
            assert!((output[[1, 112, 112]] + 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn resnet_preprocess_is_identity() {
        let input = Array3::from_shape_fn((3, 4, 4), |(c, y, x)| (c + y + x) as f32);
        for name in ["resnet18", "resnet50"] {
            let output = preprocessor(name)
                .transform(TransformData::NdArray(input.clone()))
                .unwrap()
                .array()
                .unwrap();
            assert_eq!(output, input);
        }
    }

    #[test]
    fn resnet18_from_zero_weights() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let encoder = ImageEncoder::from_var_builder(ImageEncoderModel::Resnet18, vb, device).unwrap();
        assert_eq!(encoder.dim(), 512);
        assert_eq!(encoder.dim(), ImageEncoder::get_model_info(&ImageEncoderModel::Resnet18).dim);

        let EncoderModel::ResNet(resnet) = encoder.model() else {
            panic!("resnet18 should build a ResNet");
        };
        let features = Tensor::rand(-1f32, 1f32, (1, 512), &Device::Cpu).unwrap();
        let passed = resnet.fc().forward(&features).unwrap();
        assert_eq!(passed.to_vec2::<f32>().unwrap(), features.to_vec2::<f32>().unwrap());

        let pixel_values = encoder.pixel_values(&Array3::<f32>::zeros((3, 32, 32))).unwrap();
        assert_eq!(pixel_values.dims(), &[1, 3, 32, 32]);
        let embedding = encoder.forward(&pixel_values).unwrap();
        assert_eq!(embedding.dims(), &[1, 512]);
    }

    #[test]
    fn every_model_has_its_own_architecture() {
        for info in ImageEncoder::list_supported_models() {
            match architecture(&info.model).unwrap() {
                Architecture::Vit(config) => assert_eq!(config.embed_dim, info.dim, "{}", info.model),
                Architecture::ResNet(_) => assert!(info.model.name().starts_with("resnet")),
            }
        }

        let Ok(Architecture::Vit(vitl14)) = architecture(&ImageEncoderModel::KaikoVitL14) else {
            panic!("kaiko-vitl14 should be a ViT");
        };
        assert_eq!((vitl14.patch_size, vitl14.reg_tokens), (14, 4));
        assert!(vitl14.no_embed_class);

        let Ok(Architecture::Vit(vits8)) = architecture(&ImageEncoderModel::KaikoVitS8) else {
            panic!("kaiko-vits8 should be a ViT");
        };
        assert_eq!((vits8.embed_dim, vits8.patch_size, vits8.reg_tokens), (384, 8, 0));
        assert_ne!(vits8, VitConfig::uni());
    }

    #[test]
    fn missing_weights_file_is_an_error() {
        let model = UserDefinedImageEncoderModel::new(
            ImageEncoderModel::Resnet18,
            "does/not/exist.safetensors",
        );
        let result = ImageEncoder::try_new_from_user_defined(model, Default::default());
        assert!(result.is_err());
    }
}
