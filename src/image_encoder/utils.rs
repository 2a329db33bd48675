use anyhow::anyhow;
use image::{imageops::FilterType, DynamicImage, GenericImageView, RgbImage};
use ndarray::{Array, Array3};
use std::ops::{Div, Sub};

use crate::EncoderError;

/// Value flowing through a [Compose] pipeline.
///
/// Arrays are `[C, H, W]`. Until [ToDtype] rescales them they hold raw pixel
/// values in `[0, 255]`.
pub enum TransformData {
    Image(DynamicImage),
    NdArray(Array3<f32>),
}

impl TransformData {
    pub fn image(self) -> anyhow::Result<DynamicImage> {
        match self {
            TransformData::Image(img) => Ok(img),
            _ => Err(anyhow!("TransformData convert error: expected an image")),
        }
    }

    pub fn array(self) -> anyhow::Result<Array3<f32>> {
        match self {
            TransformData::NdArray(array) => Ok(array),
            _ => Err(anyhow!("TransformData convert error: expected a tensor")),
        }
    }
}

pub trait Transform: Send + Sync {
    fn transform(&self, data: TransformData) -> anyhow::Result<TransformData>;
}

/// whc -> chw, raw pixel values
pub(crate) fn image_to_array(image: &DynamicImage) -> Array3<f32> {
    let image = image.to_rgb8();
    let (width, height) = image.dimensions();
    let mut pixels_array = Array3::zeros((3usize, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        pixels_array[[0, y as usize, x as usize]] = pixel[0] as f32;
        pixels_array[[1, y as usize, x as usize]] = pixel[1] as f32;
        pixels_array[[2, y as usize, x as usize]] = pixel[2] as f32;
    }
    pixels_array
}

/// Converts the input to an RGB image. Arrays must be `[3, H, W]` in `[0, 255]`.
pub struct ToImage;

impl Transform for ToImage {
    fn transform(&self, data: TransformData) -> anyhow::Result<TransformData> {
        let image = match data {
            TransformData::Image(image) => image.into_rgb8(),
            TransformData::NdArray(array) => {
                let (c, h, w) = array.dim();
                if c != 3 {
                    return Err(EncoderError::ShapeMismatch {
                        expected: vec![3, h, w],
                        actual: vec![c, h, w],
                    }
                    .into());
                }
                RgbImage::from_fn(w as u32, h as u32, |x, y| {
                    let (x, y) = (x as usize, y as usize);
                    image::Rgb([0, 1, 2].map(|ch| array[[ch, y, x]].round().clamp(0.0, 255.0) as u8))
                })
            }
        };
        Ok(TransformData::Image(image.into()))
    }
}

/// Resizes so the shorter side equals `size`, keeping the aspect ratio.
pub struct ResizeShorter {
    pub size: u32,
    pub resample: FilterType,
}

impl ResizeShorter {
    /// Output `(width, height)` for an input of `(width, height)`. Empty inputs are an error.
    pub fn output_size(&self, width: u32, height: u32) -> anyhow::Result<(u32, u32)> {
        if width == 0 || height == 0 {
            return Err(anyhow!("cannot resize an empty {width}x{height} image"));
        }
        let scaled = |long: u32, short: u32| (self.size as u64 * long as u64 / short as u64) as u32;
        if width <= height {
            Ok((self.size, scaled(height, width)))
        } else {
            Ok((scaled(width, height), self.size))
        }
    }
}

impl Transform for ResizeShorter {
    fn transform(&self, data: TransformData) -> anyhow::Result<TransformData> {
        let image = data.image()?;
        let (width, height) = image.dimensions();
        let (new_width, new_height) = self.output_size(width, height)?;
        if (new_width, new_height) == (width, height) {
            return Ok(TransformData::Image(image));
        }
        let image = image.resize_exact(new_width, new_height, self.resample);
        Ok(TransformData::Image(image))
    }
}

/// Crops the center `(width, height)` region, zero padding when the image is smaller.
pub struct CenterCrop {
    pub size: (u32, u32),
}

/// Leading margin when cropping `crop` out of `origin`, half the excess rounded to even
fn crop_offset(origin: u32, crop: u32) -> u32 {
    (origin.saturating_sub(crop) as f64 / 2.0).round_ties_even() as u32
}

impl Transform for CenterCrop {
    fn transform(&self, data: TransformData) -> anyhow::Result<TransformData> {
        let mut image = data.image()?;
        let (mut origin_width, mut origin_height) = image.dimensions();
        let (crop_width, crop_height) = self.size;
        if origin_width >= crop_width && origin_height >= crop_height {
            // cropped area is within image boundaries
            let x = crop_offset(origin_width, crop_width);
            let y = crop_offset(origin_height, crop_height);
            let image = image.crop_imm(x, y, crop_width, crop_height);
            return Ok(TransformData::Image(image));
        }

        if origin_width > crop_width || origin_height > crop_height {
            let (new_width, new_height) =
                (origin_width.min(crop_width), origin_height.min(crop_height));
            let x = crop_offset(origin_width, crop_width);
            let y = crop_offset(origin_height, crop_height);
            image = image.crop_imm(x, y, new_width, new_height);
            (origin_width, origin_height) = image.dimensions();
        }
        let mut pixels_array = Array3::zeros((3usize, crop_height as usize, crop_width as usize));
        let offset_x = (crop_width - origin_width) / 2;
        let offset_y = (crop_height - origin_height) / 2;
        // whc -> chw
        for (x, y, pixel) in image.to_rgb8().enumerate_pixels() {
            let (row, col) = ((y + offset_y) as usize, (x + offset_x) as usize);
            pixels_array[[0, row, col]] = pixel[0] as f32;
            pixels_array[[1, row, col]] = pixel[1] as f32;
            pixels_array[[2, row, col]] = pixel[2] as f32;
        }
        Ok(TransformData::NdArray(pixels_array))
    }
}

/// Converts to an `f32` array, dividing by 255 when `scale` is set.
pub struct ToDtype {
    pub scale: bool,
}

impl Transform for ToDtype {
    fn transform(&self, data: TransformData) -> anyhow::Result<TransformData> {
        let array = match data {
            TransformData::Image(image) => image_to_array(&image),
            TransformData::NdArray(array) => array,
        };
        let array = if self.scale {
            array * (1.0 / 255.0)
        } else {
            array
        };
        Ok(TransformData::NdArray(array))
    }
}

/// Channel-wise `(x - mean) / std` on a `[C, H, W]` array.
pub struct Normalize {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Transform for Normalize {
    fn transform(&self, data: TransformData) -> anyhow::Result<TransformData> {
        let array = data.array()?;
        let (c, h, w) = array.dim();
        if self.mean.len() != c || self.std.len() != c {
            return Err(EncoderError::ShapeMismatch {
                expected: vec![self.mean.len(), h, w],
                actual: vec![c, h, w],
            }
            .into());
        }
        let mean = Array::from_vec(self.mean.clone()).into_shape_with_order((c, 1, 1))?;
        let std = Array::from_vec(self.std.clone()).into_shape_with_order((c, 1, 1))?;

        let array_normalized = array.sub(&mean).div(&std);
        Ok(TransformData::NdArray(array_normalized))
    }
}

/// Returns its input unchanged
pub struct Identity;

impl Transform for Identity {
    fn transform(&self, data: TransformData) -> anyhow::Result<TransformData> {
        Ok(data)
    }
}

pub struct Compose {
    transforms: Vec<Box<dyn Transform>>,
}

impl Compose {
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        Self { transforms }
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl Transform for Compose {
    fn transform(&self, mut data: TransformData) -> anyhow::Result<TransformData> {
        for transform in &self.transforms {
            data = transform.transform(data)?;
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
        .into()
    }

    #[test]
    fn resize_keeps_aspect_ratio() {
        let resize = ResizeShorter {
            size: 224,
            resample: FilterType::Triangle,
        };
        assert_eq!(resize.output_size(448, 300).unwrap(), (334, 224));
        assert_eq!(resize.output_size(100, 400).unwrap(), (224, 896));
        assert_eq!(resize.output_size(224, 224).unwrap(), (224, 224));
    }

    #[test]
    fn resize_rejects_empty_inputs() {
        let resize = ResizeShorter {
            size: 224,
            resample: FilterType::Triangle,
        };
        assert!(resize.output_size(0, 10).is_err());
        assert!(resize.output_size(10, 0).is_err());
        assert!(resize
            .transform(TransformData::Image(RgbImage::new(0, 10).into()))
            .is_err());

        // an empty array passes ToImage and stops at the resize
        let compose = Compose::new(vec![Box::new(ToImage), Box::new(resize)]);
        assert!(compose
            .transform(TransformData::NdArray(Array3::zeros((3, 0, 16))))
            .is_err());
    }

    #[test]
    fn center_crop_pads_small_images() {
        let crop = CenterCrop { size: (4, 4) };
        let data = crop
            .transform(TransformData::Image(gradient(2, 6)))
            .unwrap()
            .array()
            .unwrap();
        assert_eq!(data.dim(), (3, 4, 4));
        // left/right columns are padding
        assert_eq!(data[[0, 0, 0]], 0.0);
        assert_eq!(data[[0, 0, 3]], 0.0);
        // the kept rows are 1..5 of the source
        assert_eq!(data[[1, 0, 1]], 1.0);
    }

    #[test]
    fn center_crop_large_images() {
        let crop = CenterCrop { size: (4, 2) };
        let image = crop
            .transform(TransformData::Image(gradient(10, 10)))
            .unwrap()
            .image()
            .unwrap();
        assert_eq!(image.dimensions(), (4, 2));
        assert_eq!(image.to_rgb8().get_pixel(0, 0)[0], 3);
        assert_eq!(image.to_rgb8().get_pixel(0, 0)[1], 4);
    }

    #[test]
    fn center_crop_rounds_odd_margins_to_even() {
        assert_eq!(crop_offset(227, 224), 2);
        assert_eq!(crop_offset(229, 224), 2);
        assert_eq!(crop_offset(226, 224), 1);
        assert_eq!(crop_offset(100, 224), 0);

        // 3 spare columns: the crop starts at column 2
        let crop = CenterCrop { size: (4, 4) };
        let image = crop
            .transform(TransformData::Image(gradient(7, 4)))
            .unwrap()
            .image()
            .unwrap();
        assert_eq!(image.to_rgb8().get_pixel(0, 0)[0], 2);
    }

    #[test]
    fn to_image_round_trips_arrays() {
        let array = image_to_array(&gradient(5, 3));
        let image = ToImage
            .transform(TransformData::NdArray(array.clone()))
            .unwrap()
            .image()
            .unwrap();
        assert_eq!(image_to_array(&image), array);
    }

    #[test]
    fn to_dtype_scales() {
        let array = ToDtype { scale: true }
            .transform(TransformData::Image(gradient(255, 1)))
            .unwrap()
            .array()
            .unwrap();
        assert_eq!(array[[0, 0, 0]], 0.0);
        assert!((array[[0, 0, 254]] - 254.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_rejects_wrong_channels() {
        let normalize = Normalize {
            mean: vec![0.5; 3],
            std: vec![0.5; 3],
        };
        let err = normalize
            .transform(TransformData::NdArray(Array3::zeros((1, 2, 2))))
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<EncoderError>(),
            Some(EncoderError::ShapeMismatch { .. })
        ));
        assert!(normalize
            .transform(TransformData::Image(gradient(2, 2)))
            .is_err());
    }

    #[test]
    fn compose_applies_in_order() {
        let compose = Compose::new(vec![
            Box::new(ToDtype { scale: false }),
            Box::new(Normalize {
                mean: vec![1.0; 3],
                std: vec![2.0; 3],
            }),
        ]);
        let array = compose
            .transform(TransformData::Image(gradient(3, 1)))
            .unwrap()
            .array()
            .unwrap();
        // pixel (2, 0): r = 2 -> (2 - 1) / 2
        assert_eq!(array[[0, 0, 2]], 0.5);
    }
}
