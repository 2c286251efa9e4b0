use crate::error::ModelError;
use crate::model_config::PreprocessorConfig;
use image::{DynamicImage, GenericImageView, RgbImage};
use ndarray::{Array4, ArrayView4, Axis};

/// Largest accepted width or height of an upload.
pub const MAX_IMAGE_DIMENSION: u32 = 8192;

/// Largest longer edge allowed after the shorter-edge resize. Caps the
/// intermediate buffer of very elongated images at about 6 MiB.
pub const MAX_RESIZED_EDGE: u32 = 8192;

/// NCHW input for a single image: `[1, 3, crop_height, crop_width]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedTensor {
    data: Array4<f32>,
}

impl PreprocessedTensor {
    /// Wraps an existing batch-of-one RGB tensor.
    pub fn from_array(data: Array4<f32>) -> Result<Self, ModelError> {
        let shape = data.shape();
        if shape[0] != 1 || shape[1] != 3 {
            return Err(ModelError::InvalidImage(format!(
                "expected a [1, 3, H, W] tensor, got {:?}",
                shape
            )));
        }
        Ok(Self { data })
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// (height, width)
    pub fn spatial_size(&self) -> (usize, usize) {
        (self.data.shape()[2], self.data.shape()[3])
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    pub fn into_inner(self) -> Array4<f32> {
        self.data
    }

    pub fn channel_mean(&self, channel: usize) -> f32 {
        let plane = self.data.index_axis(Axis(0), 0);
        let plane = plane.index_axis(Axis(0), channel);
        plane.sum() / plane.len() as f32
    }

    /// Undoes the mean/std normalisation, giving the rescaled pixel values.
    pub fn denormalize(&self, config: &PreprocessorConfig) -> Array4<f32> {
        let mut out = self.data.clone();
        if config.do_normalize {
            for (c, mut plane) in out.axis_iter_mut(Axis(1)).enumerate() {
                let (mean, std) = (config.image_mean[c], config.image_std[c]);
                plane.mapv_inplace(|v| v * std + mean);
            }
        }
        out
    }
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ModelError> {
    if bytes.is_empty() {
        return Err(ModelError::InvalidImage("empty image payload".into()));
    }
    let image = image::load_from_memory(bytes)?;
    validate_dimensions(&image)?;
    Ok(image)
}

pub fn validate_dimensions(image: &DynamicImage) -> Result<(), ModelError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(ModelError::InvalidImage(format!(
            "image has no pixels ({}x{})",
            width, height
        )));
    }
    if width > MAX_IMAGE_DIMENSION || height > MAX_IMAGE_DIMENSION {
        return Err(ModelError::InvalidImage(format!(
            "image too large: {}x{}, maximum {}x{}",
            width, height, MAX_IMAGE_DIMENSION, MAX_IMAGE_DIMENSION
        )));
    }
    Ok(())
}

pub fn preprocess_bytes(
    bytes: &[u8],
    config: &PreprocessorConfig,
) -> Result<PreprocessedTensor, ModelError> {
    let image = decode_image(bytes)?;
    preprocess(&image, config)
}

/// Resize (shorter edge), center-crop, rescale and normalise one image.
pub fn preprocess(
    image: &DynamicImage,
    config: &PreprocessorConfig,
) -> Result<PreprocessedTensor, ModelError> {
    validate_dimensions(image)?;
    let (width, height) = image.dimensions();

    let resized_size = if config.do_resize {
        let size = shorter_edge_size(width, height, config.shortest_edge).ok_or_else(|| {
            ModelError::InvalidImage(format!(
                "aspect ratio of {}x{} is too extreme to resize to a {} shorter edge",
                width, height, config.shortest_edge
            ))
        })?;
        Some(size)
    } else {
        None
    };

    // Grayscale X-rays are replicated to three channels, alpha is dropped.
    let mut rgb_image: RgbImage = image.to_rgb8();

    if let Some((new_width, new_height)) = resized_size {
        if (new_width, new_height) != (width, height) {
            rgb_image = image::imageops::resize(
                &rgb_image,
                new_width,
                new_height,
                image::imageops::FilterType::Triangle,
            );
        }
    }

    let crop = config.crop_size;
    let (width, height) = rgb_image.dimensions();
    if width < crop.width || height < crop.height {
        return Err(ModelError::InvalidImage(format!(
            "image is {}x{}, smaller than the {}x{} crop",
            width, height, crop.width, crop.height
        )));
    }
    let left = center_offset(width, crop.width);
    let top = center_offset(height, crop.height);
    let cropped =
        image::imageops::crop_imm(&rgb_image, left, top, crop.width, crop.height).to_image();

    let mut array = Array4::<f32>::zeros((1, 3, crop.height as usize, crop.width as usize));
    for (x, y, pixel) in cropped.enumerate_pixels() {
        for c in 0..3 {
            let mut value = pixel[c] as f32;
            if config.do_rescale {
                value *= config.rescale_factor;
            }
            if config.do_normalize {
                value = (value - config.image_mean[c]) / config.image_std[c];
            }
            array[[0, c, y as usize, x as usize]] = value;
        }
    }

    Ok(PreprocessedTensor { data: array })
}

/// Output size when the shorter edge is scaled to `edge`; the longer edge is
/// truncated, as `torchvision.transforms.Resize(int)` does. `None` when the
/// longer edge would exceed [`MAX_RESIZED_EDGE`].
pub fn shorter_edge_size(width: u32, height: u32, edge: u32) -> Option<(u32, u32)> {
    let (long, short) = (width.max(height) as u64, width.min(height) as u64);
    if short == 0 {
        return None;
    }
    let scaled = edge as u64 * long / short;
    if scaled > MAX_RESIZED_EDGE as u64 {
        return None;
    }
    let scaled = scaled as u32;
    if width <= height {
        Some((edge, scaled))
    } else {
        Some((scaled, edge))
    }
}

/// Crop origin along one axis, rounding half to even like Python's `round`.
fn center_offset(dim: u32, crop: u32) -> u32 {
    ((dim - crop) as f64 / 2.0).round_ties_even() as u32
}
