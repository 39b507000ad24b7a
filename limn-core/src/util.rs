use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::DynamicImage;
use tracing::warn;

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            warn!(
                "no accelerator available, running on CPU; build with `--features cuda` or `--features metal`"
            );
            Ok(Device::Cpu)
        }
    }
}

/// Weights load in f16 on an accelerator and f32 on the CPU.
pub fn model_dtype(device: &Device) -> DType {
    match device {
        Device::Cpu => DType::F32,
        _ => DType::F16,
    }
}

/// Converts a tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Converts a conditioning image into a (1, 3, height, width) tensor scaled
/// to [0, 1], resized to the generation resolution.
pub fn image_to_cond_tensor(
    img: &DynamicImage,
    width: usize,
    height: usize,
    device: &Device,
) -> Result<Tensor> {
    let img = img
        .resize_exact(width as u32, height as u32, image::imageops::FilterType::Triangle)
        .to_rgb8();
    let data = img.into_raw();
    let tensor = Tensor::from_vec(data, (height, width, 3), device)?
        .permute((2, 0, 1))?
        .unsqueeze(0)?
        .to_dtype(DType::F32)?;
    Ok((tensor / 255.)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_to_image_keeps_dimensions() {
        let device = Device::Cpu;
        let pixels: Vec<u8> = (0..4 * 6 * 3).map(|v| v as u8).collect();
        let tensor = Tensor::from_vec(pixels, (3, 4, 6), &device).unwrap();
        let img = tensor_to_image(&tensor).unwrap();
        assert_eq!((img.width(), img.height()), (6, 4));
    }

    #[test]
    fn tensor_to_image_rejects_bad_channel_count() {
        let device = Device::Cpu;
        let tensor = Tensor::zeros((4, 2, 2), DType::U8, &device).unwrap();
        assert!(tensor_to_image(&tensor).is_err());
    }

    #[test]
    fn cond_tensor_has_unit_range_and_cfg_shape() {
        let img =
            DynamicImage::ImageRgb8(image::RgbImage::from_pixel(10, 20, image::Rgb([255, 0, 128])));
        let device = Device::Cpu;
        let tensor = image_to_cond_tensor(&img, 64, 64, &device).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 64, 64]);
        let max = tensor
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(max <= 1.0);
    }
}
