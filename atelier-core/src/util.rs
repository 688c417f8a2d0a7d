use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;

/// Converts a tensor with shape (3, height, width) into an RGB image.
pub(crate) fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
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

/// Converts an image into a (1, 3, height, width) tensor scaled to [-1, 1],
/// cropping/resizing to fill the target geometry.
pub(crate) fn image_to_tensor(
    img: &DynamicImage,
    width: usize,
    height: usize,
    device: &Device,
) -> Result<Tensor> {
    let img = img.resize_to_fill(width as u32, height as u32, FilterType::CatmullRom);
    let data = img.to_rgb8().into_raw();
    let tensor = Tensor::from_vec(data, (height, width, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    let tensor = ((tensor / 127.5)? - 1.0)?;
    Ok(tensor.unsqueeze(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn tensor_round_trips_to_image() {
        let device = Device::Cpu;
        let pixels: Vec<u8> = (0..3 * 4 * 2).map(|i| i as u8).collect();
        let tensor = Tensor::from_vec(pixels, (3, 4, 2), &device).unwrap();
        let image = tensor_to_image(&tensor).unwrap();
        assert_eq!(image.to_rgb8().dimensions(), (2, 4));
    }

    #[test]
    fn tensor_with_wrong_channels_is_rejected() {
        let device = Device::Cpu;
        let tensor = Tensor::zeros((4, 4, 4), DType::U8, &device).unwrap();
        assert!(tensor_to_image(&tensor).is_err());
    }

    #[test]
    fn image_maps_to_unit_range_tensor() {
        let device = Device::Cpu;
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([255, 0, 127])));
        let tensor = image_to_tensor(&image, 8, 8, &device).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 8, 8]);
        let flat = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let max = flat.iter().cloned().fold(f32::MIN, f32::max);
        let min = flat.iter().cloned().fold(f32::MAX, f32::min);
        assert!(max <= 1.0 && min >= -1.0);
    }
}
