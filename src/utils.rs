use burn::prelude::*;
use image::RgbImage;
use std::path::Path;

use crate::error::Result;

pub fn load_image<P: AsRef<Path>>(path: P) -> Result<RgbImage> {
    Ok(image::open(path)?.to_rgb8())
}

/// `[1, 3, H, W]` tensor with values scaled from `0..=255` to `[-1, 1]`.
pub fn image_to_tensor<B: Backend>(image: &RgbImage, device: &B::Device) -> Tensor<B, 4> {
    let (width, height) = image.dimensions();
    let (width, height) = (width as usize, height as usize);

    // HWC -> CHW
    let mut values = vec![0.0f32; 3 * height * width];
    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for channel in 0..3 {
            values[channel * height * width + y * width + x] =
                pixel.0[channel] as f32 / 127.5 - 1.0;
        }
    }

    Tensor::<B, 3>::from_data(TensorData::new(values, [3, height, width]), device).unsqueeze()
}
