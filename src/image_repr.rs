//! Pixel-space image representation handed to image encoders

use candle_core::{DType, Device, Result, Tensor};
use image::{imageops::FilterType, RgbImage};

/// An RGB image stored as a `(3, height, width)` tensor with values in
/// `[0, 1]`.
#[derive(Debug, Clone)]
pub struct PixelImage {
    width: u32,
    height: u32,
    pixels: Tensor,
}

impl PixelImage {
    /// A black image of the given size.
    pub fn new(width: u32, height: u32, device: &Device) -> Result<Self> {
        let pixels = Tensor::zeros((3, height as usize, width as usize), DType::F32, device)?;
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn device(&self) -> &Device {
        self.pixels.device()
    }

    /// The `(3, height, width)` pixel tensor
    pub fn tensor(&self) -> &Tensor {
        &self.pixels
    }

    /// Replace the pixel data with `img`, resampling it to this
    /// representation's size when the dimensions differ.
    pub fn encode_image(&mut self, img: &RgbImage) -> Result<()> {
        let resized;
        let img = if img.dimensions() == (self.width, self.height) {
            img
        } else {
            resized = image::imageops::resize(img, self.width, self.height, FilterType::Lanczos3);
            &resized
        };

        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = Vec::with_capacity(3 * w * h);

        // HWC bytes to CHW floats
        for c in 0..3 {
            for pixel in img.pixels() {
                data.push(pixel[c] as f32 / 255.0);
            }
        }

        self.pixels = Tensor::from_vec(data, (3, h, w), self.pixels.device())?;
        Ok(())
    }

    /// Convert back to an 8-bit RGB image.
    pub fn decode_image(&self) -> Result<RgbImage> {
        let (w, h) = (self.width as usize, self.height as usize);
        let values = self
            .pixels
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        let plane = w * h;
        let mut bytes = Vec::with_capacity(3 * plane);
        for i in 0..plane {
            for c in 0..3 {
                let v = values[c * plane + i].clamp(0.0, 1.0);
                bytes.push((v * 255.0).round() as u8);
            }
        }

        RgbImage::from_raw(self.width, self.height, bytes)
            .ok_or_else(|| candle_core::Error::Msg("pixel buffer has the wrong length".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn checker(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([255, 0, 51])
            } else {
                Rgb([0, 102, 255])
            }
        })
    }

    #[test]
    fn test_new_is_black() {
        let img = PixelImage::new(4, 2, &Device::Cpu).unwrap();
        assert_eq!(img.tensor().dims(), &[3, 2, 4]);
        let sum: f32 = img.tensor().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
    }

    #[test]
    fn test_encode_layout_is_channel_first() {
        let mut img = PixelImage::new(2, 1, &Device::Cpu).unwrap();
        let src = RgbImage::from_raw(2, 1, vec![255, 0, 0, 0, 0, 255]).unwrap();
        img.encode_image(&src).unwrap();

        let t = img.tensor().to_vec3::<f32>().unwrap();
        assert_eq!(t[0][0], vec![1.0, 0.0]); // red
        assert_eq!(t[1][0], vec![0.0, 0.0]); // green
        assert_eq!(t[2][0], vec![0.0, 1.0]); // blue
    }

    #[test]
    fn test_encode_decode_preserves_pixels() {
        let src = checker(5, 3);
        let mut img = PixelImage::new(5, 3, &Device::Cpu).unwrap();
        img.encode_image(&src).unwrap();
        assert_eq!(img.decode_image().unwrap(), src);
    }

    #[test]
    fn test_encode_resamples_to_representation_size() {
        let mut img = PixelImage::new(8, 8, &Device::Cpu).unwrap();
        img.encode_image(&checker(16, 4)).unwrap();
        assert_eq!(img.tensor().dims(), &[3, 8, 8]);
        assert_eq!(img.decode_image().unwrap().dimensions(), (8, 8));
    }
}
