//! Image decoding and conversion into network input.

use image::imageops::{self, FilterType};
use image::{ImageReader, RgbImage};
use ndarray::Array3;
use std::path::Path;

use crate::error::{ClassifierError, Result};

/// ImageNet channel statistics the backbone was pretrained with.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Decodes an image file as RGB. The format is sniffed from the content,
/// so the extension of the spooled upload does not matter.
pub fn load_rgb(path: impl AsRef<Path>) -> Result<RgbImage> {
    let path = path.as_ref();
    let reader = ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| ClassifierError::io(path, e))?;
    let decoded = reader.decode().map_err(ClassifierError::ImageDecode)?;
    Ok(decoded.to_rgb8())
}

/// Bilinear resize to `size x size`, scaled to `[0, 1]` and normalised per
/// channel. Layout `[3, size, size]`.
pub fn to_input_tensor(image: &RgbImage, size: u32) -> Array3<f32> {
    let resized = imageops::resize(image, size, size, FilterType::Triangle);
    let side = size as usize;
    Array3::from_shape_fn((3, side, side), |(c, y, x)| {
        let value = resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
        (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c]
    })
}

/// Bicubic resize to `size x size` with values in `[0, 1]`, layout
/// `[size, size, 3]`. Used as the base layer of the Grad-CAM overlay.
pub fn to_unit_rgb(image: &RgbImage, size: u32) -> Array3<f32> {
    let resized = imageops::resize(image, size, size, FilterType::CatmullRom);
    let side = size as usize;
    Array3::from_shape_fn((side, side, 3), |(y, x, c)| {
        resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::Rgb;
    use std::io::Write;
    use tempfile::Builder;

    fn solid(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb(color))
    }

    #[test]
    fn test_input_tensor_normalisation() {
        let tensor = to_input_tensor(&solid(40, 30, [255, 0, 128]), 16);
        assert_eq!(tensor.dim(), (3, 16, 16));
        assert_abs_diff_eq!(tensor[[0, 5, 5]], (1.0 - 0.485) / 0.229, epsilon = 1e-5);
        assert_abs_diff_eq!(tensor[[1, 0, 15]], -0.456 / 0.224, epsilon = 1e-5);
        assert_abs_diff_eq!(
            tensor[[2, 15, 0]],
            (128.0 / 255.0 - 0.406) / 0.225,
            epsilon = 1e-5
        );
    }

    #[test]
    fn test_unit_rgb_range_and_layout() {
        let rgb = to_unit_rgb(&solid(10, 20, [0, 51, 255]), 8);
        assert_eq!(rgb.dim(), (8, 8, 3));
        assert_abs_diff_eq!(rgb[[3, 4, 1]], 0.2, epsilon = 1e-6);
        assert!(rgb.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_png_bytes_under_jpg_suffix_still_decode() {
        let mut png = Vec::new();
        solid(4, 4, [10, 20, 30])
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let mut file = Builder::new().suffix(".jpg").tempfile().unwrap();
        file.write_all(&png).unwrap();

        let decoded = load_rgb(file.path()).unwrap();
        assert_eq!(decoded.dimensions(), (4, 4));
        assert_eq!(decoded.get_pixel(0, 0), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let mut file = Builder::new().suffix(".jpg").tempfile().unwrap();
        file.write_all(b"definitely not an image").unwrap();
        let err = load_rgb(file.path()).unwrap_err();
        assert!(err.is_client_error());
    }
}
