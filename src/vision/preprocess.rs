//! Image preprocessing for OCR models
//!
//! Resizing, normalization and tensor layout for the PaddleOCR detection and
//! recognition models.

use image::RgbImage;
use ndarray::{Array3, Array4};

use super::Bounds;
use crate::config::OcrSettings;

/// Detection input sides must be multiples of this
const DET_STRIDE: usize = 32;

/// Preprocessing configuration
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// Longest side of the detection input (typically 640 or 960)
    pub det_target_size: u32,
    /// Target height for recognition model (typically 32 or 48)
    pub rec_target_height: u32,
    /// Maximum width for recognition input
    pub rec_max_width: u32,
    /// Mean values for normalization [R, G, B]
    pub mean: [f32; 3],
    /// Std values for normalization [R, G, B]
    pub std: [f32; 3],
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            det_target_size: 960,
            rec_target_height: 48,
            rec_max_width: 640,
            // PaddleOCR maps [0, 1] -> [-1, 1]
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
        }
    }
}

impl From<&OcrSettings> for PreprocessConfig {
    fn from(settings: &OcrSettings) -> Self {
        Self {
            det_target_size: settings.det_target_size,
            rec_target_height: settings.rec_target_height,
            rec_max_width: settings.rec_max_width,
            ..Default::default()
        }
    }
}

/// Convert an RGB image to an HWC f32 array in [0, 1]
pub fn rgb_to_f32(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn((height as usize, width as usize, 3), |(y, x, c)| {
        image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
}

/// Normalize image with mean and std
pub fn normalize(image: &Array3<f32>, mean: &[f32; 3], std: &[f32; 3]) -> Array3<f32> {
    let mut normalized = image.clone();
    for ((_, _, c), value) in normalized.indexed_iter_mut() {
        *value = (*value - mean[c]) / std[c];
    }
    normalized
}

/// Convert HWC image to NCHW tensor (batch size 1)
pub fn hwc_to_nchw(image: &Array3<f32>) -> Array4<f32> {
    let (h, w, c) = image.dim();
    Array4::from_shape_fn((1, c, h, w), |(_, ch, y, x)| image[[y, x, ch]])
}

/// Bilinear resize of `image` into the top-left `new_h x new_w` area of an
/// `out_h x out_w` zero canvas
fn resize_bilinear_into(
    image: &Array3<f32>,
    new_h: usize,
    new_w: usize,
    out_h: usize,
    out_w: usize,
) -> Array3<f32> {
    let (h, w, c) = image.dim();
    let mut resized = Array3::<f32>::zeros((out_h, out_w, c));
    if h == 0 || w == 0 || new_h == 0 || new_w == 0 {
        return resized;
    }

    let scale_y = h as f32 / new_h as f32;
    let scale_x = w as f32 / new_w as f32;

    for y in 0..new_h.min(out_h) {
        let src_y = (y as f32 * scale_y).min(h as f32 - 1.0);
        let y0 = src_y.floor() as usize;
        let y1 = (y0 + 1).min(h - 1);
        let fy = src_y - y0 as f32;

        for x in 0..new_w.min(out_w) {
            let src_x = (x as f32 * scale_x).min(w as f32 - 1.0);
            let x0 = src_x.floor() as usize;
            let x1 = (x0 + 1).min(w - 1);
            let fx = src_x - x0 as f32;

            for ch in 0..c {
                let v0 = image[[y0, x0, ch]] * (1.0 - fx) + image[[y0, x1, ch]] * fx;
                let v1 = image[[y1, x0, ch]] * (1.0 - fx) + image[[y1, x1, ch]] * fx;
                resized[[y, x, ch]] = v0 * (1.0 - fy) + v1 * fy;
            }
        }
    }

    resized
}

/// Resize so the longest side equals `target_size`, zero-padded to a multiple
/// of 32. Returns (resized_image, scale_factor)
pub fn resize_for_detection(image: &Array3<f32>, target_size: u32) -> (Array3<f32>, f32) {
    let (h, w, _) = image.dim();
    let longest = h.max(w).max(1) as f32;

    let scale = target_size as f32 / longest;
    let new_h = ((h as f32 * scale) as usize).max(1);
    let new_w = ((w as f32 * scale) as usize).max(1);

    let padded_h = new_h.div_ceil(DET_STRIDE) * DET_STRIDE;
    let padded_w = new_w.div_ceil(DET_STRIDE) * DET_STRIDE;

    (resize_bilinear_into(image, new_h, new_w, padded_h, padded_w), scale)
}

/// Resize image for recognition model (fixed height, variable width)
pub fn resize_for_recognition(
    image: &Array3<f32>,
    target_height: u32,
    max_width: u32,
) -> Array3<f32> {
    let (h, w, _) = image.dim();
    let scale = target_height as f32 / h.max(1) as f32;
    let new_w = ((w as f32 * scale).ceil() as u32).clamp(1, max_width.max(1)) as usize;
    let new_h = target_height as usize;

    resize_bilinear_into(image, new_h, new_w, new_h, new_w)
}

/// Crop an axis-aligned region, clamped to the image
pub fn crop_bounds(image: &Array3<f32>, bounds: Bounds) -> Array3<f32> {
    let (img_h, img_w, c) = image.dim();
    let (x, y, w, h) = (bounds.0 as usize, bounds.1 as usize, bounds.2 as usize, bounds.3 as usize);

    let x1 = x.min(img_w);
    let y1 = y.min(img_h);
    let x2 = (x + w).min(img_w);
    let y2 = (y + h).min(img_h);

    if x2 <= x1 || y2 <= y1 {
        return Array3::<f32>::zeros((1, 1, c));
    }

    image
        .slice(ndarray::s![y1..y2, x1..x2, ..])
        .to_owned()
}

/// Full preprocessing pipeline for detection.
/// Returns the NCHW tensor and the resize scale.
pub fn preprocess_for_detection(image: &RgbImage, config: &PreprocessConfig) -> (Array4<f32>, f32) {
    let rgb = rgb_to_f32(image);
    let (resized, scale) = resize_for_detection(&rgb, config.det_target_size);
    let normalized = normalize(&resized, &config.mean, &config.std);
    (hwc_to_nchw(&normalized), scale)
}

/// Full preprocessing pipeline for one recognition crop
pub fn preprocess_for_recognition(crop: &Array3<f32>, config: &PreprocessConfig) -> Array4<f32> {
    let resized = resize_for_recognition(crop, config.rec_target_height, config.rec_max_width);
    let normalized = normalize(&resized, &config.mean, &config.std);
    hwc_to_nchw(&normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_rgb_to_f32() {
        let mut img = RgbImage::new(2, 2);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 255, 0]));

        let rgb = rgb_to_f32(&img);

        assert_eq!(rgb.dim(), (2, 2, 3));
        assert!((rgb[[0, 0, 0]] - 1.0).abs() < 0.01);
        assert!(rgb[[0, 0, 1]].abs() < 0.01);
        assert!((rgb[[0, 1, 1]] - 1.0).abs() < 0.01);
        assert!(rgb[[1, 1, 2]].abs() < 0.01);
    }

    #[test]
    fn test_hwc_to_nchw() {
        let hwc =
            Array3::<f32>::from_shape_fn((10, 20, 3), |(h, w, c)| (h * 100 + w * 10 + c) as f32);

        let nchw = hwc_to_nchw(&hwc);

        assert_eq!(nchw.dim(), (1, 3, 10, 20));
        assert_eq!(nchw[[0, 1, 5, 10]], hwc[[5, 10, 1]]);
    }

    #[test]
    fn test_normalize() {
        let image = Array3::<f32>::from_elem((2, 2, 3), 0.5);
        let mean = [0.485, 0.456, 0.406];
        let std = [0.229, 0.224, 0.225];

        let normalized = normalize(&image, &mean, &std);

        assert!((normalized[[0, 0, 0]] - (0.5 - 0.485) / 0.229).abs() < 0.01);
        assert!((normalized[[1, 1, 2]] - (0.5 - 0.406) / 0.225).abs() < 0.01);
    }

    #[test]
    fn test_resize_for_detection_pads_to_stride() {
        let image = Array3::<f32>::from_elem((100, 200, 3), 1.0);
        let (resized, scale) = resize_for_detection(&image, 320);

        assert!((scale - 1.6).abs() < 1e-5);
        let (h, w, _) = resized.dim();
        assert_eq!(w, 320);
        assert_eq!(h, 160);
        assert_eq!(h % 32, 0);
    }

    #[test]
    fn test_resize_for_detection_padding_is_zero() {
        let image = Array3::<f32>::from_elem((10, 30, 3), 1.0);
        let (resized, _) = resize_for_detection(&image, 30);

        assert_eq!(resized.dim(), (32, 32, 3));
        assert!((resized[[0, 0, 0]] - 1.0).abs() < 1e-5);
        assert_eq!(resized[[20, 0, 0]], 0.0);
        assert_eq!(resized[[0, 31, 0]], 0.0);
    }

    #[test]
    fn test_resize_for_recognition_caps_width() {
        let image = Array3::<f32>::from_elem((10, 1000, 3), 0.2);
        let resized = resize_for_recognition(&image, 48, 640);
        assert_eq!(resized.dim(), (48, 640, 3));

        let narrow = Array3::<f32>::from_elem((24, 12, 3), 0.2);
        assert_eq!(resize_for_recognition(&narrow, 48, 640).dim(), (48, 24, 3));
    }

    #[test]
    fn test_crop_bounds_clamps() {
        let image = Array3::<f32>::from_shape_fn((10, 10, 3), |(y, x, _)| (y * 10 + x) as f32);

        let crop = crop_bounds(&image, (8, 8, 5, 5));
        assert_eq!(crop.dim(), (2, 2, 3));
        assert_eq!(crop[[0, 0, 0]], 88.0);

        let empty = crop_bounds(&image, (20, 20, 5, 5));
        assert_eq!(empty.dim(), (1, 1, 3));
    }

    #[test]
    fn test_preprocess_for_detection_shape() {
        let img = RgbImage::new(64, 32);
        let config = PreprocessConfig {
            det_target_size: 128,
            ..Default::default()
        };
        let (tensor, scale) = preprocess_for_detection(&img, &config);
        assert_eq!(tensor.dim(), (1, 3, 64, 128));
        assert!((scale - 2.0).abs() < 1e-5);
        // Black pixels normalize to -1
        assert!((tensor[[0, 0, 0, 0]] + 1.0).abs() < 1e-5);
    }
}
