//! Two-view augmentation for contrastive pretraining.
//!
//! Each view goes through the same randomised pipeline with its own draws:
//!
//! ```text
//! random resized crop ─► vflip ─► hflip ─► rot90 ─► colour jitter ─► grayscale
//!        (p)              (p)      (p)      (p)         (p)            (p_gray)
//!                                                                          │
//!                                      resize to input size ─► normalise (mean / stddev)
//! ```
//!
//! Patches are `[3, H, W]` arrays with values in `[0, 1]`. The random stage
//! runs on an 8-bit [`RgbImage`] through `image::imageops`; the deterministic
//! preprocessing resizes an [`Rgb32FImage`] so no precision is lost there.

use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, Rgb32FImage, RgbImage};
use ndarray::{Array3, ArrayView3};
use rand::Rng;

use crate::config::{AugmentationConfig, DatasetConfig};
use crate::dataset::rgb_to_array;

/// Applies the augmentation pipeline and the fixed preprocessing.
#[derive(Debug, Clone)]
pub struct ViewAugmenter {
    config: AugmentationConfig,
    mean: [f32; 3],
    stddev: [f32; 3],
    input_size: usize,
}

impl ViewAugmenter {
    /// Build from the augmentation and dataset sections of the config.
    pub fn new(config: AugmentationConfig, dataset: &DatasetConfig) -> Self {
        ViewAugmenter {
            config,
            mean: dataset.mean,
            stddev: dataset.stddev,
            input_size: dataset.input_size,
        }
    }

    /// Side length of every produced view.
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Two independently augmented, preprocessed views of one patch.
    pub fn pair<R: Rng + ?Sized>(&self, patch: ArrayView3<'_, f32>, rng: &mut R) -> (Array3<f32>, Array3<f32>) {
        let q = self.view(patch, rng);
        let k = self.view(patch, rng);
        (q, k)
    }

    /// One augmented, preprocessed view.
    pub fn view<R: Rng + ?Sized>(&self, patch: ArrayView3<'_, f32>, rng: &mut R) -> Array3<f32> {
        let augmented = self.augment(patch, rng);
        self.preprocess(augmented.view())
    }

    /// Random geometric and photometric transforms, without normalisation.
    ///
    /// Patches that are not 3-channel are returned unchanged. The output is
    /// quantised to 8 bits.
    pub fn augment<R: Rng + ?Sized>(&self, patch: ArrayView3<'_, f32>, rng: &mut R) -> Array3<f32> {
        let Some(mut img) = array_to_rgb8(patch) else {
            return patch.to_owned();
        };
        let p = self.config.prob;

        if rng.gen::<f32>() < p {
            img = random_resized_crop(&img, self.config.crop_scale, rng);
        }
        if rng.gen::<f32>() < p {
            img = imageops::flip_vertical(&img);
        }
        if rng.gen::<f32>() < p {
            img = imageops::flip_horizontal(&img);
        }
        if rng.gen::<f32>() < p && img.width() == img.height() {
            img = match rng.gen_range(1..=3) {
                1 => imageops::rotate90(&img),
                2 => imageops::rotate180(&img),
                _ => imageops::rotate270(&img),
            };
        }
        if rng.gen::<f32>() < p {
            img = color_jitter(&img, &self.config, rng);
        }
        if rng.gen::<f32>() < self.config.grayscale_prob {
            img = to_grayscale(&img);
        }
        rgb_to_array(&img)
    }

    /// Deterministic preprocessing: resize to the model input size, then
    /// per-channel normalisation.
    pub fn preprocess(&self, patch: ArrayView3<'_, f32>) -> Array3<f32> {
        let mut x = resize_bilinear(patch, self.input_size, self.input_size);
        for (c, mut channel) in x.outer_iter_mut().enumerate().take(3) {
            let (m, sd) = (self.mean[c], self.stddev[c]);
            channel.mapv_inplace(|v| (v - m) / sd);
        }
        x
    }
}

/// Triangle-filter resize of a `[3, H, W]` array in `[0, 1]`. Resampled
/// values are clamped to that range.
///
/// Arrays that are not 3-channel, are empty, or already have the requested
/// size are returned as they are.
pub fn resize_bilinear(x: ArrayView3<'_, f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let (c, h, w) = x.dim();
    if c != 3 || (h, w) == (out_h, out_w) || h == 0 || w == 0 || out_h == 0 || out_w == 0 {
        return x.to_owned();
    }
    let img = Rgb32FImage::from_fn(w as u32, h as u32, |col, row| {
        let (r, col) = (row as usize, col as usize);
        Rgb([x[[0, r, col]], x[[1, r, col]], x[[2, r, col]]])
    });
    let resized = imageops::resize(&img, out_w as u32, out_h as u32, FilterType::Triangle);
    Array3::from_shape_fn((3, out_h, out_w), |(ch, r, col)| resized.get_pixel(col as u32, r as u32)[ch])
}

/// 8-bit image of a `[3, H, W]` patch in `[0, 1]`, or `None` for other
/// channel counts.
fn array_to_rgb8(x: ArrayView3<'_, f32>) -> Option<RgbImage> {
    let (c, h, w) = x.dim();
    if c != 3 {
        return None;
    }
    let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    Some(RgbImage::from_fn(w as u32, h as u32, |col, row| {
        let (r, col) = (row as usize, col as usize);
        Rgb([to_u8(x[[0, r, col]]), to_u8(x[[1, r, col]]), to_u8(x[[2, r, col]])])
    }))
}

fn random_resized_crop<R: Rng + ?Sized>(img: &RgbImage, scale: [f32; 2], rng: &mut R) -> RgbImage {
    let (w, h) = img.dimensions();
    let area = (w * h) as f32;
    let (log_lo, log_hi) = ((3.0f32 / 4.0).ln(), (4.0f32 / 3.0).ln());
    for _ in 0..10 {
        let target = area * rng.gen_range(scale[0]..=scale[1]);
        let ratio = rng.gen_range(log_lo..=log_hi).exp();
        let cw = (target * ratio).sqrt().round() as u32;
        let ch = (target / ratio).sqrt().round() as u32;
        if cw >= 1 && ch >= 1 && cw <= w && ch <= h {
            let top = rng.gen_range(0..=h - ch);
            let left = rng.gen_range(0..=w - cw);
            let crop = imageops::crop_imm(img, left, top, cw, ch).to_image();
            return imageops::resize(&crop, w, h, FilterType::Triangle);
        }
    }
    img.clone()
}

/// Brightness, contrast, saturation and hue, each drawn independently.
fn color_jitter<R: Rng + ?Sized>(img: &RgbImage, cfg: &AugmentationConfig, rng: &mut R) -> RgbImage {
    let mut factor = |strength: f32| {
        if strength > 0.0 {
            rng.gen_range((1.0 - strength).max(0.0)..=1.0 + strength)
        } else {
            1.0
        }
    };
    let brightness = factor(cfg.brightness);
    let contrast = factor(cfg.contrast);
    let saturation = factor(cfg.saturation);
    let hue = if cfg.hue > 0.0 { rng.gen_range(-cfg.hue..=cfg.hue) } else { 0.0 };

    // `brighten` adds an offset on the 0..255 scale.
    let mut out = imageops::brighten(img, ((brightness - 1.0) * 255.0).round() as i32);
    // `contrast` scales by ((100 + c) / 100)^2 around mid-grey.
    if contrast != 1.0 {
        out = imageops::contrast(&out, (contrast.sqrt() - 1.0) * 100.0);
    }
    out = saturate(&out, saturation);
    let degrees = (hue * 360.0).round() as i32;
    if degrees != 0 {
        out = imageops::huerotate(&out, degrees);
    }
    out
}

/// Blend each pixel with its luma: 0 gives grayscale, 1 the input.
fn saturate(img: &RgbImage, factor: f32) -> RgbImage {
    if factor == 1.0 {
        return img.clone();
    }
    let gray = imageops::grayscale(img);
    let mut out = img.clone();
    for (px, g) in out.pixels_mut().zip(gray.pixels()) {
        let g = g[0] as f32;
        for v in px.0.iter_mut() {
            *v = ((*v as f32 - g) * factor + g).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

fn to_grayscale(img: &RgbImage) -> RgbImage {
    DynamicImage::ImageLuma8(imageops::grayscale(img)).into_rgb8()
}
