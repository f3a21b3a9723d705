//! Slide reader seam and the tissue mask.
//!
//! Whole-slide pyramids are read by an external library in production; the
//! pipeline only needs `open(path)` and `thumbnail(width, height)`.
//! [`ImageSlideReader`] serves single-resolution image files (PNG, JPEG,
//! TIFF) through the `image` crate.

use image::imageops::FilterType;
use image::RgbImage;
use std::path::Path;

use crate::error::{HeatmapError, HeatmapResult};

/// An opened slide.
pub trait SlideHandle: Send + Sync {
    /// Level-0 `(width, height)` in pixels.
    fn dimensions(&self) -> (u32, u32);

    /// Overview resampled to exactly `width × height`.
    fn thumbnail(&self, width: u32, height: u32) -> HeatmapResult<RgbImage>;
}

/// Opens slides by path.
pub trait SlideReader: Send + Sync {
    /// Open the slide at `path`. Missing or undecodable files fail.
    fn open(&self, path: &Path) -> HeatmapResult<Box<dyn SlideHandle>>;
}

/// Reader for slides stored as ordinary raster images.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageSlideReader;

struct ImageSlide {
    pixels: RgbImage,
}

impl SlideReader for ImageSlideReader {
    fn open(&self, path: &Path) -> HeatmapResult<Box<dyn SlideHandle>> {
        if !path.is_file() {
            return Err(HeatmapError::slide_open(path, "file does not exist"));
        }
        // Decoder is chosen from the file content, not the extension.
        let pixels = image::io::Reader::open(path)
            .and_then(|r| r.with_guessed_format())
            .map_err(|e| HeatmapError::slide_open(path, e.to_string()))?
            .decode()
            .map_err(|e| HeatmapError::slide_open(path, e.to_string()))?
            .to_rgb8();
        Ok(Box::new(ImageSlide { pixels }))
    }
}

impl SlideHandle for ImageSlide {
    fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    fn thumbnail(&self, width: u32, height: u32) -> HeatmapResult<RgbImage> {
        if width == 0 || height == 0 {
            return Err(HeatmapError::SizeMismatch {
                context: "thumbnail",
                expected: (width.max(1), height.max(1)),
                actual: (width, height),
            });
        }
        if self.pixels.dimensions() == (width, height) {
            return Ok(self.pixels.clone());
        }
        Ok(image::imageops::resize(&self.pixels, width, height, FilterType::Triangle))
    }
}

/// Grid shape `(rows, cols)` of the tissue mask at `path`.
pub fn mask_dimensions(path: &Path) -> HeatmapResult<(usize, usize)> {
    let (width, height) = image::image_dimensions(path)
        .map_err(|source| HeatmapError::MaskOpen { path: path.to_path_buf(), source })?;
    Ok((height as usize, width as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::tempdir;

    #[test]
    fn thumbnail_has_requested_size() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("slide.png");
        RgbImage::from_pixel(64, 48, Rgb([200, 100, 50])).save(&path).unwrap();

        let slide = ImageSlideReader.open(&path).unwrap();
        assert_eq!(slide.dimensions(), (64, 48));
        let thumb = slide.thumbnail(16, 12).unwrap();
        assert_eq!(thumb.dimensions(), (16, 12));
        assert_eq!(thumb.get_pixel(3, 3), &Rgb([200, 100, 50]));
    }

    #[test]
    fn missing_slide_is_fatal() {
        let tmp = tempdir().unwrap();
        assert!(matches!(
            ImageSlideReader.open(&tmp.path().join("absent.tif")),
            Err(HeatmapError::SlideOpen { .. })
        ));
    }

    #[test]
    fn mask_dimensions_are_rows_then_columns() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("mask.png");
        image::GrayImage::new(30, 20).save(&path).unwrap();
        assert_eq!(mask_dimensions(&path).unwrap(), (20, 30));
        assert!(matches!(
            mask_dimensions(&tmp.path().join("none.png")),
            Err(HeatmapError::MaskOpen { .. })
        ));
    }
}
