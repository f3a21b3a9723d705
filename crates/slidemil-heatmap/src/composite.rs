//! Colour mapping and alpha blending over the slide thumbnail.

use image::{Rgb, RgbImage};
use ndarray::{Array2, ArrayView2};

use crate::colormap::ColorMapKind;
use crate::error::{HeatmapError, HeatmapResult};

/// Min-max scale `grid` to `[0, 1]`. A constant grid maps to zeros.
pub fn normalize(grid: ArrayView2<'_, f32>) -> Array2<f32> {
    let (min, max) = grid
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;
    if !(range > 0.0) {
        return Array2::zeros(grid.raw_dim());
    }
    grid.mapv(|v| (v - min) / range)
}

/// Render `heat` (values in `[0, 1]`, shape `(height, width)`) through `cmap`
/// and blend it over `thumbnail` with opacity `alpha`.
pub fn composite(
    thumbnail: &RgbImage,
    heat: ArrayView2<'_, f32>,
    cmap: ColorMapKind,
    alpha: f32,
) -> HeatmapResult<RgbImage> {
    let (rows, cols) = heat.dim();
    let expected = (cols as u32, rows as u32);
    if thumbnail.dimensions() != expected {
        return Err(HeatmapError::SizeMismatch {
            context: "thumbnail vs heatmap",
            expected,
            actual: thumbnail.dimensions(),
        });
    }
    let alpha = alpha.clamp(0.0, 1.0);
    Ok(RgbImage::from_fn(expected.0, expected.1, |x, y| {
        let base = thumbnail.get_pixel(x, y).0;
        let over = cmap.map(heat[[y as usize, x as usize]]);
        let mut px = [0u8; 3];
        for c in 0..3 {
            let v = (1.0 - alpha) * base[c] as f32 + alpha * over[c] as f32;
            px[c] = v.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(px)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn normalize_spans_unit_interval() {
        let n = normalize(array![[2.0f32, 4.0], [3.0, 6.0]].view());
        assert_abs_diff_eq!(n[[0, 0]], 0.0);
        assert_abs_diff_eq!(n[[1, 1]], 1.0);
        assert_abs_diff_eq!(n[[0, 1]], 0.5);
    }

    #[test]
    fn constant_grid_normalises_to_zero() {
        let n = normalize(Array2::from_elem((2, 3), 0.7f32).view());
        assert!(n.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn alpha_blends_thumbnail_and_colour() {
        let thumb = RgbImage::from_pixel(2, 1, Rgb([0, 0, 0]));
        let heat = array![[0.0f32, 1.0]];
        let out = composite(&thumb, heat.view(), ColorMapKind::Reds, 0.5).unwrap();
        let top = ColorMapKind::Reds.map(1.0);
        let expected: Vec<u8> = top.iter().map(|&c| (c as f32 * 0.5).round() as u8).collect();
        assert_eq!(out.get_pixel(1, 0).0.to_vec(), expected);

        let opaque = composite(&thumb, heat.view(), ColorMapKind::Reds, 1.0).unwrap();
        assert_eq!(opaque.get_pixel(0, 0).0, ColorMapKind::Reds.map(0.0));
        let clear = composite(&thumb, heat.view(), ColorMapKind::Reds, 0.0).unwrap();
        assert_eq!(clear, thumb);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let thumb = RgbImage::new(3, 3);
        let heat = Array2::<f32>::zeros((2, 3));
        assert!(matches!(
            composite(&thumb, heat.view(), ColorMapKind::Blues, 0.5),
            Err(HeatmapError::SizeMismatch { .. })
        ));
    }
}
