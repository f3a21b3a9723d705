//! Isotropic Gaussian smoothing of attention grids.
//!
//! The grid is viewed as a single-channel `f32` image (columns are x, rows
//! are y) and blurred with [`imageproc::filter::gaussian_blur_f32`]. Borders
//! are clamped to the edge value.

use image::{ImageBuffer, Luma};
use imageproc::filter::gaussian_blur_f32;
use ndarray::{Array2, ArrayView2};

/// Single-channel float image holding one grid.
pub type GridImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Smooth `grid` with an isotropic Gaussian of standard deviation `sigma`
/// cells. `sigma <= 0` (or NaN) returns the grid unchanged.
pub fn gaussian_smooth(grid: ArrayView2<'_, f32>, sigma: f32) -> Array2<f32> {
    if !(sigma > 0.0) || grid.is_empty() {
        return grid.to_owned();
    }
    let blurred = gaussian_blur_f32(&to_image(grid), sigma);
    from_image(&blurred)
}

/// Copy a `(rows, cols)` grid into a `cols x rows` image.
pub fn to_image(grid: ArrayView2<'_, f32>) -> GridImage {
    let (rows, cols) = grid.dim();
    ImageBuffer::from_fn(cols as u32, rows as u32, |x, y| Luma([grid[[y as usize, x as usize]]]))
}

/// Inverse of [`to_image`].
pub fn from_image(image: &GridImage) -> Array2<f32> {
    let (width, height) = image.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(r, c)| image.get_pixel(c as u32, r as u32)[0])
}
