//! Sequential and diverging colour maps.
//!
//! Each map is a list of evenly spaced anchor colours interpolated linearly
//! in RGB. The sequential anchors are the nine-class ColorBrewer palettes.

use serde::{Deserialize, Serialize};

/// Named colour maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorMapKind {
    /// White to dark red.
    Reds,
    /// White to dark green.
    Greens,
    /// Light yellow through orange to brown.
    YlOrBr,
    /// White to dark blue.
    Blues,
    /// Blue through grey to red.
    CoolWarm,
}

const REDS: [[u8; 3]; 9] = [
    [0xff, 0xf5, 0xf0],
    [0xfe, 0xe0, 0xd2],
    [0xfc, 0xbb, 0xa1],
    [0xfc, 0x92, 0x72],
    [0xfb, 0x6a, 0x4a],
    [0xef, 0x3b, 0x2c],
    [0xcb, 0x18, 0x1d],
    [0xa5, 0x0f, 0x15],
    [0x67, 0x00, 0x0d],
];

const GREENS: [[u8; 3]; 9] = [
    [0xf7, 0xfc, 0xf5],
    [0xe5, 0xf5, 0xe0],
    [0xc7, 0xe9, 0xc0],
    [0xa1, 0xd9, 0x9b],
    [0x74, 0xc4, 0x76],
    [0x41, 0xab, 0x5d],
    [0x23, 0x8b, 0x45],
    [0x00, 0x6d, 0x2c],
    [0x00, 0x44, 0x1b],
];

const YLORBR: [[u8; 3]; 9] = [
    [0xff, 0xff, 0xe5],
    [0xff, 0xf7, 0xbc],
    [0xfe, 0xe3, 0x91],
    [0xfe, 0xc4, 0x4f],
    [0xfe, 0x99, 0x29],
    [0xec, 0x70, 0x14],
    [0xcc, 0x4c, 0x02],
    [0x99, 0x34, 0x04],
    [0x66, 0x25, 0x06],
];

const BLUES: [[u8; 3]; 9] = [
    [0xf7, 0xfb, 0xff],
    [0xde, 0xeb, 0xf7],
    [0xc6, 0xdb, 0xef],
    [0x9e, 0xca, 0xe1],
    [0x6b, 0xae, 0xd6],
    [0x42, 0x92, 0xc6],
    [0x21, 0x71, 0xb5],
    [0x08, 0x51, 0x9c],
    [0x08, 0x30, 0x6b],
];

const COOLWARM: [[u8; 3]; 5] = [
    [59, 76, 192],
    [141, 176, 254],
    [221, 221, 221],
    [244, 154, 123],
    [180, 4, 38],
];

impl ColorMapKind {
    fn anchors(self) -> &'static [[u8; 3]] {
        match self {
            ColorMapKind::Reds => &REDS,
            ColorMapKind::Greens => &GREENS,
            ColorMapKind::YlOrBr => &YLORBR,
            ColorMapKind::Blues => &BLUES,
            ColorMapKind::CoolWarm => &COOLWARM,
        }
    }

    /// Colour for `t ∈ [0, 1]`; values outside are clamped and NaN maps to 0.
    pub fn map(self, t: f32) -> [u8; 3] {
        let anchors = self.anchors();
        let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
        let pos = t * (anchors.len() - 1) as f32;
        let lo = (pos.floor() as usize).min(anchors.len() - 1);
        let hi = (lo + 1).min(anchors.len() - 1);
        let frac = pos - lo as f32;
        let mut out = [0u8; 3];
        for (c, slot) in out.iter_mut().enumerate() {
            let a = anchors[lo][c] as f32;
            let b = anchors[hi][c] as f32;
            *slot = (a + (b - a) * frac).round() as u8;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_hit_first_and_last_anchor() {
        assert_eq!(ColorMapKind::Reds.map(0.0), REDS[0]);
        assert_eq!(ColorMapKind::Reds.map(1.0), REDS[8]);
        assert_eq!(ColorMapKind::CoolWarm.map(0.5), COOLWARM[2]);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        assert_eq!(ColorMapKind::Blues.map(-3.0), BLUES[0]);
        assert_eq!(ColorMapKind::Blues.map(7.0), BLUES[8]);
        assert_eq!(ColorMapKind::Greens.map(f32::NAN), GREENS[0]);
    }

    #[test]
    fn sequential_maps_darken_monotonically() {
        for kind in [ColorMapKind::Reds, ColorMapKind::Greens, ColorMapKind::YlOrBr, ColorMapKind::Blues] {
            let luma = |c: [u8; 3]| c.iter().map(|&v| v as u32).sum::<u32>();
            let samples: Vec<u32> = (0..=20).map(|i| luma(kind.map(i as f32 / 20.0))).collect();
            assert!(samples.windows(2).all(|w| w[1] <= w[0]), "{kind:?} is not monotone");
        }
    }

    #[test]
    fn midpoints_interpolate_between_anchors() {
        let mid = ColorMapKind::YlOrBr.map(1.0 / 16.0);
        for c in 0..3 {
            let lo = YLORBR[0][c].min(YLORBR[1][c]);
            let hi = YLORBR[0][c].max(YLORBR[1][c]);
            assert!((lo..=hi).contains(&mid[c]));
        }
    }
}
