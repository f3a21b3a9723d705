//! Heatmap configuration.
//!
//! `HeatmapConfig` reuses the model, dataset and run sections of the
//! pretraining configuration and adds a `render` section plus the on-disk
//! layout of slides, masks and tiling CSVs. Loaded from JSON and validated
//! the same way.

use serde::{Deserialize, Serialize};
use slidemil_train::config::{read_json, write_json, DatasetConfig, ModelConfig, RunContext};
use slidemil_train::error::ConfigError;
use std::path::{Path, PathBuf};

use crate::colormap::ColorMapKind;
use crate::grid::OverlapPolicy;

/// File name of an aggregator checkpoint inside `<model_dir>/<fold>/`.
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Grid, smoothing and blending parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Level-0 pixels per mask pixel. Default: **32**.
    pub downsample: usize,
    /// Gaussian sigma in grid cells. Default: **12**.
    pub sigma: f32,
    /// Heatmap opacity over the thumbnail. Default: **0.5**.
    pub alpha: f32,
    /// Colour map per class index. Default: Reds, Greens, YlOrBr, Blues.
    pub colormaps: Vec<ColorMapKind>,
    /// Reaction to overlapping footprints. Default: **reject**.
    pub overlap: OverlapPolicy,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            downsample: 32,
            sigma: 12.0,
            alpha: 0.5,
            colormaps: vec![
                ColorMapKind::Reds,
                ColorMapKind::Greens,
                ColorMapKind::YlOrBr,
                ColorMapKind::Blues,
            ],
            overlap: OverlapPolicy::Reject,
        }
    }
}

impl RenderConfig {
    /// Footprint side in grid cells for a patch of `patch_size` level-0
    /// pixels (224 / 32 = 7).
    pub fn footprint(&self, patch_size: usize) -> usize {
        (patch_size / self.downsample.max(1)).max(1)
    }

    /// Colour map for `class`; classes past the configured list fall back to
    /// CoolWarm.
    pub fn colormap_for(&self, class: usize) -> ColorMapKind {
        self.colormaps.get(class).copied().unwrap_or(ColorMapKind::CoolWarm)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.downsample == 0 {
            return Err(ConfigError::invalid_value("render.downsample", "must be >= 1"));
        }
        if !(self.sigma.is_finite() && self.sigma >= 0.0) {
            return Err(ConfigError::invalid_value("render.sigma", "must be finite and >= 0"));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(ConfigError::invalid_value("render.alpha", "must be in [0, 1]"));
        }
        if self.colormaps.is_empty() {
            return Err(ConfigError::invalid_value("render.colormaps", "at least one colour map is required"));
        }
        Ok(())
    }
}

/// Where the per-slide inputs live.
///
/// ```text
/// <patch_root>/<slide>.<ext>/<slide>.<ext>_paths_densely.csv
/// <patch_root>/<slide>.<ext>/<slide>.<ext>_coords_densely.csv
/// <mask_root>/<slide>.<ext>/<slide>.<ext>_mask_use.png
/// <slide_root>/<slide>.<ext>
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlideLayout {
    /// Root of the per-slide tiling directories.
    pub patch_root: PathBuf,
    /// Root of the per-slide mask directories.
    pub mask_root: PathBuf,
    /// Directory holding the slide files.
    pub slide_root: PathBuf,
    /// Slide file extension. Default: **tif**.
    pub extension: String,
    /// Optional directory of cached `<slide>.npy` feature matrices.
    #[serde(default)]
    pub feature_cache: Option<PathBuf>,
}

impl Default for SlideLayout {
    fn default() -> Self {
        SlideLayout {
            patch_root: PathBuf::from("data/patches"),
            mask_root: PathBuf::from("data/masks"),
            slide_root: PathBuf::from("data/slides"),
            extension: "tif".into(),
            feature_cache: None,
        }
    }
}

/// Top-level heatmap configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapConfig {
    /// Name of the aggregator experiment.
    pub experiment_name: String,
    /// Directory holding one sub-directory per fold with a checkpoint.
    pub model_dir: PathBuf,
    /// Directory the images are written to.
    pub output_dir: PathBuf,
    /// Seed and worker threads.
    pub run: RunContext,
    /// Backbone and aggregator settings.
    pub model: ModelConfig,
    /// Patch normalisation and size.
    pub dataset: DatasetConfig,
    /// Grid, smoothing and blending.
    #[serde(default)]
    pub render: RenderConfig,
    /// Input file layout.
    #[serde(default)]
    pub layout: SlideLayout,
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        HeatmapConfig {
            experiment_name: "mil_attention".into(),
            model_dir: PathBuf::from("trained_models/MIL"),
            output_dir: PathBuf::from("data/Heatmaps"),
            run: RunContext::default(),
            model: ModelConfig::default(),
            dataset: DatasetConfig::default(),
            render: RenderConfig::default(),
            layout: SlideLayout::default(),
        }
    }
}

impl HeatmapConfig {
    /// Load and validate a configuration from a JSON file.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let cfg: HeatmapConfig = read_json(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write this configuration as pretty-printed JSON.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        write_json(self, path)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.experiment_name.trim().is_empty() {
            return Err(ConfigError::invalid_value("experiment_name", "must not be empty"));
        }
        self.model.validate()?;
        self.dataset.validate()?;
        self.render.validate()?;
        if self.layout.extension.trim().is_empty() {
            return Err(ConfigError::invalid_value("layout.extension", "must not be empty"));
        }
        Ok(())
    }

    /// `<model_dir>/<fold>/checkpoint.json`.
    pub fn checkpoint_path(&self, fold: &str) -> PathBuf {
        self.model_dir.join(fold).join(CHECKPOINT_FILE)
    }

    /// `<output_dir>/heatmap_<slide>_<fold>.png`.
    pub fn output_path(&self, slide_id: &str, fold: &str) -> PathBuf {
        self.output_dir.join(format!("heatmap_{slide_id}_{fold}.png"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_footprint_is_seven_cells() {
        assert_eq!(RenderConfig::default().footprint(224), 7);
    }

    #[test]
    fn colormap_is_indexed_by_class() {
        let render = RenderConfig::default();
        assert_eq!(render.colormap_for(0), ColorMapKind::Reds);
        assert_eq!(render.colormap_for(2), ColorMapKind::YlOrBr);
        assert_eq!(render.colormap_for(9), ColorMapKind::CoolWarm);
    }

    #[test]
    fn json_round_trip_and_paths() {
        let tmp = tempdir().unwrap();
        let cfg = HeatmapConfig::default();
        let path = tmp.path().join("heatmap.json");
        cfg.to_json(&path).unwrap();
        let back = HeatmapConfig::from_json(&path).unwrap();
        assert_eq!(back, cfg);
        assert!(cfg.checkpoint_path("fold_0").ends_with("fold_0/checkpoint.json"));
        assert!(cfg.output_path("S1", "fold_0").ends_with("heatmap_S1_fold_0.png"));
    }

    #[test]
    fn missing_pooling_mode_fails_at_load() {
        let tmp = tempdir().unwrap();
        let mut value = serde_json::to_value(HeatmapConfig::default()).unwrap();
        value["model"].as_object_mut().unwrap().remove("pooling");
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, value.to_string()).unwrap();
        assert!(matches!(HeatmapConfig::from_json(&path), Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn invalid_alpha_is_rejected() {
        let mut cfg = HeatmapConfig::default();
        cfg.render.alpha = 1.5;
        assert!(cfg.validate().is_err());
    }
}
