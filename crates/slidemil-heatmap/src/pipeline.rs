//! Slide-to-heatmap pipeline.
//!
//! ```text
//! tiling CSVs ─► patches ─► backbone ─┐  (or cached .npy features)
//!                                     ▼
//!                           AttentionAggregator ─► attention[class]
//!                                                        │
//! mask ─► grid shape ─► HeatmapGrid::scatter ◄───────────┘
//!                             │
//!                 gaussian_smooth ─► normalize ─► ColorMap ─► composite(thumbnail) ─► PNG
//! ```
//!
//! Every input is opened before any work is done; a missing slide, mask or
//! CSV aborts the slide without writing anything.

use image::RgbImage;
use ndarray::{s, Array1, Array2, Array3, ArrayView1};
use ndarray_npy::{read_npy, write_npy};
use rayon::prelude::*;
use slidemil_nn::{AttentionAggregator, FeatureExtractor, LoadMode, NnError, ParamStore};
use slidemil_train::augment::ViewAugmenter;
use slidemil_train::config::AugmentationConfig;
use slidemil_train::dataset::{load_rgb, TileCoord, TilingIndex};
use slidemil_train::error::DatasetError;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::composite::{composite, normalize};
use crate::config::{HeatmapConfig, RenderConfig, SlideLayout};
use crate::error::{HeatmapError, HeatmapResult};
use crate::grid::{GridPatch, HeatmapGrid};
use crate::slide::{mask_dimensions, SlideReader};
use crate::smooth::gaussian_smooth;

const AGGREGATOR_INIT_STREAM: u64 = 11;
const FEATURE_CHUNK: usize = 64;

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// Everything needed to render one slide.
#[derive(Debug, Clone, PartialEq)]
pub struct SlideRequest {
    /// Slide identifier used in the output name.
    pub slide_id: String,
    /// Fold identifier used in the output name.
    pub fold: String,
    /// Slide image.
    pub slide_path: PathBuf,
    /// Low-resolution tissue mask; its size sets the grid size.
    pub mask_path: PathBuf,
    /// Patch paths CSV.
    pub paths_csv: PathBuf,
    /// Patch coordinates CSV.
    pub coords_csv: PathBuf,
    /// Optional `.npy` feature cache, read if present and written otherwise.
    pub features: Option<PathBuf>,
    /// Class whose attention is drawn; the predicted class when `None`.
    pub target_class: Option<usize>,
}

impl SlideRequest {
    /// Resolve the file names of `slide_id` under `layout`.
    pub fn from_layout(layout: &SlideLayout, slide_id: &str, fold: &str) -> Self {
        let file = format!("{slide_id}.{}", layout.extension);
        let tiles = layout.patch_root.join(&file);
        SlideRequest {
            slide_id: slide_id.to_string(),
            fold: fold.to_string(),
            slide_path: layout.slide_root.join(&file),
            mask_path: layout.mask_root.join(&file).join(format!("{file}_mask_use.png")),
            paths_csv: tiles.join(format!("{file}_paths_densely.csv")),
            coords_csv: tiles.join(format!("{file}_coords_densely.csv")),
            features: layout.feature_cache.as_ref().map(|dir| dir.join(format!("{slide_id}.npy"))),
            target_class: None,
        }
    }
}

/// Intermediate and final rasters of one rendering.
#[derive(Debug, Clone)]
pub struct Overlay {
    /// Class whose attention was drawn.
    pub class: usize,
    /// Grid before smoothing.
    pub grid: HeatmapGrid,
    /// Grid after smoothing, before normalisation.
    pub smoothed: Array2<f32>,
    /// Thumbnail with the coloured heatmap blended on top.
    pub image: RgbImage,
}

/// Result of [`HeatmapRenderer::render_slide_heatmap`].
#[derive(Debug, Clone)]
pub struct RenderedHeatmap {
    /// Slide identifier.
    pub slide_id: String,
    /// Written image.
    pub output_path: PathBuf,
    /// Arg-max of the slide logits.
    pub predicted_class: usize,
    /// Softmax over the slide logits.
    pub probabilities: Array1<f32>,
    /// Rasters.
    pub overlay: Overlay,
}

// ---------------------------------------------------------------------------
// Pure rendering
// ---------------------------------------------------------------------------

/// Scatter `weights` at grid offsets `origins`, smooth, colour by `class` and
/// blend over `thumbnail`. The grid has the thumbnail's size.
pub fn render_overlay(
    thumbnail: &RgbImage,
    origins: &[TileCoord],
    weights: ArrayView1<'_, f32>,
    footprint: usize,
    class: usize,
    render: &RenderConfig,
) -> HeatmapResult<Overlay> {
    if origins.len() != weights.len() {
        return Err(HeatmapError::CountMismatch {
            context: "attention weights vs patches",
            expected: origins.len(),
            actual: weights.len(),
        });
    }
    let (width, height) = thumbnail.dimensions();
    let mut grid = HeatmapGrid::zeros(height as usize, width as usize);
    let patches: Vec<GridPatch> = origins
        .iter()
        .zip(weights.iter())
        .map(|(&origin, &weight)| GridPatch { origin, weight })
        .collect();
    grid.scatter(&patches, footprint, render.overlap)?;

    let smoothed = gaussian_smooth(grid.values(), render.sigma);
    let image = composite(thumbnail, normalize(smoothed.view()).view(), render.colormap_for(class), render.alpha)?;
    Ok(Overlay { class, grid, smoothed, image })
}

// ---------------------------------------------------------------------------
// HeatmapRenderer
// ---------------------------------------------------------------------------

/// Renders attention heatmaps with one aggregator and backbone.
///
/// Holds no per-slide state, so [`HeatmapRenderer::render_many`] processes
/// slides in parallel.
pub struct HeatmapRenderer {
    config: HeatmapConfig,
    aggregator: AttentionAggregator,
    backbone: Arc<dyn FeatureExtractor>,
    reader: Box<dyn SlideReader>,
    preprocess: ViewAugmenter,
}

impl HeatmapRenderer {
    /// Assemble a renderer. The backbone width must match the aggregator
    /// input width.
    pub fn new(
        config: HeatmapConfig,
        aggregator: AttentionAggregator,
        backbone: Arc<dyn FeatureExtractor>,
        reader: Box<dyn SlideReader>,
    ) -> HeatmapResult<Self> {
        config.validate()?;
        let expected = aggregator.config().feature_width;
        if backbone.embedding_width() != expected {
            return Err(NnError::invalid_config(
                "backbone",
                format!("emits {} features, aggregator expects {expected}", backbone.embedding_width()),
            )
            .into());
        }
        let preprocess = ViewAugmenter::new(AugmentationConfig::default(), &config.dataset);
        Ok(HeatmapRenderer { config, aggregator, backbone, reader, preprocess })
    }

    /// Build the aggregator from `config.model`, restore the checkpoint of
    /// `fold` non-strictly and assemble a renderer.
    pub fn from_checkpoint(
        config: HeatmapConfig,
        fold: &str,
        backbone: Arc<dyn FeatureExtractor>,
        reader: Box<dyn SlideReader>,
    ) -> HeatmapResult<Self> {
        config.validate()?;
        let mut aggregator = AttentionAggregator::new(
            config.model.aggregator_config(),
            &mut config.run.stream(AGGREGATOR_INIT_STREAM),
        )?;
        let path = config.checkpoint_path(fold);
        info!("Loading aggregator checkpoint {}", path.display());
        let report = ParamStore::load(&path)?.load_into(&mut aggregator, LoadMode::NonStrict)?;
        debug!("{} tensors restored", report.loaded.len());
        HeatmapRenderer::new(config, aggregator, backbone, reader)
    }

    /// Active configuration.
    pub fn config(&self) -> &HeatmapConfig {
        &self.config
    }

    /// The aggregator in use.
    pub fn aggregator(&self) -> &AttentionAggregator {
        &self.aggregator
    }

    /// Per-patch backbone features `[N, L]` in tiling order, from the cache
    /// when one exists.
    pub fn slide_features(&self, request: &SlideRequest, tiling: &TilingIndex) -> HeatmapResult<Array2<f32>> {
        if let Some(cache) = request.features.as_ref().filter(|p| p.is_file()) {
            let features: Array2<f32> =
                read_npy(cache).map_err(|e| HeatmapError::feature_cache(cache, e.to_string()))?;
            if features.nrows() != tiling.len() {
                return Err(HeatmapError::CountMismatch {
                    context: "cached features vs patches",
                    expected: tiling.len(),
                    actual: features.nrows(),
                });
            }
            info!("Loaded {} cached features from {}", features.nrows(), cache.display());
            return Ok(features);
        }

        let features = self.encode_patches(tiling)?;
        if let Some(cache) = &request.features {
            if let Some(parent) = cache.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|source| HeatmapError::Io { path: parent.to_path_buf(), source })?;
            }
            write_npy(cache, &features).map_err(|e| HeatmapError::feature_cache(cache, e.to_string()))?;
            info!("Cached features at {}", cache.display());
        }
        Ok(features)
    }

    fn encode_patches(&self, tiling: &TilingIndex) -> HeatmapResult<Array2<f32>> {
        let records = tiling.records();
        let mut out = Array2::zeros((records.len(), self.backbone.embedding_width()));
        for (chunk_idx, chunk) in records.chunks(FEATURE_CHUNK).enumerate() {
            let patches: Vec<Array3<f32>> = chunk
                .par_iter()
                .map(|r| load_rgb(&r.path).map(|p| self.preprocess.preprocess(p.view())))
                .collect::<Result<_, DatasetError>>()?;
            let views: Vec<_> = patches.iter().map(|p| p.view()).collect();
            let features = self.backbone.forward_batch(&views)?;
            let start = chunk_idx * FEATURE_CHUNK;
            out.slice_mut(s![start..start + chunk.len(), ..]).assign(&features);
        }
        debug!("Encoded {} patches", records.len());
        Ok(out)
    }

    /// Render and write `heatmap_<slide>_<fold>.png` for one slide.
    pub fn render_slide_heatmap(&self, request: &SlideRequest) -> HeatmapResult<RenderedHeatmap> {
        let tiling = TilingIndex::read(&request.paths_csv, &request.coords_csv)?;
        let (rows, cols) = mask_dimensions(&request.mask_path)?;
        let slide = self.reader.open(&request.slide_path)?;
        info!("Slide {}: {} patches, mask {}x{}", request.slide_id, tiling.len(), rows, cols);

        let features = self.slide_features(request, &tiling)?;
        let output = self.aggregator.forward(features.view())?;
        let predicted_class = output.predicted_class();
        let class = request.target_class.unwrap_or(predicted_class);
        let weights = output.attention_for(class)?;

        let render = &self.config.render;
        let thumbnail = slide.thumbnail(cols as u32, rows as u32)?;
        let origins: Vec<TileCoord> =
            tiling.records().iter().map(|r| r.coord.downsample(render.downsample)).collect();
        let overlay = render_overlay(
            &thumbnail,
            &origins,
            weights,
            render.footprint(self.config.dataset.patch_size),
            class,
            render,
        )?;

        let output_path = self.config.output_path(&request.slide_id, &request.fold);
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|source| HeatmapError::Io { path: parent.to_path_buf(), source })?;
        }
        overlay
            .image
            .save(&output_path)
            .map_err(|source| HeatmapError::Encode { path: output_path.clone(), source })?;
        info!(
            "Heatmap for {} (predicted class {}, drawn class {}) saved to {}",
            request.slide_id,
            predicted_class,
            class,
            output_path.display()
        );

        Ok(RenderedHeatmap {
            slide_id: request.slide_id.clone(),
            output_path,
            predicted_class,
            probabilities: output.probabilities(),
            overlay,
        })
    }

    /// Render several slides in parallel; one result per request, in order.
    pub fn render_many(&self, requests: &[SlideRequest]) -> Vec<HeatmapResult<RenderedHeatmap>> {
        requests.par_iter().map(|r| self.render_slide_heatmap(r)).collect()
    }
}
