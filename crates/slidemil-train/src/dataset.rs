//! Patch sources, tiling metadata and the two-view batch loader.
//!
//! Tiling is done by an external tool that writes, per slide:
//!
//! - a *paths* CSV, one patch image path per row (column 0), and
//! - a *coordinates* CSV, index-aligned with the paths file, whose columns
//!   0, 2 and 3 hold the patch name, the `y` and the `x` pixel offset.
//!
//! The contrastive stage pools every `*_densely_filtered_paths.csv` found
//! under a directory. Files are visited in natural order (`slide_2` before
//! `slide_10`) so that the pool, and therefore the seeded shuffle, is stable
//! across file systems.
//!
//! ```text
//! discover_manifests ─► read_manifest ─► ImagePatchSource ─┐
//!                                                          ├─► ViewPairLoader ─► ViewBatch { queries, keys }
//!                                   SyntheticPatchSource ──┘          │
//!                                                               ViewAugmenter (two independent views)
//! ```

use ndarray::{Array3, Array4, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::augment::ViewAugmenter;
use crate::error::DatasetError;

/// Suffix of the per-slide patch manifests used for pretraining.
pub const MANIFEST_SUFFIX: &str = "_densely_filtered_paths.csv";

// ---------------------------------------------------------------------------
// Coordinates and tiling metadata
// ---------------------------------------------------------------------------

/// Integer patch offset in level-0 pixels, in grid (row, column) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    /// Row offset (first axis of the mask).
    pub row: usize,
    /// Column offset (second axis of the mask).
    pub col: usize,
}

impl TileCoord {
    /// Offset at a coarser pyramid level, truncating toward zero.
    pub fn downsample(self, factor: usize) -> TileCoord {
        let f = factor.max(1);
        TileCoord { row: self.row / f, col: self.col / f }
    }
}

/// One tiled patch of a slide.
#[derive(Debug, Clone, PartialEq)]
pub struct TileRecord {
    /// Patch name from the coordinates CSV.
    pub name: String,
    /// Patch image path from the paths CSV.
    pub path: PathBuf,
    /// Level-0 offset.
    pub coord: TileCoord,
}

/// The index-aligned pair of tiling CSVs of one slide.
#[derive(Debug, Clone)]
pub struct TilingIndex {
    records: Vec<TileRecord>,
}

impl TilingIndex {
    /// Read and align the paths and coordinates CSVs (both without header).
    ///
    /// The coordinates file maps column 3 to the grid row and column 2 to the
    /// grid column. Differing row counts abort with
    /// [`DatasetError::CountMismatch`].
    pub fn read(paths_csv: &Path, coords_csv: &Path) -> Result<Self, DatasetError> {
        let paths = read_manifest(paths_csv, false)?;
        let coords = read_coordinates(coords_csv)?;
        if paths.len() != coords.len() {
            return Err(DatasetError::CountMismatch {
                paths: paths_csv.to_path_buf(),
                path_count: paths.len(),
                coords: coords_csv.to_path_buf(),
                coord_count: coords.len(),
            });
        }
        let records = paths
            .into_iter()
            .zip(coords)
            .map(|(path, (name, coord))| TileRecord { name, path, coord })
            .collect();
        Ok(TilingIndex { records })
    }

    /// Build an index from records already in memory.
    pub fn from_records(records: Vec<TileRecord>) -> Self {
        TilingIndex { records }
    }

    /// Number of patches.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// `true` when the slide has no patches.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in file order.
    pub fn records(&self) -> &[TileRecord] {
        &self.records
    }

    /// Patch image paths in file order.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.records.iter().map(|r| r.path.clone()).collect()
    }
}

fn read_coordinates(path: &Path) -> Result<Vec<(String, TileCoord)>, DatasetError> {
    let mut reader = open_csv(path, false)?;
    let mut out = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.map_err(|source| DatasetError::Csv { path: path.to_path_buf(), source })?;
        let field = |i: usize| {
            row.get(i).ok_or_else(|| {
                DatasetError::invalid_format(path, format!("row {line} has no column {i}"))
            })
        };
        let name = field(0)?.to_string();
        let col = parse_offset(field(2)?, path, line)?;
        let r = parse_offset(field(3)?, path, line)?;
        out.push((name, TileCoord { row: r, col }));
    }
    Ok(out)
}

fn parse_offset(raw: &str, path: &Path, line: usize) -> Result<usize, DatasetError> {
    let value: f64 = raw.trim().parse().map_err(|_| {
        DatasetError::invalid_format(path, format!("row {line}: `{raw}` is not a number"))
    })?;
    if !value.is_finite() || value < 0.0 {
        return Err(DatasetError::invalid_format(
            path,
            format!("row {line}: offset {value} must be a non-negative number"),
        ));
    }
    Ok(value.floor() as usize)
}

fn open_csv(path: &Path, has_headers: bool) -> Result<csv::Reader<std::fs::File>, DatasetError> {
    if !path.exists() {
        return Err(DatasetError::not_found(path, "tiling CSV is missing"));
    }
    csv::ReaderBuilder::new()
        .has_headers(has_headers)
        .flexible(true)
        .from_path(path)
        .map_err(|source| DatasetError::Csv { path: path.to_path_buf(), source })
}

/// Read column 0 of a patch manifest.
pub fn read_manifest(path: &Path, has_headers: bool) -> Result<Vec<PathBuf>, DatasetError> {
    let mut reader = open_csv(path, has_headers)?;
    let mut out = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.map_err(|source| DatasetError::Csv { path: path.to_path_buf(), source })?;
        match row.get(0).map(str::trim) {
            Some(p) if !p.is_empty() => out.push(PathBuf::from(p)),
            _ => {
                return Err(DatasetError::invalid_format(path, format!("row {line} has an empty path")))
            }
        }
    }
    Ok(out)
}

/// Every file under `root` whose name ends in [`MANIFEST_SUFFIX`], in
/// natural order.
pub fn discover_manifests(root: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    if !root.is_dir() {
        return Err(DatasetError::not_found(root, "manifest directory does not exist"));
    }
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir)
            .map_err(|source| DatasetError::IoError { path: dir.clone(), source })?;
        for entry in entries {
            let entry = entry.map_err(|source| DatasetError::IoError { path: dir.clone(), source })?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX))
            {
                found.push(path);
            }
        }
    }
    found.sort_by(|a, b| natural_cmp(&a.to_string_lossy(), &b.to_string_lossy()));
    Ok(found)
}

/// Concatenate the patch paths of every manifest under `root`.
///
/// Manifests carry a header row.
pub fn collect_patch_pool(root: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let manifests = discover_manifests(root)?;
    if manifests.is_empty() {
        return Err(DatasetError::not_found(root, format!("no *{MANIFEST_SUFFIX} files found")));
    }
    let mut pool = Vec::new();
    for manifest in &manifests {
        let paths = read_manifest(manifest, true)?;
        debug!("{}: {} patches", manifest.display(), paths.len());
        pool.extend(paths);
    }
    info!("Total number of patches {} from {} slides", pool.len(), manifests.len());
    Ok(pool)
}

/// Compare strings treating runs of ASCII digits as numbers.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a.as_bytes(), b.as_bytes());
    loop {
        match (a.first(), b.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let da = a.iter().take_while(|c| c.is_ascii_digit()).count();
                let db = b.iter().take_while(|c| c.is_ascii_digit()).count();
                let na = trim_zeros(&a[..da]);
                let nb = trim_zeros(&b[..db]);
                let ord = na.len().cmp(&nb.len()).then_with(|| na.cmp(nb));
                if ord != Ordering::Equal {
                    return ord;
                }
                a = &a[da..];
                b = &b[db..];
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(y);
                }
                a = &a[1..];
                b = &b[1..];
            }
        }
    }
}

fn trim_zeros(digits: &[u8]) -> &[u8] {
    let start = digits.iter().position(|&d| d != b'0').unwrap_or(digits.len());
    &digits[start..]
}

// ---------------------------------------------------------------------------
// PatchSource
// ---------------------------------------------------------------------------

/// Random-access collection of RGB patches as `[3, H, W]` arrays in `[0, 1]`.
pub trait PatchSource: Send + Sync {
    /// Number of patches.
    fn len(&self) -> usize;

    /// Load patch `idx`.
    fn get(&self, idx: usize) -> Result<Array3<f32>, DatasetError>;

    /// `true` when the source holds no patches.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

/// Patches decoded from image files on disk.
#[derive(Debug, Clone)]
pub struct ImagePatchSource {
    paths: Vec<PathBuf>,
}

impl ImagePatchSource {
    /// Wrap a list of image paths.
    pub fn new(paths: Vec<PathBuf>) -> Self {
        ImagePatchSource { paths }
    }

    /// Pool every manifest under `root`.
    pub fn from_manifest_dir(root: &Path) -> Result<Self, DatasetError> {
        Ok(ImagePatchSource::new(collect_patch_pool(root)?))
    }

    /// Underlying paths.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl PatchSource for ImagePatchSource {
    fn len(&self) -> usize {
        self.paths.len()
    }

    fn get(&self, idx: usize) -> Result<Array3<f32>, DatasetError> {
        let path = self
            .paths
            .get(idx)
            .ok_or(DatasetError::IndexOutOfBounds { idx, len: self.paths.len() })?;
        load_rgb(path)
    }

    fn name(&self) -> &str {
        "ImagePatchSource"
    }
}

/// Decode an image file into a `[3, H, W]` array scaled to `[0, 1]`.
pub fn load_rgb(path: &Path) -> Result<Array3<f32>, DatasetError> {
    if !path.exists() {
        return Err(DatasetError::not_found(path, "patch image is missing"));
    }
    let img = image::open(path)
        .map_err(|source| DatasetError::Image { path: path.to_path_buf(), source })?
        .to_rgb8();
    Ok(rgb_to_array(&img))
}

/// Convert an 8-bit RGB image to `[3, H, W]` in `[0, 1]`.
pub fn rgb_to_array(img: &image::RgbImage) -> Array3<f32> {
    let (w, h) = img.dimensions();
    Array3::from_shape_fn((3, h as usize, w as usize), |(c, y, x)| {
        img.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
}

/// Deterministic procedurally generated patches for smoke tests and dry runs.
///
/// Patch `i` is a smooth two-tone gradient whose colours and orientation
/// depend only on `(seed, i)`.
#[derive(Debug, Clone)]
pub struct SyntheticPatchSource {
    len: usize,
    size: usize,
    seed: u64,
}

impl SyntheticPatchSource {
    /// `len` patches of `size × size` pixels.
    pub fn new(len: usize, size: usize, seed: u64) -> Self {
        SyntheticPatchSource { len, size: size.max(1), seed }
    }
}

impl PatchSource for SyntheticPatchSource {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, idx: usize) -> Result<Array3<f32>, DatasetError> {
        if idx >= self.len {
            return Err(DatasetError::IndexOutOfBounds { idx, len: self.len });
        }
        let mut h = self.seed ^ (idx as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let mut next = || {
            h ^= h << 13;
            h ^= h >> 7;
            h ^= h << 17;
            (h >> 40) as f32 / (1u64 << 24) as f32
        };
        let a = [next(), next(), next()];
        let b = [next(), next(), next()];
        let angle = next() * std::f32::consts::TAU;
        let (s, c) = angle.sin_cos();
        let n = self.size as f32;
        Ok(Array3::from_shape_fn((3, self.size, self.size), |(ch, y, x)| {
            let u = ((x as f32 / n - 0.5) * c + (y as f32 / n - 0.5) * s + 0.5).clamp(0.0, 1.0);
            a[ch] * (1.0 - u) + b[ch] * u
        }))
    }

    fn name(&self) -> &str {
        "SyntheticPatchSource"
    }
}

// ---------------------------------------------------------------------------
// ViewPairLoader
// ---------------------------------------------------------------------------

/// One training step worth of index-aligned view pairs.
#[derive(Debug, Clone)]
pub struct ViewBatch {
    /// Source indices, row `i` of both tensors comes from `indices[i]`.
    pub indices: Vec<usize>,
    /// First views `[N, 3, S, S]`, fed to the online encoder.
    pub queries: Array4<f32>,
    /// Second views `[N, 3, S, S]`, fed to the momentum encoder.
    pub keys: Array4<f32>,
}

impl ViewBatch {
    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// `true` for an empty batch.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Per-sample views of the query tensor.
    pub fn query_views(&self) -> Vec<ArrayView3<'_, f32>> {
        self.queries.outer_iter().collect()
    }

    /// Per-sample views of the key tensor.
    pub fn key_views(&self) -> Vec<ArrayView3<'_, f32>> {
        self.keys.outer_iter().collect()
    }
}

/// Shuffled, drop-last batches of two independently augmented views.
///
/// Loading and augmentation run in parallel; every sample draws from its own
/// generator seeded by `(seed, epoch, index)`, so batches do not depend on
/// thread scheduling and `queries[i]` always pairs with `keys[i]`.
pub struct ViewPairLoader<'a> {
    source: &'a dyn PatchSource,
    augmenter: &'a ViewAugmenter,
    batch_size: usize,
    seed: u64,
}

impl<'a> ViewPairLoader<'a> {
    /// Create a loader. `batch_size` must be at least 1.
    pub fn new(
        source: &'a dyn PatchSource,
        augmenter: &'a ViewAugmenter,
        batch_size: usize,
        seed: u64,
    ) -> Self {
        ViewPairLoader { source, augmenter, batch_size: batch_size.max(1), seed }
    }

    /// Complete batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.source.len() / self.batch_size
    }

    /// Batches of one epoch in a seeded random order.
    pub fn epoch(&self, epoch: usize) -> ViewPairIter<'_> {
        let mut indices: Vec<usize> = (0..self.source.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        indices.shuffle(&mut rng);
        ViewPairIter { loader: self, indices, cursor: 0, epoch }
    }

    fn load_pair(&self, idx: usize, epoch: usize) -> Result<(Array3<f32>, Array3<f32>), DatasetError> {
        let patch = self.source.get(idx)?;
        let sample_seed = self
            .seed
            .wrapping_mul(0x2545_F491_4F6C_DD1D)
            .wrapping_add((epoch as u64) << 32)
            .wrapping_add(idx as u64);
        let mut rng = StdRng::seed_from_u64(sample_seed);
        Ok(self.augmenter.pair(patch.view(), &mut rng))
    }
}

/// Iterator returned by [`ViewPairLoader::epoch`].
pub struct ViewPairIter<'a> {
    loader: &'a ViewPairLoader<'a>,
    indices: Vec<usize>,
    cursor: usize,
    epoch: usize,
}

impl<'a> Iterator for ViewPairIter<'a> {
    type Item = Result<ViewBatch, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        let end = self.cursor + self.loader.batch_size;
        if end > self.indices.len() {
            return None;
        }
        let batch_indices = self.indices[self.cursor..end].to_vec();
        self.cursor = end;

        let pairs: Result<Vec<_>, DatasetError> = batch_indices
            .par_iter()
            .map(|&idx| self.loader.load_pair(idx, self.epoch))
            .collect();
        Some(pairs.and_then(|pairs| stack_pairs(batch_indices, pairs)))
    }
}

fn stack_pairs(
    indices: Vec<usize>,
    pairs: Vec<(Array3<f32>, Array3<f32>)>,
) -> Result<ViewBatch, DatasetError> {
    let stack = |views: Vec<ArrayView3<'_, f32>>| {
        ndarray::stack(Axis(0), &views)
            .map_err(|e| DatasetError::invalid_format("<batch>", format!("patch shapes differ: {e}")))
    };
    let queries = stack(pairs.iter().map(|(q, _)| q.view()).collect())?;
    let keys = stack(pairs.iter().map(|(_, k)| k.view()).collect())?;
    Ok(ViewBatch { indices, queries, keys })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
