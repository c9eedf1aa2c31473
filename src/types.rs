use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Cell values of a single-band raster
pub type CellValue = f32;

/// 2D grid of cell values (rows x cols)
pub type Grid = Array2<CellValue>;

/// Validity mask: `true` marks a cell that holds data, `false` a no-data cell
pub type ValidMask = Array2<bool>;

/// Ground sample distance in metres for each zoom level, coarsest first.
pub const ZOOM_SCALES: [f64; 13] = [
    156000.0, 78000.0, 39000.0, 20000.0, 10000.0, 4900.0, 2400.0, 1200.0, 611.0, 305.0, 152.0,
    76.0, 38.0,
];

/// Relative tolerance used when comparing ground sample distances
const SCALE_EPSILON: f64 = 1e-9;

/// Returns true when two ground sample distances denote the same grid spacing.
pub fn same_scale(a: f64, b: f64) -> bool {
    (a - b).abs() <= SCALE_EPSILON * a.abs().max(b.abs()).max(1.0)
}

/// Discrete index into [`ZOOM_SCALES`]; 0 is the coarsest level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoomLevel(u8);

impl ZoomLevel {
    /// Finest zoom in the table
    pub const FINEST: ZoomLevel = ZoomLevel(12);
    /// Coarsest zoom in the table
    pub const COARSEST: ZoomLevel = ZoomLevel(0);

    pub fn new(z: u8) -> BiomassResult<Self> {
        if (z as usize) < ZOOM_SCALES.len() {
            Ok(Self(z))
        } else {
            Err(BiomassError::InvalidZoom(z))
        }
    }

    pub fn index(self) -> u8 {
        self.0
    }

    /// Ground sample distance of this zoom in metres
    pub fn scale(self) -> f64 {
        ZOOM_SCALES[self.0 as usize]
    }

    /// True if this level has a smaller ground sample distance than `other`
    pub fn is_finer_than(self, other: ZoomLevel) -> bool {
        self.0 > other.0
    }

    /// The next coarser level, if any
    pub fn coarser(self) -> Option<ZoomLevel> {
        self.0.checked_sub(1).map(ZoomLevel)
    }

    /// The next finer level, if any
    pub fn finer(self) -> Option<ZoomLevel> {
        if self.0 < Self::FINEST.0 {
            Some(ZoomLevel(self.0 + 1))
        } else {
            None
        }
    }
}

impl std::fmt::Display for ZoomLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "z{}", self.0)
    }
}

/// Statistical reducer used when coarsening a raster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReducerKind {
    /// Arithmetic mean of valid cells (continuous data such as carbon density)
    Mean,
    /// Most frequent valid non-zero class; ties go to the lowest class (categorical data such as loss year)
    Mode,
}

impl std::fmt::Display for ReducerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReducerKind::Mean => write!(f, "mean"),
            ReducerKind::Mode => write!(f, "mode"),
        }
    }
}

/// Tree-cover percentage used to select the pre-thresholded loss layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Threshold(u8);

impl Threshold {
    /// Validate `value` against the allowed set
    pub fn new(value: u8, allowed: &[u8]) -> BiomassResult<Self> {
        if allowed.contains(&value) {
            Ok(Self(value))
        } else {
            Err(BiomassError::InvalidThreshold {
                value,
                allowed: allowed.to_vec(),
            })
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Name of the pre-thresholded loss band, e.g. `loss_30`
    pub fn loss_band_name(self) -> String {
        format!("loss_{}", self.0)
    }
}

impl std::fmt::Display for Threshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Single-band raster over a fixed origin with a ground sample distance and CRS.
///
/// Scale, CRS and origin are fixed at construction. Every operation returns a
/// new raster; inputs are never modified.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    data: Grid,
    valid: ValidMask,
    scale: f64,
    crs: String,
    origin: (f64, f64),
}

impl Raster {
    /// Create a fully valid raster with its origin at (0, 0)
    pub fn new(data: Grid, scale: f64, crs: impl Into<String>) -> Self {
        let valid = ValidMask::from_elem(data.dim(), true);
        Self {
            data,
            valid,
            scale,
            crs: crs.into(),
            origin: (0.0, 0.0),
        }
    }

    /// Create a raster with an explicit validity mask
    pub fn with_mask(
        data: Grid,
        valid: ValidMask,
        scale: f64,
        crs: impl Into<String>,
    ) -> BiomassResult<Self> {
        if data.dim() != valid.dim() {
            return Err(BiomassError::DimensionMismatch(format!(
                "data is {:?} but mask is {:?}",
                data.dim(),
                valid.dim()
            )));
        }
        Ok(Self {
            data,
            valid,
            scale,
            crs: crs.into(),
            origin: (0.0, 0.0),
        })
    }

    /// Same raster anchored at a different top-left corner (CRS units)
    pub fn with_origin(mut self, x: f64, y: f64) -> Self {
        self.origin = (x, y);
        self
    }

    /// A raster of `value` on the same grid as `self`
    pub fn filled_like(&self, value: CellValue) -> Self {
        self.derive(Grid::from_elem(self.dim(), value), ValidMask::from_elem(self.dim(), true))
    }

    pub fn data(&self) -> &Grid {
        &self.data
    }

    pub fn valid(&self) -> &ValidMask {
        &self.valid
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn crs(&self) -> &str {
        &self.crs
    }

    pub fn origin(&self) -> (f64, f64) {
        self.origin
    }

    /// (rows, cols)
    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Value at (row, col), or `None` if the cell is masked or out of range
    pub fn get(&self, row: usize, col: usize) -> Option<CellValue> {
        match self.valid.get((row, col)) {
            Some(true) => self.data.get((row, col)).copied(),
            _ => None,
        }
    }

    pub fn is_valid(&self, row: usize, col: usize) -> bool {
        self.valid.get((row, col)).copied().unwrap_or(false)
    }

    /// Number of cells holding data
    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }

    /// True if `other` shares dimensions, scale, CRS and origin with `self`
    pub fn same_grid(&self, other: &Raster) -> bool {
        self.dim() == other.dim()
            && same_scale(self.scale, other.scale)
            && self.crs == other.crs
            && self.origin == other.origin
    }

    /// Fail with `DimensionMismatch` unless `other` is on the same grid
    pub fn ensure_same_grid(&self, other: &Raster, what: &str) -> BiomassResult<()> {
        if self.same_grid(other) {
            Ok(())
        } else {
            Err(BiomassError::DimensionMismatch(format!(
                "{}: {:?} @ {}m {} {:?} vs {:?} @ {}m {} {:?}",
                what,
                self.dim(),
                self.scale,
                self.crs,
                self.origin,
                other.dim(),
                other.scale,
                other.crs,
                other.origin
            )))
        }
    }

    /// New raster on the same grid, keeping scale, CRS and origin
    pub(crate) fn derive(&self, data: Grid, valid: ValidMask) -> Self {
        Self {
            data,
            valid,
            scale: self.scale,
            crs: self.crs.clone(),
            origin: self.origin,
        }
    }

    /// New raster at a different scale, keeping CRS and origin
    pub(crate) fn derive_rescaled(&self, data: Grid, valid: ValidMask, scale: f64) -> Self {
        Self {
            data,
            valid,
            scale,
            crs: self.crs.clone(),
            origin: self.origin,
        }
    }

    /// Apply `f` to every cell value; the mask is carried over unchanged
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(CellValue) -> CellValue,
    {
        self.derive(self.data.mapv(f), self.valid.clone())
    }

    /// Mask out every cell where `keep` is false (cells already masked stay masked)
    pub fn update_mask(&self, keep: &ValidMask) -> BiomassResult<Self> {
        if keep.dim() != self.dim() {
            return Err(BiomassError::DimensionMismatch(format!(
                "mask is {:?} but raster is {:?}",
                keep.dim(),
                self.dim()
            )));
        }
        let valid = ndarray::Zip::from(&self.valid)
            .and(keep)
            .map_collect(|v, k| *v && *k);
        Ok(self.derive(self.data.clone(), valid))
    }

    /// Replace masked cells with `fill` and mark every cell valid
    pub fn unmask(&self, fill: CellValue) -> Self {
        let data = ndarray::Zip::from(&self.data)
            .and(&self.valid)
            .map_collect(|d, v| if *v { *d } else { fill });
        self.derive(data, ValidMask::from_elem(self.dim(), true))
    }

    /// Cells that are valid and strictly greater than `value`; masked cells are `false`
    pub fn gt(&self, value: CellValue) -> ValidMask {
        ndarray::Zip::from(&self.data)
            .and(&self.valid)
            .map_collect(|d, v| *v && *d > value)
    }

    /// Cells that are valid and at least `value`; masked cells are `false`
    pub fn gte(&self, value: CellValue) -> ValidMask {
        ndarray::Zip::from(&self.data)
            .and(&self.valid)
            .map_collect(|d, v| *v && *d >= value)
    }
}

/// Names of the product bands, in band order
pub const PRODUCT_BANDS: [&str; 3] = ["year", "total_biomass_loss", "density"];

/// Final three-band product at a single zoom level
#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub zoom: ZoomLevel,
    pub threshold: Threshold,
    pub scale: f64,
    pub crs: String,
    pub origin: (f64, f64),
    /// Dominant loss year (0 = no attributable year)
    pub year: Array2<u8>,
    /// Density-weighted loss in density units
    pub magnitude: Array2<u8>,
    /// Carbon density rescaled to 0..=255
    pub density: Array2<u8>,
}

impl Product {
    /// (rows, cols)
    pub fn dim(&self) -> (usize, usize) {
        self.year.dim()
    }

    /// Look up a band by its product name
    pub fn band(&self, name: &str) -> BiomassResult<&Array2<u8>> {
        match name {
            "year" => Ok(&self.year),
            "total_biomass_loss" => Ok(&self.magnitude),
            "density" => Ok(&self.density),
            _ => Err(BiomassError::MissingBand(name.to_string())),
        }
    }

    /// Bands in [`PRODUCT_BANDS`] order
    pub fn bands(&self) -> [&Array2<u8>; 3] {
        [&self.year, &self.magnitude, &self.density]
    }
}

/// Error types for biomass loss processing
#[derive(Debug, thiserror::Error)]
pub enum BiomassError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid zoom transition: {0}")]
    InvalidZoomTransition(String),

    #[error("Zoom level {0} is outside the zoom table (0..=12)")]
    InvalidZoom(u8),

    #[error("Invalid threshold {value}: choose from {allowed:?}")]
    InvalidThreshold { value: u8, allowed: Vec<u8> },

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No such band: {0}")]
    MissingBand(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("GDAL error: {0}")]
    Gdal(String),
}

#[cfg(feature = "gdal")]
impl From<gdal::errors::GdalError> for BiomassError {
    fn from(err: gdal::errors::GdalError) -> Self {
        Self::Gdal(err.to_string())
    }
}

/// Result type for biomass loss operations
pub type BiomassResult<T> = Result<T, BiomassError>;
