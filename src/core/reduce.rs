use crate::types::{
    same_scale, BiomassError, BiomassResult, CellValue, Grid, Raster, ReducerKind, ValidMask,
    ZOOM_SCALES,
};
use std::collections::BTreeMap;

/// Platform limit on source pixels fed to one reducer invocation
pub const DEFAULT_MAX_PIXELS: usize = 65_500;

/// Resolution reduction parameters
#[derive(Debug, Clone)]
pub struct ReduceParams {
    /// Maximum number of source cells a single reducer invocation may process
    pub max_pixels: usize,
}

impl Default for ReduceParams {
    fn default() -> Self {
        Self {
            max_pixels: DEFAULT_MAX_PIXELS,
        }
    }
}

/// Bookkeeping from one reduction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReduceReport {
    /// Output cells computed
    pub blocks: usize,
    /// Reducer invocations, at least one per block
    pub invocations: usize,
    /// Largest number of source cells seen by one invocation
    pub largest_invocation: usize,
    /// Output cells whose block had no valid source cell
    pub empty_blocks: usize,
}

impl ReduceReport {
    fn merge(mut self, other: ReduceReport) -> Self {
        self.blocks += other.blocks;
        self.invocations += other.invocations;
        self.largest_invocation = self.largest_invocation.max(other.largest_invocation);
        self.empty_blocks += other.empty_blocks;
        self
    }
}

/// Half-open source index range covered by one output row or column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Span {
    pub start: usize,
    pub end: usize,
}

/// Number of output cells along an axis of `len` source cells coarsened by `factor`.
///
/// Each source cell belongs to the output cell containing its centre, so the
/// last output cell always receives at least one source cell.
pub(crate) fn coarsened_len(len: usize, factor: f64) -> usize {
    if len == 0 {
        return 0;
    }
    ((len as f64 - 0.5) / factor).floor() as usize + 1
}

/// Source spans for each output cell along one axis
pub(crate) fn block_spans(len: usize, factor: f64) -> Vec<Span> {
    let out_len = coarsened_len(len, factor);
    let mut spans = vec![Span { start: 0, end: 0 }; out_len];
    let mut seen = vec![false; out_len];
    for i in 0..len {
        let k = (((i as f64 + 0.5) / factor).floor() as usize).min(out_len - 1);
        if !seen[k] {
            spans[k].start = i;
            seen[k] = true;
        }
        spans[k].end = i + 1;
    }
    spans
}

/// Partial result of a reducer over a subset of a block
#[derive(Debug, Clone)]
enum Partial {
    Mean { sum: f64, count: u64 },
    Mode { counts: BTreeMap<i64, u64> },
}

impl Partial {
    fn empty(kind: ReducerKind) -> Self {
        match kind {
            ReducerKind::Mean => Partial::Mean { sum: 0.0, count: 0 },
            ReducerKind::Mode => Partial::Mode {
                counts: BTreeMap::new(),
            },
        }
    }

    /// Fold one chunk of (value, valid) cells into the partial result
    fn absorb(&mut self, chunk: &[(CellValue, bool)]) {
        match self {
            Partial::Mean { sum, count } => {
                for &(v, valid) in chunk {
                    if valid && v.is_finite() {
                        *sum += v as f64;
                        *count += 1;
                    }
                }
            }
            Partial::Mode { counts } => {
                for &(v, valid) in chunk {
                    // zero means "no class" and never votes
                    if valid && v.is_finite() && v != 0.0 {
                        *counts.entry(v.round() as i64).or_insert(0) += 1;
                    }
                }
            }
        }
    }

    /// Final value, or `None` when no valid cell contributed
    fn finish(&self) -> Option<CellValue> {
        match self {
            Partial::Mean { sum, count } => {
                if *count == 0 {
                    None
                } else {
                    Some((*sum / *count as f64) as CellValue)
                }
            }
            Partial::Mode { counts } => {
                // BTreeMap iterates in ascending class order; strict `>` keeps the lowest class on ties
                let mut best: Option<(i64, u64)> = None;
                for (&class, &n) in counts {
                    match best {
                        Some((_, best_n)) if n <= best_n => {}
                        _ => best = Some((class, n)),
                    }
                }
                best.map(|(class, _)| class as CellValue)
            }
        }
    }
}

/// Aggregates rasters from a finer to a coarser ground sample distance
pub struct GridReducer {
    params: ReduceParams,
}

impl GridReducer {
    pub fn new(params: ReduceParams) -> Self {
        Self { params }
    }

    /// Reducer with the platform default pixel cap
    pub fn standard() -> Self {
        Self::new(ReduceParams::default())
    }

    pub fn max_pixels(&self) -> usize {
        self.params.max_pixels
    }

    /// Reduce `raster` to `target_scale` with the given reducer
    pub fn reduce(
        &self,
        raster: &Raster,
        kind: ReducerKind,
        target_scale: f64,
    ) -> BiomassResult<Raster> {
        self.reduce_with_report(raster, kind, target_scale)
            .map(|(reduced, _)| reduced)
    }

    /// Reduce `raster` to `target_scale` and report how the work was split
    pub fn reduce_with_report(
        &self,
        raster: &Raster,
        kind: ReducerKind,
        target_scale: f64,
    ) -> BiomassResult<(Raster, ReduceReport)> {
        if same_scale(raster.scale(), target_scale) {
            log::debug!("Target scale {}m equals source scale, skipping {} reduction", target_scale, kind);
            return Ok((raster.clone(), ReduceReport::default()));
        }
        self.validate_target(raster.scale(), target_scale)?;
        if self.params.max_pixels == 0 {
            return Err(BiomassError::InvalidConfig(
                "max_pixels must be at least 1".to_string(),
            ));
        }

        let (rows, cols) = raster.dim();
        let factor = target_scale / raster.scale();
        let row_spans = block_spans(rows, factor);
        let col_spans = block_spans(cols, factor);
        let (out_rows, out_cols) = (row_spans.len(), col_spans.len());

        log::info!(
            "Reducing {}x{} raster with {}: {}m -> {}m ({}x{} output)",
            rows, cols, kind, raster.scale(), target_scale, out_rows, out_cols
        );

        let reduce_row = |span: &Span| self.reduce_row(raster, kind, *span, &col_spans);

        #[cfg(feature = "parallel")]
        let row_results: Vec<(Vec<Option<CellValue>>, ReduceReport)> = {
            use rayon::prelude::*;
            row_spans.par_iter().map(reduce_row).collect()
        };
        #[cfg(not(feature = "parallel"))]
        let row_results: Vec<(Vec<Option<CellValue>>, ReduceReport)> =
            row_spans.iter().map(reduce_row).collect();

        let mut data = Grid::zeros((out_rows, out_cols));
        let mut valid = ValidMask::from_elem((out_rows, out_cols), false);
        let mut report = ReduceReport::default();
        for (r, (cells, row_report)) in row_results.into_iter().enumerate() {
            for (c, cell) in cells.into_iter().enumerate() {
                if let Some(v) = cell {
                    data[[r, c]] = v;
                    valid[[r, c]] = true;
                }
            }
            report = report.merge(row_report);
        }

        if report.empty_blocks == report.blocks && report.blocks > 0 {
            log::warn!("{} reduction produced no valid cells", kind);
        }
        log::debug!("Reduction report: {:?}", report);

        Ok((raster.derive_rescaled(data, valid, target_scale), report))
    }

    /// Resample `raster` to `target_scale` by sampling the source cell under each
    /// output cell centre; the output grid matches [`GridReducer::reduce`].
    pub fn resample_nearest(&self, raster: &Raster, target_scale: f64) -> BiomassResult<Raster> {
        if same_scale(raster.scale(), target_scale) {
            return Ok(raster.clone());
        }
        self.validate_target(raster.scale(), target_scale)?;

        let (rows, cols) = raster.dim();
        let factor = target_scale / raster.scale();
        let out_rows = coarsened_len(rows, factor);
        let out_cols = coarsened_len(cols, factor);
        log::info!(
            "Nearest resampling {}x{} raster: {}m -> {}m ({}x{} output)",
            rows, cols, raster.scale(), target_scale, out_rows, out_cols
        );

        let sample = |k: usize, len: usize| (((k as f64 + 0.5) * factor).floor() as usize).min(len - 1);
        let data = Grid::from_shape_fn((out_rows, out_cols), |(r, c)| {
            raster.data()[[sample(r, rows), sample(c, cols)]]
        });
        let valid = ValidMask::from_shape_fn((out_rows, out_cols), |(r, c)| {
            raster.valid()[[sample(r, rows), sample(c, cols)]]
        });
        Ok(raster.derive_rescaled(data, valid, target_scale))
    }

    /// Reduction only ever coarsens, and never past the coarsest zoom
    fn validate_target(&self, source_scale: f64, target_scale: f64) -> BiomassResult<()> {
        let coarsest = ZOOM_SCALES[0];
        if !(target_scale.is_finite() && target_scale > 0.0) {
            return Err(BiomassError::InvalidZoomTransition(format!(
                "target scale {} is not a positive ground distance",
                target_scale
            )));
        }
        if target_scale > coarsest && !same_scale(target_scale, coarsest) {
            return Err(BiomassError::InvalidZoomTransition(format!(
                "target scale {}m is coarser than the coarsest zoom ({}m)",
                target_scale, coarsest
            )));
        }
        if target_scale < source_scale {
            return Err(BiomassError::InvalidZoomTransition(format!(
                "target scale {}m is finer than source scale {}m",
                target_scale, source_scale
            )));
        }
        Ok(())
    }

    fn reduce_row(
        &self,
        raster: &Raster,
        kind: ReducerKind,
        row_span: Span,
        col_spans: &[Span],
    ) -> (Vec<Option<CellValue>>, ReduceReport) {
        let mut report = ReduceReport::default();
        let mut buffer: Vec<(CellValue, bool)> = Vec::new();
        let cells = col_spans
            .iter()
            .map(|col_span| {
                buffer.clear();
                for r in row_span.start..row_span.end {
                    for c in col_span.start..col_span.end {
                        buffer.push((raster.data()[[r, c]], raster.valid()[[r, c]]));
                    }
                }

                let mut partial = Partial::empty(kind);
                for chunk in buffer.chunks(self.params.max_pixels) {
                    partial.absorb(chunk);
                    report.invocations += 1;
                    report.largest_invocation = report.largest_invocation.max(chunk.len());
                }
                report.blocks += 1;

                let value = partial.finish();
                if value.is_none() {
                    report.empty_blocks += 1;
                }
                value
            })
            .collect();
        (cells, report)
    }
}

impl Default for GridReducer {
    fn default() -> Self {
        Self::standard()
    }
}
