//! Per-pixel argmax compositing ("quality mosaic").
//!
//! A [`BandStack`] is a set of named single-band rasters on one grid. A
//! [`QualityMosaic`] consumes stacks one at a time and keeps, for every pixel,
//! all band values of the stack whose quality band is largest there. Only the
//! running winner is held in memory, so any number of candidates can be
//! streamed through it.
//!
//! Ties keep the earlier candidate. A pixel whose quality is masked in a
//! candidate is not offered by that candidate. Pixels whose best quality is not
//! strictly positive count as having no winner.

use crate::types::{BiomassError, BiomassResult, CellValue, Grid, Raster, ValidMask};
use ndarray::Zip;

/// Named single-band rasters sharing one grid
#[derive(Debug, Clone, PartialEq)]
pub struct BandStack {
    names: Vec<String>,
    bands: Vec<Raster>,
}

impl BandStack {
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            bands: Vec::new(),
        }
    }

    /// Append a band; it must share the grid of the bands already present
    pub fn add_band(mut self, name: impl Into<String>, band: Raster) -> BiomassResult<Self> {
        let name = name.into();
        if self.names.contains(&name) {
            return Err(BiomassError::Processing(format!("duplicate band name '{}'", name)));
        }
        if let Some(first) = self.bands.first() {
            first.ensure_same_grid(&band, &format!("band '{}'", name))?;
        }
        self.names.push(name);
        self.bands.push(band);
        Ok(self)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    /// Band by name
    pub fn band(&self, name: &str) -> BiomassResult<&Raster> {
        self.position(name).map(|i| &self.bands[i])
    }

    /// Consume the stack and keep a single band
    pub fn select(mut self, name: &str) -> BiomassResult<Raster> {
        let i = self.position(name)?;
        Ok(self.bands.swap_remove(i))
    }

    /// Mask every band where `keep` is false
    pub fn update_mask(&self, keep: &ValidMask) -> BiomassResult<Self> {
        let bands = self
            .bands
            .iter()
            .map(|b| b.update_mask(keep))
            .collect::<BiomassResult<Vec<_>>>()?;
        Ok(Self {
            names: self.names.clone(),
            bands,
        })
    }

    fn position(&self, name: &str) -> BiomassResult<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| BiomassError::MissingBand(name.to_string()))
    }
}

impl Default for BandStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Streaming per-pixel argmax over candidate band stacks
pub struct QualityMosaic {
    quality_band: String,
    state: Option<MosaicState>,
    offered: usize,
}

struct MosaicState {
    template: BandStack,
    best_quality: Grid,
    has_winner: ValidMask,
    values: Vec<Grid>,
}

impl QualityMosaic {
    /// Mosaic ranking candidates by the band named `quality_band`
    pub fn new(quality_band: impl Into<String>) -> Self {
        Self {
            quality_band: quality_band.into(),
            state: None,
            offered: 0,
        }
    }

    /// Number of candidates offered so far
    pub fn offered(&self) -> usize {
        self.offered
    }

    /// Offer one candidate; it replaces the running winner wherever its quality is strictly greater
    pub fn offer(&mut self, candidate: &BandStack) -> BiomassResult<()> {
        let quality = candidate.band(&self.quality_band)?;

        if let Some(state) = &self.state {
            if state.template.names() != candidate.names() {
                return Err(BiomassError::Processing(format!(
                    "candidate bands {:?} differ from {:?}",
                    candidate.names(),
                    state.template.names()
                )));
            }
            if let Some(first) = state.template.bands.first() {
                first.ensure_same_grid(quality, "mosaic candidate")?;
            }
        }

        let mut state = match self.state.take() {
            Some(state) => state,
            None => MosaicState {
                template: candidate.clone(),
                best_quality: Grid::zeros(quality.dim()),
                has_winner: ValidMask::from_elem(quality.dim(), false),
                values: candidate.bands.iter().map(|b| Grid::zeros(b.dim())).collect(),
            },
        };

        // pixels where this candidate takes the lead
        let mut wins = ValidMask::from_elem(quality.dim(), false);
        let update = |win: &mut bool, best: &mut CellValue, has: &mut bool, q: &CellValue, v: &bool| {
            if *v && q.is_finite() && (!*has || *q > *best) {
                *best = *q;
                *has = true;
                *win = true;
            }
        };

        #[cfg(feature = "parallel")]
        Zip::from(&mut wins)
            .and(&mut state.best_quality)
            .and(&mut state.has_winner)
            .and(quality.data())
            .and(quality.valid())
            .par_for_each(update);
        #[cfg(not(feature = "parallel"))]
        Zip::from(&mut wins)
            .and(&mut state.best_quality)
            .and(&mut state.has_winner)
            .and(quality.data())
            .and(quality.valid())
            .for_each(update);

        for (value, band) in state.values.iter_mut().zip(candidate.bands.iter()) {
            Zip::from(value)
                .and(&wins)
                .and(band.data())
                .for_each(|out, w, v| {
                    if *w {
                        *out = *v;
                    }
                });
        }

        self.offered += 1;
        self.state = Some(state);
        Ok(())
    }

    /// The winning band values; pixels with no positive-quality winner are masked
    pub fn finish(self) -> BiomassResult<BandStack> {
        let state = self.state.ok_or_else(|| {
            BiomassError::Processing("quality mosaic received no candidates".to_string())
        })?;
        log::debug!("Quality mosaic over {} candidates finished", self.offered);

        let winner = Zip::from(&state.has_winner)
            .and(&state.best_quality)
            .map_collect(|has, q| *has && *q > 0.0);

        let mut out = BandStack::new();
        for ((name, template), values) in state
            .template
            .names
            .iter()
            .zip(state.template.bands.iter())
            .zip(state.values.into_iter())
        {
            out = out.add_band(name.clone(), template.derive(values, winner.clone()))?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn band(data: Grid) -> Raster {
        Raster::new(data, 38.0, "EPSG:4326")
    }

    fn candidate(id: f32, quality: Grid) -> BandStack {
        let id_band = band(Grid::from_elem(quality.dim(), id));
        BandStack::new()
            .add_band("id", id_band)
            .unwrap()
            .add_band("q", band(quality))
            .unwrap()
    }

    #[test]
    fn test_picks_max_quality_per_pixel() {
        let mut mosaic = QualityMosaic::new("q");
        mosaic.offer(&candidate(1.0, array![[5.0, 1.0]])).unwrap();
        mosaic.offer(&candidate(2.0, array![[3.0, 4.0]])).unwrap();
        let out = mosaic.finish().unwrap();

        let ids = out.band("id").unwrap();
        assert_eq!(ids.get(0, 0), Some(1.0));
        assert_eq!(ids.get(0, 1), Some(2.0));
        assert_eq!(out.band("q").unwrap().get(0, 1), Some(4.0));
    }

    #[test]
    fn test_ties_keep_first_candidate() {
        let mut mosaic = QualityMosaic::new("q");
        for id in 1..=4 {
            mosaic.offer(&candidate(id as f32, array![[2.0]])).unwrap();
        }
        let out = mosaic.finish().unwrap().select("id").unwrap();
        assert_eq!(out.get(0, 0), Some(1.0));
    }

    #[test]
    fn test_zero_quality_has_no_winner() {
        let mut mosaic = QualityMosaic::new("q");
        mosaic.offer(&candidate(1.0, array![[0.0]])).unwrap();
        mosaic.offer(&candidate(2.0, array![[0.0]])).unwrap();
        let out = mosaic.finish().unwrap().select("id").unwrap();
        assert_eq!(out.get(0, 0), None);
    }

    #[test]
    fn test_masked_quality_is_not_offered() {
        let mut mosaic = QualityMosaic::new("q");
        let masked = candidate(1.0, array![[9.0]])
            .update_mask(&array![[false]])
            .unwrap();
        mosaic.offer(&masked).unwrap();
        mosaic.offer(&candidate(2.0, array![[1.0]])).unwrap();
        let out = mosaic.finish().unwrap().select("id").unwrap();
        assert_eq!(out.get(0, 0), Some(2.0));
    }

    #[test]
    fn test_rejects_mismatched_candidates() {
        let mut mosaic = QualityMosaic::new("q");
        mosaic.offer(&candidate(1.0, array![[1.0, 2.0]])).unwrap();
        assert!(mosaic.offer(&candidate(2.0, array![[1.0]])).is_err());
        assert!(QualityMosaic::new("missing").offer(&candidate(1.0, array![[1.0]])).is_err());
        assert!(QualityMosaic::new("q").finish().is_err());
    }
}
