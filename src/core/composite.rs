use crate::core::mosaic::{BandStack, QualityMosaic};
use crate::types::{BiomassError, BiomassResult, Raster, ValidMask};
use ndarray::Zip;

/// Band holding the candidate year
pub const YEAR_BAND: &str = "year";
/// Band holding the carbon lost in the candidate year
pub const WEIGHT_BAND: &str = "loss";

/// Selects, per pixel, the disturbance year that lost the most carbon
pub struct YearCompositor {
    years: u8,
}

impl YearCompositor {
    /// Compositor over candidate years `1..=years`
    pub fn new(years: u8) -> Self {
        Self { years }
    }

    pub fn years(&self) -> u8 {
        self.years
    }

    /// Candidate layer for one year: constant `year` band plus carbon lost where
    /// the pixel's loss year equals `year`, masked to disturbed pixels.
    pub fn candidate(
        &self,
        year: u8,
        loss_year: &Raster,
        carbon: &Raster,
        loss_year_mask: &ValidMask,
    ) -> BiomassResult<BandStack> {
        loss_year.ensure_same_grid(carbon, "loss year vs carbon")?;
        let target = year as f32;
        let weight = Zip::from(loss_year.data())
            .and(loss_year.valid())
            .and(carbon.data())
            .and(carbon.valid())
            .map_collect(|ly, ly_valid, c, c_valid| {
                let year_match = *ly_valid && *ly == target;
                if year_match && *c_valid {
                    *c
                } else {
                    0.0
                }
            });
        let weight = carbon.derive(weight, carbon.valid().clone());

        BandStack::new()
            .add_band(YEAR_BAND, carbon.filled_like(target))?
            .add_band(WEIGHT_BAND, weight)?
            .update_mask(loss_year_mask)
    }

    /// Dominant loss year per pixel; 0 where no year lost any carbon
    pub fn composite_year(
        &self,
        loss_year: &Raster,
        carbon: &Raster,
        loss_year_mask: &ValidMask,
    ) -> BiomassResult<Raster> {
        loss_year.ensure_same_grid(carbon, "loss year vs carbon")?;
        if loss_year_mask.dim() != loss_year.dim() {
            return Err(BiomassError::DimensionMismatch(format!(
                "loss year mask is {:?} but loss year is {:?}",
                loss_year_mask.dim(),
                loss_year.dim()
            )));
        }
        if self.years == 0 {
            return Err(BiomassError::InvalidConfig(
                "at least one candidate year is required".to_string(),
            ));
        }

        let (rows, cols) = loss_year.dim();
        log::info!(
            "Compositing dominant loss year over years 1..={} for {}x{} grid",
            self.years, rows, cols
        );

        let mut mosaic = QualityMosaic::new(WEIGHT_BAND);
        for year in 1..=self.years {
            let candidate = self.candidate(year, loss_year, carbon, loss_year_mask)?;
            mosaic.offer(&candidate)?;
        }

        let dominant = mosaic.finish()?.select(YEAR_BAND)?.unmask(0.0);
        log::debug!(
            "Dominant year assigned to {} of {} pixels",
            dominant.data().iter().filter(|y| **y > 0.0).count(),
            dominant.len()
        );
        Ok(dominant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Grid;
    use ndarray::array;

    fn raster(data: Grid) -> Raster {
        Raster::new(data, 38.0, "EPSG:4326")
    }

    #[test]
    fn test_picks_pixel_loss_year() {
        let loss_year = raster(array![[7.0, 3.0], [0.0, 19.0]]);
        let carbon = raster(array![[40.0, 10.0], [50.0, 5.0]]);
        let mask = loss_year.gt(0.0);

        let out = YearCompositor::new(19)
            .composite_year(&loss_year, &carbon, &mask)
            .unwrap();
        assert_eq!(out.data(), &array![[7.0, 3.0], [0.0, 19.0]]);
        assert_eq!(out.valid_count(), 4);
    }

    #[test]
    fn test_zero_carbon_yields_year_zero() {
        let loss_year = raster(array![[5.0]]);
        let carbon = raster(array![[0.0]]);
        let mask = loss_year.gt(0.0);

        let out = YearCompositor::new(19)
            .composite_year(&loss_year, &carbon, &mask)
            .unwrap();
        assert_eq!(out.get(0, 0), Some(0.0));
    }

    #[test]
    fn test_years_outside_range_are_ignored() {
        let loss_year = raster(array![[12.0]]);
        let carbon = raster(array![[30.0]]);
        let mask = loss_year.gt(0.0);

        let out = YearCompositor::new(10)
            .composite_year(&loss_year, &carbon, &mask)
            .unwrap();
        assert_eq!(out.get(0, 0), Some(0.0));
    }

    #[test]
    fn test_candidate_weights() {
        let loss_year = raster(array![[2.0, 4.0]]);
        let carbon = raster(array![[8.0, 9.0]]);
        let mask = array![[true, false]];
        let stack = YearCompositor::new(19)
            .candidate(2, &loss_year, &carbon, &mask)
            .unwrap();

        let weight = stack.band(WEIGHT_BAND).unwrap();
        assert_eq!(weight.get(0, 0), Some(8.0));
        assert_eq!(weight.get(0, 1), None);
        assert_eq!(stack.band(YEAR_BAND).unwrap().get(0, 0), Some(2.0));
    }

    #[test]
    fn test_rejects_mismatched_inputs() {
        let loss_year = raster(Grid::zeros((2, 2)));
        let carbon = raster(Grid::zeros((2, 3)));
        let mask = loss_year.gt(0.0);
        let err = YearCompositor::new(19).composite_year(&loss_year, &carbon, &mask);
        assert!(matches!(err, Err(BiomassError::DimensionMismatch(_))));
    }
}
