use crate::types::{BiomassError, BiomassResult, Raster, Threshold};
use std::collections::HashMap;

/// Supplier of native-resolution input layers
pub trait RasterSource {
    /// Binary loss (0/255) pre-thresholded at `threshold` percent tree cover
    fn loss(&self, threshold: Threshold) -> BiomassResult<Raster>;

    /// Per-pixel loss year (0 = no loss, otherwise 1..=N)
    fn loss_year(&self) -> BiomassResult<Raster>;

    /// Carbon density
    fn carbon(&self) -> BiomassResult<Raster>;

    /// Tree-cover percentage in the baseline year
    fn treecover(&self) -> BiomassResult<Raster>;
}

/// Input layers held in memory
#[derive(Debug, Clone)]
pub struct InMemorySource {
    loss: HashMap<u8, Raster>,
    loss_year: Raster,
    carbon: Raster,
    treecover: Raster,
}

impl InMemorySource {
    pub fn new(loss_year: Raster, carbon: Raster, treecover: Raster) -> Self {
        Self {
            loss: HashMap::new(),
            loss_year,
            carbon,
            treecover,
        }
    }

    /// Register the loss layer for one threshold
    pub fn with_loss(mut self, threshold: u8, loss: Raster) -> Self {
        self.loss.insert(threshold, loss);
        self
    }
}

impl RasterSource for InMemorySource {
    fn loss(&self, threshold: Threshold) -> BiomassResult<Raster> {
        self.loss
            .get(&threshold.value())
            .cloned()
            .ok_or_else(|| BiomassError::MissingBand(threshold.loss_band_name()))
    }

    fn loss_year(&self) -> BiomassResult<Raster> {
        Ok(self.loss_year.clone())
    }

    fn carbon(&self) -> BiomassResult<Raster> {
        Ok(self.carbon.clone())
    }

    fn treecover(&self) -> BiomassResult<Raster> {
        Ok(self.treecover.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Grid;

    #[test]
    fn test_missing_loss_threshold() {
        let r = Raster::new(Grid::zeros((1, 1)), 38.0, "EPSG:4326");
        let source = InMemorySource::new(r.clone(), r.clone(), r.clone()).with_loss(30, r);
        let allowed = [10, 30];
        assert!(source.loss(Threshold::new(30, &allowed).unwrap()).is_ok());
        match source.loss(Threshold::new(10, &allowed).unwrap()) {
            Err(BiomassError::MissingBand(name)) => assert_eq!(name, "loss_10"),
            other => panic!("expected MissingBand, got {:?}", other),
        }
    }
}
