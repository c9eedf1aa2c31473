use crate::types::{
    BiomassError, BiomassResult, CellValue, Grid, Product, Raster, Threshold, ValidMask, ZoomLevel,
};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Density normalisation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DensityParams {
    /// Carbon density mapped to full scale (255)
    pub carbon_max: f32,
    /// Value written for full scale
    pub full_scale: f32,
}

impl Default for DensityParams {
    fn default() -> Self {
        Self {
            carbon_max: 450.0,
            full_scale: 255.0,
        }
    }
}

/// Packs dominant year, loss and carbon into the three-band product
pub struct BandComposer {
    params: DensityParams,
}

impl BandComposer {
    pub fn new(params: DensityParams) -> BiomassResult<Self> {
        if !(params.carbon_max.is_finite() && params.carbon_max > 0.0) {
            return Err(BiomassError::InvalidConfig(format!(
                "carbon_max must be positive, got {}",
                params.carbon_max
            )));
        }
        Ok(Self { params })
    }

    /// Carbon density rescaled to 0..=full_scale and truncated; masked where carbon is masked
    pub fn density(&self, carbon: &Raster) -> Raster {
        let carbon_max = self.params.carbon_max;
        let full_scale = self.params.full_scale;
        carbon.map(|c| (num_traits::clamp(c / carbon_max, 0.0, 1.0) * full_scale).trunc())
    }

    /// Density-weighted loss; `loss` is pre-scaled to 0..=255
    pub fn magnitude(&self, loss: &Raster, density: &Raster) -> BiomassResult<Raster> {
        loss.ensure_same_grid(density, "loss vs density")?;
        let data = Zip::from(loss.data())
            .and(density.data())
            .map_collect(|l, d| l / 255.0 * d);
        let valid = Zip::from(loss.valid())
            .and(density.valid())
            .map_collect(|a, b| *a && *b);
        Ok(loss.derive(data, valid))
    }

    /// Compose the final product; every band is unmasked to 0 and truncated to an integer
    pub fn compose(
        &self,
        dominant_year: &Raster,
        loss: &Raster,
        carbon: &Raster,
        loss_mask: &ValidMask,
        zoom: ZoomLevel,
        threshold: Threshold,
    ) -> BiomassResult<Product> {
        dominant_year.ensure_same_grid(loss, "dominant year vs loss")?;
        dominant_year.ensure_same_grid(carbon, "dominant year vs carbon")?;
        if loss_mask.dim() != loss.dim() {
            return Err(BiomassError::DimensionMismatch(format!(
                "loss mask is {:?} but loss is {:?}",
                loss_mask.dim(),
                loss.dim()
            )));
        }

        log::info!(
            "Composing product bands at {} for threshold {} ({}x{})",
            zoom,
            threshold,
            loss.dim().0,
            loss.dim().1
        );

        let density = self.density(carbon);
        let magnitude = self.magnitude(loss, &density)?.update_mask(loss_mask)?;
        let year = dominant_year.update_mask(loss_mask)?;

        Ok(Product {
            zoom,
            threshold,
            scale: loss.scale(),
            crs: loss.crs().to_string(),
            origin: loss.origin(),
            year: quantize(&year),
            magnitude: quantize(&magnitude),
            density: quantize(&density),
        })
    }
}

impl Default for BandComposer {
    fn default() -> Self {
        Self {
            params: DensityParams::default(),
        }
    }
}

/// Unmask to 0 and truncate into the u8 range
fn quantize(raster: &Raster) -> Array2<u8> {
    let filled: Grid = raster.unmask(0.0).data().clone();
    filled.mapv(|v: CellValue| {
        if v.is_finite() {
            v.trunc().clamp(0.0, u8::MAX as f32) as u8
        } else {
            0
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    const ALLOWED: [u8; 7] = [10, 15, 20, 25, 30, 50, 75];

    fn raster(data: Grid) -> Raster {
        Raster::new(data, 38.0, "EPSG:4326")
    }

    fn z12() -> ZoomLevel {
        ZoomLevel::new(12).unwrap()
    }

    #[test]
    fn test_density_scaling() {
        let composer = BandComposer::default();
        let density = composer.density(&raster(array![[40.0, 450.0, 900.0, -5.0]]));
        // 40 / 450 * 255 = 22.67 truncates to 22
        assert_eq!(density.data(), &array![[22.0, 255.0, 255.0, 0.0]]);
    }

    #[test]
    fn test_density_max_is_configurable() {
        let composer = BandComposer::new(DensityParams {
            carbon_max: 100.0,
            ..Default::default()
        })
        .unwrap();
        let density = composer.density(&raster(array![[40.0]]));
        assert_eq!(density.get(0, 0), Some(102.0));
        assert!(BandComposer::new(DensityParams { carbon_max: 0.0, full_scale: 255.0 }).is_err());
    }

    #[test]
    fn test_compose_masks_undisturbed_pixels() {
        let composer = BandComposer::default();
        let year = raster(array![[7.0, 4.0]]);
        let loss = raster(array![[255.0, 0.0]]);
        let carbon = raster(array![[40.0, 90.0]]);
        let mask = loss.gt(0.0);
        let t = Threshold::new(30, &ALLOWED).unwrap();

        let product = composer.compose(&year, &loss, &carbon, &mask, z12(), t).unwrap();
        assert_eq!(product.year, array![[7u8, 0]]);
        assert_eq!(product.magnitude, array![[22u8, 0]]);
        assert_eq!(product.density, array![[22u8, 51]]);
        assert_eq!(product.band("total_biomass_loss").unwrap(), &product.magnitude);
    }

    #[test]
    fn test_masked_carbon_becomes_zero() {
        let composer = BandComposer::default();
        let year = raster(array![[3.0]]);
        let loss = raster(array![[128.0]]);
        let carbon = Raster::with_mask(array![[300.0]], array![[false]], 38.0, "EPSG:4326").unwrap();
        let mask = loss.gt(0.0);
        let t = Threshold::new(10, &ALLOWED).unwrap();

        let product = composer.compose(&year, &loss, &carbon, &mask, z12(), t).unwrap();
        assert_eq!(product.density[[0, 0]], 0);
        assert_eq!(product.magnitude[[0, 0]], 0);
        assert_eq!(product.year[[0, 0]], 3);
    }

    #[test]
    fn test_partial_loss_scales_magnitude() {
        let composer = BandComposer::default();
        let density = raster(array![[200.0]]);
        let loss = raster(array![[127.5]]);
        let magnitude = composer.magnitude(&loss, &density).unwrap();
        assert_eq!(magnitude.get(0, 0), Some(100.0));
    }
}
