use crate::core::bands::{BandComposer, DensityParams};
use crate::core::composite::YearCompositor;
use crate::core::pyramid::{PyramidBuilder, PyramidLevel};
use crate::core::reduce::{GridReducer, ReduceParams, DEFAULT_MAX_PIXELS};
use crate::io::RasterSource;
use crate::types::{same_scale, BiomassError, BiomassResult, Product, Raster, Threshold, ZoomLevel};
use serde::{Deserialize, Serialize};

/// Pipeline configuration; one value is shared by every product of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Max source pixels per reducer invocation
    pub max_pixels: usize,
    /// Carbon density mapped to full-scale density
    pub carbon_max: f32,
    /// Candidate loss years are 1..=years
    pub years: u8,
    pub crs: String,
    /// Ground sample distance of the native input rasters in metres
    pub native_scale: f64,
    /// Allowed tree-cover thresholds
    pub thresholds: Vec<u8>,
    /// Finest zoom, computed directly from native inputs
    pub start_zoom: u8,
    /// Zooms at or below this are computed from split data at `split_zoom + 1`
    pub split_zoom: u8,
    /// Coarsest zoom produced
    pub end_zoom: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_pixels: DEFAULT_MAX_PIXELS,
            carbon_max: 450.0,
            years: 19,
            crs: "EPSG:4326".to_string(),
            native_scale: 27.829872698318393,
            thresholds: vec![10, 15, 20, 25, 30, 50, 75],
            start_zoom: 12,
            split_zoom: 6,
            end_zoom: 2,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> BiomassResult<()> {
        if self.max_pixels == 0 {
            return Err(BiomassError::InvalidConfig("max_pixels must be at least 1".to_string()));
        }
        if !(self.carbon_max.is_finite() && self.carbon_max > 0.0) {
            return Err(BiomassError::InvalidConfig(format!(
                "carbon_max must be positive, got {}",
                self.carbon_max
            )));
        }
        if self.years == 0 {
            return Err(BiomassError::InvalidConfig("years must be at least 1".to_string()));
        }
        if self.thresholds.is_empty() {
            return Err(BiomassError::InvalidConfig("no thresholds configured".to_string()));
        }
        if !(self.native_scale.is_finite() && self.native_scale > 0.0) {
            return Err(BiomassError::InvalidConfig(format!(
                "native_scale must be positive, got {}",
                self.native_scale
            )));
        }
        ZoomLevel::new(self.start_zoom)?;
        if !(self.end_zoom <= self.split_zoom && self.split_zoom < self.start_zoom) {
            return Err(BiomassError::InvalidConfig(format!(
                "zoom schedule must satisfy end <= split < start, got end={} split={} start={}",
                self.end_zoom, self.split_zoom, self.start_zoom
            )));
        }
        Ok(())
    }

    /// Validate a threshold against the configured set
    pub fn threshold(&self, value: u8) -> BiomassResult<Threshold> {
        Threshold::new(value, &self.thresholds)
    }

    pub fn reduce_params(&self) -> ReduceParams {
        ReduceParams {
            max_pixels: self.max_pixels,
        }
    }

    pub fn density_params(&self) -> DensityParams {
        DensityParams {
            carbon_max: self.carbon_max,
            ..Default::default()
        }
    }
}

/// Order in which zoom levels are produced for one threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoomPlan {
    /// Zooms computed from native inputs, finest last
    pub inside: Vec<ZoomLevel>,
    /// Zooms computed from split data, finest last
    pub outside: Vec<ZoomLevel>,
    /// Zoom at which split data is captured
    pub split_source: ZoomLevel,
}

impl ZoomPlan {
    pub fn from_config(config: &PipelineConfig) -> BiomassResult<Self> {
        config.validate()?;
        let inside = (config.split_zoom + 1..=config.start_zoom)
            .map(ZoomLevel::new)
            .collect::<BiomassResult<Vec<_>>>()?;
        let outside = (config.end_zoom..=config.split_zoom)
            .map(ZoomLevel::new)
            .collect::<BiomassResult<Vec<_>>>()?;
        Ok(Self {
            inside,
            outside,
            split_source: ZoomLevel::new(config.split_zoom + 1)?,
        })
    }

    /// Every zoom of the plan, inside zooms first
    pub fn zooms(&self) -> impl Iterator<Item = ZoomLevel> + '_ {
        self.inside.iter().chain(self.outside.iter()).copied()
    }
}

/// Reduced loss, loss year and carbon persisted at one zoom for reuse by coarser zooms
#[derive(Debug, Clone, PartialEq)]
pub struct SplitData {
    pub zoom: ZoomLevel,
    pub threshold: Threshold,
    pub loss: Raster,
    pub loss_year: Raster,
    pub carbon: Raster,
}

/// Forest-masked native inputs for one threshold
struct PreparedInputs {
    loss: Raster,
    loss_year: Raster,
    carbon: Raster,
}

/// Computes biomass loss products from a raster source
pub struct ProductPipeline<S: RasterSource> {
    config: PipelineConfig,
    source: S,
    reducer: GridReducer,
    composer: BandComposer,
}

impl<S: RasterSource> ProductPipeline<S> {
    pub fn new(config: PipelineConfig, source: S) -> BiomassResult<Self> {
        config.validate()?;
        let reducer = GridReducer::new(config.reduce_params());
        let composer = BandComposer::new(config.density_params())?;
        Ok(Self {
            config,
            source,
            reducer,
            composer,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Product for `threshold` at `target_zoom`, from native inputs aligned to `native_zoom`
    pub fn run(
        &self,
        threshold: u8,
        target_zoom: ZoomLevel,
        native_zoom: ZoomLevel,
    ) -> BiomassResult<Product> {
        let threshold = self.config.threshold(threshold)?;
        log::info!(
            "Running product pipeline: threshold {}, {} from {}",
            threshold,
            target_zoom,
            native_zoom
        );
        let inputs = self.prepare_inputs(threshold)?;
        let level = PyramidBuilder::new(&self.reducer).build(
            &inputs.loss,
            &inputs.loss_year,
            &inputs.carbon,
            target_zoom,
            native_zoom,
        )?;
        self.product_from_level(&level, threshold)
    }

    /// Reduced inputs at `zoom`, for persisting and feeding [`ProductPipeline::run_from_split`]
    pub fn split_data(&self, threshold: u8, zoom: ZoomLevel) -> BiomassResult<SplitData> {
        let threshold = self.config.threshold(threshold)?;
        let inputs = self.prepare_inputs(threshold)?;
        let level = PyramidBuilder::new(&self.reducer).build(
            &inputs.loss,
            &inputs.loss_year,
            &inputs.carbon,
            zoom,
            self.native_zoom()?,
        )?;
        Ok(split_from_level(level, threshold))
    }

    /// Product at `target_zoom` computed from previously reduced split data
    pub fn run_from_split(&self, split: &SplitData, target_zoom: ZoomLevel) -> BiomassResult<Product> {
        log::info!(
            "Running product pipeline from split data at {}: threshold {}, target {}",
            split.zoom,
            split.threshold,
            target_zoom
        );
        let level = PyramidBuilder::new(&self.reducer).build(
            &split.loss,
            &split.loss_year,
            &split.carbon,
            target_zoom,
            split.zoom,
        )?;
        self.product_from_level(&level, split.threshold)
    }

    /// Every product of the configured zoom schedule for `threshold`, in [`ZoomPlan::zooms`] order
    pub fn run_all(&self, threshold: u8) -> BiomassResult<Vec<Product>> {
        let threshold = self.config.threshold(threshold)?;
        let plan = ZoomPlan::from_config(&self.config)?;
        let native_zoom = self.native_zoom()?;
        let inputs = self.prepare_inputs(threshold)?;
        let builder = PyramidBuilder::new(&self.reducer);

        let mut products = Vec::with_capacity(plan.inside.len() + plan.outside.len());
        let mut split: Option<SplitData> = None;
        for &zoom in &plan.inside {
            let level = builder.build(
                &inputs.loss,
                &inputs.loss_year,
                &inputs.carbon,
                zoom,
                native_zoom,
            )?;
            products.push(self.product_from_level(&level, threshold)?);
            if zoom == plan.split_source {
                split = Some(split_from_level(level, threshold));
            }
        }

        if !plan.outside.is_empty() {
            let split = split.ok_or_else(|| {
                BiomassError::Processing(format!("split data at {} was not produced", plan.split_source))
            })?;
            for &zoom in &plan.outside {
                products.push(self.run_from_split(&split, zoom)?);
            }
        }

        log::info!("Produced {} zoom levels for threshold {}", products.len(), threshold);
        Ok(products)
    }

    fn native_zoom(&self) -> BiomassResult<ZoomLevel> {
        ZoomLevel::new(self.config.start_zoom)
    }

    /// Load inputs and restrict carbon to pixels with at least `threshold` percent tree cover
    fn prepare_inputs(&self, threshold: Threshold) -> BiomassResult<PreparedInputs> {
        let loss = self.source.loss(threshold)?;
        let loss_year = self.source.loss_year()?;
        let carbon = self.source.carbon()?;
        let treecover = self.source.treecover()?;

        loss.ensure_same_grid(&loss_year, "loss vs loss year")?;
        loss.ensure_same_grid(&carbon, "loss vs carbon")?;
        loss.ensure_same_grid(&treecover, "loss vs tree cover")?;
        if loss.crs() != self.config.crs {
            return Err(BiomassError::DimensionMismatch(format!(
                "inputs are in {} but the pipeline expects {}",
                loss.crs(),
                self.config.crs
            )));
        }

        if !same_scale(loss.scale(), self.config.native_scale) {
            log::warn!(
                "Input scale {}m differs from configured native scale {}m",
                loss.scale(),
                self.config.native_scale
            );
        }

        let forest = treecover.gte(threshold.value() as f32);
        let carbon = carbon.update_mask(&forest)?.unmask(0.0);
        log::debug!(
            "Tree cover >= {}%: {} of {} pixels",
            threshold,
            forest.iter().filter(|f| **f).count(),
            forest.len()
        );

        Ok(PreparedInputs {
            loss,
            loss_year,
            carbon,
        })
    }

    fn product_from_level(&self, level: &PyramidLevel, threshold: Threshold) -> BiomassResult<Product> {
        let dominant_year = YearCompositor::new(self.config.years).composite_year(
            &level.loss_year,
            &level.carbon,
            &level.loss_year_mask,
        )?;
        let loss_mask = level.loss.gt(0.0);
        self.composer.compose(
            &dominant_year,
            &level.loss,
            &level.carbon,
            &loss_mask,
            level.zoom,
            threshold,
        )
    }
}

fn split_from_level(level: PyramidLevel, threshold: Threshold) -> SplitData {
    SplitData {
        zoom: level.zoom,
        threshold,
        loss: level.loss,
        loss_year: level.loss_year,
        carbon: level.carbon,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_pixels, 65_500);
        assert!(config.threshold(30).is_ok());
        assert!(matches!(
            config.threshold(35),
            Err(BiomassError::InvalidThreshold { .. })
        ));
    }

    #[test]
    fn test_invalid_configs() {
        let bad = [
            PipelineConfig { max_pixels: 0, ..Default::default() },
            PipelineConfig { carbon_max: -1.0, ..Default::default() },
            PipelineConfig { years: 0, ..Default::default() },
            PipelineConfig { thresholds: vec![], ..Default::default() },
            PipelineConfig { split_zoom: 12, ..Default::default() },
            PipelineConfig { end_zoom: 7, ..Default::default() },
            PipelineConfig { start_zoom: 13, ..Default::default() },
        ];
        for config in &bad {
            assert!(config.validate().is_err(), "{:?} should be rejected", config);
        }
    }

    #[test]
    fn test_default_zoom_plan() {
        let plan = ZoomPlan::from_config(&PipelineConfig::default()).unwrap();
        let inside: Vec<u8> = plan.inside.iter().map(|z| z.index()).collect();
        let outside: Vec<u8> = plan.outside.iter().map(|z| z.index()).collect();
        assert_eq!(inside, vec![7, 8, 9, 10, 11, 12]);
        assert_eq!(outside, vec![2, 3, 4, 5, 6]);
        assert_eq!(plan.split_source.index(), 7);
        assert_eq!(plan.zooms().count(), 11);
    }
}
