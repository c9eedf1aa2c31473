//! biomass-loss: multi-resolution forest biomass loss products
//!
//! Turns native-resolution forest loss, loss year and carbon density rasters
//! into a three-band product (dominant loss year, biomass loss magnitude,
//! carbon density) at any zoom level of a fixed 13-level resolution table,
//! ready for tiling.
//!
//! Stages, leaves first:
//! - [`crate::core::GridReducer`]: mean/mode reduction to a coarser ground distance
//! - [`crate::core::PyramidBuilder`]: brings loss, loss year and carbon to a target zoom
//! - [`crate::core::YearCompositor`]: per-pixel year of maximum carbon loss
//! - [`crate::core::BandComposer`]: quantised year, magnitude and density bands
//! - [`crate::core::ProductPipeline`]: single entry point for a (threshold, zoom) request

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    BiomassError, BiomassResult, Product, Raster, ReducerKind, Threshold, ZoomLevel,
    PRODUCT_BANDS, ZOOM_SCALES,
};

pub use crate::core::{PipelineConfig, ProductPipeline};
pub use io::{InMemorySource, RasterSource};

#[cfg(feature = "python")]
mod python {
    use crate::core::{PipelineConfig, ProductPipeline};
    use crate::io::InMemorySource;
    use crate::types::{Raster, ZoomLevel, ZOOM_SCALES};
    use numpy::{PyReadonlyArray2, ToPyArray};
    use pyo3::exceptions::PyValueError;
    use pyo3::prelude::*;
    use pyo3::types::PyDict;

    /// Convert a numpy array into a raster at `scale`
    fn numpy_to_raster(arr: PyReadonlyArray2<f32>, scale: f64, crs: &str) -> Raster {
        Raster::new(arr.as_array().to_owned(), scale, crs)
    }

    fn to_py_err(e: crate::types::BiomassError) -> PyErr {
        PyValueError::new_err(format!("{}", e))
    }

    /// Compute one product from in-memory layers
    #[pyfunction]
    #[pyo3(signature = (loss, loss_year, carbon, treecover, threshold, target_zoom, native_zoom=12, scale=None))]
    #[allow(clippy::too_many_arguments)]
    fn compute_product(
        py: Python,
        loss: PyReadonlyArray2<f32>,
        loss_year: PyReadonlyArray2<f32>,
        carbon: PyReadonlyArray2<f32>,
        treecover: PyReadonlyArray2<f32>,
        threshold: u8,
        target_zoom: u8,
        native_zoom: u8,
        scale: Option<f64>,
    ) -> PyResult<PyObject> {
        let config = PipelineConfig::default();
        let scale = scale.unwrap_or(config.native_scale);
        let crs = config.crs.clone();

        let source = InMemorySource::new(
            numpy_to_raster(loss_year, scale, &crs),
            numpy_to_raster(carbon, scale, &crs),
            numpy_to_raster(treecover, scale, &crs),
        )
        .with_loss(threshold, numpy_to_raster(loss, scale, &crs));

        let target = ZoomLevel::new(target_zoom).map_err(to_py_err)?;
        let native = ZoomLevel::new(native_zoom).map_err(to_py_err)?;
        let pipeline = ProductPipeline::new(config, source).map_err(to_py_err)?;
        let product = pipeline.run(threshold, target, native).map_err(to_py_err)?;

        let result = PyDict::new(py);
        result.set_item("year", product.year.to_pyarray(py))?;
        result.set_item("total_biomass_loss", product.magnitude.to_pyarray(py))?;
        result.set_item("density", product.density.to_pyarray(py))?;
        result.set_item("zoom", product.zoom.index())?;
        result.set_item("scale", product.scale)?;
        result.set_item("crs", product.crs)?;
        Ok(result.into())
    }

    /// Ground sample distance of every zoom level, coarsest first
    #[pyfunction]
    fn zoom_scales() -> Vec<f64> {
        ZOOM_SCALES.to_vec()
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(compute_product, m)?)?;
        m.add_function(wrap_pyfunction!(zoom_scales, m)?)?;
        Ok(())
    }
}
