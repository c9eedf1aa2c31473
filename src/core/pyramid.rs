use crate::core::reduce::GridReducer;
use crate::types::{BiomassError, BiomassResult, Raster, ReducerKind, ValidMask, ZoomLevel};

/// Loss, loss-year and carbon layers at one zoom level
#[derive(Debug, Clone, PartialEq)]
pub struct PyramidLevel {
    pub zoom: ZoomLevel,
    /// Binary loss (0 or 255 at native resolution), nearest-resampled
    pub loss: Raster,
    /// Mode-reduced loss year
    pub loss_year: Raster,
    /// Mean-reduced carbon density
    pub carbon: Raster,
    /// Cells that received a non-zero loss year
    pub loss_year_mask: ValidMask,
}

impl PyramidLevel {
    pub fn scale(&self) -> f64 {
        self.zoom.scale()
    }

    pub fn dim(&self) -> (usize, usize) {
        self.loss_year.dim()
    }
}

/// Brings native or pre-aggregated inputs to a target zoom level
pub struct PyramidBuilder<'a> {
    reducer: &'a GridReducer,
}

impl<'a> PyramidBuilder<'a> {
    pub fn new(reducer: &'a GridReducer) -> Self {
        Self { reducer }
    }

    /// Reduce `loss`, `loss_year` and `carbon` from `native_zoom` to `target_zoom`.
    ///
    /// Inputs whose scale differs from `native_zoom` are first nearest-resampled
    /// onto the native zoom grid.
    pub fn build(
        &self,
        loss: &Raster,
        loss_year: &Raster,
        carbon: &Raster,
        target_zoom: ZoomLevel,
        native_zoom: ZoomLevel,
    ) -> BiomassResult<PyramidLevel> {
        if target_zoom.is_finer_than(native_zoom) {
            return Err(BiomassError::InvalidZoomTransition(format!(
                "cannot refine from {} ({}m) to {} ({}m)",
                native_zoom,
                native_zoom.scale(),
                target_zoom,
                target_zoom.scale()
            )));
        }
        loss.ensure_same_grid(loss_year, "loss vs loss year")?;
        loss.ensure_same_grid(carbon, "loss vs carbon")?;

        log::info!(
            "Building pyramid level {} ({}m) from {} ({}m), input {}x{} @ {}m",
            target_zoom,
            target_zoom.scale(),
            native_zoom,
            native_zoom.scale(),
            loss.dim().0,
            loss.dim().1,
            loss.scale()
        );

        let native_scale = native_zoom.scale();
        let loss = self.reducer.resample_nearest(loss, native_scale)?;
        let loss_year = self.reducer.resample_nearest(loss_year, native_scale)?;
        let carbon = self.reducer.resample_nearest(carbon, native_scale)?;

        let target_scale = target_zoom.scale();
        let loss = self.reducer.resample_nearest(&loss, target_scale)?;
        let loss_year = self
            .reducer
            .reduce(&loss_year, ReducerKind::Mode, target_scale)?;
        let carbon = self.reducer.reduce(&carbon, ReducerKind::Mean, target_scale)?;
        let loss_year_mask = loss_year.gt(0.0);

        log::debug!(
            "Level {}: {}x{} cells, {} with a loss year",
            target_zoom,
            loss_year.dim().0,
            loss_year.dim().1,
            loss_year_mask.iter().filter(|m| **m).count()
        );

        Ok(PyramidLevel {
            zoom: target_zoom,
            loss,
            loss_year,
            carbon,
            loss_year_mask,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Grid;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn z(level: u8) -> ZoomLevel {
        ZoomLevel::new(level).unwrap()
    }

    fn native(data: Grid) -> Raster {
        Raster::new(data, z(12).scale(), "EPSG:4326")
    }

    #[test]
    fn test_identity_at_native_zoom() {
        let loss = native(Array2::from_elem((4, 4), 255.0));
        let loss_year = native(Array2::from_elem((4, 4), 3.0));
        let carbon = native(Array2::from_elem((4, 4), 10.0));
        let reducer = GridReducer::standard();
        let level = PyramidBuilder::new(&reducer)
            .build(&loss, &loss_year, &carbon, z(12), z(12))
            .unwrap();

        assert_eq!(level.loss, loss);
        assert_eq!(level.loss_year, loss_year);
        assert_eq!(level.carbon, carbon);
        assert!(level.loss_year_mask.iter().all(|m| *m));
    }

    #[test]
    fn test_one_zoom_step_halves_grid() {
        let loss = native(Array2::from_shape_fn((4, 4), |(r, _)| if r < 2 { 255.0 } else { 0.0 }));
        let loss_year = native(Array2::from_shape_fn((4, 4), |(r, c)| if r < 2 && c < 2 { 5.0 } else { 0.0 }));
        let carbon = native(Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c) as f32));
        let reducer = GridReducer::standard();
        let level = PyramidBuilder::new(&reducer)
            .build(&loss, &loss_year, &carbon, z(11), z(12))
            .unwrap();

        assert_eq!(level.dim(), (2, 2));
        assert_eq!(level.loss_year.scale(), 76.0);
        assert_eq!(level.loss_year.get(0, 0), Some(5.0));
        assert_eq!(level.loss_year.get(1, 1), None);
        assert_eq!(level.loss_year_mask, ndarray::array![[true, false], [false, false]]);
        assert_relative_eq!(level.carbon.get(0, 0).unwrap(), 2.5);
        assert_eq!(level.loss.get(0, 0), Some(255.0));
        assert_eq!(level.loss.get(1, 0), Some(0.0));
        assert!(level.loss.same_grid(&level.carbon));
    }

    #[test]
    fn test_coarser_zoom_is_monotonic() {
        let data = Array2::from_elem((64, 64), 1.0);
        let loss = native(data.clone());
        let loss_year = native(data.clone());
        let carbon = native(data);
        let reducer = GridReducer::standard();
        let builder = PyramidBuilder::new(&reducer);

        let mut previous: Option<PyramidLevel> = None;
        for level in (7..=12).rev() {
            let built = builder.build(&loss, &loss_year, &carbon, z(level), z(12)).unwrap();
            if let Some(finer) = &previous {
                assert!(built.scale() >= finer.scale());
                assert!(built.loss_year.len() <= finer.loss_year.len());
            }
            previous = Some(built);
        }
    }

    #[test]
    fn test_refinement_is_a_configuration_error() {
        let r = native(Array2::zeros((2, 2)));
        let reducer = GridReducer::standard();
        let err = PyramidBuilder::new(&reducer).build(&r, &r, &r, z(12), z(8));
        assert!(matches!(err, Err(BiomassError::InvalidZoomTransition(_))));
    }

    #[test]
    fn test_mismatched_inputs_are_rejected() {
        let a = native(Array2::zeros((2, 2)));
        let b = native(Array2::zeros((3, 2)));
        let reducer = GridReducer::standard();
        let err = PyramidBuilder::new(&reducer).build(&a, &b, &a, z(11), z(12));
        assert!(matches!(err, Err(BiomassError::DimensionMismatch(_))));
    }

    #[test]
    fn test_finer_native_data_is_aligned_first() {
        // 27.83m data at the 38m native zoom
        let raw = |v: f32| Raster::new(Array2::from_elem((10, 10), v), 27.829872698318393, "EPSG:4326");
        let reducer = GridReducer::standard();
        let level = PyramidBuilder::new(&reducer)
            .build(&raw(255.0), &raw(4.0), &raw(20.0), z(11), z(12))
            .unwrap();
        assert_eq!(level.loss_year.scale(), 76.0);
        assert!(level.loss_year.data().iter().all(|v| *v == 4.0));
        assert!(level.carbon.data().iter().all(|v| (*v - 20.0).abs() < 1e-6));
    }
}
