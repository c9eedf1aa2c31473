use crate::io::RasterSource;
use crate::types::{BiomassError, BiomassResult, Grid, Product, Raster, Threshold, ValidMask};
use gdal::raster::Buffer;
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager};
use std::path::{Path, PathBuf};

/// Metres per degree of longitude at the equator
const METRES_PER_DEGREE: f64 = 111_319.490_793_273_57;

/// GeoTIFF inputs for the product pipeline.
///
/// `loss_template` contains `{threshold}`, which is replaced by the tree-cover
/// threshold when the loss layer is loaded (e.g. `loss_{threshold}.tif`).
#[derive(Debug, Clone)]
pub struct GeoTiffSource {
    pub loss_template: String,
    pub loss_year_path: PathBuf,
    pub carbon_path: PathBuf,
    pub treecover_path: PathBuf,
    /// Nominal ground sample distance of the inputs in metres
    pub scale: f64,
    pub crs: String,
}

impl GeoTiffSource {
    fn loss_path(&self, threshold: Threshold) -> PathBuf {
        PathBuf::from(
            self.loss_template
                .replace("{threshold}", &threshold.value().to_string()),
        )
    }
}

impl RasterSource for GeoTiffSource {
    fn loss(&self, threshold: Threshold) -> BiomassResult<Raster> {
        read_band(self.loss_path(threshold), self.scale, &self.crs)
    }

    fn loss_year(&self) -> BiomassResult<Raster> {
        read_band(&self.loss_year_path, self.scale, &self.crs)
    }

    fn carbon(&self) -> BiomassResult<Raster> {
        read_band(&self.carbon_path, self.scale, &self.crs)
    }

    fn treecover(&self) -> BiomassResult<Raster> {
        read_band(&self.treecover_path, self.scale, &self.crs)
    }
}

/// Read band 1 of a GeoTIFF; cells equal to the no-data value are masked
pub fn read_band<P: AsRef<Path>>(path: P, scale: f64, crs: &str) -> BiomassResult<Raster> {
    log::info!("Reading raster from: {}", path.as_ref().display());

    let dataset = Dataset::open(path.as_ref())?;
    let geo_transform = dataset.geo_transform()?;
    let (width, height) = dataset.raster_size();
    log::debug!("Raster size: {}x{}, geotransform: {:?}", width, height, geo_transform);

    let band = dataset.rasterband(1)?;
    let no_data = band.no_data_value();
    let buffer = band.read_as::<f32>((0, 0), (width, height), (width, height), None)?;

    let data = Grid::from_shape_vec((height, width), buffer.data)
        .map_err(|e| BiomassError::Processing(format!("Failed to reshape raster data: {}", e)))?;
    let valid = match no_data {
        Some(nd) => data.mapv(|v| (v as f64) != nd && !v.is_nan()),
        None => ValidMask::from_elem(data.dim(), true),
    };

    Ok(Raster::with_mask(data, valid, scale, crs)?.with_origin(geo_transform[0], geo_transform[3]))
}

/// Write the three product bands as a `u8` GeoTIFF
pub fn write_product<P: AsRef<Path>>(product: &Product, output_path: P) -> BiomassResult<()> {
    log::info!(
        "Writing {} product ({}x{}) to {}",
        product.zoom,
        product.dim().0,
        product.dim().1,
        output_path.as_ref().display()
    );

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let (height, width) = product.dim();
    let mut dataset = driver.create_with_band_type::<u8, _>(
        output_path.as_ref(),
        width as isize,
        height as isize,
        product.bands().len() as isize,
    )?;

    let epsg = epsg_code(&product.crs)?;
    let pixel_size = if epsg == 4326 {
        product.scale / METRES_PER_DEGREE
    } else {
        product.scale
    };
    dataset.set_geo_transform(&[
        product.origin.0,
        pixel_size,
        0.0,
        product.origin.1,
        0.0,
        -pixel_size,
    ])?;
    dataset.set_spatial_ref(&SpatialRef::from_epsg(epsg)?)?;

    for (i, band) in product.bands().iter().enumerate() {
        let mut rasterband = dataset.rasterband(i as isize + 1)?;
        let flat: Vec<u8> = band.iter().copied().collect();
        let buffer = Buffer::new((width, height), flat);
        rasterband.write((0, 0), (width, height), &buffer)?;
    }

    log::info!("GeoTIFF saved successfully");
    Ok(())
}

/// Parse the numeric code of an `EPSG:<code>` CRS string
fn epsg_code(crs: &str) -> BiomassResult<u32> {
    crs.strip_prefix("EPSG:")
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| BiomassError::InvalidConfig(format!("unsupported CRS '{}'", crs)))
}
