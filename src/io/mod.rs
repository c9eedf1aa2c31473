//! Input and output adapters

pub mod source;
#[cfg(feature = "gdal")]
pub mod geotiff;

pub use source::{InMemorySource, RasterSource};
#[cfg(feature = "gdal")]
pub use geotiff::{read_band, write_product, GeoTiffSource};
