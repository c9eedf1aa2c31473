//! Core processing stages, leaves first

pub mod reduce;
pub mod pyramid;
pub mod mosaic;
pub mod composite;
pub mod bands;
pub mod pipeline;

// Re-export main types
pub use reduce::{GridReducer, ReduceParams, ReduceReport, DEFAULT_MAX_PIXELS};
pub use pyramid::{PyramidBuilder, PyramidLevel};
pub use mosaic::{BandStack, QualityMosaic};
pub use composite::YearCompositor;
pub use bands::{BandComposer, DensityParams};
pub use pipeline::{PipelineConfig, ProductPipeline, SplitData, ZoomPlan};
