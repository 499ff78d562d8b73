//! The concurrent feature map and its optimization driver.

pub mod feature;
pub mod features_map;
pub mod modifier;
pub mod optimizer;

pub use feature::{
    ExtendedDescriptor, FeatureMeasurement, MapFeature, RgbdFeature, FEATURE_START_ID,
};
pub use features_map::{DepthImage, FeaturesMap};
pub use modifier::MapModifier;
pub use optimizer::OptimizationDriver;
