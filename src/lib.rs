mod error;
pub mod loss;

#[cfg(feature = "training")]
pub mod training;

pub use error::LossError;

pub use loss::{ClassSelection, LossRegistry, LovaszLoss, LovaszLossConfig, SegmentationLoss};

#[cfg(feature = "training")]
pub use training::SegmentationOutput;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
