pub mod learner;

pub use learner::SegmentationOutput;
