mod flatten;
mod gradient;
mod lovasz;
mod lovasz_softmax;
mod mean;
mod registry;

pub use flatten::{FlatProbas, flatten_binary_probas, flatten_probas};
pub use gradient::lovasz_grad;
pub use lovasz::{LovaszLoss, LovaszLossConfig};
pub use lovasz_softmax::{
    ClassSelection, LovaszOptions, lovasz_sigmoid, lovasz_softmax, lovasz_softmax_flat,
};
pub use mean::{EmptyMean, MeanOptions, MeanTerm, mean, mean_or};
pub use registry::{LOVASZ_LOSS, LossBuilder, LossRegistry, SegmentationLoss};
