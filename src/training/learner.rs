use burn::{
    backend::NdArray,
    prelude::*,
    tensor::{Int, Transaction},
    train::metric::{Adaptor, ItemLazy, LossInput},
};
use derive_new::new;

use crate::{LossError, LovaszLoss};

/// Loss of a segmentation step together with the tensors it was computed on.
#[derive(new)]
pub struct SegmentationOutput<B: Backend> {
    /// `[1]` weighted Lovász loss.
    pub loss: Tensor<B, 1>,
    /// `[batch_size, num_classes, height, width]`
    pub logits: Tensor<B, 4>,
    /// `[batch_size, height, width]`, may contain the ignore label.
    pub targets: Tensor<B, 3, Int>,
}

impl<B: Backend> ItemLazy for SegmentationOutput<B> {
    type ItemSync = SegmentationOutput<NdArray>;

    /// Read the step back in a single transaction.
    fn sync(self) -> Self::ItemSync {
        let [loss, logits, targets] = Transaction::default()
            .register(self.loss)
            .register(self.logits)
            .register(self.targets)
            .execute()
            .try_into()
            .expect("Loss, logits and targets registered");

        let device = Default::default();
        SegmentationOutput::new(
            Tensor::from_data(loss, &device),
            Tensor::from_data(logits, &device),
            Tensor::from_data(targets, &device),
        )
    }
}

/// The learner's loss metric reads the weighted Lovász value.
impl<B: Backend> Adaptor<LossInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> LossInput<B> {
        LossInput::new(self.loss.clone())
    }
}

impl<B: Backend> LovaszLoss<B> {
    /// Compute the loss and bundle it with its inputs for the learner.
    pub fn forward_output(
        &self,
        logits: Tensor<B, 4>,
        targets: Tensor<B, 3, Int>,
    ) -> Result<SegmentationOutput<B>, LossError> {
        let loss = self.forward(logits.clone(), targets.clone())?;
        Ok(SegmentationOutput::new(loss, logits, targets))
    }
}
