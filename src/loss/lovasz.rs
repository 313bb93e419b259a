//! Lovász-Softmax Loss
//!
//! Wraps the Lovász-Softmax loss of [lovasz_softmax] in a configurable module that
//! takes raw logits, in the same shape as the other segmentation losses of Burn.

use std::marker::PhantomData;

use burn::{
    module::{Content, DisplaySettings, Ignored, ModuleDisplay},
    prelude::*,
    tensor::activation::softmax,
};

use super::lovasz_softmax::{ClassSelection, LovaszOptions, lovasz_softmax};
use crate::LossError;

/// Configuration to create a [Lovász-Softmax loss](LovaszLoss) using the [init function](LovaszLossConfig::init).
///
/// # Example
///
/// ```rust
/// use burn::backend::NdArray;
/// use burn_lovasz::LovaszLossConfig;
///
/// let device = Default::default();
/// let loss = LovaszLossConfig::new()
///     .with_ignore_index(Some(255))
///     .with_per_image(true)
///     .init::<NdArray>(&device);
/// ```
#[derive(Config, Debug)]
pub struct LovaszLossConfig {
    /// Restrict the loss to these class indices.
    ///
    /// Useful for partially labelled data or class-incremental training, where
    /// only a subset of the classes has ever been annotated.
    pub class_seen: Option<Vec<i64>>,

    /// Compute the loss for each image and average, instead of over the whole batch.
    #[config(default = false)]
    pub per_image: bool,

    /// Label of the pixels that do not contribute to the loss.
    pub ignore_index: Option<i64>,

    /// Multiplier applied to the loss.
    #[config(default = 1.0)]
    pub loss_weight: f64,

    /// Class averaging policy, see [ClassSelection].
    #[config(default = "ClassSelection::Present")]
    pub classes: ClassSelection,
}

impl LovaszLossConfig {
    pub fn init<B: Backend>(&self, _device: &B::Device) -> LovaszLoss<B> {
        self.assertions();
        LovaszLoss {
            class_seen: self.class_seen.clone(),
            per_image: self.per_image,
            ignore_index: self.ignore_index,
            loss_weight: self.loss_weight,
            classes: Ignored(self.classes.clone()),
            _b: PhantomData,
        }
    }

    fn assertions(&self) {
        assert!(
            self.loss_weight.is_finite(),
            "Loss weight of Lovasz loss must be finite. Got {}",
            self.loss_weight
        );
    }
}

/// Lovász-Softmax loss for semantic segmentation.
///
/// A convex surrogate of the Jaccard index (IoU) computed per class on the
/// pixels sorted by prediction error.
///
/// Should be created using [LovaszLossConfig].
#[derive(Module, Debug)]
#[module(custom_display)]
pub struct LovaszLoss<B: Backend> {
    /// Classes the loss is restricted to.
    pub class_seen: Option<Vec<i64>>,
    /// Average per image instead of per batch.
    pub per_image: bool,
    /// Ignore pixels with this label.
    pub ignore_index: Option<i64>,
    /// Multiplier of the loss.
    pub loss_weight: f64,
    /// Class averaging policy.
    pub classes: Ignored<ClassSelection>,
    _b: PhantomData<B>,
}

impl<B: Backend> ModuleDisplay for LovaszLoss<B> {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("class_seen", &self.class_seen)
            .add("per_image", &self.per_image)
            .add("ignore_index", &self.ignore_index)
            .add("loss_weight", &self.loss_weight)
            .optional()
    }
}

impl<B: Backend> LovaszLoss<B> {
    /// Compute the criterion on the input logits.
    ///
    /// # Shapes
    ///
    /// - logits: `[batch_size, num_classes, height, width]`
    /// - targets: `[batch_size, height, width]` (integer class indices)
    /// - output: `[1]`
    pub fn forward(
        &self,
        logits: Tensor<B, 4>,
        targets: Tensor<B, 3, Int>,
    ) -> Result<Tensor<B, 1>, LossError> {
        Self::assertions(&logits, &targets);

        // Class axis last: the ndarray backward of the max reduction only
        // scatters along the last dimension.
        let probas = softmax(logits.permute([0, 2, 3, 1]), 3).permute([0, 3, 1, 2]);
        let loss = lovasz_softmax(probas, targets, &self.options())?;

        Ok(loss.mul_scalar(self.loss_weight))
    }

    /// [forward](Self::forward) for single channel masks.
    ///
    /// # Shapes
    ///
    /// - logits: `[batch_size, num_classes, height, width]`
    /// - targets: `[batch_size, 1, height, width]`
    pub fn forward_masks(
        &self,
        logits: Tensor<B, 4>,
        targets: Tensor<B, 4, Int>,
    ) -> Result<Tensor<B, 1>, LossError> {
        let [_, target_channels, _, _] = targets.dims();
        assert_eq!(
            target_channels, 1,
            "Target should have exactly 1 channel, got {}",
            target_channels
        );

        self.forward(logits, targets.squeeze(1))
    }

    fn options(&self) -> LovaszOptions {
        LovaszOptions {
            classes: self.classes.0.clone(),
            class_seen: self.class_seen.clone(),
            per_image: self.per_image,
            ignore: self.ignore_index,
        }
    }

    fn assertions(logits: &Tensor<B, 4>, targets: &Tensor<B, 3, Int>) {
        let [logits_batch, _logits_classes, logits_height, logits_width] = logits.dims();
        let [target_batch, target_height, target_width] = targets.dims();

        assert_eq!(
            logits_batch, target_batch,
            "Batch size mismatch: logits ({}) vs targets ({})",
            logits_batch, target_batch
        );

        assert_eq!(
            logits_height, target_height,
            "Height mismatch: logits ({}) vs targets ({})",
            logits_height, target_height
        );

        assert_eq!(
            logits_width, target_width,
            "Width mismatch: logits ({}) vs targets ({})",
            logits_width, target_width
        );
    }
}
