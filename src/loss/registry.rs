use std::collections::HashMap;

use burn::prelude::*;

use super::lovasz::{LovaszLoss, LovaszLossConfig};
use crate::LossError;

/// A segmentation criterion on raw logits.
pub trait SegmentationLoss<B: Backend> {
    fn name(&self) -> &'static str;

    /// # Shapes
    ///
    /// - logits: `[batch_size, num_classes, height, width]`
    /// - targets: `[batch_size, height, width]`
    fn forward(
        &self,
        logits: Tensor<B, 4>,
        targets: Tensor<B, 3, Int>,
    ) -> Result<Tensor<B, 1>, LossError>;
}

impl<B: Backend> SegmentationLoss<B> for LovaszLoss<B> {
    fn name(&self) -> &'static str {
        LOVASZ_LOSS
    }

    fn forward(
        &self,
        logits: Tensor<B, 4>,
        targets: Tensor<B, 3, Int>,
    ) -> Result<Tensor<B, 1>, LossError> {
        LovaszLoss::forward(self, logits, targets)
    }
}

pub const LOVASZ_LOSS: &str = "LovaszLoss";

/// Builds a loss from its JSON configuration.
pub type LossBuilder<B> =
    fn(&str, &<B as Backend>::Device) -> Result<Box<dyn SegmentationLoss<B>>, LossError>;

/// Maps loss identifiers used in training configurations to their builders.
pub struct LossRegistry<B: Backend> {
    builders: HashMap<&'static str, LossBuilder<B>>,
}

impl<B: Backend> Default for LossRegistry<B> {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(LOVASZ_LOSS, build_lovasz_loss::<B>);
        registry
    }
}

impl<B: Backend> LossRegistry<B> {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Register `builder` under `name`, replacing any previous builder.
    pub fn register(&mut self, name: &'static str, builder: LossBuilder<B>) -> &mut Self {
        if self.builders.insert(name, builder).is_some() {
            tracing::debug!("Replaced loss builder {name}");
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// Registered identifiers, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.builders.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn build(
        &self,
        name: &str,
        config: &str,
        device: &B::Device,
    ) -> Result<Box<dyn SegmentationLoss<B>>, LossError> {
        let builder = self
            .builders
            .get(name)
            .ok_or_else(|| LossError::UnknownLoss(name.to_string()))?;

        tracing::debug!("Build loss {name}");
        builder(config, device)
    }
}

fn build_lovasz_loss<B: Backend>(
    config: &str,
    device: &B::Device,
) -> Result<Box<dyn SegmentationLoss<B>>, LossError> {
    let config = LovaszLossConfig::load_binary(config.as_bytes())
        .map_err(|err| LossError::InvalidConfig(format!("{err:?}")))?;

    Ok(Box::new(config.init::<B>(device)))
}
