use burn::prelude::*;
use derive_new::new;

/// Predictions of a batch flattened to one row per pixel.
#[derive(new, Debug, Clone)]
pub struct FlatProbas<B: Backend> {
    /// `[pixels, num_classes]` class probabilities.
    ///
    /// When every pixel carried the ignore label this is the unfiltered table,
    /// kept only to derive a zero loss that stays attached to the graph.
    pub probas: Tensor<B, 2>,
    /// Class index of every row of `probas`.
    pub labels: Vec<i64>,
}

impl<B: Backend> FlatProbas<B> {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.probas.dims()[1]
    }
}

/// Flatten `[batch_size, num_classes, height, width]` probabilities and
/// `[batch_size, height, width]` labels, dropping pixels labelled `ignore`.
pub fn flatten_probas<B: Backend>(
    probas: Tensor<B, 4>,
    labels: Tensor<B, 3, Int>,
    ignore: Option<i64>,
) -> FlatProbas<B> {
    let [batch_size, num_classes, height, width] = probas.dims();
    let pixels = batch_size * height * width;

    let probas = probas
        .reshape([batch_size, num_classes, height * width])
        .permute([0, 2, 1])
        .reshape([pixels, num_classes]);

    let labels: Vec<i64> = labels.reshape([pixels]).into_data().iter::<i64>().collect();

    let Some(ignore) = ignore else {
        return FlatProbas::new(probas, labels);
    };

    let valid: Vec<i64> = labels
        .iter()
        .enumerate()
        .filter(|(_, label)| **label != ignore)
        .map(|(index, _)| index as i64)
        .collect();

    tracing::debug!("Valid pixels {} / {}", valid.len(), pixels);

    if valid.is_empty() {
        return FlatProbas::new(probas, Vec::new());
    }
    if valid.len() == pixels {
        return FlatProbas::new(probas, labels);
    }

    let labels: Vec<i64> = valid.iter().map(|&index| labels[index as usize]).collect();
    let count = valid.len();
    let indices = Tensor::<B, 1, Int>::from_data(
        TensorData::new(valid, [count]).convert::<B::IntElem>(),
        &probas.device(),
    );

    FlatProbas::new(probas.select(0, indices), labels)
}

/// Flatten the `[batch_size, height, width]` output of a sigmoid layer.
pub fn flatten_binary_probas<B: Backend>(
    probas: Tensor<B, 3>,
    labels: Tensor<B, 3, Int>,
    ignore: Option<i64>,
) -> FlatProbas<B> {
    flatten_probas(probas.unsqueeze_dim(1), labels, ignore)
}
