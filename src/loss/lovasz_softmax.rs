//! Multi-class Lovász-Softmax loss on probabilities.
//!
//! Berman et al., "The Lovász-Softmax loss: A tractable surrogate for the
//! optimization of the intersection-over-union measure in neural networks".

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use burn::prelude::*;

use super::{
    flatten::flatten_probas,
    gradient::lovasz_grad,
    mean::{MeanOptions, mean_or},
};
use crate::LossError;

/// Class averaging policy.
///
/// The classes that get scored are always the ones observed in the labels.
/// `Present` additionally skips classes without foreground pixels, and the
/// policy decides whether a single-channel (sigmoid) table may be scored:
/// only an `Explicit` list with one entry allows it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum ClassSelection {
    All,
    #[default]
    Present,
    Explicit(Vec<i64>),
}

impl ClassSelection {
    /// Whether the policy names more than one class.
    pub fn is_multiclass(&self) -> bool {
        match self {
            ClassSelection::All | ClassSelection::Present => true,
            ClassSelection::Explicit(classes) => classes.len() > 1,
        }
    }
}

/// Options shared by the batch and per-image pipelines.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LovaszOptions {
    pub classes: ClassSelection,
    /// Only classes in this set are scored.
    pub class_seen: Option<Vec<i64>>,
    /// Score each image on its own and average the results.
    pub per_image: bool,
    /// Label of void pixels.
    pub ignore: Option<i64>,
}

/// Lovász-Softmax loss of `[batch_size, num_classes, height, width]` probabilities.
pub fn lovasz_softmax<B: Backend>(
    probas: Tensor<B, 4>,
    labels: Tensor<B, 3, Int>,
    options: &LovaszOptions,
) -> Result<Tensor<B, 1>, LossError> {
    let class_seen = options.class_seen.as_deref();

    if !options.per_image {
        let flat = flatten_probas(probas, labels, options.ignore);
        return lovasz_softmax_flat(flat.probas, &flat.labels, &options.classes, class_seen);
    }

    let [batch_size, ..] = probas.dims();
    let zero = probas.clone().sum().mul_scalar(0.0);

    let losses = (0..batch_size)
        .map(|index| {
            let flat = flatten_probas(
                probas.clone().narrow(0, index, 1),
                labels.clone().narrow(0, index, 1),
                options.ignore,
            );
            lovasz_softmax_flat(flat.probas, &flat.labels, &options.classes, class_seen)
        })
        .collect::<Result<Vec<_>, _>>()?;

    mean_or(losses, MeanOptions::default(), |value| zero.add_scalar(value))
}

/// Lovász loss of `[batch_size, height, width]` sigmoid probabilities.
pub fn lovasz_sigmoid<B: Backend>(
    probas: Tensor<B, 3>,
    labels: Tensor<B, 3, Int>,
    options: &LovaszOptions,
) -> Result<Tensor<B, 1>, LossError> {
    lovasz_softmax(probas.unsqueeze_dim(1), labels, options)
}

/// Lovász-Softmax loss of a flattened `[pixels, num_classes]` table.
///
/// An empty table gives a zero that is still connected to `probas`.
pub fn lovasz_softmax_flat<B: Backend>(
    probas: Tensor<B, 2>,
    labels: &[i64],
    classes: &ClassSelection,
    class_seen: Option<&[i64]>,
) -> Result<Tensor<B, 1>, LossError> {
    let zero = probas.clone().sum().mul_scalar(0.0);
    if labels.is_empty() {
        tracing::debug!("Only void pixels, default loss (0)");
        return Ok(zero);
    }

    let [pixels, num_classes] = probas.dims();
    let device = probas.device();

    let observed: BTreeSet<i64> = labels.iter().copied().collect();
    let mut losses = Vec::with_capacity(observed.len());

    for class in observed {
        if class_seen.is_some_and(|seen| !seen.contains(&class)) {
            continue;
        }

        let foreground: Vec<f32> = labels
            .iter()
            .map(|&label| if label == class { 1.0 } else { 0.0 })
            .collect();
        if *classes == ClassSelection::Present && !foreground.contains(&1.0) {
            continue;
        }

        let column = if num_classes == 1 {
            if classes.is_multiclass() {
                return Err(LossError::SigmoidMultiClass);
            }
            0
        } else {
            class_column(class, num_classes)
        };
        let class_pred = probas.clone().narrow(1, column, 1).reshape([pixels]);

        let fg = Tensor::<B, 1>::from_data(
            TensorData::new(foreground.clone(), [pixels]).convert::<B::FloatElem>(),
            &device,
        );
        let errors = (fg - class_pred).abs();

        let perm = errors.clone().detach().argsort_descending(0);
        let perm_host: Vec<usize> = perm
            .to_data()
            .iter::<i64>()
            .map(|index| index as usize)
            .collect();
        let errors_sorted = errors.select(0, perm);

        let fg_sorted: Vec<f32> = perm_host.iter().map(|&index| foreground[index]).collect();
        let grad = Tensor::<B, 1>::from_data(
            TensorData::new(lovasz_grad(&fg_sorted), [pixels]).convert::<B::FloatElem>(),
            &device,
        );

        losses.push((errors_sorted * grad).sum());
    }

    tracing::debug!("Lovasz terms {} over {} pixels", losses.len(), pixels);

    mean_or(losses, MeanOptions::default(), |value| zero.add_scalar(value))
}

fn class_column(class: i64, num_classes: usize) -> usize {
    match usize::try_from(class) {
        Ok(column) if column < num_classes => column,
        _ => panic!(
            "Label {} is not a class index, expected 0..{} or the ignore label",
            class, num_classes
        ),
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::Autodiff;

    use super::*;
    use crate::tests::TestBackend;

    fn scalar(loss: Tensor<TestBackend, 1>) -> f64 {
        loss.into_scalar().elem::<f64>()
    }

    fn assert_loss(loss: Tensor<TestBackend, 1>, expected: f64) {
        let value = scalar(loss);
        assert!(
            (value - expected).abs() < 1e-5,
            "expected {expected}, got {value}"
        );
    }

    fn table(rows: &[[f32; 2]]) -> Tensor<TestBackend, 2> {
        let data: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_data(TensorData::new(data, [rows.len(), 2]), &Default::default())
    }

    #[test]
    fn flat_loss_known_value() {
        // class 0: sorted gt [1, 0, 1], grad [1/2, 1/6, 1/3] -> 0.3 + 0.2/6 + 0.1/3
        // class 1: sorted gt [0, 1, 0], grad [1/2, 1/2, 0] -> 0.3 + 0.1
        let probas = table(&[[0.9, 0.1], [0.4, 0.6], [0.2, 0.8]]);

        let loss = lovasz_softmax_flat(probas, &[0, 0, 1], &ClassSelection::Present, None)
            .expect("valid input");

        let class_0 = 0.3 + 0.2 / 6.0 + 0.1 / 3.0;
        let class_1 = 0.4;
        assert_loss(loss, (class_0 + class_1) / 2.0);
    }

    #[test]
    fn flat_loss_single_pixel_is_absolute_error() {
        let probas = table(&[[0.7, 0.3]]);

        let loss = lovasz_softmax_flat(probas, &[0], &ClassSelection::Present, None)
            .expect("valid input");

        assert_loss(loss, 0.3);
    }

    #[test]
    fn flat_loss_empty_is_zero() {
        let probas = table(&[[0.7, 0.3], [0.1, 0.9]]);

        let loss = lovasz_softmax_flat(probas, &[], &ClassSelection::Present, None)
            .expect("empty input is not an error");

        assert_eq!(scalar(loss), 0.0);
    }

    #[test]
    fn flat_loss_perfect_prediction_is_zero() {
        let probas = table(&[[1.0, 0.0], [0.0, 1.0], [1.0, 0.0]]);

        let loss = lovasz_softmax_flat(probas, &[0, 1, 0], &ClassSelection::Present, None)
            .expect("valid input");

        assert_eq!(scalar(loss), 0.0);
    }

    #[test]
    fn flat_loss_is_permutation_invariant() {
        let rows = [[0.9, 0.1], [0.4, 0.6], [0.2, 0.8], [0.55, 0.45], [0.3, 0.7]];
        let labels = [0, 0, 1, 1, 0];
        let order = [3, 0, 4, 2, 1];

        let shuffled_rows: Vec<[f32; 2]> = order.iter().map(|&i| rows[i]).collect();
        let shuffled_labels: Vec<i64> = order.iter().map(|&i| labels[i]).collect();

        let loss = lovasz_softmax_flat(table(&rows), &labels, &ClassSelection::Present, None)
            .expect("valid input");
        let shuffled = lovasz_softmax_flat(
            table(&shuffled_rows),
            &shuffled_labels,
            &ClassSelection::Present,
            None,
        )
        .expect("valid input");

        assert!((scalar(loss) - scalar(shuffled)).abs() < 1e-6);
    }

    #[test]
    fn flat_loss_class_seen_restricts_classes() {
        let probas = table(&[[0.9, 0.1], [0.4, 0.6], [0.2, 0.8]]);

        let loss = lovasz_softmax_flat(
            probas,
            &[0, 0, 1],
            &ClassSelection::Present,
            Some([1].as_slice()),
        )
        .expect("valid input");

        assert_loss(loss, 0.4);
    }

    #[test]
    fn flat_loss_class_seen_excluding_everything_is_zero() {
        let probas = table(&[[0.9, 0.1], [0.4, 0.6]]);

        let loss =
            lovasz_softmax_flat(probas, &[0, 1], &ClassSelection::All, Some([5].as_slice()))
                .expect("valid input");

        assert_eq!(scalar(loss), 0.0);
    }

    #[test]
    fn flat_loss_explicit_list_does_not_select_classes() {
        let probas = table(&[[0.9, 0.1], [0.4, 0.6], [0.2, 0.8]]);

        let present = lovasz_softmax_flat(probas.clone(), &[0, 0, 1], &ClassSelection::Present, None)
            .expect("valid input");
        let explicit =
            lovasz_softmax_flat(probas, &[0, 0, 1], &ClassSelection::Explicit(vec![1]), None)
                .expect("valid input");

        assert!((scalar(present) - scalar(explicit)).abs() < 1e-6);
    }

    #[test]
    fn sigmoid_with_multiclass_policy_fails() {
        let device = Default::default();
        let probas = Tensor::<TestBackend, 2>::from_data(TensorData::from([[0.8], [0.3]]), &device);

        let result = lovasz_softmax_flat(probas, &[1, 0], &ClassSelection::Present, None);

        assert_eq!(result.err(), Some(LossError::SigmoidMultiClass));
    }

    #[test]
    fn sigmoid_with_single_class_policy_succeeds() {
        // class 0: errors [0.8, 0.7], class 1: errors [0.2, 0.3], both scored on column 0.
        let device = Default::default();
        let probas = Tensor::<TestBackend, 2>::from_data(TensorData::from([[0.8], [0.3]]), &device);

        let loss = lovasz_softmax_flat(probas, &[1, 0], &ClassSelection::Explicit(vec![1]), None)
            .expect("single class sigmoid");

        assert_loss(loss, 0.5);
    }

    #[test]
    fn lovasz_sigmoid_scores_binary_maps() {
        let device = Default::default();
        let probas = Tensor::<TestBackend, 3>::from_data(TensorData::from([[[0.8, 0.3]]]), &device);
        let labels =
            Tensor::<TestBackend, 3, Int>::from_data(TensorData::from([[[1, 0]]]), &device);
        let options = LovaszOptions {
            classes: ClassSelection::Explicit(vec![1]),
            ..Default::default()
        };

        let loss = lovasz_sigmoid(probas, labels, &options).expect("single class sigmoid");

        assert_loss(loss, 0.5);
    }

    fn image_pair() -> (Tensor<TestBackend, 4>, Tensor<TestBackend, 3, Int>) {
        let device = Default::default();
        let image = [[[0.7, 0.2], [0.4, 0.9]], [[0.3, 0.8], [0.6, 0.1]]];
        let mask = [[0, 1], [1, 1]];

        let probas = Tensor::from_data(TensorData::from([image, image]), &device);
        let labels = Tensor::from_data(TensorData::from([mask, mask]), &device);
        (probas, labels)
    }

    #[test]
    fn per_image_matches_batch_for_identical_images() {
        let (probas, labels) = image_pair();

        let batch = lovasz_softmax(probas.clone(), labels.clone(), &LovaszOptions::default())
            .expect("valid input");
        let per_image = lovasz_softmax(
            probas,
            labels,
            &LovaszOptions {
                per_image: true,
                ..Default::default()
            },
        )
        .expect("valid input");

        assert!((scalar(batch) - scalar(per_image)).abs() < 1e-5);
    }

    #[test]
    fn per_image_averages_images() {
        let device = Default::default();
        let probas = Tensor::<TestBackend, 4>::from_data(
            TensorData::from([[[[0.7]], [[0.3]]], [[[0.6]], [[0.4]]]]),
            &device,
        );
        let labels =
            Tensor::<TestBackend, 3, Int>::from_data(TensorData::from([[[0]], [[1]]]), &device);
        let options = LovaszOptions {
            per_image: true,
            ..Default::default()
        };

        // One pixel per image: errors 0.3 and 0.6.
        let loss = lovasz_softmax(probas, labels, &options).expect("valid input");

        assert_loss(loss, 0.45);
    }

    #[test]
    fn per_image_counts_void_images_as_zero() {
        let device = Default::default();
        let probas = Tensor::<TestBackend, 4>::from_data(
            TensorData::from([[[[0.7]], [[0.3]]], [[[0.6]], [[0.4]]]]),
            &device,
        );
        let labels =
            Tensor::<TestBackend, 3, Int>::from_data(TensorData::from([[[0]], [[255]]]), &device);
        let options = LovaszOptions {
            per_image: true,
            ignore: Some(255),
            ..Default::default()
        };

        // The void image scores 0 and still counts in the average.
        let loss = lovasz_softmax(probas, labels, &options).expect("valid input");

        assert_loss(loss, 0.15);
    }

    #[test]
    #[should_panic = "Label -3 is not a class index"]
    fn negative_label_panics() {
        let probas = table(&[[0.7, 0.3], [0.1, 0.9]]);

        let _ = lovasz_softmax_flat(probas, &[0, -3], &ClassSelection::Present, None);
    }

    #[test]
    #[should_panic = "Label 2 is not a class index, expected 0..2"]
    fn label_beyond_classes_panics() {
        let probas = table(&[[0.7, 0.3], [0.1, 0.9]]);

        let _ = lovasz_softmax_flat(probas, &[0, 2], &ClassSelection::Present, None);
    }

    #[test]
    fn ignored_pixels_match_removed_pixels() {
        let device = Default::default();
        let probas = Tensor::<TestBackend, 4>::from_data(
            TensorData::from([[
                [[0.7, 0.2, 0.5], [0.4, 0.9, 0.1]],
                [[0.3, 0.8, 0.5], [0.6, 0.1, 0.9]],
            ]]),
            &device,
        );
        let labels = Tensor::<TestBackend, 3, Int>::from_data(
            TensorData::from([[[0, 255, 1], [1, 0, 255]]]),
            &device,
        );
        let options = LovaszOptions {
            ignore: Some(255),
            ..Default::default()
        };

        let ignored = lovasz_softmax(probas, labels, &options).expect("valid input");

        let kept = table(&[[0.7, 0.3], [0.5, 0.5], [0.4, 0.6], [0.9, 0.1]]);
        let removed = lovasz_softmax_flat(kept, &[0, 1, 1, 0], &ClassSelection::Present, None)
            .expect("valid input");

        assert!((scalar(ignored) - scalar(removed)).abs() < 1e-6);
    }

    #[test]
    fn all_ignored_pixels_give_zero() {
        let device = Default::default();
        let probas = Tensor::<TestBackend, 4>::ones([2, 3, 2, 2], &device);
        let labels = Tensor::<TestBackend, 3, Int>::full([2, 2, 2], 255, &device);

        for per_image in [false, true] {
            let options = LovaszOptions {
                ignore: Some(255),
                per_image,
                ..Default::default()
            };
            let loss = lovasz_softmax(probas.clone(), labels.clone(), &options)
                .expect("void batch is not an error");

            assert_eq!(scalar(loss), 0.0);
        }
    }

    #[test]
    fn gradient_flows_through_errors_only() {
        type AutodiffBackend = Autodiff<TestBackend>;
        let device = Default::default();

        let probas = Tensor::<AutodiffBackend, 2>::from_data(
            TensorData::from([[0.9, 0.1], [0.4, 0.6], [0.2, 0.8]]),
            &device,
        )
        .require_grad();

        let loss = lovasz_softmax_flat(probas.clone(), &[0, 0, 1], &ClassSelection::Present, None)
            .expect("valid input");
        let grads = loss.backward();
        let grad: Vec<f32> = probas
            .grad(&grads)
            .expect("probas require grad")
            .into_data()
            .iter::<f32>()
            .collect();

        // d|fg - p|/dp = -sign(fg - p), weighted by the Lovász gradient and
        // averaged over the two classes.
        let expected = [
            -(1.0 / 3.0) / 2.0,
            0.0,
            -0.5 / 2.0,
            0.5 / 2.0,
            1.0 / 6.0 / 2.0,
            -0.5 / 2.0,
        ];
        for (actual, expected) in grad.iter().zip(expected) {
            assert!(
                (*actual as f64 - expected).abs() < 1e-5,
                "expected {expected:?}, got {grad:?}"
            );
        }
    }

    #[test]
    fn empty_input_has_zero_gradient() {
        type AutodiffBackend = Autodiff<TestBackend>;
        let device = Default::default();

        let probas = Tensor::<AutodiffBackend, 2>::from_data(
            TensorData::from([[0.9, 0.1], [0.4, 0.6]]),
            &device,
        )
        .require_grad();

        let loss = lovasz_softmax_flat(probas.clone(), &[], &ClassSelection::Present, None)
            .expect("empty input is not an error");
        let grads = loss.backward();
        let grad = probas.grad(&grads).expect("zero is attached to probas");

        assert_eq!(grad.abs().sum().into_scalar().elem::<f64>(), 0.0);
    }
}
