//! Gradient of the Lovász extension of the Jaccard loss.
//!
//! The weights only depend on the ground truth, so they are computed on the host
//! and enter the graph as constants. Given the foreground indicator sorted by
//! descending error, with `gts` the number of foreground pixels:
//!
//! ```text
//! intersection[i] = gts - cumsum(gt)[i]
//! union[i]        = gts + cumsum(1 - gt)[i]
//! jaccard[i]      = 1 - intersection[i] / union[i]
//! grad[i]         = jaccard[i] - jaccard[i - 1]    (i >= 1)
//! ```
//!
//! The dot product of the sorted errors with `grad` is the value of the Lovász
//! extension at the error vector.

/// Compute the Lovász gradient of a foreground indicator sorted by descending error.
///
/// A single pixel is returned undifferenced.
pub fn lovasz_grad(gt_sorted: &[f32]) -> Vec<f64> {
    let gts: f64 = gt_sorted.iter().map(|&gt| gt as f64).sum();

    let mut foreground = 0.0;
    let mut background = 0.0;
    let mut jaccard: Vec<f64> = gt_sorted
        .iter()
        .map(|&gt| {
            let gt = gt as f64;
            foreground += gt;
            background += 1.0 - gt;

            let intersection = gts - foreground;
            let union = gts + background;
            1.0 - intersection / union
        })
        .collect();

    // Walk backwards so every step subtracts the undifferenced predecessor.
    for i in (1..jaccard.len()).rev() {
        jaccard[i] -= jaccard[i - 1];
    }

    jaccard
}
