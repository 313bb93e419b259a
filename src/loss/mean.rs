use burn::prelude::*;

use crate::LossError;

/// A scalar term that can be averaged by [mean].
pub trait MeanTerm: Sized {
    fn accumulate(self, other: Self) -> Self;

    fn divide(self, count: usize) -> Self;

    fn is_nan(&self) -> bool;
}

impl MeanTerm for f64 {
    fn accumulate(self, other: Self) -> Self {
        self + other
    }

    fn divide(self, count: usize) -> Self {
        self / count as f64
    }

    fn is_nan(&self) -> bool {
        f64::is_nan(*self)
    }
}

impl MeanTerm for f32 {
    fn accumulate(self, other: Self) -> Self {
        self + other
    }

    fn divide(self, count: usize) -> Self {
        self / count as f32
    }

    fn is_nan(&self) -> bool {
        f32::is_nan(*self)
    }
}

impl<B: Backend> MeanTerm for Tensor<B, 1> {
    fn accumulate(self, other: Self) -> Self {
        self + other
    }

    fn divide(self, count: usize) -> Self {
        self.div_scalar(count as f64)
    }

    /// Reads the value back from the device.
    fn is_nan(&self) -> bool {
        self.clone().into_scalar().elem::<f64>().is_nan()
    }
}

/// What [mean_or] returns for an empty sequence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EmptyMean {
    Value(f64),
    Raise,
}

impl Default for EmptyMean {
    fn default() -> Self {
        EmptyMean::Value(0.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MeanOptions {
    /// Drop NaN terms before averaging.
    pub ignore_nan: bool,
    pub empty: EmptyMean,
}

impl MeanOptions {
    pub fn with_ignore_nan(mut self, ignore_nan: bool) -> Self {
        self.ignore_nan = ignore_nan;
        self
    }

    pub fn with_empty(mut self, empty: EmptyMean) -> Self {
        self.empty = empty;
        self
    }
}

/// Average a sequence of terms, `None` when there is nothing to average.
///
/// A single term is returned as is.
pub fn mean<T, I>(values: I, ignore_nan: bool) -> Option<T>
where
    T: MeanTerm,
    I: IntoIterator<Item = T>,
{
    let mut values = values
        .into_iter()
        .filter(|value| !(ignore_nan && value.is_nan()));

    let mut acc = values.next()?;
    let mut count = 1;
    for value in values {
        acc = acc.accumulate(value);
        count += 1;
    }

    if count == 1 {
        Some(acc)
    } else {
        Some(acc.divide(count))
    }
}

/// [mean] with the empty-sequence policy of `options` applied.
///
/// `make_empty` turns the configured default value into a term.
pub fn mean_or<T, I, F>(values: I, options: MeanOptions, make_empty: F) -> Result<T, LossError>
where
    T: MeanTerm,
    I: IntoIterator<Item = T>,
    F: FnOnce(f64) -> T,
{
    match mean(values, options.ignore_nan) {
        Some(value) => Ok(value),
        None => match options.empty {
            EmptyMean::Value(value) => Ok(make_empty(value)),
            EmptyMean::Raise => Err(LossError::EmptyMean),
        },
    }
}
