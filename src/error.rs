use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LossError {
    #[error("Sigmoid output possible only with 1 class")]
    SigmoidMultiClass,

    #[error("Empty mean")]
    EmptyMean,

    #[error("Unknown loss: `{0}`")]
    UnknownLoss(String),

    #[error("Invalid loss configuration: `{0}`")]
    InvalidConfig(String),
}
