use crate::parameter::ParamId;

/// Error returned from model-container and fitting operations.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ModelError {
    #[error("component {name} is already in the model")]
    DuplicateComponent { name: String },

    #[error("component name {name} matched {n_matches} components")]
    ComponentLookup { name: String, n_matches: usize },

    #[error("twinning {follower} to {leader} would create a cycle")]
    TwinCycle { follower: String, leader: String },

    #[error("parameter {name} is twinned, set its value through the twin target")]
    ImmutableParameter { name: String },

    #[error("signal range ({x1}, {x2}) is empty or inverted for the axis direction")]
    EmptySignalRange { x1: f64, x2: f64 },

    #[error("per-channel length {actual} does not match the signal axis size {expected}")]
    MaskLengthMismatch { expected: usize, actual: usize },

    #[error("fit at position {position:?} did not converge after {n_iter} iterations")]
    FitNotConverged { position: Vec<usize>, n_iter: usize },

    #[error("polynomial of order 0 is not supported")]
    InvalidPolynomialOrder,

    #[error("no parameter with id {id:?} in the model")]
    ParameterNotFound { id: ParamId },

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("legacy polynomial layout: {reason}")]
    LegacyConversion { reason: String },
}
