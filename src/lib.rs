#![doc = include_str!("../README.md")]

mod axis;
pub use axis::{SignalAxis, SpanRoi};

mod component;
pub use component::polynomial::{convert_legacy_polynomial, polyfit};
pub use component::{
    Activity, Component, ComponentFunction, ComponentId, ComponentKind, Gaussian, Offset,
    Polynomial,
};

mod error;
pub use error::ModelError;

mod fit;
pub use fit::{FitProblem, FitResult, LevenbergMarquardt, Minimizer};

mod loss;
pub use loss::LossFunction;

mod model;
pub use model::{BoundInfo, Model, MultifitResult};

mod parameter;
pub use parameter::{ParamId, Parameter, ParameterMap, TwinLink};

mod signal;
pub use signal::Signal;
