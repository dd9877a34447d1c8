//! Medical expense estimation.
//!
//! This crate validates demographic and lifestyle attributes of a person, derives
//! the engineered features a pre-trained regression pipeline expects, and runs
//! that pipeline (exported to ONNX) to produce an expense estimate.

pub mod error;
pub mod features;
pub mod predictor;
pub mod server;

pub use error::{Constraint, FieldError, PredictError, ValidationError};
pub use features::{derive, PersonInput, PersonRecord, RawPersonInput};
pub use predictor::{Config, Estimator, ExpensePredictor, OnnxEstimator, Prediction};

/// Library-wide error type.
pub type Result<T> = anyhow::Result<T>;
