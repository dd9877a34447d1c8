//! Error taxonomy surfaced to callers of the prediction pipeline.
//!
//! Validation failures are caller-actionable and carry one [`FieldError`] per
//! violated constraint. Estimator failures are request-scoped: the process keeps
//! serving, but the request is not retried.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// The constraint a single input field violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// Field absent from the request (or explicitly `null`).
    Missing,
    /// Integer field given a non-numeric value.
    IntType,
    /// Integer field given a number with a fractional part.
    IntFromFloat,
    /// Float field given a non-numeric value.
    FloatType,
    /// Categorical field given a non-string value.
    StringType,
    /// Number below the inclusive lower bound.
    GreaterThanEqual,
    /// Number above the inclusive upper bound.
    LessThanEqual,
    /// String outside the fixed enumeration.
    LiteralError,
    /// Request body was not a JSON object.
    JsonInvalid,
}

/// One field-level violation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    /// Name of the offending field (`"body"` for whole-body problems).
    pub field: &'static str,
    pub constraint: Constraint,
    /// Human readable description of the violated constraint.
    pub message: String,
    /// The value received, `null` when the field was missing.
    pub input: Value,
}

impl FieldError {
    pub fn new(
        field: &'static str,
        constraint: Constraint,
        message: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            field,
            constraint,
            message: message.into(),
            input,
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (got {})", self.field, self.message, self.input)
    }
}

/// Every constraint violation found in one raw input.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{} validation error(s){}", .errors.len(), summarize(.errors))]
pub struct ValidationError {
    #[serde(rename = "detail")]
    errors: Vec<FieldError>,
}

impl ValidationError {
    pub fn new(errors: Vec<FieldError>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    /// Whether any violation names `field`.
    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }
}

fn summarize(errors: &[FieldError]) -> String {
    errors.iter().map(|err| format!("; {err}")).collect()
}

/// Failure of a single `predict` call.
#[derive(Debug, Error)]
pub enum PredictError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The estimator raised internally (shape mismatch, runtime failure).
    #[error("estimator failed: {0:#}")]
    Estimator(anyhow::Error),

    #[error("estimator returned {got} values for {expected} rows")]
    OutputMismatch { expected: usize, got: usize },

    #[error("estimator returned a non-finite value: {0}")]
    NonFinite(f64),
}

impl PredictError {
    /// Validation errors are caller-actionable; everything else is a server fault.
    pub fn is_client_error(&self) -> bool {
        matches!(self, PredictError::Validation(_))
    }
}
