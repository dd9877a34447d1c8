//! Expense prediction interface.
//!
//! Provides the [`Estimator`] seam, the ONNX-backed [`OnnxEstimator`] loaded once
//! at startup, and [`ExpensePredictor`], which runs validation, feature derivation,
//! estimation and rounding for a single request.

use crate::error::PredictError;
use crate::features::{derive, ColumnKind, FeatureValue, PersonRecord, RawPersonInput};
use crate::Result;
use anyhow::{anyhow, bail, Context};
use ndarray::Array2;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Tensor, ValueType};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Configuration for the predictor and the service around it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the ONNX export of the trained pipeline
    pub model_path: PathBuf,

    /// Address the HTTP listener binds to
    pub bind_addr: SocketAddr,

    /// Enable graph optimization
    pub optimize_graph: bool,

    /// Intra-op threads per inference call
    pub intra_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("insurance_model.onnx"),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            optimize_graph: true,
            intra_threads: 1,
        }
    }
}

/// A trained regression function over ordered feature records.
///
/// Implementations are shared read-only by every in-flight request.
pub trait Estimator: Send + Sync {
    /// Predict one value per row, in row order.
    fn predict(&self, rows: &[PersonRecord]) -> Result<Vec<f64>>;

    /// Short description for health reporting.
    fn describe(&self) -> String {
        "estimator".to_string()
    }
}

/// Element type an ONNX input expects for its column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Text,
    Int64,
    Float32,
    Float64,
}

impl InputKind {
    fn from_element_type(ty: TensorElementType) -> Option<Self> {
        match ty {
            TensorElementType::String => Some(InputKind::Text),
            TensorElementType::Int64 => Some(InputKind::Int64),
            TensorElementType::Float32 => Some(InputKind::Float32),
            TensorElementType::Float64 => Some(InputKind::Float64),
            _ => None,
        }
    }
}

/// One model input fed from one feature column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBinding {
    pub name: String,
    /// Index into [`PersonRecord::COLUMNS`]
    pub column: usize,
    pub kind: InputKind,
}

/// Match model inputs to feature columns by name.
///
/// Every column must be consumed by exactly one input, and each input's element
/// type must be able to hold the column's values.
pub fn bind_inputs(inputs: &[(String, InputKind)]) -> Result<Vec<InputBinding>> {
    let mut bindings = Vec::with_capacity(inputs.len());
    for (name, kind) in inputs {
        let Some(column) = PersonRecord::COLUMNS.iter().position(|c| *c == name.as_str()) else {
            bail!("model input '{name}' is not a feature column");
        };

        let compatible = matches!(
            (PersonRecord::COLUMN_KINDS[column], kind),
            (ColumnKind::Text, InputKind::Text)
                | (ColumnKind::Int, InputKind::Int64 | InputKind::Float32 | InputKind::Float64)
                | (ColumnKind::Float, InputKind::Float32 | InputKind::Float64)
        );
        if !compatible {
            bail!("model input '{name}' has type {kind:?}, incompatible with the column's values");
        }

        bindings.push(InputBinding {
            name: name.clone(),
            column,
            kind: *kind,
        });
    }

    for (column, name) in PersonRecord::COLUMNS.iter().enumerate() {
        match bindings.iter().filter(|b| b.column == column).count() {
            1 => {}
            0 => bail!("model has no input for feature column '{name}'"),
            _ => bail!("model has more than one input for feature column '{name}'"),
        }
    }

    Ok(bindings)
}

/// Estimator backed by an ONNX Runtime session.
pub struct OnnxEstimator {
    /// ONNX Runtime session; `run` needs exclusive access.
    session: Mutex<Session>,

    bindings: Vec<InputBinding>,

    output_name: String,

    output_kind: InputKind,

    description: String,
}

impl OnnxEstimator {
    /// Load the ONNX model named by `config.model_path`.
    ///
    /// Fails if the file is missing or unreadable, or if its inputs do not match
    /// the feature columns. Callers must treat this as fatal.
    ///
    /// # Example
    /// ```no_run
    /// use expense_inference::{Config, OnnxEstimator};
    ///
    /// let estimator = OnnxEstimator::load(&Config::default()).unwrap();
    /// ```
    pub fn load(config: &Config) -> Result<Self> {
        let path = &config.model_path;
        if !path.is_file() {
            bail!("model file not found: {}", path.display());
        }

        let session = Session::builder()?
            .with_optimization_level(if config.optimize_graph {
                GraphOptimizationLevel::Level3
            } else {
                GraphOptimizationLevel::Level1
            })?
            .with_intra_threads(config.intra_threads.max(1))?
            .commit_from_file(path)
            .with_context(|| format!("failed to load model {}", path.display()))?;

        let mut inputs = Vec::with_capacity(session.inputs.len());
        for input in &session.inputs {
            let kind = match &input.input_type {
                ValueType::Tensor { ty, .. } => InputKind::from_element_type(*ty),
                _ => None,
            }
            .ok_or_else(|| anyhow!("model input '{}' is not a supported tensor", input.name))?;
            inputs.push((input.name.clone(), kind));
        }
        let bindings = bind_inputs(&inputs)?;

        let output = session
            .outputs
            .first()
            .ok_or_else(|| anyhow!("model declares no outputs"))?;
        let output_kind = match &output.output_type {
            ValueType::Tensor { ty, .. } => InputKind::from_element_type(*ty),
            _ => None,
        };
        let output_kind = match output_kind {
            Some(kind @ (InputKind::Float32 | InputKind::Float64)) => kind,
            _ => bail!("model output '{}' is not a float tensor", output.name),
        };
        let output_name = output.name.clone();

        let description = format!(
            "onnx:{}",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string())
        );

        info!(
            model = %path.display(),
            inputs = bindings.len(),
            output = %output_name,
            "loaded estimator"
        );

        Ok(Self {
            session: Mutex::new(session),
            bindings,
            output_name,
            output_kind,
            description,
        })
    }

    /// Build one `[rows, 1]` tensor per model input.
    fn prepare_inputs(&self, rows: &[PersonRecord]) -> Result<Vec<(String, DynValue)>> {
        let table: Vec<[FeatureValue; 12]> = rows.iter().map(PersonRecord::values).collect();
        let n = rows.len();

        let mut inputs = Vec::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            let cells = table.iter().map(|row| row[binding.column]);
            let value: DynValue = match binding.kind {
                InputKind::Text => {
                    let column: Vec<String> = cells
                        .map(|cell| match cell {
                            FeatureValue::Text(s) => Ok(s.to_string()),
                            other => Err(anyhow!("expected text for '{}', got {other:?}", binding.name)),
                        })
                        .collect::<Result<_>>()?;
                    let array = Array2::from_shape_vec((n, 1), column)?;
                    Tensor::from_string_array(&array)?.into_dyn()
                }
                InputKind::Int64 => {
                    let column: Vec<i64> = cells
                        .map(|cell| match cell {
                            FeatureValue::Int(v) => Ok(v),
                            other => Err(anyhow!("expected integer for '{}', got {other:?}", binding.name)),
                        })
                        .collect::<Result<_>>()?;
                    Tensor::from_array(Array2::from_shape_vec((n, 1), column)?)?.into_dyn()
                }
                InputKind::Float32 => {
                    let column: Vec<f32> = cells
                        .map(|cell| numeric(cell, &binding.name).map(|v| v as f32))
                        .collect::<Result<_>>()?;
                    Tensor::from_array(Array2::from_shape_vec((n, 1), column)?)?.into_dyn()
                }
                InputKind::Float64 => {
                    let column: Vec<f64> = cells
                        .map(|cell| numeric(cell, &binding.name))
                        .collect::<Result<_>>()?;
                    Tensor::from_array(Array2::from_shape_vec((n, 1), column)?)?.into_dyn()
                }
            };
            inputs.push((binding.name.clone(), value));
        }

        Ok(inputs)
    }
}

fn numeric(cell: FeatureValue, name: &str) -> Result<f64> {
    cell.as_f64()
        .ok_or_else(|| anyhow!("expected a number for '{name}', got {cell:?}"))
}

impl Estimator for OnnxEstimator {
    fn predict(&self, rows: &[PersonRecord]) -> Result<Vec<f64>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let inputs = self.prepare_inputs(rows)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("estimator session lock poisoned"))?;
        let outputs = session.run(inputs)?;

        let output = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| anyhow!("model produced no '{}' output", self.output_name))?;

        let values: Vec<f64> = match self.output_kind {
            InputKind::Float64 => output.try_extract_tensor::<f64>()?.1.to_vec(),
            _ => output
                .try_extract_tensor::<f32>()?
                .1
                .iter()
                .map(|&v| f64::from(v))
                .collect(),
        };

        Ok(values)
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

/// Response of the prediction endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted_expense: f64,
}

/// Round to 2 decimals, halves away from zero.
pub fn round_to_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Runs validation, derivation, estimation and rounding for single requests.
#[derive(Clone)]
pub struct ExpensePredictor {
    estimator: Arc<dyn Estimator>,
}

impl ExpensePredictor {
    pub fn new(estimator: Arc<dyn Estimator>) -> Self {
        Self { estimator }
    }

    /// Load the ONNX model from `config` and wrap it.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(Arc::new(OnnxEstimator::load(config)?)))
    }

    pub fn describe(&self) -> String {
        self.estimator.describe()
    }

    /// Predict the expense for one raw request body.
    pub fn predict(&self, raw: &RawPersonInput) -> std::result::Result<Prediction, PredictError> {
        let record = derive(raw)?;
        debug!(
            age_group = record.age_group().as_str(),
            lifestyle_risk = record.lifestyle_risk().as_str(),
            bmi_category = record.bmi_category().as_str(),
            "derived features"
        );
        self.predict_record(&record)
    }

    /// Predict the expense for an already derived record.
    pub fn predict_record(&self, record: &PersonRecord) -> std::result::Result<Prediction, PredictError> {
        let values = self
            .estimator
            .predict(std::slice::from_ref(record))
            .map_err(PredictError::Estimator)?;

        let value = match values.as_slice() {
            [value] => *value,
            _ => {
                return Err(PredictError::OutputMismatch {
                    expected: 1,
                    got: values.len(),
                })
            }
        };
        if !value.is_finite() {
            return Err(PredictError::NonFinite(value));
        }

        Ok(Prediction {
            predicted_expense: round_to_cents(value),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Constraint;
    use serde_json::json;

    struct ConstantEstimator(f64);

    impl Estimator for ConstantEstimator {
        fn predict(&self, rows: &[PersonRecord]) -> Result<Vec<f64>> {
            Ok(vec![self.0; rows.len()])
        }
    }

    struct FailingEstimator;

    impl Estimator for FailingEstimator {
        fn predict(&self, _rows: &[PersonRecord]) -> Result<Vec<f64>> {
            bail!("shape mismatch: expected 12 columns")
        }
    }

    struct EmptyEstimator;

    impl Estimator for EmptyEstimator {
        fn predict(&self, _rows: &[PersonRecord]) -> Result<Vec<f64>> {
            Ok(Vec::new())
        }
    }

    /// Echoes `age_bmi` back so tests can see which record reached the estimator.
    struct EchoEstimator;

    impl Estimator for EchoEstimator {
        fn predict(&self, rows: &[PersonRecord]) -> Result<Vec<f64>> {
            Ok(rows.iter().map(PersonRecord::age_bmi).collect())
        }
    }

    fn reference_input() -> RawPersonInput {
        serde_json::from_value(json!({
            "age": 19,
            "bmi": 27.9,
            "children": 0,
            "sex": "male",
            "smoker": "yes",
            "region": "southeast"
        }))
        .unwrap()
    }

    fn predictor(estimator: impl Estimator + 'static) -> ExpensePredictor {
        ExpensePredictor::new(Arc::new(estimator))
    }

    fn all_inputs() -> Vec<(String, InputKind)> {
        PersonRecord::COLUMNS
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let kind = match i {
                    0 | 2 => InputKind::Int64,
                    3..=8 => InputKind::Text,
                    _ => InputKind::Float32,
                };
                (c.to_string(), kind)
            })
            .collect()
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.model_path, PathBuf::from("insurance_model.onnx"));
        assert_eq!(config.bind_addr.port(), 8000);
        assert!(config.optimize_graph);
        assert_eq!(config.intra_threads, 1);
    }

    #[test]
    fn test_round_to_cents() {
        assert_eq!(round_to_cents(1234.5678), 1234.57);
        assert_eq!(round_to_cents(1234.5612), 1234.56);
        assert_eq!(round_to_cents(0.125), 0.13);
        assert_eq!(round_to_cents(-0.125), -0.13);
        assert_eq!(round_to_cents(42.0), 42.0);
    }

    #[test]
    fn test_reference_prediction_with_stub() {
        let p = predictor(ConstantEstimator(16884.924));
        let prediction = p.predict(&reference_input()).unwrap();
        assert_eq!(prediction.predicted_expense, 16884.92);
    }

    #[test]
    fn test_record_reaches_estimator() {
        let p = predictor(EchoEstimator);
        let prediction = p.predict(&reference_input()).unwrap();
        assert!((prediction.predicted_expense - 530.1).abs() < 1e-9);
    }

    #[test]
    fn test_validation_error_propagates_unchanged() {
        let mut raw = reference_input();
        raw.age = Some(json!(17));

        let err = predictor(ConstantEstimator(1.0)).predict(&raw).unwrap_err();
        match err {
            PredictError::Validation(v) => {
                assert_eq!(v.errors().len(), 1);
                assert_eq!(v.errors()[0].field, "age");
                assert_eq!(v.errors()[0].constraint, Constraint::GreaterThanEqual);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_estimator_failure_is_prediction_error() {
        let err = predictor(FailingEstimator).predict(&reference_input()).unwrap_err();
        assert!(!err.is_client_error());
        assert!(err.to_string().contains("shape mismatch"));
    }

    #[test]
    fn test_output_count_mismatch() {
        let err = predictor(EmptyEstimator).predict(&reference_input()).unwrap_err();
        assert!(matches!(err, PredictError::OutputMismatch { expected: 1, got: 0 }));
    }

    #[test]
    fn test_non_finite_output_rejected() {
        let err = predictor(ConstantEstimator(f64::INFINITY))
            .predict(&reference_input())
            .unwrap_err();
        assert!(matches!(err, PredictError::NonFinite(_)));
    }

    #[test]
    fn test_prediction_serializes() {
        let body = serde_json::to_value(Prediction { predicted_expense: 12.5 }).unwrap();
        assert_eq!(body, json!({"predicted_expense": 12.5}));
    }

    #[test]
    fn test_bind_inputs_accepts_column_convention() {
        let mut inputs = all_inputs();
        inputs.reverse();

        let bindings = bind_inputs(&inputs).unwrap();
        assert_eq!(bindings.len(), 12);
        let sex = bindings.iter().find(|b| b.name == "sex").unwrap();
        assert_eq!(sex.column, 3);
        assert_eq!(sex.kind, InputKind::Text);
    }

    #[test]
    fn test_bind_inputs_rejects_unknown_input() {
        let mut inputs = all_inputs();
        inputs.push(("income".to_string(), InputKind::Float32));
        let err = bind_inputs(&inputs).unwrap_err();
        assert!(err.to_string().contains("income"));
    }

    #[test]
    fn test_bind_inputs_rejects_missing_column() {
        let inputs: Vec<_> = all_inputs().into_iter().filter(|(n, _)| n != "smoker_age").collect();
        let err = bind_inputs(&inputs).unwrap_err();
        assert!(err.to_string().contains("smoker_age"));
    }

    #[test]
    fn test_bind_inputs_rejects_incompatible_types() {
        let mut inputs = all_inputs();
        inputs[3].1 = InputKind::Float32;
        assert!(bind_inputs(&inputs).is_err());

        let mut inputs = all_inputs();
        inputs[1].1 = InputKind::Int64;
        assert!(bind_inputs(&inputs).is_err());

        // Integer columns may be fed as floats.
        let mut inputs = all_inputs();
        inputs[0].1 = InputKind::Float64;
        assert!(bind_inputs(&inputs).is_ok());
    }

    #[test]
    fn test_load_missing_model_fails() {
        let config = Config {
            model_path: PathBuf::from("/nonexistent/model.onnx"),
            ..Config::default()
        };
        let err = OnnxEstimator::load(&config).err().unwrap();
        assert!(err.to_string().contains("model file not found"));
    }
}
