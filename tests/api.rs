//! End-to-end tests of the HTTP surface with stub estimators.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use expense_inference::features::FeatureValue;
use expense_inference::{server, Estimator, ExpensePredictor, PersonRecord};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

struct ConstantEstimator(f64);

impl Estimator for ConstantEstimator {
    fn predict(&self, rows: &[PersonRecord]) -> expense_inference::Result<Vec<f64>> {
        Ok(vec![self.0; rows.len()])
    }

    fn describe(&self) -> String {
        "constant".to_string()
    }
}

/// Records the ordered cells of the first row it sees.
#[derive(Default)]
struct RecordingEstimator {
    calls: AtomicUsize,
    last: std::sync::Mutex<Option<[FeatureValue; 12]>>,
}

impl Estimator for RecordingEstimator {
    fn predict(&self, rows: &[PersonRecord]) -> expense_inference::Result<Vec<f64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = rows.first().map(PersonRecord::values);
        Ok(vec![1.0; rows.len()])
    }
}

struct FailingEstimator;

impl Estimator for FailingEstimator {
    fn predict(&self, _rows: &[PersonRecord]) -> expense_inference::Result<Vec<f64>> {
        anyhow::bail!("feature shape mismatch")
    }
}

fn app(estimator: Arc<dyn Estimator>) -> Router {
    server::router(ExpensePredictor::new(estimator))
}

fn reference_body() -> Value {
    json!({
        "age": 19,
        "bmi": 27.9,
        "children": 0,
        "sex": "male",
        "smoker": "yes",
        "region": "southeast"
    })
}

async fn post_json(app: Router, body: String) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/predict")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn predict_returns_rounded_estimate() {
    let (status, body) = post_json(
        app(Arc::new(ConstantEstimator(16884.92423))),
        reference_body().to_string(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "predicted_expense": 16884.92 }));
}

#[tokio::test]
async fn predict_sends_ordered_record_to_estimator() {
    let estimator = Arc::new(RecordingEstimator::default());
    let (status, _) = post_json(app(estimator.clone()), reference_body().to_string()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(estimator.calls.load(Ordering::SeqCst), 1);

    let seen = estimator.last.lock().unwrap().unwrap();
    assert_eq!(&seen[..9], &[
        FeatureValue::Int(19),
        FeatureValue::Float(27.9),
        FeatureValue::Int(0),
        FeatureValue::Text("male"),
        FeatureValue::Text("yes"),
        FeatureValue::Text("southeast"),
        FeatureValue::Text("young"),
        FeatureValue::Text("medium"),
        FeatureValue::Text("overweight"),
    ]);
    assert!((seen[9].as_f64().unwrap() - 530.1).abs() < 1e-9);
    assert_eq!(seen[10], FeatureValue::Float(27.9));
    assert_eq!(seen[11], FeatureValue::Float(19.0));
}

#[tokio::test]
async fn predict_reports_every_invalid_field() {
    let body = json!({
        "age": 121,
        "bmi": 14.9,
        "children": 0,
        "sex": "other",
        "smoker": "no"
    });

    let estimator = Arc::new(RecordingEstimator::default());
    let (status, body) = post_json(app(estimator.clone()), body.to_string()).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let detail = body["detail"].as_array().unwrap();
    let fields: Vec<&str> = detail.iter().map(|d| d["field"].as_str().unwrap()).collect();
    assert_eq!(fields, vec!["age", "bmi", "sex", "region"]);
    assert_eq!(detail[0]["constraint"], "less_than_equal");
    assert_eq!(detail[0]["input"], 121);
    assert_eq!(detail[2]["input"], "other");
    assert_eq!(detail[3]["constraint"], "missing");

    // The estimator never sees invalid input.
    assert_eq!(estimator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn predict_rejects_malformed_json() {
    let (status, body) = post_json(app(Arc::new(ConstantEstimator(1.0))), "{not json".to_string()).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["detail"][0]["field"], "body");
    assert_eq!(body["detail"][0]["constraint"], "json_invalid");
}

#[tokio::test]
async fn predict_rejects_non_object_body() {
    let estimator = Arc::new(RecordingEstimator::default());

    for body in [r#"[19, 27.9, 0, "male", "yes", "southeast"]"#, "[]", "19"] {
        let (status, detail) = post_json(app(estimator.clone()), body.to_string()).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");
        let entries = detail["detail"].as_array().unwrap();
        assert_eq!(entries.len(), 1, "{body}");
        assert_eq!(entries[0]["field"], "body");
        assert_eq!(entries[0]["constraint"], "json_invalid");
    }
    assert_eq!(estimator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn predict_accepts_numeric_strings() {
    let body = json!({
        "age": "19",
        "bmi": "27.9",
        "children": "0",
        "sex": "male",
        "smoker": "yes",
        "region": "southeast"
    });
    let (status, body) = post_json(app(Arc::new(ConstantEstimator(4200.456))), body.to_string()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "predicted_expense": 4200.46 }));
}

#[tokio::test]
async fn predict_estimator_failure_is_500() {
    let (status, body) = post_json(app(Arc::new(FailingEstimator)), reference_body().to_string()).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["detail"].as_str().unwrap().contains("feature shape mismatch"));
}

#[tokio::test]
async fn server_keeps_serving_after_failure() {
    let router = app(Arc::new(ConstantEstimator(250.0)));

    let (status, _) = post_json(router.clone(), json!({ "age": 5 }).to_string()).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, body) = post_json(router, reference_body().to_string()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["predicted_expense"], 250.0);
}

#[tokio::test]
async fn health_reports_model() {
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app(Arc::new(ConstantEstimator(1.0))).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body, json!({ "status": "ok", "model": "constant" }));
}
