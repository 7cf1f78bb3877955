use axum::{body::Body, http::Request, http::StatusCode};
use ingestor::ops;
use serial_test::serial;
use tower::ServiceExt;

async fn get(path: &str) -> StatusCode {
    ops::router()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap()
        .status()
}

#[tokio::test]
#[serial]
async fn readiness_follows_subscription() {
    ops::set_ready(false);
    assert_eq!(get("/healthz").await, StatusCode::OK);
    assert_eq!(get("/readyz").await, StatusCode::SERVICE_UNAVAILABLE);

    ops::set_ready(true);
    assert!(ops::is_ready());
    assert_eq!(get("/readyz").await, StatusCode::OK);
    ops::set_ready(false);
}
