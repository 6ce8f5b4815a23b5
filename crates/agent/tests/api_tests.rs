//! Integration tests for the exporter API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use impact_lib::{
    EnergyBreakdown, EngineMetrics, HealthRegistry, ImpactExporter, ImpactMetrics, MetricsHeader,
    TimeWindow,
};
use sci_exporter::api::{create_router, AppState};
use std::sync::Arc;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register("vms").await;
    health_registry.register("pods").await;

    let state = Arc::new(AppState::new(health_registry, ImpactExporter::new()));
    let router = create_router(state.clone());

    (router, state)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    // Two pods could not be attributed
    state.health_registry.record_cycle("pods", 8, 2).await;

    let (status, health) = get_json(app, "/healthz").await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["pipelines"]["pods"]["resources_failed"], 2);
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .record_failure("vms", "resource discovery failed")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
    assert_eq!(health["pipelines"]["vms"]["message"], "resource discovery failed");
}

#[tokio::test]
async fn test_readyz_returns_503_before_first_cycle() {
    let (app, _state) = setup_test_app().await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_after_first_cycle() {
    let (app, state) = setup_test_app().await;

    state.health_registry.record_cycle("vms", 3, 0).await;
    state.health_registry.record_cycle("pods", 5, 1).await;
    state.health_registry.mark_cycle_complete().await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_pipeline_unhealthy() {
    let (app, state) = setup_test_app().await;

    state.health_registry.record_cycle("vms", 3, 0).await;
    state
        .health_registry
        .record_failure("pods", "opencost unreachable")
        .await;
    state.health_registry.mark_cycle_complete().await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(readiness["reason"].as_str().unwrap().contains("pods"));
}

fn vm_metrics(name: &str) -> ImpactMetrics {
    ImpactMetrics::new(
        MetricsHeader::new(name, "azure.vm", "compute-server", &TimeWindow::default()),
        EnergyBreakdown {
            cpu_kwh: 0.04,
            mem_kwh: 0.01,
            gpu_kwh: 0.0,
        },
        200.0,
        1.5,
    )
}

#[tokio::test]
async fn test_impact_returns_last_cycle_trees() {
    let (app, state) = setup_test_app().await;

    let (status, trees) = get_json(app.clone(), "/impact").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(trees, serde_json::json!([]));

    state.exporter.export_cycle(&[vm_metrics("api-impact-vm")]);

    let (status, trees) = get_json(app, "/impact").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(trees[0]["name"], "api-impact-vm");
    assert_eq!(trees[0]["type"], "azure.vm");
    let sci = trees[0]["SCI"].as_f64().unwrap();
    assert!((sci - (0.05 * 200.0 + 1.5)).abs() < 1e-9);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    state.exporter.export_cycle(&[vm_metrics("api-test-vm")]);
    EngineMetrics::new().observe_cycle_latency(0.2);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("sci_score_gco2"));
    assert!(metrics_text.contains("name=\"api-test-vm\""));
    assert!(metrics_text.contains("sci_e_kwh"));
    assert!(metrics_text.contains("sci_exporter_cycle_latency_seconds_bucket"));
    assert!(metrics_text.contains("sci_exporter_cycle_latency_seconds_count"));
}
