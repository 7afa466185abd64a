//! Read-only introspection surface, exercised through the real router.


use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use marlin_supervisor::introspection::router;
use marlin_supervisor::mds::MemoryStore;
use test_harness::{job_record, TestSupervisor};

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_worker_endpoint_reports_identity_and_counters() {
    let store = Arc::new(MemoryStore::new());
    store.seed_job(job_record("job-001", 1, &["k1"])).await;
    store.set_location("k1", vec!["hA"]).await;

    let sup = TestSupervisor::start("w-intro", store.clone());
    sup.wait_for_job_state("job-001", "running", Duration::from_secs(2))
        .await;

    let (status, body) = get_json(router(sup.supervisor.clone()), "/api/worker").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["uuid"], "w-intro");
    assert_eq!(body["trackedJobs"], 1);
    assert!(body["ticks"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_jobs_endpoint_exposes_per_phase_progress() {
    let store = Arc::new(MemoryStore::new());
    store.seed_job(job_record("job-001", 2, &["k1", "k2"])).await;
    store.set_location("k1", vec!["hA"]).await;
    store.set_location("k2", vec!["hB"]).await;

    let sup = TestSupervisor::start("w-intro", store.clone());
    sup.wait_for_job_state("job-001", "running", Duration::from_secs(2))
        .await;

    let (status, body) = get_json(router(sup.supervisor.clone()), "/api/jobs").await;
    assert_eq!(status, StatusCode::OK);
    let jobs = body.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job["jobId"], "job-001");
    assert_eq!(job["state"], "running");
    assert_eq!(job["phaseIndex"], 0);
    assert_eq!(job["phaseCount"], 2);

    let phases = job["phases"].as_array().unwrap();
    assert_eq!(phases.len(), 2);
    assert_eq!(phases[0]["inputKeys"], 2);
    assert_eq!(phases[0]["groups"], 2);
    assert_eq!(phases[0]["unassignedKeys"], 0);

    let (status, single) =
        get_json(router(sup.supervisor.clone()), "/api/jobs/job-001").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(single["jobId"], "job-001");
}

#[tokio::test]
async fn test_unknown_job_returns_not_found() {
    let store = Arc::new(MemoryStore::new());
    let sup = TestSupervisor::start("w-intro", store);

    let (status, _) = get_json(router(sup.supervisor.clone()), "/api/jobs/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
