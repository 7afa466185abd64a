//! End-to-end supervisor behavior: discovery, planning, completion, and
//! the owned-job cap.


use std::sync::Arc;
use std::time::Duration;

use marlin_supervisor::mds::record::JobRecordState;
use marlin_supervisor::mds::MemoryStore;
use test_harness::{job_record, test_config, wait_until, TestSupervisor};

/// Cold start over a single-phase job: input keys are partitioned into one
/// task group per distinct preferred host and the job reaches RUNNING.
#[tokio::test]
async fn test_cold_start_partitions_keys_by_host() {
    let store = Arc::new(MemoryStore::new());
    store
        .seed_job(job_record("job-001", 1, &["k1", "k2", "k3", "k4", "k5", "k6"]))
        .await;
    store.set_location("k1", vec!["hA"]).await;
    store.set_location("k2", vec!["hA"]).await;
    store.set_location("k3", vec!["hB"]).await;
    store.set_location("k4", vec!["hB"]).await;
    store.set_location("k5", vec!["hC"]).await;
    store.set_location("k6", vec!["hC"]).await;

    let sup = TestSupervisor::start("w-a", store.clone());
    sup.wait_for_job_state("job-001", "running", Duration::from_secs(2))
        .await;

    let groups = store.task_groups("job-001").await;
    assert_eq!(groups.len(), 3, "one group per distinct host");

    // The groups partition the input: every key exactly once.
    let mut covered: Vec<String> = groups.iter().flat_map(|g| g.input_keys.clone()).collect();
    covered.sort();
    assert_eq!(covered, vec!["k1", "k2", "k3", "k4", "k5", "k6"]);

    for group in &groups {
        assert_eq!(group.phase_num, 0);
        assert!(group.results.is_empty());
        for key in &group.input_keys {
            let expected_host = match key.as_str() {
                "k1" | "k2" => "hA",
                "k3" | "k4" => "hB",
                _ => "hC",
            };
            assert_eq!(group.host, expected_host, "key {key} on its preferred host");
        }
    }

    let record = store.job("job-001").await.unwrap();
    assert_eq!(record.worker.as_deref(), Some("w-a"));
    assert_eq!(record.state, JobRecordState::Running);
}

/// Once the agents report every key ok, the final record is written and
/// the job leaves the supervisor's table.
#[tokio::test]
async fn test_job_completes_and_is_dropped() {
    let store = Arc::new(MemoryStore::new());
    store.seed_job(job_record("job-001", 1, &["k1", "k2"])).await;
    store.set_location("k1", vec!["hA"]).await;
    store.set_location("k2", vec!["hA"]).await;

    let sup = TestSupervisor::start("w-a", store.clone());
    sup.wait_for_job_state("job-001", "running", Duration::from_secs(2))
        .await;

    store.finish_phase("job-001", 0, |_| Vec::new()).await;

    sup.wait_for_untracked("job-001", Duration::from_secs(2)).await;
    let record = store.job("job-001").await.unwrap();
    assert_eq!(record.state, JobRecordState::Done);
    assert_eq!(record.worker.as_deref(), Some("w-a"));
    assert!(record.results.is_empty());
}

/// An input key with an empty host list is recorded as a per-key failure
/// outcome; the rest of the job proceeds normally.
#[tokio::test]
async fn test_unlocatable_key_is_recorded_not_fatal() {
    let store = Arc::new(MemoryStore::new());
    store.seed_job(job_record("job-001", 1, &["k1", "k2", "k3"])).await;
    store.set_location("k1", vec!["hA"]).await;
    store.set_location("k2", vec!["hA"]).await;
    store.set_location("k3", vec![]).await;

    let sup = TestSupervisor::start("w-a", store.clone());
    sup.wait_for_job_state("job-001", "running", Duration::from_secs(2))
        .await;

    let groups = store.task_groups("job-001").await;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].input_keys, vec!["k1", "k2"], "k3 never reaches an agent");

    store.finish_phase("job-001", 0, |_| Vec::new()).await;
    sup.wait_for_untracked("job-001", Duration::from_secs(2)).await;

    let record = store.job("job-001").await.unwrap();
    assert_eq!(record.state, JobRecordState::Done);
    assert_eq!(record.results.len(), 1);
    assert_eq!(record.results[0].key.as_deref(), Some("k3"));
}

/// Discovery events beyond the owned-job cap are dropped; the excess job
/// stays unassigned in the store.
#[tokio::test]
async fn test_owned_job_cap_drops_excess_discoveries() {
    let store = Arc::new(MemoryStore::new());
    store.seed_job(job_record("job-a", 1, &["k1"])).await;
    store.seed_job(job_record("job-b", 1, &["k2"])).await;
    store.set_location("k1", vec!["hA"]).await;
    store.set_location("k2", vec!["hA"]).await;

    let config = test_config("w-a").with_max_owned_jobs(1);
    let sup = TestSupervisor::start_with_config(config, store.clone());

    // Neither job ever finishes, so the single slot stays occupied.
    sup.wait_for_job_state("job-a", "running", Duration::from_secs(2))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(sup.supervisor.worker_snapshot().await.tracked_jobs, 1);
    assert!(sup.snapshot("job-b").await.is_none());
    assert!(store.job("job-b").await.unwrap().worker.is_none());
}

/// Re-discovering a job the supervisor believes it owns means the lock is
/// presumed lost: the job is dropped, re-admitted, and re-claimed.
#[tokio::test]
async fn test_rediscovered_owned_job_is_reclaimed() {
    let store = Arc::new(MemoryStore::new());
    store.seed_job(job_record("job-001", 1, &["k1"])).await;
    store.set_location("k1", vec!["hA"]).await;

    let sup = TestSupervisor::start("w-a", store.clone());
    sup.wait_for_job_state("job-001", "running", Duration::from_secs(2))
        .await;

    // Feed the currently-owned record back through discovery.
    let record = store.job("job-001").await.unwrap();
    sup.supervisor.on_job(record).await;

    // The job re-enters the table as new; the conditional write against
    // the prior owner (this supervisor) succeeds and it comes back.
    sup.wait_for_job_state("job-001", "running", Duration::from_secs(2))
        .await;
    let record = store.job("job-001").await.unwrap();
    assert_eq!(record.worker.as_deref(), Some("w-a"));

    // No duplicate planning happened along the way.
    wait_until("stable group count", Duration::from_secs(1), || {
        let store = store.clone();
        async move { store.task_groups("job-001").await.len() == 1 }
    })
    .await;
}
