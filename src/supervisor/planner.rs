//! Phase planner.
//!
//! Everything here is pure computation over a single phase's slot; the
//! supervisor drives the surrounding metadata-store calls. The planner is
//! idempotent across crashes because the durable task-group records are the
//! source of truth: the unassigned set is recomputed by set-difference on
//! every entry, so a restarted supervisor re-planning a phase skips keys
//! that already have groups and only emits groups for keys still missing.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use uuid::Uuid;

use crate::mds::record::{JobFailure, JobRecord, TaskGroupRecord};

/// In-memory state for one phase of one job. Rebuildable: `groups` mirrors
/// the durable records, `input` is recomputed on demand, and `failures`
/// holds per-key outcomes (unlocatable inputs) that never reach an agent.
#[derive(Debug, Default)]
pub struct PhaseSlot {
    /// Resolved input keys, in order, duplicates preserved. Empty until the
    /// first planning pass over this phase.
    pub input: Vec<String>,
    pub groups: BTreeMap<Uuid, TaskGroupRecord>,
    pub failures: Vec<JobFailure>,
}

impl PhaseSlot {
    /// Union of the keys already assigned to a group of this phase.
    pub fn assigned_keys(&self) -> BTreeSet<&String> {
        self.groups
            .values()
            .flat_map(|g| g.input_keys.iter())
            .collect()
    }
}

/// Step 1: the phase's input keys. Phase 0 reads the job record; later
/// phases concatenate the `ok` outputs of the previous phase's groups.
/// Duplicate outputs are preserved: each represents a distinct piece of
/// output, and the set semantics of [`unassigned_keys`] assign it to one
/// and only one downstream group.
pub fn resolve_input(
    record: &JobRecord,
    previous: Option<&PhaseSlot>,
    phase_index: usize,
) -> Vec<String> {
    if phase_index == 0 {
        record.input_keys.clone()
    } else {
        previous
            .map(|slot| {
                slot.groups
                    .values()
                    .flat_map(|g| g.ok_outputs().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Step 2: keys of `input` not yet covered by any group of the phase and
/// not already written off as failed. Recomputed on every planning entry,
/// which is what makes re-planning after a crash emit no duplicates.
pub fn unassigned_keys(slot: &PhaseSlot) -> BTreeSet<String> {
    let assigned = slot.assigned_keys();
    let failed: BTreeSet<&String> = slot.failures.iter().filter_map(|f| f.key.as_ref()).collect();
    slot.input
        .iter()
        .filter(|k| !assigned.contains(*k) && !failed.contains(*k))
        .cloned()
        .collect()
}

/// Output of [`partition_by_host`]: fresh task groups to persist, plus the
/// keys no host stores.
#[derive(Debug)]
pub struct Partition {
    pub groups: Vec<TaskGroupRecord>,
    pub unlocatable: Vec<String>,
}

/// Step 4: group each locatable key under its preferred (first) host and
/// cut one freshly-identified task group per host. Keys with an empty host
/// list are unlocatable; keys the locate response omitted stay unassigned
/// and are retried on a later tick. Keys returned without being requested
/// are logged and ignored.
pub fn partition_by_host(
    job_id: &str,
    phase_num: usize,
    phase: &serde_json::Value,
    unassigned: &BTreeSet<String>,
    locations: &HashMap<String, Vec<String>>,
) -> Partition {
    for key in locations.keys() {
        if !unassigned.contains(key) {
            tracing::warn!(key = %key, "Locate returned an unrequested key, ignoring");
        }
    }

    let mut by_host: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    let mut unlocatable = Vec::new();
    for key in unassigned {
        match locations.get(key) {
            None => {}
            Some(hosts) if hosts.is_empty() => unlocatable.push(key.clone()),
            Some(hosts) => by_host
                .entry(hosts[0].as_str())
                .or_default()
                .push(key.clone()),
        }
    }

    let groups = by_host
        .into_iter()
        .map(|(host, keys)| TaskGroupRecord::dispatch(job_id, phase_num, phase.clone(), host, keys))
        .collect();
    Partition { groups, unlocatable }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mds::record::KeyResult;

    fn locations(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, hosts)| {
                (
                    k.to_string(),
                    hosts.iter().map(|h| h.to_string()).collect(),
                )
            })
            .collect()
    }

    fn keys(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn phase_zero_input_comes_from_the_job_record() {
        let record = JobRecord::new(
            "job-001",
            vec![serde_json::json!({})],
            vec!["k1".to_string(), "k2".to_string()],
        );
        assert_eq!(resolve_input(&record, None, 0), vec!["k1", "k2"]);
    }

    #[test]
    fn later_phase_input_concatenates_ok_outputs_preserving_duplicates() {
        let record = JobRecord::new(
            "job-001",
            vec![serde_json::json!({}), serde_json::json!({})],
            vec!["k1".to_string()],
        );
        let mut prev = PhaseSlot::default();
        let mut g = TaskGroupRecord::dispatch(
            "job-001",
            0,
            serde_json::json!({}),
            "host-a",
            vec!["k1".to_string(), "k2".to_string()],
        );
        g.results = vec![
            KeyResult::ok("k1", vec!["o1".to_string(), "o1".to_string()]),
            KeyResult::fail("k2"),
        ];
        prev.groups.insert(g.task_group_id, g);

        let input = resolve_input(&record, Some(&prev), 1);
        assert_eq!(input, vec!["o1", "o1"]);
    }

    #[test]
    fn unassigned_subtracts_groups_and_failures() {
        let mut slot = PhaseSlot {
            input: vec!["k1".to_string(), "k2".to_string(), "k3".to_string()],
            ..Default::default()
        };
        let g = TaskGroupRecord::dispatch(
            "job-001",
            0,
            serde_json::json!({}),
            "host-a",
            vec!["k1".to_string()],
        );
        slot.groups.insert(g.task_group_id, g);
        slot.failures.push(JobFailure::for_key("k3", "no host"));

        assert_eq!(unassigned_keys(&slot), keys(&["k2"]));
    }

    #[test]
    fn partition_groups_keys_by_preferred_host() {
        let unassigned = keys(&["k1", "k2", "k3", "k4"]);
        let locs = locations(&[
            ("k1", &["hA", "hB"]),
            ("k2", &["hA"]),
            ("k3", &["hB"]),
            ("k4", &[]),
        ]);

        let partition = partition_by_host("job-001", 0, &serde_json::json!({}), &unassigned, &locs);
        assert_eq!(partition.unlocatable, vec!["k4"]);
        assert_eq!(partition.groups.len(), 2);

        let host_a = partition.groups.iter().find(|g| g.host == "hA").unwrap();
        assert_eq!(host_a.input_keys, vec!["k1", "k2"]);
        let host_b = partition.groups.iter().find(|g| g.host == "hB").unwrap();
        assert_eq!(host_b.input_keys, vec!["k3"]);
    }

    #[test]
    fn partition_leaves_omitted_keys_unassigned() {
        let unassigned = keys(&["k1", "k2"]);
        let locs = locations(&[("k1", &["hA"])]);
        let partition = partition_by_host("job-001", 0, &serde_json::json!({}), &unassigned, &locs);
        assert_eq!(partition.groups.len(), 1);
        assert!(partition.unlocatable.is_empty());
        // k2 ends up in neither list; the next tick retries it.
        let covered: Vec<&String> = partition.groups.iter().flat_map(|g| g.input_keys.iter()).collect();
        assert_eq!(covered, vec!["k1"]);
    }

    #[test]
    fn fresh_groups_are_dispatched_with_the_phase_descriptor() {
        let phase = serde_json::json!({"exec": "wc -l"});
        let unassigned = keys(&["k1"]);
        let locs = locations(&[("k1", &["hA"])]);
        let partition = partition_by_host("job-007", 2, &phase, &unassigned, &locs);
        let group = &partition.groups[0];
        assert_eq!(group.job_id, "job-007");
        assert_eq!(group.phase_num, 2);
        assert_eq!(group.phase, phase);
        assert!(group.results.is_empty());
        assert!(!group.task_group_id.is_nil());
    }
}
