//! In-process deduplication cache.
//!
//! Every entity class owns one index inside a single `RwLock`-protected
//! state block. A decision operation takes the write guard once for the
//! whole batch, so two concurrent batches for the same entity class can
//! never both claim the same key as new.
//!
//! Three index shapes cover all entity classes:
//! - presence sets for entities that never change once created (jobs,
//!   bridges, test reports, test suites, trace spans, coverage reports,
//!   deployments),
//! - versioned maps keyed by id holding the latest observed `updated_at`
//!   (pipelines, merge requests, merge request note events, projects),
//! - grouped presence sets keyed by a coarser parent id (sections by job,
//!   test cases by test suite, log-embedded metrics by job). Children of a
//!   parent are assumed to arrive as one immutable set; a parent seen once
//!   marks all of its children as known from then on.
//!
//! Indices only grow. The cache starts empty, is hydrated from the final
//! tables during warm-up and is discarded at shutdown.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::RwLock;

/// Composite key for a trace span: `(trace_id, span_id)`.
pub type SpanKey = (String, String);

#[derive(Default)]
struct Indices {
    pipelines: HashMap<i64, f64>,
    merge_requests: HashMap<i64, f64>,
    merge_request_note_events: HashMap<i64, f64>,
    projects: HashMap<i64, f64>,

    jobs: HashSet<i64>,
    bridges: HashSet<i64>,
    test_reports: HashSet<String>,
    test_suites: HashSet<String>,
    trace_spans: HashSet<SpanKey>,
    coverage_reports: HashSet<String>,
    deployments: HashSet<i64>,

    sections_by_job: HashSet<i64>,
    test_cases_by_suite: HashSet<String>,
    metrics_by_job: HashSet<i64>,
}

#[derive(Default)]
pub struct DedupCache {
    indices: RwLock<Indices>,
}

fn decide_presence<K: Eq + Hash + Clone>(set: &mut HashSet<K>, keys: &[K]) -> Vec<bool> {
    keys.iter().map(|k| set.insert(k.clone())).collect()
}

fn peek_presence<K: Eq + Hash + Clone>(set: &HashSet<K>, keys: &[K]) -> Vec<bool> {
    // A read-only pass still has to treat in-batch repeats of a key as
    // already seen, so track them locally.
    let mut in_batch: HashSet<&K> = HashSet::with_capacity(keys.len());
    keys.iter()
        .map(|k| !set.contains(k) && in_batch.insert(k))
        .collect()
}

fn commit_presence<K: Eq + Hash + Clone>(set: &mut HashSet<K>, keys: &[K], mask: &[bool]) {
    for (k, new) in keys.iter().zip(mask) {
        if *new {
            set.insert(k.clone());
        }
    }
}

fn decide_versioned<K: Eq + Hash + Clone>(
    map: &mut HashMap<K, f64>,
    pairs: &[(K, f64)],
) -> HashMap<K, bool> {
    let mut decisions = HashMap::with_capacity(pairs.len());
    for (k, version) in pairs {
        match map.get(k) {
            Some(cached) if *cached >= *version => {
                decisions.entry(k.clone()).or_insert(false);
            }
            _ => {
                map.insert(k.clone(), *version);
                decisions.insert(k.clone(), true);
            }
        }
    }
    decisions
}

fn peek_versioned<K: Eq + Hash + Clone>(
    map: &HashMap<K, f64>,
    pairs: &[(K, f64)],
) -> HashMap<K, bool> {
    let mut best: HashMap<&K, f64> = HashMap::with_capacity(pairs.len());
    let mut decisions = HashMap::with_capacity(pairs.len());
    for (k, version) in pairs {
        let cached = map.get(k).copied();
        let seen = best.get(k).copied();
        let newer =
            cached.map_or(true, |c| *version > c) && seen.map_or(true, |s| *version > s);
        if newer {
            best.insert(k, *version);
            decisions.insert(k.clone(), true);
        } else {
            decisions.entry(k.clone()).or_insert(false);
        }
    }
    decisions
}

fn commit_versioned<K: Eq + Hash + Clone>(
    map: &mut HashMap<K, f64>,
    pairs: &[(K, f64)],
    decisions: &HashMap<K, bool>,
) {
    for (k, version) in pairs {
        if decisions.get(k).copied().unwrap_or(false) {
            let slot = map.entry(k.clone()).or_insert(*version);
            if *version > *slot {
                *slot = *version;
            }
        }
    }
}

fn decide_grouped<K: Eq + Hash + Clone>(set: &mut HashSet<K>, parents: &[K]) -> HashMap<K, bool> {
    let mut decisions = HashMap::with_capacity(parents.len());
    for parent in parents {
        let new = set.insert(parent.clone());
        decisions.entry(parent.clone()).or_insert(new);
    }
    decisions
}

fn peek_grouped<K: Eq + Hash + Clone>(set: &HashSet<K>, parents: &[K]) -> HashMap<K, bool> {
    let mut decisions = HashMap::with_capacity(parents.len());
    for parent in parents {
        let new = !set.contains(parent);
        decisions.entry(parent.clone()).or_insert(new);
    }
    decisions
}

fn commit_grouped<K: Eq + Hash + Clone>(
    set: &mut HashSet<K>,
    parents: &[K],
    decisions: &HashMap<K, bool>,
) {
    for parent in parents {
        if decisions.get(parent).copied().unwrap_or(false) {
            set.insert(parent.clone());
        }
    }
}

macro_rules! presence_ops {
    ($decide:ident, $peek:ident, $commit:ident, $warm:ident, $field:ident, $key:ty) => {
        pub fn $decide(&self, keys: &[$key]) -> Vec<bool> {
            let mut indices = self.indices.write().expect("cache lock poisoned");
            decide_presence(&mut indices.$field, keys)
        }

        pub fn $peek(&self, keys: &[$key]) -> Vec<bool> {
            let indices = self.indices.read().expect("cache lock poisoned");
            peek_presence(&indices.$field, keys)
        }

        pub fn $commit(&self, keys: &[$key], mask: &[bool]) {
            let mut indices = self.indices.write().expect("cache lock poisoned");
            commit_presence(&mut indices.$field, keys, mask);
        }

        pub fn $warm(&self, keys: impl IntoIterator<Item = $key>) {
            let mut indices = self.indices.write().expect("cache lock poisoned");
            indices.$field.extend(keys);
        }
    };
}

macro_rules! versioned_ops {
    ($decide:ident, $peek:ident, $commit:ident, $warm:ident, $field:ident, $key:ty) => {
        pub fn $decide(&self, pairs: &[($key, f64)]) -> HashMap<$key, bool> {
            let mut indices = self.indices.write().expect("cache lock poisoned");
            decide_versioned(&mut indices.$field, pairs)
        }

        pub fn $peek(&self, pairs: &[($key, f64)]) -> HashMap<$key, bool> {
            let indices = self.indices.read().expect("cache lock poisoned");
            peek_versioned(&indices.$field, pairs)
        }

        pub fn $commit(&self, pairs: &[($key, f64)], decisions: &HashMap<$key, bool>) {
            let mut indices = self.indices.write().expect("cache lock poisoned");
            commit_versioned(&mut indices.$field, pairs, decisions);
        }

        pub fn $warm(&self, pairs: impl IntoIterator<Item = ($key, f64)>) {
            let mut indices = self.indices.write().expect("cache lock poisoned");
            indices.$field.extend(pairs);
        }
    };
}

macro_rules! grouped_ops {
    ($decide:ident, $peek:ident, $commit:ident, $warm:ident, $field:ident, $key:ty) => {
        pub fn $decide(&self, parents: &[$key]) -> HashMap<$key, bool> {
            let mut indices = self.indices.write().expect("cache lock poisoned");
            decide_grouped(&mut indices.$field, parents)
        }

        pub fn $peek(&self, parents: &[$key]) -> HashMap<$key, bool> {
            let indices = self.indices.read().expect("cache lock poisoned");
            peek_grouped(&indices.$field, parents)
        }

        pub fn $commit(&self, parents: &[$key], decisions: &HashMap<$key, bool>) {
            let mut indices = self.indices.write().expect("cache lock poisoned");
            commit_grouped(&mut indices.$field, parents, decisions);
        }

        pub fn $warm(&self, parents: impl IntoIterator<Item = $key>) {
            let mut indices = self.indices.write().expect("cache lock poisoned");
            indices.$field.extend(parents);
        }
    };
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of cached keys across every index.
    pub fn len(&self) -> usize {
        let indices = self.indices.read().expect("cache lock poisoned");
        indices.pipelines.len()
            + indices.merge_requests.len()
            + indices.merge_request_note_events.len()
            + indices.projects.len()
            + indices.jobs.len()
            + indices.bridges.len()
            + indices.test_reports.len()
            + indices.test_suites.len()
            + indices.trace_spans.len()
            + indices.coverage_reports.len()
            + indices.deployments.len()
            + indices.sections_by_job.len()
            + indices.test_cases_by_suite.len()
            + indices.metrics_by_job.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    versioned_ops!(
        decide_pipelines,
        peek_pipelines,
        commit_pipelines,
        warm_pipelines,
        pipelines,
        i64
    );
    versioned_ops!(
        decide_merge_requests,
        peek_merge_requests,
        commit_merge_requests,
        warm_merge_requests,
        merge_requests,
        i64
    );
    versioned_ops!(
        decide_merge_request_note_events,
        peek_merge_request_note_events,
        commit_merge_request_note_events,
        warm_merge_request_note_events,
        merge_request_note_events,
        i64
    );
    versioned_ops!(
        decide_projects,
        peek_projects,
        commit_projects,
        warm_projects,
        projects,
        i64
    );

    presence_ops!(decide_jobs, peek_jobs, commit_jobs, warm_jobs, jobs, i64);
    presence_ops!(
        decide_bridges,
        peek_bridges,
        commit_bridges,
        warm_bridges,
        bridges,
        i64
    );
    presence_ops!(
        decide_test_reports,
        peek_test_reports,
        commit_test_reports,
        warm_test_reports,
        test_reports,
        String
    );
    presence_ops!(
        decide_test_suites,
        peek_test_suites,
        commit_test_suites,
        warm_test_suites,
        test_suites,
        String
    );
    presence_ops!(
        decide_trace_spans,
        peek_trace_spans,
        commit_trace_spans,
        warm_trace_spans,
        trace_spans,
        SpanKey
    );
    presence_ops!(
        decide_coverage_reports,
        peek_coverage_reports,
        commit_coverage_reports,
        warm_coverage_reports,
        coverage_reports,
        String
    );
    presence_ops!(
        decide_deployments,
        peek_deployments,
        commit_deployments,
        warm_deployments,
        deployments,
        i64
    );

    grouped_ops!(
        decide_sections,
        peek_sections,
        commit_sections,
        warm_sections,
        sections_by_job,
        i64
    );
    grouped_ops!(
        decide_test_cases,
        peek_test_cases,
        commit_test_cases,
        warm_test_cases,
        test_cases_by_suite,
        String
    );
    grouped_ops!(
        decide_metrics,
        peek_metrics,
        commit_metrics,
        warm_metrics,
        metrics_by_job,
        i64
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipelines_are_versioned_by_updated_at() {
        let cache = DedupCache::new();

        let pairs = vec![
            (1053344116, 1698520756.0),
            (1053349645, 1698521748.0),
            (1190130970, 1708897133.0),
        ];
        let decisions = cache.decide_pipelines(&pairs);
        assert!(decisions.values().all(|new| *new));

        // Unchanged timestamps are not new.
        let decisions = cache.decide_pipelines(&pairs);
        assert!(decisions.values().all(|new| !*new));

        // A strictly greater timestamp wins and replaces the cached value.
        let pairs = vec![(1190130970, 1709539234.0)];
        let decisions = cache.decide_pipelines(&pairs);
        assert_eq!(decisions[&1190130970], true);

        // An older timestamp does not reopen the entry.
        let pairs = vec![(1190130970, 1708897133.0)];
        let decisions = cache.decide_pipelines(&pairs);
        assert_eq!(decisions[&1190130970], false);
    }

    #[test]
    fn presence_is_idempotent() {
        let cache = DedupCache::new();
        let keys = vec![1, 2, 3];

        assert_eq!(cache.decide_jobs(&keys), vec![true, true, true]);
        assert_eq!(cache.decide_jobs(&keys), vec![false, false, false]);
    }

    #[test]
    fn presence_dedupes_within_one_batch() {
        let cache = DedupCache::new();
        assert_eq!(cache.decide_jobs(&[7, 7, 8]), vec![true, false, true]);
    }

    #[test]
    fn grouped_decisions_coarsen_to_the_parent() {
        let cache = DedupCache::new();

        let parents = vec![6252785467, 6252785469, 6252785470, 6252785472];
        let decisions = cache.decide_sections(&parents);
        assert!(parents.iter().all(|p| decisions[p]));

        let parents = vec![
            6252785467, 6252785469, 6252785470, 6252785472, 6308490339,
        ];
        let decisions = cache.decide_sections(&parents);
        assert_eq!(decisions[&6252785467], false);
        assert_eq!(decisions[&6252785469], false);
        assert_eq!(decisions[&6252785470], false);
        assert_eq!(decisions[&6252785472], false);
        assert_eq!(decisions[&6308490339], true);
    }

    #[test]
    fn peek_does_not_mutate_until_commit() {
        let cache = DedupCache::new();
        let keys = vec![10, 11];

        let mask = cache.peek_jobs(&keys);
        assert_eq!(mask, vec![true, true]);
        // Nothing committed yet, so a second peek sees the same state.
        assert_eq!(cache.peek_jobs(&keys), vec![true, true]);

        cache.commit_jobs(&keys, &mask);
        assert_eq!(cache.peek_jobs(&keys), vec![false, false]);
        assert_eq!(cache.decide_jobs(&[10, 12]), vec![false, true]);
    }

    #[test]
    fn peek_handles_in_batch_repeats() {
        let cache = DedupCache::new();
        assert_eq!(cache.peek_jobs(&[5, 5]), vec![true, false]);

        let pairs = vec![(1, 100.0), (1, 90.0), (1, 120.0)];
        let decisions = cache.peek_pipelines(&pairs);
        // 120.0 supersedes 100.0 within the same batch.
        assert_eq!(decisions[&1], true);
    }

    #[test]
    fn versioned_commit_keeps_the_largest_version() {
        let cache = DedupCache::new();
        let pairs = vec![(42, 100.0), (42, 120.0)];
        let decisions = cache.peek_pipelines(&pairs);
        cache.commit_pipelines(&pairs, &decisions);

        assert_eq!(cache.decide_pipelines(&[(42, 110.0)])[&42], false);
        assert_eq!(cache.decide_pipelines(&[(42, 130.0)])[&42], true);
    }

    #[test]
    fn note_events_are_versioned_by_updated_at() {
        let cache = DedupCache::new();

        let pairs = vec![(900, 1708897133.0)];
        assert_eq!(cache.decide_merge_request_note_events(&pairs)[&900], true);
        assert_eq!(cache.decide_merge_request_note_events(&pairs)[&900], false);

        // Resolution bumps updated_at, which reopens the entry.
        let pairs = vec![(900, 1709539234.0)];
        assert_eq!(cache.decide_merge_request_note_events(&pairs)[&900], true);
    }

    #[test]
    fn len_counts_every_index() {
        let cache = DedupCache::new();
        assert!(cache.is_empty());

        cache.decide_jobs(&[1]);
        cache.decide_pipelines(&[(2, 1.0)]);
        cache.decide_sections(&[3]);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn warm_up_reproduces_prior_decisions() {
        let cache = DedupCache::new();
        cache.decide_test_reports(&["a".to_string(), "b".to_string()]);

        // A fresh cache hydrated from a store scan must answer like the
        // original one for every persisted identifier.
        let restarted = DedupCache::new();
        restarted.warm_test_reports(["a".to_string(), "b".to_string()]);
        assert_eq!(
            restarted.decide_test_reports(&["a".to_string(), "c".to_string()]),
            vec![false, true]
        );
    }
}
