//! Tree orchestrator (§4.6 of the design doc): derives a tree-id, lists and
//! filters source repositories, computes destination names by prefix
//! substitution, then drains a bounded job channel with a pool of worker
//! threads until every repository has been processed or the run is
//! cancelled.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::checkpoint::CheckpointStore;
use crate::filter::FilterEngine;
use crate::registry::RegistryClient;
use crate::reporter::Reporter;
use crate::types::{
    RepoState, RepoStatus, TreeJobSpec, TreeRecord, TreeReplicationResult, TreeStatus,
    CHECKPOINT_SCHEMA_V1,
};
use crate::worker::{replicate_repository, WorkerContext};

/// Run one tree replication job to a terminal state (completed, failed, or
/// interrupted), flushing checkpoints at every lifecycle edge.
pub fn run_tree(
    source: &dyn RegistryClient,
    dest: &dyn RegistryClient,
    spec: TreeJobSpec,
    checkpoints: &dyn CheckpointStore,
    reporter: &Mutex<dyn Reporter>,
    cancelled: Arc<AtomicBool>,
) -> Result<TreeReplicationResult> {
    let tree_id = derive_tree_id();
    let now = Utc::now();

    let mut record = if let Some(resume_from) = spec.resume_from.as_deref() {
        let prior = checkpoints
            .load(resume_from)?
            .with_context(|| format!("no checkpoint found for resume-from tree-id {resume_from}"))?;
        reporter.lock().unwrap().info(&format!(
            "resuming tree {resume_from} as {tree_id} ({} prior repo entries)",
            prior.repos.len()
        ));
        TreeRecord {
            schema_version: CHECKPOINT_SCHEMA_V1.to_string(),
            tree_id: tree_id.clone(),
            source_registry_id: spec.source_registry.id.clone(),
            dest_registry_id: spec.dest_registry.id.clone(),
            source_prefix: spec.source_prefix.clone(),
            dest_prefix: spec.dest_prefix.clone(),
            filters: spec.filters.clone(),
            status: TreeStatus::InProgress,
            progress_percent: 0.0,
            started_at: now,
            last_updated_at: now,
            last_error: None,
            repos: prior.repos,
            resumed_from: Some(resume_from.to_string()),
        }
    } else {
        TreeRecord {
            schema_version: CHECKPOINT_SCHEMA_V1.to_string(),
            tree_id: tree_id.clone(),
            source_registry_id: spec.source_registry.id.clone(),
            dest_registry_id: spec.dest_registry.id.clone(),
            source_prefix: spec.source_prefix.clone(),
            dest_prefix: spec.dest_prefix.clone(),
            filters: spec.filters.clone(),
            status: TreeStatus::InProgress,
            progress_percent: 0.0,
            started_at: now,
            last_updated_at: now,
            last_error: None,
            repos: BTreeMap::new(),
            resumed_from: None,
        }
    };

    checkpoints.save(&record)?;

    let filters = FilterEngine::new(&spec.filters);

    let source_repos = match source.list_repositories(&spec.source_prefix) {
        Ok(repos) => repos,
        Err(err) => {
            record.status = TreeStatus::Failed;
            record.last_error = Some(format!("{err:#}"));
            record.last_updated_at = Utc::now();
            checkpoints.save(&record)?;
            return Err(err.context("failed to list source repositories"));
        }
    };

    // An adapter's own prefix handling (§4.3's `list repositories | prefix`)
    // is not trusted blindly: a repo that slips through not under
    // `source_prefix` is dropped here too, so `substitute_prefix`'s
    // no-match branch below is never reached for an enqueued repo.
    let jobs: Vec<(String, String)> = source_repos
        .into_iter()
        .filter(|repo| filters.repository_allowed(repo))
        .filter(|repo| spec.source_prefix.is_empty() || repo.starts_with(&spec.source_prefix))
        .map(|source_repo| {
            let dest_repo = substitute_prefix(
                &source_repo,
                &spec.source_prefix,
                &spec.dest_prefix,
                reporter,
            );
            (source_repo, dest_repo)
        })
        .collect();

    for (source_repo, dest_repo) in &jobs {
        record
            .repos
            .entry(source_repo.clone())
            .or_insert_with(|| RepoStatus::new(source_repo.clone(), dest_repo.clone()));
    }
    record.last_updated_at = Utc::now();
    checkpoints.save(&record)?;

    // Repos short-circuited by skip-completed already finished on a prior
    // run; they must not count toward this run's own repositories/progress
    // tally (§8 resume semantics) even though they still occupy a job slot.
    let short_circuit_count = jobs
        .iter()
        .filter(|(source_repo, _)| {
            spec.skip_completed
                && record
                    .repos
                    .get(source_repo)
                    .map(RepoStatus::is_short_circuitable)
                    .unwrap_or(false)
        })
        .count();

    let total = jobs.len();
    let active_total = total - short_circuit_count;
    let record_mutex = Mutex::new(record);
    let replicated_counter = AtomicU64::new(0);
    let skipped_counter = AtomicU64::new(0);
    let failed_counter = AtomicU64::new(0);
    let completed_repos = Mutex::new(Vec::<String>::new());

    let (tx, rx) = mpsc::sync_channel::<(String, String)>(total.max(1));
    let rx = Mutex::new(rx);

    thread::scope(|scope| {
        let worker_count = spec.worker_count.max(1);
        for _ in 0..worker_count {
            scope.spawn(|| loop {
                let job = {
                    let rx = rx.lock().unwrap();
                    rx.recv()
                };
                let (source_repo, dest_repo) = match job {
                    Ok(job) => job,
                    Err(_) => break,
                };

                let mut status = {
                    let record = record_mutex.lock().unwrap();
                    record
                        .repos
                        .get(&source_repo)
                        .cloned()
                        .unwrap_or_else(|| RepoStatus::new(source_repo.clone(), dest_repo.clone()))
                };
                let was_short_circuit = spec.skip_completed && status.is_short_circuitable();

                let ctx = WorkerContext {
                    source,
                    dest,
                    filters: &filters,
                    job: &spec,
                    reporter,
                    cancelled: &cancelled,
                    replicated: &replicated_counter,
                    skipped: &skipped_counter,
                    failed: &failed_counter,
                };
                replicate_repository(&ctx, &mut status);

                let is_completed = status.state == RepoState::Completed;
                {
                    let mut record = record_mutex.lock().unwrap();
                    record.repos.insert(source_repo.clone(), status);
                    record.last_updated_at = Utc::now();
                    if let Err(err) = checkpoints.save(&record) {
                        reporter
                            .lock()
                            .unwrap()
                            .error(&format!("failed to persist checkpoint for {tree_id}: {err:#}"));
                    }
                }
                if is_completed && !was_short_circuit {
                    completed_repos.lock().unwrap().push(dest_repo);
                }
            });
        }

        for job in jobs {
            if tx.send(job).is_err() {
                break;
            }
        }
        drop(tx);
    });

    let mut record = record_mutex.into_inner().unwrap();
    let was_cancelled = cancelled.load(Ordering::SeqCst);
    let completed_repos = completed_repos.into_inner().unwrap();

    record.status = if was_cancelled {
        TreeStatus::Interrupted
    } else {
        TreeStatus::Completed
    };
    record.progress_percent = if active_total == 0 {
        100.0
    } else {
        (completed_repos.len() as f64 / active_total as f64) * 100.0
    };
    record.last_updated_at = Utc::now();
    checkpoints.save(&record)?;

    Ok(TreeReplicationResult {
        tree_id: record.tree_id.clone(),
        repositories: active_total as u64,
        images_replicated: replicated_counter.load(Ordering::SeqCst),
        images_skipped: skipped_counter.load(Ordering::SeqCst),
        images_failed: failed_counter.load(Ordering::SeqCst),
        started_at: record.started_at,
        duration: (record.last_updated_at - record.started_at)
            .to_std()
            .unwrap_or_default(),
        progress_percent: record.progress_percent,
        interrupted: was_cancelled,
        resumed: record.resumed_from.is_some(),
        completed_repos,
    })
}

/// Derive an opaque, unique tree-id from the current time plus a random
/// suffix. Never parsed, only used as a checkpoint-store key.
fn derive_tree_id() -> String {
    format!("{:x}-{:016x}", Utc::now().timestamp_millis(), rand::random::<u64>())
}

/// Replace the first occurrence of `source_prefix` in `repo` with
/// `dest_prefix`. An empty `source_prefix` prepends `dest_prefix` to every
/// repo name; a `repo` that doesn't start with a non-empty `source_prefix`
/// is left unmodified and a warning is surfaced through the reporter.
fn substitute_prefix(
    repo: &str,
    source_prefix: &str,
    dest_prefix: &str,
    reporter: &Mutex<dyn Reporter>,
) -> String {
    if source_prefix.is_empty() {
        if dest_prefix.is_empty() {
            return repo.to_string();
        }
        return format!("{}/{}", dest_prefix.trim_end_matches('/'), repo.trim_start_matches('/'));
    }

    match repo.strip_prefix(source_prefix) {
        Some(rest) => format!("{dest_prefix}{rest}"),
        None => {
            reporter.lock().unwrap().warn(&format!(
                "{repo}: does not start with source prefix {source_prefix:?}; destination name left unmodified"
            ));
            repo.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::checkpoint::FileCheckpointStore;
    use crate::reporter::CollectingReporter;
    use crate::test_support::MockRegistry;
    use crate::types::{AuthMode, Descriptor, FilterSet, ManifestRecord, Registry};

    fn manifest(digest: &str) -> ManifestRecord {
        ManifestRecord {
            media_type: "application/vnd.docker.distribution.manifest.v2+json".to_string(),
            schema_version: 2,
            raw: b"{}".to_vec(),
            digest: digest.to_string(),
            manifest_refs: Vec::new(),
            blob_refs: vec![Descriptor {
                digest: "sha256:cfg".to_string(),
                media_type: "application/vnd.docker.container.image.v1+json".to_string(),
                size: 5,
                platform: None,
            }],
        }
    }

    fn registry(id: &str) -> Registry {
        Registry {
            id: id.to_string(),
            endpoint: format!("http://{id}.invalid"),
            auth: AuthMode::Anonymous,
            insecure_skip_verify: false,
            connect_timeout: std::time::Duration::from_secs(5),
            retry_attempts: 1,
        }
    }

    fn populated_source(repos: &[&str]) -> MockRegistry {
        let source = MockRegistry {
            repositories: repos.iter().map(|r| r.to_string()).collect(),
            ..MockRegistry::default()
        };
        {
            let mut manifests = source.manifests.lock().unwrap();
            let mut blobs = source.blobs.lock().unwrap();
            let mut tags = HashMap::new();
            for repo in repos {
                manifests.insert((repo.to_string(), "latest".to_string()), manifest("sha256:m"));
                blobs.insert((repo.to_string(), "sha256:cfg".to_string()), b"cfg".to_vec());
                tags.insert(repo.to_string(), vec!["latest".to_string()]);
            }
            *source.tags.lock().unwrap() = tags;
        }
        source
    }

    fn job_spec(source_registry: Registry, dest_registry: Registry) -> TreeJobSpec {
        TreeJobSpec {
            source_registry,
            dest_registry,
            source_prefix: String::new(),
            dest_prefix: String::new(),
            force_overwrite: false,
            resume_from: None,
            skip_completed: false,
            dry_run: false,
            worker_count: 2,
            max_concurrent_blobs: 4,
            filters: FilterSet::default(),
        }
    }

    #[test]
    fn substitute_prefix_replaces_first_occurrence_only() {
        let reporter = Mutex::new(CollectingReporter::new());
        let out = substitute_prefix("team-a/svc", "team-a", "team-b", &reporter);
        assert_eq!(out, "team-b/svc");
    }

    #[test]
    fn substitute_prefix_prepends_on_empty_source_prefix() {
        let reporter = Mutex::new(CollectingReporter::new());
        let out = substitute_prefix("svc", "", "mirror", &reporter);
        assert_eq!(out, "mirror/svc");
    }

    #[test]
    fn substitute_prefix_warns_and_leaves_unmodified_on_no_match() {
        // `substitute_prefix` itself stays permissive for any direct caller,
        // but `run_tree` never hands it a repo outside `source_prefix` (see
        // `source_prefix_excludes_non_matching_repositories` below): every
        // enqueued repo has already been filtered to start with it.
        let reporter = Mutex::new(CollectingReporter::new());
        let out = substitute_prefix("other/svc", "team-a", "team-b", &reporter);
        assert_eq!(out, "other/svc");
        assert_eq!(reporter.lock().unwrap().warn.len(), 1);
    }

    #[test]
    fn source_prefix_excludes_non_matching_repositories() {
        // S2: project-b/service-3 sits outside source-prefix project-a and
        // must never be enqueued, let alone copied to the destination.
        let source = populated_source(&["project-a/service-1", "project-a/service-2", "project-b/service-3"]);
        let dest = MockRegistry::default();
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = FileCheckpointStore::new(dir.path());
        let reporter = Mutex::new(CollectingReporter::new());
        let cancelled = Arc::new(AtomicBool::new(false));

        let mut spec = job_spec(registry("src"), registry("dst"));
        spec.source_prefix = "project-a".to_string();
        spec.dest_prefix = "mirror/project-a".to_string();

        let result = run_tree(&source, &dest, spec, &checkpoints, &reporter, cancelled).unwrap();

        assert_eq!(result.repositories, 2);
        assert!(result.completed_repos.contains(&"mirror/project-a/service-1".to_string()));
        assert!(result.completed_repos.contains(&"mirror/project-a/service-2".to_string()));
        assert!(dest.get_manifest("project-b/service-3", "latest").is_err());
        assert_eq!(reporter.lock().unwrap().warn.len(), 0);
    }

    #[test]
    fn replicates_every_repository_and_completes() {
        let source = populated_source(&["repo-a", "repo-b", "repo-c"]);
        let dest = MockRegistry::default();
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = FileCheckpointStore::new(dir.path());
        let reporter = Mutex::new(CollectingReporter::new());
        let cancelled = Arc::new(AtomicBool::new(false));

        let spec = job_spec(registry("src"), registry("dst"));
        let result = run_tree(&source, &dest, spec, &checkpoints, &reporter, cancelled).unwrap();

        assert_eq!(result.repositories, 3);
        assert_eq!(result.images_replicated, 3);
        assert_eq!(result.images_failed, 0);
        assert!(!result.interrupted);
        assert_eq!(result.completed_repos.len(), 3);

        let record = checkpoints.load(&result.tree_id).unwrap().unwrap();
        assert_eq!(record.status, TreeStatus::Completed);
        assert_eq!(record.progress_percent, 100.0);
    }

    #[test]
    fn excluded_repos_are_never_enqueued() {
        let source = populated_source(&["repo-a", "skip-me"]);
        let dest = MockRegistry::default();
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = FileCheckpointStore::new(dir.path());
        let reporter = Mutex::new(CollectingReporter::new());
        let cancelled = Arc::new(AtomicBool::new(false));

        let mut spec = job_spec(registry("src"), registry("dst"));
        spec.filters.exclude_repositories = vec!["skip-*".to_string()];
        let result = run_tree(&source, &dest, spec, &checkpoints, &reporter, cancelled).unwrap();

        assert_eq!(result.repositories, 1);
        assert!(dest.get_manifest("skip-me", "latest").is_err());
    }

    #[test]
    fn cancelled_run_is_reported_as_interrupted() {
        let source = populated_source(&["repo-a", "repo-b"]);
        let dest = MockRegistry::default();
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = FileCheckpointStore::new(dir.path());
        let reporter = Mutex::new(CollectingReporter::new());
        let cancelled = Arc::new(AtomicBool::new(true));

        let spec = job_spec(registry("src"), registry("dst"));
        let result = run_tree(&source, &dest, spec, &checkpoints, &reporter, cancelled).unwrap();

        assert!(result.interrupted);
        let record = checkpoints.load(&result.tree_id).unwrap().unwrap();
        assert_eq!(record.status, TreeStatus::Interrupted);
    }

    #[test]
    fn listing_repositories_failure_fails_the_tree() {
        struct AlwaysFailsListRepos;
        impl RegistryClient for AlwaysFailsListRepos {
            fn list_repositories(&self, _prefix: &str) -> Result<Vec<String>> {
                anyhow::bail!(crate::error::RegistryError::TransientTransport(
                    "connection refused".into()
                ))
            }
            fn list_tags(&self, _repo: &str) -> Result<Vec<String>> {
                unreachable!()
            }
            fn get_manifest(&self, _repo: &str, _r: &str) -> Result<ManifestRecord> {
                unreachable!()
            }
            fn put_manifest(&self, _repo: &str, _r: &str, _m: &ManifestRecord) -> Result<()> {
                unreachable!()
            }
            fn blob_exists(&self, _repo: &str, _d: &str) -> Result<bool> {
                unreachable!()
            }
            fn get_blob(&self, _repo: &str, _d: &str) -> Result<Box<dyn std::io::Read + Send>> {
                unreachable!()
            }
            fn put_blob(
                &self,
                _repo: &str,
                _d: &str,
                _size: u64,
                _reader: Box<dyn std::io::Read + Send>,
            ) -> Result<()> {
                unreachable!()
            }
        }

        let source = AlwaysFailsListRepos;
        let dest = MockRegistry::default();
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = FileCheckpointStore::new(dir.path());
        let reporter = Mutex::new(CollectingReporter::new());
        let cancelled = Arc::new(AtomicBool::new(false));

        let spec = job_spec(registry("src"), registry("dst"));
        let err = run_tree(&source, &dest, spec, &checkpoints, &reporter, cancelled).unwrap_err();
        assert!(format!("{err:#}").contains("failed to list source repositories"));
    }

    #[test]
    fn resume_with_skip_completed_does_not_recopy_completed_repos() {
        let source = populated_source(&["repo-a", "repo-b"]);
        let dest = MockRegistry::default();
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = FileCheckpointStore::new(dir.path());
        let reporter = Mutex::new(CollectingReporter::new());
        let cancelled = Arc::new(AtomicBool::new(false));

        let spec = job_spec(registry("src"), registry("dst"));
        let first = run_tree(&source, &dest, spec.clone(), &checkpoints, &reporter, cancelled.clone()).unwrap();

        // Simulate a fresh source client that would panic if asked to list
        // tags for the already-completed repos, proving skip-completed
        // really short-circuits instead of just happening to succeed twice.
        struct PanicsOnListTags(MockRegistry);
        impl RegistryClient for PanicsOnListTags {
            fn list_repositories(&self, prefix: &str) -> Result<Vec<String>> {
                self.0.list_repositories(prefix)
            }
            fn list_tags(&self, _repo: &str) -> Result<Vec<String>> {
                panic!("skip-completed repo must not list tags again");
            }
            fn get_manifest(&self, repo: &str, r: &str) -> Result<ManifestRecord> {
                self.0.get_manifest(repo, r)
            }
            fn put_manifest(&self, repo: &str, r: &str, m: &ManifestRecord) -> Result<()> {
                self.0.put_manifest(repo, r, m)
            }
            fn blob_exists(&self, repo: &str, d: &str) -> Result<bool> {
                self.0.blob_exists(repo, d)
            }
            fn get_blob(&self, repo: &str, d: &str) -> Result<Box<dyn std::io::Read + Send>> {
                self.0.get_blob(repo, d)
            }
            fn put_blob(&self, repo: &str, d: &str, size: u64, reader: Box<dyn std::io::Read + Send>) -> Result<()> {
                self.0.put_blob(repo, d, size, reader)
            }
        }

        let resumed_source = PanicsOnListTags(populated_source(&["repo-a", "repo-b"]));
        let mut resume_spec = job_spec(registry("src"), registry("dst"));
        resume_spec.skip_completed = true;
        resume_spec.resume_from = Some(first.tree_id.clone());

        let second = run_tree(
            &resumed_source,
            &dest,
            resume_spec,
            &checkpoints,
            &reporter,
            cancelled,
        )
        .unwrap();

        // Both repos were already completed on the first run; a
        // skip-completed resume that re-lists nothing new should report
        // zero new work, not the totals from the run that already happened.
        assert_eq!(second.images_replicated, 0);
        assert_eq!(second.repositories, 0);
    }

    #[test]
    fn resume_counts_exclude_already_completed_repo_work() {
        let dest = MockRegistry::default();
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = FileCheckpointStore::new(dir.path());
        let reporter = Mutex::new(CollectingReporter::new());
        let cancelled = Arc::new(AtomicBool::new(false));

        let tree_id = "prior-tree".to_string();
        let mut repos = BTreeMap::new();
        let mut repo_a = RepoStatus::new("repo-a".to_string(), "repo-a".to_string());
        repo_a.state = RepoState::Completed;
        repo_a.replicated = 3;
        repos.insert("repo-a".to_string(), repo_a);
        let prior = TreeRecord {
            schema_version: CHECKPOINT_SCHEMA_V1.to_string(),
            tree_id: tree_id.clone(),
            source_registry_id: "src".to_string(),
            dest_registry_id: "dst".to_string(),
            source_prefix: String::new(),
            dest_prefix: String::new(),
            filters: FilterSet::default(),
            status: TreeStatus::Interrupted,
            progress_percent: 0.0,
            started_at: Utc::now(),
            last_updated_at: Utc::now(),
            last_error: None,
            repos,
            resumed_from: None,
        };
        checkpoints.save(&prior).unwrap();

        let source = populated_source(&["repo-a", "repo-b", "repo-c"]);
        let mut spec = job_spec(registry("src"), registry("dst"));
        spec.skip_completed = true;
        spec.resume_from = Some(tree_id);

        let result = run_tree(&source, &dest, spec, &checkpoints, &reporter, cancelled).unwrap();

        // repo-a was already completed before the resume; only repo-b and
        // repo-c (one tag each in `populated_source`) are this run's work.
        assert_eq!(result.repositories, 2);
        assert_eq!(result.images_replicated, 2);
    }
}
