//! Per-repository worker (§4.5 of the design doc): lists tags, applies the
//! tag filter, and runs the copier over each surviving tag. Skip-completed
//! short-circuiting happens one level up, in the orchestrator, which
//! decides whether a repository is even enqueued; a dispatched worker
//! always does real work.

use std::sync::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::copier::Copier;
use crate::filter::FilterEngine;
use crate::registry::RegistryClient;
use crate::reporter::Reporter;
use crate::types::{RepoState, RepoStatus, TagOutcome, TagPlan, TreeJobSpec};

/// Shared, thread-safe handles a worker needs to process one repository.
/// Built once by the orchestrator and cloned-by-reference into each worker
/// thread closure.
pub struct WorkerContext<'a> {
    pub source: &'a dyn RegistryClient,
    pub dest: &'a dyn RegistryClient,
    pub filters: &'a FilterEngine,
    pub job: &'a TreeJobSpec,
    pub reporter: &'a Mutex<dyn Reporter>,
    pub cancelled: &'a Arc<AtomicBool>,
    pub replicated: &'a AtomicU64,
    pub skipped: &'a AtomicU64,
    pub failed: &'a AtomicU64,
}

/// Replicate every tag-filter-surviving tag of one repository, mutating
/// `status` in place. The caller owns `status` exclusively for the
/// duration of this call (§3 ownership invariant: "during dispatch, a
/// worker exclusively owns its repo-status slot").
///
/// A short-circuited repo (already `Completed`/`Skipped` under
/// `skip_completed`) leaves `status` untouched and returns immediately; the
/// orchestrator is responsible for excluding it from the run's own
/// counters, since its prior counts already happened on an earlier run.
pub fn replicate_repository(ctx: &WorkerContext, status: &mut RepoStatus) {
    if ctx.job.skip_completed && status.is_short_circuitable() {
        return;
    }

    // A repo resumed from a prior `failed` state is retried from scratch;
    // its stale counts from the earlier attempt would otherwise double up.
    if status.state != RepoState::Pending {
        status.failed_tag_count = 0;
        status.replicated = 0;
        status.skipped = 0;
        status.failed = 0;
        status.last_error = None;
    }

    let tags = match ctx.source.list_tags(&status.source_repo) {
        Ok(tags) => tags,
        Err(err) => {
            status.state = RepoState::Failed;
            status.last_error = Some(format!("{err:#}"));
            ctx.reporter.lock().unwrap().error(&format!(
                "{}: failed to list tags: {err:#}",
                status.source_repo
            ));
            return;
        }
    };

    let surviving: Vec<&String> = tags.iter().filter(|t| ctx.filters.tag_allowed(t)).collect();
    status.state = RepoState::InProgress;

    let copier = Copier::new(
        ctx.source,
        ctx.dest,
        ctx.job.dry_run,
        ctx.job.max_concurrent_blobs,
        ctx.cancelled.clone(),
    );

    for tag in surviving {
        if ctx.cancelled.load(Ordering::SeqCst) {
            // Leave repo-status as in-progress; the orchestrator reports
            // the tree as interrupted rather than completed/failed.
            return;
        }

        let plan = TagPlan {
            source_tag: tag.clone(),
            dest_tag: tag.clone(),
        };

        match copier.copy_tag(
            &status.source_repo,
            &status.dest_repo,
            &plan,
            ctx.job.force_overwrite,
        ) {
            Ok(TagOutcome::Replicated { .. }) => {
                status.replicated += 1;
                ctx.replicated.fetch_add(1, Ordering::SeqCst);
            }
            Ok(TagOutcome::Skipped) => {
                status.skipped += 1;
                ctx.skipped.fetch_add(1, Ordering::SeqCst);
            }
            Ok(TagOutcome::Failed { kind, message }) => {
                status.failed += 1;
                status.failed_tag_count += 1;
                status.last_error = Some(message.clone());
                ctx.failed.fetch_add(1, Ordering::SeqCst);
                ctx.reporter
                    .lock()
                    .unwrap()
                    .warn(&format!("{}:{tag} failed ({kind:?}): {message}", status.source_repo));
            }
            Err(err) => {
                let kind = crate::error::classify(&err);
                status.failed += 1;
                status.failed_tag_count += 1;
                status.last_error = Some(format!("{err:#}"));
                ctx.failed.fetch_add(1, Ordering::SeqCst);
                ctx.reporter.lock().unwrap().warn(&format!(
                    "{}:{tag} failed ({kind:?}): {err:#}",
                    status.source_repo
                ));
            }
        }
    }

    // A repo with no surviving tags at all (every tag excluded, or the
    // repo genuinely empty) completes with zero counts rather than failing.
    status.state = if status.failed_tag_count > 0 && status.replicated == 0 && status.skipped == 0
    {
        RepoState::Failed
    } else {
        RepoState::Completed
    };
}
