//! Composes pattern caches into the repository/tag admission decisions used
//! by the orchestrator and the per-repository worker.

use crate::pattern_cache::PatternCache;
use crate::types::FilterSet;

/// Compiled filter set for one tree job. Immutable once built, so it can be
/// shared across worker threads behind an `Arc`.
#[derive(Debug, Clone)]
pub struct FilterEngine {
    exclude_repos: PatternCache,
    exclude_tags: PatternCache,
    include_tags: PatternCache,
    include_tags_is_empty: bool,
}

impl FilterEngine {
    pub fn new(filters: &FilterSet) -> Self {
        Self {
            exclude_repos: PatternCache::new(filters.exclude_repositories.clone()),
            exclude_tags: PatternCache::new(filters.exclude_tags.clone()),
            include_tags: PatternCache::new(filters.include_tags.clone()),
            include_tags_is_empty: filters.include_tags.is_empty(),
        }
    }

    /// `repositoryAllowed(repo) = ¬excludeRepos.matches(repo)`
    pub fn repository_allowed(&self, repo: &str) -> bool {
        !self.exclude_repos.matches(repo)
    }

    /// `tagAllowed(tag) = ¬excludeTags.matches(tag) ∧ (includeTagsIsEmpty ∨ includeTags.matches(tag))`
    ///
    /// Excludes take precedence over includes.
    pub fn tag_allowed(&self, tag: &str) -> bool {
        if self.exclude_tags.matches(tag) {
            return false;
        }
        self.include_tags_is_empty || self.include_tags.matches(tag)
    }
}
