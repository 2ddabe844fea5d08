//! Domain types shared by every module: tree jobs, filter sets, repo status,
//! manifest records, and the terminal result record.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds).
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with `deserialize_duration`.
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// One registry endpoint the engine talks to (source or destination).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    /// Human-readable identifier, used in checkpoint records and logs.
    pub id: String,
    /// Endpoint URL, e.g. `https://registry-1.docker.io`.
    pub endpoint: String,
    /// How the client authenticates against this endpoint.
    #[serde(default)]
    pub auth: AuthMode,
    /// Skip TLS certificate verification. Off by default; only meant for
    /// talking to registries behind an internal CA during testing.
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub connect_timeout: Duration,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_attempts() -> u32 {
    5
}

/// Authentication mode for a registry endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
    Token {
        token: String,
    },
    Oauth {
        token_url: String,
        client_id: String,
        client_secret: String,
    },
    /// A named provider-specific handshake (ECR STS, GCR metadata, ...),
    /// resolved by a collaborator outside this crate; the engine only
    /// carries the name through to the adapter that understands it.
    Provider {
        name: String,
    },
}

/// An ordered set of glob patterns compiled once per tree job. See
/// [`crate::filter::FilterEngine`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSet {
    #[serde(default)]
    pub exclude_repositories: Vec<String>,
    #[serde(default)]
    pub exclude_tags: Vec<String>,
    #[serde(default)]
    pub include_tags: Vec<String>,
}

/// Per-invocation and per-job parameters for one tree replication run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeJobSpec {
    pub source_registry: Registry,
    pub dest_registry: Registry,
    #[serde(default)]
    pub source_prefix: String,
    #[serde(default)]
    pub dest_prefix: String,
    #[serde(default)]
    pub force_overwrite: bool,
    #[serde(default)]
    pub resume_from: Option<String>,
    #[serde(default)]
    pub skip_completed: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_max_concurrent_blobs")]
    pub max_concurrent_blobs: usize,
    #[serde(default)]
    pub filters: FilterSet,
}

pub(crate) fn default_worker_count() -> usize {
    4
}

pub(crate) fn default_max_concurrent_blobs() -> usize {
    4
}

/// Terminal states for a tree job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeStatus {
    InProgress,
    Completed,
    Failed,
    Interrupted,
}

/// Terminal states for one repository within a tree job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// Per-repository progress and terminal outcome, keyed by source-repo name
/// in [`TreeRecord::repos`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoStatus {
    pub source_repo: String,
    pub dest_repo: String,
    pub state: RepoState,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Number of tags that ended in a failed outcome for this repo. Kept
    /// alongside `state` so a resume can distinguish "completed, all tags
    /// ok" from "completed (terminal), but some tags failed" and decide
    /// whether to retry on resume.
    #[serde(default)]
    pub failed_tag_count: u64,
    #[serde(default)]
    pub replicated: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub failed: u64,
}

impl RepoStatus {
    pub fn new(source_repo: String, dest_repo: String) -> Self {
        Self {
            source_repo,
            dest_repo,
            state: RepoState::Pending,
            last_error: None,
            failed_tag_count: 0,
            replicated: 0,
            skipped: 0,
            failed: 0,
        }
    }

    /// A repo that is terminally `failed` (not merely "completed with some
    /// failed tags") should still be eligible for a retry on resume even
    /// under skip-completed.
    pub fn is_short_circuitable(&self) -> bool {
        matches!(self.state, RepoState::Completed | RepoState::Skipped)
    }
}

/// One {source-tag, dest-tag} pairing being copied by the worker. Ephemeral:
/// it never crosses the checkpoint boundary.
#[derive(Debug, Clone)]
pub struct TagPlan {
    pub source_tag: String,
    pub dest_tag: String,
}

/// A descriptor referencing a child manifest (image index case) or a blob
/// (image manifest case).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    pub digest: String,
    pub media_type: String,
    pub size: u64,
    #[serde(default)]
    pub platform: Option<String>,
}

/// A fetched manifest or index, with its raw bytes retained for byte-for-byte
/// re-upload.
#[derive(Debug, Clone)]
pub struct ManifestRecord {
    pub media_type: String,
    pub schema_version: u32,
    pub raw: Vec<u8>,
    pub digest: String,
    /// Non-empty only for an image index / manifest list.
    pub manifest_refs: Vec<Descriptor>,
    /// Config + layer blobs; empty for an index.
    pub blob_refs: Vec<Descriptor>,
}

impl ManifestRecord {
    pub fn is_index(&self) -> bool {
        !self.manifest_refs.is_empty()
    }
}

/// Outcome of copying one tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TagOutcome {
    Replicated {
        bytes: u64,
        duration_ms: u64,
        layer_count: u64,
    },
    Skipped,
    Failed {
        kind: FailureKind,
        message: String,
    },
}

/// Classification used to decide propagation policy (§7 of the design doc).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientTransport,
    NotFound,
    AuthPermission,
    InvalidCredentialConfig,
    DigestMismatch,
    Cancelled,
}

/// The full durable record for one tree job, as stored by the checkpoint
/// store and reported back as the terminal result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeRecord {
    pub schema_version: String,
    pub tree_id: String,
    pub source_registry_id: String,
    pub dest_registry_id: String,
    pub source_prefix: String,
    pub dest_prefix: String,
    pub filters: FilterSet,
    pub status: TreeStatus,
    pub progress_percent: f64,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub repos: BTreeMap<String, RepoStatus>,
    #[serde(default)]
    pub resumed_from: Option<String>,
}

pub const CHECKPOINT_SCHEMA_V1: &str = "freightliner.checkpoint.v1";

impl TreeRecord {
    pub fn completed_repos(&self) -> Vec<&str> {
        self.repos
            .values()
            .filter(|r| matches!(r.state, RepoState::Completed))
            .map(|r| r.source_repo.as_str())
            .collect()
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, TreeStatus::InProgress)
    }
}

/// Aggregate counts and terminal flags emitted when a tree job reaches a
/// terminal state. This is the public result type `replicate`/`resume`
/// return to their caller (the CLI, or an embedder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeReplicationResult {
    pub tree_id: String,
    pub repositories: u64,
    pub images_replicated: u64,
    pub images_skipped: u64,
    pub images_failed: u64,
    pub started_at: DateTime<Utc>,
    pub duration: std::time::Duration,
    pub progress_percent: f64,
    pub interrupted: bool,
    pub resumed: bool,
    pub completed_repos: Vec<String>,
}
