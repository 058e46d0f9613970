// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Reconciliation of one lifecycle event across every bucket of a mesh.
//!
//! A run moves through `Pending -> Computing -> Applying` and ends in
//! `Succeeded`, `PartiallyFailed` or `Failed`. Versioning is checked on every
//! member that will hold mesh rules before any replication document is
//! written, since a rule is refused unless both ends are versioned. Each
//! bucket then runs its own sequential pipeline (read, diff, apply) on a
//! bounded pool of tasks.
//!
//! ```text
//!  request ──► plan ──► preflight ──► member / removed jobs ──► orphan jobs
//!                          │                          │
//!                          ▼                          ▼
//!                   ┌──────────────┐          ┌──────────────┐
//!                   │ bucket tasks │   ...    │ bucket tasks │
//!                   └──────────────┘          └──────────────┘
//!                          └───────────┬──────────────┘
//!                                      ▼
//!                              ReconcileOutcome
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use mesh_core::{BucketRef, MeshSpec, ReconcilerConfig, ReplicationRule, RetryConfig, SpecError};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::applier::{ApplyOutcome, BucketApplier};
use crate::backend::{BackendOp, MeshBackend};
use crate::compiler::RuleCompiler;
use crate::differ::{ChangeList, Differ};
use crate::error::{BucketFailure, MeshError};
use crate::preflight::{PreflightChecker, PreflightStatus};
use crate::reader::{LiveRead, LiveStateReader};
use crate::retry::with_retry;

/// Lifecycle event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileMode {
    /// The mesh is new.
    Create,
    /// The mesh declaration changed.
    Update,
    /// The mesh is going away.
    Delete,
}

impl ReconcileMode {
    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ReconcileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileRequest {
    /// Converge every bucket of a new mesh.
    Create {
        /// The declared mesh.
        spec: MeshSpec,
    },
    /// Converge the new declaration and clean up buckets that left.
    Update {
        /// The new declaration.
        spec: MeshSpec,
        /// The previous declaration, when the caller has it.
        previous: Option<MeshSpec>,
        /// The physical id reported for the previous declaration.
        previous_physical_id: Option<String>,
    },
    /// Strip mesh rules from every bucket of the last known declaration.
    Delete {
        /// The last known declaration.
        spec: MeshSpec,
    },
}

impl ReconcileRequest {
    /// Returns the lifecycle event kind.
    pub fn mode(&self) -> ReconcileMode {
        match self {
            Self::Create { .. } => ReconcileMode::Create,
            Self::Update { .. } => ReconcileMode::Update,
            Self::Delete { .. } => ReconcileMode::Delete,
        }
    }

    /// Returns the declaration the request carries.
    pub fn spec(&self) -> &MeshSpec {
        match self {
            Self::Create { spec } | Self::Update { spec, .. } | Self::Delete { spec } => spec,
        }
    }
}

/// State of a reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconcileState {
    /// Not started.
    Pending,
    /// Validating and compiling the declaration.
    Computing,
    /// Running bucket pipelines.
    Applying,
    /// Every bucket converged.
    Succeeded,
    /// Some buckets did not converge. Safe to retry.
    PartiallyFailed,
    /// The run was rejected before any backend call.
    Failed,
}

impl ReconcileState {
    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Computing => "computing",
            Self::Applying => "applying",
            Self::Succeeded => "succeeded",
            Self::PartiallyFailed => "partially_failed",
            Self::Failed => "failed",
        }
    }

    /// Returns true for end states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::PartiallyFailed | Self::Failed)
    }
}

/// Why a bucket took part in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketRole {
    /// Declared in the request.
    Member,
    /// Declared in the previous spec only.
    Removed,
    /// Found through a stale mesh rule on a member.
    Orphan,
}

/// Terminal status of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum BucketStatus {
    /// The bucket document was rewritten or deleted.
    Applied {
        /// Rules added.
        added: usize,
        /// Rules removed.
        removed: usize,
        /// Rules replaced.
        replaced: usize,
    },
    /// Already converged.
    Unchanged,
    /// The bucket no longer exists; nothing to clean up.
    Gone,
    /// Dry run: changes that would be applied.
    Planned {
        /// The planned changes.
        changes: ChangeList,
    },
    /// Not processed because the run was cancelled.
    NotApplied,
    /// The pipeline failed.
    Failed {
        /// What went wrong.
        failure: BucketFailure,
    },
}

impl BucketStatus {
    /// Returns true if the bucket needs no further work.
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::NotApplied | Self::Failed { .. })
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Unchanged => "unchanged",
            Self::Gone => "gone",
            Self::Planned { .. } => "planned",
            Self::NotApplied => "not_applied",
            Self::Failed { .. } => "failed",
        }
    }

    fn from_error(err: MeshError) -> Self {
        match err.to_failure() {
            Some(failure) => Self::Failed { failure },
            None => Self::Failed {
                failure: BucketFailure {
                    bucket: String::new(),
                    kind: crate::error::FailureKind::Internal,
                    reason: err.to_string(),
                },
            },
        }
    }
}

impl From<ApplyOutcome> for BucketStatus {
    fn from(outcome: ApplyOutcome) -> Self {
        match outcome {
            ApplyOutcome::Applied { added, removed, replaced } => {
                Self::Applied { added, removed, replaced }
            }
            ApplyOutcome::Unchanged => Self::Unchanged,
            ApplyOutcome::Planned(changes) => Self::Planned { changes },
        }
    }
}

/// Per-bucket report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketReport {
    /// The bucket.
    pub bucket: BucketRef,
    /// Why it took part.
    pub role: BucketRole,
    /// Versioning check result, when the check ran and passed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preflight: Option<PreflightStatus>,
    /// Terminal status.
    #[serde(flatten)]
    pub status: BucketStatus,
}

/// Result of a reconciliation run.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// Lifecycle event kind.
    pub mode: ReconcileMode,
    /// Terminal state.
    pub state: ReconcileState,
    /// Every state the run went through, in order.
    pub transitions: Vec<ReconcileState>,
    /// Physical identity of the declared mesh.
    pub physical_id: Option<String>,
    /// Physical identity of the previous declaration, on update.
    pub previous_physical_id: Option<String>,
    /// True when the physical identity changed, meaning the caller must
    /// treat the resource as replaced.
    pub replaced: bool,
    /// Per-bucket reports: members in name order, then removed buckets,
    /// then orphans.
    pub buckets: Vec<BucketReport>,
    /// Why the declaration was rejected, for `Failed` runs.
    pub spec_error: Option<SpecError>,
    /// True if cancellation was requested during the run.
    pub cancelled: bool,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
}

impl ReconcileOutcome {
    fn new(mode: ReconcileMode) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            mode,
            state: ReconcileState::Pending,
            transitions: vec![ReconcileState::Pending],
            physical_id: None,
            previous_physical_id: None,
            replaced: false,
            buckets: Vec::new(),
            spec_error: None,
            cancelled: false,
            started_at: now,
            finished_at: now,
        }
    }

    fn transition(&mut self, state: ReconcileState) {
        debug!(run_id = %self.run_id, from = self.state.as_str(), to = state.as_str(), "Run state change");
        self.state = state;
        self.transitions.push(state);
    }

    /// Returns true if every bucket converged.
    pub fn is_success(&self) -> bool {
        self.state == ReconcileState::Succeeded
    }

    /// Report for the bucket named `name`.
    pub fn report(&self, name: &str) -> Option<&BucketReport> {
        self.buckets.iter().find(|r| r.bucket.name == name)
    }

    /// Buckets that did not converge, including ones skipped by cancellation.
    pub fn failures(&self) -> Vec<BucketFailure> {
        self.buckets
            .iter()
            .filter_map(|report| match &report.status {
                BucketStatus::Failed { failure } => Some(failure.clone()),
                BucketStatus::NotApplied => {
                    MeshError::Cancelled { bucket: report.bucket.name.clone() }.to_failure()
                }
                _ => None,
            })
            .collect()
    }

    /// The run's error, if it did not succeed.
    pub fn error(&self) -> Option<MeshError> {
        if let Some(err) = &self.spec_error {
            return Some(MeshError::InvalidSpec(err.clone()));
        }
        let failures = self.failures();
        if failures.is_empty() {
            None
        } else {
            Some(MeshError::PartialMeshFailure { total: self.buckets.len(), failures })
        }
    }
}

/// What a bucket job must achieve.
#[derive(Debug, Clone)]
enum JobKind {
    /// Hold exactly these mesh rules.
    Converge(Vec<ReplicationRule>),
    /// Hold no mesh rules.
    Cleanup,
    /// Drop mesh rules pointing at these buckets, keep the rest.
    Detach(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Job {
    bucket: BucketRef,
    role: BucketRole,
    kind: JobKind,
}

struct JobResult {
    report: BucketReport,
    /// Live mesh destinations that the job's desired rules do not cover.
    stale_destinations: Vec<String>,
}

impl JobResult {
    fn with_status(job: &Job, status: BucketStatus) -> Self {
        Self {
            report: BucketReport {
                bucket: job.bucket.clone(),
                role: job.role,
                preflight: None,
                status,
            },
            stale_destinations: Vec::new(),
        }
    }
}

/// A validated, compiled request.
struct Plan {
    identity_arn: String,
    jobs: Vec<Job>,
    physical_id: String,
    previous_physical_id: Option<String>,
    /// Every bucket name the plan already covers.
    known: BTreeSet<String>,
}

/// Preflight results of a run, by bucket name.
type Readiness = HashMap<String, Result<PreflightStatus, MeshError>>;

/// One bucket's sequential pipeline.
#[derive(Clone)]
struct BucketPipeline {
    reader: LiveStateReader,
    preflight: PreflightChecker,
    applier: BucketApplier,
    identity_arn: Arc<str>,
    readiness: Arc<Readiness>,
}

impl BucketPipeline {
    async fn run(&self, job: &Job) -> JobResult {
        let mut result = JobResult::with_status(job, BucketStatus::Unchanged);
        let status = match &job.kind {
            JobKind::Converge(desired) => self.converge(job, desired, &mut result).await,
            JobKind::Cleanup | JobKind::Detach(_) => self.cleanup(job).await,
        };

        result.report.status = match status {
            Ok(status) => status,
            Err(e) => {
                warn!(bucket = %job.bucket.name, role = ?job.role, error = %e, "Bucket pipeline failed");
                BucketStatus::from_error(e)
            }
        };
        counter!("mesh_bucket_pipeline_total", "outcome" => result.report.status.label()).increment(1);
        result
    }

    async fn converge(
        &self,
        job: &Job,
        desired: &[ReplicationRule],
        result: &mut JobResult,
    ) -> Result<BucketStatus, MeshError> {
        let bucket = &job.bucket;
        if !desired.is_empty() {
            let status = match self.readiness.get(&bucket.name) {
                Some(checked) => checked.clone()?,
                None => self.preflight.ensure(bucket).await?,
            };
            result.report.preflight = Some(status);

            let blocked = desired.iter().find_map(|rule| match self.readiness.get(&rule.destination) {
                Some(Err(e)) => Some((&rule.destination, e)),
                _ => None,
            });
            if let Some((destination, e)) = blocked {
                return Err(MeshError::PreconditionUnmet {
                    bucket: bucket.name.clone(),
                    reason: format!("destination {destination} cannot receive replicas: {e}"),
                });
            }
        }

        let live = match self.reader.read(bucket).await {
            Ok(LiveRead::Found(live)) => live,
            Ok(LiveRead::NotFound) => {
                return Err(MeshError::BucketNotFound { bucket: bucket.name.clone() })
            }
            Err(e) => return Err(MeshError::from_backend(&bucket.name, e)),
        };
        result.stale_destinations = live
            .mesh_destinations()
            .filter(|d| !desired.iter().any(|r| r.destination == *d))
            .map(str::to_string)
            .collect();

        let changes = Differ::diff(desired, &live.mesh_rules);
        let outcome = self.applier.apply(bucket, &live, &changes, &self.identity_arn).await?;
        Ok(outcome.into())
    }

    async fn cleanup(&self, job: &Job) -> Result<BucketStatus, MeshError> {
        let bucket = &job.bucket;
        let live = match self.reader.read(bucket).await {
            Ok(LiveRead::Found(live)) => live,
            Ok(LiveRead::NotFound) => {
                debug!(bucket = %bucket.name, "Bucket no longer exists");
                return Ok(BucketStatus::Gone);
            }
            Err(e) => return Err(MeshError::from_backend(&bucket.name, e)),
        };

        let keep: Vec<ReplicationRule> = match &job.kind {
            JobKind::Detach(targets) => live
                .mesh_rules
                .iter()
                .filter(|r| !targets.contains(&r.destination))
                .cloned()
                .collect(),
            JobKind::Cleanup | JobKind::Converge(_) => Vec::new(),
        };
        let changes = Differ::diff(&keep, &live.mesh_rules);

        match self.applier.apply(bucket, &live, &changes, &self.identity_arn).await {
            Ok(outcome) => Ok(outcome.into()),
            Err(MeshError::BucketNotFound { .. }) => Ok(BucketStatus::Gone),
            Err(e) => Err(e),
        }
    }
}

/// Orchestrates compile, preflight, read, diff and apply across a mesh.
pub struct MeshReconciler {
    backend: Arc<dyn MeshBackend>,
    config: ReconcilerConfig,
    retry: RetryConfig,
}

impl MeshReconciler {
    /// Creates a reconciler with default settings.
    pub fn new(backend: Arc<dyn MeshBackend>) -> Self {
        Self { backend, config: ReconcilerConfig::default(), retry: RetryConfig::default() }
    }

    /// Sets the reconciler configuration.
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the retry policy for backend calls.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the reconciler configuration.
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Returns the backend.
    pub fn backend(&self) -> &Arc<dyn MeshBackend> {
        &self.backend
    }

    /// Runs `request` to completion.
    pub async fn reconcile(&self, request: ReconcileRequest) -> ReconcileOutcome {
        self.reconcile_with_cancel(request, &CancellationToken::new()).await
    }

    /// Runs `request`, stopping early when `cancel` fires.
    ///
    /// Pipelines already running finish or time out on their own; buckets
    /// not yet started are reported as `NotApplied`.
    pub async fn reconcile_with_cancel(
        &self,
        request: ReconcileRequest,
        cancel: &CancellationToken,
    ) -> ReconcileOutcome {
        let mode = request.mode();
        let mut outcome = ReconcileOutcome::new(mode);
        let started = Instant::now();
        info!(
            run_id = %outcome.run_id,
            mode = %mode,
            buckets = request.spec().len(),
            dry_run = self.config.dry_run,
            backend = self.backend.name(),
            "Starting reconciliation"
        );

        outcome.transition(ReconcileState::Computing);
        let plan = match self.plan(&request) {
            Ok(plan) => plan,
            Err(e) => {
                error!(run_id = %outcome.run_id, error = %e, "Rejected mesh declaration");
                outcome.spec_error = Some(e);
                return self.finish(outcome, ReconcileState::Failed, started);
            }
        };
        outcome.replaced =
            plan.previous_physical_id.as_ref().is_some_and(|previous| *previous != plan.physical_id);
        outcome.physical_id = Some(plan.physical_id.clone());
        outcome.previous_physical_id = plan.previous_physical_id.clone();

        outcome.transition(ReconcileState::Applying);
        let mut pipeline = self.pipeline(&plan.identity_arn);
        let readiness = self.preflight_members(&plan.jobs, &pipeline.preflight, cancel).await;
        pipeline.readiness = Arc::new(readiness);
        let mut results = self.run_jobs(plan.jobs.clone(), &pipeline, cancel).await;

        if mode == ReconcileMode::Update && self.config.discover_orphans && !cancel.is_cancelled() {
            let orphans = self.discover_orphans(&plan, &results, cancel).await;
            if !orphans.is_empty() {
                results.extend(self.run_jobs(orphans, &pipeline, cancel).await);
            }
        }

        outcome.buckets = results.into_iter().map(|r| r.report).collect();
        outcome.cancelled = cancel.is_cancelled();
        let state = if outcome.buckets.iter().all(|r| r.status.is_success()) {
            ReconcileState::Succeeded
        } else {
            ReconcileState::PartiallyFailed
        };
        self.finish(outcome, state, started)
    }

    fn plan(&self, request: &ReconcileRequest) -> Result<Plan, SpecError> {
        match request {
            ReconcileRequest::Create { spec } => self.plan_converge(spec, None, None),
            ReconcileRequest::Update { spec, previous, previous_physical_id } => {
                self.plan_converge(spec, previous.as_ref(), previous_physical_id.clone())
            }
            ReconcileRequest::Delete { spec } => {
                let spec = spec.normalized_lenient();
                let jobs = spec
                    .buckets
                    .iter()
                    .map(|b| Job { bucket: b.clone(), role: BucketRole::Member, kind: JobKind::Cleanup })
                    .collect();
                Ok(Plan {
                    identity_arn: spec.replication_identity_arn.clone(),
                    jobs,
                    physical_id: spec.physical_id(),
                    previous_physical_id: None,
                    known: spec.bucket_names().map(str::to_string).collect(),
                })
            }
        }
    }

    fn plan_converge(
        &self,
        spec: &MeshSpec,
        previous: Option<&MeshSpec>,
        previous_physical_id: Option<String>,
    ) -> Result<Plan, SpecError> {
        let spec = spec.normalized()?;
        let mut desired = RuleCompiler::compile_normalized(&spec);

        let mut jobs: Vec<Job> = spec
            .buckets
            .iter()
            .map(|b| Job {
                bucket: b.clone(),
                role: BucketRole::Member,
                kind: JobKind::Converge(desired.remove(&b.name).unwrap_or_default()),
            })
            .collect();
        let mut known: BTreeSet<String> = spec.bucket_names().map(str::to_string).collect();

        let previous = previous.map(MeshSpec::normalized_lenient);
        if let Some(previous) = &previous {
            for bucket in previous.buckets.iter().filter(|b| !spec.contains(&b.name)) {
                debug!(bucket = %bucket.name, "Bucket left the mesh");
                known.insert(bucket.name.clone());
                jobs.push(Job { bucket: bucket.clone(), role: BucketRole::Removed, kind: JobKind::Cleanup });
            }
        }

        Ok(Plan {
            identity_arn: spec.replication_identity_arn.clone(),
            jobs,
            physical_id: spec.physical_id(),
            previous_physical_id: previous_physical_id
                .or_else(|| previous.as_ref().map(MeshSpec::physical_id)),
            known,
        })
    }

    fn pipeline(&self, identity_arn: &str) -> BucketPipeline {
        let dry_run = self.config.dry_run;
        BucketPipeline {
            reader: LiveStateReader::new(Arc::clone(&self.backend), self.retry.clone()),
            preflight: PreflightChecker::new(
                Arc::clone(&self.backend),
                self.retry.clone(),
                self.config.versioning_policy,
            )
            .dry_run(dry_run),
            applier: BucketApplier::new(Arc::clone(&self.backend), self.retry.clone()).dry_run(dry_run),
            identity_arn: Arc::from(identity_arn),
            readiness: Arc::default(),
        }
    }

    /// Checks versioning on every bucket that will hold mesh rules.
    ///
    /// Finishes before any job starts. Buckets skipped by cancellation are
    /// left out of the result.
    async fn preflight_members(
        &self,
        jobs: &[Job],
        checker: &PreflightChecker,
        cancel: &CancellationToken,
    ) -> Readiness {
        let buckets: Vec<BucketRef> = jobs
            .iter()
            .filter(|job| matches!(&job.kind, JobKind::Converge(desired) if !desired.is_empty()))
            .map(|job| job.bucket.clone())
            .collect();
        if buckets.is_empty() {
            return Readiness::new();
        }
        let workers = self.config.max_concurrency.min(buckets.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let timeout = self.config.bucket_timeout_duration();
        debug!(buckets = buckets.len(), workers = workers, "Checking member versioning");

        let mut handles = Vec::with_capacity(buckets.len());
        for bucket in buckets {
            let semaphore = Arc::clone(&semaphore);
            let checker = checker.clone();
            let cancel = cancel.clone();
            let name = bucket.name.clone();

            let handle = tokio::spawn(async move {
                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let _permit = permit?;
                if cancel.is_cancelled() {
                    return None;
                }
                let checked = tokio::time::timeout(timeout, checker.ensure(&bucket))
                    .await
                    .unwrap_or_else(|_| {
                        Err(MeshError::TimedOut {
                            bucket: bucket.name.clone(),
                            timeout_ms: timeout.as_millis() as u64,
                        })
                    });
                Some(checked)
            });
            handles.push((name, handle));
        }

        let mut readiness = Readiness::with_capacity(handles.len());
        for (name, handle) in handles {
            let checked = match handle.await {
                Ok(Some(checked)) => checked,
                Ok(None) => continue,
                Err(e) => {
                    error!(bucket = %name, error = %e, "Preflight task failed");
                    Err(MeshError::Internal { bucket: name.clone(), reason: e.to_string() })
                }
            };
            if let Err(e) = &checked {
                warn!(bucket = %name, error = %e, "Bucket failed preflight");
            }
            readiness.insert(name, checked);
        }
        readiness
    }

    async fn run_jobs(
        &self,
        jobs: Vec<Job>,
        pipeline: &BucketPipeline,
        cancel: &CancellationToken,
    ) -> Vec<JobResult> {
        if jobs.is_empty() {
            return Vec::new();
        }
        let workers = self.config.max_concurrency.min(jobs.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let timeout = self.config.bucket_timeout_duration();
        debug!(jobs = jobs.len(), workers = workers, "Dispatching bucket pipelines");

        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let semaphore = Arc::clone(&semaphore);
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            let fallback = job.clone();

            let handle = tokio::spawn(async move {
                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return JobResult::with_status(&job, BucketStatus::NotApplied);
                };
                if cancel.is_cancelled() {
                    return JobResult::with_status(&job, BucketStatus::NotApplied);
                }

                let start = Instant::now();
                let result = tokio::time::timeout(timeout, pipeline.run(&job)).await;
                histogram!("mesh_bucket_pipeline_seconds").record(start.elapsed().as_secs_f64());
                match result {
                    Ok(result) => result,
                    Err(_) => {
                        let err = MeshError::TimedOut {
                            bucket: job.bucket.name.clone(),
                            timeout_ms: timeout.as_millis() as u64,
                        };
                        warn!(bucket = %job.bucket.name, error = %err, "Bucket pipeline timed out");
                        counter!("mesh_bucket_pipeline_total", "outcome" => "timed_out").increment(1);
                        JobResult::with_status(&job, BucketStatus::from_error(err))
                    }
                }
            });
            handles.push((fallback, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (job, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!(bucket = %job.bucket.name, error = %e, "Bucket pipeline task failed");
                    let err = MeshError::Internal { bucket: job.bucket.name.clone(), reason: e.to_string() };
                    results.push(JobResult::with_status(&job, BucketStatus::from_error(err)));
                }
            }
        }
        results
    }

    /// Finds former members through stale mesh rules on current members.
    ///
    /// Each one found gets a job that drops its rules pointing back into the
    /// plan, leaving rules towards unrelated buckets alone.
    async fn discover_orphans(
        &self,
        plan: &Plan,
        results: &[JobResult],
        cancel: &CancellationToken,
    ) -> Vec<Job> {
        let candidates: BTreeSet<&str> = results
            .iter()
            .flat_map(|r| r.stale_destinations.iter().map(String::as_str))
            .filter(|name| !plan.known.contains(*name))
            .collect();

        let mut jobs = Vec::new();
        for name in candidates {
            if cancel.is_cancelled() {
                break;
            }
            let located = with_retry(&self.retry, BackendOp::LocateBucket, name, || {
                self.backend.locate_bucket(name)
            })
            .await;
            match located {
                Ok(Some(region)) => {
                    info!(bucket = %name, region = %region, "Found orphaned mesh bucket");
                    jobs.push(Job {
                        bucket: BucketRef::new(name, region),
                        role: BucketRole::Orphan,
                        kind: JobKind::Detach(plan.known.clone()),
                    });
                }
                Ok(None) => debug!(bucket = %name, "Stale mesh destination cannot be located"),
                Err(e) => {
                    warn!(bucket = %name, error = %e, "Failed to locate stale mesh destination")
                }
            }
        }
        jobs
    }

    fn finish(
        &self,
        mut outcome: ReconcileOutcome,
        state: ReconcileState,
        started: Instant,
    ) -> ReconcileOutcome {
        outcome.transition(state);
        outcome.finished_at = Utc::now();
        counter!(
            "mesh_reconcile_total",
            "mode" => outcome.mode.as_str(),
            "state" => state.as_str()
        )
        .increment(1);

        let failed = outcome.failures().len();
        info!(
            run_id = %outcome.run_id,
            mode = %outcome.mode,
            state = state.as_str(),
            buckets = outcome.buckets.len(),
            failed = failed,
            replaced = outcome.replaced,
            cancelled = outcome.cancelled,
            duration_ms = started.elapsed().as_millis() as u64,
            "Reconciliation finished"
        );
        outcome
    }
}
