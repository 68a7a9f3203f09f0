//! The migration phase state machine, driven one step per call by an
//! external poll/requeue loop. Every step reads the persisted record and
//! external signals, does at most one phase's worth of work, and returns.

use crate::block::ChangeSet;
use crate::collaborators::{
    CutoverExecutor, DiskConverter, DiskJob, DiskSync, HypervisorConnector, PreflightCheck,
    SnapshotInfo, SourceHypervisor, ValidationGate, ValidationState,
};
use crate::config::{ConvergenceExhaustion, MigrateConfig, PolicyConfig};
use crate::copy::{CopyProgress, CopyStats, ProgressSnapshot};
use crate::error::{MigrationError, RetryClass};
use crate::events::{EventReason, EventSink};
use crate::phase::MigrationPhase;
use crate::session_cache::{SessionCache, SessionKey};
use crate::transport::{Credentials, DiskRef};
use crate::{Result, log_info, log_warn};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRef {
    pub name: String,
    pub moref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Hypervisor device key, stable for the life of the VM.
    pub key: String,
    /// Datastore path of the backing file.
    pub path: String,
    pub capacity_bytes: u64,
    /// Pre-sized destination volume.
    pub destination: PathBuf,
    /// Change id of the last successful synchronisation.
    #[serde(default)]
    pub change_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationKind {
    /// Copy while the source runs, then chase changes.
    #[default]
    Hot,
    /// Power the source off first; one full copy is enough.
    Cold,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStrategy {
    #[serde(default)]
    pub kind: MigrationKind,
    #[serde(default)]
    pub data_copy_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cutover_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cutover_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub admin_initiated_cutover: bool,
}

/// The externally persisted state of one VM migration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: Uuid,
    pub vm: VmRef,
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub strategy: MigrationStrategy,
    #[serde(default)]
    pub phase: MigrationPhase,
    #[serde(default)]
    pub message: String,
    /// Failures of the current phase's work since entering it.
    #[serde(default)]
    pub attempts: u32,
    /// Earlier migration attempts of the same VM.
    #[serde(default)]
    pub previous_attempts: u32,
    /// Completed changed-block iterations.
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub last_delta_bytes: Option<u64>,
    /// Snapshot the disks were last synchronised from.
    #[serde(default)]
    pub snapshot: Option<SnapshotInfo>,
    /// Snapshot taken for an iteration that has not finished yet.
    #[serde(default)]
    pub pending_snapshot: Option<SnapshotInfo>,
    #[serde(default)]
    pub source_powered_off: bool,
    #[serde(default)]
    pub cutover_approved: bool,
    pub updated_at: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn new(vm: VmRef, disks: Vec<DiskSpec>, strategy: MigrationStrategy) -> Self {
        Self {
            id: Uuid::new_v4(),
            vm,
            disks,
            strategy,
            phase: MigrationPhase::Pending,
            message: String::new(),
            attempts: 0,
            previous_attempts: 0,
            iteration: 0,
            last_delta_bytes: None,
            snapshot: None,
            pending_snapshot: None,
            source_powered_off: false,
            cutover_approved: false,
            updated_at: Utc::now(),
        }
    }
}

/// What the caller should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Call again after the delay; zero means right away.
    Requeue(Duration),
    /// Terminal phase reached.
    Done,
}

impl ReconcileOutcome {
    pub fn now() -> Self {
        ReconcileOutcome::Requeue(Duration::ZERO)
    }
}

/// The collaborators one reconciler talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn HypervisorConnector>,
    pub sessions: Arc<SessionCache<SessionKey, Arc<dyn SourceHypervisor>>>,
    pub validation: Arc<dyn ValidationGate>,
    pub preflight: Arc<dyn PreflightCheck>,
    pub disk_sync: Arc<dyn DiskSync>,
    pub converter: Arc<dyn DiskConverter>,
    pub cutover: Arc<dyn CutoverExecutor>,
    pub events: Arc<dyn EventSink>,
}

enum Convergence {
    Repeat,
    Converged,
    Exhausted,
}

pub struct Reconciler {
    policy: PolicyConfig,
    convergence_threshold: u64,
    credentials: Credentials,
    collaborators: Collaborators,
    cancel: CancellationToken,
    progress: Mutex<HashMap<String, Arc<CopyProgress>>>,
}

impl Reconciler {
    pub fn new(
        config: &MigrateConfig,
        credentials: Credentials,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            policy: config.policy.clone(),
            convergence_threshold: config.policy.convergence_threshold_bytes()?,
            credentials,
            collaborators,
            cancel: CancellationToken::new(),
            progress: Mutex::new(HashMap::new()),
        })
    }

    /// Cancelling kills every in-flight copy of this reconciler.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Latest copy counters per disk key.
    pub fn progress(&self) -> HashMap<String, ProgressSnapshot> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, progress)| (key.clone(), progress.snapshot()))
            .collect()
    }

    pub async fn reconcile(&self, record: &mut MigrationRecord) -> Result<ReconcileOutcome> {
        self.reconcile_at(record, Utc::now()).await
    }

    /// One step, evaluated as of `now`.
    pub async fn reconcile_at(
        &self,
        record: &mut MigrationRecord,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let phase = record.phase;
        let step = match phase {
            MigrationPhase::Succeeded | MigrationPhase::Failed => return Ok(ReconcileOutcome::Done),
            MigrationPhase::Unknown => {
                self.transition(
                    record,
                    MigrationPhase::Failed,
                    EventReason::IndeterminatePhase,
                    "migration phase is indeterminate; refusing to resume".to_string(),
                )?;
                return Ok(ReconcileOutcome::Done);
            }
            MigrationPhase::Pending => self.await_validation(record).await,
            MigrationPhase::Validating => self.validate(record).await,
            MigrationPhase::AwaitingDataCopyStart => self.await_data_copy_start(record, now),
            MigrationPhase::CopyingBlocks => self.copy_blocks(record).await,
            MigrationPhase::CopyingChangedBlocks => self.copy_changed_blocks(record).await,
            MigrationPhase::ConvertingDisk => self.convert(record).await,
            MigrationPhase::AwaitingCutoverStartTime => self.await_cutover_start(record, now).await,
            MigrationPhase::AwaitingAdminCutOver => self.await_admin_cutover(record, now).await,
        };

        match step {
            Ok(outcome) => Ok(outcome),
            Err(err) => self.handle_failure(record, phase, err).await,
        }
    }

    fn transition(
        &self,
        record: &mut MigrationRecord,
        to: MigrationPhase,
        reason: EventReason,
        message: String,
    ) -> Result<()> {
        let from = record.phase;
        if !from.can_transition_to(to) {
            return Err(MigrationError::InvalidTransition { from, to });
        }
        log_info!(
            migration = %record.id,
            vm = %record.vm.name,
            %from,
            %to,
            reason = reason.as_str(),
            "{}",
            message
        );
        self.collaborators
            .events
            .emit(record.id, from, to, reason, &message);
        record.phase = to;
        record.message = message;
        record.attempts = 0;
        record.updated_at = Utc::now();
        Ok(())
    }

    fn wait(&self, record: &mut MigrationRecord, message: String, after: Duration) -> ReconcileOutcome {
        if record.message != message {
            record.message = message;
            record.updated_at = Utc::now();
        }
        ReconcileOutcome::Requeue(after)
    }

    fn retry_limit(&self, class: RetryClass) -> u32 {
        match class {
            RetryClass::Login => self.policy.login_retry_limit,
            RetryClass::Copy => self.policy.copy_retry_limit,
            RetryClass::Conversion => self.policy.conversion_retry_limit,
            RetryClass::Cutover => self.policy.cutover_retry_limit,
            RetryClass::Fatal => 0,
        }
    }

    async fn handle_failure(
        &self,
        record: &mut MigrationRecord,
        phase: MigrationPhase,
        err: MigrationError,
    ) -> Result<ReconcileOutcome> {
        if err.is_cancelled() {
            log_warn!(migration = %record.id, %phase, "step cancelled");
            return Err(err);
        }
        if let MigrationError::InvalidTransition { .. } = err {
            return Err(err);
        }

        let class = err.retry_class();
        if class == RetryClass::Login {
            self.collaborators.sessions.invalidate(&self.session_key());
        }

        record.attempts += 1;
        let limit = self.retry_limit(class);
        if record.attempts > limit {
            let message = if class == RetryClass::Fatal {
                format!("{} failed: {}", phase, err)
            } else {
                format!("{} failed after {} attempts: {}", phase, record.attempts, err)
            };
            self.release_snapshots(record).await;
            self.transition(record, MigrationPhase::Failed, EventReason::MigrationFailed, message)?;
            return Ok(ReconcileOutcome::Done);
        }

        let delay = retry_delay(&self.policy, record.attempts);
        let message = format!(
            "{} attempt {}/{} failed, retrying in {}s: {}",
            phase,
            record.attempts,
            limit,
            delay.as_secs(),
            err
        );
        log_warn!(migration = %record.id, %phase, attempts = record.attempts, "{}", message);
        self.collaborators
            .events
            .emit(record.id, phase, phase, EventReason::RetryScheduled, &message);
        record.message = message;
        record.updated_at = Utc::now();
        Ok(ReconcileOutcome::Requeue(delay))
    }

    fn session_key(&self) -> SessionKey {
        SessionKey::new(&self.credentials.endpoint, &self.credentials.username)
    }

    async fn hypervisor(&self) -> Result<Arc<dyn SourceHypervisor>> {
        let connector = self.collaborators.connector.clone();
        let credentials = self.credentials.clone();
        self.collaborators
            .sessions
            .get_or_try_init(&self.session_key(), || async move {
                connector.connect(&credentials).await
            })
            .await
    }

    fn disk_job(&self, disk: &DiskSpec, vm: &VmRef, snapshot: Option<&SnapshotInfo>) -> DiskJob {
        let progress = {
            let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = CopyProgress::new();
            progress.insert(disk.key.clone(), entry.clone());
            entry
        };
        DiskJob {
            credentials: self.credentials.clone(),
            disk: DiskRef {
                vm_moref: vm.moref.clone(),
                disk_path: disk.path.clone(),
                snapshot_moref: snapshot.map(|snapshot| snapshot.moref.clone()),
            },
            destination: disk.destination.clone(),
            progress,
        }
    }

    async fn await_validation(&self, record: &mut MigrationRecord) -> Result<ReconcileOutcome> {
        match self.collaborators.validation.validation_state(record).await? {
            ValidationState::Validated => {
                self.transition(
                    record,
                    MigrationPhase::Validating,
                    EventReason::MigrationValidating,
                    "credentials and mappings validated".to_string(),
                )?;
                Ok(ReconcileOutcome::now())
            }
            ValidationState::Pending => Ok(self.wait(
                record,
                "waiting for credentials and mappings to be validated".to_string(),
                self.policy.poll_interval(),
            )),
            ValidationState::Invalid(reason) => Err(MigrationError::Validation(reason)),
        }
    }

    async fn validate(&self, record: &mut MigrationRecord) -> Result<ReconcileOutcome> {
        if record.previous_attempts >= self.policy.max_migration_attempts {
            return Err(MigrationError::Preflight(format!(
                "{} earlier attempts reached the limit of {}",
                record.previous_attempts, self.policy.max_migration_attempts
            )));
        }

        let report = self.collaborators.preflight.check(record).await?;
        if !report.is_ready() {
            return Err(MigrationError::Preflight(report.issues.join("; ")));
        }

        self.transition(
            record,
            MigrationPhase::AwaitingDataCopyStart,
            EventReason::PreflightPassed,
            "preflight checks passed".to_string(),
        )?;
        Ok(ReconcileOutcome::now())
    }

    fn await_data_copy_start(
        &self,
        record: &mut MigrationRecord,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        if let Some(start) = record.strategy.data_copy_start.filter(|start| *start > now) {
            return Ok(self.wait(
                record,
                format!("data copy scheduled for {}", start.to_rfc3339()),
                until(now, start),
            ));
        }

        self.transition(
            record,
            MigrationPhase::CopyingBlocks,
            EventReason::DataCopyStarted,
            format!("copying {} disk(s)", record.disks.len()),
        )?;
        Ok(ReconcileOutcome::now())
    }

    async fn copy_blocks(&self, record: &mut MigrationRecord) -> Result<ReconcileOutcome> {
        let hypervisor = self.hypervisor().await?;

        if record.strategy.kind == MigrationKind::Cold && !record.source_powered_off {
            hypervisor.power_off(&record.vm).await?;
            record.source_powered_off = true;
        }

        if record.strategy.kind == MigrationKind::Hot && record.snapshot.is_none() {
            let name = format!("vmigrate-{}-base", record.id);
            record.snapshot = Some(hypervisor.create_snapshot(&record.vm, &name).await?);
        }

        let jobs: Vec<DiskJob> = record
            .disks
            .iter()
            .map(|disk| self.disk_job(disk, &record.vm, record.snapshot.as_ref()))
            .collect();
        try_join_all(
            jobs.iter()
                .map(|job| self.collaborators.disk_sync.full_copy(job, &self.cancel)),
        )
        .await?;

        if let Some(snapshot) = &record.snapshot {
            for disk in &mut record.disks {
                disk.change_id = snapshot.change_id(&disk.key).map(str::to_string);
            }
        }

        self.transition(
            record,
            MigrationPhase::CopyingChangedBlocks,
            EventReason::DiskCopyCompleted,
            format!("full copy of {} disk(s) complete", record.disks.len()),
        )?;
        Ok(ReconcileOutcome::now())
    }

    async fn copy_changed_blocks(&self, record: &mut MigrationRecord) -> Result<ReconcileOutcome> {
        if record.strategy.kind == MigrationKind::Cold {
            self.transition(
                record,
                MigrationPhase::ConvertingDisk,
                EventReason::ChangedBlocksConverged,
                "cold migration: source was off during the full copy".to_string(),
            )?;
            return Ok(ReconcileOutcome::now());
        }

        let hypervisor = self.hypervisor().await?;
        let snapshot = match record.pending_snapshot.clone() {
            Some(snapshot) => snapshot,
            None => {
                let name = format!("vmigrate-{}-{}", record.id, record.iteration + 1);
                let snapshot = hypervisor.create_snapshot(&record.vm, &name).await?;
                record.pending_snapshot = Some(snapshot.clone());
                snapshot
            }
        };

        let mut change_sets = Vec::with_capacity(record.disks.len());
        for disk in &record.disks {
            let since = disk.change_id.as_deref().ok_or_else(|| {
                MigrationError::Hypervisor(format!("disk {} has no change id", disk.key))
            })?;
            let mut changes = hypervisor
                .changed_extents(&record.vm, &snapshot, disk, since)
                .await?;
            changes.since_change_id = Some(since.to_string());
            changes.change_id = snapshot.change_id(&disk.key).map(str::to_string);
            change_sets.push(changes);
        }

        let jobs: Vec<DiskJob> = record
            .disks
            .iter()
            .map(|disk| self.disk_job(disk, &record.vm, Some(&snapshot)))
            .collect();
        let stats = try_join_all(jobs.iter().zip(&change_sets).map(|(job, changes)| {
            self.collaborators
                .disk_sync
                .copy_changes(job, changes, &self.cancel)
        }))
        .await?;

        let delta: u64 = change_sets.iter().map(ChangeSet::total_bytes).sum();
        let mut total = CopyStats::default();
        for disk_stats in &stats {
            total.merge(disk_stats);
        }

        for (disk, changes) in record.disks.iter_mut().zip(&change_sets) {
            if let Some(change_id) = &changes.change_id {
                disk.change_id = Some(change_id.clone());
            }
        }
        if let Some(previous) = record.snapshot.take() {
            self.remove_snapshot(hypervisor.as_ref(), record, &previous).await;
        }
        record.snapshot = record.pending_snapshot.take();
        record.iteration += 1;
        record.last_delta_bytes = Some(delta);

        let summary = format!(
            "iteration {}: {} changed bytes ({} written, {} deallocated)",
            record.iteration, delta, total.bytes_written, total.bytes_deallocated
        );

        if record.source_powered_off {
            return self
                .finish_changed_blocks(
                    record,
                    hypervisor.as_ref(),
                    EventReason::ChangedBlocksConverged,
                    format!("{}; final sync with source powered off complete", summary),
                )
                .await;
        }

        let (reason, mut message) = match self.convergence(record.iteration, delta) {
            Convergence::Repeat => {
                self.transition(
                    record,
                    MigrationPhase::CopyingChangedBlocks,
                    EventReason::ChangedBlocksCopied,
                    summary,
                )?;
                return Ok(ReconcileOutcome::now());
            }
            Convergence::Converged => (EventReason::ChangedBlocksConverged, summary),
            Convergence::Exhausted => match self.policy.on_convergence_exhausted {
                ConvergenceExhaustion::Fail => {
                    self.release_snapshots(record).await;
                    self.transition(
                        record,
                        MigrationPhase::Failed,
                        EventReason::ConvergenceExhausted,
                        format!(
                            "{}; delta still above threshold after {} iterations",
                            summary, record.iteration
                        ),
                    )?;
                    return Ok(ReconcileOutcome::Done);
                }
                ConvergenceExhaustion::Proceed => {
                    log_warn!(
                        migration = %record.id,
                        iteration = record.iteration,
                        delta,
                        "changed blocks did not converge, proceeding"
                    );
                    (
                        EventReason::ConvergenceExhausted,
                        format!("{}; iteration cap reached, proceeding", summary),
                    )
                }
            },
        };

        if self.policy.final_sync_after_power_off {
            hypervisor.power_off(&record.vm).await?;
            record.source_powered_off = true;
            message.push_str("; source powered off for final sync");
            let reason = match reason {
                EventReason::ConvergenceExhausted => reason,
                _ => EventReason::ChangedBlocksCopied,
            };
            self.transition(record, MigrationPhase::CopyingChangedBlocks, reason, message)?;
            return Ok(ReconcileOutcome::now());
        }

        self.finish_changed_blocks(record, hypervisor.as_ref(), reason, message)
            .await
    }

    fn convergence(&self, iteration: u32, delta: u64) -> Convergence {
        if delta <= self.convergence_threshold {
            Convergence::Converged
        } else if iteration >= self.policy.max_change_iterations {
            Convergence::Exhausted
        } else {
            Convergence::Repeat
        }
    }

    async fn finish_changed_blocks(
        &self,
        record: &mut MigrationRecord,
        hypervisor: &dyn SourceHypervisor,
        reason: EventReason,
        message: String,
    ) -> Result<ReconcileOutcome> {
        if let Some(snapshot) = record.snapshot.take() {
            self.remove_snapshot(hypervisor, record, &snapshot).await;
        }
        self.transition(record, MigrationPhase::ConvertingDisk, reason, message)?;
        Ok(ReconcileOutcome::now())
    }

    async fn remove_snapshot(
        &self,
        hypervisor: &dyn SourceHypervisor,
        record: &MigrationRecord,
        snapshot: &SnapshotInfo,
    ) {
        if let Err(err) = hypervisor.remove_snapshot(&record.vm, snapshot).await {
            log_warn!(
                migration = %record.id,
                snapshot = %snapshot.moref,
                error = %err,
                "failed to remove source snapshot"
            );
        }
    }

    /// Best-effort removal of every snapshot the record still holds, so a
    /// failed migration leaves no delta disks growing on the source.
    async fn release_snapshots(&self, record: &mut MigrationRecord) {
        let snapshots: Vec<SnapshotInfo> = record
            .snapshot
            .take()
            .into_iter()
            .chain(record.pending_snapshot.take())
            .collect();
        if snapshots.is_empty() {
            return;
        }
        match self.hypervisor().await {
            Ok(hypervisor) => {
                for snapshot in &snapshots {
                    self.remove_snapshot(hypervisor.as_ref(), record, snapshot).await;
                }
            }
            Err(err) => {
                for snapshot in &snapshots {
                    log_warn!(
                        migration = %record.id,
                        snapshot = %snapshot.moref,
                        error = %err,
                        "cannot reach source to remove snapshot"
                    );
                }
            }
        }
    }

    async fn convert(&self, record: &mut MigrationRecord) -> Result<ReconcileOutcome> {
        self.collaborators.converter.convert(record).await?;
        self.transition(
            record,
            MigrationPhase::AwaitingCutoverStartTime,
            EventReason::DiskConverted,
            "disk conversion complete".to_string(),
        )?;
        Ok(ReconcileOutcome::now())
    }

    fn cutover_window_missed(
        &self,
        record: &mut MigrationRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconcileOutcome>> {
        match record.strategy.cutover_end.filter(|end| *end < now) {
            Some(end) => {
                self.transition(
                    record,
                    MigrationPhase::Failed,
                    EventReason::CutoverWindowMissed,
                    format!("cutover window closed at {}", end.to_rfc3339()),
                )?;
                Ok(Some(ReconcileOutcome::Done))
            }
            None => Ok(None),
        }
    }

    async fn await_cutover_start(
        &self,
        record: &mut MigrationRecord,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        if let Some(outcome) = self.cutover_window_missed(record, now)? {
            return Ok(outcome);
        }
        if let Some(start) = record.strategy.cutover_start.filter(|start| *start > now) {
            return Ok(self.wait(
                record,
                format!("cutover scheduled for {}", start.to_rfc3339()),
                until(now, start),
            ));
        }

        if record.strategy.admin_initiated_cutover {
            self.transition(
                record,
                MigrationPhase::AwaitingAdminCutOver,
                EventReason::AwaitingAdminCutover,
                "waiting for an administrator to start cutover".to_string(),
            )?;
            return Ok(ReconcileOutcome::now());
        }

        self.cut_over(record).await
    }

    async fn await_admin_cutover(
        &self,
        record: &mut MigrationRecord,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        if !record.cutover_approved {
            return Ok(self.wait(
                record,
                "waiting for an administrator to start cutover".to_string(),
                self.policy.poll_interval(),
            ));
        }
        if let Some(outcome) = self.cutover_window_missed(record, now)? {
            return Ok(outcome);
        }
        self.cut_over(record).await
    }

    async fn cut_over(&self, record: &mut MigrationRecord) -> Result<ReconcileOutcome> {
        self.collaborators.cutover.cut_over(record).await?;
        self.transition(
            record,
            MigrationPhase::Succeeded,
            EventReason::MigrationSucceeded,
            format!("{} migrated", record.vm.name),
        )?;
        Ok(ReconcileOutcome::Done)
    }
}

fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

/// Exponential backoff for the `attempt`-th failure (1-based), capped, with
/// up to 10% jitter on top.
pub fn retry_delay(policy: &PolicyConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let base = policy
        .retry_base_delay_secs
        .saturating_mul(1u64 << exponent)
        .min(policy.retry_max_delay_secs);
    let base = Duration::from_secs(base);
    let jitter = rand::thread_rng().gen_range(0.0..=0.1);
    base + base.mul_f64(jitter)
}
