// Integration tests for the migration phase state machine
mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{FakeConverter, FakeDiskSync, FakeHypervisor, Harness};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use vmigrate::block::{ChangeSet, Extent, MIB};
use vmigrate::collaborators::ValidationState;
use vmigrate::config::{ConvergenceExhaustion, MigrateConfig};
use vmigrate::events::EventReason;
use vmigrate::phase::MigrationPhase;
use vmigrate::reconcile::{MigrationKind, MigrationRecord, ReconcileOutcome, Reconciler};

fn config() -> MigrateConfig {
    let mut config = MigrateConfig::default();
    config.policy.retry_base_delay_secs = 1;
    config.policy.retry_max_delay_secs = 8;
    config
}

fn changes(bytes: u64) -> ChangeSet {
    ChangeSet::new(vec![Extent::new(0, bytes)])
}

fn reconciler(harness: &Harness, config: &MigrateConfig) -> Reconciler {
    Reconciler::new(config, common::credentials(), harness.collaborators()).unwrap()
}

/// Step until a terminal phase or `limit` steps.
async fn drive(reconciler: &Reconciler, record: &mut MigrationRecord, limit: usize) {
    for _ in 0..limit {
        if reconciler.reconcile(record).await.unwrap() == ReconcileOutcome::Done {
            return;
        }
    }
}

#[tokio::test]
async fn test_scenario_c_bulk_copy_advances_with_one_event() {
    let harness = Harness::new(FakeHypervisor::default());
    let reconciler = reconciler(&harness, &config());
    let mut record = common::record(MigrationKind::Hot, 1);
    record.phase = MigrationPhase::CopyingBlocks;

    let outcome = reconciler.reconcile(&mut record).await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::ZERO));
    assert_eq!(record.phase, MigrationPhase::CopyingChangedBlocks);
    let events = harness.events.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, EventReason::DiskCopyCompleted);
    assert_eq!(events[0].from, MigrationPhase::CopyingBlocks);
    assert_eq!(events[0].to, MigrationPhase::CopyingChangedBlocks);
    assert_eq!(events[0].migration_id, record.id);

    let copies = harness.disk_sync.full_copies.lock().unwrap().clone();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].snapshot.as_deref(), Some("snapshot-1"));
    assert_eq!(record.disks[0].change_id.as_deref(), Some("52 de 4c 11/1"));
}

#[tokio::test]
async fn test_hot_migration_happy_path() {
    let hypervisor = FakeHypervisor::with_changes(vec![changes(512 * MIB), changes(MIB)]);
    let harness = Harness::new(hypervisor);
    let reconciler = reconciler(&harness, &config());
    let mut record = common::record(MigrationKind::Hot, 1);

    drive(&reconciler, &mut record, 30).await;

    assert_eq!(record.phase, MigrationPhase::Succeeded);
    assert_eq!(
        harness.events.reasons(),
        vec![
            EventReason::MigrationValidating,
            EventReason::PreflightPassed,
            EventReason::DataCopyStarted,
            EventReason::DiskCopyCompleted,
            EventReason::ChangedBlocksCopied,
            EventReason::ChangedBlocksCopied,
            EventReason::ChangedBlocksConverged,
            EventReason::DiskConverted,
            EventReason::MigrationSucceeded,
        ]
    );

    let events = harness.events.events();
    for pair in events.windows(2) {
        assert!(pair[0].sequence < pair[1].sequence);
        assert!(pair[0].timestamp <= pair[1].timestamp);
        assert!(pair[0].from.can_transition_to(pair[0].to));
    }

    assert_eq!(harness.hypervisor.power_offs(), 1);
    assert_eq!(record.iteration, 3);
    assert_eq!(
        *harness.hypervisor.since.lock().unwrap(),
        vec!["52 de 4c 11/1", "52 de 4c 11/2", "52 de 4c 11/3"]
    );
    assert_eq!(
        *harness.hypervisor.removed.lock().unwrap(),
        vec!["snapshot-1", "snapshot-2", "snapshot-3", "snapshot-4"]
    );
    assert!(record.snapshot.is_none());
    assert!(record.pending_snapshot.is_none());
    assert_eq!(record.disks[0].change_id.as_deref(), Some("52 de 4c 11/4"));

    // Every iteration is handed to the copy path, including the empty one.
    let incremental = harness.disk_sync.incremental.lock().unwrap().clone();
    assert_eq!(incremental.len(), 3);
    assert_eq!(incremental[0].1.total_bytes(), 512 * MIB);
    assert_eq!(incremental[0].1.since_change_id.as_deref(), Some("52 de 4c 11/1"));
    assert_eq!(incremental[0].1.change_id.as_deref(), Some("52 de 4c 11/2"));
    assert_eq!(harness.cutover.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.connector.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cold_migration_converges_without_snapshots() {
    let harness = Harness::new(FakeHypervisor::default());
    let reconciler = reconciler(&harness, &config());
    let mut record = common::record(MigrationKind::Cold, 2);

    drive(&reconciler, &mut record, 20).await;

    assert_eq!(record.phase, MigrationPhase::Succeeded);
    assert_eq!(harness.hypervisor.power_offs(), 1);
    assert!(harness.hypervisor.snapshots.lock().unwrap().is_empty());
    assert!(harness.hypervisor.since.lock().unwrap().is_empty());

    let copies = harness.disk_sync.full_copies.lock().unwrap().clone();
    assert_eq!(copies.len(), 2);
    assert!(copies.iter().all(|copy| copy.snapshot.is_none()));
    assert!(
        harness
            .events
            .reasons()
            .contains(&EventReason::ChangedBlocksConverged)
    );
}

#[tokio::test]
async fn test_copy_failures_retry_with_backoff() {
    let disk_sync = FakeDiskSync {
        fail_full_copies: AtomicUsize::new(2),
        ..FakeDiskSync::default()
    };
    let harness = Harness::with(
        FakeHypervisor::default(),
        disk_sync,
        FakeConverter::default(),
        0,
    );
    let reconciler = reconciler(&harness, &config());
    let mut record = common::record(MigrationKind::Hot, 1);
    record.phase = MigrationPhase::CopyingBlocks;

    let first = reconciler.reconcile(&mut record).await.unwrap();
    assert!(matches!(
        first,
        ReconcileOutcome::Requeue(delay) if delay >= Duration::from_secs(1) && delay <= Duration::from_millis(1100)
    ));
    assert_eq!(record.phase, MigrationPhase::CopyingBlocks);
    assert_eq!(record.attempts, 1);
    assert!(record.message.contains("offset 0"));

    let second = reconciler.reconcile(&mut record).await.unwrap();
    assert!(matches!(
        second,
        ReconcileOutcome::Requeue(delay) if delay >= Duration::from_secs(2) && delay <= Duration::from_millis(2200)
    ));
    assert_eq!(record.attempts, 2);

    reconciler.reconcile(&mut record).await.unwrap();
    assert_eq!(record.phase, MigrationPhase::CopyingChangedBlocks);
    assert_eq!(record.attempts, 0);
    assert_eq!(
        harness.events.reasons(),
        vec![
            EventReason::RetryScheduled,
            EventReason::RetryScheduled,
            EventReason::DiskCopyCompleted,
        ]
    );
    // The base snapshot is taken once, not per attempt.
    assert_eq!(harness.hypervisor.snapshots.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_migration() {
    let disk_sync = FakeDiskSync {
        fail_full_copies: AtomicUsize::new(100),
        ..FakeDiskSync::default()
    };
    let harness = Harness::with(
        FakeHypervisor::default(),
        disk_sync,
        FakeConverter::default(),
        0,
    );
    let mut config = config();
    config.policy.copy_retry_limit = 2;
    let reconciler = reconciler(&harness, &config);
    let mut record = common::record(MigrationKind::Hot, 1);
    record.phase = MigrationPhase::CopyingBlocks;

    drive(&reconciler, &mut record, 10).await;

    assert_eq!(record.phase, MigrationPhase::Failed);
    assert!(record.message.contains("after 3 attempts"));
    assert_eq!(
        harness.events.reasons(),
        vec![
            EventReason::RetryScheduled,
            EventReason::RetryScheduled,
            EventReason::MigrationFailed,
        ]
    );

    // The base snapshot taken before the first attempt is not left behind.
    assert_eq!(*harness.hypervisor.removed.lock().unwrap(), vec!["snapshot-1"]);
    assert!(record.snapshot.is_none());
    assert!(record.pending_snapshot.is_none());

    // Terminal phases absorb further steps.
    let outcome = reconciler.reconcile(&mut record).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Done);
    assert_eq!(harness.events.len(), 3);
}

#[tokio::test]
async fn test_login_failures_use_login_budget_and_cache_the_session() {
    let harness = Harness::with(
        FakeHypervisor::with_changes(vec![changes(MIB)]),
        FakeDiskSync::default(),
        FakeConverter::default(),
        2,
    );
    let mut config = config();
    config.policy.final_sync_after_power_off = false;
    let reconciler = reconciler(&harness, &config);
    let mut record = common::record(MigrationKind::Hot, 1);
    record.phase = MigrationPhase::CopyingBlocks;

    reconciler.reconcile(&mut record).await.unwrap();
    reconciler.reconcile(&mut record).await.unwrap();
    assert_eq!(record.phase, MigrationPhase::CopyingBlocks);
    assert_eq!(record.attempts, 2);
    assert!(record.message.contains("rejected credentials"));

    reconciler.reconcile(&mut record).await.unwrap();
    assert_eq!(record.phase, MigrationPhase::CopyingChangedBlocks);
    reconciler.reconcile(&mut record).await.unwrap();
    assert_eq!(record.phase, MigrationPhase::ConvertingDisk);

    assert_eq!(harness.connector.connects.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_login_failures_past_limit_fail() {
    let harness = Harness::with(
        FakeHypervisor::default(),
        FakeDiskSync::default(),
        FakeConverter::default(),
        100,
    );
    let mut config = config();
    config.policy.login_retry_limit = 1;
    let reconciler = reconciler(&harness, &config);
    let mut record = common::record(MigrationKind::Hot, 1);
    record.phase = MigrationPhase::CopyingBlocks;

    drive(&reconciler, &mut record, 5).await;

    assert_eq!(record.phase, MigrationPhase::Failed);
    assert_eq!(harness.connector.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_convergence_exhaustion_can_fail() {
    let hypervisor =
        FakeHypervisor::with_changes(vec![changes(512 * MIB), changes(512 * MIB)]);
    let harness = Harness::new(hypervisor);
    let mut config = config();
    config.policy.max_change_iterations = 2;
    config.policy.on_convergence_exhausted = ConvergenceExhaustion::Fail;
    let reconciler = reconciler(&harness, &config);
    let mut record = common::record(MigrationKind::Hot, 1);
    record.phase = MigrationPhase::CopyingBlocks;

    drive(&reconciler, &mut record, 10).await;

    assert_eq!(record.phase, MigrationPhase::Failed);
    assert_eq!(record.iteration, 2);
    assert_eq!(record.last_delta_bytes, Some(512 * MIB));
    assert_eq!(
        harness.events.reasons(),
        vec![
            EventReason::DiskCopyCompleted,
            EventReason::ChangedBlocksCopied,
            EventReason::ConvergenceExhausted,
        ]
    );
    assert_eq!(harness.hypervisor.power_offs(), 0);
    assert_eq!(
        *harness.hypervisor.removed.lock().unwrap(),
        vec!["snapshot-1", "snapshot-2", "snapshot-3"]
    );
    assert!(record.snapshot.is_none());
    assert!(record.pending_snapshot.is_none());
}

#[tokio::test]
async fn test_convergence_exhaustion_is_reported_before_final_sync() {
    let hypervisor = FakeHypervisor::with_changes(vec![
        changes(512 * MIB),
        changes(512 * MIB),
        changes(512 * MIB),
    ]);
    let harness = Harness::new(hypervisor);
    let mut config = config();
    config.policy.max_change_iterations = 2;
    let reconciler = reconciler(&harness, &config);
    let mut record = common::record(MigrationKind::Hot, 1);
    record.phase = MigrationPhase::CopyingBlocks;

    for _ in 0..4 {
        reconciler.reconcile(&mut record).await.unwrap();
    }

    assert_eq!(record.phase, MigrationPhase::ConvertingDisk);
    assert_eq!(
        harness.events.reasons(),
        vec![
            EventReason::DiskCopyCompleted,
            EventReason::ChangedBlocksCopied,
            EventReason::ConvergenceExhausted,
            EventReason::ChangedBlocksConverged,
        ]
    );
    assert_eq!(harness.hypervisor.power_offs(), 1);
    assert_eq!(record.iteration, 3);
}

#[tokio::test]
async fn test_convergence_exhaustion_can_proceed() {
    let hypervisor =
        FakeHypervisor::with_changes(vec![changes(512 * MIB), changes(512 * MIB)]);
    let harness = Harness::new(hypervisor);
    let mut config = config();
    config.policy.max_change_iterations = 2;
    config.policy.final_sync_after_power_off = false;
    let reconciler = reconciler(&harness, &config);
    let mut record = common::record(MigrationKind::Hot, 1);
    record.phase = MigrationPhase::CopyingBlocks;

    for _ in 0..3 {
        reconciler.reconcile(&mut record).await.unwrap();
    }

    assert_eq!(record.phase, MigrationPhase::ConvertingDisk);
    assert_eq!(
        harness.events.reasons().last(),
        Some(&EventReason::ConvergenceExhausted)
    );
    assert_eq!(
        *harness.hypervisor.removed.lock().unwrap(),
        vec!["snapshot-1", "snapshot-2", "snapshot-3"]
    );
}

#[tokio::test]
async fn test_validation_gate() {
    let harness = Harness::new(FakeHypervisor::default());
    *harness.gate.0.lock().unwrap() = ValidationState::Pending;
    let reconciler = reconciler(&harness, &config());
    let mut record = common::record(MigrationKind::Hot, 1);

    let outcome = reconciler.reconcile(&mut record).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::from_secs(30)));
    assert_eq!(record.phase, MigrationPhase::Pending);
    assert!(harness.events.is_empty());

    *harness.gate.0.lock().unwrap() = ValidationState::Invalid("storage map missing".into());
    let outcome = reconciler.reconcile(&mut record).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Done);
    assert_eq!(record.phase, MigrationPhase::Failed);
    assert!(record.message.contains("storage map missing"));
}

#[tokio::test]
async fn test_retry_history_blocks_new_attempts() {
    let harness = Harness::new(FakeHypervisor::default());
    let reconciler = reconciler(&harness, &config());
    let mut record = common::record(MigrationKind::Hot, 1);
    record.phase = MigrationPhase::Validating;
    record.previous_attempts = 3;

    reconciler.reconcile(&mut record).await.unwrap();

    assert_eq!(record.phase, MigrationPhase::Failed);
    assert!(record.message.contains("earlier attempts"));
    assert_eq!(harness.events.reasons(), vec![EventReason::MigrationFailed]);
}

#[tokio::test]
async fn test_data_copy_waits_for_start_time() {
    let harness = Harness::new(FakeHypervisor::default());
    let reconciler = reconciler(&harness, &config());
    let mut record = common::record(MigrationKind::Hot, 1);
    record.phase = MigrationPhase::AwaitingDataCopyStart;
    let now = Utc::now();
    record.strategy.data_copy_start = Some(now + ChronoDuration::minutes(5));

    let outcome = reconciler.reconcile_at(&mut record, now).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::from_secs(300)));
    assert_eq!(record.phase, MigrationPhase::AwaitingDataCopyStart);
    assert!(harness.events.is_empty());

    let later = now + ChronoDuration::minutes(6);
    reconciler.reconcile_at(&mut record, later).await.unwrap();
    assert_eq!(record.phase, MigrationPhase::CopyingBlocks);
    assert_eq!(harness.events.reasons(), vec![EventReason::DataCopyStarted]);
}

#[tokio::test]
async fn test_cutover_waits_for_window() {
    let harness = Harness::new(FakeHypervisor::default());
    let reconciler = reconciler(&harness, &config());
    let mut record = common::record(MigrationKind::Hot, 1);
    record.phase = MigrationPhase::AwaitingCutoverStartTime;
    let now = Utc::now();
    record.strategy.cutover_start = Some(now + ChronoDuration::hours(1));
    record.strategy.cutover_end = Some(now + ChronoDuration::hours(2));

    let outcome = reconciler.reconcile_at(&mut record, now).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::from_secs(3600)));
    assert_eq!(harness.cutover.calls.load(Ordering::SeqCst), 0);

    let in_window = now + ChronoDuration::minutes(90);
    let outcome = reconciler.reconcile_at(&mut record, in_window).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Done);
    assert_eq!(record.phase, MigrationPhase::Succeeded);
    assert_eq!(harness.cutover.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missed_cutover_window_fails() {
    let harness = Harness::new(FakeHypervisor::default());
    let reconciler = reconciler(&harness, &config());
    let mut record = common::record(MigrationKind::Hot, 1);
    record.phase = MigrationPhase::AwaitingCutoverStartTime;
    let now = Utc::now();
    record.strategy.cutover_end = Some(now - ChronoDuration::minutes(1));

    reconciler.reconcile_at(&mut record, now).await.unwrap();

    assert_eq!(record.phase, MigrationPhase::Failed);
    assert_eq!(harness.events.reasons(), vec![EventReason::CutoverWindowMissed]);
    assert_eq!(harness.cutover.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_admin_initiated_cutover() {
    let harness = Harness::new(FakeHypervisor::default());
    let reconciler = reconciler(&harness, &config());
    let mut record = common::record(MigrationKind::Hot, 1);
    record.phase = MigrationPhase::AwaitingCutoverStartTime;
    record.strategy.admin_initiated_cutover = true;

    reconciler.reconcile(&mut record).await.unwrap();
    assert_eq!(record.phase, MigrationPhase::AwaitingAdminCutOver);

    for _ in 0..3 {
        let outcome = reconciler.reconcile(&mut record).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::from_secs(30)));
    }
    assert_eq!(record.phase, MigrationPhase::AwaitingAdminCutOver);
    assert_eq!(harness.events.len(), 1);

    record.cutover_approved = true;
    let outcome = reconciler.reconcile(&mut record).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Done);
    assert_eq!(record.phase, MigrationPhase::Succeeded);
    assert_eq!(
        harness.events.reasons(),
        vec![
            EventReason::AwaitingAdminCutover,
            EventReason::MigrationSucceeded,
        ]
    );
}

#[tokio::test]
async fn test_unknown_phase_fails_without_resuming() {
    let harness = Harness::new(FakeHypervisor::default());
    let reconciler = reconciler(&harness, &config());
    let mut record = common::record(MigrationKind::Hot, 1);
    record.phase = MigrationPhase::Unknown;

    let outcome = reconciler.reconcile(&mut record).await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::Done);
    assert_eq!(record.phase, MigrationPhase::Failed);
    assert_eq!(harness.events.reasons(), vec![EventReason::IndeterminatePhase]);
    assert_eq!(harness.connector.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_conversion_is_retried() {
    let harness = Harness::with(
        FakeHypervisor::default(),
        FakeDiskSync::default(),
        FakeConverter {
            fail_first: 1,
            ..FakeConverter::default()
        },
        0,
    );
    let reconciler = reconciler(&harness, &config());
    let mut record = common::record(MigrationKind::Hot, 1);
    record.phase = MigrationPhase::ConvertingDisk;

    reconciler.reconcile(&mut record).await.unwrap();
    assert_eq!(record.phase, MigrationPhase::ConvertingDisk);
    assert!(record.message.contains("virt-v2v"));

    reconciler.reconcile(&mut record).await.unwrap();
    assert_eq!(record.phase, MigrationPhase::AwaitingCutoverStartTime);
    assert_eq!(
        harness.events.reasons(),
        vec![EventReason::RetryScheduled, EventReason::DiskConverted]
    );
}

#[tokio::test]
async fn test_cancellation_does_not_consume_a_retry() {
    let disk_sync = FakeDiskSync {
        hang: true,
        ..FakeDiskSync::default()
    };
    let harness = Harness::with(
        FakeHypervisor::default(),
        disk_sync,
        FakeConverter::default(),
        0,
    );
    let reconciler = reconciler(&harness, &config());
    let mut record = common::record(MigrationKind::Hot, 2);
    record.phase = MigrationPhase::CopyingBlocks;

    let cancel = reconciler.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let err = reconciler.reconcile(&mut record).await.unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(record.phase, MigrationPhase::CopyingBlocks);
    assert_eq!(record.attempts, 0);
    assert!(harness.events.is_empty());
}

#[tokio::test]
async fn test_progress_is_reported_per_disk() {
    let harness = Harness::new(FakeHypervisor::default());
    let reconciler = reconciler(&harness, &config());
    let mut record = common::record(MigrationKind::Cold, 2);
    record.phase = MigrationPhase::CopyingBlocks;

    reconciler.reconcile(&mut record).await.unwrap();

    let progress = reconciler.progress();
    assert_eq!(progress.len(), 2);
    assert_eq!(progress["2000"].percent, 100);
    assert_eq!(progress["2001"].bytes_total, 1 << 30);
}

#[tokio::test]
async fn test_record_round_trips_through_json() {
    let harness = Harness::new(FakeHypervisor::with_changes(vec![changes(512 * MIB)]));
    let reconciler = reconciler(&harness, &config());
    let mut record = common::record(MigrationKind::Hot, 1);
    record.phase = MigrationPhase::CopyingBlocks;

    reconciler.reconcile(&mut record).await.unwrap();
    reconciler.reconcile(&mut record).await.unwrap();

    let stored = serde_json::to_string(&record).unwrap();
    let mut restored: MigrationRecord = serde_json::from_str(&stored).unwrap();
    assert_eq!(restored, record);

    // A fresh reconciler picks up where the persisted record left off.
    let resumed = Reconciler::new(&config(), common::credentials(), harness.collaborators()).unwrap();
    resumed.reconcile(&mut restored).await.unwrap();
    assert_eq!(restored.iteration, 2);
    assert!(!stored.contains("s3cret-pw"));
}
