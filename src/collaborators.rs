//! Seams to the systems around the migration core. Production code wires
//! real clients in; tests use fakes.

use crate::Result;
use crate::block::ChangeSet;
use crate::copy::{CopyProgress, CopyStats};
use crate::preflight::PreflightReport;
use crate::reconcile::{DiskSpec, MigrationRecord, VmRef};
use crate::transport::{Credentials, DiskRef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A source snapshot and the change id each disk had when it was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub moref: String,
    /// Disk key to change id.
    pub change_ids: HashMap<String, String>,
}

impl SnapshotInfo {
    pub fn change_id(&self, disk_key: &str) -> Option<&str> {
        self.change_ids.get(disk_key).map(String::as_str)
    }
}

/// An authenticated session against the source management endpoint.
#[async_trait]
pub trait SourceHypervisor: Send + Sync {
    async fn power_off(&self, vm: &VmRef) -> Result<()>;

    async fn create_snapshot(&self, vm: &VmRef, name: &str) -> Result<SnapshotInfo>;

    /// Extents of `disk` changed between `since_change_id` and `snapshot`.
    async fn changed_extents(
        &self,
        vm: &VmRef,
        snapshot: &SnapshotInfo,
        disk: &DiskSpec,
        since_change_id: &str,
    ) -> Result<ChangeSet>;

    async fn remove_snapshot(&self, vm: &VmRef, snapshot: &SnapshotInfo) -> Result<()>;
}

#[async_trait]
pub trait HypervisorConnector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn SourceHypervisor>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationState {
    /// Credentials or mappings have not been checked yet.
    Pending,
    Validated,
    Invalid(String),
}

/// Reports whether the credentials and network/storage mappings referenced
/// by the migration template were validated elsewhere.
#[async_trait]
pub trait ValidationGate: Send + Sync {
    async fn validation_state(&self, record: &MigrationRecord) -> Result<ValidationState>;
}

/// Capacity, guest OS support and similar checks before any data moves.
#[async_trait]
pub trait PreflightCheck: Send + Sync {
    async fn check(&self, record: &MigrationRecord) -> Result<PreflightReport>;
}

/// Converts copied disks into a bootable format for the destination cloud.
#[async_trait]
pub trait DiskConverter: Send + Sync {
    async fn convert(&self, record: &MigrationRecord) -> Result<()>;
}

/// Makes the destination authoritative and retires the source.
#[async_trait]
pub trait CutoverExecutor: Send + Sync {
    async fn cut_over(&self, record: &MigrationRecord) -> Result<()>;
}

/// Everything needed to copy one disk in one attempt.
#[derive(Debug, Clone)]
pub struct DiskJob {
    pub credentials: Credentials,
    pub disk: DiskRef,
    pub destination: PathBuf,
    pub progress: Arc<CopyProgress>,
}

/// Moves the bytes of one disk. Implementations own the transport session
/// for the duration of each call.
#[async_trait]
pub trait DiskSync: Send + Sync {
    async fn full_copy(&self, job: &DiskJob, cancel: &CancellationToken) -> Result<()>;

    async fn copy_changes(
        &self,
        job: &DiskJob,
        changes: &ChangeSet,
        cancel: &CancellationToken,
    ) -> Result<CopyStats>;
}
