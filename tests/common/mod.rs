// Shared fakes for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use vmigrate::MigrationError;
use vmigrate::block::{BlockFlags, BlockSource, ChangeSet, StatusDescriptor};
use vmigrate::collaborators::{
    CutoverExecutor, DiskConverter, DiskJob, DiskSync, HypervisorConnector, PreflightCheck,
    SnapshotInfo, SourceHypervisor, ValidationGate, ValidationState,
};
use vmigrate::copy::CopyStats;
use vmigrate::error::{CopyError, NbdError, TransportError};
use vmigrate::events::EventLog;
use vmigrate::preflight::PreflightReport;
use vmigrate::reconcile::{
    Collaborators, DiskSpec, MigrationKind, MigrationRecord, MigrationStrategy, VmRef,
};
use vmigrate::session_cache::SessionCache;
use vmigrate::target::{BlockTarget, Deallocation};
use vmigrate::transport::{Credentials, EndpointKind, Password};

/// An in-memory disk with an explicit allocation map.
pub struct MemorySource {
    pub data: Vec<u8>,
    /// `(length, flags)` runs covering the whole disk, in order.
    pub allocation: Vec<(u64, BlockFlags)>,
    /// Caps the length of every status descriptor.
    pub max_descriptor: Option<u32>,
    pub fail_status: bool,
    /// Fail the n-th read call (0-based).
    pub fail_read_call: Option<usize>,
    pub reads: Vec<(u64, usize)>,
    pub status_calls: Vec<(u64, u32)>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>, allocation: Vec<(u64, BlockFlags)>) -> Self {
        Self {
            data,
            allocation,
            max_descriptor: None,
            fail_status: false,
            fail_read_call: None,
            reads: Vec::new(),
            status_calls: Vec::new(),
        }
    }

    /// A disk of `size` bytes, every byte `fill`, entirely allocated.
    pub fn filled(size: u64, fill: u8) -> Self {
        Self::new(vec![fill; size as usize], vec![(size, BlockFlags::DATA)])
    }

    fn run_at(&self, offset: u64) -> Option<(u64, BlockFlags)> {
        let mut start = 0;
        for (length, flags) in &self.allocation {
            if offset < start + length {
                return Some((start + length - offset, *flags));
            }
            start += length;
        }
        None
    }
}

#[async_trait]
impl BlockSource for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), NbdError> {
        let call = self.reads.len();
        self.reads.push((offset, buf.len()));
        if self.fail_read_call == Some(call) {
            return Err(NbdError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "endpoint went away",
            )));
        }
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(NbdError::Protocol("read past end of export".into()));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    async fn block_status(
        &mut self,
        offset: u64,
        length: u32,
    ) -> Result<Vec<StatusDescriptor>, NbdError> {
        self.status_calls.push((offset, length));
        if self.fail_status {
            return Err(NbdError::BlockStatusUnsupported);
        }
        let (remaining, flags) = self
            .run_at(offset)
            .ok_or_else(|| NbdError::Protocol("status past end of export".into()))?;
        let mut described = remaining.min(u64::from(length)) as u32;
        if let Some(cap) = self.max_descriptor {
            described = described.min(cap);
        }
        Ok(vec![StatusDescriptor {
            length: described,
            flags,
        }])
    }
}

/// Describes a huge disk without backing bytes. Reads are not allowed.
pub struct StatusOnlySource {
    pub size: u64,
    pub flags: BlockFlags,
    pub status_calls: Vec<(u64, u32)>,
}

#[async_trait]
impl BlockSource for StatusOnlySource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&mut self, _offset: u64, _buf: &mut [u8]) -> Result<(), NbdError> {
        Err(NbdError::Protocol("status-only source".into()))
    }

    async fn block_status(
        &mut self,
        offset: u64,
        length: u32,
    ) -> Result<Vec<StatusDescriptor>, NbdError> {
        self.status_calls.push((offset, length));
        Ok(vec![StatusDescriptor {
            length,
            flags: self.flags,
        }])
    }
}

pub struct MemoryTarget {
    pub data: Vec<u8>,
    pub supports_deallocate: bool,
    pub writes: Vec<(u64, usize)>,
    pub deallocations: Vec<(u64, u64)>,
    pub flushes: usize,
}

impl MemoryTarget {
    pub fn new(size: u64, fill: u8) -> Self {
        Self {
            data: vec![fill; size as usize],
            supports_deallocate: true,
            writes: Vec::new(),
            deallocations: Vec::new(),
            flushes: 0,
        }
    }
}

#[async_trait]
impl BlockTarget for MemoryTarget {
    async fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "write past end"));
        }
        self.writes.push((offset, buf.len()));
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    async fn deallocate(&mut self, offset: u64, length: u64) -> io::Result<Deallocation> {
        if !self.supports_deallocate {
            return Ok(Deallocation::Unsupported);
        }
        self.deallocations.push((offset, length));
        self.data[offset as usize..(offset + length) as usize].fill(0);
        Ok(Deallocation::Done)
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

pub fn credentials() -> Credentials {
    Credentials {
        endpoint: "esx01.lab.local".into(),
        username: "root".into(),
        password: Password::new("s3cret-pw"),
        thumbprint: "01:23:45:67".into(),
        kind: EndpointKind::Host,
    }
}

pub fn record(kind: MigrationKind, disks: usize) -> MigrationRecord {
    let disks = (0..disks)
        .map(|index| DiskSpec {
            key: format!("{}", 2000 + index),
            path: format!("[datastore1] web01/web01_{}.vmdk", index),
            capacity_bytes: 1 << 30,
            destination: format!("/dev/mapper/vol{}", index).into(),
            change_id: None,
        })
        .collect();
    MigrationRecord::new(
        VmRef {
            name: "web01".into(),
            moref: "vm-1042".into(),
        },
        disks,
        MigrationStrategy {
            kind,
            ..MigrationStrategy::default()
        },
    )
}

#[derive(Default)]
pub struct FakeHypervisor {
    pub power_offs: AtomicUsize,
    pub snapshots: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    /// Change sets handed out one per `changed_extents` call; empty after.
    pub changes: Mutex<VecDeque<ChangeSet>>,
    pub since: Mutex<Vec<String>>,
}

impl FakeHypervisor {
    pub fn with_changes(changes: Vec<ChangeSet>) -> Self {
        Self {
            changes: Mutex::new(changes.into()),
            ..Self::default()
        }
    }

    pub fn power_offs(&self) -> usize {
        self.power_offs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceHypervisor for FakeHypervisor {
    async fn power_off(&self, _vm: &VmRef) -> vmigrate::Result<()> {
        self.power_offs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_snapshot(&self, _vm: &VmRef, name: &str) -> vmigrate::Result<SnapshotInfo> {
        let mut snapshots = self.snapshots.lock().unwrap();
        snapshots.push(name.to_string());
        let generation = snapshots.len();
        let change_ids: HashMap<String, String> = (0..8)
            .map(|index| {
                (
                    format!("{}", 2000 + index),
                    format!("52 de 4c 11/{}", generation),
                )
            })
            .collect();
        Ok(SnapshotInfo {
            moref: format!("snapshot-{}", generation),
            change_ids,
        })
    }

    async fn changed_extents(
        &self,
        _vm: &VmRef,
        _snapshot: &SnapshotInfo,
        _disk: &DiskSpec,
        since_change_id: &str,
    ) -> vmigrate::Result<ChangeSet> {
        self.since.lock().unwrap().push(since_change_id.to_string());
        Ok(self.changes.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn remove_snapshot(&self, _vm: &VmRef, snapshot: &SnapshotInfo) -> vmigrate::Result<()> {
        self.removed.lock().unwrap().push(snapshot.moref.clone());
        Ok(())
    }
}

pub struct FakeConnector {
    pub hypervisor: Arc<FakeHypervisor>,
    pub connects: AtomicUsize,
    pub fail_first: usize,
}

#[async_trait]
impl HypervisorConnector for FakeConnector {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> vmigrate::Result<Arc<dyn SourceHypervisor>> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(TransportError::Authentication(credentials.endpoint.clone()).into());
        }
        Ok(self.hypervisor.clone())
    }
}

pub struct FakeGate(pub Mutex<ValidationState>);

#[async_trait]
impl ValidationGate for FakeGate {
    async fn validation_state(&self, _record: &MigrationRecord) -> vmigrate::Result<ValidationState> {
        Ok(self.0.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakePreflight {
    pub issues: Vec<String>,
}

#[async_trait]
impl PreflightCheck for FakePreflight {
    async fn check(&self, _record: &MigrationRecord) -> vmigrate::Result<PreflightReport> {
        Ok(PreflightReport {
            issues: self.issues.clone(),
            ..PreflightReport::default()
        })
    }
}

#[derive(Default)]
pub struct FakeDiskSync {
    pub full_copies: Mutex<Vec<DiskJobSummary>>,
    pub incremental: Mutex<Vec<(String, ChangeSet)>>,
    pub fail_full_copies: AtomicUsize,
    /// Block full copies until cancelled.
    pub hang: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskJobSummary {
    pub disk_path: String,
    pub snapshot: Option<String>,
}

#[async_trait]
impl DiskSync for FakeDiskSync {
    async fn full_copy(&self, job: &DiskJob, cancel: &CancellationToken) -> vmigrate::Result<()> {
        if self.hang {
            cancel.cancelled().await;
            return Err(CopyError::Cancelled.into());
        }
        let remaining = self.fail_full_copies.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_full_copies.store(remaining - 1, Ordering::SeqCst);
            return Err(CopyError::Read {
                offset: 0,
                length: 4096,
                source: NbdError::Protocol("connection reset".into()),
            }
            .into());
        }
        job.progress.set_total(1 << 30);
        job.progress.set_percent(100);
        self.full_copies.lock().unwrap().push(DiskJobSummary {
            disk_path: job.disk.disk_path.clone(),
            snapshot: job.disk.snapshot_moref.clone(),
        });
        Ok(())
    }

    async fn copy_changes(
        &self,
        job: &DiskJob,
        changes: &ChangeSet,
        _cancel: &CancellationToken,
    ) -> vmigrate::Result<CopyStats> {
        self.incremental
            .lock()
            .unwrap()
            .push((job.disk.disk_path.clone(), changes.clone()));
        Ok(CopyStats {
            data_blocks: changes.extents.len() as u64,
            bytes_written: changes.total_bytes(),
            ..CopyStats::default()
        })
    }
}

#[derive(Default)]
pub struct FakeConverter {
    pub fail_first: usize,
    pub calls: AtomicUsize,
}

#[async_trait]
impl DiskConverter for FakeConverter {
    async fn convert(&self, _record: &MigrationRecord) -> vmigrate::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(MigrationError::Conversion("virt-v2v exited with 1".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCutover {
    pub calls: AtomicUsize,
}

#[async_trait]
impl CutoverExecutor for FakeCutover {
    async fn cut_over(&self, _record: &MigrationRecord) -> vmigrate::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Every fake wired into one set of collaborators, with handles kept for
/// assertions.
pub struct Harness {
    pub hypervisor: Arc<FakeHypervisor>,
    pub connector: Arc<FakeConnector>,
    pub gate: Arc<FakeGate>,
    pub preflight: Arc<FakePreflight>,
    pub disk_sync: Arc<FakeDiskSync>,
    pub converter: Arc<FakeConverter>,
    pub cutover: Arc<FakeCutover>,
    pub events: Arc<EventLog>,
}

impl Harness {
    pub fn new(hypervisor: FakeHypervisor) -> Self {
        Self::with(hypervisor, FakeDiskSync::default(), FakeConverter::default(), 0)
    }

    pub fn with(
        hypervisor: FakeHypervisor,
        disk_sync: FakeDiskSync,
        converter: FakeConverter,
        failed_logins: usize,
    ) -> Self {
        let hypervisor = Arc::new(hypervisor);
        Self {
            connector: Arc::new(FakeConnector {
                hypervisor: hypervisor.clone(),
                connects: AtomicUsize::new(0),
                fail_first: failed_logins,
            }),
            hypervisor,
            gate: Arc::new(FakeGate(Mutex::new(ValidationState::Validated))),
            preflight: Arc::new(FakePreflight::default()),
            disk_sync: Arc::new(disk_sync),
            converter: Arc::new(converter),
            cutover: Arc::new(FakeCutover::default()),
            events: Arc::new(EventLog::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            connector: self.connector.clone(),
            sessions: Arc::new(SessionCache::new()),
            validation: self.gate.clone(),
            preflight: self.preflight.clone(),
            disk_sync: self.disk_sync.clone(),
            converter: self.converter.clone(),
            cutover: self.cutover.clone(),
            events: self.events.clone(),
        }
    }
}
