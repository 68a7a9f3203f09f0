//! Production [`DiskSync`]: one transport session per call, released on
//! every exit path.

use crate::block::ChangeSet;
use crate::collaborators::{DiskJob, DiskSync};
use crate::config::{CopyLimits, MigrateConfig};
use crate::copy::{BulkCopier, CopyEngine, CopyStats};
use crate::error::{CopyError, MigrationError, TransportError};
use crate::nbd::NbdClient;
use crate::target::FileTarget;
use crate::transport::{TransportManager, TransportSession};
use crate::{Result, log_info, log_warn};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

pub struct TransportDiskSync {
    transport: TransportManager,
    limits: CopyLimits,
    nbdcopy_path: std::path::PathBuf,
    progress_queue_depth: usize,
    connect_timeout: Duration,
    grace: Duration,
}

impl TransportDiskSync {
    pub fn new(config: &MigrateConfig) -> Result<Self> {
        Ok(Self {
            transport: TransportManager::new(config.transport.clone()),
            limits: config.copy.limits()?,
            nbdcopy_path: config.copy.nbdcopy_path.clone(),
            progress_queue_depth: config.copy.progress_queue_depth,
            connect_timeout: Duration::from_secs(config.transport.connect_timeout_secs),
            grace: Duration::from_secs(config.transport.terminate_grace_secs),
        })
    }

    /// Wait for the endpoint to come up, unless the process dies or the
    /// attempt is cancelled first.
    async fn connect(
        &self,
        session: &mut TransportSession,
        cancel: &CancellationToken,
    ) -> std::result::Result<NbdClient<UnixStream>, CopyError> {
        let connected = tokio::select! {
            connected = NbdClient::connect_with_timeout(session.socket(), self.connect_timeout) => connected,
            _ = cancel.cancelled() => return Err(CopyError::Cancelled),
        };
        match connected {
            Ok(client) => Ok(client),
            Err(err) => {
                session.check_alive()?;
                Err(err.into())
            }
        }
    }

    async fn run_full_copy(
        &self,
        session: &mut TransportSession,
        job: &DiskJob,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), CopyError> {
        let client = self.connect(session, cancel).await?;
        job.progress.set_total(client.negotiated().size);
        if let Err(err) = client.disconnect().await {
            log_warn!(disk = %job.disk.disk_path, error = %err, "readiness probe disconnect failed");
        }

        let copier = BulkCopier::new(
            &self.nbdcopy_path,
            self.limits.chunk_for(session.endpoint_kind()),
            self.progress_queue_depth,
        )
        .with_grace(self.grace);
        copier
            .copy(session.socket(), &job.destination, &job.progress, cancel)
            .await
    }

    async fn run_copy_changes(
        &self,
        session: &mut TransportSession,
        job: &DiskJob,
        changes: &ChangeSet,
        cancel: &CancellationToken,
    ) -> std::result::Result<CopyStats, CopyError> {
        let mut client = self.connect(session, cancel).await?;
        let mut target =
            FileTarget::open(&job.destination).map_err(|source| CopyError::Destination {
                path: job.destination.clone(),
                source,
            })?;
        let engine = CopyEngine::new(
            session.endpoint_kind(),
            &self.limits,
            job.progress.clone(),
        );
        let killer = session.killer();

        let result = {
            let copy = engine.copy_changes(&mut client, &mut target, changes);
            tokio::pin!(copy);
            tokio::select! {
                result = &mut copy => result,
                _ = cancel.cancelled() => {
                    // The in-flight chunk fails once the endpoint is gone.
                    if let Some(killer) = killer {
                        killer.kill();
                    }
                    let _ = copy.await;
                    Err(CopyError::Cancelled)
                }
            }
        };

        if result.is_ok() {
            if let Err(err) = client.disconnect().await {
                log_warn!(disk = %job.disk.disk_path, error = %err, "NBD disconnect failed");
            }
        }
        result
    }
}

async fn close_session(session: &mut TransportSession) -> std::result::Result<(), TransportError> {
    session.close().await.inspect_err(|err| {
        log_warn!(disk = %session.disk().disk_path, error = %err, "failed to close disk transport");
    })
}

#[async_trait]
impl DiskSync for TransportDiskSync {
    async fn full_copy(&self, job: &DiskJob, cancel: &CancellationToken) -> Result<()> {
        let mut session = self.transport.open(&job.credentials, &job.disk).await?;
        let result = self.run_full_copy(&mut session, job, cancel).await;
        let closed = close_session(&mut session).await;
        result?;
        closed?;
        log_info!(disk = %job.disk.disk_path, "full copy finished");
        Ok(())
    }

    async fn copy_changes(
        &self,
        job: &DiskJob,
        changes: &ChangeSet,
        cancel: &CancellationToken,
    ) -> Result<CopyStats> {
        if changes.is_empty() {
            return Ok(CopyStats::default());
        }
        let mut session = self.transport.open(&job.credentials, &job.disk).await?;
        let result = self
            .run_copy_changes(&mut session, job, changes, cancel)
            .await;
        let closed = close_session(&mut session).await;
        let stats = result.map_err(MigrationError::from)?;
        closed?;
        Ok(stats)
    }
}
