//! Bulk and incremental disk copy against one transport endpoint.

use crate::block::{Block, BlockSource, ChangeSet};
use crate::config::CopyLimits;
use crate::error::CopyError;
use crate::process::ScopedChild;
use crate::resolver::BlockStatusResolver;
use crate::target::{BlockTarget, Deallocation};
use crate::transport::EndpointKind;
use crate::{log_debug, log_info, log_warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const STDERR_TAIL_LINES: usize = 20;

/// Running counters for observability. Never used for decisions.
#[derive(Debug, Default)]
pub struct CopyProgress {
    bytes_total: AtomicU64,
    bytes_copied: AtomicU64,
    bytes_zeroed: AtomicU64,
    percent: AtomicU64,
}

impl CopyProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_total(&self, bytes: u64) {
        self.bytes_total.store(bytes, Ordering::Relaxed);
    }

    pub fn add_copied(&self, bytes: u64) {
        self.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_zeroed(&self, bytes: u64) {
        self.bytes_zeroed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_percent(&self, percent: u64) {
        self.percent.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            bytes_zeroed: self.bytes_zeroed.load(Ordering::Relaxed),
            percent: self.percent.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub bytes_total: u64,
    pub bytes_copied: u64,
    pub bytes_zeroed: u64,
    pub percent: u64,
}

/// What one incremental pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CopyStats {
    pub data_blocks: u64,
    pub zero_blocks: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bytes_deallocated: u64,
    pub bytes_zero_filled: u64,
    pub read_calls: u64,
}

impl CopyStats {
    pub fn operations(&self) -> u64 {
        self.data_blocks + self.zero_blocks
    }

    pub fn merge(&mut self, other: &CopyStats) {
        self.data_blocks += other.data_blocks;
        self.zero_blocks += other.zero_blocks;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.bytes_deallocated += other.bytes_deallocated;
        self.bytes_zero_filled += other.bytes_zero_filled;
        self.read_calls += other.read_calls;
    }
}

/// Targeted copy of changed extents, one block at a time over a single
/// connection.
pub struct CopyEngine {
    resolver: BlockStatusResolver,
    chunk_size: u64,
    zero_chunk: u64,
    progress: Arc<CopyProgress>,
}

impl CopyEngine {
    pub fn new(kind: EndpointKind, limits: &CopyLimits, progress: Arc<CopyProgress>) -> Self {
        Self {
            resolver: BlockStatusResolver::new(limits),
            chunk_size: limits.chunk_for(kind).min(kind.max_chunk()),
            zero_chunk: limits.zero_chunk.max(1),
            progress,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Apply every extent of `changes`. The first failing chunk aborts the
    /// pass; whatever was already written stays, and re-running the pass
    /// converges on the same content.
    pub async fn copy_changes(
        &self,
        source: &mut dyn BlockSource,
        target: &mut dyn BlockTarget,
        changes: &ChangeSet,
    ) -> Result<CopyStats, CopyError> {
        let size = source.size();
        if let Some(extent) = changes
            .extents
            .iter()
            .find(|extent| extent.checked_end().is_none_or(|end| end > size))
        {
            return Err(CopyError::InvalidExtent {
                offset: extent.offset,
                length: extent.length,
                size,
            });
        }

        let mut stats = CopyStats::default();
        self.progress.set_total(changes.total_bytes());

        for extent in &changes.extents {
            let blocks = self.resolver.resolve(source, *extent).await;
            for block in &blocks {
                self.copy_block(source, target, block, &mut stats).await?;
            }
        }

        target.flush().await.map_err(|source| CopyError::Write {
            offset: 0,
            length: 0,
            source,
        })?;

        log_info!(
            extents = changes.extents.len(),
            data_blocks = stats.data_blocks,
            zero_blocks = stats.zero_blocks,
            bytes_written = stats.bytes_written,
            bytes_deallocated = stats.bytes_deallocated,
            "incremental copy pass complete"
        );
        Ok(stats)
    }

    pub async fn copy_block(
        &self,
        source: &mut dyn BlockSource,
        target: &mut dyn BlockTarget,
        block: &Block,
        stats: &mut CopyStats,
    ) -> Result<(), CopyError> {
        if block.is_zero() {
            self.zero_block(target, block, stats).await?;
            stats.zero_blocks += 1;
        } else {
            self.copy_data(source, target, block, stats).await?;
            stats.data_blocks += 1;
        }
        Ok(())
    }

    async fn copy_data(
        &self,
        source: &mut dyn BlockSource,
        target: &mut dyn BlockTarget,
        block: &Block,
        stats: &mut CopyStats,
    ) -> Result<(), CopyError> {
        let mut buffer = vec![0u8; self.chunk_size.min(block.length) as usize];
        let mut offset = block.offset;
        let end = block.end();

        while offset < end {
            // The tail of a block is usually shorter than a full chunk.
            let length = (end - offset).min(self.chunk_size);
            let chunk = &mut buffer[..length as usize];

            stats.read_calls += 1;
            source
                .read_at(offset, chunk)
                .await
                .map_err(|source| CopyError::Read {
                    offset,
                    length,
                    source,
                })?;
            stats.bytes_read += length;

            target
                .write_at(offset, chunk)
                .await
                .map_err(|source| CopyError::Write {
                    offset,
                    length,
                    source,
                })?;
            stats.bytes_written += length;
            self.progress.add_copied(length);
            offset += length;
        }
        Ok(())
    }

    async fn zero_block(
        &self,
        target: &mut dyn BlockTarget,
        block: &Block,
        stats: &mut CopyStats,
    ) -> Result<(), CopyError> {
        let outcome = target
            .deallocate(block.offset, block.length)
            .await
            .map_err(|source| CopyError::Zero {
                offset: block.offset,
                length: block.length,
                source,
            })?;

        match outcome {
            Deallocation::Done => {
                stats.bytes_deallocated += block.length;
            }
            Deallocation::Unsupported => {
                log_debug!(offset = block.offset, length = block.length, "writing explicit zeroes");
                let zeroes = vec![0u8; self.zero_chunk.min(block.length) as usize];
                let mut offset = block.offset;
                while offset < block.end() {
                    let length = (block.end() - offset).min(self.zero_chunk);
                    target
                        .write_at(offset, &zeroes[..length as usize])
                        .await
                        .map_err(|source| CopyError::Zero {
                            offset,
                            length,
                            source,
                        })?;
                    stats.bytes_zero_filled += length;
                    offset += length;
                }
            }
        }
        self.progress.add_zeroed(block.length);
        Ok(())
    }
}

/// Full first copy, delegated to an external sparse-aware copy program that
/// reads from the NBD endpoint and skips holes on a pre-zeroed destination.
pub struct BulkCopier {
    program: PathBuf,
    request_size: u64,
    queue_depth: usize,
    grace: Duration,
}

impl BulkCopier {
    pub fn new(program: impl Into<PathBuf>, request_size: u64, queue_depth: usize) -> Self {
        Self {
            program: program.into(),
            request_size,
            queue_depth: queue_depth.max(1),
            grace: Duration::from_secs(10),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn command(&self, socket: &Path, destination: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--destination-is-zero")
            .arg("--progress=1")
            .arg(format!("--request-size={}", self.request_size))
            .arg(format!("nbd+unix:///?socket={}", socket.display()))
            .arg(destination);
        command
    }

    pub async fn copy(
        &self,
        socket: &Path,
        destination: &Path,
        progress: &CopyProgress,
        cancel: &CancellationToken,
    ) -> Result<(), CopyError> {
        let mut command = self.command(socket, destination);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        log_info!(
            program = %self.program.display(),
            destination = %destination.display(),
            request_size = self.request_size,
            "starting bulk copy"
        );
        let mut child =
            ScopedChild::spawn("nbdcopy", &mut command).map_err(CopyError::BulkCopyIo)?;

        let (tx, mut rx) = mpsc::channel(self.queue_depth);
        let stdout = child.take_stdout();
        let reader = tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(percent) = parse_progress(&line) {
                    // Drop updates when the consumer lags; the pipe must keep
                    // draining or the copy process stalls.
                    let _ = tx.try_send(percent);
                }
            }
        });

        let stderr = child.take_stderr();
        let stderr_task = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let Some(stderr) = stderr else { return tail };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log_debug!(target: "vmigrate::nbdcopy", "{}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail
        });

        let mut last_logged = None;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status.map_err(CopyError::BulkCopyIo)?,
                Some(percent) = rx.recv() => {
                    report_progress(progress, destination, percent, &mut last_logged);
                }
                _ = cancel.cancelled() => {
                    log_warn!(destination = %destination.display(), "bulk copy cancelled");
                    child.terminate(self.grace).await.map_err(CopyError::BulkCopyIo)?;
                    reader.abort();
                    stderr_task.abort();
                    return Err(CopyError::Cancelled);
                }
            }
        };

        let _ = reader.await;
        while let Ok(percent) = rx.try_recv() {
            report_progress(progress, destination, percent, &mut last_logged);
        }
        let tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(CopyError::BulkCopyFailed {
                status,
                stderr: tail.into_iter().collect::<Vec<_>>().join("\n"),
            });
        }
        progress.set_percent(100);
        log_info!(destination = %destination.display(), "bulk copy complete");
        Ok(())
    }
}

fn report_progress(
    progress: &CopyProgress,
    destination: &Path,
    percent: u64,
    last_logged: &mut Option<u64>,
) {
    progress.set_percent(percent);
    if *last_logged != Some(percent) {
        log_info!(destination = %destination.display(), percent, "bulk copy progress");
        *last_logged = Some(percent);
    }
}

/// Parse a machine-readable progress line, `"<n>/100"`.
pub fn parse_progress(line: &str) -> Option<u64> {
    let (done, total) = line.trim().split_once('/')?;
    let done: u64 = done.trim().parse().ok()?;
    let total: u64 = total.trim().parse().ok()?;
    if total == 0 {
        return None;
    }
    Some((done.saturating_mul(100) / total).min(100))
}
