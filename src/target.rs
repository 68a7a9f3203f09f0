use crate::log_debug;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::{FallocateFlags, fallocate};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task;

/// Outcome of a deallocate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deallocation {
    /// The range now reads as zeroes.
    Done,
    /// The destination cannot deallocate; the caller must write zeroes.
    Unsupported,
}

/// Write side of a copy: the pre-sized destination volume.
#[async_trait]
pub trait BlockTarget: Send {
    async fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Release `length` bytes at `offset` so they read back as zeroes.
    async fn deallocate(&mut self, offset: u64, length: u64) -> io::Result<Deallocation>;

    async fn flush(&mut self) -> io::Result<()>;
}

/// A raw destination: a block device or a preallocated image file.
///
/// Every syscall runs on the blocking pool so a slow destination never stalls
/// the NBD reads of other disks sharing the runtime.
pub struct FileTarget {
    path: PathBuf,
    file: Arc<File>,
}

impl FileTarget {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self {
            path,
            file: Arc::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn run_blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(f).await.map_err(io::Error::other)?
}

#[async_trait]
impl BlockTarget for FileTarget {
    async fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        let buf = buf.to_vec();
        run_blocking(move || file.write_all_at(&buf, offset)).await
    }

    async fn deallocate(&mut self, offset: u64, length: u64) -> io::Result<Deallocation> {
        let (Ok(start), Ok(len)) = (i64::try_from(offset), i64::try_from(length)) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range exceeds off_t",
            ));
        };
        let file = Arc::clone(&self.file);
        let mode = FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE;
        let punched = run_blocking(move || Ok(fallocate(file.as_raw_fd(), mode, start, len))).await?;
        match punched {
            Ok(()) => Ok(Deallocation::Done),
            Err(Errno::EOPNOTSUPP) | Err(Errno::ENOSYS) => {
                log_debug!(path = %self.path.display(), "destination does not support hole punching");
                Ok(Deallocation::Unsupported)
            }
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        run_blocking(move || file.sync_data()).await
    }
}
