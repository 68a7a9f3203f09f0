use crate::error::NbdError;
use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

bitflags! {
    /// Allocation state bits as reported by the `base:allocation` context.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct BlockFlags: u32 {
        const HOLE = 1 << 0;
        const ZERO = 1 << 1;
    }
}

impl BlockFlags {
    /// Allocated data that must be read and written.
    pub const DATA: BlockFlags = BlockFlags::empty();

    pub fn reads_as_zero(self) -> bool {
        self.intersects(BlockFlags::HOLE | BlockFlags::ZERO)
    }
}

/// A changed byte range reported by change tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

impl Extent {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// End offset, saturating at `u64::MAX`; see [`Extent::checked_end`].
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    /// End offset, or `None` when the range runs past `u64::MAX`.
    pub fn checked_end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// A resolved, flag-tagged sub-range of an [`Extent`]; the unit of copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub offset: u64,
    pub length: u64,
    pub flags: BlockFlags,
}

impl Block {
    pub fn new(offset: u64, length: u64, flags: BlockFlags) -> Self {
        Self {
            offset,
            length,
            flags,
        }
    }

    pub fn data(offset: u64, length: u64) -> Self {
        Self::new(offset, length, BlockFlags::DATA)
    }

    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    pub fn is_zero(&self) -> bool {
        self.flags.reads_as_zero()
    }
}

/// The extents to bring across for one incremental iteration, in the order
/// the hypervisor reported them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Change id the extents were computed against.
    #[serde(default)]
    pub since_change_id: Option<String>,
    /// Change id to persist once this set is applied.
    #[serde(default)]
    pub change_id: Option<String>,
    pub extents: Vec<Extent>,
}

impl ChangeSet {
    pub fn new(extents: Vec<Extent>) -> Self {
        Self {
            since_change_id: None,
            change_id: None,
            extents,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.extents
            .iter()
            .fold(0u64, |total, extent| total.saturating_add(extent.length))
    }

    pub fn is_empty(&self) -> bool {
        self.extents.iter().all(Extent::is_empty)
    }
}

/// One descriptor of a block status reply: `length` bytes starting at the
/// queried offset carry `flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusDescriptor {
    pub length: u32,
    pub flags: BlockFlags,
}

/// Read side of a copy: a disk exposed through the transport endpoint.
#[async_trait]
pub trait BlockSource: Send {
    /// Export size in bytes.
    fn size(&self) -> u64;

    /// Fill `buf` from `offset`. Short reads are errors.
    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), NbdError>;

    /// Allocation status starting at `offset`. Servers may describe less than
    /// `length`; only the first descriptor is guaranteed.
    async fn block_status(
        &mut self,
        offset: u64,
        length: u32,
    ) -> Result<Vec<StatusDescriptor>, NbdError>;
}
