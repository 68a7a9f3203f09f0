//! Turns a changed extent into the minimal ordered list of flag-tagged blocks
//! the copy engine should act on.

use crate::block::{Block, BlockFlags, BlockSource, Extent};
use crate::config::CopyLimits;
use crate::{log_debug, log_warn};

pub struct BlockStatusResolver {
    min_status_extent: u64,
    max_status_request: u64,
}

impl BlockStatusResolver {
    pub fn new(limits: &CopyLimits) -> Self {
        Self {
            min_status_extent: limits.min_status_extent,
            max_status_request: limits.max_status_request.clamp(1, u64::from(u32::MAX)),
        }
    }

    /// Resolve `extent` into disjoint blocks that exactly cover it. Status
    /// failures never surface: the unresolved remainder of the current
    /// status request is reported as allocated data instead.
    pub async fn resolve(&self, source: &mut dyn BlockSource, extent: Extent) -> Vec<Block> {
        let mut blocks = BlockRun::default();
        if extent.is_empty() {
            return blocks.into_blocks();
        }
        if extent.length < self.min_status_extent {
            blocks.push(extent.offset, extent.length, BlockFlags::DATA);
            return blocks.into_blocks();
        }

        let end = extent.end();
        let mut chunk_start = extent.offset;
        while chunk_start < end {
            let chunk_end = end.min(chunk_start.saturating_add(self.max_status_request));
            let mut pos = chunk_start;

            while pos < chunk_end {
                // Bounded by max_status_request, which fits in u32.
                let want = (chunk_end - pos) as u32;
                let descriptor = match source.block_status(pos, want).await {
                    Ok(descriptors) => descriptors.into_iter().next(),
                    Err(err) => {
                        log_warn!(
                            offset = pos,
                            length = chunk_end - pos,
                            error = %err,
                            "block status failed, copying range as data"
                        );
                        None
                    }
                };

                match descriptor {
                    Some(descriptor) if descriptor.length > 0 => {
                        let length = u64::from(descriptor.length).min(chunk_end - pos);
                        blocks.push(pos, length, descriptor.flags);
                        pos += length;
                    }
                    other => {
                        if other.is_some() {
                            log_warn!(offset = pos, "block status did not advance, copying range as data");
                        }
                        blocks.push(pos, chunk_end - pos, BlockFlags::DATA);
                        pos = chunk_end;
                    }
                }
            }
            chunk_start = chunk_end;
        }

        let blocks = blocks.into_blocks();
        log_debug!(
            offset = extent.offset,
            length = extent.length,
            blocks = blocks.len(),
            "resolved extent"
        );
        blocks
    }
}

/// Accumulates blocks, merging contiguous neighbours with equal flags.
#[derive(Default)]
struct BlockRun {
    blocks: Vec<Block>,
}

impl BlockRun {
    fn push(&mut self, offset: u64, length: u64, flags: BlockFlags) {
        if length == 0 {
            return;
        }
        if let Some(last) = self.blocks.last_mut() {
            if last.flags == flags && last.end() == offset {
                last.length += length;
                return;
            }
        }
        self.blocks.push(Block::new(offset, length, flags));
    }

    fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }
}
