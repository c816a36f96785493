use std::collections::HashMap;
use std::ops::Range;

use crate::gpu::driver::types::{
    resolve_range, DeviceAllocation, DevicePtr, ImageLayout, ImageParams, WHOLE_SIZE,
};
use crate::gpu::error::{GpuError, Result};

#[derive(Debug, Clone, Copy)]
pub(crate) struct ImageState {
    pub params: ImageParams,
    pub layout: ImageLayout,
}

/// One block of emulated device memory.
#[derive(Debug)]
pub(crate) struct Block {
    pub bytes: Vec<u8>,
    pub image: Option<ImageState>,
}

/// Device-side memory of a host device, keyed by allocation id.
///
/// Only the worker thread and the staging copies in `map`/`unmap` touch it,
/// always under the device's memory lock.
#[derive(Debug, Default)]
pub(crate) struct Arena {
    blocks: HashMap<u32, Block>,
    live_bytes: u64,
    budget: Option<u64>,
}

/// A zeroed host byte vector, reporting allocation failure instead of aborting.
pub(crate) fn zeroed_bytes(size: u64) -> Result<Vec<u8>> {
    let len = usize::try_from(size).map_err(|_| {
        GpuError::OutOfMemory(format!("{size} bytes do not fit the host address space"))
    })?;
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(len)
        .map_err(|e| GpuError::OutOfMemory(e.to_string()))?;
    bytes.resize(len, 0);
    Ok(bytes)
}

fn to_range(offset: u64, size: u64) -> Range<usize> {
    offset as usize..(offset + size) as usize
}

impl Arena {
    pub fn new(budget: Option<u64>) -> Self {
        Self {
            blocks: HashMap::new(),
            live_bytes: 0,
            budget,
        }
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes
    }

    /// Check that `size` more bytes fit the budget.
    pub fn reserve(&self, size: u64) -> Result<()> {
        if let Some(budget) = self.budget {
            let wanted = self.live_bytes.saturating_add(size);
            if wanted > budget {
                return Err(GpuError::OutOfMemory(format!(
                    "{} bytes requested with {} of {} bytes in use",
                    size, self.live_bytes, budget
                )));
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, id: u32, size: u64, image: Option<ImageState>) -> Result<()> {
        self.reserve(size)?;
        let bytes = zeroed_bytes(size)?;
        self.live_bytes += size;
        self.blocks.insert(id, Block { bytes, image });
        Ok(())
    }

    pub fn free(&mut self, id: u32) -> bool {
        match self.blocks.remove(&id) {
            Some(block) => {
                self.live_bytes -= block.bytes.len() as u64;
                true
            }
            None => false,
        }
    }

    pub fn block(&self, alloc: DeviceAllocation) -> Result<&Block> {
        self.blocks
            .get(&alloc.alloc_id)
            .ok_or(GpuError::InvalidHandle(alloc))
    }

    pub fn block_mut(&mut self, alloc: DeviceAllocation) -> Result<&mut Block> {
        self.blocks
            .get_mut(&alloc.alloc_id)
            .ok_or(GpuError::InvalidHandle(alloc))
    }

    pub fn bytes(&self, id: u32) -> Option<&[u8]> {
        self.blocks.get(&id).map(|b| b.bytes.as_slice())
    }

    pub fn bytes_mut(&mut self, id: u32) -> Option<&mut [u8]> {
        self.blocks.get_mut(&id).map(|b| b.bytes.as_mut_slice())
    }

    /// Resolve `(ptr, size)` against a buffer block, returning `(offset, len)`.
    pub fn buffer_range(&self, ptr: DevicePtr, size: u64) -> Result<(u64, u64)> {
        let block = self.block(ptr.alloc)?;
        if block.image.is_some() {
            return Err(GpuError::InvalidArgument(format!(
                "{} is an image, not a buffer",
                ptr.alloc
            )));
        }
        resolve_range(ptr.offset, size, block.bytes.len() as u64).ok_or_else(|| {
            GpuError::InvalidArgument(format!(
                "range {}+{} is outside {} ({} bytes)",
                ptr.offset,
                if size == WHOLE_SIZE { 0 } else { size },
                ptr.alloc,
                block.bytes.len()
            ))
        })
    }

    pub fn read(&self, ptr: DevicePtr, dst: &mut [u8]) -> Result<()> {
        let (offset, len) = self.buffer_range(ptr, dst.len() as u64)?;
        let block = self.block(ptr.alloc)?;
        dst.copy_from_slice(&block.bytes[to_range(offset, len)]);
        Ok(())
    }

    pub fn write(&mut self, ptr: DevicePtr, src: &[u8]) -> Result<()> {
        let (offset, len) = self.buffer_range(ptr, src.len() as u64)?;
        let block = self.block_mut(ptr.alloc)?;
        block.bytes[to_range(offset, len)].copy_from_slice(src);
        Ok(())
    }

    /// Copy `size` bytes between buffers; the ranges may share a block.
    pub fn copy(&mut self, dst: DevicePtr, src: DevicePtr, size: u64) -> Result<()> {
        let (src_off, len) = self.buffer_range(src, size)?;
        let (dst_off, _) = self.buffer_range(dst, len)?;
        if dst.alloc == src.alloc {
            let block = self.block_mut(dst.alloc)?;
            block
                .bytes
                .copy_within(to_range(src_off, len), dst_off as usize);
            return Ok(());
        }
        let staged = self.block(src.alloc)?.bytes[to_range(src_off, len)].to_vec();
        self.block_mut(dst.alloc)?.bytes[to_range(dst_off, len)].copy_from_slice(&staged);
        Ok(())
    }

    /// Repeat the little-endian `word` over the range. A whole-size fill
    /// stops at the last complete word.
    pub fn fill(&mut self, ptr: DevicePtr, size: u64, word: u32) -> Result<()> {
        let (offset, mut len) = self.buffer_range(ptr, size)?;
        if size == WHOLE_SIZE {
            len &= !3;
        }
        let pattern = word.to_le_bytes();
        let block = self.block_mut(ptr.alloc)?;
        for chunk in block.bytes[to_range(offset, len)].chunks_mut(4) {
            chunk.copy_from_slice(&pattern[..chunk.len()]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::driver::types::DeviceId;

    fn alloc(id: u32) -> DeviceAllocation {
        DeviceAllocation {
            device: DeviceId(1),
            alloc_id: id,
        }
    }

    #[test]
    fn budget_is_enforced() {
        let mut arena = Arena::new(Some(64));
        arena.insert(1, 48, None).unwrap();
        assert!(matches!(
            arena.insert(2, 32, None),
            Err(GpuError::OutOfMemory(_))
        ));
        assert!(arena.free(1));
        arena.insert(2, 32, None).unwrap();
        assert_eq!(arena.live_bytes(), 32);
    }

    #[test]
    fn fill_whole_size_rounds_down() {
        let mut arena = Arena::new(None);
        arena.insert(1, 10, None).unwrap();
        arena.write(alloc(1).ptr(0), &[0xFF; 10]).unwrap();
        arena.fill(alloc(1).ptr(0), WHOLE_SIZE, 0x0403_0201).unwrap();
        assert_eq!(
            arena.bytes(1).unwrap(),
            &[1, 2, 3, 4, 1, 2, 3, 4, 0xFF, 0xFF]
        );
    }

    #[test]
    fn overlapping_copy() {
        let mut arena = Arena::new(None);
        arena.insert(1, 8, None).unwrap();
        arena.write(alloc(1).ptr(0), &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        arena.copy(alloc(1).ptr(2), alloc(1).ptr(0), 4).unwrap();
        assert_eq!(arena.bytes(1).unwrap(), &[1, 2, 1, 2, 3, 4, 7, 8]);
    }

    #[test]
    fn out_of_range_and_stale() {
        let mut arena = Arena::new(None);
        arena.insert(1, 8, None).unwrap();
        arena.insert(2, 8, None).unwrap();
        assert!(matches!(
            arena.copy(alloc(2).ptr(4), alloc(1).ptr(0), 8),
            Err(GpuError::InvalidArgument(_))
        ));
        arena.free(2);
        assert_eq!(
            arena.copy(alloc(2).ptr(0), alloc(1).ptr(0), 8),
            Err(GpuError::InvalidHandle(alloc(2)))
        );
    }
}
