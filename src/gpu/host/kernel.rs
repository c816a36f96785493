use std::ops::Range;

use bytemuck::Pod;
use thiserror::Error;

use super::memory::Arena;
use crate::gpu::driver::binding::BindingKind;

/// A failure raised from inside a kernel. Faults are fatal to the device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelFault {
    #[error("nothing is bound at ({set}, {binding})")]
    MissingBinding { set: u32, binding: u32 },
    #[error("element {index} is out of bounds of ({set}, {binding})")]
    OutOfBounds { set: u32, binding: u32, index: u64 },
    #[error("({set}, {binding}) is bound read-only")]
    ReadOnly { set: u32, binding: u32 },
    #[error("{0}")]
    Abort(String),
}

/// A compute program of the host backend, run once per workgroup.
pub trait HostKernel: Send + Sync {
    fn run(&self, invocation: &mut KernelInvocation<'_>) -> Result<(), KernelFault>;
}

impl<F> HostKernel for F
where
    F: Fn(&mut KernelInvocation<'_>) -> Result<(), KernelFault> + Send + Sync,
{
    fn run(&self, invocation: &mut KernelInvocation<'_>) -> Result<(), KernelFault> {
        self(invocation)
    }
}

/// A bound range resolved against device memory for one dispatch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResolvedSlot {
    pub set: u32,
    pub binding: u32,
    pub kind: BindingKind,
    pub alloc_id: u32,
    pub offset: u64,
    pub len: u64,
}

impl ResolvedSlot {
    fn element(&self, index: u64, width: usize) -> Option<Range<usize>> {
        let start = index.checked_mul(width as u64)?;
        let end = start.checked_add(width as u64)?;
        if end > self.len {
            return None;
        }
        Some((self.offset + start) as usize..(self.offset + end) as usize)
    }
}

/// What a kernel sees of one workgroup: its coordinates and the bound memory.
pub struct KernelInvocation<'a> {
    group_id: [u32; 3],
    num_groups: [u32; 3],
    slots: &'a [ResolvedSlot],
    memory: &'a mut Arena,
}

impl<'a> KernelInvocation<'a> {
    pub(crate) fn new(
        group_id: [u32; 3],
        num_groups: [u32; 3],
        slots: &'a [ResolvedSlot],
        memory: &'a mut Arena,
    ) -> Self {
        Self {
            group_id,
            num_groups,
            slots,
            memory,
        }
    }

    pub fn group_id(&self) -> [u32; 3] {
        self.group_id
    }

    pub fn num_groups(&self) -> [u32; 3] {
        self.num_groups
    }

    /// Linear index of this workgroup, x fastest.
    pub fn flat_group_index(&self) -> u64 {
        let [x, y, z] = self.group_id;
        let [nx, ny, _] = self.num_groups;
        (z as u64 * ny as u64 + y as u64) * nx as u64 + x as u64
    }

    /// Byte length of the range bound at `(set, binding)`.
    pub fn binding_len(&self, set: u32, binding: u32) -> Option<u64> {
        self.find(set, binding).map(|s| s.len)
    }

    fn find(&self, set: u32, binding: u32) -> Option<&ResolvedSlot> {
        self.slots
            .iter()
            .find(|s| s.set == set && s.binding == binding)
    }

    fn slot(&self, set: u32, binding: u32) -> Result<ResolvedSlot, KernelFault> {
        self.find(set, binding)
            .copied()
            .ok_or(KernelFault::MissingBinding { set, binding })
    }

    pub fn load<T: Pod>(&self, set: u32, binding: u32, index: u64) -> Result<T, KernelFault> {
        let slot = self.slot(set, binding)?;
        let oob = KernelFault::OutOfBounds {
            set,
            binding,
            index,
        };
        let range = slot
            .element(index, std::mem::size_of::<T>())
            .ok_or(oob.clone())?;
        let bytes = self
            .memory
            .bytes(slot.alloc_id)
            .and_then(|b| b.get(range))
            .ok_or(oob)?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn store<T: Pod>(
        &mut self,
        set: u32,
        binding: u32,
        index: u64,
        value: T,
    ) -> Result<(), KernelFault> {
        let slot = self.slot(set, binding)?;
        if !slot.kind.is_writable() {
            return Err(KernelFault::ReadOnly { set, binding });
        }
        let oob = KernelFault::OutOfBounds {
            set,
            binding,
            index,
        };
        let range = slot
            .element(index, std::mem::size_of::<T>())
            .ok_or(oob.clone())?;
        let bytes = self
            .memory
            .bytes_mut(slot.alloc_id)
            .and_then(|b| b.get_mut(range))
            .ok_or(oob)?;
        bytes.copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots() -> Vec<ResolvedSlot> {
        vec![
            ResolvedSlot {
                set: 0,
                binding: 0,
                kind: BindingKind::Buffer,
                alloc_id: 1,
                offset: 0,
                len: 16,
            },
            ResolvedSlot {
                set: 0,
                binding: 1,
                kind: BindingKind::RwBuffer,
                alloc_id: 2,
                offset: 4,
                len: 8,
            },
        ]
    }

    #[test]
    fn load_store_respect_slots() {
        let mut arena = Arena::new(None);
        arena.insert(1, 16, None).unwrap();
        arena.insert(2, 12, None).unwrap();
        arena.bytes_mut(1).unwrap()[4..8].copy_from_slice(&7u32.to_le_bytes());

        let slots = slots();
        let mut inv = KernelInvocation::new([0, 0, 0], [1, 1, 1], &slots, &mut arena);
        assert_eq!(inv.load::<u32>(0, 0, 1), Ok(7));
        assert_eq!(inv.binding_len(0, 1), Some(8));

        inv.store(0, 1, 1, 9u32).unwrap();
        assert_eq!(inv.load::<u32>(0, 1, 1), Ok(9));
        assert_eq!(
            inv.store(0, 1, 2, 1u32),
            Err(KernelFault::OutOfBounds {
                set: 0,
                binding: 1,
                index: 2
            })
        );
        assert_eq!(
            inv.store(0, 0, 0, 1u32),
            Err(KernelFault::ReadOnly { set: 0, binding: 0 })
        );
        assert_eq!(
            inv.load::<u32>(3, 0, 0),
            Err(KernelFault::MissingBinding { set: 3, binding: 0 })
        );

        assert_eq!(&arena.bytes(2).unwrap()[8..12], &9u32.to_le_bytes());
    }

    #[test]
    fn flat_index_is_x_major() {
        let mut arena = Arena::new(None);
        let inv = KernelInvocation::new([1, 2, 1], [4, 3, 2], &[], &mut arena);
        assert_eq!(inv.flat_group_index(), (1 * 3 + 2) * 4 + 1);
    }
}
