use std::collections::BTreeMap;
use std::sync::Arc;

#[cfg(feature = "dashi-serde")]
use serde::Serialize;

use super::types::{DeviceAllocation, DevicePtr, ImageSamplerConfig, WHOLE_SIZE};
use crate::gpu::error::{GpuError, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub enum BindingKind {
    /// Read-only storage or uniform buffer.
    Buffer,
    /// Unordered-access buffer.
    RwBuffer,
    Image,
}

impl BindingKind {
    /// Whether a resource bound as `self` satisfies a slot declared as `declared`.
    pub fn satisfies(&self, declared: BindingKind) -> bool {
        match declared {
            BindingKind::Buffer => matches!(self, BindingKind::Buffer | BindingKind::RwBuffer),
            BindingKind::RwBuffer => *self == BindingKind::RwBuffer,
            BindingKind::Image => *self == BindingKind::Image,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, BindingKind::RwBuffer | BindingKind::Image)
    }
}

/// One slot a pipeline declares.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub struct BindingLayout {
    pub set: u32,
    pub binding: u32,
    pub kind: BindingKind,
}

impl BindingLayout {
    pub fn buffer(set: u32, binding: u32) -> Self {
        Self {
            set,
            binding,
            kind: BindingKind::Buffer,
        }
    }

    pub fn rw_buffer(set: u32, binding: u32) -> Self {
        Self {
            set,
            binding,
            kind: BindingKind::RwBuffer,
        }
    }

    pub fn image(set: u32, binding: u32) -> Self {
        Self {
            set,
            binding,
            kind: BindingKind::Image,
        }
    }
}

/// A resource attached to a `(set, binding)` slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub struct BoundResource {
    pub set: u32,
    pub binding: u32,
    pub kind: BindingKind,
    pub ptr: DevicePtr,
    /// Byte length of the bound range, may be [`WHOLE_SIZE`].
    pub size: u64,
    pub sampler: Option<ImageSamplerConfig>,
}

/// Accumulates slot bindings for one dispatch.
///
/// The binder is a plain table; nothing is validated against the device
/// until the bindings are replayed.
#[derive(Debug, Clone, Default)]
pub struct ResourceBinder {
    table: BTreeMap<(u32, u32), BoundResource>,
    layout: Option<Arc<[BindingLayout]>>,
}

impl ResourceBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_layout(layout: Arc<[BindingLayout]>) -> Self {
        Self {
            table: BTreeMap::new(),
            layout: Some(layout),
        }
    }

    /// Slots declared by the pipeline this binder was created from.
    pub fn layout(&self) -> Option<&[BindingLayout]> {
        self.layout.as_deref()
    }

    fn insert(&mut self, set: u32, binding: u32, kind: BindingKind, ptr: DevicePtr, size: u64) {
        self.table.insert(
            (set, binding),
            BoundResource {
                set,
                binding,
                kind,
                ptr,
                size,
                sampler: None,
            },
        );
    }

    pub fn buffer(&mut self, set: u32, binding: u32, ptr: DevicePtr, size: u64) -> &mut Self {
        self.insert(set, binding, BindingKind::Buffer, ptr, size);
        self
    }

    pub fn buffer_alloc(&mut self, set: u32, binding: u32, alloc: DeviceAllocation) -> &mut Self {
        self.buffer(set, binding, alloc.ptr(0), WHOLE_SIZE)
    }

    pub fn rw_buffer(&mut self, set: u32, binding: u32, ptr: DevicePtr, size: u64) -> &mut Self {
        self.insert(set, binding, BindingKind::RwBuffer, ptr, size);
        self
    }

    pub fn rw_buffer_alloc(
        &mut self,
        set: u32,
        binding: u32,
        alloc: DeviceAllocation,
    ) -> &mut Self {
        self.rw_buffer(set, binding, alloc.ptr(0), WHOLE_SIZE)
    }

    pub fn image(
        &mut self,
        set: u32,
        binding: u32,
        alloc: DeviceAllocation,
        sampler_config: ImageSamplerConfig,
    ) -> &mut Self {
        self.table.insert(
            (set, binding),
            BoundResource {
                set,
                binding,
                kind: BindingKind::Image,
                ptr: alloc.ptr(0),
                size: WHOLE_SIZE,
                sampler: Some(sampler_config),
            },
        );
        self
    }

    pub fn vertex_buffer(&mut self, _ptr: DevicePtr, _binding: u32) -> Result<()> {
        Err(GpuError::Unsupported("vertex buffers outside a raster pipeline"))
    }

    pub fn index_buffer(&mut self, _ptr: DevicePtr, _index_width: u32) -> Result<()> {
        Err(GpuError::Unsupported("index buffers outside a raster pipeline"))
    }

    pub fn get(&self, set: u32, binding: u32) -> Option<&BoundResource> {
        self.table.get(&(set, binding))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// Freeze the current table into an immutable snapshot.
    ///
    /// The binder keeps its table so it can serve as the base of the next one.
    pub fn materialize(&self) -> Bindings {
        Bindings {
            entries: self.table.values().copied().collect::<Vec<_>>().into(),
        }
    }
}

/// Immutable binding snapshot, ordered by `(set, binding)`.
///
/// Cloning is cheap and a snapshot may outlive the binder that produced it.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub struct Bindings {
    entries: Arc<[BoundResource]>,
}

impl Default for Bindings {
    fn default() -> Self {
        Self {
            entries: Vec::new().into(),
        }
    }
}

impl PartialEq for Bindings {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries) || self.entries[..] == other.entries[..]
    }
}

impl Eq for Bindings {}

impl Bindings {
    pub fn get(&self, set: u32, binding: u32) -> Option<&BoundResource> {
        self.entries
            .binary_search_by(|e| (e.set, e.binding).cmp(&(set, binding)))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoundResource> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every allocation referenced by the snapshot.
    pub fn allocations(&self) -> impl Iterator<Item = DeviceAllocation> + '_ {
        self.entries.iter().map(|e| e.ptr.alloc)
    }

    /// Check the snapshot against a pipeline's declared slots.
    ///
    /// Every declared slot must be bound with a compatible kind. Extra
    /// bindings are allowed.
    pub fn check_layout(&self, layout: &[BindingLayout]) -> Result<()> {
        for slot in layout {
            match self.get(slot.set, slot.binding) {
                None => {
                    return Err(GpuError::InvalidSequence(format!(
                        "slot ({}, {}) declared by the pipeline is not bound",
                        slot.set, slot.binding
                    )))
                }
                Some(bound) if !bound.kind.satisfies(slot.kind) => {
                    return Err(GpuError::InvalidSequence(format!(
                        "slot ({}, {}) expects {:?} but {:?} is bound",
                        slot.set, slot.binding, slot.kind, bound.kind
                    )))
                }
                Some(_) => {}
            }
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
            device: DeviceId(7),
            alloc_id: id,
        }
    }

    #[test]
    fn last_write_wins() {
        let mut binder = ResourceBinder::new();
        binder.buffer_alloc(0, 1, alloc(1));
        binder.rw_buffer(0, 1, alloc(2).ptr(16), 32);
        assert_eq!(binder.len(), 1);

        let snap = binder.materialize();
        let slot = snap.get(0, 1).unwrap();
        assert_eq!(slot.kind, BindingKind::RwBuffer);
        assert_eq!(slot.ptr, alloc(2).ptr(16));
        assert_eq!(slot.size, 32);
    }

    #[test]
    fn snapshots_are_independent_of_later_edits() {
        let mut binder = ResourceBinder::new();
        binder.buffer_alloc(0, 0, alloc(1));
        let first = binder.materialize();
        binder.rw_buffer_alloc(0, 0, alloc(3)).buffer_alloc(1, 0, alloc(4));
        let second = binder.materialize();

        assert_eq!(first.len(), 1);
        assert_eq!(first.get(0, 0).unwrap().ptr.alloc, alloc(1));
        assert_eq!(second.len(), 2);
        assert_ne!(first, second);
    }

    #[test]
    fn materialize_is_deterministic() {
        let mut binder = ResourceBinder::new();
        binder.buffer_alloc(1, 0, alloc(1)).rw_buffer_alloc(0, 2, alloc(2));
        let a = binder.materialize();
        let b = binder.materialize();
        assert_eq!(a, b);

        let order: Vec<_> = a.iter().map(|e| (e.set, e.binding)).collect();
        assert_eq!(order, vec![(0, 2), (1, 0)]);
    }

    #[test]
    fn clear_and_raster_slots() {
        let mut binder = ResourceBinder::new();
        binder.buffer_alloc(0, 0, alloc(1));
        binder.clear();
        assert!(binder.materialize().is_empty());
        assert!(matches!(
            binder.vertex_buffer(alloc(1).ptr(0), 0),
            Err(GpuError::Unsupported(_))
        ));
        assert!(matches!(
            binder.index_buffer(alloc(1).ptr(0), 32),
            Err(GpuError::Unsupported(_))
        ));
    }

    #[test]
    fn layout_compatibility() {
        let layout = [BindingLayout::buffer(0, 0), BindingLayout::rw_buffer(0, 1)];

        let mut binder = ResourceBinder::new();
        binder.rw_buffer_alloc(0, 0, alloc(1)).rw_buffer_alloc(0, 1, alloc(2));
        assert!(binder.materialize().check_layout(&layout).is_ok());

        binder.buffer_alloc(0, 1, alloc(2));
        assert!(matches!(
            binder.materialize().check_layout(&layout),
            Err(GpuError::InvalidSequence(_))
        ));

        let mut partial = ResourceBinder::new();
        partial.buffer_alloc(0, 0, alloc(1));
        assert!(partial.materialize().check_layout(&layout).is_err());
    }
}
