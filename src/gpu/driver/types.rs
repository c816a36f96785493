use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

#[cfg(feature = "dashi-serde")]
use serde::Serialize;

/// Size sentinel meaning "from the offset to the end of the allocation".
pub const WHOLE_SIZE: u64 = u64::MAX;

/// Process-unique identity of a device instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub struct DeviceId(pub(crate) u32);

impl DeviceId {
    pub(crate) fn next() -> Self {
        static NEXT_DEVICE: AtomicU32 = AtomicU32::new(1);
        Self(NEXT_DEVICE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device #{}", self.0)
    }
}

/// Opaque identifier of a block of device memory (buffer or image).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub struct DeviceAllocation {
    pub device: DeviceId,
    pub alloc_id: u32,
}

impl DeviceAllocation {
    /// Pointer to `offset` bytes into this allocation.
    pub fn ptr(&self, offset: u64) -> DevicePtr {
        DevicePtr {
            alloc: *self,
            offset,
        }
    }
}

impl fmt::Display for DeviceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocation #{} of {}", self.alloc_id, self.device)
    }
}

/// A byte offset into an allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub struct DevicePtr {
    pub alloc: DeviceAllocation,
    pub offset: u64,
}

impl DevicePtr {
    pub fn offset_by(&self, bytes: u64) -> DevicePtr {
        DevicePtr {
            alloc: self.alloc,
            offset: self.offset + bytes,
        }
    }
}

impl From<DeviceAllocation> for DevicePtr {
    fn from(alloc: DeviceAllocation) -> Self {
        alloc.ptr(0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub struct PipelineId {
    pub device: DeviceId,
    pub index: u32,
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline #{} of {}", self.index, self.device)
    }
}

/// Resolve `(offset, size)` against an object of `total` bytes, expanding
/// [`WHOLE_SIZE`]. Returns `None` when the range does not fit.
pub(crate) fn resolve_range(offset: u64, size: u64, total: u64) -> Option<(u64, u64)> {
    if offset > total {
        return None;
    }
    let size = if size == WHOLE_SIZE {
        total - offset
    } else {
        size
    };
    let end = offset.checked_add(size)?;
    if end > total {
        return None;
    }
    Some((offset, size))
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "dashi-serde", derive(Serialize))]
    pub struct AllocUsage: u32 {
        const STORAGE = 0x1;
        const UNIFORM = 0x2;
        const VERTEX  = 0x4;
        const INDEX   = 0x8;
    }
}

impl Default for AllocUsage {
    fn default() -> Self {
        AllocUsage::STORAGE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocParams {
    pub size: u64,
    pub host_write: bool,
    pub host_read: bool,
    pub export_sharing: bool,
    pub usage: AllocUsage,
}

impl Default for AllocParams {
    fn default() -> Self {
        Self {
            size: 0,
            host_write: false,
            host_read: false,
            export_sharing: false,
            usage: AllocUsage::STORAGE,
        }
    }
}

impl AllocParams {
    /// Device-only storage of `size` bytes.
    pub fn device_local(size: u64) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }

    /// Storage of `size` bytes the host can both read and write.
    pub fn host_visible(size: u64) -> Self {
        Self {
            size,
            host_write: true,
            host_read: true,
            ..Default::default()
        }
    }

    pub fn is_host_visible(&self) -> bool {
        self.host_write || self.host_read
    }
}

/// What the caller intends to do with a mapping.
///
/// Only matters on the staging path: `Read` skips the write-back on unmap
/// and `Write` skips the read-back on map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapAccess {
    Read,
    Write,
    #[default]
    ReadWrite,
}

impl MapAccess {
    pub fn reads_back(&self) -> bool {
        matches!(self, MapAccess::Read | MapAccess::ReadWrite)
    }

    pub fn writes_back(&self) -> bool {
        matches!(self, MapAccess::Write | MapAccess::ReadWrite)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub enum Format {
    R8Unorm,
    Rg8Unorm,
    #[default]
    Rgba8Unorm,
    R16Float,
    R32Uint,
    R32Sint,
    R32Float,
    Rg32Float,
    Rgba32Float,
}

impl Format {
    pub fn texel_size(&self) -> u64 {
        match self {
            Format::R8Unorm => 1,
            Format::Rg8Unorm | Format::R16Float => 2,
            Format::Rgba8Unorm | Format::R32Uint | Format::R32Sint | Format::R32Float => 4,
            Format::Rg32Float => 8,
            Format::Rgba32Float => 16,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub enum ImageDimension {
    D1,
    #[default]
    D2,
    D3,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub enum ImageLayout {
    #[default]
    Undefined,
    ShaderRead,
    ShaderWrite,
    ShaderReadWrite,
    ColorAttachment,
    DepthAttachment,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageParams {
    pub dimension: ImageDimension,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub initial_layout: ImageLayout,
    pub export_sharing: bool,
}

impl Default for ImageParams {
    fn default() -> Self {
        Self {
            dimension: ImageDimension::D2,
            format: Format::Rgba8Unorm,
            width: 1,
            height: 1,
            depth: 1,
            mip_levels: 1,
            initial_layout: ImageLayout::Undefined,
            export_sharing: false,
        }
    }
}

/// Extent of mip level `level` for an image of extent `dim`.
pub fn mip_dimensions(dim: [u32; 3], level: u32) -> [u32; 3] {
    let shrink = |v: u32| (v >> level.min(31)).max(1);
    [shrink(dim[0]), shrink(dim[1]), shrink(dim[2])]
}

impl ImageParams {
    pub fn extent(&self) -> [u32; 3] {
        [self.width, self.height, self.depth]
    }

    /// Bytes occupied by mip level `level`. `None` if the size overflows.
    pub fn level_size(&self, level: u32) -> Option<u64> {
        let [w, h, d] = mip_dimensions(self.extent(), level);
        (w as u64)
            .checked_mul(h as u64)?
            .checked_mul(d as u64)?
            .checked_mul(self.format.texel_size())
    }

    /// Byte offset of mip level `level` when all levels are packed back to back.
    pub fn level_offset(&self, level: u32) -> Option<u64> {
        (0..level).try_fold(0u64, |acc, l| acc.checked_add(self.level_size(l)?))
    }

    pub fn byte_size(&self) -> Option<u64> {
        self.level_offset(self.mip_levels)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub struct BufferImageCopyParams {
    /// Texels per buffer row; 0 means tightly packed.
    pub buf_row_length: u32,
    /// Rows per buffer image slice; 0 means tightly packed.
    pub buf_image_height: u32,
    pub image_offset: [u32; 3],
    pub image_extent: [u32; 3],
    pub image_mip_level: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub enum Filter {
    #[default]
    Nearest,
    Linear,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub enum AddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub struct ImageSamplerConfig {
    pub filter: Filter,
    pub address_mode: AddressMode,
}

/// What a device can do, copied into every command list it hands out.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceCaps {
    pub images: bool,
    pub raster: bool,
    /// Host-visible memory is mapped without a staging mirror.
    pub native_mapping: bool,
    pub max_dispatch_groups: [u32; 3],
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            images: false,
            raster: false,
            native_mapping: false,
            max_dispatch_groups: [65535; 3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_size_resolves_to_tail() {
        assert_eq!(resolve_range(16, WHOLE_SIZE, 64), Some((16, 48)));
        assert_eq!(resolve_range(0, 64, 64), Some((0, 64)));
        assert_eq!(resolve_range(1, 64, 64), None);
        assert_eq!(resolve_range(65, WHOLE_SIZE, 64), None);
        assert_eq!(resolve_range(8, u64::MAX - 1, 64), None);
    }

    #[test]
    fn mip_chain_is_packed() {
        let params = ImageParams {
            width: 8,
            height: 4,
            mip_levels: 3,
            format: Format::R32Float,
            ..Default::default()
        };
        assert_eq!(params.level_size(0), Some(8 * 4 * 4));
        assert_eq!(params.level_size(1), Some(4 * 2 * 4));
        assert_eq!(params.level_size(2), Some(2 * 1 * 4));
        assert_eq!(params.level_offset(2), Some(128 + 32));
        assert_eq!(params.byte_size(), Some(128 + 32 + 8));
    }

    #[test]
    fn huge_images_do_not_overflow() {
        let params = ImageParams {
            dimension: ImageDimension::D3,
            width: u32::MAX,
            height: u32::MAX,
            depth: u32::MAX,
            format: Format::Rgba32Float,
            ..Default::default()
        };
        assert_eq!(params.level_size(0), None);
        assert_eq!(params.byte_size(), None);
    }

    #[test]
    fn host_visibility() {
        assert!(AllocParams::host_visible(4).is_host_visible());
        assert!(!AllocParams::device_local(4).is_host_visible());
        assert!(MapAccess::ReadWrite.reads_back() && MapAccess::ReadWrite.writes_back());
        assert!(!MapAccess::Write.reads_back());
        assert!(!MapAccess::Read.writes_back());
    }
}
