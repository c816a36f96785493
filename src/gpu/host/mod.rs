//! Software backend.
//!
//! Device memory lives behind a worker thread that plays the part of the
//! GPU timeline. The host cannot map that memory directly, so host-visible
//! allocations carry a staging mirror that `map`/`unmap` copy through.
//! Compute programs are [`HostKernel`]s registered by entry-point name.

mod kernel;
mod memory;
mod sink;
mod stream;

use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Condvar, Mutex};

pub use kernel::{HostKernel, KernelFault, KernelInvocation};
pub use stream::HostStream;

use self::memory::{zeroed_bytes, Arena, ImageState};
use self::stream::Timeline;
use super::config::{AdapterPreference, DeviceConfig, DiagnosticSink, Severity};
use super::driver::pipeline::{Pipeline, PipelineSourceDesc, ShaderStage};
use super::driver::types::{
    resolve_range, AllocParams, AllocUsage, DeviceAllocation, DeviceCaps, DeviceId, DevicePtr,
    ImageDimension, ImageParams, MapAccess, PipelineId,
};
use super::error::{GpuError, Result};
use super::Device;
use crate::utils::{lock, Registry};

/// State shared between a [`HostDevice`] and its worker thread.
pub(crate) struct Shared {
    memory: Mutex<Arena>,
    pipelines: Mutex<Registry<Arc<dyn HostKernel>>>,
    timeline: Mutex<Timeline>,
    progress: Condvar,
    validation: bool,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl Shared {
    fn check_lost(&self) -> Result<()> {
        match &lock(&self.timeline).lost {
            Some(reason) => Err(GpuError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    offset: u64,
    len: u64,
    access: MapAccess,
}

impl Mapping {
    fn range(&self) -> Range<usize> {
        self.offset as usize..(self.offset + self.len) as usize
    }
}

#[derive(Debug)]
struct AllocationRecord {
    size: u64,
    image: bool,
    /// Present iff the allocation is host-visible.
    mirror: Option<Vec<u8>>,
    mapping: Option<Mapping>,
}

/// A software [`Device`].
pub struct HostDevice {
    id: DeviceId,
    name: String,
    caps: DeviceCaps,
    shared: Arc<Shared>,
    allocations: Registry<AllocationRecord>,
    kernels: HashMap<String, Arc<dyn HostKernel>>,
    stream: HostStream,
}

impl HostDevice {
    pub fn new(config: &DeviceConfig) -> Result<Self> {
        if config.device_index != 0 {
            return Err(GpuError::InvalidArgument(format!(
                "the host backend has one adapter, index {} requested",
                config.device_index
            )));
        }
        if matches!(
            config.adapter,
            AdapterPreference::Dedicated | AdapterPreference::Integrated
        ) {
            log::warn!(
                "{:?} adapter requested, using the host device",
                config.adapter
            );
        }

        let id = DeviceId::next();
        let caps = DeviceCaps {
            images: config.images,
            raster: false,
            native_mapping: false,
            max_dispatch_groups: [65535; 3],
        };
        let shared = Arc::new(Shared {
            memory: Mutex::new(Arena::new(config.memory_budget)),
            pipelines: Mutex::new(Registry::new()),
            timeline: Mutex::new(Timeline::default()),
            progress: Condvar::new(),
            validation: config.validation,
            diagnostics: config.diagnostic_sink(),
        });
        let stream = HostStream::new(id, caps, shared.clone())?;
        let name = "dashi host device".to_string();
        log::debug!("created {} ({}), validation: {}", name, id, config.validation);

        Ok(Self {
            id,
            name,
            caps,
            shared,
            allocations: Registry::new(),
            kernels: HashMap::new(),
            stream,
        })
    }

    /// Make `kernel` available to pipelines whose entry point is `entry_point`.
    ///
    /// Replacing a kernel does not affect pipelines already created.
    pub fn register_kernel<F>(&mut self, entry_point: &str, kernel: F)
    where
        F: Fn(&mut KernelInvocation<'_>) -> std::result::Result<(), KernelFault>
            + Send
            + Sync
            + 'static,
    {
        self.register_host_kernel(entry_point, Arc::new(kernel));
    }

    pub fn register_host_kernel(&mut self, entry_point: &str, kernel: Arc<dyn HostKernel>) {
        log::debug!("registered host kernel `{}`", entry_point);
        self.kernels.insert(entry_point.to_string(), kernel);
    }

    /// Bytes of device memory currently allocated.
    pub fn memory_in_use(&self) -> u64 {
        lock(&self.shared.memory).live_bytes()
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    fn diagnose(&self, text: &str) {
        if self.shared.validation {
            self.shared.diagnostics.message(Severity::Warning, text);
        }
    }

    fn check_owned(&self, alloc: DeviceAllocation) -> Result<()> {
        if alloc.device != self.id {
            return Err(GpuError::InvalidHandle(alloc));
        }
        Ok(())
    }

    fn insert_allocation(
        &mut self,
        record: AllocationRecord,
        image: Option<ImageState>,
    ) -> Result<DeviceAllocation> {
        let size = record.size;
        let mut memory = lock(&self.shared.memory);
        memory.reserve(size)?;
        let alloc_id = self
            .allocations
            .insert(record)
            .ok_or_else(|| GpuError::OutOfMemory("allocation ids exhausted".to_string()))?;
        if let Err(err) = memory.insert(alloc_id, size, image) {
            self.allocations.release(alloc_id);
            return Err(err);
        }
        Ok(DeviceAllocation {
            device: self.id,
            alloc_id,
        })
    }

    fn release_allocation(&mut self, alloc: DeviceAllocation, image: bool) -> Result<()> {
        self.shared.check_lost()?;
        self.check_owned(alloc)?;
        let record = self
            .allocations
            .get_ref(alloc.alloc_id)
            .ok_or(GpuError::InvalidHandle(alloc))?;
        if record.image != image {
            return Err(GpuError::InvalidArgument(format!(
                "{} is {}",
                alloc,
                if record.image { "an image" } else { "a buffer" }
            )));
        }
        if record.mapping.is_some() {
            log::warn!("releasing {} while it is mapped", alloc);
        }
        if self.stream.in_flight(alloc.alloc_id) {
            self.diagnose(&format!("{alloc} released while submitted work still uses it"));
        }
        self.stream.wait_for_use(alloc.alloc_id)?;

        self.allocations.release(alloc.alloc_id);
        lock(&self.shared.memory).free(alloc.alloc_id);
        log::debug!("released {}", alloc);
        Ok(())
    }
}

fn max_mip_levels(params: &ImageParams) -> u32 {
    let largest = params.width.max(params.height).max(params.depth);
    32 - largest.leading_zeros()
}

fn check_image_params(params: &ImageParams) -> Result<()> {
    if params.export_sharing {
        return Err(GpuError::UnsupportedUsage(
            "export sharing is not available on the host backend".to_string(),
        ));
    }
    let [w, h, d] = params.extent();
    let shape_ok = match params.dimension {
        ImageDimension::D1 => h == 1 && d == 1,
        ImageDimension::D2 => d == 1,
        ImageDimension::D3 => true,
    };
    if w == 0 || h == 0 || d == 0 || !shape_ok {
        return Err(GpuError::InvalidArgument(format!(
            "{w}x{h}x{d} is not a valid {:?} extent",
            params.dimension
        )));
    }
    if params.mip_levels == 0 || params.mip_levels > max_mip_levels(params) {
        return Err(GpuError::InvalidArgument(format!(
            "{} mip levels requested, at most {} possible",
            params.mip_levels,
            max_mip_levels(params)
        )));
    }
    Ok(())
}

impl Device for HostDevice {
    type Stream = HostStream;

    fn id(&self) -> DeviceId {
        self.id
    }

    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn allocate_memory(&mut self, params: &AllocParams) -> Result<DeviceAllocation> {
        self.shared.check_lost()?;
        if params.size == 0 {
            return Err(GpuError::InvalidArgument(
                "allocation size must be non-zero".to_string(),
            ));
        }
        if params.export_sharing {
            return Err(GpuError::UnsupportedUsage(
                "export sharing is not available on the host backend".to_string(),
            ));
        }
        if params.usage.is_empty() {
            return Err(GpuError::UnsupportedUsage("no usage flags".to_string()));
        }
        if params.usage.intersects(AllocUsage::VERTEX | AllocUsage::INDEX) && !self.caps.raster {
            return Err(GpuError::UnsupportedUsage(format!(
                "{:?} needs a raster-capable device",
                params.usage
            )));
        }

        let mirror = if params.is_host_visible() {
            Some(zeroed_bytes(params.size)?)
        } else {
            None
        };
        let record = AllocationRecord {
            size: params.size,
            image: false,
            mirror,
            mapping: None,
        };
        let alloc = self.insert_allocation(record, None)?;
        log::debug!(
            "allocated {} ({} bytes, host visible: {})",
            alloc,
            params.size,
            params.is_host_visible()
        );
        Ok(alloc)
    }

    fn dealloc_memory(&mut self, alloc: DeviceAllocation) -> Result<()> {
        self.release_allocation(alloc, false)
    }

    fn map_range(&mut self, ptr: DevicePtr, size: u64, access: MapAccess) -> Result<&mut [u8]> {
        self.shared.check_lost()?;
        let alloc = ptr.alloc;
        self.check_owned(alloc)?;
        if self.shared.validation && self.stream.in_flight(alloc.alloc_id) {
            self.diagnose(&format!(
                "{alloc} mapped while submitted work still uses it; sync first"
            ));
        }

        let record = self
            .allocations
            .get_mut_ref(alloc.alloc_id)
            .ok_or(GpuError::InvalidHandle(alloc))?;
        if record.image {
            return Err(GpuError::UnsupportedUsage(format!(
                "{alloc} is an image and cannot be mapped"
            )));
        }
        if record.mapping.is_some() {
            return Err(GpuError::InvalidSequence(format!("{alloc} is already mapped")));
        }
        let (offset, len) = resolve_range(ptr.offset, size, record.size).ok_or_else(|| {
            GpuError::InvalidArgument(format!(
                "map of {}+{} overruns {} ({} bytes)",
                ptr.offset, size, alloc, record.size
            ))
        })?;
        let mirror = record.mirror.as_mut().ok_or_else(|| {
            GpuError::UnsupportedUsage(format!("{alloc} was not allocated host-visible"))
        })?;

        let mapping = Mapping {
            offset,
            len,
            access,
        };
        if access.reads_back() {
            lock(&self.shared.memory).read(alloc.ptr(offset), &mut mirror[mapping.range()])?;
        }
        record.mapping = Some(mapping);
        Ok(&mut mirror[mapping.range()])
    }

    fn unmap(&mut self, alloc: DeviceAllocation) -> Result<()> {
        self.shared.check_lost()?;
        self.check_owned(alloc)?;
        let record = self
            .allocations
            .get_mut_ref(alloc.alloc_id)
            .ok_or(GpuError::InvalidHandle(alloc))?;
        let mapping = record
            .mapping
            .take()
            .ok_or_else(|| GpuError::InvalidSequence(format!("{alloc} is not mapped")))?;
        if mapping.access.writes_back() {
            if let Some(mirror) = &record.mirror {
                lock(&self.shared.memory)
                    .write(alloc.ptr(mapping.offset), &mirror[mapping.range()])?;
            }
        }
        Ok(())
    }

    fn create_pipeline(&mut self, desc: &PipelineSourceDesc, name: &str) -> Result<Pipeline> {
        self.shared.check_lost()?;
        if desc.stage != ShaderStage::Compute {
            return Err(GpuError::Unsupported("graphics pipelines"));
        }
        let kernel = self.kernels.get(&desc.entry_point).cloned().ok_or_else(|| {
            let mut known: Vec<_> = self.kernels.keys().map(String::as_str).collect();
            known.sort_unstable();
            GpuError::CompilationError {
                pipeline: name.to_string(),
                message: format!(
                    "no host kernel named `{}` (registered: [{}])",
                    desc.entry_point,
                    known.join(", ")
                ),
            }
        })?;

        let index = lock(&self.shared.pipelines)
            .insert(kernel)
            .ok_or_else(|| GpuError::OutOfMemory("pipeline ids exhausted".to_string()))?;
        let pipeline = Pipeline::new(
            PipelineId {
                device: self.id,
                index,
            },
            name,
            desc,
        );
        log::debug!("created {} `{}`", pipeline.id(), name);
        Ok(pipeline)
    }

    fn destroy_pipeline(&mut self, pipeline: Pipeline) -> Result<()> {
        self.shared.check_lost()?;
        let id = pipeline.id();
        if id.device != self.id {
            return Err(GpuError::InvalidPipeline(id));
        }
        if !lock(&self.shared.pipelines).contains(id.index) {
            return Err(GpuError::InvalidPipeline(id));
        }
        self.stream.wait_for_pipeline(id.index)?;
        lock(&self.shared.pipelines)
            .release(id.index)
            .ok_or(GpuError::InvalidPipeline(id))?;
        log::debug!("destroyed {} `{}`", id, pipeline.name());
        Ok(())
    }

    fn create_image(&mut self, params: &ImageParams) -> Result<DeviceAllocation> {
        self.shared.check_lost()?;
        if !self.caps.images {
            return Err(GpuError::Unsupported("images"));
        }
        check_image_params(params)?;
        let size = params.byte_size().ok_or_else(|| {
            GpuError::InvalidArgument(format!(
                "{}x{}x{} {:?} image is too large",
                params.width, params.height, params.depth, params.format
            ))
        })?;

        let record = AllocationRecord {
            size,
            image: true,
            mirror: None,
            mapping: None,
        };
        let state = ImageState {
            params: *params,
            layout: params.initial_layout,
        };
        let image = self.insert_allocation(record, Some(state))?;
        log::debug!(
            "created image {} ({}x{}x{}, {:?}, {} mips)",
            image,
            params.width,
            params.height,
            params.depth,
            params.format,
            params.mip_levels
        );
        Ok(image)
    }

    fn destroy_image(&mut self, image: DeviceAllocation) -> Result<()> {
        if !self.caps.images {
            return Err(GpuError::Unsupported("images"));
        }
        self.release_allocation(image, true)
    }

    fn compute_stream(&mut self) -> &mut HostStream {
        &mut self.stream
    }

    fn graphics_stream(&mut self) -> &mut HostStream {
        &mut self.stream
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        if !self.allocations.is_empty() {
            log::debug!(
                "{} dropped with {} live allocations",
                self.name,
                self.allocations.len()
            );
        }
    }
}
