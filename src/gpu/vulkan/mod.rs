//! Vulkan backend, built on `ash` and `vk-mem`.
//!
//! Compute-only and headless: one queue family with compute support, no
//! surfaces and no images. Host-visible buffers are mapped in place.
//! Programs are SPIR-V; slot bindings become descriptor sets written at
//! each dispatch from a per-submission pool.

mod command_pool;
mod commands;
mod descriptor_sets;
mod error;
mod memory;
mod pipelines;

use std::collections::{HashMap, VecDeque};
use std::ffi::{c_char, c_void, CStr};
use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex};

use ash::{vk, Entry};

use self::command_pool::CommandPool;
use self::commands::Encoder;
use self::descriptor_sets::DescriptorArena;
use self::memory::{destroy_buffer, make_buffer, Buffer};
use self::pipelines::{make_compute_pipeline, ComputePipeline};
use super::cmd::CommandList;
use super::config::{AdapterPreference, DeviceConfig, DiagnosticSink, Severity};
use super::driver::command::replay;
use super::driver::pipeline::{Pipeline, PipelineSourceDesc};
use super::driver::types::{
    resolve_range, AllocParams, AllocUsage, DeviceAllocation, DeviceCaps, DeviceId, DevicePtr,
    ImageParams, MapAccess, PipelineId,
};
use super::error::{GpuError, Result};
use super::{Device, Stream};
use crate::utils::{lock, Registry};

/// Names of debugging layers that should be enabled when validation is requested.
pub const DEBUG_LAYER_NAMES: [*const c_char; 1] =
    [b"VK_LAYER_KHRONOS_validation\0".as_ptr() as *const c_char];

/// Routes debug-utils messages to the device's [`DiagnosticSink`].
///
/// `p_user_data` points at the `Arc<dyn DiagnosticSink>` boxed in [`Core`].
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || p_user_data.is_null() {
        return vk::FALSE;
    }
    let p_message = (*p_callback_data).p_message;
    if p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr(p_message).to_string_lossy();
    let severity = if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        Severity::Error
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        Severity::Warning
    } else {
        Severity::Info
    };
    let sink = &*(p_user_data as *const Arc<dyn DiagnosticSink>);
    let text = format!("[{:?}] {}", message_type, message);
    // Unwinding across the FFI boundary is undefined.
    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        sink.message(severity, &text)
    }));
    vk::FALSE
}

//===----------------------------------------------------------------------===//
// Core
//===----------------------------------------------------------------------===//

/// Native objects shared by a [`VulkanDevice`] and its stream.
struct Core {
    _entry: Entry,
    instance: ash::Instance,
    device: ash::Device,
    queue: vk::Queue,
    family: u32,
    allocator: ManuallyDrop<vk_mem::Allocator>,
    debug: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    diagnostics: Box<Arc<dyn DiagnosticSink>>,
    validation: bool,
    buffers: Mutex<Registry<Buffer>>,
    pipelines: Mutex<Registry<ComputePipeline>>,
    lost: Mutex<Option<String>>,
}

impl Core {
    fn check_lost(&self) -> Result<()> {
        match &*lock(&self.lost) {
            Some(reason) => Err(GpuError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    /// Pass `err` through, remembering it if the device was lost.
    fn observe(&self, err: GpuError) -> GpuError {
        if let GpuError::DeviceLost(reason) = &err {
            log::error!("vulkan device lost: {}", reason);
            lock(&self.lost).get_or_insert_with(|| reason.clone());
        }
        err
    }

    fn diagnose(&self, text: &str) {
        if self.validation {
            self.diagnostics.message(Severity::Warning, text);
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
        for (_, mut pipeline) in lock(&self.pipelines).drain() {
            pipeline.destroy(&self.device);
        }
        for (_, mut buf) in lock(&self.buffers).drain() {
            destroy_buffer(&self.allocator, &mut buf);
        }
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            if let Some((utils, messenger)) = self.debug.take() {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn compute_family(instance: &ash::Instance, pdevice: vk::PhysicalDevice) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(pdevice) };
    let compute = |p: &vk::QueueFamilyProperties| p.queue_flags.contains(vk::QueueFlags::COMPUTE);
    families
        .iter()
        .position(|p| compute(p) && !p.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .or_else(|| families.iter().position(compute))
        .map(|idx| idx as u32)
}

fn matches_preference(pref: AdapterPreference, ty: vk::PhysicalDeviceType) -> bool {
    match pref {
        AdapterPreference::Dedicated => ty == vk::PhysicalDeviceType::DISCRETE_GPU,
        AdapterPreference::Integrated => ty == vk::PhysicalDeviceType::INTEGRATED_GPU,
        AdapterPreference::Software => ty == vk::PhysicalDeviceType::CPU,
        AdapterPreference::Any => true,
    }
}

/// The `device_index`-th adapter matching the preference that can run compute.
fn pick_adapter(
    instance: &ash::Instance,
    config: &DeviceConfig,
) -> Result<(vk::PhysicalDevice, u32)> {
    let candidates: Vec<_> = unsafe { instance.enumerate_physical_devices()? }
        .into_iter()
        .filter(|pdevice| {
            let props = unsafe { instance.get_physical_device_properties(*pdevice) };
            matches_preference(config.adapter, props.device_type)
        })
        .filter_map(|pdevice| compute_family(instance, pdevice).map(|family| (pdevice, family)))
        .collect();
    if candidates.is_empty() {
        return Err(GpuError::Unsupported(
            "no Vulkan adapter with a compute queue matches the preference",
        ));
    }
    candidates.get(config.device_index).copied().ok_or_else(|| {
        GpuError::InvalidArgument(format!(
            "adapter index {} requested, {} available",
            config.device_index,
            candidates.len()
        ))
    })
}

fn init_core(config: &DeviceConfig) -> Result<(Core, vk::PhysicalDeviceProperties)> {
    let app_info = vk::ApplicationInfo {
        api_version: vk::make_api_version(0, 1, 3, 0),
        ..Default::default()
    };

    let entry = unsafe { Entry::load() }?;
    let mut inst_exts = Vec::new();
    let mut inst_layers = Vec::new();
    if config.validation {
        inst_exts.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        let available_layers = entry.enumerate_instance_layer_properties()?;
        for &layer in &DEBUG_LAYER_NAMES {
            let name = unsafe { CStr::from_ptr(layer) };
            if available_layers
                .iter()
                .any(|prop| unsafe { CStr::from_ptr(prop.layer_name.as_ptr()) == name })
            {
                inst_layers.push(layer);
            } else {
                log::warn!("validation requested but {:?} is not installed", name);
            }
        }
    }

    let instance = unsafe {
        entry.create_instance(
            &vk::InstanceCreateInfo::builder()
                .application_info(&app_info)
                .enabled_extension_names(&inst_exts)
                .enabled_layer_names(&inst_layers)
                .build(),
            None,
        )
    }?;

    let picked = pick_adapter(&instance, config);
    let (pdevice, family) = match picked {
        Ok(p) => p,
        Err(err) => {
            unsafe { instance.destroy_instance(None) };
            return Err(err);
        }
    };
    let props = unsafe { instance.get_physical_device_properties(pdevice) };

    let priorities = [1.0];
    let queue_info = vk::DeviceQueueCreateInfo::builder()
        .queue_family_index(family)
        .queue_priorities(&priorities)
        .build();
    let device = match unsafe {
        instance.create_device(
            pdevice,
            &vk::DeviceCreateInfo::builder()
                .queue_create_infos(std::slice::from_ref(&queue_info))
                .build(),
            None,
        )
    } {
        Ok(d) => d,
        Err(res) => {
            unsafe { instance.destroy_instance(None) };
            return Err(res.into());
        }
    };
    let queue = unsafe { device.get_device_queue(family, 0) };

    let allocator = match vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(
        &instance, &device, pdevice,
    )) {
        Ok(a) => a,
        Err(res) => {
            unsafe {
                device.destroy_device(None);
                instance.destroy_instance(None);
            }
            return Err(res.into());
        }
    };

    let diagnostics = Box::new(config.diagnostic_sink());
    let debug = if config.validation {
        let utils = ash::extensions::ext::DebugUtils::new(&entry, &instance);
        let messenger_ci = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vulkan_debug_callback))
            .user_data(&*diagnostics as *const Arc<dyn DiagnosticSink> as *mut c_void);
        match unsafe { utils.create_debug_utils_messenger(&messenger_ci, None) } {
            Ok(messenger) => Some((utils, messenger)),
            Err(res) => {
                log::warn!("failed to create debug messenger: {}", res);
                None
            }
        }
    } else {
        None
    };

    let core = Core {
        _entry: entry,
        instance,
        device,
        queue,
        family,
        allocator: ManuallyDrop::new(allocator),
        debug,
        diagnostics,
        validation: config.validation,
        buffers: Mutex::new(Registry::new()),
        pipelines: Mutex::new(Registry::new()),
        lost: Mutex::new(None),
    };
    Ok((core, props))
}

//===----------------------------------------------------------------------===//
// Stream
//===----------------------------------------------------------------------===//

struct InFlight {
    seq: u64,
    cmd_buf: vk::CommandBuffer,
    fence: vk::Fence,
    descriptors: DescriptorArena,
}

/// The compute queue of a [`VulkanDevice`].
///
/// Every submission is one primary command buffer with its own fence.
/// Finished submissions are reclaimed on the next submit or sync.
pub struct VulkanStream {
    device: DeviceId,
    caps: DeviceCaps,
    core: Arc<Core>,
    pool: CommandPool,
    in_flight: VecDeque<InFlight>,
    free_fences: Vec<vk::Fence>,
    submitted: u64,
    last_use: HashMap<u32, u64>,
}

impl VulkanStream {
    fn new(device: DeviceId, caps: DeviceCaps, core: Arc<Core>) -> Result<Self> {
        let pool = CommandPool::new(core.device.clone(), core.family)?;
        Ok(Self {
            device,
            caps,
            core,
            pool,
            in_flight: VecDeque::new(),
            free_fences: Vec::new(),
            submitted: 0,
            last_use: HashMap::new(),
        })
    }

    fn fence(&mut self) -> Result<vk::Fence> {
        if let Some(fence) = self.free_fences.pop() {
            return Ok(fence);
        }
        let fence = unsafe {
            self.core
                .device
                .create_fence(&vk::FenceCreateInfo::builder().build(), None)?
        };
        Ok(fence)
    }

    fn retire(&mut self, mut done: InFlight) {
        done.descriptors.destroy(&self.core.device);
        self.pool.recycle(done.cmd_buf);
        match unsafe { self.core.device.reset_fences(&[done.fence]) } {
            Ok(()) => self.free_fences.push(done.fence),
            Err(_) => unsafe { self.core.device.destroy_fence(done.fence, None) },
        }
    }

    /// Retire finished submissions without blocking.
    fn reclaim(&mut self) -> Result<()> {
        while let Some(front) = self.in_flight.front() {
            let signaled = unsafe { self.core.device.get_fence_status(front.fence) }
                .map_err(|res| self.core.observe(res.into()))?;
            if !signaled {
                break;
            }
            if let Some(done) = self.in_flight.pop_front() {
                self.retire(done);
            }
        }
        Ok(())
    }

    /// Block until submission `seq` and everything before it has finished.
    fn wait_for(&mut self, seq: u64) -> Result<()> {
        let fences: Vec<vk::Fence> = self
            .in_flight
            .iter()
            .filter(|f| f.seq <= seq)
            .map(|f| f.fence)
            .collect();
        if !fences.is_empty() {
            unsafe { self.core.device.wait_for_fences(&fences, true, u64::MAX) }
                .map_err(|res| self.core.observe(res.into()))?;
        }
        while self.in_flight.front().map_or(false, |f| f.seq <= seq) {
            if let Some(done) = self.in_flight.pop_front() {
                self.retire(done);
            }
        }
        self.core.check_lost()
    }

    /// Wait for the last submission that referenced `alloc_id`, if any.
    fn wait_for_use(&mut self, alloc_id: u32) -> Result<()> {
        match self.last_use.get(&alloc_id).copied() {
            Some(seq) if self.in_flight.iter().any(|f| f.seq <= seq) => {
                self.core.diagnose(&format!(
                    "allocation #{alloc_id} of {} is still in use by submission {seq}",
                    self.device
                ));
                self.wait_for(seq)
            }
            _ => Ok(()),
        }
    }

    fn forget(&mut self, alloc_id: u32) {
        self.last_use.remove(&alloc_id);
    }

    fn enqueue(&mut self, cmdlist: &mut CommandList) -> Result<u64> {
        self.core.check_lost()?;
        let commands = cmdlist.take_for_submission()?;
        self.reclaim()?;

        let core = self.core.clone();
        let cmd_buf = self.pool.begin().map_err(|e| core.observe(e))?;
        let mut descriptors = match DescriptorArena::new(&core.device, &commands) {
            Ok(d) => d,
            Err(err) => {
                unsafe {
                    let _ = core.device.end_command_buffer(cmd_buf);
                }
                self.pool.recycle(cmd_buf);
                return Err(core.observe(err));
            }
        };

        let recorded = {
            let buffers = lock(&core.buffers);
            let pipelines = lock(&core.pipelines);
            let mut encoder =
                Encoder::new(&core.device, cmd_buf, &buffers, &pipelines, &mut descriptors);
            encoder.full_barrier();
            replay(&commands, &mut encoder)
        };
        let ended = unsafe { core.device.end_command_buffer(cmd_buf) }.map_err(GpuError::from);
        let fence = match recorded.and(ended).and_then(|_| self.fence()) {
            Ok(fence) => fence,
            Err(err) => {
                descriptors.destroy(&core.device);
                self.pool.recycle(cmd_buf);
                return Err(core.observe(err));
            }
        };

        let submit = vk::SubmitInfo::builder()
            .command_buffers(std::slice::from_ref(&cmd_buf))
            .build();
        if let Err(res) = unsafe { core.device.queue_submit(core.queue, &[submit], fence) } {
            descriptors.destroy(&core.device);
            self.pool.recycle(cmd_buf);
            self.free_fences.push(fence);
            return Err(core.observe(res.into()));
        }

        let seq = self.submitted + 1;
        for cmd in &commands {
            for alloc in cmd.allocations() {
                self.last_use.insert(alloc.alloc_id, seq);
            }
        }
        log::trace!("submit #{} with {} commands", seq, commands.len());
        self.in_flight.push_back(InFlight {
            seq,
            cmd_buf,
            fence,
            descriptors,
        });
        self.submitted = seq;
        Ok(seq)
    }
}

impl Stream for VulkanStream {
    fn new_command_list(&mut self) -> CommandList {
        CommandList::new(self.device, self.caps)
    }

    fn submit(&mut self, cmdlist: &mut CommandList) -> Result<()> {
        self.enqueue(cmdlist).map(|_| ())
    }

    fn submit_synced(&mut self, cmdlist: &mut CommandList) -> Result<()> {
        let seq = self.enqueue(cmdlist)?;
        self.wait_for(seq)
    }

    fn command_sync(&mut self) -> Result<()> {
        self.core.check_lost()?;
        self.wait_for(self.submitted)
    }
}

impl Drop for VulkanStream {
    fn drop(&mut self) {
        unsafe {
            let _ = self.core.device.device_wait_idle();
        }
        while let Some(done) = self.in_flight.pop_front() {
            self.retire(done);
        }
        for fence in self.free_fences.drain(..) {
            unsafe { self.core.device.destroy_fence(fence, None) };
        }
        self.pool.destroy();
    }
}

//===----------------------------------------------------------------------===//
// Device
//===----------------------------------------------------------------------===//

/// A [`Device`] backed by a Vulkan physical device.
pub struct VulkanDevice {
    id: DeviceId,
    name: String,
    caps: DeviceCaps,
    budget: Option<u64>,
    live_bytes: u64,
    stream: VulkanStream,
    core: Arc<Core>,
}

impl VulkanDevice {
    /// Open a headless device. Validation layers and the debug messenger
    /// are enabled when `config.validation` is set.
    pub fn new(config: &DeviceConfig) -> Result<Self> {
        let (core, props) = init_core(config)?;
        let core = Arc::new(core);
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        if config.images {
            log::debug!("{} runs compute only, images are unavailable", name);
        }

        let id = DeviceId::next();
        let caps = DeviceCaps {
            images: false,
            raster: false,
            native_mapping: true,
            max_dispatch_groups: props.limits.max_compute_work_group_count,
        };
        let stream = VulkanStream::new(id, caps, core.clone())?;
        log::debug!(
            "created {} ({}), validation: {}",
            name,
            id,
            config.validation
        );

        Ok(Self {
            id,
            name,
            caps,
            budget: config.memory_budget,
            live_bytes: 0,
            stream,
            core,
        })
    }

    /// Bytes of device memory currently allocated through this device.
    pub fn memory_in_use(&self) -> u64 {
        self.live_bytes
    }

    fn check_owned(&self, alloc: DeviceAllocation) -> Result<()> {
        if alloc.device != self.id {
            return Err(GpuError::InvalidHandle(alloc));
        }
        Ok(())
    }
}

impl Device for VulkanDevice {
    type Stream = VulkanStream;

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
        self.core.check_lost()?;
        if params.size == 0 {
            return Err(GpuError::InvalidArgument(
                "allocation size must be non-zero".to_string(),
            ));
        }
        if params.export_sharing {
            return Err(GpuError::UnsupportedUsage(
                "export sharing is not implemented".to_string(),
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
        if let Some(budget) = self.budget {
            if self.live_bytes.saturating_add(params.size) > budget {
                return Err(GpuError::OutOfMemory(format!(
                    "{} bytes requested with {} of {} bytes in use",
                    params.size, self.live_bytes, budget
                )));
            }
        }

        let buf = make_buffer(&self.core.allocator, params).map_err(|e| self.core.observe(e))?;
        let inserted = lock(&self.core.buffers).try_insert(buf);
        let alloc_id = match inserted {
            Ok(id) => id,
            Err(mut rejected) => {
                destroy_buffer(&self.core.allocator, &mut rejected);
                return Err(GpuError::OutOfMemory("allocation ids exhausted".to_string()));
            }
        };
        self.live_bytes += params.size;
        let alloc = DeviceAllocation {
            device: self.id,
            alloc_id,
        };
        log::debug!(
            "allocated {} ({} bytes, host visible: {})",
            alloc,
            params.size,
            params.is_host_visible()
        );
        Ok(alloc)
    }

    fn dealloc_memory(&mut self, alloc: DeviceAllocation) -> Result<()> {
        self.core.check_lost()?;
        self.check_owned(alloc)?;
        if !lock(&self.core.buffers).contains(alloc.alloc_id) {
            return Err(GpuError::InvalidHandle(alloc));
        }
        self.stream.wait_for_use(alloc.alloc_id)?;

        let mut buf = lock(&self.core.buffers)
            .release(alloc.alloc_id)
            .ok_or(GpuError::InvalidHandle(alloc))?;
        if buf.mapped.is_some() {
            log::warn!("releasing {} while it is mapped", alloc);
        }
        destroy_buffer(&self.core.allocator, &mut buf);
        self.live_bytes -= buf.size;
        self.stream.forget(alloc.alloc_id);
        log::debug!("released {}", alloc);
        Ok(())
    }

    fn map_range(&mut self, ptr: DevicePtr, size: u64, access: MapAccess) -> Result<&mut [u8]> {
        self.core.check_lost()?;
        let alloc = ptr.alloc;
        self.check_owned(alloc)?;
        if let Some(seq) = self.stream.last_use.get(&alloc.alloc_id).copied() {
            self.stream.reclaim()?;
            if self.stream.in_flight.iter().any(|f| f.seq <= seq) {
                self.core.diagnose(&format!(
                    "{alloc} mapped while submitted work still uses it; sync first"
                ));
            }
        }

        let mut buffers = lock(&self.core.buffers);
        let buf = buffers
            .get_mut_ref(alloc.alloc_id)
            .ok_or(GpuError::InvalidHandle(alloc))?;
        if !buf.host_visible {
            return Err(GpuError::UnsupportedUsage(format!(
                "{alloc} was not allocated host-visible"
            )));
        }
        if buf.mapped.is_some() {
            return Err(GpuError::InvalidSequence(format!("{alloc} is already mapped")));
        }
        let (offset, len) = resolve_range(ptr.offset, size, buf.size).ok_or_else(|| {
            GpuError::InvalidArgument(format!(
                "map of {}+{} overruns {} ({} bytes)",
                ptr.offset, size, alloc, buf.size
            ))
        })?;

        let base = unsafe { self.core.allocator.map_memory(&mut buf.alloc) }
            .map_err(|res| self.core.observe(res.into()))?;
        if access.reads_back() {
            let invalidated = unsafe {
                self.core
                    .allocator
                    .invalidate_allocation(&buf.alloc, offset as _, len as _)
            };
            if let Err(res) = invalidated {
                unsafe { self.core.allocator.unmap_memory(&mut buf.alloc) };
                return Err(self.core.observe(res.into()));
            }
        }
        buf.mapped = Some((offset, len, access));
        let mapped =
            unsafe { std::slice::from_raw_parts_mut(base.add(offset as usize), len as usize) };
        Ok(mapped)
    }

    fn unmap(&mut self, alloc: DeviceAllocation) -> Result<()> {
        self.core.check_lost()?;
        self.check_owned(alloc)?;
        let mut buffers = lock(&self.core.buffers);
        let buf = buffers
            .get_mut_ref(alloc.alloc_id)
            .ok_or(GpuError::InvalidHandle(alloc))?;
        let (offset, len, access) = buf
            .mapped
            .take()
            .ok_or_else(|| GpuError::InvalidSequence(format!("{alloc} is not mapped")))?;
        let flushed = if access.writes_back() {
            unsafe {
                self.core
                    .allocator
                    .flush_allocation(&buf.alloc, offset as _, len as _)
            }
        } else {
            Ok(())
        };
        unsafe { self.core.allocator.unmap_memory(&mut buf.alloc) };
        flushed.map_err(|res| self.core.observe(res.into()))
    }

    fn create_pipeline(&mut self, desc: &PipelineSourceDesc, name: &str) -> Result<Pipeline> {
        self.core.check_lost()?;
        let native =
            make_compute_pipeline(&self.core.device, desc, name).map_err(|e| self.core.observe(e))?;
        let inserted = lock(&self.core.pipelines).try_insert(native);
        let index = match inserted {
            Ok(index) => index,
            Err(mut rejected) => {
                rejected.destroy(&self.core.device);
                return Err(GpuError::OutOfMemory("pipeline ids exhausted".to_string()));
            }
        };
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
        self.core.check_lost()?;
        let id = pipeline.id();
        if id.device != self.id {
            return Err(GpuError::InvalidPipeline(id));
        }
        if !lock(&self.core.pipelines).contains(id.index) {
            return Err(GpuError::InvalidPipeline(id));
        }
        // Recorded work may still reference the native pipeline.
        self.stream.command_sync()?;
        let mut native = lock(&self.core.pipelines)
            .release(id.index)
            .ok_or(GpuError::InvalidPipeline(id))?;
        native.destroy(&self.core.device);
        log::debug!("destroyed {} `{}`", id, pipeline.name());
        Ok(())
    }

    fn create_image(&mut self, _params: &ImageParams) -> Result<DeviceAllocation> {
        Err(GpuError::Unsupported("images"))
    }

    fn destroy_image(&mut self, _image: DeviceAllocation) -> Result<()> {
        Err(GpuError::Unsupported("images"))
    }

    fn compute_stream(&mut self) -> &mut VulkanStream {
        &mut self.stream
    }

    fn graphics_stream(&mut self) -> &mut VulkanStream {
        &mut self.stream
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let live = lock(&self.core.buffers).len();
        if live > 0 {
            log::debug!("{} dropped with {} live allocations", self.name, live);
        }
    }
}
