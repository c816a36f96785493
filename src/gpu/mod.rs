//! Backend-neutral device interface.
//!
//! Callers program against [`Device`] and [`Stream`]. Each backend provides
//! one implementation of both and replays recorded [`CommandList`]s through
//! [`driver::command::CommandSink`].
//!
//! # Examples
//! ```
//! use dashi_compute::*;
//!
//! let mut device = HostDevice::new(&DeviceConfig::default()).unwrap();
//! let buf = device.allocate_memory(&AllocParams::host_visible(256)).unwrap();
//! device.map(buf).unwrap().fill(0xAA);
//! device.unmap(buf).unwrap();
//!
//! let stream = device.compute_stream();
//! let mut cmd = stream.new_command_list();
//! cmd.buffer_fill(buf.ptr(0), 256, 0);
//! stream.submit_synced(&mut cmd).unwrap();
//!
//! assert!(device.map(buf).unwrap().iter().all(|b| *b == 0));
//! device.unmap(buf).unwrap();
//! ```

pub mod cmd;
pub mod config;
pub mod driver;
pub mod error;
pub mod host;
#[cfg(feature = "dashi-vulkan")]
pub mod vulkan;

pub use cmd::{CommandList, ListState};
pub use config::{AdapterPreference, DeviceConfig, DiagnosticSink, LogSink, Severity};
pub use driver::binding::{BindingKind, BindingLayout, Bindings, BoundResource, ResourceBinder};
pub use driver::command::Command;
pub use driver::pipeline::{Pipeline, PipelineSourceDesc, ShaderStage};
pub use driver::types::*;
pub use error::{GpuError, Result};
pub use host::{HostDevice, HostKernel, HostStream, KernelFault, KernelInvocation};
#[cfg(feature = "dashi-vulkan")]
pub use vulkan::{VulkanDevice, VulkanStream};

/// Accepts command lists and orders their execution.
///
/// Lists submitted to one stream execute in submission order.
pub trait Stream {
    /// A fresh list in the `Recording` state.
    fn new_command_list(&mut self) -> CommandList;

    /// Queue `cmdlist` for execution and return without waiting.
    fn submit(&mut self, cmdlist: &mut CommandList) -> Result<()>;

    /// Submit and block until the device has executed `cmdlist`.
    fn submit_synced(&mut self, cmdlist: &mut CommandList) -> Result<()>;

    /// Block until everything submitted so far has completed.
    fn command_sync(&mut self) -> Result<()>;
}

/// The root object of a backend.
///
/// Allocations and pipelines are created and destroyed explicitly. Once an
/// operation reports [`GpuError::DeviceLost`] every later operation does too.
pub trait Device {
    type Stream: Stream;

    fn id(&self) -> DeviceId;

    fn caps(&self) -> DeviceCaps;

    /// Human-readable adapter name.
    fn name(&self) -> &str;

    fn allocate_memory(&mut self, params: &AllocParams) -> Result<DeviceAllocation>;

    fn dealloc_memory(&mut self, alloc: DeviceAllocation) -> Result<()>;

    /// Map `size` bytes at `ptr` for host access.
    ///
    /// Without native mapping the returned slice points into a staging
    /// mirror: `Read`/`ReadWrite` refresh it from device memory first and
    /// [`Device::unmap`] writes it back for `Write`/`ReadWrite`.
    fn map_range(&mut self, ptr: DevicePtr, size: u64, access: MapAccess) -> Result<&mut [u8]>;

    fn map(&mut self, alloc: DeviceAllocation) -> Result<&mut [u8]> {
        self.map_range(alloc.ptr(0), WHOLE_SIZE, MapAccess::ReadWrite)
    }

    fn map_with(&mut self, alloc: DeviceAllocation, access: MapAccess) -> Result<&mut [u8]> {
        self.map_range(alloc.ptr(0), WHOLE_SIZE, access)
    }

    fn unmap(&mut self, alloc: DeviceAllocation) -> Result<()>;

    fn create_pipeline(&mut self, desc: &PipelineSourceDesc, name: &str) -> Result<Pipeline>;

    /// Release the program. Allocations it was bound to are unaffected.
    fn destroy_pipeline(&mut self, pipeline: Pipeline) -> Result<()>;

    fn create_image(&mut self, params: &ImageParams) -> Result<DeviceAllocation>;

    fn destroy_image(&mut self, image: DeviceAllocation) -> Result<()>;

    fn compute_stream(&mut self) -> &mut Self::Stream;

    /// Same stream as [`Device::compute_stream`] on compute-only devices.
    fn graphics_stream(&mut self) -> &mut Self::Stream;

    /// Device-side copy on the compute stream. Asynchronous.
    fn memcpy_internal(&mut self, dst: DevicePtr, src: DevicePtr, size: u64) -> Result<()> {
        let stream = self.compute_stream();
        let mut cmd = stream.new_command_list();
        cmd.buffer_copy(dst, src, size);
        stream.submit(&mut cmd)
    }

    fn image_transition(
        &mut self,
        image: DeviceAllocation,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) -> Result<()> {
        if !self.caps().images {
            return Err(GpuError::Unsupported("image operations"));
        }
        let stream = self.graphics_stream();
        let mut cmd = stream.new_command_list();
        cmd.image_transition(image, old_layout, new_layout);
        stream.submit(&mut cmd)
    }

    fn buffer_to_image(
        &mut self,
        dst_image: DeviceAllocation,
        src_buf: DevicePtr,
        image_layout: ImageLayout,
        params: &BufferImageCopyParams,
    ) -> Result<()> {
        if !self.caps().images {
            return Err(GpuError::Unsupported("image operations"));
        }
        let stream = self.graphics_stream();
        let mut cmd = stream.new_command_list();
        cmd.buffer_to_image(dst_image, src_buf, image_layout, params);
        stream.submit(&mut cmd)
    }

    fn image_to_buffer(
        &mut self,
        dst_buf: DevicePtr,
        src_image: DeviceAllocation,
        image_layout: ImageLayout,
        params: &BufferImageCopyParams,
    ) -> Result<()> {
        if !self.caps().images {
            return Err(GpuError::Unsupported("image operations"));
        }
        let stream = self.graphics_stream();
        let mut cmd = stream.new_command_list();
        cmd.image_to_buffer(dst_buf, src_image, image_layout, params);
        stream.submit(&mut cmd)
    }

    /// Block until all submitted work has finished.
    fn wait_idle(&mut self) -> Result<()> {
        self.compute_stream().command_sync()
    }
}
