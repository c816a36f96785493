use crate::gpu::driver::binding::{Bindings, ResourceBinder};
use crate::gpu::driver::command::{
    validate, BufferBarrier, Command, CopyBuffer, CopyBufferImage, CopyImageBuffer, Dispatch,
    FillBuffer, TransitionImage,
};
use crate::gpu::driver::pipeline::Pipeline;
use crate::gpu::driver::types::{
    BufferImageCopyParams, DeviceAllocation, DeviceCaps, DeviceId, DevicePtr, ImageLayout,
    WHOLE_SIZE,
};
use crate::gpu::error::{GpuError, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ListState {
    Recording,
    Submitted,
}

/// An ordered batch of deferred device operations.
///
/// Recording never touches the device. The list is checked and handed to
/// the backend when a stream submits it, after which it is spent.
#[derive(Debug)]
pub struct CommandList {
    device: DeviceId,
    caps: DeviceCaps,
    commands: Vec<Command>,
    state: ListState,
}

impl CommandList {
    pub(crate) fn new(device: DeviceId, caps: DeviceCaps) -> Self {
        Self {
            device,
            caps,
            commands: Vec::with_capacity(16),
            state: ListState::Recording,
        }
    }

    fn push(&mut self, cmd: Command) {
        if self.state != ListState::Recording {
            log::warn!("dropping {:?} recorded into a submitted command list", cmd);
            return;
        }
        self.commands.push(cmd);
    }

    pub fn bind_pipeline(&mut self, pipeline: &Pipeline) {
        self.push(Command::BindPipeline(pipeline.info().clone()));
    }

    /// Capture a snapshot of `binder` as it is now.
    pub fn bind_resources(&mut self, binder: &ResourceBinder) {
        self.push(Command::BindResources(binder.materialize()));
    }

    pub fn bind_bindings(&mut self, bindings: &Bindings) {
        self.push(Command::BindResources(bindings.clone()));
    }

    pub fn buffer_barrier(&mut self, ptr: DevicePtr, size: u64) {
        self.push(Command::BufferBarrier(BufferBarrier { ptr, size }));
    }

    pub fn buffer_barrier_alloc(&mut self, alloc: DeviceAllocation) {
        self.buffer_barrier(alloc.ptr(0), WHOLE_SIZE);
    }

    pub fn memory_barrier(&mut self) {
        self.push(Command::MemoryBarrier);
    }

    pub fn buffer_copy(&mut self, dst: DevicePtr, src: DevicePtr, size: u64) {
        self.push(Command::CopyBuffer(CopyBuffer { dst, src, size }));
    }

    pub fn buffer_fill(&mut self, ptr: DevicePtr, size: u64, data: u32) {
        self.push(Command::FillBuffer(FillBuffer { ptr, size, data }));
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.push(Command::Dispatch(Dispatch { x, y, z }));
    }

    pub fn image_transition(
        &mut self,
        image: DeviceAllocation,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) {
        self.push(Command::TransitionImage(TransitionImage {
            image,
            old_layout,
            new_layout,
        }));
    }

    pub fn buffer_to_image(
        &mut self,
        dst_image: DeviceAllocation,
        src_buf: DevicePtr,
        image_layout: ImageLayout,
        params: &BufferImageCopyParams,
    ) {
        self.push(Command::CopyBufferToImage(CopyBufferImage {
            src: src_buf,
            dst: dst_image,
            layout: image_layout,
            params: *params,
        }));
    }

    pub fn image_to_buffer(
        &mut self,
        dst_buf: DevicePtr,
        src_image: DeviceAllocation,
        image_layout: ImageLayout,
        params: &BufferImageCopyParams,
    ) {
        self.push(Command::CopyImageToBuffer(CopyImageBuffer {
            src: src_image,
            layout: image_layout,
            dst: dst_buf,
            params: *params,
        }));
    }

    pub fn begin_renderpass(&mut self) -> Result<()> {
        Err(GpuError::Unsupported("render passes"))
    }

    pub fn end_renderpass(&mut self) -> Result<()> {
        Err(GpuError::Unsupported("render passes"))
    }

    pub fn draw(&mut self, _num_verticies: u32, _start_vertex: u32) -> Result<()> {
        Err(GpuError::Unsupported("draw"))
    }

    pub fn draw_indexed(&mut self, _num_indicies: u32, _start_index: u32) -> Result<()> {
        Err(GpuError::Unsupported("draw_indexed"))
    }

    pub fn clear_color(&mut self, _r: f32, _g: f32, _b: f32, _a: f32) -> Result<()> {
        Err(GpuError::Unsupported("clear_color"))
    }

    pub fn set_line_width(&mut self, _width: f32) -> Result<()> {
        Err(GpuError::Unsupported("set_line_width"))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn state(&self) -> ListState {
        self.state
    }

    pub fn is_submitted(&self) -> bool {
        self.state == ListState::Submitted
    }

    /// Validate the recording and move it out for replay.
    ///
    /// On failure the list is left untouched and may be fixed and
    /// resubmitted; on success it becomes `Submitted`.
    pub(crate) fn take_for_submission(&mut self) -> Result<Vec<Command>> {
        if self.state == ListState::Submitted {
            return Err(GpuError::InvalidSequence(
                "command list was already submitted".to_string(),
            ));
        }
        validate(&self.commands, self.device, &self.caps)?;
        self.state = ListState::Submitted;
        Ok(std::mem::take(&mut self.commands))
    }
}
