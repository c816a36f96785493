use std::sync::Arc;

#[cfg(feature = "dashi-serde")]
use serde::Serialize;

use super::binding::Bindings;
use super::pipeline::PipelineInfo;
use super::types::{
    BufferImageCopyParams, DeviceAllocation, DeviceCaps, DeviceId, DevicePtr, ImageLayout,
    WHOLE_SIZE,
};
use crate::gpu::error::{GpuError, Result};

//===----------------------------------------------------------------------===//
// Command definitions
//===----------------------------------------------------------------------===//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub struct BufferBarrier {
    pub ptr: DevicePtr,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub struct CopyBuffer {
    pub dst: DevicePtr,
    pub src: DevicePtr,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub struct FillBuffer {
    pub ptr: DevicePtr,
    pub size: u64,
    /// Little-endian word repeated over the range.
    pub data: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub struct Dispatch {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub struct TransitionImage {
    pub image: DeviceAllocation,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub struct CopyBufferImage {
    pub src: DevicePtr,
    pub dst: DeviceAllocation,
    pub layout: ImageLayout,
    pub params: BufferImageCopyParams,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub struct CopyImageBuffer {
    pub src: DeviceAllocation,
    pub layout: ImageLayout,
    pub dst: DevicePtr,
    pub params: BufferImageCopyParams,
}

/// One deferred device operation.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub enum Command {
    BindPipeline(Arc<PipelineInfo>),
    BindResources(Bindings),
    BufferBarrier(BufferBarrier),
    MemoryBarrier,
    CopyBuffer(CopyBuffer),
    FillBuffer(FillBuffer),
    Dispatch(Dispatch),
    TransitionImage(TransitionImage),
    CopyBufferToImage(CopyBufferImage),
    CopyImageToBuffer(CopyImageBuffer),
}

impl Command {
    pub fn is_image_op(&self) -> bool {
        matches!(
            self,
            Command::TransitionImage(_)
                | Command::CopyBufferToImage(_)
                | Command::CopyImageToBuffer(_)
        )
    }

    /// Every allocation the command touches.
    pub fn allocations(&self) -> Vec<DeviceAllocation> {
        match self {
            Command::BindPipeline(_) | Command::MemoryBarrier | Command::Dispatch(_) => Vec::new(),
            Command::BindResources(b) => b.allocations().collect(),
            Command::BufferBarrier(c) => vec![c.ptr.alloc],
            Command::CopyBuffer(c) => vec![c.dst.alloc, c.src.alloc],
            Command::FillBuffer(c) => vec![c.ptr.alloc],
            Command::TransitionImage(c) => vec![c.image],
            Command::CopyBufferToImage(c) => vec![c.src.alloc, c.dst],
            Command::CopyImageToBuffer(c) => vec![c.src, c.dst.alloc],
        }
    }
}

//===----------------------------------------------------------------------===//
// Validation & replay
//===----------------------------------------------------------------------===//

/// Structural checks run when a list is submitted, before anything reaches
/// the device.
pub fn validate(commands: &[Command], device: DeviceId, caps: &DeviceCaps) -> Result<()> {
    let mut pipeline: Option<&Arc<PipelineInfo>> = None;
    let mut bindings: Option<&Bindings> = None;

    for (index, cmd) in commands.iter().enumerate() {
        if cmd.is_image_op() && !caps.images {
            return Err(GpuError::Unsupported("image operations"));
        }
        if let Some(foreign) = cmd.allocations().into_iter().find(|a| a.device != device) {
            return Err(GpuError::InvalidHandle(foreign));
        }

        match cmd {
            Command::BindPipeline(info) => {
                if info.id.device != device {
                    return Err(GpuError::InvalidPipeline(info.id));
                }
                pipeline = Some(info);
                bindings = None;
            }
            Command::BindResources(b) => {
                if pipeline.is_none() {
                    return Err(GpuError::InvalidSequence(format!(
                        "command {index}: resources bound before any pipeline"
                    )));
                }
                bindings = Some(b);
            }
            Command::Dispatch(d) => {
                let Some(info) = pipeline else {
                    return Err(GpuError::InvalidSequence(format!(
                        "command {index}: dispatch before any pipeline was bound"
                    )));
                };
                let dims = [d.x, d.y, d.z];
                if dims.contains(&0) {
                    return Err(GpuError::InvalidArgument(format!(
                        "command {index}: dispatch({}, {}, {}) has an empty dimension",
                        d.x, d.y, d.z
                    )));
                }
                if dims
                    .iter()
                    .zip(caps.max_dispatch_groups.iter())
                    .any(|(dim, max)| dim > max)
                {
                    return Err(GpuError::InvalidArgument(format!(
                        "command {index}: dispatch({}, {}, {}) exceeds {:?}",
                        d.x, d.y, d.z, caps.max_dispatch_groups
                    )));
                }
                if !info.layout.is_empty() {
                    match bindings {
                        Some(b) => b.check_layout(&info.layout)?,
                        None => {
                            return Err(GpuError::InvalidSequence(format!(
                                "command {index}: `{}` declares bindings but none are bound",
                                info.name
                            )))
                        }
                    }
                }
            }
            Command::FillBuffer(f) => {
                let misaligned_size = f.size != WHOLE_SIZE && f.size % 4 != 0;
                if f.ptr.offset % 4 != 0 || misaligned_size {
                    return Err(GpuError::InvalidArgument(format!(
                        "command {index}: fill of {} bytes at offset {} is not word aligned",
                        f.size, f.ptr.offset
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Replay `commands` in record order, stopping at the first failure.
///
/// Returns the number of commands replayed.
pub fn replay<S: CommandSink>(commands: &[Command], sink: &mut S) -> Result<usize> {
    let mut cnt = 0;
    for cmd in commands {
        log::trace!("replay {:?}", cmd);
        match cmd {
            Command::BindPipeline(info) => sink.bind_pipeline(info)?,
            Command::BindResources(bindings) => sink.bind_resources(bindings)?,
            Command::BufferBarrier(c) => sink.buffer_barrier(c)?,
            Command::MemoryBarrier => sink.memory_barrier()?,
            Command::CopyBuffer(c) => sink.copy_buffer(c)?,
            Command::FillBuffer(c) => sink.fill_buffer(c)?,
            Command::Dispatch(c) => sink.dispatch(c)?,
            Command::TransitionImage(c) => sink.transition_image(c)?,
            Command::CopyBufferToImage(c) => sink.copy_buffer_to_image(c)?,
            Command::CopyImageToBuffer(c) => sink.copy_image_to_buffer(c)?,
        }
        cnt += 1;
    }
    Ok(cnt)
}

/// Backend half of replay: one method per command variant.
pub trait CommandSink {
    fn bind_pipeline(&mut self, pipeline: &Arc<PipelineInfo>) -> Result<()>;
    fn bind_resources(&mut self, bindings: &Bindings) -> Result<()>;
    fn buffer_barrier(&mut self, cmd: &BufferBarrier) -> Result<()>;
    fn memory_barrier(&mut self) -> Result<()>;
    fn copy_buffer(&mut self, cmd: &CopyBuffer) -> Result<()>;
    fn fill_buffer(&mut self, cmd: &FillBuffer) -> Result<()>;
    fn dispatch(&mut self, cmd: &Dispatch) -> Result<()>;
    fn transition_image(&mut self, _cmd: &TransitionImage) -> Result<()> {
        Err(GpuError::Unsupported("image transitions"))
    }
    fn copy_buffer_to_image(&mut self, _cmd: &CopyBufferImage) -> Result<()> {
        Err(GpuError::Unsupported("buffer to image copies"))
    }
    fn copy_image_to_buffer(&mut self, _cmd: &CopyImageBuffer) -> Result<()> {
        Err(GpuError::Unsupported("image to buffer copies"))
    }
}

//===----------------------------------------------------------------------===//
// Tests
//===----------------------------------------------------------------------===//
