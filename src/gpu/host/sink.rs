use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use super::kernel::{HostKernel, KernelInvocation, ResolvedSlot};
use super::memory::Arena;
use super::{lock, Shared};
use crate::gpu::config::Severity;
use crate::gpu::driver::binding::{BindingKind, Bindings};
use crate::gpu::driver::command::{
    BufferBarrier, CommandSink, CopyBuffer, CopyBufferImage, CopyImageBuffer, Dispatch,
    FillBuffer, TransitionImage,
};
use crate::gpu::driver::pipeline::PipelineInfo;
use crate::gpu::driver::types::{
    mip_dimensions, resolve_range, BufferImageCopyParams, DeviceAllocation, DevicePtr,
    ImageLayout, ImageParams,
};
use crate::gpu::error::{GpuError, Result};

/// Executes replayed commands against the arena, on the worker thread.
pub(crate) struct HostSink<'a> {
    shared: &'a Shared,
    pipeline: Option<(Arc<PipelineInfo>, Arc<dyn HostKernel>)>,
    bindings: Bindings,
}

fn panic_text(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

fn shader_visible(layout: ImageLayout) -> bool {
    matches!(
        layout,
        ImageLayout::ShaderRead | ImageLayout::ShaderWrite | ImageLayout::ShaderReadWrite
    )
}

/// One contiguous run of texels shared by a buffer and an image level.
struct Row {
    buffer_offset: u64,
    image_offset: u64,
    len: u64,
}

impl<'a> HostSink<'a> {
    pub fn new(shared: &'a Shared) -> Self {
        Self {
            shared,
            pipeline: None,
            bindings: Bindings::default(),
        }
    }

    fn report(&self, text: String) {
        if self.shared.validation {
            self.shared.diagnostics.message(Severity::Warning, &text);
        }
    }

    fn resolve_bindings(&self, mem: &Arena) -> Result<Vec<ResolvedSlot>> {
        let mut slots = Vec::with_capacity(self.bindings.len());
        for bound in self.bindings.iter() {
            let block = mem.block(bound.ptr.alloc)?;
            match (&block.image, bound.kind) {
                (Some(state), BindingKind::Image) => {
                    if !shader_visible(state.layout) {
                        self.report(format!(
                            "{} bound at ({}, {}) is in {:?}, not a shader layout",
                            bound.ptr.alloc, bound.set, bound.binding, state.layout
                        ));
                    }
                }
                (None, BindingKind::Buffer | BindingKind::RwBuffer) => {}
                _ => {
                    return Err(GpuError::InvalidArgument(format!(
                        "{} bound at ({}, {}) does not match binding kind {:?}",
                        bound.ptr.alloc, bound.set, bound.binding, bound.kind
                    )))
                }
            }
            let (offset, len) =
                resolve_range(bound.ptr.offset, bound.size, block.bytes.len() as u64)
                    .ok_or_else(|| {
                        GpuError::InvalidArgument(format!(
                            "binding ({}, {}) overruns {}",
                            bound.set, bound.binding, bound.ptr.alloc
                        ))
                    })?;
            slots.push(ResolvedSlot {
                set: bound.set,
                binding: bound.binding,
                kind: bound.kind,
                alloc_id: bound.ptr.alloc.alloc_id,
                offset,
                len,
            });
        }
        Ok(slots)
    }

    fn image_state(mem: &Arena, image: DeviceAllocation) -> Result<(ImageParams, ImageLayout)> {
        let block = mem.block(image)?;
        block
            .image
            .map(|s| (s.params, s.layout))
            .ok_or_else(|| GpuError::InvalidArgument(format!("{image} is not an image")))
    }

    fn check_layout(&self, image: DeviceAllocation, current: ImageLayout, claimed: ImageLayout) {
        if current != claimed {
            self.report(format!(
                "{image} is used as {claimed:?} but is in {current:?}"
            ));
        }
    }

    /// Rows covered by a buffer/image copy, validated against both sides.
    fn copy_rows(
        mem: &Arena,
        image: DeviceAllocation,
        params: &ImageParams,
        buf: DevicePtr,
        copy: &BufferImageCopyParams,
    ) -> Result<Vec<Row>> {
        if copy.image_mip_level >= params.mip_levels {
            return Err(GpuError::InvalidArgument(format!(
                "mip level {} of {image} does not exist",
                copy.image_mip_level
            )));
        }
        let level = mip_dimensions(params.extent(), copy.image_mip_level);
        let mut extent = copy.image_extent;
        for axis in 0..3 {
            if copy.image_offset[axis] >= level[axis] {
                return Err(GpuError::InvalidArgument(format!(
                    "offset {:?} lies outside mip level {} of {image}",
                    copy.image_offset, copy.image_mip_level
                )));
            }
            if extent[axis] == 0 {
                extent[axis] = level[axis] - copy.image_offset[axis];
            }
            if copy.image_offset[axis] as u64 + extent[axis] as u64 > level[axis] as u64 {
                return Err(GpuError::InvalidArgument(format!(
                    "extent {:?} at {:?} overruns mip level {} of {image}",
                    extent, copy.image_offset, copy.image_mip_level
                )));
            }
        }

        let texel = params.format.texel_size();
        let row_length = match copy.buf_row_length {
            0 => extent[0],
            n => n,
        } as u64;
        let image_height = match copy.buf_image_height {
            0 => extent[1],
            n => n,
        } as u64;
        if row_length < extent[0] as u64 || image_height < extent[1] as u64 {
            return Err(GpuError::InvalidArgument(
                "buffer row length or image height is smaller than the copy extent".to_string(),
            ));
        }

        let overflow = || {
            GpuError::InvalidArgument(format!(
                "buffer layout of a copy involving {image} overflows"
            ))
        };
        let row_pitch = row_length.checked_mul(texel).ok_or_else(overflow)?;
        let slice_pitch = image_height.checked_mul(row_pitch).ok_or_else(overflow)?;
        let level_base = params
            .level_offset(copy.image_mip_level)
            .ok_or_else(overflow)?;
        let [ox, oy, oz] = copy.image_offset.map(|v| v as u64);
        let [lw, lh, _] = level.map(|v| v as u64);
        let len = extent[0] as u64 * texel;

        let mut rows = Vec::with_capacity(extent[1] as usize * extent[2] as usize);
        for z in 0..extent[2] as u64 {
            for y in 0..extent[1] as u64 {
                let buffer_offset = z
                    .checked_mul(slice_pitch)
                    .and_then(|o| o.checked_add(y * row_pitch))
                    .and_then(|o| o.checked_add(buf.offset))
                    .ok_or_else(overflow)?;
                rows.push(Row {
                    buffer_offset,
                    image_offset: level_base + (((oz + z) * lh + (oy + y)) * lw + ox) * texel,
                    len,
                });
            }
        }

        if let Some(last) = rows.last() {
            mem.buffer_range(buf.alloc.ptr(last.buffer_offset), last.len)?;
        }
        Ok(rows)
    }

    fn run_groups(
        &self,
        mem: &mut Arena,
        info: &PipelineInfo,
        kernel: &dyn HostKernel,
        slots: &[ResolvedSlot],
        cmd: &Dispatch,
    ) -> Result<()> {
        let num_groups = [cmd.x, cmd.y, cmd.z];
        for z in 0..cmd.z {
            for y in 0..cmd.y {
                for x in 0..cmd.x {
                    let group_id = [x, y, z];
                    let mut inv = KernelInvocation::new(group_id, num_groups, slots, mem);
                    match catch_unwind(AssertUnwindSafe(|| kernel.run(&mut inv))) {
                        Ok(Ok(())) => {}
                        Ok(Err(fault)) => {
                            return Err(GpuError::DeviceLost(format!(
                                "kernel `{}` faulted in group {:?}: {}",
                                info.name, group_id, fault
                            )))
                        }
                        Err(payload) => {
                            return Err(GpuError::DeviceLost(format!(
                                "kernel `{}` panicked in group {:?}: {}",
                                info.name,
                                group_id,
                                panic_text(payload.as_ref())
                            )))
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl<'a> CommandSink for HostSink<'a> {
    fn bind_pipeline(&mut self, pipeline: &Arc<PipelineInfo>) -> Result<()> {
        let kernel = lock(&self.shared.pipelines)
            .get_ref(pipeline.id.index)
            .cloned()
            .ok_or(GpuError::InvalidPipeline(pipeline.id))?;
        self.pipeline = Some((pipeline.clone(), kernel));
        self.bindings = Bindings::default();
        Ok(())
    }

    fn bind_resources(&mut self, bindings: &Bindings) -> Result<()> {
        self.bindings = bindings.clone();
        Ok(())
    }

    fn buffer_barrier(&mut self, cmd: &BufferBarrier) -> Result<()> {
        // Replay is serial; the barrier only has to name a live range.
        lock(&self.shared.memory).buffer_range(cmd.ptr, cmd.size)?;
        Ok(())
    }

    fn memory_barrier(&mut self) -> Result<()> {
        Ok(())
    }

    fn copy_buffer(&mut self, cmd: &CopyBuffer) -> Result<()> {
        lock(&self.shared.memory).copy(cmd.dst, cmd.src, cmd.size)
    }

    fn fill_buffer(&mut self, cmd: &FillBuffer) -> Result<()> {
        lock(&self.shared.memory).fill(cmd.ptr, cmd.size, cmd.data)
    }

    fn dispatch(&mut self, cmd: &Dispatch) -> Result<()> {
        let (info, kernel) = self.pipeline.clone().ok_or_else(|| {
            GpuError::InvalidSequence("dispatch before any pipeline was bound".to_string())
        })?;
        let mut mem = lock(&self.shared.memory);
        let slots = self.resolve_bindings(&mem)?;
        self.run_groups(&mut mem, &info, kernel.as_ref(), &slots, cmd)
    }

    fn transition_image(&mut self, cmd: &TransitionImage) -> Result<()> {
        let mut mem = lock(&self.shared.memory);
        let (_, current) = Self::image_state(&mem, cmd.image)?;
        if cmd.old_layout != ImageLayout::Undefined {
            self.check_layout(cmd.image, current, cmd.old_layout);
        }
        if let Some(state) = mem.block_mut(cmd.image)?.image.as_mut() {
            state.layout = cmd.new_layout;
        }
        Ok(())
    }

    fn copy_buffer_to_image(&mut self, cmd: &CopyBufferImage) -> Result<()> {
        let mut mem = lock(&self.shared.memory);
        let (params, current) = Self::image_state(&mem, cmd.dst)?;
        self.check_layout(cmd.dst, current, cmd.layout);
        let rows = Self::copy_rows(&mem, cmd.dst, &params, cmd.src, &cmd.params)?;

        let mut staged = Vec::with_capacity(rows.iter().map(|r| r.len as usize).sum());
        let src = mem.block(cmd.src.alloc)?;
        for row in &rows {
            let start = row.buffer_offset as usize;
            staged.extend_from_slice(&src.bytes[start..start + row.len as usize]);
        }
        let dst = mem.block_mut(cmd.dst)?;
        let mut cursor = 0;
        for row in &rows {
            let start = row.image_offset as usize;
            let len = row.len as usize;
            dst.bytes[start..start + len].copy_from_slice(&staged[cursor..cursor + len]);
            cursor += len;
        }
        Ok(())
    }

    fn copy_image_to_buffer(&mut self, cmd: &CopyImageBuffer) -> Result<()> {
        let mut mem = lock(&self.shared.memory);
        let (params, current) = Self::image_state(&mem, cmd.src)?;
        self.check_layout(cmd.src, current, cmd.layout);
        let rows = Self::copy_rows(&mem, cmd.src, &params, cmd.dst, &cmd.params)?;

        let mut staged = Vec::with_capacity(rows.iter().map(|r| r.len as usize).sum());
        let src = mem.block(cmd.src)?;
        for row in &rows {
            let start = row.image_offset as usize;
            staged.extend_from_slice(&src.bytes[start..start + row.len as usize]);
        }
        let dst = mem.block_mut(cmd.dst.alloc)?;
        let mut cursor = 0;
        for row in &rows {
            let start = row.buffer_offset as usize;
            let len = row.len as usize;
            dst.bytes[start..start + len].copy_from_slice(&staged[cursor..cursor + len]);
            cursor += len;
        }
        Ok(())
    }
}
