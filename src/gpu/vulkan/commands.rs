use std::sync::Arc;

use ash::vk;

use super::descriptor_sets::DescriptorArena;
use super::memory::{check_storage, Buffer};
use super::pipelines::ComputePipeline;
use crate::gpu::driver::binding::Bindings;
use crate::gpu::driver::command::{
    BufferBarrier, CommandSink, CopyBuffer, Dispatch, FillBuffer,
};
use crate::gpu::driver::pipeline::PipelineInfo;
use crate::gpu::driver::types::{resolve_range, DevicePtr, WHOLE_SIZE};
use crate::gpu::error::{GpuError, Result};
use crate::utils::Registry;

const SHADER_AND_TRANSFER: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::COMPUTE_SHADER.as_raw() | vk::PipelineStageFlags::TRANSFER.as_raw(),
);

/// Whether `[a, a + len)` and `[b, b + len)` intersect.
fn ranges_overlap(a: u64, b: u64, len: u64) -> bool {
    len != 0 && a < b.saturating_add(len) && b < a.saturating_add(len)
}

/// Records replayed commands into one primary command buffer.
pub(crate) struct Encoder<'a> {
    device: &'a ash::Device,
    cmd_buf: vk::CommandBuffer,
    buffers: &'a Registry<Buffer>,
    pipelines: &'a Registry<ComputePipeline>,
    descriptors: &'a mut DescriptorArena,
    pipeline: Option<Arc<PipelineInfo>>,
    bindings: Bindings,
}

impl<'a> Encoder<'a> {
    pub(crate) fn new(
        device: &'a ash::Device,
        cmd_buf: vk::CommandBuffer,
        buffers: &'a Registry<Buffer>,
        pipelines: &'a Registry<ComputePipeline>,
        descriptors: &'a mut DescriptorArena,
    ) -> Self {
        Self {
            device,
            cmd_buf,
            buffers,
            pipelines,
            descriptors,
            pipeline: None,
            bindings: Bindings::default(),
        }
    }

    /// Order this submission after everything already on the queue.
    pub(crate) fn full_barrier(&mut self) {
        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
            .build();
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.cmd_buf,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    /// Resolve `(ptr, size)` to a native buffer and an in-bounds range.
    fn range(&self, ptr: DevicePtr, size: u64) -> Result<(&'a Buffer, u64, u64)> {
        let buf = self
            .buffers
            .get_ref(ptr.alloc.alloc_id)
            .ok_or(GpuError::InvalidHandle(ptr.alloc))?;
        let (offset, len) = resolve_range(ptr.offset, size, buf.size).ok_or_else(|| {
            GpuError::InvalidArgument(format!(
                "range {}+{} is outside {} ({} bytes)",
                ptr.offset,
                if size == WHOLE_SIZE { 0 } else { size },
                ptr.alloc,
                buf.size
            ))
        })?;
        Ok((buf, offset, len))
    }

    fn native_pipeline(&self, info: &PipelineInfo) -> Result<&'a ComputePipeline> {
        self.pipelines
            .get_ref(info.id.index)
            .ok_or(GpuError::InvalidPipeline(info.id))
    }

    /// Write the current bindings into fresh descriptor sets and bind them.
    fn bind_descriptors(&mut self, info: &PipelineInfo, native: &ComputePipeline) -> Result<()> {
        let sets = self.descriptors.allocate(self.device, &native.set_layouts)?;
        if sets.is_empty() {
            if !self.bindings.is_empty() {
                log::debug!(
                    "`{}` declares no slots, ignoring {} bindings",
                    info.name,
                    self.bindings.len()
                );
            }
            return Ok(());
        }

        let mut infos = Vec::with_capacity(info.layout.len());
        for slot in info.layout.iter() {
            let bound = self.bindings.get(slot.set, slot.binding).ok_or_else(|| {
                GpuError::InvalidSequence(format!(
                    "`{}` dispatched without a binding at ({}, {})",
                    info.name, slot.set, slot.binding
                ))
            })?;
            let (buf, offset, len) = self.range(bound.ptr, bound.size)?;
            check_storage(bound.ptr.alloc, buf.usage)?;
            infos.push(
                vk::DescriptorBufferInfo::builder()
                    .buffer(buf.raw)
                    .offset(offset)
                    .range(len)
                    .build(),
            );
        }
        let writes: Vec<vk::WriteDescriptorSet> = info
            .layout
            .iter()
            .zip(infos.iter())
            .map(|(slot, buf_info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(sets[slot.set as usize])
                    .dst_binding(slot.binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(buf_info))
                    .build()
            })
            .collect();

        unsafe {
            self.device.update_descriptor_sets(&writes, &[]);
            self.device.cmd_bind_descriptor_sets(
                self.cmd_buf,
                vk::PipelineBindPoint::COMPUTE,
                native.layout,
                0,
                &sets,
                &[],
            );
        }
        Ok(())
    }
}

impl<'a> CommandSink for Encoder<'a> {
    fn bind_pipeline(&mut self, pipeline: &Arc<PipelineInfo>) -> Result<()> {
        let native = self.native_pipeline(pipeline)?;
        unsafe {
            self.device
                .cmd_bind_pipeline(self.cmd_buf, vk::PipelineBindPoint::COMPUTE, native.raw);
        }
        self.pipeline = Some(pipeline.clone());
        self.bindings = Bindings::default();
        Ok(())
    }

    fn bind_resources(&mut self, bindings: &Bindings) -> Result<()> {
        self.bindings = bindings.clone();
        Ok(())
    }

    fn buffer_barrier(&mut self, cmd: &BufferBarrier) -> Result<()> {
        let (buf, offset, len) = self.range(cmd.ptr, cmd.size)?;
        let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(
                vk::AccessFlags::SHADER_READ
                    | vk::AccessFlags::SHADER_WRITE
                    | vk::AccessFlags::TRANSFER_READ
                    | vk::AccessFlags::TRANSFER_WRITE,
            )
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buf.raw)
            .offset(offset)
            .size(len)
            .build();
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.cmd_buf,
                SHADER_AND_TRANSFER,
                SHADER_AND_TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
        Ok(())
    }

    fn memory_barrier(&mut self) -> Result<()> {
        self.full_barrier();
        Ok(())
    }

    fn copy_buffer(&mut self, cmd: &CopyBuffer) -> Result<()> {
        let (src, src_offset, len) = self.range(cmd.src, cmd.size)?;
        let (dst, dst_offset, _) = self.range(cmd.dst, len)?;
        if len == 0 {
            return Ok(());
        }
        // vkCmdCopyBuffer has no memmove semantics.
        if cmd.src.alloc == cmd.dst.alloc && ranges_overlap(src_offset, dst_offset, len) {
            return Err(GpuError::InvalidArgument(format!(
                "copy of {len} bytes within {} overlaps itself ({src_offset} -> {dst_offset})",
                cmd.src.alloc
            )));
        }
        unsafe {
            self.device.cmd_copy_buffer(
                self.cmd_buf,
                src.raw,
                dst.raw,
                &[vk::BufferCopy {
                    src_offset,
                    dst_offset,
                    size: len,
                }],
            );
        }
        Ok(())
    }

    fn fill_buffer(&mut self, cmd: &FillBuffer) -> Result<()> {
        let (buf, offset, len) = self.range(cmd.ptr, cmd.size)?;
        let size = if cmd.size == WHOLE_SIZE {
            vk::WHOLE_SIZE
        } else {
            len
        };
        if len < 4 {
            return Ok(());
        }
        unsafe {
            self.device
                .cmd_fill_buffer(self.cmd_buf, buf.raw, offset, size, cmd.data);
        }
        Ok(())
    }

    fn dispatch(&mut self, cmd: &Dispatch) -> Result<()> {
        let info = self.pipeline.clone().ok_or_else(|| {
            GpuError::InvalidSequence("dispatch before any pipeline was bound".to_string())
        })?;
        let native = self.native_pipeline(&info)?;
        self.bind_descriptors(&info, native)?;
        unsafe {
            self.device
                .cmd_dispatch(self.cmd_buf, cmd.x, cmd.y, cmd.z);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_detection() {
        assert!(ranges_overlap(0, 8, 16));
        assert!(ranges_overlap(8, 0, 16));
        assert!(ranges_overlap(4, 4, 1));
        assert!(!ranges_overlap(0, 16, 16));
        assert!(!ranges_overlap(32, 0, 16));
        assert!(!ranges_overlap(0, 0, 0));
    }
}
