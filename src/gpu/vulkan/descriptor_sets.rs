use ash::vk;

use super::pipelines::set_count;
use crate::gpu::driver::command::Command;
use crate::gpu::error::Result;

/// Descriptor pool sized for every dispatch of one submission.
///
/// Slot bindings are emulated by writing fresh descriptor sets at each
/// dispatch; the whole pool is dropped once the submission's fence signals.
#[derive(Debug)]
pub(crate) struct DescriptorArena {
    pool: vk::DescriptorPool,
}

/// `(sets, storage descriptors)` needed to replay `commands`.
pub(crate) fn descriptor_demand(commands: &[Command]) -> (u32, u32) {
    let mut current = None;
    let mut sets = 0u32;
    let mut descriptors = 0u32;
    for cmd in commands {
        match cmd {
            Command::BindPipeline(info) => current = Some(info.clone()),
            Command::Dispatch(_) => {
                if let Some(info) = &current {
                    sets = sets.saturating_add(set_count(&info.layout));
                    descriptors = descriptors.saturating_add(info.layout.len() as u32);
                }
            }
            _ => {}
        }
    }
    (sets, descriptors)
}

impl DescriptorArena {
    pub(crate) fn new(device: &ash::Device, commands: &[Command]) -> Result<Self> {
        let (sets, descriptors) = descriptor_demand(commands);
        if sets == 0 {
            return Ok(Self {
                pool: vk::DescriptorPool::null(),
            });
        }
        let sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: descriptors.max(1),
        }];
        let pool = unsafe {
            device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::builder()
                    .max_sets(sets)
                    .pool_sizes(&sizes)
                    .build(),
                None,
            )?
        };
        Ok(Self { pool })
    }

    pub(crate) fn allocate(
        &mut self,
        device: &ash::Device,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        if layouts.is_empty() {
            return Ok(Vec::new());
        }
        let sets = unsafe {
            device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::builder()
                    .descriptor_pool(self.pool)
                    .set_layouts(layouts)
                    .build(),
            )?
        };
        Ok(sets)
    }

    pub(crate) fn destroy(&mut self, device: &ash::Device) {
        if self.pool != vk::DescriptorPool::null() {
            unsafe { device.destroy_descriptor_pool(self.pool, None) };
            self.pool = vk::DescriptorPool::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::driver::binding::BindingLayout;
    use crate::gpu::driver::command::Dispatch;
    use crate::gpu::driver::pipeline::{Pipeline, PipelineSourceDesc};
    use crate::gpu::driver::types::{DeviceId, PipelineId};

    #[test]
    fn demand_follows_bound_pipeline() {
        let desc = PipelineSourceDesc::compute(Vec::new(), "main")
            .with_bindings(&[BindingLayout::buffer(0, 0), BindingLayout::rw_buffer(1, 0)]);
        let pipeline = Pipeline::new(
            PipelineId {
                device: DeviceId(1),
                index: 1,
            },
            "p",
            &desc,
        );
        let dispatch = Command::Dispatch(Dispatch { x: 1, y: 1, z: 1 });
        let commands = vec![
            dispatch.clone(),
            Command::BindPipeline(pipeline.info().clone()),
            dispatch.clone(),
            dispatch,
        ];
        assert_eq!(descriptor_demand(&commands), (4, 4));
    }
}
