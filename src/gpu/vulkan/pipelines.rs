use std::ffi::CString;

use ash::vk;

use crate::gpu::driver::binding::{BindingKind, BindingLayout};
use crate::gpu::driver::pipeline::{PipelineSourceDesc, ShaderStage};
use crate::gpu::error::{GpuError, Result};

pub(crate) const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Native objects behind one compute [`crate::Pipeline`].
#[derive(Debug)]
pub(crate) struct ComputePipeline {
    pub(crate) raw: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
    /// One layout per set index up to the highest declared set.
    pub(crate) set_layouts: Vec<vk::DescriptorSetLayout>,
    pub(crate) module: vk::ShaderModule,
}

impl ComputePipeline {
    pub(crate) fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.raw, None);
            device.destroy_pipeline_layout(self.layout, None);
            for layout in self.set_layouts.drain(..) {
                device.destroy_descriptor_set_layout(layout, None);
            }
            device.destroy_shader_module(self.module, None);
        }
    }
}

/// Reinterpret `code` as SPIR-V words, rejecting anything that cannot be a module.
pub(crate) fn spirv_words(code: &[u8]) -> std::result::Result<Vec<u32>, String> {
    if code.is_empty() {
        return Err("empty shader code".to_string());
    }
    if code.len() % 4 != 0 {
        return Err(format!("{} bytes is not a whole number of words", code.len()));
    }
    let words: Vec<u32> = code
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect();
    if words[0] != SPIRV_MAGIC {
        return Err(format!("bad SPIR-V magic {:#010x}", words[0]));
    }
    Ok(words)
}

/// Number of descriptor sets a layout needs, counting gaps.
pub(crate) fn set_count(layout: &[BindingLayout]) -> u32 {
    layout.iter().map(|b| b.set + 1).max().unwrap_or(0)
}

fn compile_error(name: &str, message: impl Into<String>) -> GpuError {
    GpuError::CompilationError {
        pipeline: name.to_string(),
        message: message.into(),
    }
}

fn create_set_layouts(
    device: &ash::Device,
    layout: &[BindingLayout],
) -> Result<Vec<vk::DescriptorSetLayout>> {
    let mut out = Vec::new();
    for set in 0..set_count(layout) {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = layout
            .iter()
            .filter(|b| b.set == set)
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build()
            })
            .collect();
        let created = unsafe {
            device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::builder()
                    .bindings(&bindings)
                    .build(),
                None,
            )
        };
        match created {
            Ok(l) => out.push(l),
            Err(res) => {
                for l in out {
                    unsafe { device.destroy_descriptor_set_layout(l, None) };
                }
                return Err(res.into());
            }
        }
    }
    Ok(out)
}

pub(crate) fn make_compute_pipeline(
    device: &ash::Device,
    desc: &PipelineSourceDesc,
    name: &str,
) -> Result<ComputePipeline> {
    if desc.stage != ShaderStage::Compute {
        return Err(GpuError::Unsupported("graphics pipelines"));
    }
    if desc.bindings.iter().any(|b| b.kind == BindingKind::Image) {
        return Err(GpuError::Unsupported("image bindings"));
    }
    let words = spirv_words(&desc.code).map_err(|m| compile_error(name, m))?;
    let entry = CString::new(desc.entry_point.as_str())
        .map_err(|_| compile_error(name, "entry point contains a NUL byte"))?;

    let module = unsafe {
        device.create_shader_module(
            &vk::ShaderModuleCreateInfo::builder().code(&words).build(),
            None,
        )
    }
    .map_err(|res| compile_error(name, res.to_string()))?;

    let set_layouts = match create_set_layouts(device, &desc.bindings) {
        Ok(layouts) => layouts,
        Err(err) => {
            unsafe { device.destroy_shader_module(module, None) };
            return Err(err);
        }
    };
    let mut pipeline = ComputePipeline {
        raw: vk::Pipeline::null(),
        layout: vk::PipelineLayout::null(),
        set_layouts,
        module,
    };

    let layout = unsafe {
        device.create_pipeline_layout(
            &vk::PipelineLayoutCreateInfo::builder()
                .set_layouts(&pipeline.set_layouts)
                .build(),
            None,
        )
    };
    pipeline.layout = match layout {
        Ok(layout) => layout,
        Err(res) => {
            pipeline.destroy(device);
            return Err(res.into());
        }
    };

    let stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(&entry)
        .build();
    let info = vk::ComputePipelineCreateInfo::builder()
        .layout(pipeline.layout)
        .stage(stage)
        .build();
    let created =
        unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &[info], None) };
    match created {
        Ok(raw) => {
            pipeline.raw = raw[0];
            Ok(pipeline)
        }
        Err((_, res)) => {
            pipeline.destroy(device);
            Err(compile_error(name, res.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_checks() {
        assert!(spirv_words(&[]).is_err());
        assert!(spirv_words(&[3, 2, 0x23, 7, 0]).is_err());
        assert!(spirv_words(&[0, 0, 0, 0]).is_err());
        assert_eq!(
            spirv_words(&SPIRV_MAGIC.to_le_bytes()).unwrap(),
            vec![SPIRV_MAGIC]
        );
    }

    #[test]
    fn gaps_count_as_sets() {
        assert_eq!(set_count(&[]), 0);
        assert_eq!(
            set_count(&[BindingLayout::buffer(0, 0), BindingLayout::rw_buffer(2, 1)]),
            3
        );
    }
}
