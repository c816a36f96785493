use std::sync::Arc;

#[cfg(feature = "dashi-serde")]
use serde::Serialize;

use super::binding::{BindingLayout, ResourceBinder};
use super::types::PipelineId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub enum ShaderStage {
    #[default]
    Compute,
    Vertex,
    Fragment,
}

/// Compiled program handed to `Device::create_pipeline`.
#[derive(Debug, Clone, Default)]
pub struct PipelineSourceDesc {
    /// Opaque program bytes (SPIR-V on Vulkan; ignored by the host backend).
    pub code: Vec<u8>,
    pub entry_point: String,
    pub stage: ShaderStage,
    /// Declared slots. Empty means undeclared.
    pub bindings: Vec<BindingLayout>,
}

impl PipelineSourceDesc {
    pub fn compute(code: impl Into<Vec<u8>>, entry_point: &str) -> Self {
        Self {
            code: code.into(),
            entry_point: entry_point.to_string(),
            stage: ShaderStage::Compute,
            bindings: Vec::new(),
        }
    }

    pub fn with_bindings(mut self, bindings: &[BindingLayout]) -> Self {
        self.bindings = bindings.to_vec();
        self
    }
}

/// The immutable part of a pipeline that recorded commands keep alive.
#[derive(Debug)]
#[cfg_attr(feature = "dashi-serde", derive(Serialize))]
pub struct PipelineInfo {
    pub id: PipelineId,
    pub name: String,
    pub entry_point: String,
    pub stage: ShaderStage,
    pub layout: Arc<[BindingLayout]>,
}

/// A compiled compute program plus its declared slot layout.
///
/// Not `Clone`: one value per native program, released with
/// `Device::destroy_pipeline`.
#[derive(Debug)]
pub struct Pipeline {
    info: Arc<PipelineInfo>,
}

impl Pipeline {
    pub(crate) fn new(id: PipelineId, name: &str, desc: &PipelineSourceDesc) -> Self {
        Self {
            info: Arc::new(PipelineInfo {
                id,
                name: name.to_string(),
                entry_point: desc.entry_point.clone(),
                stage: desc.stage,
                layout: desc.bindings.clone().into(),
            }),
        }
    }

    pub fn id(&self) -> PipelineId {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn entry_point(&self) -> &str {
        &self.info.entry_point
    }

    pub fn layout(&self) -> &[BindingLayout] {
        &self.info.layout
    }

    /// A fresh, empty binder scoped to this pipeline's declared slots.
    pub fn resource_binder(&self) -> ResourceBinder {
        ResourceBinder::with_layout(self.info.layout.clone())
    }

    pub(crate) fn info(&self) -> &Arc<PipelineInfo> {
        &self.info
    }
}
