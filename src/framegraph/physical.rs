use std::fmt;

use ash::vk;

use crate::framegraph::{PassIndex, render_pass::RenderPassInfo};

/// A synchronization requirement on one physical resource.
///
/// Invalidate barriers make prior writes visible before a use, flush barriers
/// describe the writes a pass leaves behind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Barrier {
    pub resource_index: usize,
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags2,
    pub stages: vk::PipelineStageFlags2,
    pub history: bool,
}

impl Barrier {
    pub fn new(resource_index: usize, history: bool) -> Self {
        Self {
            resource_index,
            layout: vk::ImageLayout::UNDEFINED,
            access: vk::AccessFlags2::NONE,
            stages: vk::PipelineStageFlags2::NONE,
            history,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassBarriers {
    pub invalidate: Vec<Barrier>,
    pub flush: Vec<Barrier>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorClearRequest {
    pub pass: PassIndex,
    /// Index into the pass's color outputs.
    pub color_index: usize,
    /// Index into the physical pass's color attachments.
    pub attachment: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepthClearRequest {
    pub pass: PassIndex,
}

/// A color output seeded by resampling an input of different dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScaledClearRequest {
    pub target: u32,
    pub physical_resource: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MipmapRequest {
    pub physical_resource: usize,
    pub stages: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

/// Layouts an attachment enters and leaves a physical pass in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachmentLayouts {
    pub physical_resource: usize,
    pub initial: vk::ImageLayout,
    pub r#final: vk::ImageLayout,
}

/// One or more logical passes recorded as a single render pass.
#[derive(Clone, Debug, Default)]
pub struct PhysicalPass {
    pub passes: Vec<PassIndex>,
    pub discards: Vec<usize>,
    pub invalidate: Vec<Barrier>,
    pub flush: Vec<Barrier>,
    pub render_pass_info: RenderPassInfo,
    pub physical_color_attachments: Vec<usize>,
    pub physical_depth_stencil_attachment: Option<usize>,
    pub color_clear_requests: Vec<ColorClearRequest>,
    pub depth_clear_request: Option<DepthClearRequest>,
    /// One list per subpass.
    pub scaled_clear_requests: Vec<Vec<ScaledClearRequest>>,
    pub mipmap_requests: Vec<MipmapRequest>,
    pub layouts: Vec<AttachmentLayouts>,
}

impl PhysicalPass {
    pub fn attachment_layouts(&self, physical_resource: usize) -> Option<&AttachmentLayouts> {
        self.layouts
            .iter()
            .find(|l| l.physical_resource == physical_resource)
    }
}

impl fmt::Display for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{}{} layout={} access={} stages={}",
            self.resource_index,
            if self.history { " (history)" } else { "" },
            crate::framegraph::layouts::layout_str(self.layout),
            crate::framegraph::layouts::access_str(self.access),
            crate::framegraph::layouts::stage_str(self.stages),
        )
    }
}
