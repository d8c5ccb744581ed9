use ash::vk;
use smallvec::SmallVec;

use crate::framegraph::{
    RenderGraph,
    dimensions::ResourceDimensions,
    error::{GraphError, GraphResult},
    flags::RenderPassOpFlags,
    physical::{ColorClearRequest, DepthClearRequest, MipmapRequest, PhysicalPass, ScaledClearRequest},
};

/// Attachment index used by subpasses to refer to the depth/stencil attachment.
pub const DEPTH_STENCIL_ATTACHMENT: u32 = u32::MAX;

/// Color attachments one physical pass can hold; load, clear and store
/// masks keep one bit per attachment.
pub const MAX_COLOR_ATTACHMENTS: usize = u32::BITS as usize;

fn attachment_bit(attachment: u32) -> u32 {
    1u32.checked_shl(attachment).unwrap_or(0)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DepthStencilMode {
    #[default]
    None,
    ReadOnly,
    ReadWrite,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubpassInfo {
    pub color_attachments: SmallVec<[u32; 8]>,
    pub input_attachments: SmallVec<[u32; 8]>,
    pub resolve_attachments: SmallVec<[u32; 8]>,
    pub depth_stencil_mode: DepthStencilMode,
}

/// Attachments and subpasses of one physical pass.
///
/// Color attachment `i` is `PhysicalPass::physical_color_attachments[i]`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderPassInfo {
    pub clear_attachments: u32,
    pub load_attachments: u32,
    pub store_attachments: u32,
    pub op_flags: RenderPassOpFlags,
    pub subpasses: Vec<SubpassInfo>,
}

impl RenderPassInfo {
    pub fn load_op(&self, attachment: u32) -> vk::AttachmentLoadOp {
        let bit = attachment_bit(attachment);
        if self.clear_attachments & bit != 0 {
            vk::AttachmentLoadOp::CLEAR
        } else if self.load_attachments & bit != 0 {
            vk::AttachmentLoadOp::LOAD
        } else {
            vk::AttachmentLoadOp::DONT_CARE
        }
    }

    pub fn store_op(&self, attachment: u32) -> vk::AttachmentStoreOp {
        if self.store_attachments & attachment_bit(attachment) != 0 {
            vk::AttachmentStoreOp::STORE
        } else {
            vk::AttachmentStoreOp::DONT_CARE
        }
    }

    pub fn depth_stencil_load_op(&self) -> vk::AttachmentLoadOp {
        if self.op_flags.contains(RenderPassOpFlags::CLEAR_DEPTH_STENCIL) {
            vk::AttachmentLoadOp::CLEAR
        } else if self.op_flags.contains(RenderPassOpFlags::LOAD_DEPTH_STENCIL) {
            vk::AttachmentLoadOp::LOAD
        } else {
            vk::AttachmentLoadOp::DONT_CARE
        }
    }

    pub fn depth_stencil_store_op(&self) -> vk::AttachmentStoreOp {
        if self.op_flags.contains(RenderPassOpFlags::STORE_DEPTH_STENCIL) {
            vk::AttachmentStoreOp::STORE
        } else {
            vk::AttachmentStoreOp::DONT_CARE
        }
    }
}

#[derive(Default)]
struct Attachments {
    colors: Vec<usize>,
    depth_stencil: Option<usize>,
}

impl Attachments {
    /// Returns the attachment index and whether this is its first use, or
    /// `None` once every mask bit is taken.
    fn add_color(&mut self, physical: usize) -> Option<(u32, bool)> {
        match self.colors.iter().position(|&c| c == physical) {
            Some(index) => Some((index as u32, false)),
            None if self.colors.len() >= MAX_COLOR_ATTACHMENTS => None,
            None => {
                self.colors.push(physical);
                Some((self.colors.len() as u32 - 1, true))
            }
        }
    }

    fn add_depth_stencil(&mut self, physical: usize) -> bool {
        match self.depth_stencil {
            None => {
                self.depth_stencil = Some(physical);
                true
            }
            Some(existing) => {
                if existing != physical {
                    log::error!(
                        "Physical pass uses depth attachments #{} and #{}, keeping the first",
                        existing,
                        physical
                    );
                }
                false
            }
        }
    }

    fn add_input(&mut self, physical: usize) -> Option<(u32, bool)> {
        if self.depth_stencil == Some(physical) {
            Some((DEPTH_STENCIL_ATTACHMENT, false))
        } else {
            self.add_color(physical)
        }
    }
}

pub(crate) struct RenderPassInfoBuilder<'g> {
    graph: &'g RenderGraph,
    dimensions: &'g [ResourceDimensions],
    swapchain_physical_index: Option<usize>,
}

impl<'g> RenderPassInfoBuilder<'g> {
    pub fn new(
        graph: &'g RenderGraph,
        dimensions: &'g [ResourceDimensions],
        swapchain_physical_index: Option<usize>,
    ) -> Self {
        Self {
            graph,
            dimensions,
            swapchain_physical_index,
        }
    }

    fn physical(&self, resource: usize) -> usize {
        self.graph.resources[resource]
            .physical_index
            .unwrap_or_default()
    }

    /// Whether any physical pass after `physical_pass` reads the physical
    /// resource, under any of the names aliased onto it.
    fn read_later(&self, physical: usize, physical_pass: usize) -> bool {
        self.graph
            .resources
            .iter()
            .filter(|r| r.physical_index == Some(physical))
            .flat_map(|r| r.read_in_passes())
            .any(|&pass| {
                self.graph.passes[pass]
                    .physical_pass
                    .is_some_and(|p| p > physical_pass)
            })
    }

    fn discards_store(&self, physical: usize) -> bool {
        !self.graph.config.transient_store
            && self.dimensions[physical].is_transient()
            && Some(physical) != self.swapchain_physical_index
    }

    pub fn build(&self, physical_passes: &mut [PhysicalPass]) -> GraphResult<()> {
        let _span = tracing::debug_span!("build_render_pass_info").entered();
        for (index, physical_pass) in physical_passes.iter_mut().enumerate() {
            self.build_pass(index, physical_pass)?;
        }
        Ok(())
    }

    fn build_pass(&self, physical_pass_index: usize, physical_pass: &mut PhysicalPass) -> GraphResult<()> {
        let too_many = || GraphError::TooManyAttachments {
            physical_pass: physical_pass_index,
            max: MAX_COLOR_ATTACHMENTS,
        };
        let passes = &self.graph.passes;
        let mut info = RenderPassInfo {
            subpasses: vec![SubpassInfo::default(); physical_pass.passes.len()],
            ..Default::default()
        };
        let mut attachments = Attachments::default();
        let mut scaled_clear_requests = vec![Vec::new(); physical_pass.passes.len()];
        let mut color_clear_requests = Vec::new();
        let mut depth_clear_request = None;
        let mut mipmap_requests = Vec::new();

        for (subpass_index, &pass_index) in physical_pass.passes.iter().enumerate() {
            let pass = &passes[pass_index];
            let subpass = &mut info.subpasses[subpass_index];

            for (i, &output) in pass.color_outputs.iter().enumerate() {
                let physical = self.physical(output);
                let (attachment, first_use) = attachments.add_color(physical).ok_or_else(too_many)?;
                subpass.color_attachments.push(attachment);

                if self.dimensions[physical].generates_mips()
                    && !mipmap_requests
                        .iter()
                        .any(|r: &MipmapRequest| r.physical_resource == physical)
                {
                    mipmap_requests.push(MipmapRequest {
                        physical_resource: physical,
                        stages: vk::PipelineStageFlags2::TRANSFER,
                        access: vk::AccessFlags2::TRANSFER_WRITE,
                        layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    });
                }

                if !first_use {
                    continue;
                }
                let color_input = pass.color_inputs.get(i).copied().flatten();
                let scaled_input = pass.color_scale_inputs.get(i).copied().flatten();
                if color_input.is_some() {
                    info.load_attachments |= 1 << attachment;
                } else if let Some(scaled) = scaled_input {
                    scaled_clear_requests[subpass_index].push(ScaledClearRequest {
                        target: i as u32,
                        physical_resource: self.physical(scaled),
                    });
                } else if pass.clear_color_value(i).is_some() {
                    info.clear_attachments |= 1 << attachment;
                    color_clear_requests.push(ColorClearRequest {
                        pass: pass_index,
                        color_index: i,
                        attachment,
                    });
                }
            }

            for &output in &pass.resolve_outputs {
                let (attachment, _) = attachments
                    .add_color(self.physical(output))
                    .ok_or_else(too_many)?;
                subpass.resolve_attachments.push(attachment);
            }

            match (pass.depth_stencil_input, pass.depth_stencil_output) {
                (Some(_), Some(output)) => {
                    if attachments.add_depth_stencil(self.physical(output)) {
                        info.op_flags |= RenderPassOpFlags::LOAD_DEPTH_STENCIL;
                    }
                    info.op_flags |= RenderPassOpFlags::STORE_DEPTH_STENCIL;
                    subpass.depth_stencil_mode = DepthStencilMode::ReadWrite;
                }
                (None, Some(output)) => {
                    if attachments.add_depth_stencil(self.physical(output))
                        && pass.clear_depth_stencil_value().is_some()
                    {
                        info.op_flags |= RenderPassOpFlags::CLEAR_DEPTH_STENCIL;
                        depth_clear_request = Some(DepthClearRequest { pass: pass_index });
                    }
                    info.op_flags |= RenderPassOpFlags::STORE_DEPTH_STENCIL;
                    subpass.depth_stencil_mode = DepthStencilMode::ReadWrite;
                }
                (Some(input), None) => {
                    let physical = self.physical(input);
                    if attachments.add_depth_stencil(physical) {
                        info.op_flags |= RenderPassOpFlags::LOAD_DEPTH_STENCIL
                            | RenderPassOpFlags::DEPTH_STENCIL_READ_ONLY;
                        if self.read_later(physical, physical_pass_index) {
                            info.op_flags |= RenderPassOpFlags::STORE_DEPTH_STENCIL;
                        }
                    }
                    subpass.depth_stencil_mode = DepthStencilMode::ReadOnly;
                }
                (None, None) => {}
            }
        }

        // Input attachments may refer to depth declared by a later subpass.
        for (subpass_index, &pass_index) in physical_pass.passes.iter().enumerate() {
            let pass = &passes[pass_index];
            for &input in &pass.attachment_inputs {
                let (attachment, first_use) = attachments
                    .add_input(self.physical(input))
                    .ok_or_else(too_many)?;
                if first_use {
                    info.load_attachments |= 1 << attachment;
                }
                info.subpasses[subpass_index]
                    .input_attachments
                    .push(attachment);
            }
        }

        for (attachment, &physical) in attachments.colors.iter().enumerate() {
            if !self.discards_store(physical) {
                info.store_attachments |= 1 << attachment;
            }
        }
        if let Some(depth) = attachments.depth_stencil {
            if self.discards_store(depth) {
                info.op_flags.remove(RenderPassOpFlags::STORE_DEPTH_STENCIL);
            }
            if info
                .subpasses
                .iter()
                .any(|s| s.depth_stencil_mode == DepthStencilMode::ReadWrite)
            {
                info.op_flags.remove(RenderPassOpFlags::DEPTH_STENCIL_READ_ONLY);
            }
        }

        physical_pass.render_pass_info = info;
        physical_pass.physical_color_attachments = attachments.colors;
        physical_pass.physical_depth_stencil_attachment = attachments.depth_stencil;
        physical_pass.color_clear_requests = color_clear_requests;
        physical_pass.depth_clear_request = depth_clear_request;
        physical_pass.scaled_clear_requests = scaled_clear_requests;
        physical_pass.mipmap_requests = mipmap_requests;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_ops_follow_masks() {
        let info = RenderPassInfo {
            clear_attachments: 0b01,
            load_attachments: 0b10,
            store_attachments: 0b01,
            ..Default::default()
        };
        assert_eq!(info.load_op(0), vk::AttachmentLoadOp::CLEAR);
        assert_eq!(info.load_op(1), vk::AttachmentLoadOp::LOAD);
        assert_eq!(info.load_op(2), vk::AttachmentLoadOp::DONT_CARE);
        assert_eq!(info.store_op(0), vk::AttachmentStoreOp::STORE);
        assert_eq!(info.store_op(1), vk::AttachmentStoreOp::DONT_CARE);
    }

    #[test]
    fn input_attachment_on_depth_uses_depth_slot() {
        let mut attachments = Attachments::default();
        assert!(attachments.add_depth_stencil(3));
        assert_eq!(attachments.add_input(3), Some((DEPTH_STENCIL_ATTACHMENT, false)));
        assert_eq!(attachments.add_input(1), Some((0, true)));
        assert_eq!(attachments.add_input(1), Some((0, false)));
    }

    #[test]
    fn color_attachments_stop_at_the_mask_width() {
        let mut attachments = Attachments::default();
        for physical in 0..MAX_COLOR_ATTACHMENTS {
            assert_eq!(attachments.add_color(physical), Some((physical as u32, true)));
        }
        assert_eq!(attachments.add_color(MAX_COLOR_ATTACHMENTS), None);
        // Attachments already present are still found.
        assert_eq!(attachments.add_color(5), Some((5, false)));
    }

    #[test]
    fn ops_past_the_mask_width_are_dont_care() {
        let info = RenderPassInfo {
            clear_attachments: u32::MAX,
            store_attachments: u32::MAX,
            ..Default::default()
        };
        assert_eq!(info.load_op(40), vk::AttachmentLoadOp::DONT_CARE);
        assert_eq!(info.store_op(DEPTH_STENCIL_ATTACHMENT), vk::AttachmentStoreOp::DONT_CARE);
    }
}
