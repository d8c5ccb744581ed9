use crate::framegraph::{
    PassIndex, RenderGraph, ResourceIndex, dimensions::ResourceDimensions, pass::LogicalPass,
    physical::PhysicalPass,
};

fn contains<'a>(
    haystack: impl IntoIterator<Item = &'a ResourceIndex>,
    needle: ResourceIndex,
) -> bool {
    haystack.into_iter().any(|&r| r == needle)
}

/// Groups adjacent graphics passes into physical passes.
pub(crate) struct PassMerger<'g> {
    graph: &'g RenderGraph,
    dimensions: &'g [ResourceDimensions],
}

impl<'g> PassMerger<'g> {
    pub fn new(graph: &'g RenderGraph, dimensions: &'g [ResourceDimensions]) -> Self {
        Self { graph, dimensions }
    }

    fn physical(&self, resource: ResourceIndex) -> Option<usize> {
        self.graph.resources[resource].physical_index
    }

    fn same_physical(&self, a: ResourceIndex, b: ResourceIndex) -> bool {
        a == b || (self.physical(a).is_some() && self.physical(a) == self.physical(b))
    }

    fn produced_by<'a>(
        &self,
        outputs: impl IntoIterator<Item = &'a ResourceIndex>,
        input: ResourceIndex,
    ) -> bool {
        outputs.into_iter().any(|&output| self.same_physical(output, input))
    }

    fn generates_mips(&self, pass: &LogicalPass) -> bool {
        pass.color_outputs.iter().any(|&output| {
            self.physical(output)
                .is_some_and(|physical| self.dimensions[physical].generates_mips())
        })
    }

    /// Whether `next` may run as a later subpass of the render pass holding `prev`.
    pub fn should_merge(&self, prev: &LogicalPass, next: &LogicalPass) -> bool {
        if prev.queue.is_compute() || next.queue.is_compute() || prev.queue != next.queue {
            return false;
        }
        if !self.graph.config.merge_subpasses {
            return false;
        }
        if self.generates_mips(prev) {
            return false;
        }

        // Sampling something the previous pass produced needs a full barrier.
        let prev_images = prev
            .color_outputs
            .iter()
            .chain(&prev.resolve_outputs)
            .chain(&prev.storage_texture_outputs)
            .chain(&prev.blit_texture_outputs)
            .chain(&prev.depth_stencil_output);
        let prev_images = prev_images.copied().collect::<Vec<_>>();
        if next
            .generic_textures
            .iter()
            .any(|t| self.produced_by(&prev_images, t.texture))
        {
            return false;
        }

        if next
            .generic_buffers
            .iter()
            .map(|b| b.buffer)
            .chain(next.storage_inputs.iter().flatten().copied())
            .any(|buffer| self.produced_by(&prev.storage_outputs, buffer))
        {
            return false;
        }

        if next
            .blit_texture_inputs
            .iter()
            .flatten()
            .any(|&input| self.produced_by(&prev.blit_texture_outputs, input))
        {
            return false;
        }

        if next
            .storage_texture_inputs
            .iter()
            .flatten()
            .any(|&input| self.produced_by(&prev.storage_texture_outputs, input))
        {
            return false;
        }

        let prev_sampled_sources = prev
            .storage_texture_outputs
            .iter()
            .chain(&prev.blit_texture_outputs)
            .chain(&prev.color_outputs)
            .chain(&prev.resolve_outputs);
        let prev_sampled_sources = prev_sampled_sources.copied().collect::<Vec<_>>();
        if next
            .color_scale_inputs
            .iter()
            .flatten()
            .any(|&input| self.produced_by(&prev_sampled_sources, input))
        {
            return false;
        }

        if next
            .proxy_inputs
            .iter()
            .any(|input| prev.proxy_outputs.iter().any(|o| o.proxy == input.proxy))
        {
            return false;
        }

        let different = |a: Option<ResourceIndex>, b: Option<ResourceIndex>| match (a, b) {
            (Some(a), Some(b)) => !self.same_physical(a, b),
            _ => false,
        };
        if different(next.depth_stencil_input, prev.depth_stencil_input)
            || different(next.depth_stencil_output, prev.depth_stencil_input)
            || different(next.depth_stencil_input, prev.depth_stencil_output)
            || different(next.depth_stencil_output, prev.depth_stencil_output)
        {
            return false;
        }

        // Color inputs fed by storage or blit writes are not attachment data.
        let prev_non_attachment = prev
            .storage_texture_outputs
            .iter()
            .chain(&prev.blit_texture_outputs)
            .copied()
            .collect::<Vec<_>>();
        if next
            .color_inputs
            .iter()
            .flatten()
            .any(|&input| self.produced_by(&prev_non_attachment, input))
        {
            return false;
        }

        let prev_attachments = prev
            .color_outputs
            .iter()
            .chain(&prev.resolve_outputs)
            .copied()
            .collect::<Vec<_>>();
        if next
            .color_inputs
            .iter()
            .flatten()
            .any(|&input| self.produced_by(&prev_attachments, input))
        {
            return true;
        }

        if let Some(next_depth) = next.depth_stencil_input {
            if prev
                .depth_stencil_input
                .iter()
                .chain(&prev.depth_stencil_output)
                .any(|&depth| self.same_physical(depth, next_depth))
            {
                return true;
            }
        }

        let prev_readable = prev
            .color_outputs
            .iter()
            .chain(&prev.resolve_outputs)
            .chain(&prev.depth_stencil_output)
            .copied()
            .collect::<Vec<_>>();
        next.attachment_inputs
            .iter()
            .any(|&input| self.produced_by(&prev_readable, input))
    }

    /// Splits the pass stack into physical passes, greedily extending each
    /// span while the next pass merges with every pass already in it.
    pub fn merge(&self, pass_stack: &[PassIndex]) -> Vec<PhysicalPass> {
        let _span = tracing::debug_span!("build_physical_passes").entered();
        let passes = &self.graph.passes;

        let mut physical_passes = Vec::new();
        let mut index = 0;
        while index < pass_stack.len() {
            let mut merge_end = index + 1;
            while merge_end < pass_stack.len() {
                let next = &passes[pass_stack[merge_end]];
                let merge = pass_stack[index..merge_end]
                    .iter()
                    .all(|&prev| self.should_merge(&passes[prev], next));
                if !merge {
                    break;
                }
                merge_end += 1;
            }

            let members = pass_stack[index..merge_end].to_vec();
            if members.len() > 1 {
                log::debug!(
                    "Merged passes [{}] into physical pass {}",
                    members
                        .iter()
                        .map(|&p| passes[p].name.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                    physical_passes.len()
                );
            }
            physical_passes.push(PhysicalPass {
                passes: members,
                ..Default::default()
            });
            index = merge_end;
        }
        physical_passes
    }
}
