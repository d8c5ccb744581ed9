use ash::vk;

use crate::framegraph::{
    PassIndex, RenderGraph, ResourceIndex,
    dimensions::ResourceDimensions,
    error::{GraphError, GraphResult},
    pass::LogicalPass,
    physical::{AttachmentLayouts, Barrier, PassBarriers, PhysicalPass},
};

fn find_or_push(barriers: &mut Vec<Barrier>, index: usize, history: bool) -> &mut Barrier {
    let position = barriers
        .iter()
        .position(|b| b.resource_index == index && b.history == history);
    match position {
        Some(position) => &mut barriers[position],
        None => {
            barriers.push(Barrier::new(index, history));
            let last = barriers.len() - 1;
            &mut barriers[last]
        }
    }
}

fn is_read_only_or_general(layout: vk::ImageLayout) -> bool {
    layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL || layout == vk::ImageLayout::GENERAL
}

/// Read access a write implies when a pass writes a resource before reading it.
fn implied_read_access(write: vk::AccessFlags2) -> vk::AccessFlags2 {
    let mut access = write;
    if write.contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE) {
        access |= vk::AccessFlags2::COLOR_ATTACHMENT_READ;
    }
    if write.contains(vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE) {
        access |= vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ;
    }
    if write.contains(vk::AccessFlags2::SHADER_WRITE) {
        access |= vk::AccessFlags2::SHADER_READ;
    }
    if write.contains(vk::AccessFlags2::SHADER_STORAGE_WRITE) {
        access |= vk::AccessFlags2::SHADER_STORAGE_READ;
    }
    access
}

struct PassBarrierAccumulator<'a> {
    pass: &'a LogicalPass,
    graph: &'a RenderGraph,
    dimensions: &'a [ResourceDimensions],
    barriers: PassBarriers,
}

impl<'a> PassBarrierAccumulator<'a> {
    fn physical(&self, resource: ResourceIndex) -> usize {
        self.graph.resources[resource]
            .physical_index
            .unwrap_or_default()
    }

    fn mismatch(&self, index: usize, existing: vk::ImageLayout, requested: vk::ImageLayout) -> GraphError {
        GraphError::LayoutMismatch {
            pass: self.pass.name.clone(),
            resource: self.dimensions[index].name.clone(),
            existing,
            requested,
        }
    }

    /// Sets the layout of a barrier that must not have been claimed with another layout.
    fn claim_layout(
        &self,
        barrier: &mut Barrier,
        layout: vk::ImageLayout,
    ) -> GraphResult<()> {
        if barrier.layout != vk::ImageLayout::UNDEFINED && barrier.layout != layout {
            return Err(self.mismatch(barrier.resource_index, barrier.layout, layout));
        }
        barrier.layout = layout;
        Ok(())
    }

    fn invalidate(
        &mut self,
        resource: ResourceIndex,
        history: bool,
        layout: vk::ImageLayout,
        access: vk::AccessFlags2,
        stages: vk::PipelineStageFlags2,
    ) -> GraphResult<()> {
        let index = self.physical(resource);
        let mut barrier = *find_or_push(&mut self.barriers.invalidate, index, history);
        self.claim_layout(&mut barrier, layout)?;
        barrier.access |= access;
        barrier.stages |= stages;
        *find_or_push(&mut self.barriers.invalidate, index, history) = barrier;
        Ok(())
    }

    fn flush(
        &mut self,
        resource: ResourceIndex,
        layout: vk::ImageLayout,
        access: vk::AccessFlags2,
        stages: vk::PipelineStageFlags2,
    ) -> GraphResult<()> {
        let index = self.physical(resource);
        let mut barrier = *find_or_push(&mut self.barriers.flush, index, false);
        self.claim_layout(&mut barrier, layout)?;
        barrier.access |= access;
        barrier.stages |= stages;
        *find_or_push(&mut self.barriers.flush, index, false) = barrier;
        Ok(())
    }

    fn invalidate_layout(&self, index: usize) -> vk::ImageLayout {
        self.barriers
            .invalidate
            .iter()
            .find(|b| b.resource_index == index && !b.history)
            .map_or(vk::ImageLayout::UNDEFINED, |b| b.layout)
    }

    fn flush_layout(&self, index: usize) -> vk::ImageLayout {
        self.barriers
            .flush
            .iter()
            .find(|b| b.resource_index == index)
            .map_or(vk::ImageLayout::UNDEFINED, |b| b.layout)
    }

    /// Attachments also read through a shader path must stay in `GENERAL`.
    fn attachment_layout(&self, index: usize, optimal: vk::ImageLayout) -> vk::ImageLayout {
        if is_read_only_or_general(self.invalidate_layout(index))
            || is_read_only_or_general(self.flush_layout(index))
        {
            vk::ImageLayout::GENERAL
        } else {
            optimal
        }
    }

    fn build(mut self) -> GraphResult<PassBarriers> {
        let pass = self.pass;
        let shader_stages = pass.shader_stages();

        if pass.queue.is_compute() && pass.has_attachments() {
            return Err(GraphError::AttachmentOnComputeQueue(pass.name.clone()));
        }

        for buffer in &pass.generic_buffers {
            self.invalidate(buffer.buffer, false, buffer.layout, buffer.access, buffer.stages)?;
        }

        for texture in &pass.generic_textures {
            self.invalidate(
                texture.texture,
                false,
                texture.layout,
                texture.access,
                texture.stages,
            )?;
        }

        for &history in &pass.history_inputs {
            self.invalidate(
                history,
                true,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
                shader_stages,
            )?;
        }

        for &input in &pass.attachment_inputs {
            let mut access = vk::AccessFlags2::INPUT_ATTACHMENT_READ;
            let mut stages = vk::PipelineStageFlags2::FRAGMENT_SHADER;
            if self.dimensions[self.physical(input)].is_depth_stencil() {
                access |= vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ;
                stages |= vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS;
            }
            self.invalidate(
                input,
                false,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                access,
                stages,
            )?;
        }

        for &input in pass.storage_inputs.iter().flatten() {
            self.invalidate(
                input,
                false,
                vk::ImageLayout::GENERAL,
                vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                shader_stages,
            )?;
        }

        for &input in pass.storage_texture_inputs.iter().flatten() {
            self.invalidate(
                input,
                false,
                vk::ImageLayout::GENERAL,
                vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                shader_stages,
            )?;
        }

        for &input in pass.blit_texture_inputs.iter().flatten() {
            self.invalidate(
                input,
                false,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::PipelineStageFlags2::TRANSFER,
            )?;
        }

        for &input in pass.color_inputs.iter().flatten() {
            let index = self.physical(input);
            let existing = self.invalidate_layout(index);
            let layout = if is_read_only_or_general(existing) {
                // Color input also read as an attachment input.
                let barrier = find_or_push(&mut self.barriers.invalidate, index, false);
                barrier.layout = vk::ImageLayout::GENERAL;
                vk::ImageLayout::GENERAL
            } else {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            };
            self.invalidate(
                input,
                false,
                layout,
                vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            )?;
        }

        for &input in pass.color_scale_inputs.iter().flatten() {
            self.invalidate(
                input,
                false,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
            )?;
        }

        for &output in &pass.color_outputs {
            let index = self.physical(output);
            if self.dimensions[index].generates_mips() {
                self.flush(
                    output,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::AccessFlags2::TRANSFER_WRITE,
                    vk::PipelineStageFlags2::TRANSFER,
                )?;
            } else {
                let layout =
                    self.attachment_layout(index, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
                self.flush(
                    output,
                    layout,
                    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                )?;
            }
        }

        for &output in &pass.resolve_outputs {
            self.flush(
                output,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            )?;
        }

        for &output in &pass.blit_texture_outputs {
            self.flush(
                output,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::PipelineStageFlags2::TRANSFER,
            )?;
        }

        for &output in pass.storage_outputs.iter().chain(&pass.storage_texture_outputs) {
            self.flush(
                output,
                vk::ImageLayout::GENERAL,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
                shader_stages,
            )?;
        }

        let depth_stages = vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS;
        match (pass.depth_stencil_input, pass.depth_stencil_output) {
            (Some(input), Some(output)) => {
                let index = self.physical(input);
                let layout = if is_read_only_or_general(self.invalidate_layout(index)) {
                    find_or_push(&mut self.barriers.invalidate, index, false).layout =
                        vk::ImageLayout::GENERAL;
                    vk::ImageLayout::GENERAL
                } else {
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                };
                self.invalidate(
                    input,
                    false,
                    layout,
                    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                    depth_stages,
                )?;
                self.flush(
                    output,
                    layout,
                    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                    vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                )?;
            }
            (Some(input), None) => {
                let index = self.physical(input);
                if self.invalidate_layout(index) == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL {
                    // Read-only depth can be sampled as an input attachment as is.
                    find_or_push(&mut self.barriers.invalidate, index, false).layout =
                        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL;
                }
                self.invalidate(
                    input,
                    false,
                    vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
                    depth_stages,
                )?;
            }
            (None, Some(output)) => {
                let index = self.physical(output);
                let layout = self
                    .attachment_layout(index, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
                self.flush(
                    output,
                    layout,
                    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                    vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                )?;
            }
            (None, None) => {}
        }

        for proxy in &pass.proxy_inputs {
            self.invalidate(proxy.proxy, false, proxy.layout, vk::AccessFlags2::NONE, proxy.stages)?;
        }
        for proxy in &pass.proxy_outputs {
            self.flush(proxy.proxy, proxy.layout, vk::AccessFlags2::NONE, proxy.stages)?;
        }

        Ok(self.barriers)
    }
}

#[derive(Clone, Copy, Debug)]
struct ResourceState {
    initial_layout: vk::ImageLayout,
    final_layout: vk::ImageLayout,
    invalidated_types: vk::AccessFlags2,
    flushed_types: vk::AccessFlags2,
    invalidated_stages: vk::PipelineStageFlags2,
    flushed_stages: vk::PipelineStageFlags2,
    flushed: bool,
}

impl Default for ResourceState {
    fn default() -> Self {
        Self {
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::UNDEFINED,
            invalidated_types: vk::AccessFlags2::NONE,
            flushed_types: vk::AccessFlags2::NONE,
            invalidated_stages: vk::PipelineStageFlags2::NONE,
            flushed_stages: vk::PipelineStageFlags2::NONE,
            flushed: false,
        }
    }
}

/// Derives synchronization, first per logical pass and then consolidated per
/// physical pass.
pub(crate) struct BarrierBuilder<'g> {
    graph: &'g RenderGraph,
    dimensions: &'g [ResourceDimensions],
}

impl<'g> BarrierBuilder<'g> {
    pub fn new(graph: &'g RenderGraph, dimensions: &'g [ResourceDimensions]) -> Self {
        Self { graph, dimensions }
    }

    /// Barriers indexed by logical pass. Passes outside the stack get none.
    pub fn build_pass_barriers(&self, pass_stack: &[PassIndex]) -> GraphResult<Vec<PassBarriers>> {
        let _span = tracing::debug_span!("build_barriers").entered();
        let mut barriers = vec![PassBarriers::default(); self.graph.passes.len()];
        for &pass in pass_stack {
            barriers[pass] = PassBarrierAccumulator {
                pass: &self.graph.passes[pass],
                graph: self.graph,
                dimensions: self.dimensions,
                barriers: PassBarriers::default(),
            }
            .build()?;
        }
        Ok(barriers)
    }

    pub fn build_physical_barriers(
        &self,
        physical_passes: &mut [PhysicalPass],
        pass_barriers: &[PassBarriers],
        swapchain_physical_index: Option<usize>,
    ) {
        let _span = tracing::debug_span!("build_physical_barriers").entered();
        for physical_pass in physical_passes.iter_mut() {
            self.build_physical_pass(physical_pass, pass_barriers, swapchain_physical_index);
        }
    }

    fn build_physical_pass(
        &self,
        physical_pass: &mut PhysicalPass,
        pass_barriers: &[PassBarriers],
        swapchain_physical_index: Option<usize>,
    ) {
        let mut states = vec![ResourceState::default(); self.dimensions.len()];
        let mut touched = Vec::new();
        let mut history = Vec::<Barrier>::new();
        let mut discards = Vec::new();

        for &pass in &physical_pass.passes {
            let barriers = &pass_barriers[pass];

            for invalidate in &barriers.invalidate {
                if invalidate.history {
                    let barrier = find_or_push(&mut history, invalidate.resource_index, true);
                    barrier.layout = invalidate.layout;
                    barrier.access |= invalidate.access;
                    barrier.stages |= invalidate.stages;
                    continue;
                }

                let index = invalidate.resource_index;
                if !touched.contains(&index) {
                    touched.push(index);
                }
                let state = &mut states[index];
                // Only the first use in a physical pass is synchronized externally.
                if state.initial_layout == vk::ImageLayout::UNDEFINED {
                    state.initial_layout = invalidate.layout;
                    state.invalidated_types |= invalidate.access;
                    state.invalidated_stages |= invalidate.stages;
                }
                state.final_layout = invalidate.layout;
                state.flushed_types = vk::AccessFlags2::NONE;
                state.flushed_stages = vk::PipelineStageFlags2::NONE;
                state.flushed = false;
            }

            for flush in &barriers.flush {
                let index = flush.resource_index;
                if !touched.contains(&index) {
                    touched.push(index);
                }
                let state = &mut states[index];
                state.flushed_types |= flush.access;
                state.flushed_stages |= flush.stages;
                state.final_layout = flush.layout;
                state.flushed = true;

                if state.initial_layout != vk::ImageLayout::UNDEFINED {
                    continue;
                }

                // Written before it is read: the previous contents are irrelevant.
                if flush.layout == vk::ImageLayout::TRANSFER_SRC_OPTIMAL {
                    // Mip generation starts from a rendered level 0.
                    state.initial_layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
                    state.invalidated_stages |= vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;
                    state.invalidated_types |= vk::AccessFlags2::COLOR_ATTACHMENT_READ
                        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE;
                } else {
                    state.initial_layout = flush.layout;
                    state.invalidated_types |= implied_read_access(flush.access);
                    state.invalidated_stages |= flush.stages;
                    if flush.stages.contains(vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS) {
                        state.invalidated_stages |= vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS;
                    }
                }
                discards.push(index);
            }
        }

        let mut invalidate = Vec::new();
        let mut flush = Vec::new();
        let mut layouts = Vec::new();
        for &index in &touched {
            let state = &states[index];
            layouts.push(AttachmentLayouts {
                physical_resource: index,
                initial: state.initial_layout,
                r#final: state.final_layout,
            });

            if self.dimensions[index].is_transient() || Some(index) == swapchain_physical_index {
                continue;
            }

            invalidate.push(Barrier {
                resource_index: index,
                layout: state.initial_layout,
                access: state.invalidated_types,
                stages: state.invalidated_stages,
                history: false,
            });

            if state.flushed {
                flush.push(Barrier {
                    resource_index: index,
                    layout: state.final_layout,
                    access: state.flushed_types,
                    stages: state.flushed_stages,
                    history: false,
                });
            } else {
                // Read only; the flush carries the stages for later writers.
                flush.push(Barrier {
                    resource_index: index,
                    layout: state.final_layout,
                    access: vk::AccessFlags2::NONE,
                    stages: state.invalidated_stages,
                    history: false,
                });
            }
        }

        for barrier in history {
            invalidate.push(barrier);
            flush.push(Barrier {
                access: vk::AccessFlags2::NONE,
                ..barrier
            });
        }

        physical_pass.invalidate = invalidate;
        physical_pass.flush = flush;
        physical_pass.discards = discards;
        physical_pass.layouts = layouts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_imply_reads() {
        assert_eq!(
            implied_read_access(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE),
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE | vk::AccessFlags2::COLOR_ATTACHMENT_READ
        );
        assert_eq!(
            implied_read_access(vk::AccessFlags2::TRANSFER_WRITE),
            vk::AccessFlags2::TRANSFER_WRITE
        );
    }

    #[test]
    fn barriers_are_keyed_by_index_and_history() {
        let mut barriers = Vec::new();
        find_or_push(&mut barriers, 2, false).access |= vk::AccessFlags2::SHADER_READ;
        find_or_push(&mut barriers, 2, true);
        find_or_push(&mut barriers, 2, false).access |= vk::AccessFlags2::SHADER_WRITE;
        assert_eq!(barriers.len(), 2);
        assert_eq!(
            barriers[0].access,
            vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE
        );
    }
}
