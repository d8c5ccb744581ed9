use crate::framegraph::{
    PassIndex, RenderGraph, ResourceIndex,
    dimensions::ResourceDimensions,
    error::{GraphError, GraphResult},
};

pub(crate) struct Allocation {
    pub dimensions: Vec<ResourceDimensions>,
    pub has_history: Vec<bool>,
}

/// Hands out physical slots to logical resources in pass-stack order.
///
/// Read-modify-write pairs share the slot of their input. Every slot
/// accumulates the queues and usage of all logical resources mapped to it.
pub(crate) struct PhysicalResourceAllocator<'g> {
    graph: &'g mut RenderGraph,
    dimensions: Vec<ResourceDimensions>,
}

impl<'g> PhysicalResourceAllocator<'g> {
    pub fn new(graph: &'g mut RenderGraph) -> Self {
        Self {
            graph,
            dimensions: Vec::new(),
        }
    }

    fn merge_usage(&mut self, resource: ResourceIndex, physical: usize) {
        let resource = &self.graph.resources[resource];
        let dims = &mut self.dimensions[physical];
        dims.queues |= resource.used_queues;
        dims.image_usage |= resource.image_usage();
        dims.buffer_info.usage |= resource.buffer_usage();
    }

    fn assign(&mut self, resource: ResourceIndex) -> GraphResult<usize> {
        if let Some(physical) = self.graph.resources[resource].physical_index {
            self.merge_usage(resource, physical);
            return Ok(physical);
        }

        let dims = self
            .graph
            .resource_dimensions(&self.graph.resources[resource])?;
        let physical = self.dimensions.len();
        log::trace!("Physical resource #{} <- {}", physical, dims.name);
        self.dimensions.push(dims);
        self.graph.resources[resource].physical_index = Some(physical);
        Ok(physical)
    }

    /// Places `output` in the slot already held by `input`.
    fn alias(&mut self, input: ResourceIndex, output: ResourceIndex) -> GraphResult<()> {
        let physical = self.assign(input)?;
        let target = &mut self.graph.resources[output];
        match target.physical_index {
            None => target.physical_index = Some(physical),
            Some(existing) if existing == physical => {}
            Some(existing) => {
                return Err(GraphError::AliasConflict {
                    resource: target.name.clone(),
                    existing,
                    requested: physical,
                });
            }
        }
        self.merge_usage(output, physical);
        Ok(())
    }

    fn assign_pair(
        &mut self,
        inputs: &[Option<ResourceIndex>],
        outputs: &[ResourceIndex],
    ) -> GraphResult<()> {
        for (input, &output) in inputs.iter().zip(outputs) {
            if let Some(input) = *input {
                self.alias(input, output)?;
            }
        }
        Ok(())
    }

    fn assign_pass(&mut self, pass: PassIndex) -> GraphResult<()> {
        let p = &self.graph.passes[pass];
        let buffers = p.generic_buffers.iter().map(|b| b.buffer).collect::<Vec<_>>();
        let textures = p.generic_textures.iter().map(|t| t.texture).collect::<Vec<_>>();
        let scaled = p.color_scale_inputs.iter().flatten().copied().collect::<Vec<_>>();
        let color = (p.color_inputs.clone(), p.color_outputs.clone());
        let storage = (p.storage_inputs.clone(), p.storage_outputs.clone());
        let blit = (p.blit_texture_inputs.clone(), p.blit_texture_outputs.clone());
        let storage_texture = (
            p.storage_texture_inputs.clone(),
            p.storage_texture_outputs.clone(),
        );
        let resolve = p.resolve_outputs.clone();
        let depth = (p.depth_stencil_input, p.depth_stencil_output);
        let attachment_inputs = p.attachment_inputs.clone();
        let proxies = p
            .proxy_inputs
            .iter()
            .chain(&p.proxy_outputs)
            .map(|proxy| proxy.proxy)
            .collect::<Vec<_>>();
        let fake_aliases = p.fake_resource_aliases.clone();

        for resource in buffers.into_iter().chain(textures).chain(scaled) {
            self.assign(resource)?;
        }

        self.assign_pair(&color.0, &color.1)?;
        self.assign_pair(&storage.0, &storage.1)?;
        self.assign_pair(&blit.0, &blit.1)?;
        self.assign_pair(&storage_texture.0, &storage_texture.1)?;

        for resource in color
            .1
            .into_iter()
            .chain(resolve)
            .chain(storage.1)
            .chain(blit.1)
            .chain(storage_texture.1)
        {
            self.assign(resource)?;
        }

        match depth {
            (Some(input), Some(output)) => self.alias(input, output)?,
            (Some(resource), None) | (None, Some(resource)) => {
                self.assign(resource)?;
            }
            (None, None) => {}
        }

        for resource in attachment_inputs.into_iter().chain(proxies) {
            self.assign(resource)?;
        }

        for (from, to) in fake_aliases {
            self.alias(from, to)?;
        }
        Ok(())
    }

    pub fn allocate(mut self, pass_stack: &[PassIndex]) -> GraphResult<Allocation> {
        let _span = tracing::debug_span!("build_physical_resources").entered();

        for &pass in pass_stack {
            self.assign_pass(pass)?;
        }

        let mut has_history = vec![false; self.dimensions.len()];
        for &pass in pass_stack {
            let history_inputs = self.graph.passes[pass].history_inputs.clone();
            for history in history_inputs {
                let resource = &self.graph.resources[history];
                let physical = resource
                    .physical_index
                    .filter(|_| !resource.written_in_passes().is_empty())
                    .ok_or_else(|| GraphError::HistoryNeverWritten(resource.name.clone()))?;
                has_history[physical] = true;
                self.merge_usage(history, physical);
            }
        }

        Ok(Allocation {
            dimensions: self.dimensions,
            has_history,
        })
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use crate::framegraph::{AttachmentInfo, GraphError, RenderGraph, RenderGraphQueueFlags};

    use super::PhysicalResourceAllocator;

    fn stack(graph: &RenderGraph) -> Vec<usize> {
        (0..graph.passes().len()).collect()
    }

    #[test]
    fn rmw_pairs_share_a_slot() {
        let info = AttachmentInfo::default();
        let mut graph = RenderGraph::new();
        graph
            .add_pass("first", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("a", &info, None);
        graph
            .add_pass("second", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("b", &info, Some("a"))
            .add_texture_input("lut", None);
        graph
            .add_pass("lut", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("lut", &info, None);

        let order = vec![2, 0, 1];
        let allocation = PhysicalResourceAllocator::new(&mut graph)
            .allocate(&order)
            .unwrap();

        let a = graph.find_resource("a").unwrap().physical_index;
        let b = graph.find_resource("b").unwrap().physical_index;
        assert_eq!(a, b);
        assert_eq!(allocation.dimensions.len(), 2);
        assert!(allocation.dimensions[a.unwrap()]
            .image_usage
            .contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
    }

    #[test]
    fn conflicting_alias_is_rejected() {
        let info = AttachmentInfo::default();
        let mut graph = RenderGraph::new();
        graph
            .add_pass("x", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("x", &info, None)
            .add_color_output("y", &info, None);
        graph
            .add_pass("z", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("y", &info, Some("x"));

        let order = stack(&graph);
        let result = PhysicalResourceAllocator::new(&mut graph).allocate(&order);
        assert!(matches!(result, Err(GraphError::AliasConflict { .. })));
    }

    #[test]
    fn history_requires_a_writer() {
        let info = AttachmentInfo::default();
        let mut graph = RenderGraph::new();
        graph
            .add_pass("taa", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("out", &info, None)
            .add_history_input("previous");

        let order = stack(&graph);
        let result = PhysicalResourceAllocator::new(&mut graph).allocate(&order);
        assert_eq!(
            result.err(),
            Some(GraphError::HistoryNeverWritten("previous".into()))
        );
    }
}
